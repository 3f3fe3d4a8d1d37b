/// Three items of information may need to be transferred in a
/// Block (Block1 or Block2) option:
/// * the size of the block ([`Block::size`])
/// * whether more blocks are following ([`Block::more`])
/// * the relative number of the block ([`Block::num`]) within a sequence of blocks with the given size.
///
/// Wire layout (uint): `NUM << 4 | M << 3 | SZX` where the block size
/// is `2^(SZX + 4)`, i.e. 16 through 1024 bytes. `SZX = 7` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(u32);

impl Block {
  #[allow(missing_docs)]
  pub fn new(size: u16, num: u32, more: bool) -> Self {
    let szx = match size.clamp(16, 1024) {
      | n if n >= 1024 => 6,
      | n if n >= 512 => 5,
      | n if n >= 256 => 4,
      | n if n >= 128 => 3,
      | n if n >= 64 => 2,
      | n if n >= 32 => 1,
      | _ => 0,
    };

    Self((num << 4) | (u32::from(more) << 3) | szx)
  }

  /// The size exponent. Sizes 16..=1024 map to 0..=6; 7 is reserved.
  pub fn szx(&self) -> u32 {
    self.0 & 0b111
  }

  /// `SZX = 7` is reserved and must not appear in a block transfer
  pub fn is_valid(&self) -> bool {
    self.szx() != 7
  }

  #[allow(missing_docs)]
  pub fn size(&self) -> u16 {
    2u16.pow(self.szx().min(6) + 4)
  }

  #[allow(missing_docs)]
  pub fn more(&self) -> bool {
    (self.0 & 0b1000) >> 3 == 1
  }

  #[allow(missing_docs)]
  pub fn num(&self) -> u32 {
    self.0 >> 4
  }
}

impl From<Block> for u32 {
  fn from(b: Block) -> Self {
    b.0
  }
}

impl From<u32> for Block {
  fn from(n: u32) -> Self {
    Block(n)
  }
}
