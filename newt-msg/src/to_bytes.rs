use std_alloc::vec::Vec;
use tinyvec::ArrayVec;

use crate::*;

/// Trait allowing fallible conversion into bytes
pub trait TryIntoBytes {
  /// Error yielded when the data cannot be expressed on the wire
  type Error;

  /// Try to convert into a collection of bytes
  ///
  /// ```
  /// use newt_msg::{Code, Id, Message, Token, TryIntoBytes, Type};
  ///
  /// let msg = Message::new(Type::Con, Code::GET, Id(1), Token::default());
  /// let bytes: Vec<u8> = msg.try_into_bytes().unwrap();
  /// assert_eq!(bytes.len(), 4);
  /// ```
  fn try_into_bytes(self) -> Result<Vec<u8>, Self::Error>;
}

/// Errors encounterable serializing to bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageToBytesError {
  /// An option value was longer than the 2-byte extended length
  /// encoding can express
  OptionValueTooLong {
    /// The option the value belongs to
    number: OptNumber,
    /// The unencodable length
    len: usize,
  },
}

pub(crate) fn opt_len_or_delta(val: u16) -> (u8, Option<ArrayVec<[u8; 2]>>) {
  match val {
    | n if n >= 269 => {
      let mut bytes = ArrayVec::new();
      bytes.extend((n - 269).to_be_bytes());
      (14, Some(bytes))
    },
    | n if n >= 13 => {
      let mut bytes = ArrayVec::new();
      bytes.push((n as u8) - 13);
      (13, Some(bytes))
    },
    | n => (n as u8, None),
  }
}

fn extend_opt(bytes: &mut Vec<u8>, delta: u16, value: &[u8]) {
  let (del, del_bytes) = opt_len_or_delta(delta);
  let (len, len_bytes) = opt_len_or_delta(value.len() as u16);

  bytes.push((del << 4) | len);

  if let Some(bs) = del_bytes {
    bytes.extend(bs);
  }

  if let Some(bs) = len_bytes {
    bytes.extend(bs);
  }

  bytes.extend_from_slice(value);
}

impl TryIntoBytes for Message {
  type Error = MessageToBytesError;

  fn try_into_bytes(self) -> Result<Vec<u8>, Self::Error> {
    let mut bytes = Vec::with_capacity(4 + self.token.0.len() + self.payload.0.len() + 16);

    let byte1: u8 = Byte1 { tkl: self.token.0.len() as u8,
                            ver: self.ver,
                            ty: self.ty }.into();

    bytes.push(byte1);
    bytes.push(self.code.into());
    bytes.extend(self.id.0.to_be_bytes());
    bytes.extend(self.token.0);

    // map iteration is ascending by number; repeats of one number
    // are emitted consecutively with delta 0
    let mut prev = 0u16;
    for (number, values) in &self.opts {
      for (ix, value) in values.iter().enumerate() {
        if value.0.len() > u16::MAX as usize {
          return Err(MessageToBytesError::OptionValueTooLong { number: *number,
                                                               len: value.0.len() });
        }

        let delta = if ix == 0 { number.0 - prev } else { 0 };
        extend_opt(&mut bytes, delta, &value.0);
      }
      prev = number.0;
    }

    if !self.payload.0.is_empty() {
      bytes.push(0b11111111);
      bytes.extend(self.payload.0);
    }

    Ok(bytes)
  }
}

impl From<Byte1> for u8 {
  fn from(b: Byte1) -> u8 {
    let ver = b.ver.0 << 6;
    let ty = u8::from(b.ty) << 4;
    let tkl = b.tkl;

    ver | ty | tkl
  }
}
