use core::str::Utf8Error;

use std_alloc::collections::BTreeMap;
use std_alloc::string::String;
use std_alloc::vec::Vec;

use crate::cursor::Cursor;
use crate::msg::Message;

/// Known, well-defined CoAP option numbers and their typed accessors.
pub mod known;
pub use known::*;

/// Error types produced while parsing options.
pub mod parse_error;
pub use parse_error::*;

/// The "Option Number" identifies which option is being set
/// (e.g. Content-Format has a Number of 12).
///
/// On the wire, numbers are not stored directly; each option stores the
/// _delta_ between its number and the previous option's number. Storing
/// options in an ordered map keyed by `OptNumber` keeps the delta
/// encoding a pure serialization concern.
///
/// # Related
/// - [RFC7252#section-3.1 Option Format](https://datatracker.ietf.org/doc/html/rfc7252#section-3.1)
/// - [RFC7252#section-5.4.6 Option Numbers](https://datatracker.ietf.org/doc/html/rfc7252#section-5.4.6)
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct OptNumber(pub u16);

/// Whether or not this option may be ignored by a server
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptionMustBeProcessed {
  /// This option must be processed,
  /// and a message that ignores it
  /// will be rejected.
  ///
  /// Corresponds to the option being "critical"
  /// in strict CoAP terms
  Yes,
  /// This option does not _need_ to
  /// be processed,
  /// and a message that ignores it
  /// will be processed anyway.
  ///
  /// Corresponds to the option being "elective"
  /// in strict CoAP terms
  No,
}

/// Whether a proxy may blindly forward an option it does not support
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WhenOptionUnsupportedByProxy {
  /// This option must be processed & understood by proxies
  /// and may not be forwarded blindly to their destination.
  ///
  /// Corresponds to the option being "UnSafe" to forward
  /// in strict CoAP terms
  Error,
  /// This option may not be processed & understood by proxies
  /// and may be forwarded blindly to their destination.
  ///
  /// Corresponds to the option being "SafeToForward"
  /// in strict CoAP terms
  Forward,
}

/// Whether a safe-to-forward option participates in a proxy's cache key
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WhenOptionChanges {
  /// Different values for this option produce different cached
  /// responses.
  ///
  /// Corresponds to the option being not "NoCacheKey"
  /// in strict CoAP terms
  ResponseChanges,
  /// Different values for this option should yield the same cached
  /// response.
  ///
  /// Corresponds to the option being "NoCacheKey"
  /// in strict CoAP terms
  ResponseDoesNotChange,
}

impl OptNumber {
  /// Whether or not this option may be ignored by a server
  pub fn must_be_processed(&self) -> OptionMustBeProcessed {
    match self.0 & 0b1 {
      | 1 => OptionMustBeProcessed::Yes,
      | _ => OptionMustBeProcessed::No,
    }
  }

  /// Whether or not this option may be forwarded blindly by
  /// a proxy that does not support processing it
  pub fn when_unsupported_by_proxy(&self) -> WhenOptionUnsupportedByProxy {
    match (self.0 & 0b10) >> 1 {
      | 1 => WhenOptionUnsupportedByProxy::Error,
      | _ => WhenOptionUnsupportedByProxy::Forward,
    }
  }

  /// Whether or not different values for this option should
  /// yield proxies' cached response
  pub fn when_option_changes(&self) -> WhenOptionChanges {
    match (self.0 & 0b11100) >> 2 {
      | 0b111 => WhenOptionChanges::ResponseDoesNotChange,
      | _ => WhenOptionChanges::ResponseChanges,
    }
  }
}

/// The value of an option, as raw bytes.
///
/// Interpretation (uint, string, opaque, empty) depends on the
/// [`OptNumber`] it is stored against; see [`known::format`].
#[derive(Default, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct OptValue(pub Vec<u8>);

impl OptValue {
  /// Canonical uint encoding: unsigned big-endian with no leading
  /// zero bytes; the value 0 is encoded as the empty string.
  ///
  /// ```
  /// use newt_msg::OptValue;
  ///
  /// assert_eq!(OptValue::uint(0).0, Vec::<u8>::new());
  /// assert_eq!(OptValue::uint(24).0, vec![24]);
  /// assert_eq!(OptValue::uint(0x0101).0, vec![1, 1]);
  /// ```
  pub fn uint(n: u64) -> Self {
    let bytes = n.to_be_bytes();
    let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(8);
    Self(bytes[first_nonzero..].to_vec())
  }

  /// Decode a uint value, canonicalising any leading zero bytes away.
  pub fn as_uint(&self) -> u64 {
    let bytes = &self.0[self.0.len().saturating_sub(8)..];
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
  }

  /// Interpret the value as UTF-8
  pub fn as_str(&self) -> Result<&str, Utf8Error> {
    core::str::from_utf8(&self.0)
  }
}

/// The ordered collection of options in a message.
///
/// `BTreeMap` iteration order is ascending by key, which is exactly the
/// order RFC7252 requires options to be serialized in.
pub type OptionMap = BTreeMap<OptNumber, Vec<OptValue>>;

pub(crate) fn parse_opt_len_or_delta<A: AsRef<[u8]>>(head: u8,
                                                     bytes: &mut Cursor<A>,
                                                     reserved_err: OptParseError)
                                                     -> Result<u16, OptParseError> {
  match head {
    | 13 => {
      let n = bytes.next().ok_or_else(OptParseError::eof)?;
      Ok((n as u16) + 13)
    },
    | 14 => match bytes.take_exact(2) {
      | Some(&[a, b]) => Ok(u16::from_be_bytes([a, b]) + 269),
      | _ => Err(OptParseError::eof()),
    },
    | 15 => Err(reserved_err),
    | _ => Ok(head as u16),
  }
}

/// Parse the options section of a message.
///
/// Returns the map plus whether the `0xFF` payload marker was seen
/// (in which case the rest of the cursor is payload).
pub(crate) fn try_consume_opts<A: AsRef<[u8]>>(bytes: &mut Cursor<A>)
                                               -> Result<(OptionMap, bool), OptParseError> {
  let mut opts = OptionMap::new();
  let mut number: u32 = 0;

  loop {
    let byte1 = match bytes.next() {
      | None => return Ok((opts, false)),
      | Some(0b11111111) => return Ok((opts, true)),
      | Some(b) => b,
    };

    let delta = parse_opt_len_or_delta(byte1 >> 4,
                                       bytes,
                                       OptParseError::OptionDeltaReservedValue(15))?;
    let len = parse_opt_len_or_delta(byte1 & 0b00001111,
                                     bytes,
                                     OptParseError::ValueLengthReservedValue(15))?
              as usize;

    number += delta as u32;
    if number > u16::MAX as u32 {
      return Err(OptParseError::OptionNumberTooBig(number));
    }

    let number = OptNumber(number as u16);

    if !known::len_bounds(number).contains(&len) {
      return Err(OptParseError::ValueLengthOutOfBounds { number, len });
    }

    let value = bytes.take_exact(len).ok_or_else(OptParseError::eof)?;

    opts.entry(number)
        .or_insert_with(Vec::new)
        .push(OptValue(value.to_vec()));
  }
}

/// Typed access to the options of a [`Message`].
///
/// Setters for non-repeatable options replace any prior value;
/// `add_*` setters append.
pub trait MessageOptions {
  /// All values stored against an option number
  fn get(&self, n: OptNumber) -> Option<&Vec<OptValue>>;

  /// The first value stored against an option number
  fn get_first(&self, n: OptNumber) -> Option<&OptValue>;

  /// Replace the values stored against an option number with one value
  fn set(&mut self, n: OptNumber, v: OptValue);

  /// Append a value to an option number (for repeatable options)
  fn add(&mut self, n: OptNumber, v: OptValue);

  /// Forget an option entirely
  fn remove(&mut self, n: OptNumber) -> Option<Vec<OptValue>>;

  /// Read an option as a canonical uint
  fn get_uint(&self, n: OptNumber) -> Option<u64> {
    self.get_first(n).map(OptValue::as_uint)
  }

  /// Write an option as a canonical uint
  fn set_uint(&mut self, n: OptNumber, v: u64) {
    self.set(n, OptValue::uint(v));
  }

  /// Read an option as UTF-8 (None when absent or not UTF-8)
  fn get_str(&self, n: OptNumber) -> Option<&str> {
    self.get_first(n).and_then(|v| v.as_str().ok())
  }

  /// The Observe option as a raw 24-bit counter
  fn observe(&self) -> Option<u32> {
    self.get_uint(no_repeat::OBSERVE).map(|n| (n as u32) & 0xFF_FF_FF)
  }

  /// The Observe option interpreted as a register/deregister action
  fn observe_action(&self) -> Option<Action> {
    self.get_uint(no_repeat::OBSERVE)
        .and_then(|n| Action::from_byte(n as u8))
  }

  /// Set the Observe option to Register (0) or Deregister (1)
  fn set_observe(&mut self, a: Action) {
    self.set_uint(no_repeat::OBSERVE, u8::from(a) as u64);
  }

  /// Set the Observe option to a notification sequence number
  /// (masked to 24 bits)
  fn set_observe_counter(&mut self, v: u32) {
    self.set_uint(no_repeat::OBSERVE, (v & 0xFF_FF_FF) as u64);
  }

  /// The Block1 option (request payload fragmentation)
  fn block1(&self) -> Option<Block> {
    self.get_uint(no_repeat::BLOCK1).map(|n| Block::from(n as u32))
  }

  /// The Block2 option (response payload fragmentation)
  fn block2(&self) -> Option<Block> {
    self.get_uint(no_repeat::BLOCK2).map(|n| Block::from(n as u32))
  }

  /// Set the Block1 option
  fn set_block1(&mut self, b: Block) {
    self.set_uint(no_repeat::BLOCK1, u32::from(b) as u64);
  }

  /// Set the Block2 option
  fn set_block2(&mut self, b: Block) {
    self.set_uint(no_repeat::BLOCK2, u32::from(b) as u64);
  }

  /// The Content-Format option
  fn content_format(&self) -> Option<ContentFormat> {
    self.get_uint(no_repeat::CONTENT_FORMAT)
        .map(|n| ContentFormat::from(n as u16))
  }

  /// Set the Content-Format option
  fn set_content_format(&mut self, f: ContentFormat) {
    self.set_uint(no_repeat::CONTENT_FORMAT, u16::from(&f) as u64);
  }

  /// The Accept option
  fn accept(&self) -> Option<ContentFormat> {
    self.get_uint(no_repeat::ACCEPT)
        .map(|n| ContentFormat::from(n as u16))
  }

  /// Set the Accept option
  fn set_accept(&mut self, f: ContentFormat) {
    self.set_uint(no_repeat::ACCEPT, u16::from(&f) as u64);
  }

  /// Max-Age in seconds (server-declared representation freshness)
  fn max_age(&self) -> Option<u32> {
    self.get_uint(no_repeat::MAX_AGE).map(|n| n as u32)
  }

  /// Set Max-Age in seconds
  fn set_max_age(&mut self, seconds: u32) {
    self.set_uint(no_repeat::MAX_AGE, seconds as u64);
  }

  /// The Size1 option (request body size hint)
  fn size1(&self) -> Option<u32> {
    self.get_uint(no_repeat::SIZE1).map(|n| n as u32)
  }

  /// Set the Size1 option
  fn set_size1(&mut self, n: u32) {
    self.set_uint(no_repeat::SIZE1, n as u64);
  }

  /// The Size2 option (response body size hint)
  fn size2(&self) -> Option<u32> {
    self.get_uint(no_repeat::SIZE2).map(|n| n as u32)
  }

  /// Set the Size2 option
  fn set_size2(&mut self, n: u32) {
    self.set_uint(no_repeat::SIZE2, n as u64);
  }

  /// The Uri-Host option
  fn host(&self) -> Option<&str> {
    self.get_str(no_repeat::HOST)
  }

  /// Set the Uri-Host option
  fn set_host(&mut self, host: &str) {
    self.set(no_repeat::HOST, OptValue(host.as_bytes().to_vec()));
  }

  /// The Uri-Port option
  fn port(&self) -> Option<u16> {
    self.get_uint(no_repeat::PORT).map(|n| n as u16)
  }

  /// Set the Uri-Port option
  fn set_port(&mut self, port: u16) {
    self.set_uint(no_repeat::PORT, port as u64);
  }

  /// The Uri-Path segments, in order
  fn path_segments(&self) -> Result<Vec<&str>, Utf8Error>;

  /// The Uri-Path segments joined with `/`
  fn path(&self) -> Result<String, Utf8Error> {
    self.path_segments().map(|segs| segs.join("/"))
  }

  /// Replace the Uri-Path with segments split on `/`
  /// (empty segments are skipped)
  fn set_path(&mut self, path: &str) {
    self.remove(repeat::PATH);
    path.split('/').filter(|seg| !seg.is_empty()).for_each(|seg| {
                                                   self.add(repeat::PATH,
                                                            OptValue(seg.as_bytes().to_vec()));
                                                 });
  }

  /// The Uri-Query values, in order
  fn queries(&self) -> Result<Vec<&str>, Utf8Error>;

  /// Append a Uri-Query value
  fn add_query(&mut self, query: &str) {
    self.add(repeat::QUERY, OptValue(query.as_bytes().to_vec()));
  }

  /// The first critical (odd-numbered) option that is not in
  /// the registry of options we process.
  ///
  /// Requests carrying one must be answered 4.02 Bad Option;
  /// responses carrying one must be rejected.
  fn unknown_critical(&self) -> Option<OptNumber>;
}

impl MessageOptions for Message {
  fn get(&self, n: OptNumber) -> Option<&Vec<OptValue>> {
    self.opts.get(&n)
  }

  fn get_first(&self, n: OptNumber) -> Option<&OptValue> {
    self.opts.get(&n).and_then(|vs| vs.first())
  }

  fn set(&mut self, n: OptNumber, v: OptValue) {
    self.opts.insert(n, [v].into());
  }

  fn add(&mut self, n: OptNumber, v: OptValue) {
    self.opts.entry(n).or_insert_with(Vec::new).push(v);
  }

  fn remove(&mut self, n: OptNumber) -> Option<Vec<OptValue>> {
    self.opts.remove(&n)
  }

  fn path_segments(&self) -> Result<Vec<&str>, Utf8Error> {
    self.opts
        .get(&repeat::PATH)
        .map(|vs| vs.iter().map(OptValue::as_str).collect())
        .unwrap_or_else(|| Ok(Vec::new()))
  }

  fn queries(&self) -> Result<Vec<&str>, Utf8Error> {
    self.opts
        .get(&repeat::QUERY)
        .map(|vs| vs.iter().map(OptValue::as_str).collect())
        .unwrap_or_else(|| Ok(Vec::new()))
  }

  fn unknown_critical(&self) -> Option<OptNumber> {
    self.opts
        .keys()
        .copied()
        .find(|n| {
          n.must_be_processed() == OptionMustBeProcessed::Yes && !known::is_recognized(*n)
        })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Code, Id, Token, Type};

  fn msg() -> Message {
    Message::new(Type::Con, Code::GET, Id(1), Token::default())
  }

  #[test]
  fn parse_opt() {
    let mut bytes = Cursor::new([0b00010001, 0b00000001]);
    let (opts, marker) = try_consume_opts(&mut bytes).unwrap();
    assert!(!marker);
    assert_eq!(opts.get(&OptNumber(1)).unwrap(), &vec![OptValue(vec![1])]);

    // extended 1-byte delta: 13 + 1 = option 14
    let mut bytes = Cursor::new([0b11010001, 0b00000001, 0b00000001]);
    let (opts, _) = try_consume_opts(&mut bytes).unwrap();
    assert_eq!(opts.get(&OptNumber(14)).unwrap(), &vec![OptValue(vec![1])]);

    // extended 2-byte delta: 269 + 1 = option 270
    let mut bytes = Cursor::new([0b11100001, 0b00000000, 0b00000001, 0b00000001]);
    let (opts, _) = try_consume_opts(&mut bytes).unwrap();
    assert_eq!(opts.get(&OptNumber(270)).unwrap(), &vec![OptValue(vec![1])]);
  }

  #[test]
  fn parse_opt_stops_at_payload_marker() {
    let mut bytes = Cursor::new([0b00010001, 0b00000001, 0b11111111, 0b10101010]);
    let (opts, marker) = try_consume_opts(&mut bytes).unwrap();
    assert!(marker);
    assert_eq!(opts.len(), 1);
    assert_eq!(bytes.take_until_end(), &[0b10101010]);
  }

  #[test]
  fn parse_opt_rejects_reserved_nibbles() {
    // delta nibble 15 in a byte that is not 0xFF
    let mut bytes = Cursor::new([0b11110001, 0b00000001]);
    assert_eq!(try_consume_opts(&mut bytes),
               Err(OptParseError::OptionDeltaReservedValue(15)));

    let mut bytes = Cursor::new([0b00011111, 0b00000001]);
    assert_eq!(try_consume_opts(&mut bytes),
               Err(OptParseError::ValueLengthReservedValue(15)));
  }

  #[test]
  fn parse_opt_rejects_number_overflow() {
    // 65534 + extended 2-byte delta (269 + 0xFFFD) overflows u16
    let mut head = vec![0b11100000u8];
    head.extend((65534u16 - 269).to_be_bytes());
    head.extend([0b11100000u8]);
    head.extend((65534u16 - 269).to_be_bytes());
    let mut bytes = Cursor::new(head);
    assert!(matches!(try_consume_opts(&mut bytes),
                     Err(OptParseError::OptionNumberTooBig(_))));
  }

  #[test]
  fn parse_opt_rejects_length_out_of_bounds() {
    // Uri-Port (7) with a 3-byte value
    let mut bytes = Cursor::new([0b01110011, 1, 2, 3]);
    assert_eq!(try_consume_opts(&mut bytes),
               Err(OptParseError::ValueLengthOutOfBounds { number: OptNumber(7),
                                                           len: 3 }));
  }

  #[test]
  fn uint_canonical() {
    assert_eq!(OptValue::uint(0).0, Vec::<u8>::new());
    assert_eq!(OptValue::uint(0).as_uint(), 0);
    assert_eq!(OptValue::uint(1025).as_uint(), 1025);

    // non-canonical encodings canonicalise on read
    assert_eq!(OptValue(vec![0, 0, 4]).as_uint(), 4);
    assert_eq!(OptValue::uint(OptValue(vec![0, 0, 4]).as_uint()).0, vec![4]);
  }

  #[test]
  fn typed_accessors() {
    let mut m = msg();

    m.set_path("a/b//c");
    assert_eq!(m.path_segments().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(m.path().unwrap(), "a/b/c");

    m.add_query("who=world");
    m.add_query("lang=en");
    assert_eq!(m.queries().unwrap(), vec!["who=world", "lang=en"]);

    m.set_observe(Action::Register);
    assert_eq!(m.observe_action(), Some(Action::Register));
    assert_eq!(m.observe(), Some(0));

    m.set_observe_counter(0x0100_0001);
    assert_eq!(m.observe(), Some(1));

    m.set_block2(Block::new(512, 3, true));
    let b = m.block2().unwrap();
    assert_eq!((b.size(), b.num(), b.more()), (512, 3, true));

    m.set_content_format(ContentFormat::Json);
    assert_eq!(m.content_format(), Some(ContentFormat::Json));

    m.set_max_age(60);
    assert_eq!(m.max_age(), Some(60));
  }

  #[test]
  fn unknown_critical() {
    let mut m = msg();
    assert_eq!(m.unknown_critical(), None);

    // 3001 is odd (critical) and unregistered
    m.set(OptNumber(3001), OptValue(vec![1]));
    assert_eq!(m.unknown_critical(), Some(OptNumber(3001)));

    // 3000 is even (elective); ignorable
    let mut m = msg();
    m.set(OptNumber(3000), OptValue(vec![1]));
    assert_eq!(m.unknown_critical(), None);
  }

  #[test]
  fn opt_number_qualities() {
    // critical, safe-to-fwd, cache-key
    let if_match = OptNumber(1);

    // critical, unsafe-to-fwd, cache-key
    let uri_host = OptNumber(3);

    // elective, safe-to-fwd, cache-key
    let etag = OptNumber(4);

    // elective, safe-to-fwd, no-cache-key
    let size1 = OptNumber(60);

    assert_eq!(if_match.must_be_processed(), OptionMustBeProcessed::Yes);
    assert_eq!(uri_host.must_be_processed(), OptionMustBeProcessed::Yes);
    assert_eq!(etag.must_be_processed(), OptionMustBeProcessed::No);
    assert_eq!(size1.must_be_processed(), OptionMustBeProcessed::No);

    assert_eq!(uri_host.when_unsupported_by_proxy(),
               WhenOptionUnsupportedByProxy::Error);
    assert_eq!(etag.when_unsupported_by_proxy(),
               WhenOptionUnsupportedByProxy::Forward);

    assert_eq!(etag.when_option_changes(), WhenOptionChanges::ResponseChanges);
    assert_eq!(size1.when_option_changes(),
               WhenOptionChanges::ResponseDoesNotChange);
  }
}
