use std_alloc::vec::Vec;

/// Message Code
pub mod code;

/// Message parsing errors
pub mod parse_error;

/// Message ID
pub mod id;

/// Message Options
pub mod opt;

/// Message Type
pub mod ty;

/// Message Token
pub mod token;

/// Message Version
pub mod ver;

pub use code::*;
pub use id::*;
pub use opt::*;
pub use parse_error::*;
pub use token::*;
pub use ty::*;
pub use ver::*;

use crate::cursor::Cursor;
use crate::from_bytes::TryConsumeBytes;
use crate::TryFromBytes;

/// The message body, without the `0xFF` marker that precedes
/// it on the wire.
///
/// See [RFC7252 section 5.5](https://datatracker.ietf.org/doc/html/rfc7252#section-5.5)
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(pub Vec<u8>);

/// Struct representing the first byte of a message.
///
/// ```text
/// CoAP version
/// |
/// |  Message type (CON, NON, ACK, RST)
/// |  |
/// |  |  Length of token, in bytes. (4-bit integer)
/// |  |  |
/// vv vv vvvv
/// 01 00 0000
/// ```
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub(crate) struct Byte1 {
  pub(crate) ver: Version,
  pub(crate) ty: Type,
  pub(crate) tkl: u8,
}

impl TryFrom<u8> for Byte1 {
  type Error = MessageParseError;

  fn try_from(b: u8) -> Result<Self, Self::Error> {
    let ver = b >> 6; // bits 0 & 1
    let ty = b >> 4 & 0b11; // bits 2 & 3
    let tkl = b & 0b1111u8; // last 4 bits

    Ok(Byte1 { ver: Version(ver),
               ty: Type::try_from(ty)?,
               tkl })
  }
}

/// # `Message` struct
/// Low-level representation of a message that has been parsed from the
/// raw binary format.
///
/// Options are stored in a [`BTreeMap`](std_alloc::collections::BTreeMap)
/// keyed by [`OptNumber`]; repeated options are a `Vec` of values under
/// one key. Use the [`MessageOptions`] trait for typed access.
///
/// Messages support both serializing to bytes and parsing from bytes,
/// via [`crate::TryIntoBytes`] and [`TryFromBytes`].
///
/// ```
/// use newt_msg::{Code, Id, Message, Token, TryFromBytes, TryIntoBytes, Type};
///
/// let msg = Message::new(Type::Con, Code::GET, Id(7), Token::from_bytes(&[0xAB]));
/// let bytes = msg.clone().try_into_bytes().unwrap();
/// assert_eq!(Message::try_from_bytes(&bytes).unwrap(), msg);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
  /// see [`Id`] for details
  pub id: Id,
  /// see [`Type`] for details
  pub ty: Type,
  /// see [`Version`] for details
  pub ver: Version,
  /// see [`Token`] for details
  pub token: Token,
  /// see [`Code`] for details
  pub code: Code,
  /// see [`OptionMap`] for details
  pub opts: OptionMap,
  /// see [`Payload`]
  pub payload: Payload,
}

impl Message {
  /// Create a message with no options and an empty payload
  pub fn new(ty: Type, code: Code, id: Id, token: Token) -> Self {
    Self { id,
           ty,
           code,
           token,
           ver: Default::default(),
           opts: Default::default(),
           payload: Payload(Default::default()) }
  }

  /// Create the empty ACK that confirms this message.
  ///
  /// Empty messages carry no token, options or payload, and an ACK
  /// reuses the ID of the CON it confirms.
  pub fn ack(&self) -> Self {
    Self::new(Type::Ack, Code::EMPTY, self.id, Token::default())
  }

  /// Create the RST that rejects this message.
  pub fn reset(&self) -> Self {
    Self::new(Type::Reset, Code::EMPTY, self.id, Token::default())
  }

  /// Is this a ping / standalone-ACK / RST carrier (code 0.00)?
  pub fn is_empty_code(&self) -> bool {
    self.code == Code::EMPTY
  }
}

impl<Bytes: AsRef<[u8]>> TryFromBytes<Bytes> for Message {
  type Error = MessageParseError;

  fn try_from_bytes(bytes: Bytes) -> Result<Self, Self::Error> {
    let mut bytes = Cursor::new(bytes);

    let Byte1 { tkl, ty, ver } = bytes.next()
                                      .ok_or_else(MessageParseError::eof)?
                                      .try_into()?;

    if tkl > 8 {
      return Err(Self::Error::InvalidTokenLength(tkl));
    }

    let code: Code = bytes.next().ok_or_else(MessageParseError::eof)?.into();
    let id: Id = Id::try_consume_bytes(&mut bytes)?;

    let token = bytes.take_exact(tkl as usize)
                     .ok_or_else(MessageParseError::eof)?;
    let token = Token::from_bytes(token);

    let (opts, saw_marker) =
      opt::try_consume_opts(&mut bytes).map_err(Self::Error::OptParseError)?;

    let payload = Payload(bytes.take_until_end().to_vec());

    if saw_marker && payload.0.is_empty() {
      return Err(Self::Error::PayloadMarkerWithoutPayload);
    }

    if code == Code::EMPTY && (tkl != 0 || !opts.is_empty() || !payload.0.is_empty()) {
      return Err(Self::Error::EmptyMessageWithContent);
    }

    Ok(Message { id,
                 ty,
                 ver,
                 code,
                 token,
                 opts,
                 payload })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_msg() {
    let (expect, bytes) = crate::test_msg();
    assert_eq!(Message::try_from_bytes(&bytes).unwrap(), expect)
  }

  #[test]
  fn parse_byte1() {
    let byte = 0b_01_10_0011u8;
    let byte = Byte1::try_from(byte).unwrap();
    assert_eq!(byte,
               Byte1 { ver: Version(1),
                       ty: Type::Ack,
                       tkl: 3 })
  }

  #[test]
  fn parse_id() {
    let mut id_bytes = Cursor::new(34u16.to_be_bytes());
    let id = Id::try_consume_bytes(&mut id_bytes).unwrap();
    assert_eq!(id, Id(34));
  }

  #[test]
  fn parse_rejects_truncated_header() {
    assert_eq!(Message::try_from_bytes([0b0100_0000u8, 0x45, 0x00]),
               Err(MessageParseError::UnexpectedEndOfStream));
  }

  #[test]
  fn parse_rejects_token_length_over_8() {
    // TKL = 9
    assert_eq!(Message::try_from_bytes([0b0100_1001u8, 0x45, 0, 1, 1, 2, 3, 4, 5, 6, 7, 8, 9]),
               Err(MessageParseError::InvalidTokenLength(9)));
  }

  #[test]
  fn parse_rejects_marker_without_payload() {
    assert_eq!(Message::try_from_bytes([0b0100_0000u8, 0x45, 0, 1, 0xFF]),
               Err(MessageParseError::PayloadMarkerWithoutPayload));
  }

  #[test]
  fn parse_rejects_empty_code_with_content() {
    // code 0.00 but TKL = 1
    assert_eq!(Message::try_from_bytes([0b0100_0001u8, 0x00, 0, 1, 0xAB]),
               Err(MessageParseError::EmptyMessageWithContent));

    // code 0.00 but payload present
    assert_eq!(Message::try_from_bytes([0b0100_0000u8, 0x00, 0, 1, 0xFF, 1]),
               Err(MessageParseError::EmptyMessageWithContent));
  }

  #[test]
  fn parse_empty_ack() {
    let ack = Message::try_from_bytes([0b0110_0000u8, 0x00, 0x12, 0x34]).unwrap();
    assert_eq!(ack.ty, Type::Ack);
    assert_eq!(ack.code, Code::EMPTY);
    assert_eq!(ack.id, Id(0x1234));
    assert!(ack.token.is_empty());
  }

  #[test]
  fn ack_and_reset() {
    let con = Message::new(Type::Con,
                           Code::GET,
                           Id(0x1234),
                           Token::from_bytes(&[0xAB]));

    let ack = con.ack();
    assert_eq!(ack.id, con.id);
    assert_eq!(ack.ty, Type::Ack);
    assert!(ack.is_empty_code());
    assert!(ack.token.is_empty());

    let rst = con.reset();
    assert_eq!(rst.id, con.id);
    assert_eq!(rst.ty, Type::Reset);
  }
}
