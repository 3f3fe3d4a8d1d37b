/// Errors encounterable while parsing a message from bytes
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord)]
pub enum MessageParseError {
  /// Reached end of stream before parsing was finished
  UnexpectedEndOfStream,

  /// Token length was > 8
  InvalidTokenLength(u8),

  /// Error parsing option
  OptParseError(super::opt::parse_error::OptParseError),

  /// The payload marker `0xFF` was present but no
  /// payload bytes followed it
  PayloadMarkerWithoutPayload,

  /// The message code was 0.00 (Empty) but the message carried
  /// a token, options or a payload
  EmptyMessageWithContent,

  /// The message type is invalid (see [`Type`](crate::Type) for information & valid values)
  InvalidType(u8),
}

impl MessageParseError {
  /// Shorthand for [`MessageParseError::UnexpectedEndOfStream`]
  pub fn eof() -> Self {
    Self::UnexpectedEndOfStream
  }
}
