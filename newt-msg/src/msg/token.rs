use tinyvec::ArrayVec;

/// # Message Token
///
/// Opaque 0-8 byte correlator chosen by the client, used to match
/// responses to requests independently of the message layer.
///
/// Where [`Id`](crate::Id) matches an ACK/RST to the CON it confirms,
/// the token links a response _payload_ to the request that caused it,
/// even when that response arrives in a separate message much later.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Token(pub ArrayVec<[u8; 8]>);

impl Token {
  /// Create a token from up to 8 bytes of data.
  ///
  /// Extra bytes beyond 8 are discarded.
  ///
  /// ```
  /// use newt_msg::Token;
  ///
  /// let token = Token::from_bytes(&[0xAB]);
  /// assert_eq!(token.0.len(), 1);
  /// ```
  pub fn from_bytes(data: &[u8]) -> Token {
    Token(data.iter().copied().take(8).collect())
  }

  /// Is this the zero-length token?
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}
