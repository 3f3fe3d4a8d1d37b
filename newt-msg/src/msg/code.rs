use core::fmt;

/// # Message Code
///
/// 8-bit value split into a 3-bit class and 5-bit detail, written
/// `c.dd` (e.g. `2.05` Content, `4.04` Not Found).
///
/// - `0.00` is the Empty message (ACK, RST or ping payload-carrier)
/// - `0.01`-`0.31` are request methods
/// - `2.xx`/`4.xx`/`5.xx` are response codes
///
/// See [RFC7252 section 5.9](https://datatracker.ietf.org/doc/html/rfc7252#section-5.9)
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Code {
  /// The "class" of the message code (the `2` in `2.05`)
  pub class: u8,
  /// The "detail" of the message code (the `05` in `2.05`)
  pub detail: u8,
}

/// What sort of message a [`Code`] marks.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum CodeKind {
  /// A message without any request or response semantics (code 0.00)
  Empty,
  /// A request method (class 0, nonzero detail)
  Request,
  /// A response code (class 2, 4 or 5)
  Response,
}

impl Code {
  /// Create a new Code
  ///
  /// ```
  /// use newt_msg::Code;
  ///
  /// let content = Code::new(2, 05);
  /// ```
  pub const fn new(class: u8, detail: u8) -> Self {
    Self { class, detail }
  }

  /// The Empty code, 0.00
  pub const EMPTY: Code = Code::new(0, 0);
  /// Request method GET, 0.01
  pub const GET: Code = Code::new(0, 1);
  /// Request method POST, 0.02
  pub const POST: Code = Code::new(0, 2);
  /// Request method PUT, 0.03
  pub const PUT: Code = Code::new(0, 3);
  /// Request method DELETE, 0.04
  pub const DELETE: Code = Code::new(0, 4);

  /// Whether this code marks an empty message, a request, or a response
  pub fn kind(&self) -> CodeKind {
    match (self.class, self.detail) {
      | (0, 0) => CodeKind::Empty,
      | (0, _) => CodeKind::Request,
      | _ => CodeKind::Response,
    }
  }

  /// Is this a 4.xx or 5.xx code?
  pub fn is_error(&self) -> bool {
    matches!(self.class, 4 | 5)
  }

  /// Is this a 2.xx code?
  pub fn is_success(&self) -> bool {
    self.class == 2
  }
}

impl From<u8> for Code {
  fn from(b: u8) -> Self {
    Self { class: b >> 5,
           detail: b & 0b11111 }
  }
}

impl From<Code> for u8 {
  fn from(c: Code) -> Self {
    (c.class << 5) | c.detail
  }
}

impl fmt::Display for Code {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{:02}", self.class, self.detail)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn code_bits() {
    assert_eq!(u8::from(Code::new(2, 5)), 0b0100_0101);
    assert_eq!(Code::from(0b0100_0101u8), Code::new(2, 5));
    assert_eq!(Code::from(0b1000_0100u8), Code::new(4, 4));
  }

  #[test]
  fn code_kind() {
    assert_eq!(Code::EMPTY.kind(), CodeKind::Empty);
    assert_eq!(Code::GET.kind(), CodeKind::Request);
    assert_eq!(Code::new(2, 5).kind(), CodeKind::Response);
    assert_eq!(Code::new(4, 2).kind(), CodeKind::Response);
  }

  #[test]
  fn code_display() {
    extern crate std;
    assert_eq!(std::format!("{}", Code::new(2, 5)), "2.05");
    assert_eq!(std::format!("{}", Code::new(4, 15)), "4.15");
  }
}
