use newt_msg::{Id, Message, MessageOptions, Token, Type};
use std_alloc::string::{FromUtf8Error, String};

use crate::req::Req;
use crate::ContentFormat;

/// Response codes
pub mod code {
  use newt_msg::Code;

  macro_rules! code {
    (#[doc = $doc:expr] $name:ident = $c:literal * $d:literal) => {
      #[doc = $doc]
      #[allow(clippy::zero_prefixed_literal)]
      pub const $name: Code = Code::new($c, $d);
    };
  }

  // 2.xx
  code!(#[doc = "2.01 Created <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.1.1>"]
        CREATED = 2*01);
  code!(#[doc = "2.02 Deleted <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.1.2>"]
        DELETED = 2*02);
  code!(#[doc = "2.03 Valid <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.1.3>"]
        VALID = 2*03);
  code!(#[doc = "2.04 Changed <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.1.4>"]
        CHANGED = 2*04);
  code!(#[doc = "2.05 Content <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.1.5>"]
        CONTENT = 2*05);
  code!(#[doc = "2.31 Continue: this block of the request body arrived fine, send the next one <https://www.rfc-editor.org/rfc/rfc7959#section-2.9.1>"]
        CONTINUE = 2*31);

  // 4.xx
  code!(#[doc = "4.00 Bad Request <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.1>"]
        BAD_REQUEST = 4*00);
  code!(#[doc = "4.01 Unauthorized <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.2>"]
        UNAUTHORIZED = 4*01);
  code!(#[doc = "4.02 Bad Option: the request carried a critical option we don't understand <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.3>"]
        BAD_OPTION = 4*02);
  code!(#[doc = "4.03 Forbidden <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.4>"]
        FORBIDDEN = 4*03);
  code!(#[doc = "4.04 Not Found <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.5>"]
        NOT_FOUND = 4*04);
  code!(#[doc = "4.05 Method Not Allowed <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.6>"]
        METHOD_NOT_ALLOWED = 4*05);
  code!(#[doc = "4.06 Not Acceptable <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.7>"]
        NOT_ACCEPTABLE = 4*06);
  code!(#[doc = "4.08 Request Entity Incomplete: blocks arrived out of order, with a gap, or after state expired <https://www.rfc-editor.org/rfc/rfc7959#section-2.9.2>"]
        REQUEST_ENTITY_INCOMPLETE = 4*08);
  code!(#[doc = "4.12 Precondition Failed <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.8>"]
        PRECONDITION_FAILED = 4*12);
  code!(#[doc = "4.13 Request Entity Too Large <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.9>"]
        REQUEST_ENTITY_TOO_LARGE = 4*13);
  code!(#[doc = "4.15 Unsupported Content-Format <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.2.10>"]
        UNSUPPORTED_CONTENT_FORMAT = 4*15);

  // 5.xx
  code!(#[doc = "5.00 Internal Server Error <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.3.1>"]
        INTERNAL_SERVER_ERROR = 5*00);
  code!(#[doc = "5.01 Not Implemented <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.3.2>"]
        NOT_IMPLEMENTED = 5*01);
  code!(#[doc = "5.02 Bad Gateway <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.3.3>"]
        BAD_GATEWAY = 5*02);
  code!(#[doc = "5.03 Service Unavailable <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.3.4>"]
        SERVICE_UNAVAILABLE = 5*03);
  code!(#[doc = "5.04 Gateway Timeout <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.3.5>"]
        GATEWAY_TIMEOUT = 5*04);
  code!(#[doc = "5.05 Proxying Not Supported <https://datatracker.ietf.org/doc/html/rfc7252#section-5.9.3.6>"]
        PROXYING_NOT_SUPPORTED = 5*05);
}

/// A CoAP response
///
/// Bound to a request by token equality; created either by the runtime
/// (parsed off the wire) or by server code via [`Resp::for_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resp {
  pub(crate) msg: Message,
}

impl Resp {
  /// Create a new response for a given request.
  ///
  /// If the request is CONfirmable, this will return Some(ACK)
  /// (a piggybacked response).
  ///
  /// If the request is NONconfirmable, this will return Some(NON).
  ///
  /// If the request is EMPTY or RESET, this will return None.
  pub fn for_request(req: &Req) -> Option<Self> {
    match req.msg_type() {
      | Type::Con => Some(Self::ack(req)),
      | Type::Non => Some(Self::non(req)),
      | _ => None,
    }
  }

  /// Create a piggybacked response ACKnowledging an incoming request.
  ///
  /// The ACK reuses the request's message ID; the token binds the
  /// response body to the request.
  pub fn ack(req: &Req) -> Self {
    let mut msg = Message::new(Type::Ack, code::CONTENT, req.msg.id, req.msg_token());
    msg.ver = Default::default();
    Self { msg }
  }

  /// Create a CONfirmable response for an incoming request.
  ///
  /// A confirmable response should be used when
  /// you receive a NON request and want to ensure
  /// the client receives your response. The runtime will retry
  /// sending it until the client ACKs.
  pub fn con(req: &Req) -> Self {
    Self { msg: Message::new(Type::Con, code::CONTENT, Id(0), req.msg_token()) }
  }

  /// Create a NONconfirmable response for an incoming request.
  pub fn non(req: &Req) -> Self {
    Self { msg: Message::new(Type::Non, code::CONTENT, Id(0), req.msg_token()) }
  }

  /// Get the message type
  pub fn msg_type(&self) -> Type {
    self.msg.ty
  }

  /// Get the message token
  pub fn token(&self) -> Token {
    self.msg.token
  }

  /// Get the response code
  pub fn code(&self) -> newt_msg::Code {
    self.msg.code
  }

  /// Change the response code
  pub fn set_code(&mut self, code: newt_msg::Code) {
    self.msg.code = code;
  }

  /// The notification counter, when this response belongs to an
  /// observe relation
  pub fn observe_counter(&self) -> Option<u32> {
    self.msg.observe()
  }

  /// Get the payload's raw bytes
  pub fn payload(&self) -> &[u8] {
    &self.msg.payload.0
  }

  /// Get the payload and attempt to interpret it as a UTF-8 string
  pub fn payload_string(&self) -> Result<String, FromUtf8Error> {
    String::from_utf8(self.payload().to_vec())
  }

  /// Add a payload to this response
  pub fn set_payload<Bytes: IntoIterator<Item = u8>>(&mut self, payload: Bytes) {
    self.msg.payload.0 = payload.into_iter().collect();
  }

  /// Declare the payload's Content-Format
  pub fn set_content_format(&mut self, format: ContentFormat) {
    self.msg.set_content_format(format);
  }

  /// Borrow the message this response wraps
  pub fn msg(&self) -> &Message {
    &self.msg
  }

  /// Mutably borrow the message this response wraps
  pub fn msg_mut(&mut self) -> &mut Message {
    &mut self.msg
  }
}

impl From<Message> for Resp {
  fn from(msg: Message) -> Self {
    Self { msg }
  }
}

impl From<Resp> for Message {
  fn from(rep: Resp) -> Self {
    rep.msg
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn for_request_mirrors_type() {
    let mut req = Req::get("1.1.1.1:5683".parse().unwrap(), "/hello");
    req.msg_mut().id = Id(33);
    req.msg_mut().token = Token::from_bytes(&[1, 2]);

    let ack = Resp::for_request(&req).unwrap();
    assert_eq!(ack.msg_type(), Type::Ack);
    assert_eq!(ack.msg().id, Id(33));
    assert_eq!(ack.token(), req.msg_token());

    req.non();
    let non = Resp::for_request(&req).unwrap();
    assert_eq!(non.msg_type(), Type::Non);
    assert_eq!(non.token(), req.msg_token());
  }
}
