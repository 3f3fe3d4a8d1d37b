use core::fmt::Write;

use newt_msg::{Code, Id, Message, MessageOptions, OptValue, Token, Type};
use no_std_net::SocketAddr;
use std_alloc::string::String;

use crate::config::Config;
use crate::uri::CoapUri;
use crate::ContentFormat;

/// Request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Method(pub Code);

#[allow(missing_docs)]
impl Method {
  pub const GET: Method = Method(Code::GET);
  pub const POST: Method = Method(Code::POST);
  pub const PUT: Method = Method(Code::PUT);
  pub const DELETE: Method = Method(Code::DELETE);
}

/// A CoAP request
///
/// ```
/// use newt::req::Req;
///
/// let mut req = Req::post("192.168.0.1:5632".parse().unwrap(), "hello");
/// req.set_payload("john".bytes());
/// ```
///
/// Requests start out with `Id(0)` and an empty token; the runtime
/// assigns real values when the request is first transmitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Req {
  pub(crate) msg: Message,
}

impl Req {
  /// Create a request
  pub fn new(method: Method, host: SocketAddr, path: impl AsRef<str>) -> Self {
    let mut msg = Message::new(Type::Con, method.0, Id(0), Token::default());

    let mut host_str = String::new();
    write!(host_str, "{}", host.ip()).ok();

    msg.set_host(&host_str);
    msg.set_port(host.port());
    msg.set_path(path.as_ref());

    Self { msg }
  }

  /// Build a request for a parsed `coap://` URI.
  ///
  /// Path segments become repeated Uri-Path options and each `k=v`
  /// pair of the query becomes a Uri-Query option.
  pub fn from_uri(method: Method, cfg: &Config, uri: &CoapUri) -> Self {
    let mut msg = Message::new(Type::Con, method.0, Id(0), Token::default());

    msg.set_host(&uri.host);
    msg.set_port(uri.port_or_default(cfg));
    msg.set_path(&uri.path);
    uri.query.iter().for_each(|q| msg.add_query(q));

    Self { msg }
  }

  /// Creates a new GET request
  pub fn get(host: SocketAddr, path: impl AsRef<str>) -> Self {
    Self::new(Method::GET, host, path)
  }

  /// Creates a new POST request
  pub fn post(host: SocketAddr, path: impl AsRef<str>) -> Self {
    Self::new(Method::POST, host, path)
  }

  /// Creates a new PUT request
  pub fn put(host: SocketAddr, path: impl AsRef<str>) -> Self {
    Self::new(Method::PUT, host, path)
  }

  /// Creates a new DELETE request
  pub fn delete(host: SocketAddr, path: impl AsRef<str>) -> Self {
    Self::new(Method::DELETE, host, path)
  }

  /// Get the request method
  pub fn method(&self) -> Method {
    Method(self.msg.code)
  }

  /// Get the request type (confirmable, non-confirmable)
  pub fn msg_type(&self) -> Type {
    self.msg.ty
  }

  /// Set this request to be non-confirmable.
  ///
  /// Some messages do not require an acknowledgement.
  ///
  /// This is particularly true for messages that are repeated regularly for
  /// application requirements, such as repeated readings from a sensor.
  pub fn non(&mut self) -> () {
    self.msg.ty = Type::Non;
  }

  /// Get a copy of the message token for this request
  pub fn msg_token(&self) -> Token {
    self.msg.token
  }

  /// Add a payload to this request
  pub fn set_payload<Bytes: IntoIterator<Item = u8>>(&mut self, payload: Bytes) {
    self.msg.payload.0 = payload.into_iter().collect();
  }

  /// Get the payload's raw bytes
  pub fn payload(&self) -> &[u8] {
    &self.msg.payload.0
  }

  /// Get the payload and attempt to interpret it as UTF-8
  pub fn payload_str(&self) -> Result<&str, core::str::Utf8Error> {
    core::str::from_utf8(self.payload())
  }

  /// Tell the server what Content-Format we'd like back
  pub fn set_accept(&mut self, format: ContentFormat) {
    self.msg.set_accept(format);
  }

  /// Declare the payload's Content-Format
  pub fn set_content_format(&mut self, format: ContentFormat) {
    self.msg.set_content_format(format);
  }

  /// Append a Uri-Query value
  pub fn add_query(&mut self, query: &str) {
    self.msg.add_query(query);
  }

  /// Add a custom option to this request, replacing any existing value
  pub fn set_option(&mut self, number: u16, value: impl IntoIterator<Item = u8>) {
    self.msg.set(newt_msg::OptNumber(number),
                 OptValue(value.into_iter().collect()));
  }

  /// Borrow the message this request wraps
  pub fn msg(&self) -> &Message {
    &self.msg
  }

  /// Mutably borrow the message this request wraps
  pub fn msg_mut(&mut self) -> &mut Message {
    &mut self.msg
  }
}

impl From<Message> for Req {
  fn from(msg: Message) -> Self {
    Self { msg }
  }
}

impl From<Req> for Message {
  fn from(req: Req) -> Self {
    req.msg
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn host_port_path_options() {
    let req = Req::get("192.168.255.123:4313".parse().unwrap(), "a/b");
    assert_eq!(req.msg().host(), Some("192.168.255.123"));
    assert_eq!(req.msg().port(), Some(4313));
    assert_eq!(req.msg().path_segments().unwrap(), vec!["a", "b"]);

    let req = Req::get("[::1]:8080".parse().unwrap(), "");
    assert_eq!(req.msg().host(), Some("::1"));
  }

  #[test]
  fn from_uri_decomposes() {
    let uri = CoapUri::parse("coap://h/sensors/temp?unit=c&max=2").unwrap();
    let req = Req::from_uri(Method::GET, &Config::default(), &uri);

    assert_eq!(req.msg().host(), Some("h"));
    assert_eq!(req.msg().port(), Some(5683));
    assert_eq!(req.msg().path_segments().unwrap(), vec!["sensors", "temp"]);
    assert_eq!(req.msg().queries().unwrap(), vec!["unit=c", "max=2"]);
  }
}
