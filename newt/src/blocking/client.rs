use embedded_time::duration::Milliseconds;
use newt_msg::Token;
use no_std_net::SocketAddr;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::{Error, Failure};
use crate::net::{Addrd, Socket};
use crate::req::{Method, Req};
use crate::resp::Resp;
use crate::time::{Clock, Millis};
use crate::uri::CoapUri;

/// A blocking CoAP request client.
///
/// Wraps an [`Endpoint`] and spins its `poll_*` methods until the
/// result is in or the configured `request_timeout` (32 767 ms by
/// default) has elapsed.
///
/// ```no_run
/// use newt::blocking::Client;
///
/// let mut client = Client::new_std(1111);
/// let rep = client.get("coap://127.0.0.1:5683/hello").unwrap();
///
/// println!("Hello, {}!", rep.payload_string().unwrap());
/// ```
#[allow(missing_debug_implementations)]
pub struct Client<Clk: Clock, Sock: Socket> {
  endpoint: Endpoint<Clk, Sock>,
}

/// Helper methods on Client Results
pub trait ClientResultExt<T, E> {
  /// If we timed out waiting for a response, consider that Ok(None).
  ///
  /// Usually used to handle sending non-confirmable requests that
  /// the server may have received but not responded to.
  fn timeout_ok(self) -> Result<Option<T>, Error<E>>;
}

impl<T, E> ClientResultExt<T, E> for Result<T, Error<E>> {
  fn timeout_ok(self) -> Result<Option<T>, Error<E>> {
    match self {
      | Ok(t) => Ok(Some(t)),
      | Err(Error::Failed(Failure::Timeout)) => Ok(None),
      | Err(e) => Err(e),
    }
  }
}

#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
impl Client<crate::std::Clock, ::std::net::UdpSocket> {
  /// Create a new client bound to `0.0.0.0:<port>` with default
  /// configuration
  pub fn new_std(port: u16) -> Self {
    Self::new_std_config(port, Config::default())
  }

  /// Create a new std client with a specific runtime config
  pub fn new_std_config(port: u16, config: Config) -> Self {
    let sock = ::std::net::UdpSocket::bind(("0.0.0.0", port)).unwrap();
    sock.set_nonblocking(true).unwrap();
    Self::new(crate::std::Clock::new(), sock, config)
  }
}

impl<Clk: Clock + 'static, Sock: Socket> Client<Clk, Sock> {
  /// Create a new request client
  pub fn new(clock: Clk, sock: Sock, config: Config) -> Self {
    Self { endpoint: Endpoint::new(clock, sock, config) }
  }

  /// The endpoint this client drives, for anything the blocking
  /// surface doesn't cover
  pub fn endpoint(&mut self) -> &mut Endpoint<Clk, Sock> {
    &mut self.endpoint
  }

  fn block_until<T>(&mut self,
                    mut poll: impl FnMut(&mut Endpoint<Clk, Sock>) -> nb::Result<T, Error<Sock::Error>>)
                    -> Result<T, Error<Sock::Error>> {
    let timeout = self.endpoint.config().request_timeout;
    let start = self.endpoint
                    .clock()
                    .try_now()
                    .map_err(|_| Error::Clock)?;

    loop {
      match poll(&mut self.endpoint) {
        | Ok(t) => return Ok(t),
        | Err(nb::Error::Other(e)) => return Err(e),
        | Err(nb::Error::WouldBlock) => {
          let now = self.endpoint
                        .clock()
                        .try_now()
                        .map_err(|_| Error::Clock)?;
          let elapsed: Millis =
            Millis::try_from(now - start).unwrap_or(Milliseconds(u64::MAX));

          if elapsed > timeout {
            return Err(Error::Failed(Failure::Timeout));
          }
        },
      }
    }
  }

  /// Send a request and wait for its response
  pub fn send(&mut self, req: Addrd<Req>) -> Result<Resp, Error<Sock::Error>> {
    let Addrd(token, addr) = self.endpoint.send_req(req)?;
    let out = self.block_until(|ep| ep.poll_resp(token, addr));

    if matches!(out, Err(Error::Failed(Failure::Timeout))) {
      self.endpoint.cancel(Addrd(token, addr));
    }

    out
  }

  /// Build & send a request against a `coap://` URI
  #[cfg(feature = "std")]
  #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
  pub fn request(&mut self,
                 method: Method,
                 uri: &str,
                 payload: &[u8])
                 -> Result<Resp, Error<Sock::Error>> {
    let cfg = self.endpoint.config();
    let uri = CoapUri::parse(uri).map_err(Error::Uri)?;
    let addr = uri.resolve(&cfg).map_err(Error::Uri)?;

    let mut req = Req::from_uri(method, &cfg, &uri);
    req.set_payload(payload.iter().copied());

    self.send(Addrd(req, addr))
  }

  /// GET a `coap://` URI
  #[cfg(feature = "std")]
  #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
  pub fn get(&mut self, uri: &str) -> Result<Resp, Error<Sock::Error>> {
    self.request(Method::GET, uri, &[])
  }

  /// POST to a `coap://` URI
  #[cfg(feature = "std")]
  #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
  pub fn post(&mut self, uri: &str, payload: &[u8]) -> Result<Resp, Error<Sock::Error>> {
    self.request(Method::POST, uri, payload)
  }

  /// PUT to a `coap://` URI
  #[cfg(feature = "std")]
  #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
  pub fn put(&mut self, uri: &str, payload: &[u8]) -> Result<Resp, Error<Sock::Error>> {
    self.request(Method::PUT, uri, payload)
  }

  /// DELETE a `coap://` URI
  #[cfg(feature = "std")]
  #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
  pub fn delete(&mut self, uri: &str) -> Result<Resp, Error<Sock::Error>> {
    self.request(Method::DELETE, uri, &[])
  }

  /// Register interest in a resource. Returns the relation's token;
  /// wait on notifications with [`Client::next_notification`].
  pub fn observe(&mut self, req: Addrd<Req>) -> Result<Addrd<Token>, Error<Sock::Error>> {
    self.endpoint.observe(req)
  }

  /// Wait for the next fresh notification of an observed resource
  pub fn next_notification(&mut self,
                           relation: Addrd<Token>)
                           -> Result<Resp, Error<Sock::Error>> {
    let Addrd(token, addr) = relation;
    self.block_until(|ep| ep.poll_resp(token, addr))
  }

  /// End an observe relation
  pub fn unobserve(&mut self, relation: Addrd<Token>) -> Result<(), Error<Sock::Error>> {
    self.endpoint.unobserve(relation)
  }

  /// Cancel an in-flight request
  pub fn cancel(&mut self, to: Addrd<Token>) {
    self.endpoint.cancel(to)
  }

  /// Check an endpoint is alive (CoAP ping: CON empty, success is
  /// the peer's RST)
  pub fn ping(&mut self, addr: SocketAddr) -> Result<(), Error<Sock::Error>> {
    let Addrd(id, addr) = self.endpoint.ping(addr)?;
    self.block_until(|ep| ep.poll_ping(id, addr))
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::{Code, Message, MessageOptions, Type};

  use super::*;
  use crate::test::{deterministic_config, dummy_addr, ClockMock, SockMock, TestNet};

  fn client_on_mocks() -> (Client<ClockMock, SockMock>, TestNet) {
    let sock = SockMock::new();
    let net = TestNet { rx: sock.rx.clone(),
                        tx: sock.tx.clone() };
    (Client::new(ClockMock::new(), sock, deterministic_config()), net)
  }

  #[test]
  fn send_resolves_with_prearrived_response() {
    let (mut client, net) = client_on_mocks();

    let req = Req::get(dummy_addr(), "time");
    let Addrd(token, addr) = client.endpoint().send_req(Addrd(req, dummy_addr())).unwrap();

    let sent = net.drain_tx();
    assert_eq!(sent.len(), 1);

    let mut rep = Message::new(Type::Ack, Code::new(2, 5), sent[0].data().id, token);
    rep.payload.0 = b"42".to_vec();
    net.push_rx(Addrd(rep, addr));

    let rep = client.next_notification(Addrd(token, addr));
    assert_eq!(rep.unwrap().payload(), b"42");
  }

  #[test]
  fn timeout_ok_maps_timeout_to_none() {
    let r: Result<(), Error<()>> = Err(Error::Failed(Failure::Timeout));
    assert_eq!(r.timeout_ok(), Ok(None));

    let r: Result<(), Error<()>> = Err(Error::Failed(Failure::Rejected));
    assert!(r.timeout_ok().is_err());
  }

  #[test]
  fn request_builds_uri_options() {
    let uri = CoapUri::parse("coap://192.168.0.1:5683/a/b?c=d").unwrap();
    let req = Req::from_uri(Method::GET, &Config::default(), &uri);
    assert_eq!(req.msg().path_segments().unwrap(), vec!["a", "b"]);
  }
}
