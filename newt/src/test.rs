#![allow(dead_code)]

use ::core::cell::Cell;
use ::std::sync::{Arc, Mutex};
use embedded_time::rate::Fraction;
use embedded_time::Instant;
use newt_msg::{Message, TryFromBytes, TryIntoBytes};
use no_std_net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::net::{Addrd, Socket};

pub fn dummy_addr() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 8080))
}

pub fn dummy_addr_2() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 2), 8080))
}

pub fn dummy_addr_3() -> SocketAddr {
  SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 3), 8080))
}

/// A clock the test advances by hand; 1 tick = 1 millisecond
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClockMock(pub Cell<u64>);

impl ClockMock {
  pub fn new() -> Self {
    Self(Cell::new(0))
  }

  pub fn set(&self, to: u64) {
    self.0.set(to);
  }

  pub fn instant(n: u64) -> Instant<Self> {
    Instant::new(n)
  }
}

impl embedded_time::Clock for ClockMock {
  type T = u64;

  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

  fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
    Ok(Instant::new(self.0.get()))
  }
}

/// A mocked socket
#[derive(Debug)]
pub struct SockMock {
  /// Inbound bytes from remote sockets. Address represents the sender
  pub rx: Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
  /// Outbound bytes to remote sockets. Address represents the destination
  pub tx: Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
}

impl SockMock {
  pub fn new() -> Self {
    Self { rx: Default::default(),
           tx: Default::default() }
  }
}

impl Socket for SockMock {
  type Error = ();

  fn local_addr(&self) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 5683))
  }

  fn bind<A: no_std_net::ToSocketAddrs>(_: A) -> Result<Self, Self::Error> {
    Ok(Self::new())
  }

  fn send(&self, buf: Addrd<&[u8]>) -> nb::Result<(), Self::Error> {
    let mut vec = self.tx.lock().unwrap();
    vec.push(buf.map(Vec::from));
    Ok(())
  }

  fn recv(&self, buf: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    let mut rx = self.rx.lock().unwrap();

    if rx.is_empty() {
      return Err(nb::Error::WouldBlock);
    }

    let dgram = rx.remove(0);

    dgram.data()
         .iter()
         .take(buf.len())
         .enumerate()
         .for_each(|(ix, byte)| buf[ix] = *byte);

    Ok(dgram.map(|bytes| bytes.len().min(buf.len())))
  }
}

/// Handles into a [`SockMock`] that has been moved into an endpoint
pub struct TestNet {
  pub rx: Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
  pub tx: Arc<Mutex<Vec<Addrd<Vec<u8>>>>>,
}

impl TestNet {
  /// Pretend `msg` arrived from `msg.addr()`
  pub fn push_rx(&self, msg: Addrd<Message>) {
    let bytes = msg.map(|m| m.try_into_bytes().unwrap());
    self.rx.lock().unwrap().push(bytes);
  }

  /// Everything the endpoint sent since last drained, parsed
  pub fn drain_tx(&self) -> Vec<Addrd<Message>> {
    self.tx
        .lock()
        .unwrap()
        .drain(..)
        .map(|Addrd(bytes, addr)| Addrd(Message::try_from_bytes(&bytes).unwrap(), addr))
        .collect()
  }
}

/// A fresh endpoint on mocks, plus the network handles to feed it
pub fn endpoint(cfg: Config) -> (Endpoint<ClockMock, SockMock>, TestNet) {
  let sock = SockMock::new();
  let net = TestNet { rx: sock.rx.clone(),
                      tx: sock.tx.clone() };
  (Endpoint::new(ClockMock::new(), sock, cfg), net)
}

/// [`Config`] with randomness and jitter disabled, so IDs, tokens
/// and retransmission times are exact
pub fn deterministic_config() -> Config {
  let mut cfg = Config::default();
  cfg.msg.use_random_id_start = false;
  cfg.msg.use_random_token_start = false;
  cfg.msg.con.ack_random_factor = 1.0;
  cfg
}
