use no_std_net::{SocketAddr, ToSocketAddrs};
use std_alloc::vec::Vec;

/// Data that came from a network socket
#[derive(PartialEq, PartialOrd, Eq, Ord, Hash, Debug, Clone, Copy)]
pub struct Addrd<T>(pub T, pub SocketAddr);

impl<T> Addrd<T> {
  /// Borrow the contents of this Addressed
  pub fn as_ref(&self) -> Addrd<&T> {
    Addrd(self.data(), self.addr())
  }

  /// Discard the socket and get the data in this Addressed
  pub fn unwrap(self) -> T {
    self.0
  }

  /// Map the data contained in this Addressed
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Addrd<R> {
    Addrd(f(self.0), self.1)
  }

  /// Borrow the contents of the addressed item
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Mutably borrow the contents of the addressed item
  pub fn data_mut(&mut self) -> &mut T {
    &mut self.0
  }

  /// Copy the socket address for the data
  pub fn addr(&self) -> SocketAddr {
    self.1
  }

  /// Turn the entire structure into something else
  pub fn fold<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> R {
    f(self.0, self.1)
  }
}

impl<T> AsMut<T> for Addrd<T> {
  fn as_mut(&mut self) -> &mut T {
    &mut self.0
  }
}

/// A CoAP network socket
///
/// This mirrors the UDP socket traits in embedded-nal, but allows us to
/// implement them for foreign types (like `std::net::UdpSocket`).
///
/// The contract the runtime relies on:
/// - `send` is best-effort and non-blocking
/// - `recv` delivers at most one whole datagram per call; a datagram
///   larger than the buffer is truncated and the rest is dropped,
///   which is not an error condition
pub trait Socket: Sized {
  /// The error yielded by socket operations
  type Error: core::fmt::Debug;

  /// Get the local address this socket was created from
  fn local_addr(&self) -> SocketAddr;

  /// Binds the socket to a local address.
  ///
  /// The behavior of `addr` yielding multiple addresses is
  /// implementation-specific, but will most likely bind to the first
  /// address that is available. Implementors should yield a socket in
  /// a non-blocking state.
  fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Self::Error>;

  /// Send a message to a remote address
  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<(), Self::Error>;

  /// Pull a buffered datagram from the socket, along with the address
  /// of the sender.
  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error>;

  /// Poll the socket for one datagram, using a receive buffer of
  /// `buffer_size` bytes.
  fn poll(&self, buffer_size: usize) -> Result<Option<Addrd<Vec<u8>>>, Self::Error> {
    let mut buf = std_alloc::vec![0u8; buffer_size];

    match self.recv(&mut buf) {
      | Ok(Addrd(n, addr)) => {
        buf.truncate(n);
        Ok(Some(Addrd(buf, addr)))
      },
      | Err(nb::Error::WouldBlock) => Ok(None),
      | Err(nb::Error::Other(e)) => Err(e),
    }
  }
}
