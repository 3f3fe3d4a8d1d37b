use std::net::UdpSocket;

use embedded_time::rate::Fraction;

use crate::net::{Addrd, Socket};

pub(crate) mod convert;

/// Implement [`embedded_time::Clock`] using [`std::time`] primitives
#[derive(Debug, Clone, Copy)]
pub struct Clock(std::time::Instant);

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock {
  /// Create a new clock
  pub fn new() -> Self {
    Self(std::time::Instant::now())
  }
}

impl embedded_time::Clock for Clock {
  type T = u64;

  // microseconds
  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000_000);

  fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
    let now = std::time::Instant::now();
    let elapsed = now.duration_since(self.0);
    Ok(embedded_time::Instant::new(elapsed.as_micros() as u64))
  }
}

impl Socket for UdpSocket {
  type Error = std::io::Error;

  fn local_addr(&self) -> no_std_net::SocketAddr {
    UdpSocket::local_addr(self).map(convert::sockaddr_from_std)
                               .unwrap_or_else(|_| {
                                 no_std_net::SocketAddr::V4(no_std_net::SocketAddrV4::new(
                                   no_std_net::Ipv4Addr::new(0, 0, 0, 0), 0))
                               })
  }

  fn bind<A: no_std_net::ToSocketAddrs>(addr: A) -> Result<Self, Self::Error> {
    let addr = addr.to_socket_addrs().unwrap().next().unwrap();

    UdpSocket::bind(convert::sockaddr_to_std(addr)).and_then(|sock| {
                                                     sock.set_nonblocking(true)?;
                                                     Ok(sock)
                                                   })
  }

  fn send(&self, msg: Addrd<&[u8]>) -> nb::Result<(), Self::Error> {
    self.send_to(msg.data(), convert::sockaddr_to_std(msg.addr()))
        .map(|_| ())
        .map_err(convert::io_to_nb)
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    self.recv_from(buffer)
        .map(|(n, addr)| Addrd(n, convert::sockaddr_from_std(addr)))
        .map_err(convert::io_to_nb)
  }
}
