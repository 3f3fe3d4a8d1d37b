use ::std::io;

pub(crate) fn io_to_nb(err: io::Error) -> nb::Error<io::Error> {
  match err.kind() {
    | io::ErrorKind::WouldBlock => nb::Error::WouldBlock,
    | _ => nb::Error::Other(err),
  }
}

pub(crate) fn sockaddr_from_std(addr: std::net::SocketAddr) -> no_std_net::SocketAddr {
  match addr {
    | std::net::SocketAddr::V4(v4) => {
      let [a, b, c, d] = v4.ip().octets();
      no_std_net::SocketAddr::V4(no_std_net::SocketAddrV4::new(no_std_net::Ipv4Addr::new(a, b,
                                                                                         c, d),
                                                               v4.port()))
    },
    | std::net::SocketAddr::V6(v6) => {
      let [a, b, c, d, e, f, g, h] = v6.ip().segments();
      no_std_net::SocketAddr::V6(no_std_net::SocketAddrV6::new(no_std_net::Ipv6Addr::new(a, b,
                                                                                         c, d,
                                                                                         e, f,
                                                                                         g, h),
                                                               v6.port(),
                                                               v6.flowinfo(),
                                                               v6.scope_id()))
    },
  }
}

pub(crate) fn sockaddr_to_std(addr: no_std_net::SocketAddr) -> std::net::SocketAddr {
  match addr {
    | no_std_net::SocketAddr::V4(v4) => {
      let [a, b, c, d] = v4.ip().octets();
      std::net::SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::new(a, b, c, d),
                                                           v4.port()))
    },
    | no_std_net::SocketAddr::V6(v6) => {
      let [a, b, c, d, e, f, g, h] = v6.ip().segments();
      std::net::SocketAddr::V6(std::net::SocketAddrV6::new(std::net::Ipv6Addr::new(a, b, c, d,
                                                                                   e, f, g, h),
                                                           v6.port(),
                                                           v6.flowinfo(),
                                                           v6.scope_id()))
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrip() {
    for addr in ["127.0.0.1:5683", "[2001:db8::1]:9999"] {
      let std_addr: std::net::SocketAddr = addr.parse().unwrap();
      assert_eq!(sockaddr_to_std(sockaddr_from_std(std_addr)), std_addr);
    }
  }
}
