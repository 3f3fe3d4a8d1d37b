use no_std_net::IpAddr;
#[cfg(feature = "std")]
use no_std_net::SocketAddr;
use std_alloc::string::{String, ToString};
use std_alloc::vec::Vec;

use crate::config::Config;

/// The pieces of a `coap://host[:port]/path?query` URI.
///
/// `host` stays a string until [`CoapUri::resolve`]; the path becomes
/// repeated Uri-Path options and each `k=v` pair of the query becomes
/// a Uri-Query option when a request is built from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
  /// Hostname or IP literal
  pub host: String,
  /// Explicit port, if the URI named one
  pub port: Option<u16>,
  /// Path with no leading slash (may be empty)
  pub path: String,
  /// `k=v` pairs from the query string
  pub query: Vec<String>,
}

/// Ways a URI can be unusable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UriError {
  /// The scheme was not `coap`
  SchemeNotCoap,
  /// There was no host between `//` and the path
  MissingHost,
  /// The port was not a decimal u16
  InvalidPort,
  /// The host did not resolve to any address
  HostNotFound,
}

impl CoapUri {
  /// Split a `coap://` URI into its pieces.
  ///
  /// ```
  /// use newt::uri::CoapUri;
  ///
  /// let uri = CoapUri::parse("coap://[::1]:1234/a/b?x=1&y=2").unwrap();
  /// assert_eq!(uri.host, "::1");
  /// assert_eq!(uri.port, Some(1234));
  /// assert_eq!(uri.path, "a/b");
  /// assert_eq!(uri.query, vec!["x=1".to_string(), "y=2".to_string()]);
  /// ```
  pub fn parse(uri: &str) -> Result<Self, UriError> {
    let rest = uri.strip_prefix("coap://").ok_or(UriError::SchemeNotCoap)?;

    let (authority, rest) = match rest.find(|c| c == '/' || c == '?') {
      | Some(ix) => (&rest[..ix], &rest[ix..]),
      | None => (rest, ""),
    };

    let (path, query) = match rest.strip_prefix('/').unwrap_or(rest).split_once('?') {
      | Some((p, q)) => (p, q.split('&').filter(|s| !s.is_empty()).map(String::from).collect()),
      | None => (rest.strip_prefix('/').unwrap_or(rest), Vec::new()),
    };

    // `[v6]:port`, `v6`, `host:port` or `host`
    let (host, port) = match authority.strip_prefix('[') {
      | Some(bracketed) => {
        let (host, after) = bracketed.split_once(']').ok_or(UriError::MissingHost)?;
        (host, after.strip_prefix(':'))
      },
      | None => match authority.split_once(':') {
        | Some((host, port)) => (host, Some(port)),
        | None => (authority, None),
      },
    };

    if host.is_empty() {
      return Err(UriError::MissingHost);
    }

    let port = match port {
      | Some(p) => Some(p.parse::<u16>().map_err(|_| UriError::InvalidPort)?),
      | None => None,
    };

    Ok(Self { host: host.to_string(),
              port,
              path: path.to_string(),
              query })
  }

  /// The port requests should go to, falling back to the
  /// configured default (5683)
  pub fn port_or_default(&self, cfg: &Config) -> u16 {
    self.port.unwrap_or(cfg.default_port)
  }

  /// Is the host an IP literal (as opposed to a DNS name)?
  pub fn host_is_ip_literal(&self) -> bool {
    self.host.parse::<IpAddr>().is_ok()
  }

  /// Resolve the host to a socket address.
  ///
  /// IP literals resolve without a resolver; names go through the
  /// platform resolver, preferring IPv4 addresses.
  #[cfg(feature = "std")]
  #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
  pub fn resolve(&self, cfg: &Config) -> Result<SocketAddr, UriError> {
    use ::std::net::ToSocketAddrs;

    let port = self.port_or_default(cfg);

    if let Ok(ip) = self.host.parse::<IpAddr>() {
      return Ok(SocketAddr::new(ip, port));
    }

    (self.host.as_str(), port).to_socket_addrs()
                              .map_err(|_| UriError::HostNotFound)?
                              .map(crate::std::convert::sockaddr_from_std)
                              .reduce(|best, cur| match (best.is_ipv4(), cur.is_ipv4()) {
                                | (false, true) => cur,
                                | _ => best,
                              })
                              .ok_or(UriError::HostNotFound)
  }
}
