use core::ops::RangeInclusive;

use super::OptNumber;

/// Content-Format values
pub mod content_format;
pub use content_format::*;

/// Observe
pub mod observe;
pub use observe::*;

/// Block
pub mod block;
pub use block::*;

macro_rules! opt {
  (#[doc = $doc:expr] $name:ident = $n:literal) => {
    #[doc = $doc]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: crate::OptNumber = crate::OptNumber($n);
  };
}

pub(crate) use opt;

/// Non-repeatable options
pub mod no_repeat {
  use super::opt;

  opt!(#[doc = "Uri-Host <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.1>"]
       HOST = 3);
  opt!(#[doc = "If-None-Match <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.8.2>"]
       IF_NONE_MATCH = 5);
  opt!(#[doc = "<https://www.rfc-editor.org/rfc/rfc7641#section-2>"]
       OBSERVE = 6);
  opt!(#[doc = "See [`HOST`]"]
       PORT = 7);
  opt!(#[doc = "Content-Format <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.3>"]
       CONTENT_FORMAT = 12);
  opt!(#[doc = "Max-Age <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.5>"]
       MAX_AGE = 14);
  opt!(#[doc = "Accept <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.4>"]
       ACCEPT = 17);
  opt!(#[doc = "Block2 (response payload fragmentation) <https://www.rfc-editor.org/rfc/rfc7959#section-2.2>"]
       BLOCK2 = 23);
  opt!(#[doc = "Block1 (request payload fragmentation) <https://www.rfc-editor.org/rfc/rfc7959#section-2.2>"]
       BLOCK1 = 27);
  opt!(#[doc = "Size2 <https://www.rfc-editor.org/rfc/rfc7959#section-4>"]
       SIZE2 = 28);
  opt!(#[doc = "Proxy-Uri <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.2>"]
       PROXY_URI = 35);
  opt!(#[doc = "See [`PROXY_URI`]"]
       PROXY_SCHEME = 39);
  opt!(#[doc = "Size1 <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.9>"]
       SIZE1 = 60);
}

/// Repeatable options
pub mod repeat {
  use super::opt;

  opt!(#[doc = "If-Match <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.8.1>"]
       IF_MATCH = 1);
  opt!(#[doc = "ETag <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.6>"]
       ETAG = 4);
  opt!(#[doc = "Location-Path <https://datatracker.ietf.org/doc/html/rfc7252#section-5.10.7>"]
       LOCATION_PATH = 8);
  opt!(#[doc = "See [`super::no_repeat::HOST`]"]
       PATH = 11);
  opt!(#[doc = "See [`super::no_repeat::HOST`]"]
       QUERY = 15);
  opt!(#[doc = "See [`LOCATION_PATH`]"]
       LOCATION_QUERY = 20);
}

/// How an option's value is to be interpreted
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Format {
  /// Zero-length
  Empty,
  /// Raw bytes
  Opaque,
  /// Unsigned big-endian integer with no leading zero bytes
  /// (zero is the empty string)
  Uint,
  /// UTF-8 bytes, not null-terminated
  Utf8,
}

/// Is this number in the registry of options we understand?
pub fn is_recognized(n: OptNumber) -> bool {
  use no_repeat::*;
  use repeat::*;
  matches!(n,
           IF_MATCH | HOST
           | ETAG
           | IF_NONE_MATCH
           | OBSERVE
           | PORT
           | LOCATION_PATH
           | PATH
           | CONTENT_FORMAT
           | MAX_AGE
           | QUERY
           | ACCEPT
           | LOCATION_QUERY
           | BLOCK2
           | BLOCK1
           | SIZE2
           | PROXY_URI
           | PROXY_SCHEME
           | SIZE1)
}

/// May this option appear more than once in a message?
pub fn repeatable(n: OptNumber) -> bool {
  use repeat::*;
  matches!(n,
           IF_MATCH | ETAG | LOCATION_PATH | PATH | QUERY | LOCATION_QUERY)
}

/// The declared value format for a recognized option number.
///
/// Unknown numbers are treated as opaque.
pub fn format(n: OptNumber) -> Format {
  use no_repeat::*;
  use repeat::*;
  match n {
    | IF_NONE_MATCH => Format::Empty,
    | IF_MATCH | ETAG => Format::Opaque,
    | OBSERVE | PORT | CONTENT_FORMAT | MAX_AGE | ACCEPT | BLOCK2 | BLOCK1 | SIZE2 | SIZE1 => {
      Format::Uint
    },
    | HOST | LOCATION_PATH | PATH | QUERY | LOCATION_QUERY | PROXY_URI | PROXY_SCHEME => {
      Format::Utf8
    },
    | _ => Format::Opaque,
  }
}

/// The declared length bounds (inclusive) for a recognized option
/// number, per the tables of RFC7252, RFC7641 and RFC7959.
///
/// Unknown numbers allow any length up to 65535.
pub fn len_bounds(n: OptNumber) -> RangeInclusive<usize> {
  use no_repeat::*;
  use repeat::*;
  match n {
    | IF_MATCH => 0..=8,
    | HOST => 1..=255,
    | ETAG => 1..=8,
    | IF_NONE_MATCH => 0..=0,
    | OBSERVE => 0..=3,
    | PORT => 0..=2,
    | LOCATION_PATH | PATH | QUERY | LOCATION_QUERY => 0..=255,
    | CONTENT_FORMAT | ACCEPT => 0..=2,
    | MAX_AGE | SIZE2 | SIZE1 => 0..=4,
    | BLOCK2 | BLOCK1 => 0..=3,
    | PROXY_URI => 1..=1034,
    | PROXY_SCHEME => 1..=255,
    | _ => 0..=65535,
  }
}
