use newt_msg::to_bytes::MessageToBytesError;
use newt_msg::OptNumber;

/// Why an exchange ended without a usable response.
///
/// Codec errors never surface here: malformed datagrams are
/// dropped (and logged) without acknowledging them, per RFC7252.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Failure {
  /// A confirmable message exhausted its retransmissions, or the
  /// caller-supplied request timeout elapsed
  Timeout,
  /// The peer answered with RST
  Rejected,
  /// The exchange was cancelled locally
  Cancelled,
  /// A response carried a critical option we don't understand
  BadOption(OptNumber),
  /// A block-wise transfer could not be completed
  Blockwise(BlockwiseError),
}

/// Why a block-wise transfer failed.
///
/// Server-side these surface to the peer as 4.08 Request Entity
/// Incomplete; client-side they abort the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockwiseError {
  /// The peer changed block size mid-transfer
  SzxMismatch,
  /// A block arrived outside the current window
  Gap {
    /// The block number we were prepared to accept
    expected: u32,
    /// The block number that arrived
    got: u32,
  },
  /// SZX was the reserved value 7
  ReservedSzx,
  /// Partial reassembly state outlived `blockwise_status_lifetime`
  Expired,
}

/// An error encountered while driving the endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum Error<SockError> {
  /// Some socket operation failed
  Sock(SockError),
  /// Serializing a message to bytes failed
  ToBytes(MessageToBytesError),
  /// Reading the system clock failed
  Clock,
  /// The exchange ended without a usable response
  Failed(Failure),
  /// The token/address pair being polled does not name a live exchange
  UnknownExchange,
  /// A `coap://` URI could not be parsed or resolved
  Uri(crate::uri::UriError),
}

impl<E> From<Failure> for Error<E> {
  fn from(f: Failure) -> Self {
    Error::Failed(f)
  }
}
