use embedded_time::duration::Milliseconds;

use crate::retry::{Attempts, Strategy};
use crate::time::Millis;

/// Configuration options related to confirmable messages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Con {
  /// Initial retransmission timeout, before jitter.
  ///
  /// Defaults to 2000 milliseconds (RFC7252 ACK_TIMEOUT).
  pub ack_timeout: Millis,
  /// Jitter factor; the actual initial timeout is drawn uniformly
  /// from `ack_timeout * [1, ack_random_factor]`.
  ///
  /// Defaults to 1.5 (RFC7252 ACK_RANDOM_FACTOR).
  pub ack_random_factor: f32,
  /// Factor the timeout grows by after each retransmission.
  ///
  /// Defaults to 2.0 (RFC7252 ACK_TIMEOUT_SCALE).
  pub ack_timeout_scale: f32,
  /// Number of retransmissions before a CON is given up on, so at
  /// most `max_retransmit + 1` transmissions happen in total.
  ///
  /// Defaults to 4 attempts (RFC7252 MAX_RETRANSMIT).
  ///
  /// ```
  /// use newt::config::Con;
  /// use newt::retry::Attempts;
  ///
  /// assert_eq!(Con::default().max_retransmit, Attempts(4));
  /// ```
  pub max_retransmit: Attempts,
}

impl Default for Con {
  fn default() -> Self {
    Con { ack_timeout: Milliseconds(2_000),
          ack_random_factor: 1.5,
          ack_timeout_scale: 2.0,
          max_retransmit: Attempts(4) }
  }
}

impl Con {
  /// The [`Strategy`] implementing this configuration's
  /// retransmission schedule
  pub fn retry_strategy(&self) -> Strategy {
    Strategy::Exponential { init_min: self.ack_timeout,
                            init_max: Milliseconds((self.ack_timeout.0 as f32
                                                    * self.ack_random_factor)
                                                   as u64),
                            scale: self.ack_timeout_scale }
  }

  /// Total number of transmissions a CON may use
  pub fn max_attempts(&self) -> Attempts {
    self.max_retransmit + Attempts(1)
  }
}

/// Configuration options related to block-wise transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
  /// Payloads larger than this are fragmented into blocks of this
  /// size (rounded down to a power of two between 16 and 1024).
  ///
  /// Defaults to 512 bytes.
  pub preferred_size: u16,
  /// How long partially reassembled transfer state is kept before
  /// it is discarded.
  ///
  /// Defaults to 10 minutes (600,000 ms).
  pub status_lifetime: Millis,
}

impl Default for Block {
  fn default() -> Self {
    Block { preferred_size: 512,
            status_lifetime: Milliseconds(600_000) }
  }
}

/// Configuration options related to parsing & producing messages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Msg {
  /// Largest message we will emit.
  ///
  /// Defaults to 1024 bytes.
  pub max_size: u16,
  /// Size of the datagram receive buffer; datagrams larger than
  /// this are truncated by the socket.
  ///
  /// Defaults to 2048 bytes.
  pub recv_buffer_size: usize,
  /// Start per-peer message-ID sequences at a random value rather
  /// than zero.
  ///
  /// Defaults to true.
  pub use_random_id_start: bool,
  /// Generate random 8-byte tokens rather than counting up from
  /// the seed.
  ///
  /// Defaults to true.
  pub use_random_token_start: bool,
  /// Seed used to generate message tokens & randomized IDs,
  /// customizable to allow for your application to generate tokens
  /// less guessably.
  ///
  /// The default value is 0, although it is
  /// best practice to set this to something else.
  /// (random integer, machine identifier)
  pub token_seed: u16,
  /// See [`Con`]
  pub con: Con,
  /// See [`Block`]
  pub block: Block,
}

impl Default for Msg {
  fn default() -> Self {
    Msg { max_size: 1024,
          recv_buffer_size: 2048,
          use_random_id_start: true,
          use_random_token_start: true,
          token_seed: 0,
          con: Con::default(),
          block: Block::default() }
  }
}

/// Configuration options related to observing resources (RFC7641)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Observe {
  /// Fallback freshness lifetime used for notifications that do not
  /// carry a Max-Age option.
  ///
  /// Defaults to 128,000 ms (the RFC7641 reordering window).
  pub notification_max_age: Millis,
  /// A relation that has been served only non-confirmable
  /// notifications for this long gets a confirmable one, to check
  /// the client still cares.
  ///
  /// Defaults to 24 hours.
  pub check_interval_time: Millis,
  /// A relation that has been served this many non-confirmable
  /// notifications in a row gets a confirmable one.
  ///
  /// Defaults to 100.
  pub check_interval_count: u32,
  /// Slack added on top of a notification's Max-Age before the
  /// client re-registers its interest.
  ///
  /// Defaults to 2000 ms.
  pub reregistration_backoff: Millis,
}

impl Default for Observe {
  fn default() -> Self {
    Observe { notification_max_age: Milliseconds(128_000),
              check_interval_time: Milliseconds(86_400_000),
              check_interval_count: 100,
              reregistration_backoff: Milliseconds(2_000) }
  }
}

/// Runtime config
///
/// An endpoint owns one immutable copy of this, injected at
/// construction; there is no global configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
  /// Port requests go to when the URI doesn't name one.
  ///
  /// Defaults to 5683.
  pub default_port: u16,
  /// Port secured (coaps) requests would go to. Carried in the
  /// configuration for URI handling even though DTLS itself is out
  /// of scope.
  ///
  /// Defaults to 5684.
  pub default_secure_port: u16,
  /// Port a cross-proxy would serve HTTP on.
  ///
  /// Defaults to 8080.
  pub http_port: u16,
  /// See [`Msg`]
  pub msg: Msg,
  /// See [`Observe`]
  pub observe: Observe,
  /// How long completed exchanges are remembered, for duplicate
  /// detection and ACK/response replay.
  ///
  /// Defaults to 247 seconds (RFC7252 EXCHANGE_LIFETIME).
  pub exchange_lifetime: Millis,
  /// How often the exchange store is swept for expired entries.
  ///
  /// Defaults to 10 seconds.
  pub mark_and_sweep_interval: Millis,
  /// How long the blocking client waits for a response before
  /// giving up.
  ///
  /// Defaults to 32,767 ms.
  pub request_timeout: Millis,
}

impl Default for Config {
  fn default() -> Self {
    Config { default_port: 5683,
             default_secure_port: 5684,
             http_port: 8080,
             msg: Msg::default(),
             observe: Observe::default(),
             exchange_lifetime: Milliseconds(247_000),
             mark_and_sweep_interval: Milliseconds(10_000),
             request_timeout: Milliseconds(32_767) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_follow_rfc7252() {
    let cfg = Config::default();
    assert_eq!(cfg.default_port, 5683);
    assert_eq!(cfg.msg.con.ack_timeout, Milliseconds(2_000u32));
    assert_eq!(cfg.msg.con.max_retransmit, Attempts(4));
    assert_eq!(cfg.msg.con.max_attempts(), Attempts(5));
    assert_eq!(cfg.msg.block.preferred_size, 512);
    assert_eq!(cfg.exchange_lifetime, Milliseconds(247_000u32));
    assert_eq!(cfg.mark_and_sweep_interval, Milliseconds(10_000u32));
    assert_eq!(cfg.observe.notification_max_age, Milliseconds(128_000u32));
  }

  #[test]
  fn con_retry_strategy_reflects_config() {
    let strat = Con::default().retry_strategy();
    assert_eq!(strat,
               Strategy::Exponential { init_min: Milliseconds(2_000),
                                       init_max: Milliseconds(3_000),
                                       scale: 2.0 });
  }
}
