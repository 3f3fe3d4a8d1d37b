use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use newt_msg::{Id, Message, Token, Type};
use no_std_net::SocketAddr;
use std_alloc::boxed::Box;
use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

use crate::config;
use crate::error::Failure;
use crate::retry::RetryTimer;
use crate::time::{Clock, Millis};

/// Who started an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
  /// We sent the request
  Local,
  /// A peer sent us the request
  Remote,
}

/// Observer of an exchange's lifecycle.
///
/// One observer may be registered per exchange; the runtime invokes
/// the named transition methods as the message layer progresses.
/// All methods default to no-ops so implementors pick what they
/// care about.
pub trait Watcher {
  /// The peer confirmed our CON
  fn acknowledged(&mut self) {}

  /// Our CON is being sent again; `attempt` counts all transmissions
  /// including the first
  fn retransmitting(&mut self, attempt: u16) {
    let _ = attempt;
  }

  /// The peer answered RST
  fn rejected(&mut self) {}

  /// Retransmissions were exhausted without an ACK
  fn timed_out(&mut self) {}

  /// A response (or notification) arrived and passed every layer
  fn responded(&mut self, msg: &Message) {
    let _ = msg;
  }

  /// The exchange was cancelled locally
  fn cancelled(&mut self) {}

  /// The observed resource went quiet; a fresh registration
  /// is being sent
  fn reregistering(&mut self) {}
}

impl Watcher for () {}

/// The observer slot on an exchange.
///
/// Holds nothing by default; the facade installs one when the caller
/// asked to watch the request.
#[derive(Default)]
pub struct Watch(Option<Box<dyn Watcher>>);

impl core::fmt::Debug for Watch {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self.0 {
      | Some(_) => f.write_str("Watch(_)"),
      | None => f.write_str("Watch(none)"),
    }
  }
}

impl Watch {
  /// Install an observer
  pub fn new(w: impl Watcher + 'static) -> Self {
    Self(Some(Box::new(w)))
  }

  /// An empty slot
  pub fn none() -> Self {
    Self(None)
  }

  pub(crate) fn acknowledged(&mut self) {
    if let Some(w) = self.0.as_mut() {
      w.acknowledged()
    }
  }

  pub(crate) fn retransmitting(&mut self, attempt: u16) {
    if let Some(w) = self.0.as_mut() {
      w.retransmitting(attempt)
    }
  }

  pub(crate) fn rejected(&mut self) {
    if let Some(w) = self.0.as_mut() {
      w.rejected()
    }
  }

  pub(crate) fn timed_out(&mut self) {
    if let Some(w) = self.0.as_mut() {
      w.timed_out()
    }
  }

  pub(crate) fn responded(&mut self, msg: &Message) {
    if let Some(w) = self.0.as_mut() {
      w.responded(msg)
    }
  }

  pub(crate) fn cancelled(&mut self) {
    if let Some(w) = self.0.as_mut() {
      w.cancelled()
    }
  }

  pub(crate) fn reregistering(&mut self) {
    if let Some(w) = self.0.as_mut() {
      w.reregistering()
    }
  }
}

/// Where a confirmable message is in its retransmission lifecycle
#[derive(Debug)]
pub enum ConState<C: Clock> {
  /// Created but not yet handed to the wire
  Fresh,
  /// On the wire, unconfirmed; may be sent again
  InTransit {
    /// Drives the retransmission schedule
    timer: RetryTimer<C>,
    /// Transmissions so far, including the first
    transmissions: u16,
  },
  /// The peer confirmed receipt
  Acknowledged,
  /// The peer answered RST
  Rejected,
  /// Retransmissions were exhausted
  TimedOut,
  /// Cancelled locally
  Cancelled,
}

impl<C: Clock> Copy for ConState<C> {}
impl<C: Clock> Clone for ConState<C> {
  fn clone(&self) -> Self {
    *self
  }
}

/// Per-exchange observe state (RFC7641), for either side of the
/// relation.
///
/// Client side tracks the freshness of incoming notifications;
/// a symmetric endpoint serving observers additionally schedules
/// outgoing notifications through `in_transit`/`next_notification`.
#[derive(Debug)]
pub struct Relation<C: Clock> {
  /// A response carrying an Observe option has been seen
  pub established: bool,
  /// The relation is ending and further notifications are unwanted
  pub cancelled: bool,
  /// Highest accepted notification counter (client side)
  pub last_counter: Option<u32>,
  /// When the last accepted notification arrived
  pub last_at: Instant<C>,
  /// Counter for the next notification we send (server side)
  pub next_counter: u32,
  /// ID of the confirmable notification currently on the wire;
  /// at most one may be in transit per relation
  pub in_transit: Option<Id>,
  /// A fresher notification that arrived while one was in transit;
  /// it replaces any previously stashed one
  pub next_notification: Option<Message>,
  /// Non-confirmable notifications sent since the last confirmable one
  pub non_count: u32,
  /// When the last confirmable notification was sent
  pub last_con_at: Instant<C>,
}

impl<C: Clock> Relation<C> {
  /// A fresh relation, not yet established
  pub fn new(now: Instant<C>) -> Self {
    Self { established: false,
           cancelled: false,
           last_counter: None,
           last_at: now,
           next_counter: 0,
           in_transit: None,
           next_notification: None,
           non_count: 0,
           last_con_at: now }
  }

  /// The RFC7641 freshness rule: `v_new` is fresher than the last
  /// accepted counter iff it is ahead by less than 2^23, behind by
  /// more than 2^23 (the counter wrapped), or more than 128 seconds
  /// have passed since the last accepted notification.
  pub fn fresher(&self, v_new: u32, t_new: Instant<C>) -> bool {
    match self.last_counter {
      | None => true,
      | Some(v_last) => {
        (v_new > v_last && v_new - v_last < (1 << 23))
        || (v_last > v_new && v_last - v_new > (1 << 23))
        || t_new > self.last_at + Milliseconds(128_000u64)
      },
    }
  }

  /// Should the next notification be confirmable, to check the
  /// observer is still there?
  pub fn check_due(&self, now: Instant<C>, cfg: &config::Observe) -> bool {
    self.non_count >= cfg.check_interval_count
    || now >= self.last_con_at + Milliseconds(cfg.check_interval_time.0)
  }
}

/// Per-exchange block-wise transfer state (RFC7959)
#[derive(Debug)]
pub struct BlockState<C: Clock> {
  /// Negotiated size exponent; mismatches mid-transfer abort
  pub szx: Option<u32>,
  /// Reassembly buffer, keyed by block number
  pub pieces: BTreeMap<u32, Vec<u8>>,
  /// The one block number the window will accept next
  pub next_num: u32,
  /// Remaining outbound body when we are the fragmenting side
  pub tx_body: Option<Vec<u8>>,
  /// The response this transfer serves pieces of, minus its payload
  /// (so continuations reproduce its code and options)
  pub template: Option<Message>,
  /// When this state is discarded
  pub expires_at: Instant<C>,
}

impl<C: Clock> BlockState<C> {
  /// Blank state expiring after the configured status lifetime
  pub fn new(now: Instant<C>, lifetime: Millis) -> Self {
    Self { szx: None,
           pieces: BTreeMap::new(),
           next_num: 0,
           tx_body: None,
           template: None,
           expires_at: now + Milliseconds(lifetime.0) }
  }

  /// All received pieces, joined in block-number order
  pub fn assembled(&self) -> Vec<u8> {
    self.pieces.values().flat_map(|p| p.iter().copied()).collect()
  }

  /// Block `num` of `body` when fragmented into `size`-byte blocks,
  /// along with whether more blocks follow. None when `num` is past
  /// the end.
  pub fn chunk(body: &[u8], size: u16, num: u32) -> Option<(&[u8], bool)> {
    let size = size as usize;
    let start = num as usize * size;

    if start >= body.len() && !(body.is_empty() && num == 0) {
      return None;
    }

    let end = (start + size).min(body.len());
    Some((&body[start..end], end < body.len()))
  }
}

/// The stateful junction between a request and its response(s).
///
/// Each layer's state is a typed slot here rather than a dynamic
/// scratch map: the reliability slot [`Exchange::con`], the observe
/// slot [`Exchange::relation`], the re-registration deadline
/// [`Exchange::reregister_at`] and the block-wise slot
/// [`Exchange::block`].
#[derive(Debug)]
pub struct Exchange<C: Clock> {
  /// Who created this exchange
  pub origin: Origin,
  /// The peer at the other end
  pub addr: SocketAddr,
  /// The request as currently on the wire (after fragmentation etc.)
  pub request: Message,
  /// For remote-origin exchanges: what we answered (ACK at first,
  /// then the actual response), replayed on duplicates
  pub response: Option<Message>,
  /// Responses that passed every layer and await delivery
  pub ready: Vec<Message>,
  /// IDs of CON/NON messages received for this exchange, so their
  /// retransmissions are recognized as duplicates
  pub rx_ids: Vec<Id>,
  /// When this exchange was created
  pub created_at: Instant<C>,
  /// Set once the exchange will produce no further responses
  pub completed: Option<Result<(), Failure>>,
  /// When [`Exchange::completed`] was set (drives eviction)
  pub completed_at: Option<Instant<C>>,
  /// Reliability slot
  pub con: Option<ConState<C>>,
  /// Observe slot
  pub relation: Option<Relation<C>>,
  /// Re-registration slot
  pub reregister_at: Option<Instant<C>>,
  /// Block-wise slot
  pub block: Option<BlockState<C>>,
  /// Observer slot
  pub watch: Watch,
}

impl<C: Clock> Exchange<C> {
  /// Create an exchange for a request
  pub fn new(origin: Origin, addr: SocketAddr, request: Message, now: Instant<C>) -> Self {
    let con = match request.ty {
      | Type::Con => Some(ConState::Fresh),
      | _ => None,
    };

    Self { origin,
           addr,
           request,
           response: None,
           ready: Vec::new(),
           rx_ids: Vec::new(),
           created_at: now,
           completed: None,
           completed_at: None,
           con,
           relation: None,
           reregister_at: None,
           block: None,
           watch: Watch::none() }
  }

  /// The token correlating responses to this exchange
  pub fn token(&self) -> Token {
    self.request.token
  }

  /// The current request's message ID
  pub fn id(&self) -> Id {
    self.request.id
  }

  /// Record that the exchange is over.
  ///
  /// The first outcome wins; later completions are ignored.
  pub fn complete(&mut self, now: Instant<C>, outcome: Result<(), Failure>) {
    if self.completed.is_none() {
      self.completed = Some(outcome);
      self.completed_at = Some(now);
    }
  }

  /// Will this exchange produce further responses?
  pub fn is_completed(&self) -> bool {
    self.completed.is_some()
  }

  /// Is there an active (not cancelled) observe relation?
  pub fn observing(&self) -> bool {
    self.relation.as_ref().map(|r| !r.cancelled).unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::ClockMock;

  #[test]
  fn freshness_by_counter() {
    let mut rel = Relation::<ClockMock>::new(ClockMock::instant(0));

    // anything beats no counter
    assert!(rel.fresher(5, ClockMock::instant(0)));
    rel.last_counter = Some(5);

    assert!(rel.fresher(9, ClockMock::instant(1_000)));
    rel.last_counter = Some(9);

    // behind by less than 2^23 within the 128s window: stale
    assert!(!rel.fresher(7, ClockMock::instant(2_000)));

    // same counter: stale
    assert!(!rel.fresher(9, ClockMock::instant(2_000)));
  }

  #[test]
  fn freshness_by_wraparound() {
    let mut rel = Relation::<ClockMock>::new(ClockMock::instant(0));
    rel.last_counter = Some(0xFF_FF_F0);

    // wrapped back to a small number: ahead, not behind
    assert!(rel.fresher(3, ClockMock::instant(1_000)));
  }

  #[test]
  fn freshness_by_age() {
    let mut rel = Relation::<ClockMock>::new(ClockMock::instant(0));
    rel.last_counter = Some(9);
    rel.last_at = ClockMock::instant(0);

    // counter says stale but 128s have passed
    assert!(!rel.fresher(7, ClockMock::instant(128_000)));
    assert!(rel.fresher(7, ClockMock::instant(128_001)));
  }

  #[test]
  fn chunking() {
    let body: Vec<u8> = (0..100).collect();

    let (c0, more) = BlockState::<ClockMock>::chunk(&body, 32, 0).unwrap();
    assert_eq!((c0.len(), more), (32, true));

    let (c3, more) = BlockState::<ClockMock>::chunk(&body, 32, 3).unwrap();
    assert_eq!((c3.len(), more), (4, false));
    assert_eq!(c3, &[96, 97, 98, 99]);

    assert!(BlockState::<ClockMock>::chunk(&body, 32, 4).is_none());
  }

  #[test]
  fn assembled_joins_in_order() {
    let mut st = BlockState::<ClockMock>::new(ClockMock::instant(0),
                                              Milliseconds(1_000));
    st.pieces.insert(1, std_alloc::vec![3, 4]);
    st.pieces.insert(0, std_alloc::vec![1, 2]);
    assert_eq!(st.assembled(), std_alloc::vec![1, 2, 3, 4]);
  }
}
