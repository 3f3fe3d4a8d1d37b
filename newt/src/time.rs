use core::cmp::Reverse;

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use no_std_net::SocketAddr;
use newt_msg::{Id, Token};
use std_alloc::collections::BinaryHeap;

/// A duration, in milliseconds
pub type Millis = embedded_time::duration::Milliseconds<u64>;

/// Supertrait of [`embedded_time::Clock`] pinning the
/// type of "ticks" to u64
pub trait Clock: embedded_time::Clock<T = u64> {}
impl<C: embedded_time::Clock<T = u64>> Clock for C {}

/// Timeout configuration allowing for "never time out" as an option
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum Timeout {
  /// Timeout after some number of milliseconds has elapsed
  Millis(u64),
  /// Never time out
  Never,
}

/// Something the endpoint needs to do at a later point in time.
///
/// All of the runtime's timers are entries of this type in one
/// [`Timers`] priority queue owned by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerEvent {
  /// A confirmable message may need to be sent again
  Retransmit {
    /// The peer the message was sent to
    addr: SocketAddr,
    /// The message's ID
    id: Id,
  },
  /// Walk the exchange store and evict expired entries
  Sweep,
  /// An observed resource has gone quiet for longer than its
  /// representation is fresh; re-register interest
  Reregister {
    /// The peer owning the resource
    addr: SocketAddr,
    /// The token of the observing exchange
    token: Token,
  },
  /// Partially reassembled block-wise state has outlived
  /// `blockwise_status_lifetime`
  BlockwiseExpiry {
    /// The peer of the transfer
    addr: SocketAddr,
    /// The token of the transferring exchange
    token: Token,
  },
}

/// The endpoint's single monotonic timer queue.
///
/// Entries fire in due-time order; ties fire in insertion order.
#[derive(Debug)]
pub struct Timers<C: Clock> {
  heap: BinaryHeap<Reverse<(Instant<C>, u64, TimerEvent)>>,
  seq: u64,
}

impl<C: Clock> Default for Timers<C> {
  fn default() -> Self {
    Self { heap: BinaryHeap::new(),
           seq: 0 }
  }
}

impl<C: Clock> Timers<C> {
  /// Create an empty queue
  pub fn new() -> Self {
    Self::default()
  }

  /// Arm `ev` to fire at `at`
  pub fn schedule(&mut self, at: Instant<C>, ev: TimerEvent) {
    self.seq += 1;
    self.heap.push(Reverse((at, self.seq, ev)));
  }

  /// Arm `ev` to fire `after` from `now`
  pub fn schedule_after(&mut self, now: Instant<C>, after: Millis, ev: TimerEvent) {
    self.schedule(now + Milliseconds(after.0), ev);
  }

  /// Pop the next entry that is due at `now`, if any
  pub fn pop_due(&mut self, now: Instant<C>) -> Option<TimerEvent> {
    match self.heap.peek() {
      | Some(Reverse((at, _, _))) if *at <= now => {
        self.heap.pop().map(|Reverse((_, _, ev))| ev)
      },
      | _ => None,
    }
  }

  /// Drop all entries matching a predicate (used when an exchange is
  /// cancelled and its timers must go with it)
  pub fn cancel(&mut self, mut f: impl FnMut(&TimerEvent) -> bool) {
    self.heap.retain(|Reverse((_, _, ev))| !f(ev));
  }

  /// When the earliest entry is due, if any
  pub fn next_due(&self) -> Option<Instant<C>> {
    self.heap.peek().map(|Reverse((at, _, _))| *at)
  }

  /// Number of armed entries
  pub fn len(&self) -> usize {
    self.heap.len()
  }

  /// Is the queue empty?
  pub fn is_empty(&self) -> bool {
    self.heap.is_empty()
  }
}
