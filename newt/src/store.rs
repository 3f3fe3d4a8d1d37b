use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use newt_msg::{Id, Token};
use no_std_net::SocketAddr;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std_alloc::collections::BTreeMap;
use std_alloc::vec::Vec;

use crate::config::Config;
use crate::exchange::Exchange;
use crate::time::{Clock, Millis};

/// Handle to a live exchange in the [`Store`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key(usize);

/// The set of live exchanges, reachable through two indices:
///
/// - `by_id: (peer, message-id) -> exchange` matches ACK/RST to the
///   CON they confirm and detects duplicate CON/NONs from peers
/// - `by_token: (peer, token) -> exchange` matches responses (which
///   may arrive in separate messages long after the triggering ACK)
///   to their request, and correlates observe notifications
///
/// The store also owns message-ID and token allocation, because both
/// must avoid values that are live in the indices.
#[derive(Debug)]
pub struct Store<C: Clock> {
  slots: Vec<Option<Exchange<C>>>,
  by_id: BTreeMap<(SocketAddr, Id), Key>,
  by_token: BTreeMap<(SocketAddr, Token), Key>,
  next_ids: BTreeMap<SocketAddr, Id>,
  rng: ChaCha8Rng,
  random_id_start: bool,
  random_tokens: bool,
  token_counter: u64,
}

impl<C: Clock> Store<C> {
  /// Create an empty store configured by `cfg`
  pub fn new(cfg: &Config) -> Self {
    Self { slots: Vec::new(),
           by_id: BTreeMap::new(),
           by_token: BTreeMap::new(),
           next_ids: BTreeMap::new(),
           rng: ChaCha8Rng::seed_from_u64(cfg.msg.token_seed as u64),
           random_id_start: cfg.msg.use_random_id_start,
           random_tokens: cfg.msg.use_random_token_start,
           token_counter: 0 }
  }

  /// Track a new exchange, indexing its current ID and token.
  ///
  /// `Id(0)` on a local-origin exchange is the "not yet assigned"
  /// placeholder and is not indexed; the real ID is registered via
  /// [`Store::index_id`] once allocated.
  pub fn insert(&mut self, ex: Exchange<C>) -> Key {
    let addr = ex.addr;
    let id = ex.id();
    let token = ex.token();
    let skip_id = ex.origin == crate::exchange::Origin::Local && id == Id(0);

    let key = match self.slots.iter().position(Option::is_none) {
      | Some(ix) => {
        self.slots[ix] = Some(ex);
        Key(ix)
      },
      | None => {
        self.slots.push(Some(ex));
        Key(self.slots.len() - 1)
      },
    };

    if !skip_id {
      self.by_id.insert((addr, id), key);
    }
    self.by_token.insert((addr, token), key);
    key
  }

  /// Add another message-ID mapping for an exchange (follow-up
  /// messages of one exchange each get their own ID, and all of them
  /// participate in duplicate detection until swept)
  pub fn index_id(&mut self, key: Key, addr: SocketAddr, id: Id) {
    self.by_id.insert((addr, id), key);
  }

  /// The exchange a message ID belongs to
  pub fn by_id(&self, addr: SocketAddr, id: Id) -> Option<Key> {
    self.by_id.get(&(addr, id)).copied()
  }

  /// The exchange a token belongs to
  pub fn by_token(&self, addr: SocketAddr, token: Token) -> Option<Key> {
    self.by_token.get(&(addr, token)).copied()
  }

  /// Borrow an exchange
  pub fn get(&self, key: Key) -> Option<&Exchange<C>> {
    self.slots.get(key.0).and_then(Option::as_ref)
  }

  /// Mutably borrow an exchange
  pub fn get_mut(&mut self, key: Key) -> Option<&mut Exchange<C>> {
    self.slots.get_mut(key.0).and_then(Option::as_mut)
  }

  /// Drop an exchange and every index entry pointing at it
  pub fn remove(&mut self, key: Key) -> Option<Exchange<C>> {
    let ex = self.slots.get_mut(key.0).and_then(Option::take);

    if ex.is_some() {
      self.by_id.retain(|_, k| *k != key);
      self.by_token.retain(|_, k| *k != key);
    }

    ex
  }

  /// Handles to every live exchange
  pub fn keys(&self) -> Vec<Key> {
    self.slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_some())
        .map(|(ix, _)| Key(ix))
        .collect()
  }

  /// Allocate a message ID for a conversation with `addr`.
  ///
  /// IDs count up modulo 2^16 per peer, starting at a random value
  /// when `use_random_id_start` is configured, and skip over IDs
  /// still live in the `by_id` index for that peer. `Id(0)` is never
  /// produced; it is the "not yet assigned" placeholder.
  pub fn next_id(&mut self, addr: SocketAddr) -> Id {
    let start = match self.next_ids.get(&addr) {
      | Some(id) => *id,
      | None if self.random_id_start => Id(self.rng.gen()),
      | None => Id(1),
    };

    let mut candidate = start;
    while candidate == Id(0) || self.by_id.contains_key(&(addr, candidate)) {
      candidate = candidate.next();

      if candidate == start {
        // every ID is live; reuse the oldest rather than spin
        break;
      }
    }

    self.next_ids.insert(addr, candidate.next());
    candidate
  }

  /// Allocate a token for a conversation with `addr`, unique among
  /// live `by_token` entries for that peer.
  ///
  /// Tokens are random 8-byte values by default; with
  /// `use_random_token_start` off they count up from the seed, which
  /// makes runs reproducible.
  pub fn next_token(&mut self, addr: SocketAddr) -> Token {
    loop {
      let token = if self.random_tokens {
        Token::from_bytes(&self.rng.gen::<u64>().to_be_bytes())
      } else {
        self.token_counter += 1;
        Token::from_bytes(&self.token_counter.to_be_bytes())
      };

      if !self.by_token.contains_key(&(addr, token)) {
        return token;
      }
    }
  }

  /// Mark-and-sweep pass: evict exchanges that completed more than
  /// `lifetime` ago. Returns how many were evicted.
  pub fn sweep(&mut self, now: Instant<C>, lifetime: Millis) -> usize {
    let expired: Vec<Key> =
      self.slots
          .iter()
          .enumerate()
          .filter_map(|(ix, s)| {
            s.as_ref()
             .and_then(|ex| ex.completed_at)
             .filter(|done| now >= *done + Milliseconds(lifetime.0))
             .map(|_| Key(ix))
          })
          .collect();

    let n = expired.len();
    expired.into_iter().for_each(|k| {
                         self.remove(k);
                       });
    n
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::{Code, Message, Type};

  use super::*;
  use crate::exchange::Origin;
  use crate::test::{dummy_addr, dummy_addr_2, ClockMock};

  fn cfg_deterministic() -> Config {
    let mut cfg = Config::default();
    cfg.msg.use_random_id_start = false;
    cfg.msg.use_random_token_start = false;
    cfg
  }

  fn ex(addr: no_std_net::SocketAddr, id: Id, token: Token) -> Exchange<ClockMock> {
    Exchange::new(Origin::Local,
                  addr,
                  Message::new(Type::Con, Code::GET, id, token),
                  ClockMock::instant(0))
  }

  #[test]
  fn indices_point_at_the_same_exchange() {
    let mut store = Store::<ClockMock>::new(&cfg_deterministic());
    let token = Token::from_bytes(&[1]);
    let key = store.insert(ex(dummy_addr(), Id(7), token));

    assert_eq!(store.by_id(dummy_addr(), Id(7)), Some(key));
    assert_eq!(store.by_token(dummy_addr(), token), Some(key));
    assert_eq!(store.by_id(dummy_addr_2(), Id(7)), None);

    store.remove(key);
    assert_eq!(store.by_id(dummy_addr(), Id(7)), None);
    assert_eq!(store.by_token(dummy_addr(), token), None);
  }

  #[test]
  fn id_allocation_skips_live_ids_and_zero() {
    let mut store = Store::<ClockMock>::new(&cfg_deterministic());

    assert_eq!(store.next_id(dummy_addr()), Id(1));
    assert_eq!(store.next_id(dummy_addr()), Id(2));

    // Id(3) is live for this peer; the allocator steps over it
    store.insert(ex(dummy_addr(), Id(3), Token::from_bytes(&[1])));
    assert_eq!(store.next_id(dummy_addr()), Id(4));

    // independent sequence per peer; 0 is never produced
    assert_eq!(store.next_id(dummy_addr_2()), Id(1));
  }

  #[test]
  fn id_allocation_random_start_is_seeded() {
    let cfg = Config::default();
    let a = Store::<ClockMock>::new(&cfg).next_id(dummy_addr());
    let b = Store::<ClockMock>::new(&cfg).next_id(dummy_addr());
    assert_eq!(a, b);
  }

  #[test]
  fn token_allocation_avoids_live_tokens() {
    let mut store = Store::<ClockMock>::new(&cfg_deterministic());

    let t1 = store.next_token(dummy_addr());
    store.insert(ex(dummy_addr(), Id(1), t1));

    let t2 = store.next_token(dummy_addr());
    assert_ne!(t1, t2);
  }

  #[test]
  fn sweep_evicts_only_expired_completions() {
    let mut store = Store::<ClockMock>::new(&cfg_deterministic());

    let done = store.insert(ex(dummy_addr(), Id(1), Token::from_bytes(&[1])));
    let open = store.insert(ex(dummy_addr(), Id(2), Token::from_bytes(&[2])));

    store.get_mut(done)
         .unwrap()
         .complete(ClockMock::instant(0), Ok(()));

    // not expired yet
    assert_eq!(store.sweep(ClockMock::instant(100), Milliseconds(247_000)), 0);

    // expired now
    assert_eq!(store.sweep(ClockMock::instant(247_000), Milliseconds(247_000)),
               1);
    assert!(store.get(done).is_none());
    assert!(store.get(open).is_some());
  }
}
