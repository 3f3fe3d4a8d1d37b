use core::ops::RangeInclusive;

use embedded_time::duration::Milliseconds;
use embedded_time::{Clock, Instant};
use rand::{Rng, SeedableRng};

/// A non-blocking timer that drives fixed-delay or exponential-backoff
/// retries of some operation living alongside it.
///
/// It does not _contain_ the work to be retried; it just answers
/// "should I do it again yet?". The confirmable-message state machine
/// keeps one of these per in-transit CON.
///
/// The first attempt is assumed to have happened at `start`; retry `k`
/// becomes due once `delay(k)` has elapsed since `start`, where for the
/// exponential strategy `delay(k) = init * scale^(k - 1)` (the RFC7252
/// doubling schedule when `scale` is 2). Once all attempts are spent,
/// the timer answers [`YouShould::Cry`] only after the final backoff
/// window has also passed, so that the last transmission gets a full
/// round-trip's grace before the operation is pronounced dead.
#[derive(Debug)]
pub struct RetryTimer<C: Clock<T = u64>> {
  start: Instant<C>,
  init: Milliseconds<u64>,
  strategy: Strategy,
  attempts: Attempts,
  max_attempts: Attempts,
}

impl<C: Clock<T = u64>> Copy for RetryTimer<C> {}
impl<C: Clock<T = u64>> Clone for RetryTimer<C> {
  fn clone(&self) -> Self {
    *self
  }
}

/// A number of attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempts(pub u16);

impl core::ops::Add for Attempts {
  type Output = Attempts;

  fn add(self, rhs: Self) -> Self {
    Attempts(self.0 + rhs.0)
  }
}

/// Result of [`RetryTimer::what_should_i_do`].
///
/// This tells you if a retry should be attempted or not.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum YouShould {
  /// Attempts have been exhausted and the work that is
  /// being retried should be considered poisoned.
  Cry,
  /// A retry should be performed
  Retry,
}

impl<C: Clock<T = u64>> RetryTimer<C> {
  /// Create a new retrier.
  ///
  /// The first attempt is counted as already performed at `start`.
  pub fn new(start: Instant<C>, strategy: Strategy, max_attempts: Attempts) -> Self {
    Self { start,
           strategy,
           init: if strategy.has_jitter() {
             let ms = Milliseconds::<u64>::try_from(start.duration_since_epoch()).map(|Milliseconds(ms)| ms)
                                                                                 .unwrap_or(0);
             let mut rand = rand_chacha::ChaCha8Rng::seed_from_u64(ms);

             Milliseconds(rand.gen_range(strategy.range()))
           } else {
             Milliseconds(*strategy.range().start())
           },
           max_attempts,
           attempts: Attempts(1) }
  }

  /// When the thing we keep trying fails (or stays quiet), invoke this
  /// to ask the timer what to do about it.
  ///
  /// Returns `nb::Error::WouldBlock` when we have not yet
  /// waited the appropriate amount of time to retry (or, once
  /// attempts are exhausted, to give up).
  pub fn what_should_i_do(&mut self,
                          now: Instant<C>)
                          -> nb::Result<YouShould, core::convert::Infallible> {
    let elapsed: Milliseconds<u64> = (now - self.start).try_into().unwrap_or(Milliseconds(u64::MAX));

    if !self.is_ready(elapsed, self.attempts.0) {
      return Err(nb::Error::WouldBlock);
    }

    if self.attempts >= self.max_attempts {
      Ok(YouShould::Cry)
    } else {
      self.attempts.0 += 1;
      Ok(YouShould::Retry)
    }
  }

  /// Number of attempts performed so far (including the first)
  pub fn attempts(&self) -> Attempts {
    self.attempts
  }

  /// When the next retry (or the final giving-up) becomes due,
  /// measured from the first attempt
  pub fn next_due(&self) -> Milliseconds<u64> {
    Milliseconds(self.strategy.delay_until_attempt(self.init, self.attempts.0))
  }

  /// Absolute instant the next retry (or the final giving-up) becomes due
  pub fn next_due_at(&self) -> Instant<C> {
    self.start + self.next_due()
  }

  /// Check if the strategy says an appropriate time has passed
  /// for attempt number `attempts + 1`
  pub fn is_ready(&self, Milliseconds(time_passed): Milliseconds<u64>, attempts: u16) -> bool {
    if attempts == 0 {
      return true;
    }

    time_passed >= self.strategy.delay_until_attempt(self.init, attempts)
  }
}

/// Strategy to employ when retrying
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
  /// Generate a random initial delay between `init_min` and `init_max`,
  /// and multiply the delay by `scale` after every attempt.
  ///
  /// This is the RFC7252 retransmission schedule when `init_min` is
  /// ACK_TIMEOUT, `init_max` is `ACK_TIMEOUT * ACK_RANDOM_FACTOR`,
  /// and `scale` is ACK_TIMEOUT_SCALE.
  Exponential {
    /// Minimum (inclusive) delay for the second attempt
    init_min: Milliseconds<u64>,
    /// Maximum (inclusive) delay for the second attempt
    init_max: Milliseconds<u64>,
    /// Factor the delay grows by after each attempt
    scale: f32,
  },
  /// Generate a random delay between `min` and `max`,
  /// and wait until this delay has passed between attempts.
  Delay {
    /// Minimum (inclusive) delay for attempts
    min: Milliseconds<u64>,
    /// Maximum (inclusive) delay for attempts
    max: Milliseconds<u64>,
  },
}

impl Strategy {
  /// Are min & max delays the same? if so, we should probably skip the random number generation.
  pub fn has_jitter(&self) -> bool {
    let rng = self.range();
    rng.start() != rng.end()
  }

  /// Get the min & max durations as an inclusive range
  pub fn range(&self) -> RangeInclusive<u64> {
    match self {
      | &Self::Delay { min: Milliseconds(min),
                       max: Milliseconds(max), } => (min..=max),

      | &Self::Exponential { init_min: Milliseconds(min),
                             init_max: Milliseconds(max),
                             .. } => (min..=max),
    }
  }

  /// Time that must have passed since the first attempt before
  /// attempt `attempt + 1` may be performed
  fn delay_until_attempt(&self, Milliseconds(init): Milliseconds<u64>, attempt: u16) -> u64 {
    match self {
      | Self::Delay { .. } => init * attempt as u64,
      | Self::Exponential { scale, .. } => {
        // | attempt | delay since start |
        // | 1       | init              |
        // | 2       | init * scale      |
        // | 3       | init * scale^2    |
        // | n       | init * scale^n-1  |
        (init as f32 * scale.powi(attempt as i32 - 1)) as u64
      },
    }
  }

  /// Get the amount of time this strategy will take if all attempts fail
  pub fn max_time(&self, max_attempts: Attempts) -> Milliseconds<u64> {
    Milliseconds(match self {
                   | Self::Exponential { init_max: Milliseconds(init),
                                         .. } => self.delay_until_attempt(Milliseconds(*init), max_attempts.0),
                   | Self::Delay { max: Milliseconds(max),
                                   .. } => max * max_attempts.0 as u64,
                 })
  }
}
