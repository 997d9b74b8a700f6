use core::ops::RangeInclusive;

use embedded_time::duration::Milliseconds;
use embedded_time::{Clock, Instant};
use rand::{Rng, SeedableRng};

/// A non-blocking timer that allows a fixed-delay or exponential-backoff retry,
/// that lives alongside some operation to retry.
///
/// It does not _contain_ the work to be done (e.g. `Box<fn()>`); the owner
/// polls it with the current time and reacts to [`YouShould`].
///
/// The exponential defaults used by the CoAP engine implement the RFC 7252
/// transmission parameters: the first retransmission fires a uniformly random
/// `ACK_TIMEOUT..=ACK_TIMEOUT * ACK_RANDOM_FACTOR` (2000..=3000 ms) after the
/// initial send, and each retransmission after that doubles the wait.
#[derive(Debug, Clone, Copy)]
pub struct RetryTimer<C: Clock<T = u64>> {
  start: Instant<C>,
  init: Milliseconds<u64>,
  strategy: Strategy,
  attempts: Attempts,
  max_attempts: Attempts,
}

/// A number of attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempts(pub u16);

impl core::ops::Sub for Attempts {
  type Output = Attempts;

  fn sub(self, rhs: Self) -> Self::Output {
    Attempts(self.0.saturating_sub(rhs.0))
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
  /// Create a new retrier
  pub fn new(start: Instant<C>, strategy: Strategy, max_attempts: Attempts) -> Self {
    let init = if strategy.has_jitter() {
      let seed = Milliseconds::<u64>::try_from(start.duration_since_epoch()).map(|Milliseconds(ms)| ms)
                                                                            .unwrap_or_default();
      let mut rand = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
      Milliseconds(rand.gen_range(strategy.range()))
    } else {
      Milliseconds(*strategy.range().start())
    };

    Self { start,
           strategy,
           init,
           max_attempts,
           attempts: Attempts(1) }
  }

  /// When the thing we keep trying fails, invoke this to
  /// tell the retrytimer "it failed again! what do I do??"
  ///
  /// Returns `nb::Error::WouldBlock` when we have not yet
  /// waited the appropriate amount of time to retry.
  ///
  /// `max_attempts` bounds the number of _retries_; with
  /// `Attempts(4)` the initial send is followed by at most 4
  /// retransmissions before [`YouShould::Cry`].
  pub fn what_should_i_do(&mut self,
                          now: Instant<C>)
                          -> nb::Result<YouShould, core::convert::Infallible> {
    if self.attempts > self.max_attempts {
      Ok(YouShould::Cry)
    } else if self.is_ready(self.millis_waited(now), self.attempts.0) {
      self.attempts.0 += 1;
      Ok(YouShould::Retry)
    } else {
      Err(nb::Error::WouldBlock)
    }
  }

  /// Milliseconds from `now` until the next attempt is due.
  ///
  /// Zero means "due now" (or overdue). Used by owners that arm
  /// wall-clock timers rather than polling.
  pub fn millis_until_retry(&self, now: Instant<C>) -> u64 {
    let due = self.total_delay(self.attempts.0);
    due.saturating_sub(self.millis_waited(now).0)
  }

  /// Check if the strategy says an appropriate time has passed
  pub fn is_ready(&self, Milliseconds(time_passed): Milliseconds<u64>, attempts: u16) -> bool {
    attempts == 0 || time_passed >= self.total_delay(attempts)
  }

  fn total_delay(&self, attempts: u16) -> u64 {
    match self.strategy {
      | Strategy::Delay { .. } => self.init.0 * attempts as u64,
      | Strategy::Exponential { .. } => Strategy::total_delay_exp(self.init, attempts),
    }
  }

  fn millis_waited(&self, now: Instant<C>) -> Milliseconds<u64> {
    now.checked_duration_since(&self.start)
       .and_then(|dur| Milliseconds::try_from(dur).ok())
       .unwrap_or(Milliseconds(0))
  }
}

/// Strategy to employ when retrying
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
  /// Generate a random delay between `init_min` and `init_max`,
  /// and wait until this delay has passed between attempts.
  ///
  /// After each failed attempt, double the delay before retrying again.
  Exponential {
    /// Minimum (inclusive) delay for second attempt
    init_min: Milliseconds<u64>,
    /// Maximum (inclusive) delay for second attempt
    init_max: Milliseconds<u64>,
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
                             init_max: Milliseconds(max), } => (min..=max),
    }
  }

  /// Get the amount of time this strategy will take if all attempts fail
  pub fn max_time(&self, max_attempts: Attempts) -> Milliseconds<u64> {
    Milliseconds(match self {
                   | Self::Exponential { init_max, .. } => {
                     Self::total_delay_exp(*init_max, max_attempts.0)
                   },
                   | Self::Delay { max: Milliseconds(max),
                                   .. } => max * max_attempts.0 as u64,
                 })
  }

  /// Given the initial delay and number of attempts that have been performed,
  /// yields the total time waited once the next retry is due.
  const fn total_delay_exp(Milliseconds(init): Milliseconds<u64>, attempt: u16) -> u64 {
    // | attempt | total delay      |
    // | 1       | init             |
    // | 2       | init * 2         |
    // | 3       | init * 4         |
    // | ...     | ...              |
    // | n       | init * 2^(n-1)   |
    if attempt == 0 {
      0
    } else {
      init * 2u64.pow((attempt - 1) as u32)
    }
  }
}

#[cfg(test)]
mod test {
  use embedded_time::rate::Fraction;

  use super::*;

  #[derive(Debug)]
  pub struct FakeClock(pub core::cell::Cell<u64>);

  impl FakeClock {
    pub fn new() -> Self {
      Self(core::cell::Cell::new(0))
    }
  }

  impl Clock for FakeClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1000);

    fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
      Ok(Instant::new(self.0.get()))
    }
  }

  #[test]
  fn delay_retrier() {
    let clock = FakeClock::new();
    let now = || clock.try_now().unwrap();
    let mut retry = RetryTimer::new(now(),
                                    Strategy::Delay { min: Milliseconds(1000),
                                                      max: Milliseconds(1000) },
                                    Attempts(4));

    // attempt 1 happens before asking what_should_i_do

    clock.0.set(999);
    assert_eq!(retry.what_should_i_do(now()).unwrap_err(),
               nb::Error::WouldBlock);

    clock.0.set(1000);
    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);
    // Fails again (attempt 2)

    clock.0.set(1999);
    assert_eq!(retry.what_should_i_do(now()).unwrap_err(),
               nb::Error::WouldBlock);

    clock.0.set(2000);
    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);
    // Fails again (attempt 3)

    clock.0.set(10_000);
    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);
    // Fails again (attempt 4)

    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);
    // Fails again (attempt 5)

    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Cry);
  }

  #[test]
  fn exponential_retrier() {
    let clock = FakeClock::new();
    let now = || clock.try_now().unwrap();
    let mut retry = RetryTimer::new(now(),
                                    Strategy::Exponential { init_min: Milliseconds(1000),
                                                            init_max: Milliseconds(1000) },
                                    Attempts(5));

    // attempt 1 happens before asking what_should_i_do

    clock.0.set(999);
    assert_eq!(retry.what_should_i_do(now()).unwrap_err(),
               nb::Error::WouldBlock);

    clock.0.set(1000);
    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);

    clock.0.set(1999);
    assert_eq!(retry.what_should_i_do(now()).unwrap_err(),
               nb::Error::WouldBlock);

    clock.0.set(2000);
    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);

    clock.0.set(3999);
    assert_eq!(retry.what_should_i_do(now()).unwrap_err(),
               nb::Error::WouldBlock);

    clock.0.set(4000);
    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);

    clock.0.set(8000);
    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);

    clock.0.set(16_000);
    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Retry);

    assert_eq!(retry.what_should_i_do(now()).unwrap(), YouShould::Cry);
  }

  #[test]
  fn exp_calculation() {
    let init = Milliseconds(100);
    assert_eq!(Strategy::total_delay_exp(init, 1), 100);
    assert_eq!(Strategy::total_delay_exp(init, 2), 200);
    assert_eq!(Strategy::total_delay_exp(init, 3), 400);
  }

  #[test]
  fn millis_until_retry_counts_down() {
    let clock = FakeClock::new();
    let now = || clock.try_now().unwrap();
    let retry = RetryTimer::new(now(),
                                Strategy::Exponential { init_min: Milliseconds(2000),
                                                        init_max: Milliseconds(2000) },
                                Attempts(4));

    assert_eq!(retry.millis_until_retry(now()), 2000);
    clock.0.set(1500);
    assert_eq!(retry.millis_until_retry(now()), 500);
    clock.0.set(2500);
    assert_eq!(retry.millis_until_retry(now()), 0);
  }
}
