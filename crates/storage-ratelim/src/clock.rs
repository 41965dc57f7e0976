//! Timing sources for the token bucket.
//!
//! The bucket only needs a "monotonic-enough" count of microseconds: it
//! never compares readings from two different clocks, and it never looks at
//! wall-clock time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of microsecond timestamps.
///
/// Readings must never go backwards.  They need not start at zero.
pub trait Clock: Send + Sync + 'static {
    /// Return the current time, in microseconds since some fixed origin.
    fn now_micros(&self) -> u64;
}

/// Convert `d` to whole microseconds, saturating at `u64::MAX`.
pub(crate) fn duration_to_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// A [`Clock`] backed by [`std::time::Instant`].
///
/// This is the default clock.  It has full microsecond precision.
#[derive(Clone, Debug)]
pub struct SystemClock {
    /// Origin of our readings.
    epoch: Instant,
}

impl SystemClock {
    /// Return a new `SystemClock` whose origin is the current instant.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        duration_to_micros(self.epoch.elapsed())
    }
}

/// A [`Clock`] backed by [`coarsetime`].
///
/// Reading this clock is cheaper than reading [`SystemClock`], at the cost of
/// a resolution of a few milliseconds on most platforms.  That is fine for
/// refill periods in the tens of milliseconds or more.
#[derive(Clone, Debug)]
pub struct CoarseClock {
    /// Origin of our readings.
    epoch: coarsetime::Instant,
}

impl CoarseClock {
    /// Return a new `CoarseClock` whose origin is the current instant.
    pub fn new() -> Self {
        Self {
            epoch: coarsetime::Instant::now(),
        }
    }
}

impl Default for CoarseClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for CoarseClock {
    fn now_micros(&self) -> u64 {
        coarsetime::Instant::now()
            .duration_since(self.epoch)
            .as_micros()
    }
}

/// A [`Clock`] that only moves when told to.
///
/// Clones share the same underlying time, so a test can keep one handle and
/// give another to a [`TokenBucket`](crate::TokenBucket).
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    /// Current reading, in microseconds.
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Return a new `ManualClock` that reads `start_micros`.
    pub fn new(start_micros: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_micros)),
        }
    }

    /// Move this clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        let d = duration_to_micros(d);
        // fetch_update cannot fail when the closure always returns Some.
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.saturating_add(d))
            });
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;

    #[test]
    fn manual_clock_is_shared() {
        let a = ManualClock::new(500);
        let b = a.clone();
        assert_eq!(b.now_micros(), 500);

        a.advance(Duration::from_millis(3));
        assert_eq!(b.now_micros(), 3_500);

        b.advance(Duration::MAX);
        assert_eq!(a.now_micros(), u64::MAX);
    }

    #[test]
    fn real_clocks_do_not_go_backwards() {
        let sys = SystemClock::new();
        let coarse = CoarseClock::new();
        let (s1, c1) = (sys.now_micros(), coarse.now_micros());
        std::thread::sleep(Duration::from_millis(20));
        let (s2, c2) = (sys.now_micros(), coarse.now_micros());
        assert!(s2 >= s1 + 20_000);
        assert!(c2 >= c1);
    }

    #[test]
    fn micros_saturate() {
        assert_eq!(duration_to_micros(Duration::from_micros(7)), 7);
        assert_eq!(duration_to_micros(Duration::MAX), u64::MAX);
    }
}
