//! Automatic adjustment of a bucket's rate.
//!
//! The tuner watches how many bytes get [recorded](crate::TokenBucket::record)
//! over a window of time.  When the window closes, it hands what it saw to a
//! [`RateEstimator`] and applies the rate that comes back.  There is no
//! background task: windows are closed lazily from `request` and `record`.

use std::time::Duration;

use crate::err::EstimateError;

/// Something that can recommend a rate for a bucket.
///
/// The bucket holds only a weak reference to its estimator.  If the estimator
/// has gone away, or returns an error, the bucket keeps its current rate.
pub trait RateEstimator: Send + Sync {
    /// Recommend a new rate, in bytes per second, given what happened during
    /// the last tuning window.
    ///
    /// Called at most once per window, never while the bucket is locked.
    fn estimate(&self, window: &TuneWindow) -> Result<u64, EstimateError>;
}

/// What the tuner observed during one window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct TuneWindow {
    /// Bytes recorded during the window.
    pub observed_bytes: u64,
    /// How long the window lasted.
    pub elapsed: Duration,
    /// The rate that was in force during the window.
    pub current_rate: u64,
}

impl TuneWindow {
    /// Return the observed throughput in bytes per second.
    ///
    /// Returns `None` for an empty window.
    pub fn observed_rate(&self) -> Option<u64> {
        let micros = self.elapsed.as_micros();
        if micros == 0 {
            return None;
        }
        let rate = u128::from(self.observed_bytes) * 1_000_000 / micros;
        Some(u64::try_from(rate).unwrap_or(u64::MAX))
    }
}

/// The tuning window of a bucket.
#[derive(Clone, Debug)]
pub(crate) struct TuneState {
    /// Length of a window, in microseconds.
    period_us: u64,
    /// When the current window opened.
    time_us: u64,
    /// Bytes recorded since then.
    bytes: u64,
}

impl TuneState {
    /// Open a first window of `period_us` at `now`.
    pub(crate) fn new(period_us: u64, now: u64) -> Self {
        Self {
            period_us: period_us.max(1),
            time_us: now,
            bytes: 0,
        }
    }

    /// Add `bytes` to the current window.
    pub(crate) fn note_bytes(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Return true if the current window has closed at `now`.
    pub(crate) fn should_tune(&self, now: u64) -> bool {
        now.saturating_sub(self.time_us) >= self.period_us
    }

    /// Close the current window at `now`, and open a new one.
    ///
    /// The window is reset no matter what the estimator later says.
    pub(crate) fn take_window(&mut self, now: u64, current_rate: u64) -> TuneWindow {
        let window = TuneWindow {
            observed_bytes: self.bytes,
            elapsed: Duration::from_micros(now.saturating_sub(self.time_us)),
            current_rate,
        };
        self.time_us = now;
        self.bytes = 0;
        window
    }

    /// Return the bytes recorded in the current window.
    #[cfg(test)]
    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Return when the current window opened.
    #[cfg(test)]
    pub(crate) fn time_us(&self) -> u64 {
        self.time_us
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
    fn window_isolation() {
        let mut t = TuneState::new(1_000_000, 5);
        t.note_bytes(400);
        t.note_bytes(600);
        assert!(!t.should_tune(1_000_004));
        assert!(t.should_tune(1_000_005));

        let w = t.take_window(1_500_005, 77);
        assert_eq!(w.observed_bytes, 1000);
        assert_eq!(w.elapsed, Duration::from_millis(1500));
        assert_eq!(w.current_rate, 77);
        assert_eq!(t.bytes(), 0);
        assert_eq!(t.time_us(), 1_500_005);
        assert!(!t.should_tune(1_500_006));
    }

    #[test]
    fn observed_rate() {
        let w = TuneWindow {
            observed_bytes: 3_000,
            elapsed: Duration::from_millis(500),
            current_rate: 0,
        };
        assert_eq!(w.observed_rate(), Some(6_000));

        let w = TuneWindow {
            elapsed: Duration::ZERO,
            ..w
        };
        assert_eq!(w.observed_rate(), None);
    }
}
