//! The token bucket itself, and the blocking half of admission control.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use educe::Educe;
use event_listener::Listener as _;
use tracing::{debug, info, trace, warn};

use crate::builder::TokenBucketBuilder;
use crate::clock::{duration_to_micros, Clock, SystemClock};
use crate::config::TokenBucketConfig;
use crate::err::Error;
use crate::io::ThrottledWrite;
use crate::ops::{EngineId, IoOp, OpStart, OpStats};
use crate::state::{calculate_refill_bytes_per_period, BucketState, SINGLE_REQUEST_BYTES};
use crate::tune::{RateEstimator, TuneState};

/// The column family that owns a [`TokenBucket`].
///
/// A bucket only keeps a weak reference to its owner.  Once the owner is
/// dropped, the bucket stops granting bytes.
pub trait ColumnFamily: Send + Sync {
    /// Return a human-readable name for this column family, for logging.
    fn name(&self) -> &str;
}

/// A token bucket limiting the I/O of one column family.
///
/// Callers ask permission to consume bytes with [`request`](Self::request),
/// which blocks until those bytes have been granted.  Requests are served in
/// the order they arrive.
///
/// There is no background thread.  The bucket refills itself whenever it is
/// used, and the oldest blocked requester wakes up on its own when the next
/// refill is due.
#[derive(Educe)]
#[educe(Debug)]
pub struct TokenBucket<C: Clock = SystemClock> {
    /// Everything that changes.
    state: Mutex<BucketState>,
    /// Where we get the time from.
    #[educe(Debug(ignore))]
    clock: C,
    /// The column family that owns us.
    #[educe(Debug(ignore))]
    owner: Weak<dyn ColumnFamily>,
    /// The owner's name, for logging.
    cf_name: String,
    /// Who recommends new rates, if auto-tuning.
    #[educe(Debug(ignore))]
    estimator: Option<Weak<dyn RateEstimator>>,
}

impl TokenBucket {
    /// Return a builder for a bucket owned by `owner`.
    pub fn builder(owner: Weak<dyn ColumnFamily>) -> TokenBucketBuilder {
        TokenBucketBuilder::new(owner)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Assemble a bucket.  The owner has already been checked.
    pub(crate) fn from_parts(
        owner: Weak<dyn ColumnFamily>,
        cf_name: String,
        config: &TokenBucketConfig,
        clock: C,
        estimator: Option<Weak<dyn RateEstimator>>,
    ) -> Self {
        let now = clock.now_micros();
        let period_us = duration_to_micros(config.refill_period()).max(1);
        let rate = config.initial_rate();
        let tune = config
            .auto_tune()
            .then(|| TuneState::new(duration_to_micros(config.tune_period()), now));

        let (burst, floored) = calculate_refill_bytes_per_period(rate, period_us);
        if floored {
            warn!(
                "{}: rate of {} bytes/sec is too low for a {:?} refill period; using {} bytes per period",
                cf_name,
                rate,
                config.refill_period(),
                burst
            );
        }
        if estimator.is_some() && tune.is_none() {
            debug!("{}: rate estimator given, but auto-tuning is off", cf_name);
        }
        debug!(
            "{}: rate limiter created: {} bytes/sec, refill every {:?}, auto-tune {}",
            cf_name,
            rate,
            config.refill_period(),
            tune.is_some()
        );

        TokenBucket {
            state: Mutex::new(BucketState::new(rate, period_us, tune, now)),
            clock,
            owner,
            cf_name,
            estimator,
        }
    }

    /// Lock the state, shutting down if our owner has gone away.
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        let mut state = self.state.lock().expect("poisoned lock");
        if state.is_open() && self.owner.strong_count() == 0 {
            let released = state.invalidate();
            info!(
                "{}: column family dropped; rate limiter released {} waiters",
                self.cf_name, released
            );
        }
        state
    }

    /// Lock the state for reading only.
    ///
    /// Unlike [`lock`](Self::lock), this never releases anybody.
    fn peek(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().expect("poisoned lock")
    }

    /// Block until `bytes` have been granted.
    ///
    /// A request for zero bytes is a request for a single unit.
    ///
    /// Returns [`Error::ShutdownInProgress`] if the bucket stopped before the
    /// bytes could be granted; in that case nothing was granted.
    pub fn request(&self, bytes: u64) -> Result<(), Error> {
        let bytes = if bytes == 0 {
            SINGLE_REQUEST_BYTES
        } else {
            bytes
        };
        let outcome = self.admit(bytes);
        self.maybe_tune();
        outcome
    }

    /// Implementation for `request`.
    fn admit(&self, bytes: u64) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.is_open() {
            return Err(Error::ShutdownInProgress);
        }
        state.refill(self.clock.now_micros());
        if state.try_grant(bytes) {
            return Ok(());
        }

        let ticket = state.enqueue(bytes);
        trace!(
            "{}: request {} for {} bytes queued behind {} others",
            self.cf_name,
            ticket,
            bytes,
            state.requests_to_wait() - 1
        );

        loop {
            if state.is_granted(ticket) {
                return Ok(());
            }
            if !state.is_open() {
                return Err(Error::ShutdownInProgress);
            }
            // Only shutdown takes a waiter out of the queue without granting it.
            let Some(listener) = state.listen(ticket) else {
                return Err(Error::ShutdownInProgress);
            };
            // The leader does the refills nobody else is around to do.
            let timeout = state
                .is_leader(ticket)
                .then(|| Duration::from_micros(state.micros_until_refill(self.clock.now_micros())));

            drop(state);
            match timeout {
                Some(timeout) => {
                    let _ = listener.wait_timeout(timeout);
                }
                None => listener.wait(),
            }

            state = self.lock();
            state.refill(self.clock.now_micros());
        }
    }

    /// Add any refills that are due, and serve waiting requests.
    ///
    /// Return true if at least one refill period had elapsed.  This is done
    /// automatically by [`request`](Self::request) and
    /// [`record`](Self::record), but an owner may also call it from its own
    /// periodic bookkeeping.
    pub fn refill(&self) -> bool {
        let now = self.clock.now_micros();
        self.lock().refill(now)
    }

    /// Note that an operation of kind `op`, issued by `engine`, is starting.
    pub fn begin(&self, op: IoOp, engine: EngineId) -> OpStart {
        OpStart {
            op,
            engine,
            begin_us: self.clock.now_micros(),
        }
    }

    /// Note that the operation begun as `started` has finished, having
    /// consumed `bytes`.
    ///
    /// Pass zero bytes to record only the elapsed time.  This does not affect
    /// [`total_bytes_through`](Self::total_bytes_through), which only counts
    /// granted bytes.
    pub fn record(&self, started: OpStart, bytes: u64) {
        let now = self.clock.now_micros();
        {
            let mut state = self.lock();
            state.record(started, bytes, now);
            state.refill(now);
        }
        trace!(
            "{}: {} by {} finished: {} bytes in {}us",
            self.cf_name,
            started.op,
            started.engine,
            bytes,
            now.saturating_sub(started.begin_us)
        );
        self.maybe_tune();
    }

    /// If the tuning window has closed, ask the estimator for a new rate.
    fn maybe_tune(&self) {
        let now = self.clock.now_micros();
        let window = {
            let mut state = self.lock();
            if !state.is_open() {
                return;
            }
            state.take_tune_window(now)
        };
        let Some((window, generation)) = window else {
            return;
        };

        let Some(estimator) = self.estimator.as_ref().and_then(Weak::upgrade) else {
            debug!(
                "{}: no rate estimator available; keeping {} bytes/sec",
                self.cf_name, window.current_rate
            );
            return;
        };
        let rate = match estimator.estimate(&window) {
            Ok(rate) => rate,
            Err(e) => {
                debug!(
                    "{}: not tuning this window ({}); keeping {} bytes/sec",
                    self.cf_name, e, window.current_rate
                );
                return;
            }
        };

        let (outcome, burst) = {
            let mut state = self.lock();
            if !state.is_open() {
                return;
            }
            let outcome = state.apply_estimate(generation, rate);
            (outcome, state.refill_bytes_per_period())
        };
        match outcome {
            Some(floored) => self.log_rate_change(window.current_rate, rate, floored, burst),
            None => debug!(
                "{}: rate changed while estimating; dropping estimate of {} bytes/sec",
                self.cf_name, rate
            ),
        }
    }

    /// Change the rate of this bucket.
    ///
    /// Takes effect at the next refill.  A rate too low to give
    /// [`MIN_REFILL_BYTES_PER_PERIOD`](crate::MIN_REFILL_BYTES_PER_PERIOD)
    /// bytes per period is rounded up.
    pub fn set_bytes_per_second(&self, bytes_per_second: u64) {
        let (old, floored, burst) = {
            let mut state = self.lock();
            let old = state.rate_bytes_per_sec();
            let floored = state.set_rate(bytes_per_second);
            (old, floored, state.refill_bytes_per_period())
        };
        self.log_rate_change(old, bytes_per_second, floored, burst);
    }

    /// Log that the rate went from `old` to `new`.
    fn log_rate_change(&self, old: u64, new: u64, floored: bool, burst: u64) {
        if floored {
            warn!(
                "{}: rate of {} bytes/sec is too low; using {} bytes per period",
                self.cf_name, new, burst
            );
        }
        debug!(
            "{}: rate changed from {} to {} bytes/sec",
            self.cf_name, old, new
        );
    }

    /// Stop this bucket.
    ///
    /// Every blocked request returns [`Error::ShutdownInProgress`], as does
    /// every later one.  Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("poisoned lock");
        if state.is_stopped() {
            return;
        }
        let released = state.shutdown();
        info!(
            "{}: rate limiter shutting down; released {} waiters",
            self.cf_name, released
        );
    }

    /// Return the largest number of bytes that can be granted without waiting.
    pub fn single_burst_bytes(&self) -> u64 {
        self.peek().refill_bytes_per_period()
    }

    /// Return the total number of bytes granted so far.
    pub fn total_bytes_through(&self) -> u64 {
        self.peek().total_bytes_through()
    }

    /// Return the total number of requests granted so far.
    pub fn total_requests(&self) -> u64 {
        self.peek().total_requests()
    }

    /// Return the current rate, in bytes per second.
    pub fn bytes_per_second(&self) -> u64 {
        self.peek().rate_bytes_per_sec()
    }

    /// Return the number of bytes that could be granted right now.
    pub fn available_bytes(&self) -> u64 {
        self.peek().available_bytes()
    }

    /// Return the number of requests that are blocked.
    pub fn waiting_requests(&self) -> usize {
        self.peek().requests_to_wait()
    }

    /// Return the counters for operations of kind `op`.
    pub fn op_stats(&self, op: IoOp) -> OpStats {
        self.peek().op_stats(op)
    }

    /// Return false once this bucket will not grant anything any more.
    ///
    /// This includes the case where the owning column family is gone, even
    /// if no request has noticed yet.
    pub fn is_valid(&self) -> bool {
        self.peek().is_open() && self.owner.strong_count() > 0
    }

    /// Return the current time of this bucket's clock, in microseconds.
    pub fn time(&self) -> u64 {
        self.clock.now_micros()
    }

    /// Return the name of the column family that owns this bucket.
    pub fn cf_name(&self) -> &str {
        &self.cf_name
    }

    /// Wrap `io` so that everything written to it goes through this bucket.
    ///
    /// All writers made from the same bucket share its budget.
    pub fn limit_write<W>(self: &Arc<Self>, op: IoOp, engine: EngineId, io: W) -> ThrottledWrite<W, C> {
        ThrottledWrite::new(Arc::clone(self), op, engine, io)
    }
}

impl<C: Clock> Drop for TokenBucket<C> {
    fn drop(&mut self) {
        // Nobody can be blocked in `request` while we are being dropped.
        if let Ok(state) = self.state.get_mut() {
            state.shutdown();
        }
    }
}
