//! The lock-protected state of a token bucket.
//!
//! Everything in here works on explicit timestamps and never blocks, so that
//! the refill and queueing rules can be tested without threads.  The
//! blocking half lives in [`bucket`](crate::bucket).

use std::collections::VecDeque;

use event_listener::{Event, EventListener};

use crate::ops::{IoOp, OpStart, OpStats, OpTable};
use crate::tune::{TuneState, TuneWindow};

/// The smallest number of bytes that a refill may add.
///
/// Any rate too low to produce this much per period is rounded up to it, so
/// that a misconfigured bucket still trickles instead of stalling forever.
pub const MIN_REFILL_BYTES_PER_PERIOD: u64 = 100;

/// Number of bytes requested by a request for zero bytes.
pub const SINGLE_REQUEST_BYTES: u64 = 1;

/// Return how many bytes each refill of `period_us` should add at `rate`.
///
/// Also return true if the value had to be raised to
/// [`MIN_REFILL_BYTES_PER_PERIOD`].
pub(crate) fn calculate_refill_bytes_per_period(rate: u64, period_us: u64) -> (u64, bool) {
    // dimensional analysis:
    // (bytes / second) * (microseconds) / (microseconds / second) = bytes
    let bytes = u128::from(rate) * u128::from(period_us) / 1_000_000;
    let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
    if bytes < MIN_REFILL_BYTES_PER_PERIOD {
        (MIN_REFILL_BYTES_PER_PERIOD, true)
    } else {
        (bytes, false)
    }
}

/// A requester that is blocked in the queue.
#[derive(Debug)]
struct Waiter {
    /// Position in line.  Tickets are handed out in increasing order.
    ticket: u64,
    /// How many bytes were asked for.
    bytes: u64,
    /// How many of those bytes have not been credited yet.
    outstanding: u64,
    /// Notified when this waiter is granted, released, or becomes the leader.
    event: Event,
}

/// The mutable state of a token bucket.
#[derive(Debug)]
pub(crate) struct BucketState {
    /// Current ceiling, in bytes per second.
    rate_bytes_per_sec: u64,
    /// Bumped every time the rate changes.
    rate_generation: u64,
    /// Length of a refill period, in microseconds.
    refill_period_us: u64,
    /// Bytes added by each refill.  Also the burst limit.
    refill_bytes_per_period: u64,
    /// Bytes that can be granted right now.
    available_bytes: u64,
    /// When the next refill is due.
    next_refill_us: u64,
    /// Number of requests granted so far.
    total_requests: u64,
    /// Number of bytes granted so far.
    total_bytes_through: u64,
    /// Blocked requesters, oldest first.
    queue: VecDeque<Waiter>,
    /// Ticket for the next requester to join the queue.
    next_ticket: u64,
    /// Every ticket up to and including this one has been granted.
    granted_through: u64,
    /// Tuning window, if auto-tuning is enabled.
    tune: Option<TuneState>,
    /// Per-operation counters.
    ops: OpTable,
    /// False once the bucket is torn down.
    valid: bool,
    /// True once shutdown has begun.
    stop: bool,
}

impl BucketState {
    /// Create a new empty bucket whose first refill is due at `now`.
    pub(crate) fn new(rate: u64, refill_period_us: u64, tune: Option<TuneState>, now: u64) -> Self {
        let refill_period_us = refill_period_us.max(1);
        let (refill_bytes_per_period, _) = calculate_refill_bytes_per_period(rate, refill_period_us);
        Self {
            rate_bytes_per_sec: rate,
            rate_generation: 0,
            refill_period_us,
            refill_bytes_per_period,
            available_bytes: 0,
            next_refill_us: now,
            total_requests: 0,
            total_bytes_through: 0,
            queue: VecDeque::new(),
            next_ticket: 1,
            granted_through: 0,
            tune,
            ops: OpTable::default(),
            valid: true,
            stop: false,
        }
    }

    /// Return true if this bucket may still grant bytes.
    pub(crate) fn is_open(&self) -> bool {
        self.valid && !self.stop
    }

    /// Add any refills that are due at `now`, then serve the queue.
    ///
    /// Return true if at least one period had elapsed.  Calling this again
    /// with the same `now` does nothing.
    pub(crate) fn refill(&mut self, now: u64) -> bool {
        if now < self.next_refill_us {
            return false;
        }
        // Same as adding one period's worth at a time, but without looping
        // over long idle gaps.
        let periods = (now - self.next_refill_us) / self.refill_period_us + 1;
        let added = self.refill_bytes_per_period.saturating_mul(periods);
        self.available_bytes = self
            .available_bytes
            .saturating_add(added)
            .min(self.refill_bytes_per_period);
        self.next_refill_us = self
            .next_refill_us
            .saturating_add(periods.saturating_mul(self.refill_period_us));

        self.serve_waiters();
        true
    }

    /// Hand the available balance to queued requesters, in order.
    ///
    /// A waiter is notified only once every byte it asked for is covered.
    /// The first waiter that cannot be covered keeps whatever was available,
    /// and nobody behind it is looked at.
    fn serve_waiters(&mut self) {
        let leader_before = self.queue.front().map(|w| w.ticket);

        loop {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            if front.outstanding > self.available_bytes {
                front.outstanding -= self.available_bytes;
                self.available_bytes = 0;
                break;
            }
            self.available_bytes -= front.outstanding;
            if let Some(waiter) = self.queue.pop_front() {
                self.note_grant(waiter.bytes);
                self.granted_through = waiter.ticket;
                tracing::trace!("granted {} bytes to queued request {}", waiter.bytes, waiter.ticket);
                waiter.event.notify(1);
            }
        }

        // A new leader has to know that it is now responsible for refills.
        if let Some(front) = self.queue.front() {
            if Some(front.ticket) != leader_before {
                front.event.notify(1);
            }
        }
    }

    /// Count a grant of `bytes`.
    fn note_grant(&mut self, bytes: u64) {
        self.total_requests = self.total_requests.saturating_add(1);
        self.total_bytes_through = self.total_bytes_through.saturating_add(bytes);
    }

    /// Grant `bytes` immediately if nobody is waiting and there is enough
    /// balance.  Return true on success.
    pub(crate) fn try_grant(&mut self, bytes: u64) -> bool {
        if !self.queue.is_empty() || self.available_bytes < bytes {
            return false;
        }
        self.available_bytes -= bytes;
        self.note_grant(bytes);
        true
    }

    /// Put a request for `bytes` at the back of the queue, and return its ticket.
    ///
    /// If it lands at the front, it is credited with the current balance
    /// right away.
    pub(crate) fn enqueue(&mut self, bytes: u64) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.queue.push_back(Waiter {
            ticket,
            bytes,
            outstanding: bytes,
            event: Event::new(),
        });
        self.serve_waiters();
        ticket
    }

    /// Return true if the request holding `ticket` has been granted.
    pub(crate) fn is_granted(&self, ticket: u64) -> bool {
        ticket <= self.granted_through
    }

    /// Return true if `ticket` is at the front of the queue.
    pub(crate) fn is_leader(&self, ticket: u64) -> bool {
        self.queue.front().map(|w| w.ticket) == Some(ticket)
    }

    /// Start listening for notifications to the waiter holding `ticket`.
    ///
    /// Return `None` if that waiter is no longer queued.
    pub(crate) fn listen(&self, ticket: u64) -> Option<EventListener> {
        let idx = self
            .queue
            .binary_search_by_key(&ticket, |w| w.ticket)
            .ok()?;
        Some(self.queue[idx].event.listen())
    }

    /// Return how long it is from `now` until the next refill is due.
    pub(crate) fn micros_until_refill(&self, now: u64) -> u64 {
        self.next_refill_us.saturating_sub(now)
    }

    /// Change the rate.  Return true if the new rate was too low and the
    /// refill size had to be rounded up.
    ///
    /// Queued waiters are not woken; the next refill will use the new size.
    pub(crate) fn set_rate(&mut self, rate: u64) -> bool {
        let (bytes, floored) = calculate_refill_bytes_per_period(rate, self.refill_period_us);
        self.rate_bytes_per_sec = rate;
        self.rate_generation += 1;
        self.refill_bytes_per_period = bytes;
        self.available_bytes = self.available_bytes.min(bytes);
        floored
    }

    /// Stop the bucket, and wake everybody in the queue.
    ///
    /// Return the number of waiters that were released.
    pub(crate) fn shutdown(&mut self) -> usize {
        self.stop = true;
        self.invalidate()
    }

    /// Mark the bucket as no longer usable, and wake everybody in the queue.
    ///
    /// Released waiters are not granted anything.
    pub(crate) fn invalidate(&mut self) -> usize {
        self.valid = false;
        let released = self.queue.len();
        for waiter in self.queue.drain(..) {
            waiter.event.notify(1);
        }
        released
    }

    /// Return true if shutdown has begun.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stop
    }

    /// Account for a finished operation.
    pub(crate) fn record(&mut self, started: OpStart, bytes: u64, now: u64) {
        self.ops
            .get_mut(started.op)
            .note(bytes, now.saturating_sub(started.begin_us));
        if let Some(tune) = &mut self.tune {
            tune.note_bytes(bytes);
        }
    }

    /// If auto-tuning is on and the tuning window has closed at `now`,
    /// reset the window and return what it saw, along with the current rate
    /// generation.
    pub(crate) fn take_tune_window(&mut self, now: u64) -> Option<(TuneWindow, u64)> {
        let rate = self.rate_bytes_per_sec;
        let generation = self.rate_generation;
        let tune = self.tune.as_mut()?;
        tune.should_tune(now)
            .then(|| (tune.take_window(now, rate), generation))
    }

    /// Set the rate to an estimate made from a window taken at `generation`.
    ///
    /// Return `None`, changing nothing, if the rate has been changed since
    /// that window was taken.  Otherwise return what [`set_rate`](Self::set_rate)
    /// returns.
    pub(crate) fn apply_estimate(&mut self, generation: u64, rate: u64) -> Option<bool> {
        if generation != self.rate_generation {
            return None;
        }
        Some(self.set_rate(rate))
    }

    /// Return the tuning window, if auto-tuning is enabled.
    #[cfg(test)]
    pub(crate) fn tune(&self) -> Option<&TuneState> {
        self.tune.as_ref()
    }

    /// Return the counters for `op`.
    pub(crate) fn op_stats(&self, op: IoOp) -> OpStats {
        self.ops.get(op)
    }

    /// Return the current rate, in bytes per second.
    pub(crate) fn rate_bytes_per_sec(&self) -> u64 {
        self.rate_bytes_per_sec
    }

    /// Return the number of bytes added per refill.
    pub(crate) fn refill_bytes_per_period(&self) -> u64 {
        self.refill_bytes_per_period
    }

    /// Return the balance.
    pub(crate) fn available_bytes(&self) -> u64 {
        self.available_bytes
    }

    /// Return the number of queued requests.
    pub(crate) fn requests_to_wait(&self) -> usize {
        self.queue.len()
    }

    /// Return the number of granted requests.
    pub(crate) fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Return the number of granted bytes.
    pub(crate) fn total_bytes_through(&self) -> u64 {
        self.total_bytes_through
    }

    /// Return when the next refill is due.
    #[cfg(test)]
    pub(crate) fn next_refill_us(&self) -> u64 {
        self.next_refill_us
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
    use crate::ops::EngineId;

    /// 100ms periods at 1MB/s: 100_000 bytes per refill.
    fn bucket_at(now: u64) -> BucketState {
        BucketState::new(1_000_000, 100_000, None, now)
    }

    #[test]
    fn refill_size() {
        assert_eq!(calculate_refill_bytes_per_period(1_000_000, 100_000), (100_000, false));
        assert_eq!(calculate_refill_bytes_per_period(500, 100_000), (100, true));
        assert_eq!(calculate_refill_bytes_per_period(0, 100_000), (100, true));
        assert_eq!(calculate_refill_bytes_per_period(1_000, 100_000), (100, false));
        assert_eq!(
            calculate_refill_bytes_per_period(u64::MAX, u64::MAX),
            (u64::MAX, false)
        );
    }

    #[test]
    fn first_refill_is_immediate() {
        let mut b = bucket_at(1_000);
        assert_eq!(b.available_bytes(), 0);
        assert!(b.refill(1_000));
        assert_eq!(b.available_bytes(), 100_000);
        assert_eq!(b.next_refill_us(), 101_000);
    }

    #[test]
    fn refill_is_idempotent() {
        let mut b = bucket_at(0);
        assert!(b.refill(250_000));
        let (avail, next) = (b.available_bytes(), b.next_refill_us());
        assert!(b.try_grant(10));
        assert!(!b.refill(250_000));
        assert_eq!(b.available_bytes(), avail - 10);
        assert_eq!(b.next_refill_us(), next);
    }

    #[test]
    fn refill_does_not_drift() {
        let mut b = bucket_at(0);
        b.refill(0);
        // A refill that happens late must not push the schedule back.
        b.refill(150_000);
        assert_eq!(b.next_refill_us(), 200_000);
        b.refill(199_999);
        assert_eq!(b.next_refill_us(), 200_000);
        // A long gap is caught up in whole periods.
        b.refill(1_234_567);
        assert_eq!(b.next_refill_us(), 1_300_000);
        assert_eq!(b.next_refill_us() % 100_000, 0);
    }

    #[test]
    fn balance_is_capped() {
        let mut b = bucket_at(0);
        b.refill(0);
        assert!(b.try_grant(30_000));
        b.refill(10_000_000);
        assert_eq!(b.available_bytes(), 100_000);
    }

    #[test]
    fn scenario() {
        let mut b = bucket_at(0);
        b.refill(0);
        assert!(b.try_grant(100_000));
        assert_eq!(b.available_bytes(), 0);

        // A one-byte request has to wait for the next tick.
        assert!(!b.try_grant(1));
        let t = b.enqueue(1);
        assert!(!b.is_granted(t));
        assert!(b.is_leader(t));
        assert_eq!(b.micros_until_refill(40_000), 60_000);

        b.refill(99_999);
        assert!(!b.is_granted(t));
        b.refill(100_000);
        assert!(b.is_granted(t));
        assert_eq!(b.available_bytes(), 99_999);
        assert_eq!(b.total_requests(), 2);
        assert_eq!(b.total_bytes_through(), 100_001);
    }

    #[test]
    fn queue_blocks_small_requests() {
        let mut b = bucket_at(0);
        b.refill(0);
        assert!(b.try_grant(99_000));

        let big = b.enqueue(5_000);
        // The big request soaked up the remaining balance.
        assert_eq!(b.available_bytes(), 0);
        b.refill(100_000);
        assert!(b.is_granted(big));
        assert_eq!(b.available_bytes(), 96_000);

        let t1 = b.enqueue(200_000);
        let t2 = b.enqueue(1);
        assert!(!b.is_granted(t1));
        assert!(!b.is_granted(t2));
        assert!(b.is_leader(t1));
        // Nobody gets to jump the line while it is non-empty.
        assert!(!b.try_grant(1));
        assert_eq!(b.requests_to_wait(), 2);
    }

    #[test]
    fn large_requests_span_periods() {
        let mut b = bucket_at(0);
        let t1 = b.enqueue(250_000);
        let t2 = b.enqueue(10);
        b.refill(0);
        b.refill(100_000);
        assert!(!b.is_granted(t1));
        b.refill(200_000);
        assert!(b.is_granted(t1));
        assert!(b.is_granted(t2));
        assert_eq!(b.available_bytes(), 100_000 - 50_000 - 10);
        assert_eq!(b.requests_to_wait(), 0);
        assert_eq!(b.total_bytes_through(), 250_010);
    }

    #[test]
    fn fifo_no_overtaking() {
        let mut b = bucket_at(0);
        let tickets: Vec<_> = [60_000, 70_000, 10, 10].iter().map(|n| b.enqueue(*n)).collect();
        b.refill(0);
        assert!(b.is_granted(tickets[0]));
        // The second waiter can't be covered, so the tiny ones behind it wait.
        assert!(!b.is_granted(tickets[1]));
        assert!(!b.is_granted(tickets[2]));
        assert!(b.is_leader(tickets[1]));
        b.refill(100_000);
        assert!(tickets.iter().all(|t| b.is_granted(*t)));
    }

    #[test]
    fn set_rate_floors_and_clamps() {
        let mut b = bucket_at(0);
        b.refill(0);
        assert!(!b.set_rate(2_000_000));
        assert_eq!(b.refill_bytes_per_period(), 200_000);
        assert_eq!(b.available_bytes(), 100_000);

        assert!(b.set_rate(10));
        assert_eq!(b.rate_bytes_per_sec(), 10);
        assert_eq!(b.refill_bytes_per_period(), MIN_REFILL_BYTES_PER_PERIOD);
        assert_eq!(b.available_bytes(), MIN_REFILL_BYTES_PER_PERIOD);
    }

    #[test]
    fn shutdown_releases_queue() {
        let mut b = bucket_at(0);
        let t1 = b.enqueue(1_000_000);
        let t2 = b.enqueue(1_000_000);
        assert!(b.listen(t2).is_some());
        assert_eq!(b.shutdown(), 2);
        assert!(!b.is_open());
        assert!(!b.is_granted(t1));
        assert!(!b.is_granted(t2));
        assert!(b.listen(t1).is_none());
        assert_eq!(b.total_bytes_through(), 0);
    }

    #[test]
    fn tuning_window() {
        let mut b = BucketState::new(1_000_000, 100_000, Some(TuneState::new(1_000_000, 0)), 0);
        let start = OpStart {
            op: IoOp::Compaction,
            engine: EngineId(1),
            begin_us: 10,
        };
        b.record(start, 4_000, 510);
        assert_eq!(b.take_tune_window(999_999), None);
        let (w, _) = b.take_tune_window(1_000_000).unwrap();
        assert_eq!(w.observed_bytes, 4_000);
        assert_eq!(w.current_rate, 1_000_000);
        assert_eq!(b.tune().unwrap().bytes(), 0);

        let s = b.op_stats(IoOp::Compaction);
        assert_eq!(s.count, 1);
        assert_eq!(s.bytes, 4_000);
        assert_eq!(s.busy.as_micros(), 500);

        // Without a tuning window, nothing is ever taken.
        let mut b = bucket_at(0);
        b.record(start, 4_000, 510);
        assert_eq!(b.take_tune_window(u64::MAX), None);
    }

    #[test]
    fn stale_estimate_is_dropped() {
        let tune = Some(TuneState::new(1_000_000, 0));
        let mut b = BucketState::new(1_000_000, 100_000, tune, 0);

        let (_, gen) = b.take_tune_window(1_000_000).unwrap();
        // Someone sets the rate while the estimator is busy.
        assert!(!b.set_rate(2_000_000));
        assert_eq!(b.apply_estimate(gen, 5_000_000), None);
        assert_eq!(b.rate_bytes_per_sec(), 2_000_000);
        assert_eq!(b.refill_bytes_per_period(), 200_000);

        // An estimate from a window taken after the change is applied.
        let (w, gen) = b.take_tune_window(2_000_000).unwrap();
        assert_eq!(w.current_rate, 2_000_000);
        assert_eq!(b.apply_estimate(gen, 500), Some(true));
        assert_eq!(b.rate_bytes_per_sec(), 500);
        // ...and counts as a change itself.
        assert_eq!(b.apply_estimate(gen, 3_000_000), None);
        assert_eq!(b.rate_bytes_per_sec(), 500);
    }
}
