#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

/// Implementation notes
///
/// All mutable state of a [`TokenBucket`] lives in one
/// [`BucketState`](state::BucketState) behind a single mutex.  The state type
/// knows nothing about threads or clocks: it is given the time, and it
/// answers questions about tickets.  [`TokenBucket`] supplies the time, does
/// the blocking, and does the logging.
///
/// Requests that cannot be granted at once take a ticket and join a queue.
/// Bytes are only ever handed out from the front of that queue, and a ticket
/// is granted once every ticket before it has been, so nobody overtakes.
///
/// There is no refill task.  Whoever holds the lock after a refill is due
/// performs it.  The waiter at the front of the queue sleeps only until the
/// next refill is due, so a bucket with no other callers still makes
/// progress.
///
/// Auto-tuning closes its window under the lock, but calls the
/// [`RateEstimator`] with the lock released.
mod implementation_notes {}

mod bucket;
mod builder;
mod clock;
mod config;
mod err;
mod io;
mod ops;
mod state;
mod tune;

pub use bucket::{ColumnFamily, TokenBucket};
pub use builder::TokenBucketBuilder;
pub use clock::{Clock, CoarseClock, ManualClock, SystemClock};
pub use config::{
    TokenBucketConfig, TokenBucketConfigBuilder, DEFAULT_RATE_BYTES_PER_SEC,
    DEFAULT_REFILL_PERIOD, DEFAULT_TUNE_PERIOD,
};
pub use err::{ConfigBuildError, Error, EstimateError};
pub use io::{ShutdownPolicy, ThrottledWrite};
pub use ops::{EngineId, IoOp, OpStart, OpStats};
pub use state::{MIN_REFILL_BYTES_PER_PERIOD, SINGLE_REQUEST_BYTES};
pub use tune::{RateEstimator, TuneWindow};
