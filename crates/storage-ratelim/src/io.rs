//! Writers whose throughput is limited by a [`TokenBucket`].

use std::io::{self, Result as IoResult, Write};
use std::sync::Arc;

use crate::bucket::TokenBucket;
use crate::clock::{Clock, SystemClock};
use crate::err::Error;
use crate::ops::{EngineId, IoOp};

/// What a [`ThrottledWrite`] does once its bucket has shut down.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ShutdownPolicy {
    /// Keep writing, without any limit.
    #[default]
    Bypass,
    /// Fail the write.
    Abort,
}

/// A writer that asks a [`TokenBucket`] for permission before every write.
///
/// Made with [`TokenBucket::limit_write`].  Each call to `write` consumes at
/// most one burst's worth of bytes, so that a single large buffer cannot
/// hold the bucket for several periods at once.
pub struct ThrottledWrite<W, C: Clock = SystemClock> {
    /// The bucket we draw from.
    bucket: Arc<TokenBucket<C>>,
    /// The kind of operation our writes count as.
    op: IoOp,
    /// The engine on whose behalf we write.
    engine: EngineId,
    /// What to do once the bucket has shut down.
    policy: ShutdownPolicy,
    /// The underlying writer.
    inner: W,
}

impl<W: Write, C: Clock> Write for ThrottledWrite<W, C> {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        if buf.is_empty() {
            return self.inner.write(buf);
        }
        let burst = usize::try_from(self.bucket.single_burst_bytes()).unwrap_or(usize::MAX);
        let chunk = &buf[..buf.len().min(burst)];

        match self.bucket.request(len_u64(chunk.len())) {
            Ok(()) => {}
            Err(Error::ShutdownInProgress) if self.policy == ShutdownPolicy::Bypass => {}
            Err(e) => return Err(io::Error::other(e)),
        }

        let started = self.bucket.begin(self.op, self.engine);
        let outcome = self.inner.write(chunk);
        let written = outcome.as_ref().map_or(0, |n| *n);
        self.bucket.record(started, len_u64(written));
        outcome
    }

    fn flush(&mut self) -> IoResult<()> {
        self.inner.flush()
    }
}

/// Convert a buffer length to a byte count.
fn len_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

impl<W, C: Clock> ThrottledWrite<W, C> {
    /// Wrap `io`, charging its writes to `bucket` as operations of kind `op`.
    pub(crate) fn new(bucket: Arc<TokenBucket<C>>, op: IoOp, engine: EngineId, io: W) -> Self {
        Self {
            bucket,
            op,
            engine,
            policy: ShutdownPolicy::default(),
            inner: io,
        }
    }

    /// Set what happens once the bucket shuts down.
    #[must_use]
    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Return a reference to the underlying writer.
    pub fn inner(&self) -> &W {
        &self.inner
    }

    /// Return a mutable reference to the underlying writer.
    ///
    /// Bytes written through this reference are not limited.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap this `ThrottledWrite`, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}
