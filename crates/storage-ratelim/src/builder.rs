//! Types for conveniently constructing a [`TokenBucket`].

use std::sync::Weak;

use crate::bucket::{ColumnFamily, TokenBucket};
use crate::clock::{Clock, SystemClock};
use crate::config::TokenBucketConfig;
use crate::err::Error;
use crate::tune::RateEstimator;

/// An object for constructing a [`TokenBucket`].
///
/// Returned by [`TokenBucket::builder()`].
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use storage_ratelim::{ColumnFamily, TokenBucket, TokenBucketConfig};
/// struct Cf;
/// impl ColumnFamily for Cf {
///     fn name(&self) -> &str { "default" }
/// }
///
/// let cf: Arc<dyn ColumnFamily> = Arc::new(Cf);
/// let config = TokenBucketConfig::builder()
///     .rate_bytes_per_sec(10 << 20)
///     .build()?;
/// let bucket = TokenBucket::builder(Arc::downgrade(&cf))
///     .config(config)
///     .build()?;
/// bucket.request(4096)?;
/// # Ok::<(), storage_ratelim::Error>(())
/// ```
#[must_use]
pub struct TokenBucketBuilder<C: Clock = SystemClock> {
    /// The column family that will own the bucket.
    owner: Weak<dyn ColumnFamily>,
    /// The bucket's configuration.
    config: TokenBucketConfig,
    /// The clock the bucket will use.
    clock: C,
    /// Optional estimator for auto-tuning.
    estimator: Option<Weak<dyn RateEstimator>>,
}

impl TokenBucketBuilder {
    /// Construct a new builder for a bucket owned by `owner`.
    pub(crate) fn new(owner: Weak<dyn ColumnFamily>) -> Self {
        Self {
            owner,
            config: TokenBucketConfig::default(),
            clock: SystemClock::new(),
            estimator: None,
        }
    }
}

impl<C: Clock> TokenBucketBuilder<C> {
    /// Set the configuration for the bucket under construction.
    ///
    /// If not called, [`TokenBucketConfig::default()`] is used: an
    /// auto-tuned bucket with a 100ms refill period.
    pub fn config(mut self, config: TokenBucketConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` instead of the [`SystemClock`].
    pub fn clock<C2: Clock>(self, clock: C2) -> TokenBucketBuilder<C2> {
        TokenBucketBuilder {
            owner: self.owner,
            config: self.config,
            clock,
            estimator: self.estimator,
        }
    }

    /// Set the estimator that recommends new rates when auto-tuning.
    ///
    /// The bucket does not keep the estimator alive.  Without a live
    /// estimator, an auto-tuned bucket keeps its current rate.
    pub fn estimator(mut self, estimator: Weak<dyn RateEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Create the bucket.
    ///
    /// Fails with [`Error::OwnerGone`] if the owning column family has
    /// already been dropped.
    pub fn build(self) -> Result<TokenBucket<C>, Error> {
        let cf_name = self
            .owner
            .upgrade()
            .map(|cf| cf.name().to_owned())
            .ok_or(Error::OwnerGone)?;
        Ok(TokenBucket::from_parts(
            self.owner,
            cf_name,
            &self.config,
            self.clock,
            self.estimator,
        ))
    }
}
