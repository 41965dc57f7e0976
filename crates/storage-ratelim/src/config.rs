//! Configuration for a [`TokenBucket`](crate::TokenBucket).

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::err::ConfigBuildError;

/// Refill period used when none is configured.
pub const DEFAULT_REFILL_PERIOD: Duration = Duration::from_millis(100);

/// Tuning window used when none is configured.
pub const DEFAULT_TUNE_PERIOD: Duration = Duration::from_secs(10);

/// Starting rate for an auto-tuned bucket that was given no explicit rate.
pub const DEFAULT_RATE_BYTES_PER_SEC: u64 = 64 * 1024 * 1024;

/// Configuration for a [`TokenBucket`](crate::TokenBucket).
///
/// Construct with [`TokenBucketConfigBuilder`], or deserialize the builder
/// from a configuration file:
///
/// ```
/// use storage_ratelim::TokenBucketConfigBuilder;
/// let cfg: TokenBucketConfigBuilder = toml::from_str(r#"
///     refill_period = "50ms"
///     rate_bytes_per_sec = 8388608
/// "#).unwrap();
/// let cfg = cfg.build().unwrap();
/// assert_eq!(cfg.rate_bytes_per_sec(), Some(8 << 20));
/// ```
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError", validate = "Self::validate"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct TokenBucketConfig {
    /// How often the bucket is refilled.
    ///
    /// Larger values give burstier I/O; smaller values cost more CPU.
    #[builder(default = "DEFAULT_REFILL_PERIOD")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) refill_period: Duration,

    /// Explicit ceiling in bytes per second.
    ///
    /// If unset, the bucket is auto-tuned starting from
    /// [`DEFAULT_RATE_BYTES_PER_SEC`].
    #[builder(default, setter(strip_option))]
    #[builder_field_attr(serde(default))]
    pub(crate) rate_bytes_per_sec: Option<u64>,

    /// Whether to let the [`RateEstimator`](crate::RateEstimator) adjust the rate.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    pub(crate) auto_tune: bool,

    /// How much traffic the tuner looks at before recommending a new rate.
    #[builder(default = "DEFAULT_TUNE_PERIOD")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) tune_period: Duration,
}

impl TokenBucketConfigBuilder {
    /// Check that the builder will give a usable configuration.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        for (field, value) in [
            ("refill_period", self.refill_period),
            ("tune_period", self.tune_period),
        ] {
            if value == Some(Duration::ZERO) {
                return Err(ConfigBuildError::Invalid {
                    field: field.into(),
                    problem: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            refill_period: DEFAULT_REFILL_PERIOD,
            rate_bytes_per_sec: None,
            auto_tune: false,
            tune_period: DEFAULT_TUNE_PERIOD,
        }
    }
}

impl TokenBucketConfig {
    /// Return a new [`TokenBucketConfigBuilder`].
    pub fn builder() -> TokenBucketConfigBuilder {
        TokenBucketConfigBuilder::default()
    }

    /// Return the configured refill period.
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Return the explicit rate, if there is one.
    pub fn rate_bytes_per_sec(&self) -> Option<u64> {
        self.rate_bytes_per_sec
    }

    /// Return the configured tuning window.
    pub fn tune_period(&self) -> Duration {
        self.tune_period
    }

    /// Return true if the rate will be adjusted automatically.
    ///
    /// A configuration with no explicit rate is always auto-tuned.
    pub fn auto_tune(&self) -> bool {
        self.auto_tune || self.rate_bytes_per_sec.is_none()
    }

    /// Return the rate the bucket starts with.
    pub fn initial_rate(&self) -> u64 {
        self.rate_bytes_per_sec
            .unwrap_or(DEFAULT_RATE_BYTES_PER_SEC)
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
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let built = TokenBucketConfig::builder().build().unwrap();
        assert_eq!(built, TokenBucketConfig::default());
        assert_eq!(built.refill_period(), Duration::from_millis(100));
        assert_eq!(built.rate_bytes_per_sec(), None);
        assert!(built.auto_tune());
        assert_eq!(built.initial_rate(), DEFAULT_RATE_BYTES_PER_SEC);
    }

    #[test]
    fn explicit_rate_is_fixed() {
        let cfg = TokenBucketConfig::builder()
            .rate_bytes_per_sec(1_000_000)
            .refill_period(Duration::from_millis(10))
            .build()
            .unwrap();
        assert!(!cfg.auto_tune());
        assert_eq!(cfg.initial_rate(), 1_000_000);

        let cfg = TokenBucketConfig::builder()
            .rate_bytes_per_sec(1_000_000)
            .auto_tune(true)
            .build()
            .unwrap();
        assert!(cfg.auto_tune());
    }

    #[test]
    fn zero_periods_rejected() {
        let err = TokenBucketConfig::builder()
            .refill_period(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_matches!(err, ConfigBuildError::Invalid { field, .. } if field == "refill_period");

        let err = TokenBucketConfig::builder()
            .tune_period(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_matches!(err, ConfigBuildError::Invalid { field, .. } if field == "tune_period");
    }

    #[test]
    fn from_toml() {
        let b: TokenBucketConfigBuilder = toml::from_str(
            r#"
            refill_period = "20ms"
            auto_tune = true
            tune_period = "1m"
            "#,
        )
        .unwrap();
        let cfg = b.build().unwrap();
        assert_eq!(cfg.refill_period(), Duration::from_millis(20));
        assert_eq!(cfg.tune_period(), Duration::from_secs(60));
        assert_eq!(cfg.rate_bytes_per_sec(), None);
        assert!(cfg.auto_tune());

        let b: TokenBucketConfigBuilder = toml::from_str("").unwrap();
        assert_eq!(b.build().unwrap(), TokenBucketConfig::default());

        let b: TokenBucketConfigBuilder = toml::from_str(r#"refill_period = "0s""#).unwrap();
        assert!(b.build().is_err());
    }
}
