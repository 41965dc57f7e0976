//! Declare error types for the storage-ratelim crate.

use thiserror::Error;

/// An error returned by a [`TokenBucket`](crate::TokenBucket).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The bucket is stopping or has stopped.
    ///
    /// No bytes were granted.  The caller decides whether to go ahead
    /// unthrottled or to abandon the operation.
    #[error("Rate limiter is shutting down")]
    ShutdownInProgress,

    /// The column family that was supposed to own the bucket no longer exists.
    #[error("Owning column family was dropped before the rate limiter was built")]
    OwnerGone,

    /// The configuration could not be built.
    #[error("Invalid rate limiter configuration")]
    Config(#[from] ConfigBuildError),
}

/// An error found while building a [`TokenBucketConfig`](crate::TokenBucketConfig).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A mandatory field was not present.
    #[error("Field was not provided: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },
    /// A single field had a value that proved to be unusable.
    #[error("Value of {field} was incorrect: {problem}")]
    Invalid {
        /// The name of the invalid field
        field: String,
        /// A description of the problem.
        problem: String,
    },
}

impl From<derive_builder::UninitializedFieldError> for ConfigBuildError {
    fn from(val: derive_builder::UninitializedFieldError) -> Self {
        ConfigBuildError::MissingField {
            field: val.field_name().to_string(),
        }
    }
}

/// An error from a [`RateEstimator`](crate::RateEstimator).
///
/// These never reach callers of [`request`](crate::TokenBucket::request):
/// the tuner keeps the current rate and tries again in the next window.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EstimateError {
    /// Not enough traffic was observed to recommend anything.
    #[error("Not enough data to estimate a rate")]
    NotEnoughData,
    /// The estimator could not run.
    #[error("Rate estimator unavailable: {0}")]
    Unavailable(String),
}
