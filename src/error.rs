//! accelr error types

use numr::dtype::DType;

/// accelr result type
pub type Result<T> = std::result::Result<T, Error>;

/// accelr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid argument to an operation (bad call-site usage)
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// The active strategy cannot perform the requested operation
    #[error("unsupported by strategy '{strategy}': {reason}")]
    UnsupportedOperation {
        /// Strategy name
        strategy: &'static str,
        /// What is unsupported and what to use instead
        reason: String,
    },

    /// Total gradient norm is NaN or infinite while strict checking is on
    #[error(
        "the total norm of order {norm_type} for gradients is non-finite ({norm}), \
         so it cannot be clipped; set `error_if_nonfinite` to false to disable this check"
    )]
    NonFiniteGradient {
        /// The computed total norm
        norm: f64,
        /// Order of the norm
        norm_type: f64,
    },

    /// DType mismatch between a gradient and what clipping expects
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Training/loss-scaling error
    #[error("training error: {reason}")]
    TrainingError {
        /// Description of what went wrong
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },

    /// Configuration parsing or validation error
    #[error("config error: {reason}")]
    ConfigError {
        /// Description of what went wrong
        reason: String,
    },
}
