//! Error types for cooldown operations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ratelimit::LimiterId;

/// Main error type for cooldown operations.
#[derive(Error, Debug)]
pub enum CooldownError {
    /// The call was denied because its bucket has no capacity left.
    ///
    /// This is an expected control-flow signal. It is never retried internally.
    #[error("Call is on cooldown, try again in {:.3}s", .retry_after.as_secs_f64())]
    OnCooldown {
        /// How long until the earliest pending replenishment.
        retry_after: Duration,
        /// When the earliest pending replenishment happens.
        resets_at: DateTime<Utc>,
    },

    /// A bucket strategy name could not be resolved
    #[error("Unknown bucket strategy: {0}")]
    UnknownBucketStrategy(String),

    /// A shared limiter with this id is already defined
    #[error("A limiter with id {0} already exists")]
    AlreadyExists(LimiterId),

    /// No shared limiter with this id is defined
    #[error("No limiter registered with id {0}")]
    NotFound(LimiterId),

    /// A call site was queried but has no limiters attached
    #[error("No limiters are registered for this call site")]
    NoRegisteredLimiters,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed persisted state or bucket key encoding
    #[error("State error: {0}")]
    State(String),

    /// No async runtime is available to host timers
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CooldownError {
    /// Returns `true` if this error is an admission denial.
    pub fn is_on_cooldown(&self) -> bool {
        matches!(self, CooldownError::OnCooldown { .. })
    }

    /// The retry-after hint carried by an admission denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CooldownError::OnCooldown { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result type alias for cooldown operations.
pub type Result<T> = std::result::Result<T, CooldownError>;
