/*!
# Error Module

This module defines the error handling infrastructure for HookRelay.

Only a few failures ever reach a caller of the engine:
- Invalid configuration or retry policies, rejected at startup
- Durable store failures, reported by the store adapters themselves
- Payload (de)serialization problems at the persistence boundary

Delivery failures are *not* errors at this level. They are ordinary outcomes
(`DeliveryOutcome::Failed`) that feed the retry bookkeeping, and persistence
failures observed by the queue are logged rather than propagated.
*/

use thiserror::Error;

/// Result type alias for HookRelay operations
pub type Result<T> = std::result::Result<T, HookRelayError>;

/// Errors that can occur during HookRelay operations
#[derive(Debug, Error)]
pub enum HookRelayError {
    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for HookRelayError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}
