//! Structured error types for the kernel
//!
//! One `thiserror`-derived enum covering the taxonomy in the error handling
//! design: what is retryable, what is fatal, and what the caller should do
//! with it.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for kernel operations.
#[derive(Error, Debug)]
pub enum KernelError {
    // =========================================================================
    // Cancellation
    // =========================================================================
    /// A long-running loop observed the process-wide cancel signal.
    #[error("operation aborted")]
    Abort,

    // =========================================================================
    // Store / c-list errors
    // =========================================================================
    /// Vat lookup failed — vat does not exist (or was already terminated).
    #[error("vat not found: {0}")]
    VatNotFound(String),

    /// A decider attempted to resolve a promise that is already settled.
    #[error("promise already resolved: {0}")]
    PromiseAlreadyResolved(String),

    /// A send targeted a revoked kernel object.
    #[error("object revoked: {0}")]
    RevokedObject(String),

    /// A store invariant was violated; the kernel cannot proceed safely.
    #[error("corrupt store: {0}")]
    CorruptStore(String),

    /// A subcluster record names a bootstrap vat that does not exist, or
    /// has no root object recorded for it.
    #[error("corrupt subcluster state: {0}")]
    CorruptSubcluster(String),

    // =========================================================================
    // Marshal errors
    // =========================================================================
    /// A CapData slot referenced a kref/eref unknown to the marshaller.
    #[error("unknown slot: {0}")]
    UnknownSlot(String),

    // =========================================================================
    // Subcluster / launch errors
    // =========================================================================
    /// Subcluster config failed structural validation.
    #[error("invalid cluster config")]
    InvalidClusterConfig,

    /// Subcluster config named a bootstrap vat absent from `vats`.
    #[error("invalid bootstrap vat name")]
    InvalidBootstrapVatName,

    /// Named subcluster does not exist.
    #[error("Subcluster does not exist.")]
    SubclusterNotFound,

    // =========================================================================
    // Vat bundle validation
    // =========================================================================
    /// A `VatBundle` failed strict structural validation.
    #[error("invalid vat bundle: {0}")]
    InvalidVatBundle(String),

    // =========================================================================
    // Resource / rate limit errors
    // =========================================================================
    /// A sliding-window limit (messages/sec or connection-attempts/min) was
    /// exceeded. Always retryable.
    #[error("resource limit exceeded: {limit_type}")]
    ResourceLimit {
        limit_type: &'static str,
        current: u64,
        limit: u64,
    },

    // =========================================================================
    // Remote transport errors
    // =========================================================================
    /// Transient transport I/O failure; drives reconnection backoff.
    #[error("retryable network error: {0}")]
    RetryableNetwork(String),

    /// Non-retryable transport failure (auth, identity mismatch, handshake
    /// policy); transitions the peer to permanently-failed.
    #[error("non-retryable transport error: {0}")]
    NonRetryable(String),

    // =========================================================================
    // Internal / generic
    // =========================================================================
    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KernelError {
    /// Whether an automatic retry makes sense for this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResourceLimit { .. } => true,
            Self::RetryableNetwork(_) => true,
            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            Self::Abort
            | Self::VatNotFound(_)
            | Self::PromiseAlreadyResolved(_)
            | Self::RevokedObject(_)
            | Self::CorruptStore(_)
            | Self::CorruptSubcluster(_)
            | Self::UnknownSlot(_)
            | Self::InvalidClusterConfig
            | Self::InvalidBootstrapVatName
            | Self::SubclusterNotFound
            | Self::InvalidVatBundle(_)
            | Self::NonRetryable(_)
            | Self::Internal(_)
            | Self::Serialization(_) => false,
        }
    }

    /// Suggested retry delay, if any, beyond generic exponential backoff.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::ResourceLimit { .. } => Some(Duration::from_millis(500)),
            _ => None,
        }
    }

    /// Whether this error should transition a peer to `permanently_failed`
    /// rather than driving another reconnection attempt.
    pub fn is_permanent_transport_failure(&self) -> bool {
        matches!(self, Self::NonRetryable(_))
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return Self::Io(std::io::Error::new(io_err.kind(), io_err.to_string()));
        }
        Self::Internal(err.to_string())
    }
}

/// Result type alias using `KernelError`.
pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(KernelError::ResourceLimit {
            limit_type: "messagesPerSecond",
            current: 101,
            limit: 100,
        }
        .is_retryable());
        assert!(KernelError::RetryableNetwork("reset".into()).is_retryable());
        assert!(!KernelError::VatNotFound("v1".into()).is_retryable());
        assert!(!KernelError::NonRetryable("bad auth".into()).is_retryable());
    }

    #[test]
    fn non_retryable_is_permanent_transport_failure() {
        assert!(KernelError::NonRetryable("auth".into()).is_permanent_transport_failure());
        assert!(!KernelError::RetryableNetwork("reset".into()).is_permanent_transport_failure());
    }
}
