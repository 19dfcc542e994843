//! Domain error kinds shared across components.

use thiserror::Error;

/// Errors produced by the core components.
///
/// The API layer maps each kind to an HTTP status; internal callers match
/// on the kind to classify terminal job states.
#[derive(Debug, Error)]
pub enum AppError {
    /// Request payload failed validation.
    #[error("{0}")]
    Validation(String),

    /// Caller is not authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but not allowed.
    #[error("forbidden")]
    Forbidden,

    /// A referenced resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The owner's queue is at capacity.
    #[error("Queue limit reached for user")]
    QueueFull,

    /// Upload exceeds the configured size cap.
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge {
        /// The configured cap in bytes.
        limit: u64,
    },

    /// The upstream peer went silent past the idle timeout.
    #[error("upstream timed out during {stage}")]
    UpstreamTimeout {
        /// Which stage of the session timed out.
        stage: &'static str,
    },

    /// The upstream peer answered with something we cannot interpret.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// A required external component is unavailable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
