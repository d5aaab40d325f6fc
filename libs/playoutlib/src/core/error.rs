//! Error types for playoutlib
//!
//! `SinkError` covers configuration and lifecycle failures; `FlowError` is
//! the streaming-path result used by render, preroll and the pull loop.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("device open failed: {0}")]
    OpenFailed(String),

    #[error("cannot parse audio format: {0}")]
    ParseCaps(String),

    #[error("ring buffer acquire failed: {0}")]
    AcquireFailed(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("state change failed: {0}")]
    StateChange(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type that uses SinkError
pub type Result<T> = std::result::Result<T, SinkError>;

/// Streaming-thread result kinds.
///
/// `WrongState` means a blocking wait (commit, preroll, drain) was cancelled
/// by flushing or a downward state change; it is not an error for the
/// element, the caller just stops pushing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    #[error("sink not negotiated")]
    NotNegotiated,

    #[error("flushing or stopping")]
    WrongState,

    #[error("stream error")]
    Error,
}

/// Result of a streaming-path operation
pub type FlowResult = std::result::Result<(), FlowError>;
