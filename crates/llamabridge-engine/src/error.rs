//! Engine client error types.

use llamabridge_core::BridgeError;

/// Errors talking to a llama.cpp server.
#[derive(Debug, thiserror::Error)]
pub enum EngineClientError {
    /// The configured base URL cannot be used.
    #[error("invalid engine url: {reason}")]
    InvalidUrl { reason: String },

    /// The HTTP request could not be sent or its body not read.
    #[error("request to llama.cpp failed: {reason}")]
    RequestFailed { reason: String },

    /// The server answered with a non-success status.
    #[error("llama.cpp returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The event stream broke off or reported an error.
    #[error("llama.cpp stream error: {reason}")]
    Stream { reason: String },

    /// A response body did not have the expected shape.
    #[error("unexpected llama.cpp response: {reason}")]
    Parse { reason: String },
}

impl From<EngineClientError> for BridgeError {
    fn from(e: EngineClientError) -> Self {
        BridgeError::Engine {
            reason: e.to_string(),
        }
    }
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineClientError>;
