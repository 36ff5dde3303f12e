//! Bridge error types.
//!
//! Every core subsystem surfaces errors through [`BridgeError`].  The
//! variants mirror how the HTTP surface must react: request problems are
//! client errors reported before the engine runs, engine problems are server
//! errors, configuration problems stop the process at startup.
//!
//! Garbled function-call output from the model is deliberately absent from
//! this list; the extractor degrades it to a `malformed` intent instead.

/// Unified error type for the bridge core.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // -- Request errors ------------------------------------------------------
    /// The request is malformed or internally inconsistent.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A message carried a role the prompt template cannot render.
    #[error("unsupported role: {role}")]
    UnsupportedRole { role: String },

    // -- Engine errors -------------------------------------------------------
    /// The inference engine failed to start or continue a generation.
    #[error("engine error: {reason}")]
    Engine { reason: String },

    /// The engine does not provide the requested capability.
    #[error("engine does not support {capability}")]
    EngineUnsupported { capability: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Shorthand for [`BridgeError::InvalidRequest`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`BridgeError::Engine`].
    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. } | Self::UnsupportedRole { .. } | Self::Json(_)
        )
    }
}

/// Convenience alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, BridgeError>;
