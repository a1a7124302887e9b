//! Error types for the Open Agent SDK

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the SDK
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// API error from the model server
    #[error("API error: {0}")]
    Api(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Tool execution error
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// The operation was cancelled via a `signal`/`CancelToken`, not failed.
    ///
    /// Kept distinct from [`Stream`](Error::Stream) and [`Http`](Error::Http)
    /// so callers can render "aborted" rather than an error state.
    #[error("Operation was aborted")]
    Aborted,

    /// A sandboxed execution reported `execution-error`, or its soft timeout
    /// expired without the sandbox calling `complete()`.
    #[error("Sandbox execution error: {0}")]
    Sandbox(String),

    /// A session file could not be read or written.
    ///
    /// Non-fatal by contract: callers observing this from a
    /// [`crate::session::SessionStore`] method log it and keep using the
    /// in-memory session rather than aborting the current turn.
    #[error("Session persistence error: {0}")]
    SessionPersistence(String),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Create a sandbox execution error
    pub fn sandbox(msg: impl Into<String>) -> Self {
        Error::Sandbox(msg.into())
    }

    /// Create a session persistence error
    pub fn session_persistence(msg: impl Into<String>) -> Self {
        Error::SessionPersistence(msg.into())
    }

    /// Returns `true` if this error represents cancellation rather than
    /// failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
