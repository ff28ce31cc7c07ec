//! Error taxonomy for the Swarm supervisor.
//!
//! Every failure surfaced to a caller maps onto one of the variants of
//! [`HubError`]. Meta-tool handlers convert these into `is_error` tool
//! results; the HTTP layer never converts them into non-2xx statuses
//! (the tool protocol carries the error).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, HubError>;

/// The error taxonomy surfaced to callers.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubError {
    /// A field is missing or malformed.
    #[error("bad input: {0}")]
    BadInput(String),

    /// No such worker / session / profile / tool.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to overwrite a protected name.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The worker transport could not connect.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// The target exists but is not in the CONNECTED state.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Queue-TTL expiry, call timeout, or health-probe timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The worker reported a structured error in its response.
    #[error("worker error: {0}")]
    Worker(String),

    /// Shutdown in progress.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Any other unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "BAD_INPUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Worker(_) => "WORKER_ERROR",
            Self::Cancelled(_) => "CANCELLED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the failure left the target worker in a usable state.
    ///
    /// Timeouts never poison an instance; the worker may still be
    /// healthy from the supervisor's perspective.
    #[must_use]
    pub fn poisons_instance(&self) -> bool {
        matches!(self, Self::Worker(_) | Self::SpawnFailed(_))
    }

    /// Shorthand for a [`HubError::BadInput`].
    #[must_use]
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::BadInput(message.into())
    }

    /// Shorthand for a [`HubError::NotFound`].
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Shorthand for a [`HubError::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {err}"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
