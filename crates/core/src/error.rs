//! Gateway error taxonomy.
//!
//! One enum for the whole runtime, independent of transport. The server crate
//! maps these onto MCP error payloads at the protocol edge; background tasks
//! log them and never propagate.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Input failed schema or constraint validation. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Caller lacks rights on a namespace or server. Surfaced with a stable
    /// message; not logged at error level.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Referenced entity is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream connect/transport failure. Retried with bounded backoff on
    /// attach, never on `tools/call`.
    #[error("upstream transport error: {0}")]
    UpstreamTransient(String),

    /// The upstream accepted the connection but rejected the call.
    #[error("upstream rejected call: {0}")]
    UpstreamFatal(String),

    /// A token or document budget tripped before any work was done.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// The ask agent refused a tool (denied, allowlist, synthetic). Recorded
    /// per call; the run continues.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Anything else. Logged with detail, surfaced generically.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Wrap any displayable error as [`GatewayError::Internal`].
    pub fn internal(err: impl std::fmt::Display) -> Self {
        GatewayError::Internal(err.to_string())
    }

    /// Whether the attach path may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::UpstreamTransient(_))
    }
}
