//! Error taxonomy for the orchestration core.

use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// Every variant is recoverable at the orchestrator boundary: it becomes a
/// user-facing explanation, never a process crash. `Connection` and
/// `Timeout` additionally evict the offending session from the pool so the
/// next request retries against a fresh handle.
#[derive(Error, Debug)]
pub enum CommanderError {
    /// Missing or contradictory credentials. Raised before any network I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unreachable host, rejected authentication, or transport reset while
    /// establishing a session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Post-connect transport failure during a command.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The AI reply was not the strict JSON intent shape.
    #[error("Intent parse error: {0}")]
    IntentParse(String),

    /// The AI service itself failed (unavailable, auth, rate-limited).
    /// Retry is the caller's choice, never automatic.
    #[error("Intent service error (status {status}): {message}")]
    IntentService { status: u16, message: String },

    /// A connect or execute exceeded its bound.
    #[error("Timed out after {0}s: {1}")]
    Timeout(u64, String),

    /// The pool is draining; no new sessions are handed out.
    #[error("Session pool is shutting down")]
    PoolShuttingDown,

    /// No target could be resolved for the request.
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// Ledger storage failure.
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CommanderError {
    /// Whether the session that produced this error is beyond reuse and
    /// must be evicted from the pool.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            CommanderError::Connection(_)
                | CommanderError::Execution(_)
                | CommanderError::Timeout(..)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poisons_session() {
        assert!(CommanderError::Connection("reset".into()).poisons_session());
        assert!(CommanderError::Timeout(15, "connect".into()).poisons_session());
        assert!(!CommanderError::Configuration("no secret".into()).poisons_session());
        assert!(!CommanderError::PoolShuttingDown.poisons_session());
    }
}
