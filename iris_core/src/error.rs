//! # Orchestrator Error Taxonomy
//!
//! Every component boundary converts its lower-level failures into one of
//! these kinds rather than leaking transport or I/O details upward. The
//! pool never retries on its own; retryability is advertised so that
//! callers can decide.

use serde_json::{Value, json};

/// Error kinds surfaced by the orchestrator core.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown team '{0}'")]
    UnknownTeam(String),

    #[error("process pool is at capacity ({limit} processes)")]
    PoolFull { limit: usize },

    #[error("deadline elapsed after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error("process terminated with {lost_messages} undelivered request(s)")]
    ProcessTerminated { lost_messages: usize },

    #[error("failed to spawn assistant for team '{team}': {source}")]
    Spawn {
        team: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(String),
}

impl OrchestratorError {
    /// Stable machine-readable kind for error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::UnknownTeam(_) => "unknown_team",
            OrchestratorError::PoolFull { .. } => "pool_full",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::ProcessTerminated { .. } => "process_terminated",
            OrchestratorError::Spawn { .. } => "spawn_error",
            OrchestratorError::Configuration(_) => "configuration_error",
            OrchestratorError::Protocol(_) => "protocol_error",
            OrchestratorError::Store(_) => "store_error",
        }
    }

    /// Whether a caller may reasonably retry the same verb unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::PoolFull { .. } | OrchestratorError::Timeout { .. }
        )
    }

    /// Structured envelope handed to the transport layer.
    pub fn to_envelope(&self) -> Value {
        let mut envelope = json!({
            "error": self.kind(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        });
        if let OrchestratorError::ProcessTerminated { lost_messages } = self {
            envelope["lostMessages"] = json!(lost_messages);
        }
        envelope
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(OrchestratorError::PoolFull { limit: 4 }.is_retryable());
        assert!(OrchestratorError::Timeout { elapsed_ms: 100 }.is_retryable());
        assert!(!OrchestratorError::Cancelled.is_retryable());
        assert!(!OrchestratorError::UnknownTeam("x".into()).is_retryable());
    }

    #[test]
    fn envelope_carries_lost_messages() {
        let envelope = OrchestratorError::ProcessTerminated { lost_messages: 3 }.to_envelope();
        assert_eq!(envelope["error"], "process_terminated");
        assert_eq!(envelope["lostMessages"], 3);
        assert_eq!(envelope["retryable"], false);
    }
}
