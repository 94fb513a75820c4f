//! Supervisor error types.

use thiserror::Error;

use super::types::LifecycleState;

/// Errors that can occur while supervising child servers or calling them.
///
/// `Clone` so that a single termination can resolve every outstanding call
/// on the same handle with the same error.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// The executable could not be located or launched.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// A frame from the child was not well-formed JSON.
    #[error("malformed message from server '{server}': {reason}")]
    MalformedMessage { server: String, reason: String },

    /// A frame parsed, but required protocol fields were absent or conflicting.
    #[error("unexpected message shape from server '{server}': {reason}")]
    UnexpectedShape { server: String, reason: String },

    /// No response arrived within the per-call timeout.
    #[error("call '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    CallTimeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The child's output stream closed (or it was stopped) before a response arrived.
    #[error("server '{server}' terminated: {reason}")]
    ChildTerminated { server: String, reason: String },

    /// No registry entry with this name.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    /// `start` was called while a live handle exists.
    #[error("server '{name}' is already running")]
    AlreadyRunning { name: String, pid: Option<u32> },

    /// The entry is not in the `Ready` state.
    #[error("server '{name}' is not ready (state: {state})")]
    ServerNotReady { name: String, state: LifecycleState },

    /// The configured restart limit was reached; the entry stays stopped.
    #[error("server '{name}' exceeded its restart limit of {limit}")]
    RestartLimitExceeded { name: String, limit: u32 },

    /// The child started but did not answer the handshake call.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// The child answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// I/O failure on a child stream other than the child going away.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Configuration could not be read or parsed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl SupervisorError {
    /// Whether the failure may clear up on its own (a later call could succeed).
    ///
    /// The client never retries; this is for the caller's retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SupervisorError::CallTimeout { .. } | SupervisorError::ChildTerminated { .. }
        )
    }

    /// Shorthand used by every path that observes the child going away.
    pub(crate) fn terminated(server: &str, reason: impl Into<String>) -> Self {
        SupervisorError::ChildTerminated {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(SupervisorError::CallTimeout {
            server: "s".into(),
            method: "m".into(),
            timeout_ms: 10,
        }
        .is_transient());
        assert!(SupervisorError::terminated("s", "gone").is_transient());
        assert!(!SupervisorError::UnknownServer { name: "x".into() }.is_transient());
        assert!(!SupervisorError::ServerError {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        }
        .is_transient());
    }

    #[test]
    fn test_not_ready_message_names_state() {
        let err = SupervisorError::ServerNotReady {
            name: "echo".into(),
            state: LifecycleState::Stopped,
        };
        assert_eq!(err.to_string(), "server 'echo' is not ready (state: stopped)");
    }
}
