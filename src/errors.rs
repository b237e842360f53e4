//! Connector error types.

use thiserror::Error;

/// Errors that can occur while connecting to or talking with an MCP server.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The child process failed to start.
    #[error("failed to spawn '{command}': {reason}")]
    Spawn {
        command: String,
        reason: String,
    },

    /// The initialize handshake failed.
    #[error("connection '{id}' handshake failed: {reason}")]
    Handshake {
        id: String,
        reason: String,
    },

    /// A request was attempted on a connection that is not running.
    #[error("connection '{id}': server not running")]
    NotRunning {
        id: String,
    },

    /// No response arrived within the request timeout window.
    #[error("request timeout: {method} ({timeout_ms}ms)")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// The server returned a JSON-RPC error response. The message is the
    /// server's own, passed through verbatim.
    #[error("{message}")]
    Server {
        message: String,
    },

    /// The child process exited while requests were still in flight.
    #[error("connection '{id}': process terminated unexpectedly")]
    ProcessExited {
        id: String,
    },

    /// Stdin write or serialization failure.
    #[error("connection '{id}' i/o error: {reason}")]
    Io {
        id: String,
        reason: String,
    },

    /// No registry entry for the given connection id.
    #[error("no connection '{id}' (known connections: {known})")]
    UnknownConnection {
        id: String,
        known: String,
    },

    /// A registry entry exists but its connection is no longer live.
    #[error("connection '{id}' is not active")]
    NotActive {
        id: String,
    },
}
