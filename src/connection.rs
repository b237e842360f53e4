//! One child-process-backed JSON-RPC session.
//!
//! A `Connection` owns exactly one server process and its protocol state:
//! - spawning with fully redirected stdio
//! - newline-delimited JSON framing over stdout
//! - request/response correlation through a pending-request table
//! - the initialize handshake and the `Disconnected → Connecting →
//!   Connected → Closed` state machine
//!
//! The stdout reader task is the only writer that resolves pending entries;
//! stderr is logged as diagnostics and never parsed as protocol.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::errors::ConnectorError;
use crate::framing::LineBuffer;
use crate::protocol::{self, Inbound, ServerInfo, ToolDescriptor};

// ─── State ───────────────────────────────────────────────────────────────────

/// Connection lifecycle state.
///
/// Only `Connected` accepts tool invocations. `Closed` is terminal: reached
/// by explicit disconnect, process exit, or a failed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// An out-of-band server signal (a JSON-RPC message with `method`, no `id`).
#[derive(Debug, Clone)]
pub struct ServerNotification {
    pub method: String,
    pub params: Option<Value>,
}

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, ConnectorError>>>;
type Pending = Arc<Mutex<PendingMap>>;
type SharedState = Arc<RwLock<ConnectionState>>;

// ─── Connection ──────────────────────────────────────────────────────────────

/// One live server subprocess and its JSON-RPC session.
pub struct Connection {
    id: String,
    config: ConnectionConfig,
    state: SharedState,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    server_info: RwLock<Option<ServerInfo>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    notif_tx: mpsc::UnboundedSender<ServerNotification>,
    notif_rx: StdMutex<Option<mpsc::UnboundedReceiver<ServerNotification>>>,
    request_timeout: Duration,
}

impl Connection {
    /// Build a connection from launch parameters. No I/O happens here.
    pub fn new(mut config: ConnectionConfig) -> Self {
        let id = config.resolve_id();
        let request_timeout = config.request_timeout();
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();

        Self {
            id,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            server_info: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            connected_at: RwLock::new(None),
            notif_tx,
            notif_rx: StdMutex::new(Some(notif_rx)),
            request_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display label (config `name`, falling back to the command).
    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Server identity captured during the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Cached descriptors from the last successful `tools/list`.
    ///
    /// Advisory metadata only; invocation is attempted regardless of cache
    /// freshness.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Take the server-notification receiver. Yields `Some` exactly once.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<ServerNotification>> {
        self.notif_rx.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = next;
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server process and perform the initialize handshake.
    ///
    /// Wires three listeners: the stdout reader (protocol), the stderr
    /// logger (diagnostics), and exit detection via stdout EOF, which
    /// transitions to `Closed` and rejects every in-flight request. On any
    /// handshake failure the spawned process is killed before the error is
    /// returned, so no orphaned children are left behind.
    pub async fn connect(&self) -> Result<ServerInfo, ConnectorError> {
        self.set_state(ConnectionState::Connecting);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        // Merged over the inherited host environment; config values win.
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            self.set_state(ConnectionState::Closed);
            ConnectorError::Spawn {
                command: self.config.command.clone(),
                reason: e.to_string(),
            }
        })?;

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.kill().await;
                    self.set_state(ConnectionState::Closed);
                    return Err(ConnectorError::Spawn {
                        command: self.config.command.clone(),
                        reason: "failed to capture stdio pipes".to_string(),
                    });
                }
            };

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        spawn_stderr_logger(stderr, self.id.clone());
        tokio::spawn(reader_loop(
            stdout,
            Arc::clone(&self.pending),
            Arc::clone(&self.state),
            self.notif_tx.clone(),
            self.id.clone(),
        ));

        let init = match self
            .request_inner("initialize", Some(protocol::initialize_params()))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.shutdown_process().await;
                return Err(ConnectorError::Handshake {
                    id: self.id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let info = protocol::parse_server_info(&init);
        *self
            .server_info
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(info.clone());

        // Fire-and-forget: no id, no pending entry, no response expected.
        if let Err(e) = self
            .write_line(&protocol::notification("notifications/initialized", None))
            .await
        {
            self.shutdown_process().await;
            return Err(ConnectorError::Handshake {
                id: self.id.clone(),
                reason: e.to_string(),
            });
        }

        *self
            .connected_at
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
        self.set_state(ConnectionState::Connected);
        tracing::info!(
            connection = %self.id,
            server = %info.name,
            protocol = %info.protocol_version,
            "connected"
        );
        Ok(info)
    }

    /// Tear down the session. Idempotent; safe on a never-connected
    /// connection.
    ///
    /// The process is terminated forcefully (no protocol goodbye). The
    /// pending table is cleared without rejecting each entry: disconnect is
    /// caller-initiated, unlike the process-exit path which fans out a
    /// rejection to every waiter.
    pub async fn disconnect(&self) {
        self.pending.lock().await.clear();
        self.shutdown_process().await;
    }

    async fn shutdown_process(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            tracing::debug!(connection = %self.id, "server process killed");
        }
        *self.stdin.lock().await = None;
        self.set_state(ConnectionState::Closed);
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send a correlated request and await its response.
    ///
    /// Fails immediately with `NotRunning` when the connection is not
    /// `Connected`, without allocating a pending entry.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectorError::NotRunning {
                id: self.id.clone(),
            });
        }
        self.request_inner(method, params).await
    }

    /// Correlated request without the `Connected` guard. Used directly by
    /// the handshake, where the state is still `Connecting`.
    ///
    /// Exactly one of response dispatch, timeout, or process-exit fan-out
    /// resolves the pending entry; each path removes the table entry before
    /// resolving it.
    async fn request_inner(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let request = protocol::Request::new(request_id.clone(), method, params);
        let payload = match serde_json::to_value(&request) {
            Ok(payload) => payload,
            Err(e) => {
                self.pending.lock().await.remove(&request_id);
                return Err(ConnectorError::Io {
                    id: self.id.clone(),
                    reason: format!("failed to serialize request: {e}"),
                });
            }
        };

        if let Err(e) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped: the table was cleared by a caller-initiated
            // disconnect while this request was in flight.
            Ok(Err(_)) => Err(ConnectorError::NotRunning {
                id: self.id.clone(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ConnectorError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn write_line(&self, payload: &Value) -> Result<(), ConnectorError> {
        let mut line = payload.to_string();
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ConnectorError::NotRunning {
            id: self.id.clone(),
        })?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ConnectorError::Io {
                id: self.id.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        stdin.flush().await.map_err(|e| ConnectorError::Io {
            id: self.id.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    // ─── Discovery & invocation ──────────────────────────────────────────

    /// Fetch the server's tool list and replace the cached descriptors.
    ///
    /// Explicit re-discovery only: the engine never refreshes the cache on
    /// its own, even if the server's tool set changes.
    pub async fn discover_tools(&self) -> Result<Vec<ToolDescriptor>, ConnectorError> {
        let result = self.request("tools/list", None).await?;
        let tools = protocol::parse_tools(&result);
        *self.tools.write().unwrap_or_else(|p| p.into_inner()) = tools.clone();
        tracing::debug!(connection = %self.id, count = tools.len(), "discovered tools");
        Ok(tools)
    }

    /// Invoke a tool and return the raw result payload unmodified.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ConnectorError> {
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }
}

// ─── Reader tasks ────────────────────────────────────────────────────────────

/// Forward stderr lines to the log. Never parsed as protocol.
fn spawn_stderr_logger(stderr: ChildStderr, conn_id: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(connection = %conn_id, "server stderr: {line}");
        }
    });
}

/// Single consumer of the stdout stream.
///
/// Owns the framing buffer exclusively. On EOF (process exited or closed
/// its pipe) transitions the state to `Closed` and rejects every request
/// still in the pending table, so no caller hangs forever.
async fn reader_loop(
    mut stdout: ChildStdout,
    pending: Pending,
    state: SharedState,
    notif_tx: mpsc::UnboundedSender<ServerNotification>,
    conn_id: String,
) {
    let mut framing = LineBuffer::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in framing.push(&chunk[..n]) {
                    dispatch_line(&pending, &notif_tx, &conn_id, &line).await;
                }
            }
        }
    }

    *state.write().unwrap_or_else(|p| p.into_inner()) = ConnectionState::Closed;

    let drained: Vec<_> = {
        let mut table = pending.lock().await;
        table.drain().collect()
    };
    if !drained.is_empty() {
        tracing::warn!(
            connection = %conn_id,
            in_flight = drained.len(),
            "server process exited with requests in flight"
        );
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(ConnectorError::ProcessExited {
            id: conn_id.clone(),
        }));
    }
    tracing::debug!(connection = %conn_id, "stdout reader ended");
}

/// Classify one complete line and route it.
///
/// Responses resolve their pending entry (removal first, then resolution);
/// responses with no matching entry are dropped silently. Malformed lines
/// are logged and never terminate the stream.
async fn dispatch_line(
    pending: &Pending,
    notif_tx: &mpsc::UnboundedSender<ServerNotification>,
    conn_id: &str,
    line: &str,
) {
    match protocol::classify(line) {
        Inbound::Response { id, result, error } => {
            let sender = pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let outcome = match error {
                        Some(err) => Err(ConnectorError::Server {
                            message: err.message,
                        }),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
                None => {
                    tracing::debug!(
                        connection = %conn_id,
                        request = %id,
                        "response for unknown request id, dropped"
                    );
                }
            }
        }
        Inbound::Notification { method, params } => {
            let _ = notif_tx.send(ServerNotification { method, params });
        }
        Inbound::Malformed { reason } => {
            tracing::warn!(connection = %conn_id, %reason, "discarding malformed line");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pending() -> Pending {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn test_dispatch_resolves_matching_response() {
        let pending = test_pending();
        let (notif_tx, _notif_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".to_string(), tx);

        dispatch_line(
            &pending,
            &notif_tx,
            "c",
            r#"{"jsonrpc":"2.0","id":"req-1","result":{"ok":true}}"#,
        )
        .await;

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome["ok"], true);
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_with_server_message_verbatim() {
        let pending = test_pending();
        let (notif_tx, _notif_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-2".to_string(), tx);

        dispatch_line(
            &pending,
            &notif_tx,
            "c",
            r#"{"jsonrpc":"2.0","id":"req-2","error":{"code":-32000,"message":"tool exploded"}}"#,
        )
        .await;

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "tool exploded");
    }

    #[tokio::test]
    async fn test_dispatch_drops_unknown_response_id() {
        let pending = test_pending();
        let (notif_tx, _notif_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("alive".to_string(), tx);

        // A response for an id that already timed out must not disturb
        // other entries.
        dispatch_line(
            &pending,
            &notif_tx,
            "c",
            r#"{"jsonrpc":"2.0","id":"expired","result":{}}"#,
        )
        .await;

        assert_eq!(pending.lock().await.len(), 1);
        drop(pending);
        assert!(rx.await.is_err()); // never resolved, sender dropped
    }

    #[tokio::test]
    async fn test_dispatch_forwards_notifications() {
        let pending = test_pending();
        let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();

        dispatch_line(
            &pending,
            &notif_tx,
            "c",
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"pct":50}}"#,
        )
        .await;

        let note = notif_rx.recv().await.unwrap();
        assert_eq!(note.method, "notifications/progress");
        assert_eq!(note.params.unwrap()["pct"], 50);
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_survives_malformed_between_valid_lines() {
        let pending = test_pending();
        let (notif_tx, _notif_rx) = mpsc::unbounded_channel();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        pending.lock().await.insert("a".to_string(), tx_a);
        pending.lock().await.insert("b".to_string(), tx_b);

        dispatch_line(&pending, &notif_tx, "c", r#"{"jsonrpc":"2.0","id":"a","result":1}"#).await;
        dispatch_line(&pending, &notif_tx, "c", "not json").await;
        dispatch_line(&pending, &notif_tx, "c", r#"{"jsonrpc":"2.0","id":"b","result":2}"#).await;

        assert_eq!(rx_a.await.unwrap().unwrap(), 1);
        assert_eq!(rx_b.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_connection_starts_disconnected() {
        let conn = Connection::new(ConnectionConfig::new("true"));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        assert!(conn.server_info().is_none());
        assert!(conn.tools().is_empty());
    }

    #[tokio::test]
    async fn test_request_on_disconnected_fails_not_running() {
        let conn = Connection::new(ConnectionConfig::new("true"));
        let err = conn.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotRunning { .. }));
        assert!(conn.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_on_never_connected_is_safe_and_idempotent() {
        let conn = Connection::new(ConnectionConfig::new("true"));
        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_take_notifications_yields_once() {
        let conn = Connection::new(ConnectionConfig::new("true"));
        assert!(conn.take_notifications().is_some());
        assert!(conn.take_notifications().is_none());
    }
}
