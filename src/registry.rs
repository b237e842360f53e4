//! Connection registry: a keyed collection of live connections.
//!
//! Owns `id → Connection` entries and provides reconnection-aware connect,
//! pass-through disconnect/status/list/call, and serialized connect
//! sequencing so two concurrent connects for the same new id cannot race to
//! spawn duplicate processes.
//!
//! Entry-removal asymmetry, by contract: an explicit `disconnect(id)`
//! removes the registry entry; an implicit process crash leaves the entry
//! queryable in a closed state until the caller disconnects or reconnects.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::{ConnectionConfig, RegistryConfig};
use crate::connection::Connection;
use crate::errors::ConnectorError;
use crate::protocol::{ServerInfo, ToolDescriptor};

// ─── Result types ────────────────────────────────────────────────────────────

/// Outcome of a registry connect.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectResult {
    pub id: String,
    pub name: String,
    /// True when an existing live entry was reused and no process was
    /// spawned.
    pub already_connected: bool,
    pub server_info: Option<ServerInfo>,
    pub tools: Vec<ToolDescriptor>,
}

/// Point-in-time view of one registry entry.
///
/// `exists: false` distinguishes "no such id" from "exists but not
/// connected", which in turn is distinguishable from "connected": enough
/// for a caller to decide whether to reconnect.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub id: String,
    pub exists: bool,
    pub connected: bool,
    pub name: Option<String>,
    pub server_info: Option<ServerInfo>,
    pub tools: Vec<ToolDescriptor>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    fn absent(id: &str) -> Self {
        Self {
            id: id.to_string(),
            exists: false,
            connected: false,
            name: None,
            server_info: None,
            tools: Vec::new(),
            connected_at: None,
        }
    }
}

/// One row of `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub name: String,
    pub connected: bool,
    pub tool_count: usize,
    pub connected_at: Option<DateTime<Utc>>,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Keyed collection of connections.
///
/// Explicitly constructed and passed to whatever owns its lifetime; call
/// `disconnect_all` at process shutdown.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    /// Serializes connect/disconnect sequences. Read paths (`status`,
    /// `list`, `call_tool`) never wait on it.
    connect_gate: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    fn known_ids(&self) -> String {
        let mut ids: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        if ids.is_empty() {
            return "none".to_string();
        }
        ids.sort();
        ids.join(", ")
    }

    // ─── Connect / Disconnect ────────────────────────────────────────────

    /// Connect, reusing an existing live entry for the same id.
    ///
    /// A live entry is returned as-is with `already_connected: true` and no
    /// new I/O. A stale entry is torn down first, then the connect proceeds
    /// fresh: spawn, handshake, discovery, insert. A failure at any step
    /// disconnects the partial connection and leaves no registry entry.
    pub async fn connect(
        &self,
        mut config: ConnectionConfig,
    ) -> Result<ConnectResult, ConnectorError> {
        let id = config.resolve_id();
        let _gate = self.connect_gate.lock().await;

        if let Some(existing) = self.get(&id) {
            if existing.is_connected() {
                tracing::debug!(connection = %id, "reusing live connection");
                return Ok(ConnectResult {
                    id,
                    name: existing.name().to_string(),
                    already_connected: true,
                    server_info: existing.server_info(),
                    tools: existing.tools(),
                });
            }
            tracing::info!(connection = %id, "tearing down stale entry before reconnect");
            existing.disconnect().await;
            self.connections
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
        }

        let conn = Arc::new(Connection::new(config));
        if let Err(e) = conn.connect().await {
            conn.disconnect().await;
            return Err(e);
        }
        let tools = match conn.discover_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                conn.disconnect().await;
                return Err(e);
            }
        };

        let result = ConnectResult {
            id: id.clone(),
            name: conn.name().to_string(),
            already_connected: false,
            server_info: conn.server_info(),
            tools,
        };
        self.connections
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, conn);
        Ok(result)
    }

    /// Disconnect and remove the entry. Returns whether an entry existed.
    pub async fn disconnect(&self, id: &str) -> bool {
        let _gate = self.connect_gate.lock().await;
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        match removed {
            Some(conn) => {
                conn.disconnect().await;
                tracing::info!(connection = %id, "disconnected");
                true
            }
            None => false,
        }
    }

    /// Tear down every entry. For process shutdown.
    pub async fn disconnect_all(&self) {
        let _gate = self.connect_gate.lock().await;
        let drained: Vec<Arc<Connection>> = {
            let mut map = self
                .connections
                .write()
                .unwrap_or_else(|p| p.into_inner());
            map.drain().map(|(_, conn)| conn).collect()
        };
        futures::future::join_all(drained.iter().map(|conn| conn.disconnect())).await;
    }

    /// Connect every server in a config document.
    ///
    /// Partial startup is acceptable; failures are returned per id rather
    /// than aborting the rest.
    pub async fn connect_all(&self, config: RegistryConfig) -> Vec<(String, ConnectorError)> {
        let attempts = config.servers.into_iter().map(|(id, mut server)| {
            server.id = Some(id.clone());
            async move { (id, self.connect(server).await) }
        });

        let mut errors = Vec::new();
        for (id, outcome) in futures::future::join_all(attempts).await {
            match outcome {
                Ok(result) => {
                    tracing::info!(
                        connection = %id,
                        tools = result.tools.len(),
                        "startup connect succeeded"
                    );
                }
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "startup connect failed");
                    errors.push((id, e));
                }
            }
        }
        errors
    }

    // ─── Read accessors ──────────────────────────────────────────────────

    /// Current state of one entry, absent ids included.
    pub fn status(&self, id: &str) -> ConnectionStatus {
        match self.get(id) {
            Some(conn) => ConnectionStatus {
                id: id.to_string(),
                exists: true,
                connected: conn.is_connected(),
                name: Some(conn.name().to_string()),
                server_info: conn.server_info(),
                tools: conn.tools(),
                connected_at: conn.connected_at(),
            },
            None => ConnectionStatus::absent(id),
        }
    }

    /// Summaries of every entry, sorted by id.
    pub fn list(&self) -> Vec<ConnectionSummary> {
        let mut rows: Vec<ConnectionSummary> = self
            .connections
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|conn| ConnectionSummary {
                id: conn.id().to_string(),
                name: conn.name().to_string(),
                connected: conn.is_connected(),
                tool_count: conn.tools().len(),
                connected_at: conn.connected_at(),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    // ─── Tool operations ─────────────────────────────────────────────────

    /// Invoke a tool on a connection by id.
    ///
    /// Distinguishes "never existed" (`UnknownConnection`, enumerating the
    /// known ids) from "existed but died" (`NotActive`).
    pub async fn call_tool(
        &self,
        id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ConnectorError> {
        let conn = self.get(id).ok_or_else(|| ConnectorError::UnknownConnection {
            id: id.to_string(),
            known: self.known_ids(),
        })?;
        if !conn.is_connected() {
            return Err(ConnectorError::NotActive { id: id.to_string() });
        }
        conn.call_tool(name, arguments).await
    }

    /// Explicitly re-run tool discovery on a live connection.
    pub async fn discover_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>, ConnectorError> {
        let conn = self.get(id).ok_or_else(|| ConnectorError::UnknownConnection {
            id: id.to_string(),
            known: self.known_ids(),
        })?;
        if !conn.is_connected() {
            return Err(ConnectorError::NotActive { id: id.to_string() });
        }
        conn.discover_tools().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert_idle(registry: &Registry, id: &str) {
        // A constructed-but-never-connected entry: exists, not connected.
        let mut config = ConnectionConfig::new("true");
        config.id = Some(id.to_string());
        registry
            .connections
            .write()
            .unwrap()
            .insert(id.to_string(), Arc::new(Connection::new(config)));
    }

    #[test]
    fn test_status_unknown_id() {
        let registry = Registry::new();
        let status = registry.status("ghost");
        assert!(!status.exists);
        assert!(!status.connected);
        assert!(status.tools.is_empty());
    }

    #[test]
    fn test_status_distinguishes_existing_not_connected() {
        let registry = Registry::new();
        insert_idle(&registry, "fs");
        let status = registry.status("fs");
        assert!(status.exists);
        assert!(!status.connected);
    }

    #[test]
    fn test_list_empty_and_sorted() {
        let registry = Registry::new();
        assert!(registry.list().is_empty());

        insert_idle(&registry, "zeta");
        insert_idle(&registry, "alpha");
        let rows = registry.list();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "alpha");
        assert_eq!(rows[1].id, "zeta");
    }

    #[tokio::test]
    async fn test_call_tool_unknown_connection_enumerates_known() {
        let registry = Registry::new();
        insert_idle(&registry, "fs");
        insert_idle(&registry, "web");

        let err = registry.call_tool("ghost", "echo", json!({})).await.unwrap_err();
        match err {
            ConnectorError::UnknownConnection { id, known } => {
                assert_eq!(id, "ghost");
                assert_eq!(known, "fs, web");
            }
            other => panic!("expected UnknownConnection, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_call_tool_unknown_with_empty_registry() {
        let registry = Registry::new();
        let err = registry.call_tool("ghost", "echo", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("none"));
    }

    #[tokio::test]
    async fn test_call_tool_on_dead_entry_is_not_active() {
        let registry = Registry::new();
        insert_idle(&registry, "fs");
        let err = registry.call_tool("fs", "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotActive { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_returns_false() {
        let registry = Registry::new();
        assert!(!registry.disconnect("ghost").await);
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry() {
        let registry = Registry::new();
        insert_idle(&registry, "fs");
        assert!(registry.disconnect("fs").await);
        assert!(!registry.status("fs").exists);
        // Idempotent at the registry level: second call reports no entry.
        assert!(!registry.disconnect("fs").await);
    }

    #[tokio::test]
    async fn test_connect_all_empty_config() {
        let registry = Registry::new();
        let errors = registry
            .connect_all(RegistryConfig {
                servers: HashMap::new(),
            })
            .await;
        assert!(errors.is_empty());
    }
}
