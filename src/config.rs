//! Connection launch parameters.
//!
//! `ConnectionConfig` carries everything needed to spawn one server process;
//! `RegistryConfig` is the top-level document mapping stable ids to configs.
//! Both deserialize from the caller's JSON; the engine never writes them back.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Default request timeout when a config does not override it.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Launch parameters for a single server connection.
///
/// Copied into the `Connection` at construction; the engine treats it as
/// immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Stable identifier. Generated (UUIDv4) when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Executable name or path. Spawned directly, no shell.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables, merged over the host environment.
    /// These win on key collision.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Display label. Defaults to `command`.
    #[serde(default)]
    pub name: Option<String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Per-connection request timeout. Defaults to 30s.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl ConnectionConfig {
    /// Minimal config for a bare command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            name: None,
            cwd: None,
            request_timeout_ms: None,
        }
    }

    /// Resolve the stable id, generating one if the caller left it unset.
    pub fn resolve_id(&mut self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.id = Some(id.clone());
                id
            }
        }
    }

    /// Display label for status output.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.command)
    }

    /// Effective request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(
            self.request_timeout_ms
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        )
    }
}

/// Top-level connections document: `id → ConnectionConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub servers: HashMap<String, ConnectionConfig>,
}

impl RegistryConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_deserializes_with_defaults() {
        let cfg: ConnectionConfig =
            serde_json::from_str(r#"{"command": "npx"}"#).unwrap();
        assert_eq!(cfg.command, "npx");
        assert!(cfg.args.is_empty());
        assert!(cfg.env.is_empty());
        assert_eq!(cfg.id, None);
        assert_eq!(cfg.display_name(), "npx");
        assert_eq!(
            cfg.request_timeout(),
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_resolve_id_generates_once() {
        let mut cfg = ConnectionConfig::new("python3");
        let first = cfg.resolve_id();
        let second = cfg.resolve_id();
        assert_eq!(first, second);
        assert_eq!(cfg.id.as_deref(), Some(first.as_str()));
    }

    #[test]
    fn test_resolve_id_keeps_caller_id() {
        let mut cfg = ConnectionConfig::new("python3");
        cfg.id = Some("filesystem".to_string());
        assert_eq!(cfg.resolve_id(), "filesystem");
    }

    #[test]
    fn test_explicit_name_and_timeout() {
        let cfg: ConnectionConfig = serde_json::from_str(
            r#"{"command": "node", "name": "files", "request_timeout_ms": 500}"#,
        )
        .unwrap();
        assert_eq!(cfg.display_name(), "files");
        assert_eq!(cfg.request_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_registry_config_from_json() {
        let cfg = RegistryConfig::from_json(
            r#"{
                "servers": {
                    "filesystem": {"command": "npx", "args": ["tsx", "src/index.ts"]},
                    "knowledge": {"command": "python3", "env": {"PYTHONUNBUFFERED": "1"}}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(cfg.servers["filesystem"].args, vec!["tsx", "src/index.ts"]);
        assert_eq!(cfg.servers["knowledge"].env["PYTHONUNBUFFERED"], "1");
    }
}
