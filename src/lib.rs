//! Subprocess MCP connector engine.
//!
//! Launches external tool-provider programs as child processes, speaks
//! JSON-RPC 2.0 (MCP) with them over stdio, and exposes a uniform
//! connect/discover/invoke/disconnect surface:
//!
//! - [`Connection`]: one child process and its protocol session (framing,
//!   handshake, request correlation, timeouts).
//! - [`Registry`]: a keyed collection of connections with idempotent
//!   connect, status listing, and tool invocation by id.
//!
//! The engine covers `initialize`, `notifications/initialized`,
//! `tools/list`, and `tools/call` over newline-delimited JSON. HTTP
//! exposure, config persistence, and tool semantics belong to callers.
//!
//! ```no_run
//! use mcp_bridge::{ConnectionConfig, Registry};
//!
//! # async fn demo() -> Result<(), mcp_bridge::ConnectorError> {
//! let registry = Registry::new();
//!
//! let mut config = ConnectionConfig::new("npx");
//! config.args = vec!["tsx".into(), "src/index.ts".into()];
//! config.id = Some("filesystem".into());
//!
//! let result = registry.connect(config).await?;
//! println!("{} tools from {}", result.tools.len(), result.name);
//!
//! let output = registry
//!     .call_tool("filesystem", "list_dir", serde_json::json!({"path": "."}))
//!     .await?;
//! println!("{output}");
//!
//! registry.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod errors;
pub mod framing;
pub mod protocol;
pub mod registry;

pub use config::{ConnectionConfig, RegistryConfig, DEFAULT_REQUEST_TIMEOUT_MS};
pub use connection::{Connection, ConnectionState, ServerNotification};
pub use errors::ConnectorError;
pub use protocol::{ServerInfo, ToolDescriptor};
pub use registry::{ConnectResult, ConnectionStatus, ConnectionSummary, Registry};
