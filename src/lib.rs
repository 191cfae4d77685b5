//! Launcher/bridge for external diagnostic-producing language servers.
//!
//! Hosts use this crate to spawn an externally-maintained language server
//! (e.g. a grammar checker like `harper-ls`), feed it a merged settings tree
//! at initialization, and exchange Content-Length framed JSON-RPC messages
//! over its standard streams without interpreting them. The bridge owns the
//! subprocess lifecycle: binary resolution and caching, crash detection with
//! bounded-backoff restarts, and graceful-then-forced shutdown.
//!
//! ```no_run
//! use lsp_bridge::{ServerSession, SessionConfig};
//!
//! # async fn demo() -> lsp_bridge::Result<()> {
//! let config: SessionConfig = serde_json::from_value(serde_json::json!({
//!     "server": { "name": "harper-ls" },
//!     "workspace_root": "/home/me/notes",
//!     "overrides": { "dialect": "British" }
//! }))?;
//! let mut session = ServerSession::start(config).await?;
//! while let Some(_event) = session.next_event().await {
//!     // diagnostics notifications, server requests, lifecycle events...
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod locator;
pub mod settings;
pub mod supervisor;
pub mod types;

pub(crate) mod protocol;

mod session;

pub use error::{BridgeError, Result};
pub use locator::{Arch, Os, Platform, ServerDescriptor, ServerLocator, default_cache_dir};
pub use session::ServerSession;
pub use settings::merge;
pub use supervisor::{RestartPolicy, Timeouts};
pub use types::{ServerConfig, SessionConfig, SessionEvent, SessionState};
