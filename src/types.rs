//! Public configuration and event types.
//!
//! The host constructs a [`SessionConfig`], starts a
//! [`ServerSession`](crate::ServerSession), observes
//! [`SessionState`] through a watch channel, and consumes [`SessionEvent`]s.
//! Settings trees are opaque [`serde_json::Value`]s; their schema is owned by
//! the external server and never validated here.

use std::path::PathBuf;

use serde::Deserialize;

use crate::supervisor::{RestartPolicy, Timeouts};

fn default_args() -> Vec<String> {
    // Transport-selection flag: stdio JSON-RPC framing.
    vec!["--stdio".to_string()]
}

fn default_settings() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Configuration for one external language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable name (e.g. "harper-ls"). Also the PATH lookup key.
    pub name: String,
    /// Explicit executable path. Takes precedence over PATH and cache lookup.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Launch arguments. Defaults to `["--stdio"]`.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Version used as the binary cache key. Defaults to "latest".
    #[serde(default)]
    pub version: Option<String>,
    /// Download URL template for cache installs. `{version}` and `{triple}`
    /// placeholders are substituted at install time.
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Configuration for a whole bridge session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub server: ServerConfig,
    /// Workspace root sent as `rootUri` in the initialize payload.
    pub workspace_root: PathBuf,
    /// Binary cache directory. Defaults to the per-user cache dir.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Server-specific default settings tree.
    #[serde(default = "default_settings")]
    pub defaults: serde_json::Value,
    /// Host/user overrides merged over `defaults`; override values win.
    #[serde(default = "default_settings")]
    pub overrides: serde_json::Value,
}

/// Lifecycle state of a session.
///
/// `Uninitialized → Starting → Running → {Stopping → Stopped} | Crashed`;
/// `Crashed` goes back to `Starting` while the restart policy permits,
/// otherwise the session rests in `Stopped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Session handle exists but no subprocess has been spawned yet.
    Uninitialized,
    /// Subprocess spawned, initialize handshake in flight.
    /// `attempt` is 0 for the first launch, N for the Nth restart.
    Starting { attempt: u32 },
    /// Initialize handshake completed; messages flow both ways.
    Running,
    /// Graceful shutdown requested.
    Stopping,
    /// Terminal. Reached by graceful stop, restart exhaustion, or a
    /// transport failure.
    Stopped,
    /// Subprocess exited unexpectedly.
    Crashed,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        *self == Self::Stopped
    }
}

/// An event surfaced to the host.
#[derive(Debug)]
pub enum SessionEvent {
    /// A server→host frame, relayed verbatim. Could be a notification, a
    /// response to a host-issued request, or a server-issued request the
    /// host is expected to answer.
    Message(serde_json::Value),
    /// The subprocess exited outside a requested shutdown.
    Crashed { exit_code: Option<i32> },
    /// Restart budget exhausted; `attempts` restarts were made.
    Unavailable { attempts: u32 },
    /// Framing failure on the server's output stream. Terminal.
    TransportError(String),
}

impl SessionEvent {
    /// The error this event corresponds to, for hosts that propagate
    /// failures instead of handling events in place. Relayed messages are
    /// not errors.
    #[must_use]
    pub fn as_error(&self) -> Option<crate::error::BridgeError> {
        match self {
            Self::Message(_) => None,
            Self::Crashed { exit_code } => Some(crate::error::BridgeError::ServerCrashed {
                exit_code: *exit_code,
            }),
            Self::Unavailable { attempts } => Some(crate::error::BridgeError::ServerUnavailable {
                attempts: *attempts,
            }),
            Self::TransportError(reason) => Some(crate::error::BridgeError::MalformedFrame {
                reason: reason.clone(),
            }),
        }
    }
}
