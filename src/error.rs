//! Error taxonomy for the bridge.
//!
//! Locator and settings errors surface synchronously from session start.
//! Transport errors terminate the session with a single event. Crashes are
//! retried per [`RestartPolicy`](crate::supervisor::RestartPolicy) before
//! escalating to [`BridgeError::ServerUnavailable`].

use crate::locator::{Arch, Os};

/// Any failure the bridge can surface to the host.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The (OS, architecture) pair is outside the declared support matrix.
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: Os, arch: Arch },

    /// No executable found via explicit path, PATH lookup, or the cache.
    #[error("language server binary '{name}' not found")]
    BinaryNotFound { name: String },

    /// The subprocess exited outside a requested shutdown.
    #[error("language server crashed{}", .exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    ServerCrashed { exit_code: Option<i32> },

    /// Restart budget exhausted; the session will not come back.
    #[error("language server unavailable after {attempts} restart attempt(s)")]
    ServerUnavailable { attempts: u32 },

    /// Header/length mismatch or undecodable frame. Terminal for the session.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Type mismatch between a default and an override settings leaf.
    #[error("config merge conflict at '{path}': cannot merge {override_kind} into {default_kind}")]
    ConfigMergeConflict {
        path: String,
        default_kind: &'static str,
        override_kind: &'static str,
    },

    /// The session task is gone; no further messages can be relayed.
    #[error("session channel closed")]
    ChannelClosed,

    #[error("cannot convert path to file URI: {path}")]
    PathToUri { path: String },

    #[error("downloading server binary failed")]
    Download(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
