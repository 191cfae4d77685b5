//! ServerSession — the host-facing handle.
//!
//! Construction is startup: `start()` resolves the binary, merges settings,
//! and spawns the supervising task. Locator and merge failures surface
//! synchronously; everything after that arrives as [`SessionEvent`]s and
//! state changes on the watch channel.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::locator::{Platform, ServerLocator, default_cache_dir};
use crate::protocol;
use crate::settings;
use crate::supervisor::{self, Supervision, Timeouts};
use crate::types::{SessionConfig, SessionEvent, SessionState};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// One supervised language-server subprocess and its message relay.
///
/// At most one subprocess is alive per session; restarts fully tear down the
/// old process first. Dropping the handle stops the session gracefully.
#[derive(Debug)]
pub struct ServerSession {
    outbound_tx: mpsc::Sender<serde_json::Value>,
    event_rx: mpsc::Receiver<SessionEvent>,
    state_rx: watch::Receiver<SessionState>,
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
    timeouts: Timeouts,
}

impl ServerSession {
    /// Resolve, configure, and launch the server described by `config`.
    ///
    /// If the binary cannot be found but a download URL is configured, it is
    /// installed into the cache first. Merge conflicts and locator failures
    /// are session-start failures; crashes after this point are reported as
    /// events and retried per the restart policy.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        let cache_dir = config
            .cache_dir
            .clone()
            .or_else(default_cache_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("lsp-bridge"));
        let locator = ServerLocator::new(cache_dir);
        let platform = Platform::current();

        let descriptor = match locator.resolve(&config.server, platform) {
            Ok(descriptor) => descriptor,
            Err(BridgeError::BinaryNotFound { .. }) if config.server.download_url.is_some() => {
                locator.install(&config.server, platform).await?
            }
            Err(e) => return Err(e),
        };

        let merged = settings::merge(&config.defaults, &config.overrides)?;
        let root_uri = protocol::path_to_file_uri(&config.workspace_root)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Uninitialized);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let timeouts = config.timeouts.clone();
        let task = tokio::spawn(supervisor::run(Supervision {
            descriptor,
            settings: Arc::new(merged),
            root_uri: root_uri.to_string(),
            restart: config.restart,
            timeouts: config.timeouts,
            state_tx,
            event_tx,
            outbound_rx,
            stop_rx,
        }));

        Ok(Self {
            outbound_tx,
            event_rx,
            state_rx,
            stop_tx,
            task,
            timeouts,
        })
    }

    /// Enqueue one host→server message. The bridge adds framing; the content
    /// is not interpreted. Messages are written in the order they are sent.
    pub async fn send(&self, msg: serde_json::Value) -> Result<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Next event from the session. `None` once the session is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// A watch receiver for observing state transitions.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Gracefully stop the session, forcing termination after the configured
    /// grace period. Consumes the handle; bounded.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(()).await;
        // Graceful stop is two grace windows (shutdown response + exit wait)
        // plus slack for the kill itself.
        let bound = self.timeouts.shutdown_grace() * 2 + std::time::Duration::from_secs(3);
        if tokio::time::timeout(bound, &mut self.task).await.is_err() {
            tracing::warn!("session task did not stop in time; aborting");
            self.task.abort();
        }
    }
}
