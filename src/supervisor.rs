//! Process supervision — spawn, relay, restart.
//!
//! One supervising task per session. Each incarnation of the subprocess gets
//! a dedicated reader task and a dedicated writer task; each blocks only on
//! its own stream. Outgoing messages funnel through one bounded channel, so
//! the child's stdin never sees concurrent writers and per-direction order
//! is preserved.
//!
//! Crashes are retried with exponential backoff up to the policy limit; the
//! old incarnation is fully torn down (tasks ended, child reaped) before a
//! new one is spawned, so at most one subprocess is ever alive per session.
//! Framing corruption is terminal and never consumes restart budget.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{BridgeError, Result};
use crate::locator::ServerDescriptor;
use crate::protocol::{self, Incoming, Notification, Request};
use crate::types::{SessionEvent, SessionState};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Bounded-retry restart policy with exponential backoff.
///
/// Defaults are proposals, not constants: two restarts, 500ms initial
/// backoff doubling to an 8s cap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Restarts attempted after the initial launch before giving up.
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `restart` (0-based): doubles each time,
    /// capped at `max_backoff_ms`.
    #[must_use]
    pub fn backoff_for(&self, restart: u32) -> Duration {
        let factor = 1u64 << restart.min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Session timeouts. All configurable; defaults follow common practice for
/// slow-starting language servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Window for the initialize handshake to complete.
    pub initialize_ms: u64,
    /// Grace period for a polite shutdown before the child is killed.
    pub shutdown_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            initialize_ms: 30_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl Timeouts {
    #[must_use]
    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

enum ReaderEnd {
    Eof,
    Malformed(String),
}

enum IncarnationEnd {
    Stopped,
    Crashed { exit_code: Option<i32> },
    Transport(String),
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>;

/// Everything the supervising task owns.
pub(crate) struct Supervision {
    pub descriptor: ServerDescriptor,
    pub settings: Arc<serde_json::Value>,
    pub root_uri: String,
    pub restart: RestartPolicy,
    pub timeouts: Timeouts,
    pub state_tx: watch::Sender<SessionState>,
    pub event_tx: mpsc::Sender<SessionEvent>,
    pub outbound_rx: mpsc::Receiver<serde_json::Value>,
    /// Stop requests. A closed channel (host dropped the handle) also stops.
    pub stop_rx: mpsc::Receiver<()>,
}

/// Supervising loop: spawn, relay until the incarnation ends, then apply the
/// restart policy. Runs until the session reaches `Stopped`.
pub(crate) async fn run(mut sup: Supervision) {
    let mut attempt: u32 = 0;
    loop {
        set_state(&sup.state_tx, SessionState::Starting { attempt });
        match run_incarnation(&mut sup, attempt).await {
            IncarnationEnd::Stopped => {
                set_state(&sup.state_tx, SessionState::Stopped);
                return;
            }
            IncarnationEnd::Transport(reason) => {
                tracing::warn!(
                    server = %sup.descriptor.name(),
                    %reason,
                    "transport failure; closing session"
                );
                let _ = sup.event_tx.send(SessionEvent::TransportError(reason)).await;
                set_state(&sup.state_tx, SessionState::Stopped);
                return;
            }
            IncarnationEnd::Crashed { exit_code } => {
                tracing::warn!(
                    server = %sup.descriptor.name(),
                    ?exit_code,
                    "language server crashed"
                );
                let _ = sup.event_tx.send(SessionEvent::Crashed { exit_code }).await;
                set_state(&sup.state_tx, SessionState::Crashed);

                if attempt >= sup.restart.max_restarts {
                    tracing::warn!(
                        server = %sup.descriptor.name(),
                        attempts = attempt,
                        "restart budget exhausted; server unavailable"
                    );
                    let _ = sup
                        .event_tx
                        .send(SessionEvent::Unavailable { attempts: attempt })
                        .await;
                    set_state(&sup.state_tx, SessionState::Stopped);
                    return;
                }

                let delay = sup.restart.backoff_for(attempt);
                attempt += 1;
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = sup.stop_rx.recv() => {
                        // No subprocess alive during backoff; still walk
                        // through Stopping so observers see the documented
                        // transition order.
                        set_state(&sup.state_tx, SessionState::Stopping);
                        set_state(&sup.state_tx, SessionState::Stopped);
                        return;
                    }
                }
            }
        }
    }
}

async fn run_incarnation(sup: &mut Supervision, attempt: u32) -> IncarnationEnd {
    tracing::info!(
        server = %sup.descriptor.name(),
        path = %sup.descriptor.path().display(),
        attempt,
        "spawning language server"
    );
    let (mut child, stdin, stdout) = match spawn_child(&sup.descriptor) {
        Ok(io) => io,
        Err(e) => {
            tracing::warn!(server = %sup.descriptor.name(), error = %e, "spawn failed");
            return IncarnationEnd::Crashed { exit_code: None };
        }
    };

    let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
    let _writer_handle = tokio::spawn(async move {
        let mut writer = FrameWriter::new(stdin);
        while let Some(cmd) = writer_rx.recv().await {
            match cmd {
                WriterCommand::Send(frame) => {
                    if let Err(e) = writer.write_frame(&frame).await {
                        tracing::warn!("server stdin write failed: {e}");
                        break;
                    }
                }
                WriterCommand::Shutdown => break,
            }
        }
    });

    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

    let reader_pending = pending.clone();
    let reader_event_tx = sup.event_tx.clone();
    let reader_writer_tx = writer_tx.clone();
    let reader_settings = sup.settings.clone();
    let mut reader_handle = tokio::spawn(async move {
        let mut reader = FrameReader::new(stdout);
        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => {
                    route_frame(
                        frame,
                        &reader_pending,
                        &reader_event_tx,
                        &reader_writer_tx,
                        &reader_settings,
                    )
                    .await;
                }
                Ok(None) => return ReaderEnd::Eof,
                Err(BridgeError::MalformedFrame { reason }) => {
                    return ReaderEnd::Malformed(reason);
                }
                Err(e) => {
                    tracing::warn!("server stdout read failed: {e}");
                    return ReaderEnd::Eof;
                }
            }
        }
    });

    let mut next_id: u64 = 1;
    let init_params = protocol::initialize_params(&sup.root_uri, &sup.settings);
    let mut init_rx =
        match send_request(&writer_tx, &pending, &mut next_id, "initialize", Some(init_params))
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enqueue initialize");
                let _ = child.kill().await;
                return IncarnationEnd::Crashed { exit_code: None };
            }
        };

    let mut init_pending = true;
    let init_deadline = tokio::time::sleep(sup.timeouts.initialize());
    tokio::pin!(init_deadline);

    loop {
        tokio::select! {
            _ = sup.stop_rx.recv() => {
                set_state(&sup.state_tx, SessionState::Stopping);
                graceful_stop(&mut child, &writer_tx, &pending, &mut next_id, &sup.timeouts).await;
                return IncarnationEnd::Stopped;
            }
            status = child.wait() => {
                // The reader terminates promptly once the child's stdout
                // closes; its verdict decides crash versus corruption, so a
                // malformed frame is never misreported as a crash.
                if let Ok(ReaderEnd::Malformed(reason)) = (&mut reader_handle).await {
                    return IncarnationEnd::Transport(reason);
                }
                let exit_code = status.ok().and_then(|s| s.code());
                return IncarnationEnd::Crashed { exit_code };
            }
            res = &mut init_rx, if init_pending => {
                init_pending = false;
                match res {
                    Ok(body) if body.get("error").is_none() => {
                        tracing::info!(server = %sup.descriptor.name(), "language server initialized");
                        let _ = send_notification(
                            &writer_tx,
                            "initialized",
                            Some(serde_json::json!({})),
                        )
                        .await;
                        set_state(&sup.state_tx, SessionState::Running);
                    }
                    Ok(body) => {
                        tracing::warn!(
                            server = %sup.descriptor.name(),
                            "initialize rejected: {}",
                            body["error"]["message"].as_str().unwrap_or("unknown error")
                        );
                        let _ = child.kill().await;
                        return IncarnationEnd::Crashed { exit_code: None };
                    }
                    // Response channel dropped; the exit arm will pick the
                    // child up shortly.
                    Err(_) => {}
                }
            }
            () = &mut init_deadline, if init_pending => {
                tracing::warn!(server = %sup.descriptor.name(), "initialize timed out");
                let _ = child.kill().await;
                return IncarnationEnd::Crashed { exit_code: None };
            }
            out = sup.outbound_rx.recv() => {
                match out {
                    Some(frame) => {
                        if writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
                            tracing::warn!("writer task gone; dropping outbound message");
                        }
                    }
                    None => {
                        // Host dropped the session handle.
                        set_state(&sup.state_tx, SessionState::Stopping);
                        graceful_stop(&mut child, &writer_tx, &pending, &mut next_id, &sup.timeouts)
                            .await;
                        return IncarnationEnd::Stopped;
                    }
                }
            }
            end = &mut reader_handle => {
                match end {
                    Ok(ReaderEnd::Malformed(reason)) => {
                        let _ = child.kill().await;
                        return IncarnationEnd::Transport(reason);
                    }
                    // EOF or reader panic: the process is on its way out.
                    _ => {
                        let exit_code = match tokio::time::timeout(
                            sup.timeouts.shutdown_grace(),
                            child.wait(),
                        )
                        .await
                        {
                            Ok(Ok(status)) => status.code(),
                            _ => {
                                let _ = child.kill().await;
                                None
                            }
                        };
                        return IncarnationEnd::Crashed { exit_code };
                    }
                }
            }
        }
    }
}

/// Polite LSP farewell, then force within the grace period.
async fn graceful_stop(
    child: &mut Child,
    writer_tx: &mpsc::Sender<WriterCommand>,
    pending: &PendingMap,
    next_id: &mut u64,
    timeouts: &Timeouts,
) {
    if let Ok(rx) = send_request(writer_tx, pending, next_id, "shutdown", None).await
        && let Ok(Ok(body)) = tokio::time::timeout(timeouts.shutdown_grace(), rx).await
        && body.get("error").is_none()
    {
        let _ = send_notification(writer_tx, "exit", None).await;
    }

    // Ending the writer task drops the child's stdin; well-behaved servers
    // exit on EOF even without having answered the shutdown request.
    let _ = writer_tx.send(WriterCommand::Shutdown).await;

    if tokio::time::timeout(timeouts.shutdown_grace(), child.wait())
        .await
        .is_err()
    {
        tracing::debug!("server ignored shutdown; killing");
        let _ = child.kill().await;
    }
}

fn spawn_child(descriptor: &ServerDescriptor) -> Result<(Child, ChildStdin, ChildStdout)> {
    let mut cmd = Command::new(descriptor.path());
    cmd.args(descriptor.args())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::Io(std::io::Error::other("child stdin not captured")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Io(std::io::Error::other("child stdout not captured")))?;
    Ok((child, stdin, stdout))
}

async fn send_request(
    writer_tx: &mpsc::Sender<WriterCommand>,
    pending: &PendingMap,
    next_id: &mut u64,
    method: &'static str,
    params: Option<serde_json::Value>,
) -> Result<oneshot::Receiver<serde_json::Value>> {
    let id = protocol::bridge_id(*next_id);
    *next_id += 1;

    let (tx, rx) = oneshot::channel();
    pending.lock().await.insert(id.clone(), tx);

    let frame = serde_json::to_value(Request::new(id.clone(), method, params))?;
    if writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
        // Don't leak the pending entry if the writer is already gone.
        pending.lock().await.remove(&id);
        return Err(BridgeError::ChannelClosed);
    }
    Ok(rx)
}

async fn send_notification(
    writer_tx: &mpsc::Sender<WriterCommand>,
    method: &'static str,
    params: Option<serde_json::Value>,
) -> Result<()> {
    let frame = serde_json::to_value(Notification::new(method, params))?;
    writer_tx
        .send(WriterCommand::Send(frame))
        .await
        .map_err(|_| BridgeError::ChannelClosed)
}

/// Route one server frame: bridge responses resolve pending requests,
/// `workspace/configuration` is answered from the merged settings tree,
/// everything else is relayed to the host verbatim.
async fn route_frame(
    frame: serde_json::Value,
    pending: &PendingMap,
    event_tx: &mpsc::Sender<SessionEvent>,
    writer_tx: &mpsc::Sender<WriterCommand>,
    settings: &serde_json::Value,
) {
    match protocol::classify(&frame) {
        Incoming::BridgeResponse { id } => {
            let sender = pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => tracing::trace!(%id, "response for unknown bridge request"),
            }
        }
        Incoming::ServerRequest { id, method, params }
            if method == "workspace/configuration" =>
        {
            let response = protocol::configuration_response(id, params.as_ref(), settings);
            let _ = writer_tx.send(WriterCommand::Send(response)).await;
        }
        Incoming::ServerRequest { .. } | Incoming::Relay => {
            if event_tx.send(SessionEvent::Message(frame)).await.is_err() {
                tracing::trace!("host event channel closed; dropping message");
            }
        }
    }
}

fn set_state(state_tx: &watch::Sender<SessionState>, state: SessionState) {
    tracing::debug!(?state, "session state");
    state_tx.send_replace(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_channels() -> (
        PendingMap,
        mpsc::Sender<SessionEvent>,
        mpsc::Receiver<SessionEvent>,
        mpsc::Sender<WriterCommand>,
        mpsc::Receiver<WriterCommand>,
    ) {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(32);
        let (writer_tx, writer_rx) = mpsc::channel(32);
        (pending, event_tx, event_rx, writer_tx, writer_rx)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            max_restarts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(8_000));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(8_000));
    }

    #[test]
    fn test_backoff_large_attempt_does_not_overflow() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_millis(8_000));
    }

    #[test]
    fn test_policy_and_timeout_defaults_deserialize() {
        let policy: RestartPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_restarts, 2);
        assert_eq!(policy.initial_backoff_ms, 500);

        let timeouts: Timeouts = serde_json::from_value(json!({"shutdown_grace_ms": 100})).unwrap();
        assert_eq!(timeouts.shutdown_grace(), Duration::from_millis(100));
        assert_eq!(timeouts.initialize(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_route_bridge_response_resolves_pending() {
        let (pending, event_tx, _event_rx, writer_tx, _writer_rx) = test_channels();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("bridge:1".to_string(), tx);

        let frame = json!({"jsonrpc": "2.0", "id": "bridge:1", "result": {"capabilities": {}}});
        route_frame(frame, &pending, &event_tx, &writer_tx, &json!({})).await;

        let response = rx.await.unwrap();
        assert!(response["result"]["capabilities"].is_object());
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_route_unknown_bridge_response_ignored() {
        let (pending, event_tx, mut event_rx, writer_tx, mut writer_rx) = test_channels();
        let frame = json!({"jsonrpc": "2.0", "id": "bridge:99", "result": {}});
        route_frame(frame, &pending, &event_tx, &writer_tx, &json!({})).await;
        assert!(event_rx.try_recv().is_err());
        assert!(writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_configuration_request_answered_from_settings() {
        let (pending, event_tx, mut event_rx, writer_tx, mut writer_rx) = test_channels();
        let settings = json!({"dialect": "British"});

        let frame = json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "workspace/configuration",
            "params": {"items": [{"section": "dialect"}]}
        });
        route_frame(frame, &pending, &event_tx, &writer_tx, &settings).await;

        match writer_rx.try_recv().unwrap() {
            WriterCommand::Send(response) => {
                assert_eq!(response["id"], 5);
                assert_eq!(response["result"][0], "British");
            }
            WriterCommand::Shutdown => panic!("expected Send, got Shutdown"),
        }
        // Answered locally, never surfaced to the host.
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_notification_relayed_verbatim() {
        let (pending, event_tx, mut event_rx, writer_tx, _writer_rx) = test_channels();
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {"uri": "file:///notes.md", "diagnostics": [{"message": "repeated word"}]}
        });
        route_frame(frame.clone(), &pending, &event_tx, &writer_tx, &json!({})).await;

        match event_rx.try_recv().unwrap() {
            SessionEvent::Message(relayed) => assert_eq!(relayed, frame),
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_other_server_request_relayed_to_host() {
        // The host, not the bridge, decides how to answer capability
        // registration and friends.
        let (pending, event_tx, mut event_rx, writer_tx, mut writer_rx) = test_channels();
        let frame = json!({
            "jsonrpc": "2.0",
            "id": 8,
            "method": "client/registerCapability",
            "params": {}
        });
        route_frame(frame.clone(), &pending, &event_tx, &writer_tx, &json!({})).await;

        match event_rx.try_recv().unwrap() {
            SessionEvent::Message(relayed) => assert_eq!(relayed, frame),
            other => panic!("expected Message, got {other:?}"),
        }
        assert!(writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_host_response_relayed() {
        let (pending, event_tx, mut event_rx, writer_tx, _writer_rx) = test_channels();
        let frame = json!({"jsonrpc": "2.0", "id": 42, "result": {}});
        route_frame(frame.clone(), &pending, &event_tx, &writer_tx, &json!({})).await;

        match event_rx.try_recv().unwrap() {
            SessionEvent::Message(relayed) => assert_eq!(relayed, frame),
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_request_tracks_pending_until_answered() {
        let (pending, _event_tx, _event_rx, writer_tx, mut writer_rx) = test_channels();
        let mut next_id = 1;

        let _rx = send_request(&writer_tx, &pending, &mut next_id, "initialize", None)
            .await
            .unwrap();
        assert_eq!(next_id, 2);
        assert!(pending.lock().await.contains_key("bridge:1"));

        match writer_rx.try_recv().unwrap() {
            WriterCommand::Send(frame) => {
                assert_eq!(frame["id"], "bridge:1");
                assert_eq!(frame["method"], "initialize");
            }
            WriterCommand::Shutdown => panic!("expected Send, got Shutdown"),
        }
    }

    #[tokio::test]
    async fn test_send_request_cleans_up_when_writer_gone() {
        let (pending, _event_tx, _event_rx, writer_tx, writer_rx) = test_channels();
        drop(writer_rx);
        let mut next_id = 1;

        let err = send_request(&writer_tx, &pending, &mut next_id, "shutdown", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed));
        assert!(pending.lock().await.is_empty());
    }
}
