//! Per-session relay tasks and connection bookkeeping.
//!
//! Each live session gets one relay task that decodes PTY output and
//! assigns sequence numbers. Output flows to the attached WebSocket
//! connection only while the session is focused; otherwise it lands in
//! the session's bounded backlog. The backlog always drains to the
//! connection before newer chunks go live, so a client observes seq in
//! strictly increasing order even across focus changes and reattaches.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};
use crate::registry::SessionRegistry;
use crate::stream::buffer::OutputBuffer;
use crate::stream::decode::Utf8StreamDecoder;
use crate::stream::protocol::ServerMessage;

struct ConnState {
    conn_id: u64,
    tx: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    last_seen: Instant,
}

struct StreamEntry {
    buffer: OutputBuffer,
    conn: Option<ConnState>,
    relay_cancel: CancellationToken,
}

/// Returned from [`StreamManager::attach`]. The WebSocket handler holds
/// this for the connection's lifetime; `cancel` fires when the server
/// side ends the connection (replacement, watchdog, session close).
pub struct AttachGuard {
    pub session_id: String,
    pub conn_id: u64,
    pub cancel: CancellationToken,
}

pub struct StreamManager {
    registry: Arc<SessionRegistry>,
    streams: RwLock<HashMap<String, StreamEntry>>,
    next_conn_id: AtomicU64,
    events: EventBus,
    config: EngineConfig,
}

impl StreamManager {
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        let events = registry.events().clone();
        let config = registry.config().clone();
        Arc::new(Self {
            registry,
            streams: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            events,
            config,
        })
    }

    /// Follow the event bus: start a relay per created session, tear it
    /// down when the session closes. Suspension detaches any live
    /// connection; regaining focus flushes the backlog to it.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        match event {
                            SessionEvent::Created { session_id, .. } => {
                                manager.ensure_stream(&session_id).await;
                            }
                            SessionEvent::Closed { session_id, .. } => {
                                manager.remove_stream(&session_id).await;
                            }
                            SessionEvent::Suspended { session_ids, .. } => {
                                for id in &session_ids {
                                    manager.detach_current(id).await;
                                }
                            }
                            SessionEvent::FocusChanged {
                                session_id,
                                focused: true,
                                ..
                            } => {
                                manager.replay(&session_id).await;
                            }
                            _ => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("stream manager lagged {} events behind the bus", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn ensure_stream(self: &Arc<Self>, session_id: &str) {
        let relay_cancel = CancellationToken::new();
        {
            let mut streams = self.streams.write().await;
            if streams.contains_key(session_id) {
                return;
            }
            streams.insert(
                session_id.to_string(),
                StreamEntry {
                    buffer: OutputBuffer::new(
                        self.config.buffer_max_lines,
                        self.config.buffer_max_bytes,
                    ),
                    conn: None,
                    relay_cancel: relay_cancel.clone(),
                },
            );
        }
        self.spawn_relay(session_id.to_string(), relay_cancel);
    }

    async fn remove_stream(&self, session_id: &str) {
        let entry = self.streams.write().await.remove(session_id);
        let Some(entry) = entry else { return };

        entry.relay_cancel.cancel();
        if let Some(conn) = entry.conn {
            let _ = conn.tx.try_send(ServerMessage::Status {
                session_id: session_id.to_string(),
                status: "closed".to_string(),
            });
            conn.cancel.cancel();
            let _ = self.events.send(SessionEvent::ConnectionDetached {
                session_id: session_id.to_string(),
            });
        }
        debug!("stream for session {} torn down", session_id);
    }

    fn spawn_relay(self: &Arc<Self>, session_id: String, cancel: CancellationToken) {
        let manager = Arc::downgrade(self);
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut rx = match registry.subscribe_output(&session_id).await {
                Ok(rx) => rx,
                Err(_) => return,
            };
            let mut decoder = Utf8StreamDecoder::new();
            // Sequence numbers are assigned here, at production time. Lag
            // on the PTY broadcast advances the counter so the loss shows
            // up as a gap instead of being renumbered away.
            let mut seq: u64 = 0;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = rx.recv() => {
                        let Some(manager) = manager.upgrade() else { break };
                        match result {
                            Ok(chunk) => {
                                let data = decoder.decode(&chunk.data);
                                if data.is_empty() {
                                    continue;
                                }
                                seq += 1;
                                manager.deliver(&session_id, seq, data).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                decoder.clear();
                                seq += n;
                                warn!(
                                    "session {} output lagged by {} chunks",
                                    session_id, n
                                );
                                let _ = manager.events.send(SessionEvent::BufferOverflow {
                                    session_id: session_id.clone(),
                                    dropped_chunks: n,
                                });
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("relay for session {} stopped", session_id);
        });
    }

    /// Route one chunk: live to the focused connection, otherwise into
    /// the backlog. Live relay requires the backlog to be drained first,
    /// so the client never sees a newer seq before an older buffered one.
    async fn deliver(&self, session_id: &str, seq: u64, data: String) {
        let focused = self.registry.is_focused(session_id).await;

        let dropped = {
            let mut streams = self.streams.write().await;
            let Some(entry) = streams.get_mut(session_id) else {
                return;
            };

            let live =
                focused && entry.conn.is_some() && Self::flush_backlog(entry, session_id);

            let sent = live
                && entry.conn.as_ref().is_some_and(|conn| {
                    conn.tx
                        .try_send(ServerMessage::Output {
                            session_id: session_id.to_string(),
                            data: data.clone(),
                            seq,
                        })
                        .is_ok()
                });

            if sent { 0 } else { entry.buffer.push(seq, data) }
        };

        if dropped > 0 {
            let _ = self.events.send(SessionEvent::BufferOverflow {
                session_id: session_id.to_string(),
                dropped_chunks: dropped,
            });
        }
    }

    /// Push buffered chunks to the connection oldest-first, stopping at
    /// the first full-channel rejection. Returns true once the backlog
    /// is empty. All channel pushes happen under the streams lock, which
    /// is what keeps seq order intact across the buffered/live boundary.
    fn flush_backlog(entry: &mut StreamEntry, session_id: &str) -> bool {
        let Some(conn) = entry.conn.as_ref() else {
            return false;
        };
        while let Some(chunk) = entry.buffer.front() {
            let msg = ServerMessage::Output {
                session_id: session_id.to_string(),
                data: chunk.data.clone(),
                seq: chunk.seq,
            };
            if conn.tx.try_send(msg).is_err() {
                return false;
            }
            entry.buffer.pop_front();
        }
        true
    }

    /// Attach a connection to a session's stream. Retries with backoff to
    /// ride out the window between session creation and relay startup; a
    /// second attach replaces the first. As much of the backlog as the
    /// outbound channel accepts is flushed to the new connection before
    /// live output resumes; any remainder follows with later output or an
    /// explicit replay.
    pub async fn attach(
        self: &Arc<Self>,
        session_id: &str,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Result<AttachGuard, EngineError> {
        let attempts = self.config.attach_retry_attempts.max(1);
        let mut delay = self.config.attach_retry_base;
        let mut found = false;
        for attempt in 0..attempts {
            if self.streams.read().await.contains_key(session_id) {
                found = true;
                break;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        if !found {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        let replaced = {
            let mut streams = self.streams.write().await;
            let Some(entry) = streams.get_mut(session_id) else {
                return Err(EngineError::SessionNotFound(session_id.to_string()));
            };
            let replaced = entry.conn.replace(ConnState {
                conn_id,
                tx,
                cancel: cancel.clone(),
                last_seen: Instant::now(),
            });
            Self::flush_backlog(entry, session_id);
            replaced
        };

        if let Some(old) = replaced {
            debug!(
                "session {}: connection {} replaced by {}",
                session_id, old.conn_id, conn_id
            );
            old.cancel.cancel();
            self.registry.mark_detached(session_id).await;
            let _ = self.events.send(SessionEvent::ConnectionDetached {
                session_id: session_id.to_string(),
            });
        }

        self.registry.mark_attached(session_id).await;
        let _ = self.events.send(SessionEvent::ConnectionAttached {
            session_id: session_id.to_string(),
        });

        self.spawn_watchdog(session_id.to_string(), conn_id);

        Ok(AttachGuard {
            session_id: session_id.to_string(),
            conn_id,
            cancel,
        })
    }

    /// Detach a specific connection. A stale conn_id (already replaced)
    /// is a no-op, so a slow-closing handler cannot detach its successor.
    pub async fn detach(&self, session_id: &str, conn_id: u64) {
        let removed = {
            let mut streams = self.streams.write().await;
            let Some(entry) = streams.get_mut(session_id) else {
                return;
            };
            match &entry.conn {
                Some(conn) if conn.conn_id == conn_id => entry.conn.take(),
                _ => None,
            }
        };

        if let Some(conn) = removed {
            conn.cancel.cancel();
            self.registry.mark_detached(session_id).await;
            let _ = self.events.send(SessionEvent::ConnectionDetached {
                session_id: session_id.to_string(),
            });
        }
    }

    /// Detach whatever connection is currently attached, if any.
    async fn detach_current(&self, session_id: &str) {
        let conn_id = {
            let streams = self.streams.read().await;
            streams
                .get(session_id)
                .and_then(|e| e.conn.as_ref().map(|c| c.conn_id))
        };
        if let Some(conn_id) = conn_id {
            self.detach(session_id, conn_id).await;
        }
    }

    /// Record client liveness (ping or input) for the watchdog and the
    /// session idle clock.
    pub async fn note_activity(&self, session_id: &str, conn_id: u64) {
        {
            let mut streams = self.streams.write().await;
            if let Some(entry) = streams.get_mut(session_id) {
                if let Some(conn) = entry.conn.as_mut() {
                    if conn.conn_id == conn_id {
                        conn.last_seen = Instant::now();
                    }
                }
            }
        }
        self.registry.touch(session_id).await;
    }

    /// Send the backlog to the current connection. Flushed chunks are
    /// consumed; each chunk is delivered at most once, and seq gaps are
    /// how the client detects loss.
    pub async fn replay(&self, session_id: &str) {
        let mut streams = self.streams.write().await;
        if let Some(entry) = streams.get_mut(session_id) {
            Self::flush_backlog(entry, session_id);
        }
    }

    /// Server-side liveness watchdog: a connection that shows no activity
    /// for `heartbeat_max_missed` intervals is detached.
    fn spawn_watchdog(self: &Arc<Self>, session_id: String, conn_id: u64) {
        let manager = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        let limit = interval * self.config.heartbeat_max_missed;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // first tick is immediate

            loop {
                tick.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };

                let stale = {
                    let streams = manager.streams.read().await;
                    match streams.get(&session_id).and_then(|e| e.conn.as_ref()) {
                        Some(conn) if conn.conn_id == conn_id => {
                            conn.last_seen.elapsed() >= limit
                        }
                        // Replaced or gone; this watchdog is done.
                        _ => break,
                    }
                };

                if stale {
                    warn!(
                        "session {}: connection {} missed heartbeats, detaching",
                        session_id, conn_id
                    );
                    manager.detach(&session_id, conn_id).await;
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::config::FileConfig;
    use crate::events::create_event_bus;
    use crate::registry::SessionMode;
    use crate::store::PersistHandle;
    use std::time::Duration;

    fn setup(tweak: impl FnOnce(&mut EngineConfig)) -> (Arc<SessionRegistry>, Arc<StreamManager>) {
        let mut config = EngineConfig::from_file(&FileConfig::default());
        config.shell_command = "cat".to_string();
        config.terminate_grace = Duration::from_millis(500);
        config.attach_retry_base = Duration::from_millis(10);
        tweak(&mut config);

        let events = create_event_bus();
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), events.clone()));
        let registry = Arc::new(SessionRegistry::new(
            config,
            events,
            PersistHandle::new(None, breaker),
        ));
        let manager = StreamManager::new(registry.clone());
        manager.start();
        (registry, manager)
    }

    async fn expect_output(
        rx: &mut mpsc::Receiver<ServerMessage>,
        needle: &str,
    ) -> (String, u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut seen = String::new();
        let mut last_seq = 0;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(ServerMessage::Output { data, seq, .. })) => {
                    seen.push_str(&data);
                    last_seq = seq;
                    if seen.contains(needle) {
                        return (seen, last_seq);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => panic!("channel closed; saw {:?}", seen),
                Err(_) => panic!("no '{}' within 5s; saw {:?}", needle, seen),
            }
        }
    }

    #[tokio::test]
    async fn attach_flushes_buffered_output() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        // No focus, no connection: the echo from cat lands in the backlog.
        registry.write_input(&info.id, b"hello\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (tx, mut rx) = mpsc::channel(100);
        let _guard = manager.attach(&info.id, tx).await.unwrap();

        let (seen, _) = expect_output(&mut rx, "hello").await;
        assert!(seen.contains("hello"));

        registry.close_all().await;
    }

    #[tokio::test]
    async fn focused_session_streams_live() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();
        registry.set_focus("proj-1", &info.id, true).await.unwrap();

        let (tx, mut rx) = mpsc::channel(100);
        let _guard = manager.attach(&info.id, tx).await.unwrap();

        registry.write_input(&info.id, b"ping\n").await.unwrap();
        expect_output(&mut rx, "ping").await;

        registry.close_all().await;
    }

    #[tokio::test]
    async fn gaining_focus_flushes_backlog() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(100);
        let _guard = manager.attach(&info.id, tx).await.unwrap();

        // Connected but unfocused: the echo lands in the backlog.
        registry.write_input(&info.id, b"later\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        registry.set_focus("proj-1", &info.id, true).await.unwrap();
        expect_output(&mut rx, "later").await;

        registry.close_all().await;
    }

    #[tokio::test]
    async fn suspend_detaches_live_connection() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(10);
        let guard = manager.attach(&info.id, tx).await.unwrap();

        registry.suspend_project("proj-1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(guard.cancel.is_cancelled());

        registry.close_all().await;
    }

    #[tokio::test]
    async fn slow_connection_never_reorders_output() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();
        registry.set_focus("proj-1", &info.id, true).await.unwrap();

        // Capacity 1: the channel fills after a single undrained message.
        let (tx, mut rx) = mpsc::channel(1);
        let _guard = manager.attach(&info.id, tx).await.unwrap();

        for seq in 1..=4u64 {
            manager
                .deliver(&info.id, seq, format!("chunk-{}\n", seq))
                .await;
        }

        // Drain one message at a time, asking for the backlog whenever
        // the channel runs dry, the way a reconnecting client would.
        let mut seqs = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ServerMessage::Output { seq, .. }) => seqs.push(seq),
                Ok(_) => {}
                Err(_) => {
                    manager.replay(&info.id).await;
                    match rx.try_recv() {
                        Ok(ServerMessage::Output { seq, .. }) => seqs.push(seq),
                        _ => break,
                    }
                }
            }
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn replay_consumes_the_backlog() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(100);
        let _guard = manager.attach(&info.id, tx).await.unwrap();

        // Unfocused: the chunk lands in the backlog.
        manager.deliver(&info.id, 1, "one".to_string()).await;

        manager.replay(&info.id).await;
        match rx.try_recv() {
            Ok(ServerMessage::Output { seq, .. }) => assert_eq!(seq, 1),
            other => panic!("expected buffered output, got {:?}", other),
        }

        // Delivered at most once: a second replay has nothing to send.
        manager.replay(&info.id).await;
        assert!(rx.try_recv().is_err());

        registry.close_all().await;
    }

    #[tokio::test]
    async fn suspend_preserves_process_and_resume_recovers_output() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();
        registry.set_focus("proj-1", &info.id, true).await.unwrap();

        let (tx, mut rx) = mpsc::channel(100);
        let guard = manager.attach(&info.id, tx).await.unwrap();

        registry.write_input(&info.id, b"before\n").await.unwrap();
        expect_output(&mut rx, "before").await;

        registry.suspend_project("proj-1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(guard.cancel.is_cancelled());

        // The process survives suspension; its output buffers.
        registry.write_input(&info.id, b"during\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        registry.resume_project("proj-1").await;

        let (tx2, mut rx2) = mpsc::channel(100);
        let _guard2 = manager.attach(&info.id, tx2).await.unwrap();
        expect_output(&mut rx2, "during").await;

        // Still responsive after resume.
        registry.write_input(&info.id, b"after\n").await.unwrap();
        expect_output(&mut rx2, "after").await;

        registry.close_all().await;
    }

    #[tokio::test]
    async fn attach_unknown_session_fails_after_retries() {
        let (_registry, manager) = setup(|c| {
            c.attach_retry_attempts = 3;
            c.attach_retry_base = Duration::from_millis(5);
        });

        let (tx, _rx) = mpsc::channel(10);
        let err = manager.attach("nope", tx).await;
        assert!(matches!(err, Err(EngineError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn second_attach_replaces_first() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        let (tx1, _rx1) = mpsc::channel(10);
        let guard1 = manager.attach(&info.id, tx1).await.unwrap();

        let (tx2, _rx2) = mpsc::channel(10);
        let guard2 = manager.attach(&info.id, tx2).await.unwrap();

        assert!(guard1.cancel.is_cancelled());
        assert!(!guard2.cancel.is_cancelled());
        assert_ne!(guard1.conn_id, guard2.conn_id);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn stale_connection_is_detached_by_watchdog() {
        let (registry, manager) = setup(|c| {
            c.heartbeat_interval = Duration::from_millis(50);
            c.heartbeat_max_missed = 1;
        });
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(10);
        let guard = manager.attach(&info.id, tx).await.unwrap();

        // No pings, no input: the watchdog must cut the connection.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(guard.cancel.is_cancelled());

        registry.close_all().await;
    }

    #[tokio::test]
    async fn activity_keeps_connection_alive() {
        let (registry, manager) = setup(|c| {
            c.heartbeat_interval = Duration::from_millis(50);
            c.heartbeat_max_missed = 2;
        });
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(10);
        let guard = manager.attach(&info.id, tx).await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            manager.note_activity(&info.id, guard.conn_id).await;
        }
        assert!(!guard.cancel.is_cancelled());

        registry.close_all().await;
    }

    #[tokio::test]
    async fn close_notifies_and_cancels_connection() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let guard = manager.attach(&info.id, tx).await.unwrap();

        registry.close(&info.id).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut saw_closed = false;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(ServerMessage::Status { status, .. })) if status == "closed" => {
                    saw_closed = true;
                    break;
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert!(saw_closed);

        // Give the event loop a beat to cancel the guard.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(guard.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn detach_with_stale_conn_id_is_a_noop() {
        let (registry, manager) = setup(|_| {});
        let info = registry
            .create("proj-1", SessionMode::Shell, Some("/tmp".to_string()))
            .await
            .unwrap();

        let (tx1, _rx1) = mpsc::channel(10);
        let guard1 = manager.attach(&info.id, tx1).await.unwrap();
        let (tx2, _rx2) = mpsc::channel(10);
        let guard2 = manager.attach(&info.id, tx2).await.unwrap();

        // Late cleanup from the first handler must not touch the second.
        manager.detach(&info.id, guard1.conn_id).await;
        assert!(!guard2.cancel.is_cancelled());

        registry.close_all().await;
    }
}
