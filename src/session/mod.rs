//! TCP session lifecycle.
//!
//! Each accepted connection gets a dedicated read loop plus a dedicated
//! writer task coordinated through a bounded write queue; dispatch tasks talk
//! to the socket only through the queue's sender, never directly.
//!
//! Lifecycle: `OPEN → AUTHENTICATED (after login) → CLOSING → CLOSED`. Any
//! I/O error, protocol violation, or missed-heartbeat overrun is terminal.
//! Heartbeats: after `heartbeat_interval` of peer silence the session sends a
//! heartbeat frame and counts a miss; at `max_missed` misses it closes and
//! the `sessions_closed_missed_heartbeat` counter increments.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{Identity, JwtValidator};
use crate::dispatch::{Dispatcher, OpKey, Request};
use crate::metrics::Metrics;
use crate::protocol::{read_frame, Frame, MSG_LOGIN};
use crate::types::MiddlewareError;

// ============================================================================
// Configuration and state
// ============================================================================

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_frame_body: usize,
    /// Socket read deadline per wakeup of the read loop.
    pub read_timeout: Duration,
    /// Peer silence before a heartbeat is sent and a miss is counted.
    pub heartbeat_interval: Duration,
    /// Misses before the session transitions to CLOSING.
    pub max_missed: u32,
    pub write_queue_size: usize,
    /// Bound on draining the write queue during shutdown.
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_body: 64 * 1024,
            read_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            max_missed: 3,
            write_queue_size: 256,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Session lifecycle states. Terminal once CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    Authenticated = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Open,
            1 => SessionState::Authenticated,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Shared per-session state. Dispatch tasks hold this plus a write-queue
/// sender; neither gives access to the socket.
pub struct SessionShared {
    pub conn_id: Uuid,
    pub remote_addr: String,
    state: AtomicU8,
    identity: RwLock<Option<Identity>>,
    missed: AtomicU32,
}

impl SessionShared {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().expect("identity lock poisoned").clone()
    }

    fn authenticate(&self, identity: Identity) {
        *self.identity.write().expect("identity lock poisoned") = Some(identity);
        // Only an OPEN session moves to AUTHENTICATED; a closing one stays put.
        let _ = self.state.compare_exchange(
            SessionState::Open as u8,
            SessionState::Authenticated as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Snapshot row for operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub conn_id: Uuid,
    pub remote_addr: String,
    pub opened_at: chrono::DateTime<chrono::Utc>,
}

/// Live sessions keyed by connection id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    fn insert(&self, entry: SessionEntry) {
        self.sessions.insert(entry.conn_id, entry);
    }

    fn remove(&self, conn_id: &Uuid) {
        self.sessions.remove(conn_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, conn_id: &Uuid) -> bool {
        self.sessions.contains_key(conn_id)
    }
}

// ============================================================================
// Session loop
// ============================================================================

/// Dependencies shared by every session.
pub struct SessionDeps {
    pub config: SessionConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub jwt: Arc<JwtValidator>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<Metrics>,
}

/// Drive one connection until it closes. Returns the final state.
pub async fn run_session<S>(stream: S, remote_addr: String, deps: Arc<SessionDeps>) -> SessionState
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = Uuid::new_v4();
    let shared = Arc::new(SessionShared {
        conn_id,
        remote_addr: remote_addr.clone(),
        state: AtomicU8::new(SessionState::Open as u8),
        identity: RwLock::new(None),
        missed: AtomicU32::new(0),
    });

    deps.registry.insert(SessionEntry {
        conn_id,
        remote_addr: remote_addr.clone(),
        opened_at: chrono::Utc::now(),
    });
    Metrics::incr(&deps.metrics.sessions_opened);
    info!(conn = %conn_id, peer = %remote_addr, "session opened");

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (write_tx, mut write_rx) = mpsc::channel::<Frame>(deps.config.write_queue_size);

    // Writer task: sole owner of the socket's write half.
    let writer_metrics = Arc::clone(&deps.metrics);
    let writer_max_body = deps.config.max_frame_body;
    let writer = tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            match frame.encode(writer_max_body) {
                Ok(bytes) => {
                    if let Err(e) = write_half.write_all(&bytes).await {
                        debug!(error = %e, "socket write failed");
                        break;
                    }
                    Metrics::incr(&writer_metrics.tcp_frames_out);
                }
                Err(e) => warn!(error = %e, "outbound frame rejected by encoder"),
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reader task: owns the read half and parses frames back-to-back, so a
    // heartbeat deadline firing in the session loop can never tear a frame
    // that is mid-read.
    let (frame_tx, mut frame_rx) =
        mpsc::channel::<crate::types::Result<Frame>>(deps.config.write_queue_size);
    let reader_max_body = deps.config.max_frame_body;
    let reader = tokio::spawn(async move {
        loop {
            let result = read_frame(&mut read_half, reader_max_body).await;
            let stop = result.is_err();
            if frame_tx.send(result).await.is_err() || stop {
                break;
            }
        }
    });

    // Session loop with heartbeat bookkeeping.
    let mut last_activity = Instant::now();
    let mut next_heartbeat = last_activity + deps.config.heartbeat_interval;
    let mut heartbeat_seq: u32 = 0;

    loop {
        if shared.state() >= SessionState::Closing {
            break;
        }

        match tokio::time::timeout(deps.config.read_timeout, frame_rx.recv()).await {
            Err(_) => {
                // Read deadline passed without a frame; heartbeat check below.
            }
            Ok(None) => {
                debug!(conn = %conn_id, "reader finished, closing session");
                shared.set_state(SessionState::Closing);
                break;
            }
            Ok(Some(Err(e))) if e.is_protocol_fatal() => {
                Metrics::incr(&deps.metrics.tcp_protocol_errors);
                warn!(conn = %conn_id, error = %e, "protocol violation, closing session");
                shared.set_state(SessionState::Closing);
                break;
            }
            Ok(Some(Err(e))) => {
                debug!(conn = %conn_id, error = %e, "read failed, closing session");
                shared.set_state(SessionState::Closing);
                break;
            }
            Ok(Some(Ok(frame))) => {
                Metrics::incr(&deps.metrics.tcp_frames_in);
                last_activity = Instant::now();
                next_heartbeat = last_activity + deps.config.heartbeat_interval;
                shared.missed.store(0, Ordering::SeqCst);

                if frame.is_heartbeat() {
                    if frame.need_response() {
                        let reply = Frame::heartbeat(frame.sequence, now_ts());
                        let _ = write_tx.send(reply).await;
                    }
                    continue;
                }

                spawn_dispatch(
                    Arc::clone(&deps),
                    Arc::clone(&shared),
                    write_tx.clone(),
                    frame,
                );
            }
        }

        // Heartbeat policy: probe on silence, close after max_missed probes.
        let now = Instant::now();
        if now >= next_heartbeat {
            let missed = shared.missed.fetch_add(1, Ordering::SeqCst) + 1;
            if missed >= deps.config.max_missed {
                info!(conn = %conn_id, missed, "missed heartbeat limit reached");
                Metrics::incr(&deps.metrics.sessions_closed_missed_heartbeat);
                shared.set_state(SessionState::Closing);
                break;
            }
            heartbeat_seq = heartbeat_seq.wrapping_add(1);
            let probe = Frame::heartbeat(heartbeat_seq, now_ts());
            if write_tx.send(probe).await.is_err() {
                shared.set_state(SessionState::Closing);
                break;
            }
            Metrics::incr(&deps.metrics.heartbeats_sent);
            next_heartbeat += deps.config.heartbeat_interval;
        }
    }

    // Drain the write queue with a bounded timeout, then close the socket.
    shared.set_state(SessionState::Closing);
    reader.abort();
    drop(write_tx);
    if tokio::time::timeout(deps.config.drain_timeout, writer)
        .await
        .is_err()
    {
        warn!(conn = %conn_id, "write queue drain timed out");
    }
    shared.set_state(SessionState::Closed);

    deps.registry.remove(&conn_id);
    Metrics::incr(&deps.metrics.sessions_closed);
    info!(conn = %conn_id, "session closed");
    SessionState::Closed
}

/// Dispatch one frame off the read loop and send any reply through the write
/// queue. Login success binds the returned token's identity to the session.
fn spawn_dispatch(
    deps: Arc<SessionDeps>,
    shared: Arc<SessionShared>,
    write_tx: mpsc::Sender<Frame>,
    frame: Frame,
) {
    tokio::spawn(async move {
        let payload: Value = if frame.body.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&frame.body) {
                Ok(value) => value,
                Err(e) => {
                    let err = MiddlewareError::BadRequest(format!("invalid frame body: {e}"));
                    let _ = write_tx.send(Frame::error_reply(&frame, now_ts(), &err)).await;
                    return;
                }
            }
        };

        let mut request = Request::new(
            frame.game_id.clone(),
            OpKey::Message(frame.message_type),
            payload,
        );
        request.sequence = frame.sequence;
        request.identity = shared.identity();

        match deps.dispatcher.dispatch(request).await {
            Ok(response) => {
                if frame.message_type == MSG_LOGIN && response.code == 0 {
                    if let Some(token) = response.data.get("token").and_then(Value::as_str) {
                        match deps.jwt.validate(token) {
                            Ok(identity) => {
                                debug!(conn = %shared.conn_id, user = %identity.user_id, "session authenticated");
                                shared.authenticate(identity);
                            }
                            Err(e) => warn!(error = %e, "login returned an unusable token"),
                        }
                    }
                }
                if frame.need_response() {
                    let body = match serde_json::to_vec(&response) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(error = %e, "response serialization failed");
                            return;
                        }
                    };
                    let reply = Frame {
                        message_type: frame.message_type,
                        flags: 0,
                        sequence: frame.sequence,
                        timestamp: now_ts(),
                        game_id: frame.game_id.clone(),
                        user_id: frame.user_id.clone(),
                        body,
                    };
                    let _ = write_tx.send(reply).await;
                }
            }
            Err(e) => {
                debug!(conn = %shared.conn_id, error = %e, "dispatch failed");
                let _ = write_tx.send(Frame::error_reply(&frame, now_ts(), &e)).await;
            }
        }
    });
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
