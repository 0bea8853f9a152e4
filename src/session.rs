// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Sync sessions: one websocket per active editor.
//!
//! A session moves Opening → Bound → Draining → Closed. Binding is checked
//! again on every `sync` frame (the lock may have moved under us); once a
//! session is draining it rejects mutations but still flushes outbound
//! frames. Inbound frames are processed strictly in order; the server never
//! retries a message.

use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use base::{err, Error, FastHashMap};
use db::registry::{DatabaseName, LockType, Registry};
use db::workingcopy::WorkingCopies;
use db::RowDelta;
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite, WebSocketStream};
use tracing::{debug, info};

use crate::json::{ClientMessage, ErrorCode, ServerMessage, CLIENT_MESSAGE_TYPES};
use crate::lock::SessionNotifier;

/// How long a session may stay silent before the server closes it. Clients
/// ping every 30 s.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Events delivered to a session from elsewhere in the process.
#[derive(Debug)]
pub enum SessionEvent {
    Update {
        changes: Vec<RowDelta>,
        server_version: u64,
    },
    LockChanged {
        lock_type: LockType,
        reason: String,
    },
    Transferred,
    Close,
}

struct SessionHandle {
    user_id: String,
    video_id: String,
    database_name: DatabaseName,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

/// The process-wide map of live sessions, keyed by connection id. The lock
/// manager talks to it only through [`SessionNotifier`].
#[derive(Default)]
pub struct SessionMap(base::Mutex<FastHashMap<String, SessionHandle>>);

impl SessionMap {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionMap::default())
    }

    fn register(
        &self,
        connection_id: &str,
        user_id: &str,
        video_id: &str,
        database_name: DatabaseName,
    ) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().insert(
            connection_id.to_owned(),
            SessionHandle {
                user_id: user_id.to_owned(),
                video_id: video_id.to_owned(),
                database_name,
                tx,
            },
        );
        rx
    }

    fn unregister(&self, connection_id: &str) {
        self.0.lock().remove(connection_id);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Sends `server_update` to every session bound to `(video, db)` other
    /// than `exclude`. In practice there is at most one; the broadcast shape
    /// exists for the future multi-reader case.
    pub fn broadcast_update(
        &self,
        video_id: &str,
        database_name: DatabaseName,
        exclude: Option<&str>,
        changes: &[RowDelta],
        server_version: u64,
    ) {
        let l = self.0.lock();
        for (id, handle) in l.iter() {
            if Some(id.as_str()) == exclude {
                continue;
            }
            if handle.video_id == video_id && handle.database_name == database_name {
                let _ = handle.tx.send(SessionEvent::Update {
                    changes: changes.to_vec(),
                    server_version,
                });
            }
        }
    }

    /// Asks every session to close; used at teardown before the final
    /// checkpoint.
    pub fn close_all(&self) {
        let l = self.0.lock();
        for handle in l.values() {
            let _ = handle.tx.send(SessionEvent::Close);
        }
    }
}

impl SessionNotifier for SessionMap {
    fn notify_session_transferred(&self, connection_id: &str) {
        let l = self.0.lock();
        if let Some(handle) = l.get(connection_id) {
            debug!(
                "superseding session {connection_id} of user {}",
                handle.user_id
            );
            let _ = handle.tx.send(SessionEvent::Transferred);
        }
    }

    fn notify_lock_changed(
        &self,
        video_id: &str,
        database_name: DatabaseName,
        lock_type: LockType,
        reason: &str,
    ) {
        let l = self.0.lock();
        for handle in l.values() {
            if handle.video_id == video_id && handle.database_name == database_name {
                let _ = handle.tx.send(SessionEvent::LockChanged {
                    lock_type,
                    reason: reason.to_owned(),
                });
            }
        }
    }
}

/// Everything a session needs from the rest of the process.
pub struct SessionContext<C: Clocks + Clone> {
    pub registry: Arc<Registry<C>>,
    pub copies: Arc<WorkingCopies<C>>,
    pub sessions: Arc<SessionMap>,
}

impl<C: Clocks + Clone> Clone for SessionContext<C> {
    fn clone(&self) -> Self {
        SessionContext {
            registry: self.registry.clone(),
            copies: self.copies.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

/// A validated binding: the socket's connection id matches the registry's
/// `active_connection_id` and the token's user holds the client lock.
pub struct SessionBind {
    pub connection_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub video_id: String,
    pub database_name: DatabaseName,
}

type Ws = WebSocketStream<hyper::upgrade::Upgraded>;

async fn send(ws: &mut Ws, msg: &ServerMessage) -> Result<(), Error> {
    let text = serde_json::to_string(msg).expect("server frames always serialize");
    ws.send(tungstenite::Message::Text(text))
        .await
        .map_err(|e| err!(Unavailable, msg("websocket send failed"), source(e)))
}

/// Runs a bound session to completion. The caller (the upgrade handler)
/// closes the socket afterward. On disconnect, the client lock is released
/// iff this connection is still the bound one, so a hand-off successor is
/// never clobbered.
pub async fn run_session<C: Clocks + Clone>(
    ctx: SessionContext<C>,
    ws: &mut Ws,
    bind: SessionBind,
) -> Result<(), Error> {
    let mut events = ctx.sessions.register(
        &bind.connection_id,
        &bind.user_id,
        &bind.video_id,
        bind.database_name,
    );
    let result = session_loop(&ctx, ws, &bind, &mut events).await;
    ctx.sessions.unregister(&bind.connection_id);
    match ctx.registry.lock().release_lock_if_connection(
        &bind.video_id,
        bind.database_name,
        &bind.connection_id,
    ) {
        Ok(true) => debug!("released client lock on disconnect"),
        Ok(false) => {}
        Err(e) => return Err(e),
    }
    result
}

async fn session_loop<C: Clocks + Clone>(
    ctx: &SessionContext<C>,
    ws: &mut Ws,
    bind: &SessionBind,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<(), Error> {
    // Set once the lock has moved under us; mutations are rejected with
    // this code from then on.
    let mut draining: Option<ErrorCode> = None;
    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            event = events.recv() => match event {
                None | Some(SessionEvent::Close) => return Ok(()),
                Some(SessionEvent::Transferred) => {
                    send(ws, &ServerMessage::SessionTransferred).await?;
                    return Ok(());
                }
                Some(SessionEvent::LockChanged { lock_type, reason }) => {
                    draining = Some(match lock_type {
                        LockType::Server => ErrorCode::WorkflowLocked,
                        _ => ErrorCode::SessionTransferred,
                    });
                    send(ws, &ServerMessage::LockChanged { lock_type, reason }).await?;
                }
                Some(SessionEvent::Update { changes, server_version }) => {
                    send(ws, &ServerMessage::ServerUpdate { changes, server_version }).await?;
                }
            },

            frame = ws.next() => {
                let msg = match frame {
                    None => return Ok(()),
                    Some(Err(e)) => {
                        debug!("websocket read failed: {e}");
                        return Ok(());
                    }
                    Some(Ok(m)) => m,
                };
                idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                match msg {
                    tungstenite::Message::Text(text) => {
                        handle_text(ctx, ws, bind, &text, &mut draining).await?;
                    }
                    tungstenite::Message::Close(_) => return Ok(()),
                    // Transport-level pings are answered by tungstenite.
                    tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => {}
                    _ => {
                        send(ws, &ServerMessage::Error {
                            code: ErrorCode::InvalidFormat,
                            message: "expected a text frame".to_owned(),
                        }).await?;
                    }
                }
            },

            _ = &mut idle => {
                info!("closing session {} after idle timeout", bind.connection_id);
                return Ok(());
            }
        }
    }
}

async fn handle_text<C: Clocks + Clone>(
    ctx: &SessionContext<C>,
    ws: &mut Ws,
    bind: &SessionBind,
    text: &str,
    draining: &mut Option<ErrorCode>,
) -> Result<(), Error> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return send(
                ws,
                &ServerMessage::Error {
                    code: ErrorCode::InvalidFormat,
                    message: format!("malformed JSON: {e}"),
                },
            )
            .await;
        }
    };
    let Some(frame_type) = value.get("type").and_then(|t| t.as_str()) else {
        return send(
            ws,
            &ServerMessage::Error {
                code: ErrorCode::InvalidFormat,
                message: "missing type field".to_owned(),
            },
        )
        .await;
    };
    if !CLIENT_MESSAGE_TYPES.contains(&frame_type) {
        return send(
            ws,
            &ServerMessage::Error {
                code: ErrorCode::UnknownType,
                message: format!("unknown frame type {frame_type:?}"),
            },
        )
        .await;
    }
    let msg: ClientMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            return send(
                ws,
                &ServerMessage::Error {
                    code: ErrorCode::InvalidFormat,
                    message: e.to_string(),
                },
            )
            .await;
        }
    };
    match msg {
        ClientMessage::Ping => send(ws, &ServerMessage::Pong).await,
        ClientMessage::Sync { changes } => {
            if let Some(code) = *draining {
                return send(
                    ws,
                    &ServerMessage::Error {
                        code,
                        message: "session is no longer accepting mutations".to_owned(),
                    },
                )
                .await;
            }

            // Recheck the binding: the lock may have moved since the last
            // frame.
            let state = ctx
                .registry
                .lock()
                .get_state(&bind.video_id, bind.database_name)?;
            let state = match state {
                Some(s) => s,
                None => {
                    *draining = Some(ErrorCode::SessionTransferred);
                    return send(
                        ws,
                        &ServerMessage::Error {
                            code: ErrorCode::SessionTransferred,
                            message: "lock state is gone".to_owned(),
                        },
                    )
                    .await;
                }
            };
            if state.lock_type == LockType::Server {
                *draining = Some(ErrorCode::WorkflowLocked);
                return send(
                    ws,
                    &ServerMessage::Error {
                        code: ErrorCode::WorkflowLocked,
                        message: "a workflow holds the lock".to_owned(),
                    },
                )
                .await;
            }
            if state.active_connection_id.as_deref() != Some(bind.connection_id.as_str()) {
                *draining = Some(ErrorCode::SessionTransferred);
                return send(
                    ws,
                    &ServerMessage::Error {
                        code: ErrorCode::SessionTransferred,
                        message: "a newer session holds this lock".to_owned(),
                    },
                )
                .await;
            }

            let applied_count = changes.len();
            let server_version = ctx
                .copies
                .apply_changes(&bind.tenant_id, &bind.video_id, bind.database_name, &changes)
                .await?;
            send(
                ws,
                &ServerMessage::Ack {
                    server_version,
                    applied_count,
                },
            )
            .await?;
            ctx.sessions.broadcast_update(
                &bind.video_id,
                bind.database_name,
                Some(&bind.connection_id),
                &changes,
                server_version,
            );
            Ok(())
        }
    }
}
