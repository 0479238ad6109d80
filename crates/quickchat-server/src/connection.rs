//! Persistent client connections.
//!
//! Each WebSocket goes through `Handshaking -> Active -> Closed`. The
//! credential is checked once while handshaking, either from the upgrade
//! request (`?token=` or `Authorization`) or from a first `auth` frame sent
//! within the handshake timeout. Only the `Active` state is registered in the
//! presence registry; entering and leaving it are the only points where the
//! registry is mutated.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use quickchat_shared::{AuthError, ClientFrame, ProtocolError, PushEvent, UserId};

use crate::api::AppState;
use crate::auth::{bearer_token, SessionAuthenticator};
use crate::error::ServerError;
use crate::presence::{ConnectionHandle, PresenceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Active,
    Closed,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("no credential within {0:?}")]
    TimedOut(Duration),

    #[error("connection closed during handshake")]
    Closed,
}

/// A write to the socket failed; the connection is finished.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("encode failed: {0}")]
    Encode(#[from] ProtocolError),

    #[error("write timed out after {0:?}")]
    TimedOut(Duration),

    #[error("socket closed: {0}")]
    Closed(String),
}

/// Lifecycle of one connection and its registry membership.
pub struct Session {
    state: ConnectionState,
    registry: PresenceRegistry,
    handle: Option<ConnectionHandle>,
}

impl Session {
    pub fn new(registry: PresenceRegistry) -> Self {
        Self {
            state: ConnectionState::Handshaking,
            registry,
            handle: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `Handshaking -> Active`: register the connection for `user`.
    ///
    /// Returns `None` if the session is not handshaking.
    pub async fn activate(
        &mut self,
        user: UserId,
    ) -> Option<(ConnectionHandle, mpsc::Receiver<PushEvent>)> {
        if self.state != ConnectionState::Handshaking {
            return None;
        }

        let (handle, outbox) = ConnectionHandle::new(user);
        self.registry.register(handle.clone()).await;
        self.handle = Some(handle.clone());
        self.state = ConnectionState::Active;
        Some((handle, outbox))
    }

    /// Move to `Closed`. Unregisters only if the session was active, and
    /// only its own handle.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closed);
        if previous != ConnectionState::Active {
            return;
        }
        if let Some(handle) = self.handle.take() {
            self.registry.unregister(&handle).await;
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

/// `GET /ws`: authenticate, then upgrade.
///
/// A credential attached to the request is verified before the upgrade, so
/// a bad one is answered with 401 and no socket is ever opened.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let presented = params
        .token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| bearer_token(&headers));

    let verified = match presented {
        Some(token) => match state.authenticator.verify(Some(token)) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Rejected connection attempt");
                return ServerError::from(e).into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| run_connection(socket, state, verified))
}

/// Drive one upgraded socket until it closes.
pub async fn run_connection(socket: WebSocket, state: AppState, verified: Option<UserId>) {
    let (mut sink, mut stream) = socket.split();
    let mut session = Session::new(state.registry.clone());

    let user = match verified {
        Some(user) => user,
        None => {
            let timeout = state.config.handshake_timeout;
            match await_credential(&mut stream, &state.authenticator, timeout).await {
                Ok(user) => user,
                Err(e) => {
                    warn!(error = %e, "Handshake failed");
                    session.close().await;
                    let close = CloseFrame {
                        code: close_code::POLICY,
                        reason: e.to_string().into(),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    return;
                }
            }
        }
    };

    let Some((handle, outbox)) = session.activate(user.clone()).await else {
        return;
    };
    info!(user = %user, conn = %handle.id(), "Connection active");

    let presence = state.registry.subscribe();
    let registry = state.registry.clone();
    let write_timeout = state.config.push_timeout;
    let writer_handle = handle.clone();
    let mut send_task = tokio::spawn(async move {
        if let Err(e) = write_events(
            &mut sink,
            outbox,
            presence,
            &registry,
            &writer_handle,
            write_timeout,
        )
        .await
        {
            warn!(conn = %writer_handle.id(), error = %e, "Closing connection after write failure");
        }
        let _ = sink.close().await;
    });

    let reader_user = user.clone();
    let mut recv_task = tokio::spawn(async move {
        read_frames(&mut stream, &reader_user).await;
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session.close().await;
    info!(user = %user, conn = %handle.id(), "Connection closed");
}

/// Wait for an `auth` frame and verify it.
pub async fn await_credential<S, E>(
    stream: &mut S,
    authenticator: &SessionAuthenticator,
    timeout: Duration,
) -> Result<UserId, HandshakeError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let wait = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    return match ClientFrame::from_json(text.as_str()) {
                        Ok(ClientFrame::Auth { token }) => authenticator
                            .verify(Some(&token))
                            .map_err(HandshakeError::from),
                        _ => Err(HandshakeError::Auth(AuthError::Unauthenticated)),
                    };
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Binary(_)) => {
                    return Err(HandshakeError::Auth(AuthError::Unauthenticated))
                }
                Ok(Message::Close(_)) => return Err(HandshakeError::Closed),
                Err(e) => {
                    debug!(error = %e, "Read error during handshake");
                    return Err(HandshakeError::Closed);
                }
            }
        }
        Err(HandshakeError::Closed)
    };

    tokio::time::timeout(timeout, wait)
        .await
        .unwrap_or(Err(HandshakeError::TimedOut(timeout)))
}

/// Forward pushes and online-set changes to the socket.
///
/// The current online set is written first. Later presence changes are only
/// forwarded while this connection is still the registered one for its
/// user. Returns on the first failed write.
pub async fn write_events<S>(
    sink: &mut S,
    mut outbox: mpsc::Receiver<PushEvent>,
    mut presence: watch::Receiver<Arc<Vec<UserId>>>,
    registry: &PresenceRegistry,
    handle: &ConnectionHandle,
    write_timeout: Duration,
) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let initial = presence.borrow_and_update().clone();
    send_event(sink, &PushEvent::OnlineUsers(initial.to_vec()), write_timeout).await?;

    loop {
        tokio::select! {
            event = outbox.recv() => match event {
                Some(event) => send_event(sink, &event, write_timeout).await?,
                None => return Ok(()),
            },
            changed = presence.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let online = presence.borrow_and_update().clone();
                if !registry.is_current(handle).await {
                    trace!(conn = %handle.id(), "Skipping presence update for replaced connection");
                    continue;
                }
                send_event(sink, &PushEvent::OnlineUsers(online.to_vec()), write_timeout).await?;
            }
        }
    }
}

async fn send_event<S>(sink: &mut S, event: &PushEvent, timeout: Duration) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let json = event.to_json()?;
    match tokio::time::timeout(timeout, sink.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => {
            trace!(event = event.name(), "Event written");
            Ok(())
        }
        Ok(Err(e)) => Err(WriteError::Closed(e.to_string())),
        Err(_) => Err(WriteError::TimedOut(timeout)),
    }
}

/// Consume client frames until the peer goes away. Clients have nothing to
/// say once authenticated beyond keepalives.
async fn read_frames<S, E>(stream: &mut S, user: &UserId)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => match ClientFrame::from_json(text.as_str()) {
                Ok(ClientFrame::Ping) => trace!(user = %user.short(), "Keepalive"),
                Ok(ClientFrame::Auth { .. }) => {
                    debug!(user = %user.short(), "Ignoring auth frame on active connection")
                }
                Err(e) => debug!(user = %user.short(), error = %e, "Ignoring client frame"),
            },
            Ok(_) => {}
            Err(e) => {
                debug!(user = %user.short(), error = %e, "Read error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc as fmpsc;
    use quickchat_shared::{ChatMessage, MessageId};

    use super::*;
    use crate::auth::test_support::{token_for, TEST_SECRET};

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn text(s: &str) -> Message {
        Message::Text(s.to_string().into())
    }

    fn frame_json(msg: &Message) -> serde_json::Value {
        match msg {
            Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let registry = PresenceRegistry::new();
        let mut session = Session::new(registry.clone());
        assert_eq!(session.state(), ConnectionState::Handshaking);

        let (handle, _outbox) = session.activate(UserId::from("u1")).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Active);
        assert!(registry.is_current(&handle).await);
        assert!(session.activate(UserId::from("u1")).await.is_none());

        session.close().await;
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(registry.lookup(&UserId::from("u1")).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_handshake_never_registers() {
        let registry = PresenceRegistry::new();
        let mut session = Session::new(registry.clone());
        session.close().await;

        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(session.activate(UserId::from("u1")).await.is_none());
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_closing_replaced_session_keeps_newer_one() {
        let registry = PresenceRegistry::new();
        let mut first = Session::new(registry.clone());
        let mut second = Session::new(registry.clone());

        first.activate(UserId::from("u1")).await.unwrap();
        let (newer, _rx) = second.activate(UserId::from("u1")).await.unwrap();
        first.close().await;

        let current = registry.lookup(&UserId::from("u1")).await.unwrap();
        assert_eq!(current.id(), newer.id());
    }

    #[tokio::test]
    async fn test_auth_frame_handshake() {
        let auth = SessionAuthenticator::new(TEST_SECRET);
        let frame = format!(r#"{{"type":"auth","token":"{}"}}"#, token_for("u7"));
        let mut stream = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Message::Ping(Vec::new().into())),
            Ok(text(&frame)),
        ]);

        let user = await_credential(&mut stream, &auth, TIMEOUT).await.unwrap();
        assert_eq!(user, UserId::from("u7"));
    }

    #[tokio::test]
    async fn test_handshake_failures() {
        let auth = SessionAuthenticator::new(TEST_SECRET);

        let mut wrong_first = futures::stream::iter(vec![Ok::<_, std::io::Error>(text(
            r#"{"type":"ping"}"#,
        ))]);
        assert!(matches!(
            await_credential(&mut wrong_first, &auth, TIMEOUT).await,
            Err(HandshakeError::Auth(AuthError::Unauthenticated))
        ));

        let mut forged = futures::stream::iter(vec![Ok::<_, std::io::Error>(text(
            r#"{"type":"auth","token":"forged"}"#,
        ))]);
        assert!(matches!(
            await_credential(&mut forged, &auth, TIMEOUT).await,
            Err(HandshakeError::Auth(AuthError::InvalidCredential(_)))
        ));

        let mut silent = futures::stream::pending::<Result<Message, std::io::Error>>();
        assert!(matches!(
            await_credential(&mut silent, &auth, Duration::from_millis(20)).await,
            Err(HandshakeError::TimedOut(_))
        ));

        let mut gone = futures::stream::empty::<Result<Message, std::io::Error>>();
        assert!(matches!(
            await_credential(&mut gone, &auth, TIMEOUT).await,
            Err(HandshakeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_writer_sends_presence_then_pushes() {
        let registry = PresenceRegistry::new();
        let mut session = Session::new(registry.clone());
        let (handle, outbox) = session.activate(UserId::from("u2")).await.unwrap();
        let presence = registry.subscribe();

        let (mut sink, mut written) = fmpsc::channel::<Message>(16);
        let writer_registry = registry.clone();
        let writer_handle = handle.clone();
        let writer = tokio::spawn(async move {
            write_events(&mut sink, outbox, presence, &writer_registry, &writer_handle, TIMEOUT).await
        });

        let first = frame_json(&written.next().await.unwrap());
        assert_eq!(first["event"], "getOnlineUsers");
        assert_eq!(first["data"], serde_json::json!(["u2"]));

        let message = ChatMessage {
            id: MessageId::new(),
            sender_id: UserId::from("u1"),
            receiver_id: UserId::from("u2"),
            text: Some("hi".into()),
            image: None,
            seen: false,
            created_at: chrono::Utc::now(),
        };
        handle
            .push(PushEvent::NewMessage(message.clone()), TIMEOUT)
            .await
            .unwrap();
        let pushed = frame_json(&written.next().await.unwrap());
        assert_eq!(pushed["event"], "newMessage");
        assert_eq!(pushed["data"]["text"], "hi");

        let mut other = Session::new(registry.clone());
        other.activate(UserId::from("u1")).await.unwrap();
        let update = frame_json(&written.next().await.unwrap());
        assert_eq!(update["data"], serde_json::json!(["u1", "u2"]));

        writer.abort();
    }

    #[tokio::test]
    async fn test_replaced_connection_stops_receiving_presence() {
        let registry = PresenceRegistry::new();
        let mut old = Session::new(registry.clone());
        let (old_handle, old_outbox) = old.activate(UserId::from("u1")).await.unwrap();
        let presence = registry.subscribe();

        let (mut sink, mut written) = fmpsc::channel::<Message>(16);
        let writer_registry = registry.clone();
        let writer = tokio::spawn(async move {
            write_events(&mut sink, old_outbox, presence, &writer_registry, &old_handle, TIMEOUT)
                .await
        });
        // Initial snapshot.
        written.next().await.unwrap();

        let mut newer = Session::new(registry.clone());
        newer.activate(UserId::from("u1")).await.unwrap();
        let mut third = Session::new(registry.clone());
        third.activate(UserId::from("u3")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(written.try_next().is_err(), "stale connection got a presence frame");

        writer.abort();
    }

    #[tokio::test]
    async fn test_stalled_socket_fails_the_writer() {
        let registry = PresenceRegistry::new();
        let mut session = Session::new(registry.clone());
        let (handle, outbox) = session.activate(UserId::from("u1")).await.unwrap();
        let presence = registry.subscribe();

        // Room for exactly one frame, never drained.
        let (mut sink, _written) = fmpsc::channel::<Message>(0);
        handle
            .push(PushEvent::OnlineUsers(vec![]), TIMEOUT)
            .await
            .unwrap();

        let result = write_events(
            &mut sink,
            outbox,
            presence,
            &registry,
            &handle,
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(WriteError::TimedOut(_))));
    }
}
