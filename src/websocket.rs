//! # WebSocket Live Transcription Handler
//!
//! Handles the live-transcription WebSocket at `/ws/live`. Each connection
//! is one Actix actor; all session semantics live in the
//! [`SessionCoordinator`], which the actor reaches through spawned tasks.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Client connects and sends a `join_session` message
//! 2. **Streaming**: One `audio_chunk` in flight at a time; each accepted
//!    chunk is acknowledged with `ready`
//! 3. **Results**: Server pushes `transcript_update` messages as
//!    recognition results arrive
//! 4. **Teardown**: `end_session` or a plain disconnect finalizes and
//!    persists the transcript
//!
//! ## Message Format:
//! - **Client → Server**: JSON envelopes (see [`ClientMessage`]); binary
//!   frames carry a raw audio chunk without the envelope
//! - **Server → Client**: JSON [`ServerMessage`] frames

use crate::state::AppState;
use crate::streaming::{ClientMessage, ConnectionEvent, SessionCoordinator, ServerMessage};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// WebSocket actor for one live-transcription connection.
///
/// ## Actor Model:
/// Uses Actix's actor system where each WebSocket connection is an
/// independent actor. The coordinator talks back to the connection through
/// the outbox channel, which the actor drains as an input stream.
pub struct LiveSocket {
    /// Shared application state (coordinator, metrics, config)
    state: web::Data<AppState>,

    /// Session bound to this connection, once joined
    session_id: Option<String>,

    /// Sender half handed to the coordinator on join
    outbox: mpsc::UnboundedSender<ConnectionEvent>,

    /// Receiver half, moved into the actor's stream on start
    inbox: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,

    /// Last heartbeat time
    last_heartbeat: Instant,

    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl LiveSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let (heartbeat_interval, client_timeout) = {
            let config = state.config.read().unwrap();
            (
                Duration::from_secs(config.streaming.heartbeat_interval_secs),
                Duration::from_secs(config.streaming.client_timeout_secs),
            )
        };
        Self {
            state,
            session_id: None,
            outbox,
            inbox: Some(inbox),
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    fn coordinator(&self) -> Arc<SessionCoordinator> {
        self.state.coordinator.clone()
    }

    /// Session id for a message that may carry its own: the payload wins,
    /// the connection's bound session is the fallback.
    fn resolve_session(&self, from_payload: Option<String>) -> Option<String> {
        from_payload.or_else(|| self.session_id.clone())
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "failed to serialize server message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: crate::streaming::ErrorCode, message: &str) {
        self.state.record_socket_error();
        warn!(code = code.as_str(), message = message, "socket error");
        self.send_message(
            ctx,
            &ServerMessage::Error {
                code,
                message: message.to_string(),
                details: None,
            },
        );
    }

    fn handle_client_message(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match msg {
            ClientMessage::JoinSession {
                session_id,
                mode,
                user_id,
                source_language,
                target_language,
            } => {
                let coordinator = self.coordinator();
                let outbox = self.outbox.clone();
                let addr = ctx.address();
                tokio::spawn(async move {
                    let joined = coordinator
                        .join_session(
                            session_id,
                            mode,
                            user_id,
                            source_language,
                            target_language,
                            outbox,
                        )
                        .await;
                    if let Some(session_id) = joined {
                        // Update actor state from the async task
                        addr.do_send(SessionBound { session_id });
                    }
                });
            }

            ClientMessage::AudioChunk {
                session_id,
                chunk,
                is_final,
            } => {
                let Some(session_id) = self.resolve_session(session_id) else {
                    self.send_error(
                        ctx,
                        crate::streaming::ErrorCode::NoSession,
                        "Join a session before streaming audio",
                    );
                    return;
                };
                let coordinator = self.coordinator();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    coordinator
                        .audio_chunk(&session_id, &chunk, is_final.unwrap_or(false), &outbox)
                        .await;
                });
            }

            ClientMessage::UpdateLanguages {
                source_language,
                target_language,
            } => {
                let Some(session_id) = self.session_id.clone() else {
                    self.send_error(
                        ctx,
                        crate::streaming::ErrorCode::NoSession,
                        "Join a session before updating languages",
                    );
                    return;
                };
                let coordinator = self.coordinator();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    coordinator
                        .update_languages(&session_id, source_language, target_language, &outbox)
                        .await;
                });
            }

            ClientMessage::EndSession { session_id } => {
                let Some(session_id) = self.resolve_session(session_id) else {
                    self.send_error(
                        ctx,
                        crate::streaming::ErrorCode::NoSession,
                        "No active session to end",
                    );
                    return;
                };
                self.session_id = None;
                let coordinator = self.coordinator();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    coordinator.end_session(&session_id, &outbox).await;
                });
            }
        }
    }
}

/// Message for binding the joined session to the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionBound {
    session_id: String,
}

impl Actor for LiveSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started");

        // The coordinator's outbound events become an input stream of
        // this actor, handled in order by the StreamHandler below.
        if let Some(inbox) = self.inbox.take() {
            ctx.add_stream(UnboundedReceiverStream::new(inbox));
        }

        let timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Called when the WebSocket connection stops. A dropped transport
    /// finalizes the session exactly like an explicit end.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket connection stopped");
        if let Some(session_id) = self.session_id.take() {
            let coordinator = self.coordinator();
            tokio::spawn(async move {
                coordinator.handle_disconnect(&session_id).await;
            });
        }
    }
}

/// Deliver coordinator events to the client.
impl StreamHandler<ConnectionEvent> for LiveSocket {
    fn handle(&mut self, event: ConnectionEvent, ctx: &mut Self::Context) {
        match event {
            ConnectionEvent::Send(message) => self.send_message(ctx, &message),
            ConnectionEvent::Close => {
                debug!("coordinator requested connection close");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description: Some("session ended".to_string()),
                }));
                ctx.stop();
            }
        }
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(e) => {
                    self.send_error(
                        ctx,
                        crate::streaming::ErrorCode::BadRequest,
                        &format!("Invalid message: {}", e),
                    );
                }
            },
            Ok(ws::Message::Binary(data)) => {
                // Raw audio chunk without the JSON envelope
                let Some(session_id) = self.session_id.clone() else {
                    self.send_error(
                        ctx,
                        crate::streaming::ErrorCode::NoSession,
                        "Join a session before streaming audio",
                    );
                    return;
                };
                let coordinator = self.coordinator();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    coordinator
                        .audio_bytes(&session_id, &data, false, &outbox)
                        .await;
                });
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!("WebSocket protocol error: {}", e);
                self.state.record_socket_error();
                ctx.stop();
            }
        }
    }
}

impl Handler<SessionBound> for LiveSocket {
    type Result = ();

    fn handle(&mut self, msg: SessionBound, _ctx: &mut Self::Context) {
        info!(session_id = %msg.session_id, "session bound to connection");
        self.session_id = Some(msg.session_id);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Handles the initial HTTP request and upgrades it to a WebSocket
/// connection; everything after the upgrade is the [`LiveSocket`] actor.
pub async fn live_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(LiveSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use crate::streaming::{ClientMessage, ServerMessage, SessionStatusKind};

    #[test]
    fn client_frames_parse_from_wire_json() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "audio_chunk", "session_id": "s1", "chunk": "AAAA"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::AudioChunk {
                session_id,
                chunk,
                is_final,
            } => {
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert_eq!(chunk, "AAAA");
                assert!(is_final.is_none());
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn server_frames_carry_the_type_tag() {
        let json = serde_json::to_string(&ServerMessage::SessionStatus {
            session_id: "s1".to_string(),
            status: SessionStatusKind::Active,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"session_status\""));
        assert!(json.contains("\"status\":\"active\""));
    }
}
