//! # Control WebSocket
//!
//! `GET /ws/control` upgrades to a WebSocket that accepts the same control
//! events the ESL listener produces, as JSON text frames tagged by `type`.
//!
//! ## Inbound messages:
//! - `sessionStart` `{sessionId}`
//! - `playAudio` `{sessionId, data: {file, audioContentType, sampleRate, textContent}}`
//! - `killAudio` `{sessionId?}` (no id kills audio on every session)
//! - `sessionEnd` `{sessionId}`
//! - `ping` / `pong` `{timestamp}`
//!
//! ## Outbound messages:
//! Every control message is answered with `<type>Response` carrying the
//! controller outcome. Parse failures get an `error` frame. The server sends a
//! `ping` every 30 seconds and closes the socket after 60 seconds of silence.
//!
//! Messages from one connection are handled strictly in arrival order, so two
//! `playAudio` frames for the same call are queued in the order they were sent.

use crate::playback::controller::{ControlEvent, ControlOutcome, PlayRequest};
use crate::state::AppState;
use actix::{fut, Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler};
use actix_web::{web, Error as ActixError, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SessionStart { session_id: String },
    #[serde(rename_all = "camelCase")]
    PlayAudio {
        session_id: String,
        #[serde(default)]
        data: PlayRequest,
    },
    #[serde(rename_all = "camelCase")]
    KillAudio {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnd { session_id: String },
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    SessionStartResponse { result: ControlOutcome },
    PlayAudioResponse { result: ControlOutcome },
    KillAudioResponse { result: ControlOutcome },
    SessionEndResponse { result: ControlOutcome },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Which response frame answers a control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    SessionStart,
    PlayAudio,
    KillAudio,
    SessionEnd,
}

impl Reply {
    fn wrap(self, result: ControlOutcome) -> ServerMessage {
        match self {
            Reply::SessionStart => ServerMessage::SessionStartResponse { result },
            Reply::PlayAudio => ServerMessage::PlayAudioResponse { result },
            Reply::KillAudio => ServerMessage::KillAudioResponse { result },
            Reply::SessionEnd => ServerMessage::SessionEndResponse { result },
        }
    }
}

impl ClientMessage {
    /// The control event carried by this frame, if it carries one.
    fn into_event(self) -> Option<(ControlEvent, Reply)> {
        match self {
            ClientMessage::SessionStart { session_id } => {
                Some((ControlEvent::SessionStart { session_id }, Reply::SessionStart))
            }
            ClientMessage::PlayAudio { session_id, data } => Some((
                ControlEvent::PlayAudio {
                    session_id,
                    request: data,
                },
                Reply::PlayAudio,
            )),
            ClientMessage::KillAudio { session_id } => {
                Some((ControlEvent::KillAudio { session_id }, Reply::KillAudio))
            }
            ClientMessage::SessionEnd { session_id } => {
                Some((ControlEvent::SessionEnd { session_id }, Reply::SessionEnd))
            }
            ClientMessage::Ping { .. } | ClientMessage::Pong { .. } => None,
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub struct ControlWebSocket {
    state: AppState,
    last_heartbeat: Instant,
}

impl ControlWebSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize control reply"),
        }
    }

    fn send_error(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        code: &str,
        message: &str,
        session_id: Option<String>,
    ) {
        Self::send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
                session_id,
            },
        );
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Dropping malformed control message");
                self.send_error(ctx, "invalid_message", &format!("Invalid message: {}", err), None);
                return;
            }
        };

        match message {
            ClientMessage::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                Self::send(ctx, &ServerMessage::Pong { timestamp });
            }
            ClientMessage::Pong { .. } => {
                self.last_heartbeat = Instant::now();
            }
            other => {
                if let Some((event, reply)) = other.into_event() {
                    self.dispatch(event, reply, ctx);
                }
            }
        }
    }

    /// Run one control event to completion before the next frame is read.
    fn dispatch(&mut self, event: ControlEvent, reply: Reply, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(event = event.kind(), "Control message received");
        let controller = self.state.controller.clone();

        let work = fut::wrap_future::<_, Self>(async move { controller.handle(event).await }).map(
            move |outcome, _act, ctx| {
                if outcome.is_failure() {
                    debug!(outcome = ?outcome, "Control message not applied");
                }
                Self::send(ctx, &reply.wrap(outcome));
            },
        );
        ctx.wait(work);
    }
}

impl Actor for ControlWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Control WebSocket connection started");
        self.state.increment_active_connections();

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Control WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                Self::send(ctx, &ServerMessage::Ping { timestamp: now_millis() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.decrement_active_connections();
        info!("Control WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ControlWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary frames are not accepted", None);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Control WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Control WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// HTTP upgrade for `/ws/control`.
pub async fn control_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, ActixError> {
    info!(
        "New control WebSocket connection from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(
        ControlWebSocket::new(app_state.get_ref().clone()),
        &req,
        stream,
    )
}
