//! FreeSWITCH event listener.
//!
//! Holds its own event connection, turns channel and audio-fork events into
//! [`ControlEvent`]s and feeds them to the controller. Reconnects forever.
//!
//! ## Dispatch:
//! Each session gets a lane: a task draining that session's events in arrival
//! order. The reader never waits on the controller, so a slow kill or teardown
//! on one call does not hold up events for another. A lane lives while it has
//! events in flight and is dropped once it has drained.

use crate::config::EslConfig;
use crate::esl::connection::EslConnection;
use crate::esl::protocol::{EslError, EslEvent};
use crate::playback::controller::{CallDirection, ControlEvent, LifecycleController, PlayRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const PLAY_AUDIO_SUBCLASS: &str = "mod_audio_fork::play_audio";
pub const KILL_AUDIO_SUBCLASS: &str = "mod_audio_fork::kill_audio";
pub const FORK_CONNECT_SUBCLASS: &str = "mod_audio_fork::connect";
pub const FORK_CONNECT_FAILED_SUBCLASS: &str = "mod_audio_fork::connect_failed";
pub const FORK_DISCONNECT_SUBCLASS: &str = "mod_audio_fork::disconnect";
pub const FORK_ERROR_SUBCLASS: &str = "mod_audio_fork::error";

pub const SUBSCRIPTION: &str = "CHANNEL_ANSWER CHANNEL_BRIDGE CHANNEL_UNBRIDGE CHANNEL_HANGUP \
     CUSTOM mod_audio_fork::play_audio mod_audio_fork::kill_audio \
     mod_audio_fork::connect mod_audio_fork::connect_failed mod_audio_fork::disconnect mod_audio_fork::error";

/// Map a switch event to control events. Events without a `Unique-ID` are dropped.
///
/// An unbridge ends both legs, so it can yield two events.
pub fn translate(event: &EslEvent) -> Vec<ControlEvent> {
    let Some(session_id) = event.unique_id().map(str::to_string) else {
        return Vec::new();
    };
    let direction = CallDirection::from_header(event.header("Call-Direction"));

    match event.name() {
        Some("CHANNEL_ANSWER") => vec![ControlEvent::CallAnswered { session_id, direction }],
        Some("CHANNEL_BRIDGE") => vec![ControlEvent::CallBridged { session_id, direction }],
        Some("CHANNEL_HANGUP") => vec![ControlEvent::SessionEnd { session_id }],
        Some("CHANNEL_UNBRIDGE") => {
            let other_leg = event
                .header("Other-Leg-Unique-ID")
                .filter(|other| !other.is_empty() && *other != session_id)
                .map(str::to_string);
            let mut events = vec![ControlEvent::SessionEnd { session_id }];
            events.extend(other_leg.map(|session_id| ControlEvent::SessionEnd { session_id }));
            events
        }
        Some("CUSTOM") => match event.subclass() {
            Some(PLAY_AUDIO_SUBCLASS) => {
                let body = event.body.as_deref().unwrap_or("").trim();
                let request = match serde_json::from_str::<PlayRequest>(body) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!(session_id = %session_id, error = %err, "Unparseable play_audio payload");
                        // Still forwarded so the controller logs and counts the rejection
                        PlayRequest::default()
                    }
                };
                vec![ControlEvent::PlayAudio { session_id, request }]
            }
            Some(KILL_AUDIO_SUBCLASS) => vec![ControlEvent::KillAudio {
                session_id: Some(session_id),
            }],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Status reported by the audio fork module about its WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkStatus {
    Connected,
    ConnectFailed,
    Disconnected,
    Error,
}

impl ForkStatus {
    pub fn from_event(event: &EslEvent) -> Option<Self> {
        if event.name()? != "CUSTOM" {
            return None;
        }
        match event.subclass()? {
            FORK_CONNECT_SUBCLASS => Some(ForkStatus::Connected),
            FORK_CONNECT_FAILED_SUBCLASS => Some(ForkStatus::ConnectFailed),
            FORK_DISCONNECT_SUBCLASS => Some(ForkStatus::Disconnected),
            FORK_ERROR_SUBCLASS => Some(ForkStatus::Error),
            _ => None,
        }
    }

    fn log(self, event: &EslEvent) {
        let session_id = event.unique_id().unwrap_or("-");
        let detail = event.body.as_deref().unwrap_or("").trim();
        match self {
            ForkStatus::Connected => info!(session_id = %session_id, "Audio fork connected"),
            ForkStatus::Disconnected => info!(session_id = %session_id, "Audio fork disconnected"),
            ForkStatus::ConnectFailed => {
                warn!(session_id = %session_id, detail = %detail, "Audio fork could not connect")
            }
            ForkStatus::Error => error!(session_id = %session_id, detail = %detail, "Audio fork error"),
        }
    }
}

/// Connect, subscribe and pump events until the process exits.
pub async fn run_event_listener(config: EslConfig, controller: Arc<LifecycleController>) {
    let delay = Duration::from_secs(config.reconnect_delay_secs.max(1));

    loop {
        match EslConnection::connect(&config.host, config.port, &config.password).await {
            Ok(mut connection) => {
                if let Err(err) = connection.subscribe(SUBSCRIPTION).await {
                    error!(error = %err, "Event subscription failed");
                } else {
                    info!("Subscribed to FreeSWITCH events");
                    let err = pump_events(&mut connection, &controller).await;
                    warn!(error = %err, "Event connection lost");
                }
            }
            Err(err) => {
                warn!(
                    host = %config.host,
                    port = config.port,
                    error = %err,
                    retry_secs = delay.as_secs(),
                    "Cannot reach FreeSWITCH event socket"
                );
            }
        }

        tokio::time::sleep(delay).await;
    }
}

/// Read events and hand them to their session's lane. Returns the error that
/// ended the stream; events already dispatched still run to completion.
pub async fn pump_events<S>(connection: &mut EslConnection<S>, controller: &Arc<LifecycleController>) -> EslError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lanes = SessionLanes::new(controller.clone());

    loop {
        let event = match connection.next_event().await {
            Ok(event) => event,
            Err(err) => return err,
        };

        if let Some(status) = ForkStatus::from_event(&event) {
            status.log(&event);
            continue;
        }

        let controls = translate(&event);
        if controls.is_empty() {
            debug!(event = ?event.name(), subclass = ?event.subclass(), "Ignoring event");
            continue;
        }
        for control in controls {
            lanes.dispatch(control);
        }
    }
}

struct Lane {
    sender: mpsc::UnboundedSender<ControlEvent>,
    /// Events sent but not yet handled
    in_flight: Arc<AtomicUsize>,
}

impl Lane {
    fn spawn(session_id: &str, controller: Arc<LifecycleController>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ControlEvent>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let counter = in_flight.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let outcome = controller.handle(event).await;
                debug!(session_id = %session_id, outcome = ?outcome, "Event handled");
                counter.fetch_sub(1, Ordering::AcqRel);
            }
        });

        Self { sender, in_flight }
    }
}

/// Routes control events to one ordered lane per session.
struct SessionLanes {
    controller: Arc<LifecycleController>,
    lanes: HashMap<String, Lane>,
}

impl SessionLanes {
    fn new(controller: Arc<LifecycleController>) -> Self {
        Self {
            controller,
            lanes: HashMap::new(),
        }
    }

    fn dispatch(&mut self, event: ControlEvent) {
        // Only this task sends, so a drained lane stays drained until we send again
        self.lanes
            .retain(|_, lane| lane.in_flight.load(Ordering::Acquire) > 0 && !lane.sender.is_closed());

        match event.session_id().map(str::to_string) {
            Some(session_id) => self.send(session_id, event),
            None => {
                // A kill for everyone becomes one kill per session, each in its own lane
                for session_id in self.controller.registry().session_ids() {
                    let kill = ControlEvent::KillAudio {
                        session_id: Some(session_id.clone()),
                    };
                    self.send(session_id, kill);
                }
            }
        }
    }

    fn send(&mut self, session_id: String, event: ControlEvent) {
        let controller = &self.controller;
        let lane = self
            .lanes
            .entry(session_id)
            .or_insert_with_key(|id| Lane::spawn(id, controller.clone()));

        lane.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(event)) = lane.sender.send(event) {
            lane.in_flight.fetch_sub(1, Ordering::AcqRel);
            error!(event = event.kind(), "Session lane closed, event dropped");
        }
    }
}
