//! # Lifecycle Controller
//!
//! Turns inbound control events into registry operations. Every transport (ESL
//! events, HTTP routes, the control WebSocket) funnels through [`LifecycleController::handle`]
//! and reports the returned [`ControlOutcome`] back however it can.
//!
//! Nothing here is fatal: bad requests, unknown sessions and admission
//! rejections come back as outcomes and are logged.

use crate::config::{AppConfig, ForkConfig, ForkTrigger};
use crate::playback::admission::AdmissionFilter;
use crate::playback::item::{AudioItem, ContentType};
use crate::playback::session::{PlaybackStats, RegistryError, SessionRegistry};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Payload of a play request, as sent by the audio fork and the control API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayRequest {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub audio_content_type: Option<ContentType>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub text_content: Option<String>,
}

impl PlayRequest {
    /// Content type as sent, or guessed from the file extension.
    fn content_type(&self, file: &str) -> ContentType {
        self.audio_content_type.unwrap_or_else(|| {
            let lower = file.to_ascii_lowercase();
            if lower.ends_with(".wav") || lower.ends_with(".wave") {
                ContentType::Wave
            } else {
                ContentType::Raw
            }
        })
    }
}

/// Direction of a call leg as the switch reports it (`Call-Direction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
    Unknown,
}

impl CallDirection {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("inbound") => CallDirection::Inbound,
            Some("outbound") => CallDirection::Outbound,
            _ => CallDirection::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    SessionStart {
        session_id: String,
    },
    /// Channel answered on the switch
    CallAnswered {
        session_id: String,
        direction: CallDirection,
    },
    /// Channel bridged to its other leg
    CallBridged {
        session_id: String,
        direction: CallDirection,
    },
    PlayAudio {
        session_id: String,
        request: PlayRequest,
    },
    /// `None` kills audio on every session
    KillAudio {
        session_id: Option<String>,
    },
    SessionEnd {
        session_id: String,
    },
}

impl ControlEvent {
    pub fn kind(&self) -> &str {
        match self {
            ControlEvent::SessionStart { .. } => "session_start",
            ControlEvent::CallAnswered { .. } => "call_answered",
            ControlEvent::CallBridged { .. } => "call_bridged",
            ControlEvent::PlayAudio { .. } => "play_audio",
            ControlEvent::KillAudio { .. } => "kill_audio",
            ControlEvent::SessionEnd { .. } => "session_end",
        }
    }

    /// Session the event targets; `None` for a kill on every session.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ControlEvent::SessionStart { session_id }
            | ControlEvent::CallAnswered { session_id, .. }
            | ControlEvent::CallBridged { session_id, .. }
            | ControlEvent::PlayAudio { session_id, .. }
            | ControlEvent::SessionEnd { session_id } => Some(session_id),
            ControlEvent::KillAudio { session_id } => session_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ControlOutcome {
    #[serde(rename_all = "camelCase")]
    SessionStarted { session_id: String, created: bool },
    #[serde(rename_all = "camelCase")]
    Enqueued {
        session_id: String,
        depth: usize,
        dropped: Option<String>,
    },
    /// Malformed request or admission rejection; nothing was queued
    #[serde(rename_all = "camelCase")]
    Rejected { session_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    Killed { sessions: usize, cleared: usize },
    #[serde(rename_all = "camelCase")]
    SessionEnded { session_id: String, removed: bool },
    #[serde(rename_all = "camelCase")]
    UnknownSession { session_id: String },
}

impl ControlOutcome {
    /// True for outcomes a transport should report as a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ControlOutcome::Rejected { .. } | ControlOutcome::UnknownSession { .. }
        )
    }
}

pub struct LifecycleController {
    registry: Arc<SessionRegistry>,
    admission: RwLock<Arc<AdmissionFilter>>,
    fork: RwLock<ForkConfig>,
    /// Sessions with a fork started by us
    forked: Mutex<HashSet<String>>,
}

impl LifecycleController {
    pub fn new(registry: Arc<SessionRegistry>, config: &AppConfig) -> Self {
        Self {
            registry,
            admission: RwLock::new(Arc::new(AdmissionFilter::new(config.admission.clone()))),
            fork: RwLock::new(config.fork.clone()),
            forked: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Swap in updated tunables; applies to sessions and requests from now on.
    pub fn apply_config(&self, config: &AppConfig) {
        self.registry.apply_config(&config.playback);
        *self.admission.write() = Arc::new(AdmissionFilter::new(config.admission.clone()));
        *self.fork.write() = config.fork.clone();
    }

    pub async fn handle(&self, event: ControlEvent) -> ControlOutcome {
        debug!(event = %event.kind(), "Control event");
        match event {
            ControlEvent::SessionStart { session_id } => self.session_start(&session_id).await,
            ControlEvent::CallAnswered { session_id, direction } => {
                self.call_answered(&session_id, direction).await
            }
            ControlEvent::CallBridged { session_id, direction } => {
                self.call_bridged(&session_id, direction).await
            }
            ControlEvent::PlayAudio { session_id, request } => {
                self.play_audio(&session_id, request).await
            }
            ControlEvent::KillAudio { session_id } => self.kill_audio(session_id.as_deref()).await,
            ControlEvent::SessionEnd { session_id } => self.session_end(&session_id).await,
        }
    }

    pub async fn session_start(&self, session_id: &str) -> ControlOutcome {
        self.open_session(session_id, true).await
    }

    /// Outbound calls wait for the bridge to fork unless configured to fork on answer.
    pub async fn call_answered(&self, session_id: &str, direction: CallDirection) -> ControlOutcome {
        let fork_now = direction != CallDirection::Outbound
            || self.fork.read().outbound_trigger == ForkTrigger::Answer;
        self.open_session(session_id, fork_now).await
    }

    pub async fn call_bridged(&self, session_id: &str, direction: CallDirection) -> ControlOutcome {
        let fork_now = direction == CallDirection::Outbound
            && self.fork.read().outbound_trigger == ForkTrigger::Bridge;
        self.open_session(session_id, fork_now).await
    }

    async fn open_session(&self, session_id: &str, with_fork: bool) -> ControlOutcome {
        let (_, created) = self.registry.create_session(session_id);
        if with_fork {
            self.start_fork(session_id).await;
        }

        ControlOutcome::SessionStarted {
            session_id: session_id.to_string(),
            created,
        }
    }

    /// Start the fork with the settings current right now. At most once per session.
    async fn start_fork(&self, session_id: &str) {
        let fork = self.fork.read().clone();
        if !fork.enabled || !self.forked.lock().insert(session_id.to_string()) {
            return;
        }

        if let Err(err) = self.registry.backend().start_audio_fork(session_id, &fork).await {
            warn!(session_id = %session_id, ws_url = %fork.ws_url, error = %err, "Failed to start audio fork");
            self.forked.lock().remove(session_id);
        }
    }

    pub async fn play_audio(&self, session_id: &str, request: PlayRequest) -> ControlOutcome {
        let reject = |reason: String| {
            warn!(session_id = %session_id, reason = %reason, "Play request dropped");
            PlaybackStats::bump(&self.registry.stats().rejected, 1);
            ControlOutcome::Rejected {
                session_id: session_id.to_string(),
                reason,
            }
        };

        if session_id.trim().is_empty() {
            return reject("session id is required".to_string());
        }
        let file = match request.file.as_deref().map(str::trim) {
            Some(file) if !file.is_empty() => file.to_string(),
            _ => return reject("file path is required".to_string()),
        };
        if self.registry.get_session(session_id).is_none() {
            info!(session_id = %session_id, file = %file, "Play request for unknown session ignored");
            return ControlOutcome::UnknownSession {
                session_id: session_id.to_string(),
            };
        }

        let content_type = request.content_type(&file);
        let item = match AudioItem::new(file, content_type, request.sample_rate, request.text_content) {
            Ok(item) => item,
            Err(err) => return reject(err.to_string()),
        };

        let filter = self.admission.read().clone();
        if filter.is_enabled() {
            let candidate = item.clone();
            let admitted = tokio::task::spawn_blocking(move || filter.check_file(&candidate))
                .await
                .unwrap_or_else(|err| {
                    warn!(session_id = %session_id, error = %err, "Admission check crashed");
                    false
                });
            if !admitted {
                return reject(format!("{} did not pass admission", item.file_name()));
            }
        }

        match self.registry.enqueue(session_id, item) {
            Ok(report) => ControlOutcome::Enqueued {
                session_id: session_id.to_string(),
                depth: report.depth,
                dropped: report.dropped,
            },
            Err(RegistryError::NotFound(_)) => ControlOutcome::UnknownSession {
                session_id: session_id.to_string(),
            },
            Err(err @ RegistryError::Closed(_)) => reject(err.to_string()),
        }
    }

    /// Kill one session's audio, or every session's when no id is given.
    pub async fn kill_audio(&self, session_id: Option<&str>) -> ControlOutcome {
        let targets = match session_id {
            Some(id) => vec![id.to_string()],
            None => self.registry.session_ids(),
        };

        let mut sessions = 0;
        let mut cleared = 0;
        for id in &targets {
            match self.registry.kill(id).await {
                Ok(count) => {
                    sessions += 1;
                    cleared += count;
                }
                Err(err) => {
                    info!(session_id = %id, error = %err, "Kill for unknown session ignored");
                    if session_id.is_some() {
                        return ControlOutcome::UnknownSession {
                            session_id: id.clone(),
                        };
                    }
                }
            }
        }

        ControlOutcome::Killed { sessions, cleared }
    }

    /// Clear and remove the session. Safe to repeat and safe for sessions never started.
    pub async fn session_end(&self, session_id: &str) -> ControlOutcome {
        if let Some(session) = self.registry.get_session(session_id) {
            session.kill();
        }
        let removed = self.registry.remove_session(session_id).await;

        let had_fork = self.forked.lock().remove(session_id);
        if had_fork {
            if let Err(err) = self.registry.backend().stop_audio_fork(session_id).await {
                warn!(session_id = %session_id, error = %err, "Failed to stop audio fork");
            }
        }

        ControlOutcome::SessionEnded {
            session_id: session_id.to_string(),
            removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::admission::tests::{tone, wav_bytes};
    use crate::playback::backend::testing::{Call, RecordingBackend};

    fn controller(config: AppConfig) -> (LifecycleController, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let registry = Arc::new(SessionRegistry::new(backend.clone(), &config.playback));
        (LifecycleController::new(registry, &config), backend)
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.playback.min_wait_secs = 0.01;
        config.playback.max_wait_secs = 0.02;
        config.playback.dequeue_timeout_ms = 20;
        config
    }

    fn play(file: &str) -> PlayRequest {
        PlayRequest {
            file: Some(file.to_string()),
            audio_content_type: Some(ContentType::Wave),
            sample_rate: None,
            text_content: Some("hello".to_string()),
        }
    }

    #[test]
    fn test_play_request_wire_format() {
        let request: PlayRequest = serde_json::from_str(
            r#"{"audioContentType":"raw","sampleRate":24000,"file":"/tmp/a.r24","textContent":""}"#,
        )
        .unwrap();
        assert_eq!(request.audio_content_type, Some(ContentType::Raw));
        assert_eq!(request.sample_rate, Some(24000));
        assert_eq!(request.file.as_deref(), Some("/tmp/a.r24"));

        let guessed = PlayRequest::default();
        assert_eq!(guessed.content_type("/tmp/A.WAV"), ContentType::Wave);
        assert_eq!(guessed.content_type("/tmp/a.r16"), ContentType::Raw);
    }

    #[tokio::test]
    async fn test_admission_gates_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let voiced = dir.path().join("voiced.wav");
        let silent = dir.path().join("silent.wav");
        std::fs::write(&voiced, wav_bytes(&tone(1.0, 16000, 1.0), 16000, 1)).unwrap();
        std::fs::write(&silent, wav_bytes(&vec![0.0; 16000], 16000, 1)).unwrap();

        let (controller, _) = controller(fast_config());
        controller.session_start("call-1").await;

        let outcome = controller
            .play_audio("call-1", play(&voiced.to_string_lossy()))
            .await;
        assert!(matches!(outcome, ControlOutcome::Enqueued { depth: 1, .. }));

        let outcome = controller
            .play_audio("call-1", play(&silent.to_string_lossy()))
            .await;
        assert!(matches!(outcome, ControlOutcome::Rejected { .. }));
        assert_eq!(controller.registry().stats().snapshot().rejected, 1);

        controller.session_end("call-1").await;
    }

    #[tokio::test]
    async fn test_malformed_requests_are_dropped() {
        let mut config = fast_config();
        config.admission.enabled = false;
        let (controller, _) = controller(config);
        controller.session_start("call-1").await;

        let missing_file = controller.play_audio("call-1", PlayRequest::default()).await;
        assert!(missing_file.is_failure());

        let missing_rate = controller
            .play_audio(
                "call-1",
                PlayRequest {
                    file: Some("/tmp/a.r16".to_string()),
                    audio_content_type: Some(ContentType::Raw),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(missing_rate, ControlOutcome::Rejected { .. }));

        let no_session = controller.play_audio("", play("/tmp/a.wav")).await;
        assert!(no_session.is_failure());

        assert_eq!(controller.registry().get_session("call-1").unwrap().queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_a_noop() {
        let (controller, backend) = controller(fast_config());

        let outcome = controller.play_audio("ghost", play("/tmp/a.wav")).await;
        assert_eq!(
            outcome,
            ControlOutcome::UnknownSession {
                session_id: "ghost".to_string()
            }
        );
        assert!(controller.kill_audio(Some("ghost")).await.is_failure());
        assert_eq!(controller.registry().active_session_count(), 0);
        assert!(backend.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_session_end_is_idempotent() {
        let (controller, _) = controller(fast_config());

        // Never started
        assert_eq!(
            controller.session_end("call-1").await,
            ControlOutcome::SessionEnded {
                session_id: "call-1".to_string(),
                removed: false
            }
        );

        controller.session_start("call-1").await;
        assert!(matches!(
            controller.session_end("call-1").await,
            ControlOutcome::SessionEnded { removed: true, .. }
        ));
        assert!(matches!(
            controller.session_end("call-1").await,
            ControlOutcome::SessionEnded { removed: false, .. }
        ));
        assert!(controller.registry().get_session("call-1").is_none());
    }

    #[tokio::test]
    async fn test_kill_all_sessions() {
        let mut config = fast_config();
        config.admission.enabled = false;
        config.playback.min_wait_secs = 1.0;
        config.playback.max_wait_secs = 1.0;
        let (controller, backend) = controller(config);

        for id in ["a", "b"] {
            controller.session_start(id).await;
            for n in 0..3 {
                controller
                    .play_audio(id, play(&format!("/tmp/{}-{}.wav", id, n)))
                    .await;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        match controller.kill_audio(None).await {
            ControlOutcome::Killed { sessions, cleared } => {
                assert_eq!(sessions, 2);
                assert_eq!(cleared, 4);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(backend.stop_count("a"), 1);
        assert_eq!(backend.stop_count("b"), 1);

        controller.registry().shutdown().await;
    }

    #[tokio::test]
    async fn test_fork_follows_session_lifecycle() {
        let mut config = fast_config();
        config.fork.enabled = true;
        let (controller, backend) = controller(config);

        controller.session_start("call-1").await;
        controller.session_start("call-1").await;
        controller.session_end("call-1").await;
        controller.session_end("call-1").await;

        assert_eq!(
            *backend.calls.lock(),
            vec![
                fork_start("call-1", "ws://localhost:8080/audio"),
                Call::ForkStop("call-1".to_string())
            ]
        );
    }

    fn fork_start(session_id: &str, ws_url: &str) -> Call {
        Call::ForkStart {
            session_id: session_id.to_string(),
            ws_url: ws_url.to_string(),
            sample_rate: 16000,
        }
    }

    #[tokio::test]
    async fn test_outbound_fork_waits_for_bridge() {
        let mut config = fast_config();
        config.fork.enabled = true;
        let (controller, backend) = controller(config);

        let answered = controller
            .handle(ControlEvent::CallAnswered {
                session_id: "out-1".to_string(),
                direction: CallDirection::Outbound,
            })
            .await;
        assert!(matches!(answered, ControlOutcome::SessionStarted { created: true, .. }));
        assert!(backend.calls.lock().is_empty());

        for _ in 0..2 {
            controller
                .handle(ControlEvent::CallBridged {
                    session_id: "out-1".to_string(),
                    direction: CallDirection::Outbound,
                })
                .await;
        }
        controller
            .handle(ControlEvent::CallAnswered {
                session_id: "in-1".to_string(),
                direction: CallDirection::Inbound,
            })
            .await;
        // Bridging an inbound leg starts nothing new
        controller
            .handle(ControlEvent::CallBridged {
                session_id: "in-1".to_string(),
                direction: CallDirection::Inbound,
            })
            .await;

        assert_eq!(
            *backend.calls.lock(),
            vec![
                fork_start("out-1", "ws://localhost:8080/audio"),
                fork_start("in-1", "ws://localhost:8080/audio"),
            ]
        );
    }

    #[tokio::test]
    async fn test_fork_uses_settings_current_at_start() {
        let mut config = fast_config();
        config.fork.enabled = true;
        let (controller, backend) = controller(config.clone());

        controller.session_start("call-1").await;
        config.fork.ws_url = "ws://media:9000/stream".to_string();
        controller.apply_config(&config);
        controller.session_start("call-2").await;

        // Disabling later does not leak the running fork
        config.fork.enabled = false;
        controller.apply_config(&config);
        controller.session_end("call-2").await;

        assert_eq!(
            *backend.calls.lock(),
            vec![
                fork_start("call-1", "ws://localhost:8080/audio"),
                fork_start("call-2", "ws://media:9000/stream"),
                Call::ForkStop("call-2".to_string()),
            ]
        );
    }
}
