//! # Playback Worker
//!
//! One task per session with pending audio. Pulls items in FIFO order and hands
//! each to the executor, which returns only after the clip's playback window.
//!
//! ## State Machine:
//! `Idle → Running → Draining → Stopped`
//! - Running: status `Playing`, looping on a bounded dequeue
//! - After `idle_exit_polls` empty polls the task exits and the session goes
//!   back to `Idle`; the next enqueue spawns a fresh worker
//! - The stop marker moves the session to `Stopping` (draining) and the task
//!   exits to `Stopped` without playing anything further
//!
//! A failing or panicking item is logged and counted; the loop moves on. An
//! item whose session was killed between dequeue and playback is dropped.

use crate::config::PlaybackConfig;
use crate::playback::backend::PlaybackError;
use crate::playback::executor::PlaybackExecutor;
use crate::playback::item::AudioItem;
use crate::playback::queue::Dequeued;
use crate::playback::session::{PlaybackSession, PlaybackStats, SessionStatus};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub dequeue_timeout: Duration,
    pub idle_exit_polls: u32,
    /// How long removal waits for the task before aborting it
    pub join_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        // One attempt per mechanism, one release, one spare
        let attempts = config.mechanisms.len() as u32 + 2;
        Self {
            dequeue_timeout: config.dequeue_timeout(),
            idle_exit_polls: config.idle_exit_polls.max(1),
            join_timeout: config.attempt_timeout() * attempts,
        }
    }
}

pub async fn run(
    session: Arc<PlaybackSession>,
    executor: Arc<PlaybackExecutor>,
    settings: WorkerSettings,
) {
    debug!(session_id = %session.id, "Playback worker started");
    let mut empty_polls = 0u32;

    loop {
        match session.queue.dequeue(settings.dequeue_timeout).await {
            Dequeued::Item { item, generation } => {
                empty_polls = 0;
                play_item(&session, &executor, item, generation).await;
            }
            Dequeued::Empty => {
                empty_polls += 1;
                if empty_polls < settings.idle_exit_polls {
                    continue;
                }

                let mut state = session.state.lock();
                if state.status != SessionStatus::Playing {
                    // Removal has taken over
                    continue;
                }
                if session.queue.is_empty() {
                    state.status = SessionStatus::Idle;
                    state.worker = None;
                    debug!(session_id = %session.id, polls = empty_polls, "Worker idle, exiting");
                    return;
                }
                empty_polls = 0;
            }
            Dequeued::Stop => {
                session.state.lock().status = SessionStatus::Stopping;
                debug!(session_id = %session.id, "Stop signal received, draining");
                break;
            }
        }
    }

    let mut state = session.state.lock();
    state.status = SessionStatus::Stopped;
    state.current_item = None;
    debug!(session_id = %session.id, "Playback worker stopped");
}

/// Play one dequeued item. `generation` is the queue generation it was taken in.
async fn play_item(session: &PlaybackSession, executor: &PlaybackExecutor, item: AudioItem, generation: u64) {
    let interrupted = session.interrupt.notified();
    tokio::pin!(interrupted);
    interrupted.as_mut().enable();

    // Kills from here on wake `interrupted`; one that landed after the dequeue moved the generation
    if session.queue.generation() != generation {
        PlaybackStats::bump(&session.stats.killed, 1);
        debug!(session_id = %session.id, file = %item.file_name(), "Item killed before playback");
        return;
    }

    {
        let mut state = session.state.lock();
        if state.status == SessionStatus::Idle {
            state.status = SessionStatus::Playing;
        }
        state.current_item = Some(item.clone());
    }

    let queued_for = item.enqueued_at.elapsed();
    info!(
        session_id = %session.id,
        file = %item.file_name(),
        content_type = item.content_type.as_str(),
        text = item.text_content.as_deref().unwrap_or(""),
        queued_ms = queued_for.as_millis() as u64,
        remaining = session.queue.len(),
        "Playing item"
    );

    let attempt = executor.play(&session.id, &item, interrupted);
    let outcome = AssertUnwindSafe(attempt).catch_unwind().await;

    let mut state = session.state.lock();
    state.current_item = None;
    match outcome {
        Ok(Ok(report)) => {
            state.counters.played += 1;
            PlaybackStats::bump(&session.stats.played, 1);
            debug!(
                session_id = %session.id,
                file = %item.file_name(),
                mechanism = %report.mechanism,
                interrupted = report.interrupted,
                "Item finished"
            );
        }
        Ok(Err(PlaybackError::Interrupted)) => {
            PlaybackStats::bump(&session.stats.killed, 1);
            debug!(session_id = %session.id, file = %item.file_name(), "Item killed while starting");
        }
        Ok(Err(err)) => {
            state.counters.failed += 1;
            PlaybackStats::bump(&session.stats.failed, 1);
            error!(
                session_id = %session.id,
                file = %item.file_name(),
                error = %err,
                "Playback failed, item abandoned"
            );
        }
        Err(panic) => {
            state.counters.failed += 1;
            PlaybackStats::bump(&session.stats.failed, 1);
            error!(
                session_id = %session.id,
                file = %item.file_name(),
                panic = %panic_message(&panic),
                "Playback panicked, item abandoned"
            );
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        warn!("Playback panicked with a non-string payload");
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::playback::backend::testing::RecordingBackend;
    use crate::playback::executor::PlaybackMechanism;
    use crate::playback::session::SessionRegistry;

    fn fast_config() -> PlaybackConfig {
        let mut config = AppConfig::default().playback;
        config.min_wait_secs = 0.02;
        config.max_wait_secs = 0.02;
        config.dequeue_timeout_ms = 20;
        config.attempt_timeout_ms = 200;
        config
    }

    fn fast_registry(backend: Arc<RecordingBackend>) -> SessionRegistry {
        SessionRegistry::new(backend, &fast_config())
    }

    fn clip(tag: usize) -> AudioItem {
        AudioItem::raw(format!("/tmp/clip-{}.r16", tag), 16000).unwrap()
    }

    async fn wait_until_idle(registry: &SessionRegistry, session_id: &str) {
        for _ in 0..200 {
            let session = registry.get_session(session_id).unwrap();
            if session.status() == SessionStatus::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} never went idle", session_id);
    }

    #[tokio::test]
    async fn test_plays_in_fifo_order() {
        let backend = Arc::new(RecordingBackend::default());
        let registry = fast_registry(backend.clone());
        registry.create_session("call-1");

        for tag in 1..=5 {
            registry.enqueue("call-1", clip(tag)).unwrap();
        }
        wait_until_idle(&registry, "call-1").await;

        let expected: Vec<String> = (1..=5).map(|tag| format!("/tmp/clip-{}.r16", tag)).collect();
        assert_eq!(backend.played_files("call-1"), expected);
        assert_eq!(registry.stats().snapshot().played, 5);
    }

    #[tokio::test]
    async fn test_kill_clears_pending_items() {
        let backend = Arc::new(RecordingBackend::default());
        let mut config = AppConfig::default().playback;
        // Long enough that items 2..5 are still queued when the kill lands
        config.min_wait_secs = 0.3;
        config.max_wait_secs = 0.3;
        config.dequeue_timeout_ms = 20;
        let registry = SessionRegistry::new(backend.clone(), &config);
        registry.create_session("call-1");

        for tag in 1..=5 {
            registry.enqueue("call-1", clip(tag)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cleared = registry.kill("call-1").await.unwrap();
        assert_eq!(cleared, 4);
        assert_eq!(backend.stop_count("call-1"), 1);

        // Nothing from before the kill plays afterwards
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.played_files("call-1"), vec!["/tmp/clip-1.r16".to_string()]);

        // New audio after the kill still plays
        registry.enqueue("call-1", clip(9)).unwrap();
        wait_until_idle(&registry, "call-1").await;
        assert_eq!(
            backend.played_files("call-1"),
            vec!["/tmp/clip-1.r16".to_string(), "/tmp/clip-9.r16".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failing_item_does_not_stop_worker() {
        let backend = Arc::new(RecordingBackend::default());
        backend.panicking.lock().insert("/tmp/clip-2.r16".to_string());
        let registry = fast_registry(backend.clone());
        registry.create_session("call-1");

        for tag in 1..=3 {
            registry.enqueue("call-1", clip(tag)).unwrap();
        }
        wait_until_idle(&registry, "call-1").await;

        assert_eq!(
            backend.played_files("call-1"),
            vec!["/tmp/clip-1.r16".to_string(), "/tmp/clip-3.r16".to_string()]
        );
        let info = &registry.list_sessions()[0];
        assert_eq!(info.played, 2);
        assert_eq!(info.failed, 1);
    }

    #[tokio::test]
    async fn test_exhausted_mechanisms_abandon_item() {
        let backend = Arc::new(RecordingBackend::failing(&[
            PlaybackMechanism::Broadcast,
            PlaybackMechanism::Displace,
            PlaybackMechanism::Playback,
        ]));
        let registry = fast_registry(backend.clone());
        registry.create_session("call-1");

        registry.enqueue("call-1", clip(1)).unwrap();
        registry.enqueue("call-1", clip(2)).unwrap();
        wait_until_idle(&registry, "call-1").await;

        // Three attempts per item, no retries
        assert_eq!(backend.calls.lock().len(), 6);
        assert_eq!(registry.stats().snapshot().failed, 2);
    }

    #[tokio::test]
    async fn test_idle_worker_exits_and_restarts() {
        let backend = Arc::new(RecordingBackend::default());
        let registry = fast_registry(backend.clone());
        registry.create_session("call-1");

        let first = registry.enqueue("call-1", clip(1)).unwrap();
        assert!(first.worker_started);
        wait_until_idle(&registry, "call-1").await;
        assert!(registry
            .get_session("call-1")
            .unwrap()
            .state
            .lock()
            .worker
            .is_none());

        let second = registry.enqueue("call-1", clip(2)).unwrap();
        assert!(second.worker_started);
        wait_until_idle(&registry, "call-1").await;
        assert_eq!(backend.played_files("call-1").len(), 2);
    }

    #[tokio::test]
    async fn test_remove_stops_worker_mid_wait() {
        let backend = Arc::new(RecordingBackend::default());
        let mut config = AppConfig::default().playback;
        config.min_wait_secs = 10.0;
        config.max_wait_secs = 10.0;
        let registry = SessionRegistry::new(backend.clone(), &config);
        registry.create_session("call-1");
        registry.enqueue("call-1", clip(1)).unwrap();
        registry.enqueue("call-1", clip(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let session = registry.get_session("call-1").unwrap();
        let started = std::time::Instant::now();
        assert!(registry.remove_session("call-1").await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(backend.played_files("call-1"), vec!["/tmp/clip-1.r16".to_string()]);
    }

    #[test]
    fn test_join_timeout_covers_whole_chain() {
        let config = AppConfig::default().playback;
        let settings = WorkerSettings::from_config(&config);
        let chain = config.attempt_timeout() * (config.mechanisms.len() as u32 + 1);
        assert!(settings.join_timeout > chain);
    }

    #[tokio::test]
    async fn test_kill_between_dequeue_and_play_drops_item() {
        let backend = Arc::new(RecordingBackend::default());
        let registry = fast_registry(backend.clone());
        let (session, _) = registry.create_session("call-1");
        session.queue.enqueue(clip(1)).unwrap();

        let Dequeued::Item { item, generation } = session.queue.dequeue(Duration::from_millis(10)).await else {
            panic!("expected an item");
        };
        // Lands before the item is handed to the executor
        session.kill();

        let executor = PlaybackExecutor::new(backend.clone(), &fast_config());
        play_item(&session, &executor, item, generation).await;

        assert!(backend.played_files("call-1").is_empty());
        assert_eq!(registry.stats().snapshot().killed, 1);
        assert!(session.state.lock().current_item.is_none());
    }

    #[tokio::test]
    async fn test_remove_interrupts_slow_start() {
        // Each attempt would take 2s of a 3s budget, three mechanisms deep
        let backend = Arc::new(RecordingBackend {
            play_delay: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        let registry = SessionRegistry::new(backend.clone(), &AppConfig::default().playback);
        registry.create_session("call-1");
        registry.enqueue("call-1", clip(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let session = registry.get_session("call-1").unwrap();
        let started = std::time::Instant::now();
        assert!(registry.remove_session("call-1").await);

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(session.state.lock().worker.is_none());
        assert!(backend.calls.lock().is_empty());
    }
}
