//! # Playback Sessions
//!
//! One [`PlaybackSession`] per call leg, owned by the [`SessionRegistry`]. The
//! session aggregates everything that has to be torn down together: the queue,
//! the worker handle, status and the item in flight.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: no worker running; the next enqueue spawns one
//! 2. **Playing**: a worker owns the queue and plays items in order
//! 3. **Stopping**: removal requested, waiting for the worker to exit
//! 4. **Stopped**: worker gone, session out of the registry
//!
//! ## Locking:
//! The registry map has its own lock, held only for lookups and map mutation.
//! Each session has a state lock and its queue has a separate lock. When both
//! are needed the state lock is taken first.

use crate::config::PlaybackConfig;
use crate::playback::backend::PlaybackBackend;
use crate::playback::executor::PlaybackExecutor;
use crate::playback::item::AudioItem;
use crate::playback::queue::{AudioQueue, QueueError};
use crate::playback::worker::{self, WorkerSettings};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Playing,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// No live session with this id
    NotFound(String),
    /// The session is being torn down and accepts no more audio
    Closed(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "session '{}' not found", id),
            RegistryError::Closed(id) => write!(f, "session '{}' is closing", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Process-wide playback counters, kept across session removal.
#[derive(Debug, Default)]
pub struct PlaybackStats {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub rejected: AtomicU64,
    pub played: AtomicU64,
    pub failed: AtomicU64,
    pub killed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PlaybackStatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub played: u64,
    pub failed: u64,
    pub killed: u64,
}

impl PlaybackStats {
    pub fn snapshot(&self) -> PlaybackStatsSnapshot {
        PlaybackStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            played: self.played.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SessionCounters {
    pub played: u64,
    pub failed: u64,
    pub dropped: u64,
}

pub(crate) struct SessionState {
    pub status: SessionStatus,
    pub current_item: Option<AudioItem>,
    pub worker: Option<JoinHandle<()>>,
    pub counters: SessionCounters,
}

/// Everything owned for one call leg.
pub struct PlaybackSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub(crate) queue: AudioQueue,
    pub(crate) state: Mutex<SessionState>,
    /// Wakes the executor out of a playback start or its post-playback wait
    pub(crate) interrupt: Notify,
    pub(crate) stats: Arc<PlaybackStats>,
}

/// Point-in-time view of a session for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub status: SessionStatus,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
    pub pending: Vec<String>,
    pub current_file: Option<String>,
    pub played: u64,
    pub failed: u64,
    pub dropped: u64,
    pub created_at: DateTime<Utc>,
}

impl PlaybackSession {
    fn new(id: String, max_queue_depth: usize, stats: Arc<PlaybackStats>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            queue: AudioQueue::new(max_queue_depth),
            state: Mutex::new(SessionState {
                status: SessionStatus::Idle,
                current_item: None,
                worker: None,
                counters: SessionCounters::default(),
            }),
            interrupt: Notify::new(),
            stats,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            session_id: self.id.clone(),
            status: state.status,
            queue_depth: self.queue.len(),
            max_queue_depth: self.queue.max_depth(),
            pending: self.queue.snapshot(),
            current_file: state.current_item.as_ref().map(|item| item.file_path.clone()),
            played: state.counters.played,
            failed: state.counters.failed,
            dropped: state.counters.dropped,
            created_at: self.created_at,
        }
    }

    /// Drop pending items and cut the current wait short. Returns how many were cleared.
    pub fn kill(&self) -> usize {
        let cleared = self.queue.clear();
        self.interrupt.notify_waiters();
        PlaybackStats::bump(&self.stats.killed, cleared as u64);
        cleared
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// The queue is closed first so no enqueue can start a new worker behind us.
    /// The status only reaches `Stopped` once the worker task has finished.
    async fn shut_down(&self, join_timeout: Duration) {
        let cleared = self.queue.stop();
        let handle = {
            let mut state = self.state.lock();
            state.status = if state.worker.is_some() {
                SessionStatus::Stopping
            } else {
                SessionStatus::Stopped
            };
            state.worker.take()
        };
        self.interrupt.notify_waiters();

        if let Some(mut handle) = handle {
            match tokio::time::timeout(join_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_panic() => {
                    warn!(session_id = %self.id, "Playback worker panicked during shutdown");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(
                        session_id = %self.id,
                        timeout_ms = join_timeout.as_millis() as u64,
                        "Playback worker did not exit in time, aborting"
                    );
                    handle.abort();
                    // Abort only lands at the task's next yield
                    let _ = handle.await;
                }
            }
        }

        let mut state = self.state.lock();
        state.status = SessionStatus::Stopped;
        state.current_item = None;
        debug!(session_id = %self.id, cleared = cleared, "Session stopped");
    }
}

/// What `SessionRegistry::enqueue` did.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueReport {
    pub depth: usize,
    /// File path of the item evicted to make room
    pub dropped: Option<String>,
    /// A fresh worker was started for this item
    pub worker_started: bool,
}

/// Executor and worker settings, swapped as a unit on config updates.
struct RegistryRuntime {
    executor: Arc<PlaybackExecutor>,
    settings: WorkerSettings,
    max_queue_depth: usize,
}

/// Owns every live session.
///
/// ## Thread Safety:
/// `RwLock` over the map: lookups share, create/remove are exclusive and short.
/// Nothing awaits while holding it.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PlaybackSession>>>,
    runtime: RwLock<RegistryRuntime>,
    backend: Arc<dyn PlaybackBackend>,
    stats: Arc<PlaybackStats>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn PlaybackBackend>, config: &PlaybackConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            runtime: RwLock::new(Self::runtime_for(backend.clone(), config)),
            backend,
            stats: Arc::new(PlaybackStats::default()),
        }
    }

    fn runtime_for(backend: Arc<dyn PlaybackBackend>, config: &PlaybackConfig) -> RegistryRuntime {
        RegistryRuntime {
            executor: Arc::new(PlaybackExecutor::new(backend, config)),
            settings: WorkerSettings::from_config(config),
            max_queue_depth: config.max_queue_depth,
        }
    }

    /// Apply new playback tunables. Running workers keep the settings they started with.
    pub fn apply_config(&self, config: &PlaybackConfig) {
        *self.runtime.write() = Self::runtime_for(self.backend.clone(), config);
        info!(
            max_queue_depth = config.max_queue_depth,
            mechanisms = ?config.mechanisms,
            "Playback settings updated"
        );
    }

    pub fn backend(&self) -> &Arc<dyn PlaybackBackend> {
        &self.backend
    }

    pub fn stats(&self) -> &Arc<PlaybackStats> {
        &self.stats
    }

    /// Create the session, or return the existing one. The flag is true when it was created.
    pub fn create_session(&self, session_id: &str) -> (Arc<PlaybackSession>, bool) {
        if let Some(existing) = self.get_session(session_id) {
            return (existing, false);
        }

        let max_queue_depth = self.runtime.read().max_queue_depth;
        let mut sessions = self.sessions.write();
        // Another caller may have won the race between the read and write locks
        if let Some(existing) = sessions.get(session_id) {
            return (existing.clone(), false);
        }

        let session = Arc::new(PlaybackSession::new(
            session_id.to_string(),
            max_queue_depth,
            self.stats.clone(),
        ));
        sessions.insert(session_id.to_string(), session.clone());
        info!(session_id = %session_id, active = sessions.len(), "Session created");
        (session, true)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<PlaybackSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Queue an item for a live session, starting its worker if it is idle.
    pub fn enqueue(&self, session_id: &str, item: AudioItem) -> Result<EnqueueReport, RegistryError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        let file = item.file_name().to_string();
        let outcome = session.queue.enqueue(item).map_err(|err| match err {
            QueueError::Closed => RegistryError::Closed(session_id.to_string()),
        })?;
        PlaybackStats::bump(&self.stats.enqueued, 1);

        let dropped = outcome.dropped.map(|oldest| {
            warn!(
                session_id = %session_id,
                dropped = %oldest.file_name(),
                max_depth = session.queue.max_depth(),
                "Queue full, dropped oldest item"
            );
            PlaybackStats::bump(&self.stats.dropped, 1);
            oldest.file_path
        });

        let worker_started = {
            let mut state = session.state.lock();
            if dropped.is_some() {
                state.counters.dropped += 1;
            }
            // The item is already in the queue; an idle worker exiting concurrently
            // re-checks emptiness under this same lock
            if state.status == SessionStatus::Idle && !session.queue.is_closed() {
                let (executor, settings) = {
                    let runtime = self.runtime.read();
                    (runtime.executor.clone(), runtime.settings.clone())
                };
                state.status = SessionStatus::Playing;
                state.worker = Some(tokio::spawn(worker::run(session.clone(), executor, settings)));
                true
            } else {
                false
            }
        };

        debug!(
            session_id = %session_id,
            file = %file,
            depth = outcome.depth,
            worker_started = worker_started,
            "Item enqueued"
        );

        Ok(EnqueueReport {
            depth: outcome.depth,
            dropped,
            worker_started,
        })
    }

    /// Clear one session's queue, interrupt its wait and stop whatever is playing.
    pub async fn kill(&self, session_id: &str) -> Result<usize, RegistryError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        let cleared = session.kill();
        let join_timeout = self.runtime.read().settings.join_timeout;
        match tokio::time::timeout(join_timeout, self.backend.stop_playback(session_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(session_id = %session_id, error = %err, "Failed to stop playback"),
            Err(_) => warn!(session_id = %session_id, "Timed out stopping playback"),
        }

        info!(session_id = %session_id, cleared = cleared, "Audio killed");
        Ok(cleared)
    }

    /// Tear down a session. Returns false when there was nothing to remove.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id);
        let Some(session) = removed else {
            debug!(session_id = %session_id, "Remove for unknown session ignored");
            return false;
        };

        let join_timeout = self.runtime.read().settings.join_timeout;
        session.shut_down(join_timeout).await;
        info!(session_id = %session_id, "Session removed");
        true
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<PlaybackSession>> = self.sessions.read().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|session| session.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Items waiting across all sessions.
    pub fn total_backlog(&self) -> usize {
        self.sessions
            .read()
            .values()
            .map(|session| session.queue_depth())
            .sum()
    }

    /// Remove every session. Used on graceful shutdown.
    pub async fn shutdown(&self) -> usize {
        let ids = self.session_ids();
        let mut removed = 0;
        for id in &ids {
            if self.remove_session(id).await {
                removed += 1;
            }
        }
        info!(removed = removed, "All playback sessions shut down");
        removed
    }
}
