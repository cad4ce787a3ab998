//! # Playback Executor
//!
//! Plays one item and holds the worker until the clip has had time to finish.
//!
//! ## Steps:
//! 1. Try each configured [`PlaybackMechanism`] in order; each attempt is bounded
//!    by `attempt_timeout`. The first acknowledged attempt wins.
//! 2. Work out the wait: measured duration, else an estimate from the file size,
//!    clamped to `[min_wait, max_wait]`.
//! 3. Wait (a kill or teardown cuts this short), then release the mechanism.
//!
//! A kill or teardown during step 1 abandons the item with
//! [`PlaybackError::Interrupted`] instead of trying the remaining mechanisms.
//!
//! The synchronous wait is what turns the queue into a serialized stream: the
//! worker cannot dequeue the next clip until this returns.

use crate::config::PlaybackConfig;
use crate::playback::backend::{PlaybackBackend, PlaybackError};
use crate::playback::item::{AudioItem, ContentType};
use crate::playback::duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tracing::{debug, info, warn};

/// One way of getting a file into a call, tried in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMechanism {
    /// Broadcast the file into the channel
    Broadcast,
    /// Displace (mux) the channel's audio with the file
    Displace,
    /// Execute a plain file playback on the channel
    Playback,
}

impl PlaybackMechanism {
    pub fn as_str(&self) -> &str {
        match self {
            PlaybackMechanism::Broadcast => "broadcast",
            PlaybackMechanism::Displace => "displace",
            PlaybackMechanism::Playback => "playback",
        }
    }
}

impl fmt::Display for PlaybackMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the post-playback wait is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    pub min_wait_secs: f64,
    pub max_wait_secs: f64,
    pub fallback_sample_rate: u32,
}

impl WaitPolicy {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            min_wait_secs: config.min_wait_secs,
            max_wait_secs: config.max_wait_secs,
            fallback_sample_rate: config.fallback_sample_rate,
        }
    }

    pub fn clamp(&self, seconds: f64) -> f64 {
        if !seconds.is_finite() {
            return self.min_wait_secs;
        }
        seconds.clamp(self.min_wait_secs, self.max_wait_secs)
    }

    /// Wait for a clip given an optional measured duration and file size.
    pub fn compute_wait(
        &self,
        measured_secs: Option<f64>,
        file_size: Option<u64>,
        sample_rate: u32,
    ) -> Duration {
        let seconds = match (measured_secs, file_size) {
            (Some(measured), _) => measured,
            (None, Some(size)) => duration::estimate_from_size(size, sample_rate),
            (None, None) => self.min_wait_secs,
        };
        Duration::from_secs_f64(self.clamp(seconds))
    }
}

/// What happened to an item that was played.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayReport {
    pub mechanism: PlaybackMechanism,
    pub waited: Duration,
    /// The wait was cut short by a kill or teardown
    pub interrupted: bool,
}

pub struct PlaybackExecutor {
    backend: Arc<dyn PlaybackBackend>,
    mechanisms: Vec<PlaybackMechanism>,
    attempt_timeout: Duration,
    wait_policy: WaitPolicy,
}

impl PlaybackExecutor {
    pub fn new(backend: Arc<dyn PlaybackBackend>, config: &PlaybackConfig) -> Self {
        Self {
            backend,
            mechanisms: config.mechanisms.clone(),
            attempt_timeout: config.attempt_timeout(),
            wait_policy: WaitPolicy::from_config(config),
        }
    }

    /// Play `item` on `session_id` and wait out its estimated length.
    ///
    /// `interrupted` must already be enabled; it fires on kill or teardown.
    /// Returns `PlaybackError::Exhausted` when no mechanism acknowledged and
    /// `PlaybackError::Interrupted` when a kill landed first; the item is then
    /// abandoned by the caller.
    pub async fn play(
        &self,
        session_id: &str,
        item: &AudioItem,
        mut interrupted: Pin<&mut Notified<'_>>,
    ) -> Result<PlayReport, PlaybackError> {
        let mechanism = self.start(session_id, item, interrupted.as_mut()).await?;

        let wait = self.wait_for(item).await;
        info!(
            session_id = %session_id,
            file = %item.file_name(),
            mechanism = %mechanism,
            wait_ms = wait.as_millis() as u64,
            "Waiting for playback completion"
        );

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(wait) => false,
            _ = interrupted.as_mut() => true,
        };
        if interrupted {
            debug!(session_id = %session_id, file = %item.file_name(), "Playback wait interrupted");
        }

        let release = self
            .backend
            .finish_playback(mechanism, session_id, &item.file_path);
        match tokio::time::timeout(self.attempt_timeout, release).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(session_id = %session_id, mechanism = %mechanism, error = %err, "Failed to release playback"),
            Err(_) => warn!(session_id = %session_id, mechanism = %mechanism, "Timed out releasing playback"),
        }

        Ok(PlayReport {
            mechanism,
            waited: wait,
            interrupted,
        })
    }

    /// Walk the fallback chain until one mechanism acknowledges.
    async fn start(
        &self,
        session_id: &str,
        item: &AudioItem,
        mut interrupted: Pin<&mut Notified<'_>>,
    ) -> Result<PlaybackMechanism, PlaybackError> {
        let mut last_error = PlaybackError::Rejected("no playback mechanisms configured".to_string());

        for &mechanism in &self.mechanisms {
            let attempt = self
                .backend
                .play_file(mechanism, session_id, &item.file_path, item.sample_rate);

            let result = tokio::select! {
                biased;
                _ = interrupted.as_mut() => {
                    debug!(session_id = %session_id, file = %item.file_name(), mechanism = %mechanism, "Playback start interrupted");
                    return Err(PlaybackError::Interrupted);
                }
                result = tokio::time::timeout(self.attempt_timeout, attempt) => match result {
                    Ok(result) => result,
                    Err(_) => Err(PlaybackError::Timeout(self.attempt_timeout)),
                },
            };

            match result {
                Ok(()) => {
                    debug!(session_id = %session_id, file = %item.file_name(), mechanism = %mechanism, "Playback started");
                    return Ok(mechanism);
                }
                Err(err) => {
                    warn!(
                        session_id = %session_id,
                        file = %item.file_name(),
                        mechanism = %mechanism,
                        error = %err,
                        "Playback attempt failed, trying next mechanism"
                    );
                    last_error = err;
                }
            }
        }

        Err(PlaybackError::Exhausted(Box::new(last_error)))
    }

    async fn wait_for(&self, item: &AudioItem) -> Duration {
        let measured = self.backend.measure_duration(item).await;
        let file_size = match measured {
            Some(_) => None,
            None => tokio::fs::metadata(&item.file_path)
                .await
                .ok()
                .map(|meta| meta.len()),
        };
        let sample_rate = match item.content_type {
            ContentType::Raw => item
                .sample_rate
                .unwrap_or(self.wait_policy.fallback_sample_rate),
            ContentType::Wave => self.wait_policy.fallback_sample_rate,
        };

        self.wait_policy.compute_wait(measured, file_size, sample_rate)
    }
}
