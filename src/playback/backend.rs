//! # Playback Backend
//!
//! The seam between the queue manager and whatever actually injects audio into
//! a call. The ESL adapter implements it against FreeSWITCH; [`DryRunBackend`]
//! acknowledges everything so the service can run without a switch.

use crate::config::ForkConfig;
use crate::playback::executor::PlaybackMechanism;
use crate::playback::item::AudioItem;
use crate::playback::duration;
use futures_util::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Failure of one outbound playback command.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// The command did not answer within the attempt timeout
    Timeout(Duration),
    /// The platform answered with an error reply
    Rejected(String),
    /// No usable connection to the platform
    Connection(String),
    /// A kill or teardown arrived before any mechanism acknowledged
    Interrupted,
    /// Every configured mechanism failed; holds the last error seen
    Exhausted(Box<PlaybackError>),
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackError::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            PlaybackError::Rejected(reply) => write!(f, "rejected: {}", reply),
            PlaybackError::Connection(msg) => write!(f, "connection error: {}", msg),
            PlaybackError::Interrupted => write!(f, "interrupted before playback started"),
            PlaybackError::Exhausted(last) => write!(f, "all playback mechanisms failed, last: {}", last),
        }
    }
}

impl std::error::Error for PlaybackError {}

pub type BackendFuture<'a, T> = BoxFuture<'a, Result<T, PlaybackError>>;

/// Outbound playback primitive.
///
/// ## Contract:
/// - `play_file` starts playback with one mechanism and returns once the platform
///   acknowledges; it does not wait for the clip to finish
/// - `finish_playback` releases whatever `play_file` set up (no-op by default)
/// - `stop_playback` interrupts anything playing on the call
/// - `measure_duration` reports the clip length when it can be known exactly
pub trait PlaybackBackend: Send + Sync {
    fn name(&self) -> &str;

    fn play_file<'a>(
        &'a self,
        mechanism: PlaybackMechanism,
        session_id: &'a str,
        file_path: &'a str,
        sample_rate: Option<u32>,
    ) -> BackendFuture<'a, ()>;

    fn finish_playback<'a>(
        &'a self,
        _mechanism: PlaybackMechanism,
        _session_id: &'a str,
        _file_path: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn stop_playback<'a>(&'a self, session_id: &'a str) -> BackendFuture<'a, ()>;

    fn measure_duration<'a>(&'a self, item: &'a AudioItem) -> BoxFuture<'a, Option<f64>> {
        let item = item.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || duration::measure_duration(&item))
                .await
                .ok()
                .flatten()
        })
    }

    /// Start streaming the call's audio to the remote consumer described by `fork`.
    fn start_audio_fork<'a>(&'a self, _session_id: &'a str, _fork: &'a ForkConfig) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn stop_audio_fork<'a>(&'a self, _session_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Backend used when no call-control platform is configured.
#[derive(Debug, Default)]
pub struct DryRunBackend;

impl PlaybackBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn play_file<'a>(
        &'a self,
        mechanism: PlaybackMechanism,
        session_id: &'a str,
        file_path: &'a str,
        sample_rate: Option<u32>,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            info!(
                session_id = %session_id,
                file = %file_path,
                mechanism = %mechanism,
                sample_rate = ?sample_rate,
                "[dry-run] play"
            );
            Ok(())
        })
    }

    fn stop_playback<'a>(&'a self, session_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            info!(session_id = %session_id, "[dry-run] stop playback");
            Ok(())
        })
    }
}
