//! # Playback Module
//!
//! Per-session ordered playback of audio files into live calls.
//!
//! ## Pipeline:
//! control event → [`LifecycleController`] → [`AdmissionFilter`] (optional) →
//! [`AudioQueue`] → playback worker → [`PlaybackExecutor`] → [`PlaybackBackend`]
//!
//! ## Module Structure:
//! - `item`: validated playback requests
//! - `queue`: bounded drop-oldest FIFO per session
//! - `admission`: RMS + VAD silence filter
//! - `duration`: clip duration from WAV headers or file size
//! - `backend`: the outbound playback seam and a dry-run implementation
//! - `executor`: mechanism fallback chain and the post-playback wait
//! - `worker`: the per-session playback loop
//! - `session`: session aggregate and registry
//! - `controller`: control events in, registry operations out

pub mod admission;
pub mod backend;
pub mod controller;
pub mod executor;
pub mod item;
pub mod duration;
pub mod queue;
pub mod session;
pub mod worker;

pub use admission::AdmissionFilter;
pub use backend::{DryRunBackend, PlaybackBackend, PlaybackError};
pub use controller::{ControlEvent, ControlOutcome, LifecycleController, PlayRequest};
pub use executor::{PlaybackExecutor, PlaybackMechanism};
pub use item::{AudioItem, ContentType};
pub use queue::AudioQueue;
pub use session::{SessionInfo, SessionRegistry, SessionStatus};
