//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_ESL_HOST, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where the HTTP/WebSocket control surface listens
//! - **playback**: queue bounds, worker polling and executor wait tuning
//! - **admission**: silence rejection thresholds
//! - **esl**: FreeSWITCH Event Socket connection
//! - **fork**: where call audio is streamed when a session starts

use crate::playback::executor::PlaybackMechanism;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub playback: PlaybackConfig,
    pub admission: AdmissionConfig,
    pub esl: EslConfig,
    pub fork: ForkConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Per-session playback queue tuning.
///
/// ## Fields:
/// - `max_queue_depth`: pending items kept per session before the oldest is dropped
/// - `dequeue_timeout_ms`: how long a worker waits for work before re-checking its session
/// - `idle_exit_polls`: consecutive empty waits after which an idle worker exits
/// - `attempt_timeout_ms`: bound on a single playback command
/// - `min_wait_secs` / `max_wait_secs`: clamp applied to the post-playback wait
/// - `fallback_sample_rate`: assumed rate when estimating a clip length from its size
/// - `mechanisms`: playback commands tried in order until one succeeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub max_queue_depth: usize,
    pub dequeue_timeout_ms: u64,
    pub idle_exit_polls: u32,
    pub attempt_timeout_ms: u64,
    pub min_wait_secs: f64,
    pub max_wait_secs: f64,
    pub fallback_sample_rate: u32,
    pub mechanisms: Vec<PlaybackMechanism>,
}

/// Silence rejection applied before a clip is queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub enabled: bool,
    /// Normalized RMS the whole clip must exceed
    pub rms_floor: f32,
    /// Voiced duration (seconds) the clip must reach
    pub vad_threshold_secs: f64,
    /// Normalized RMS a 10ms frame must exceed to count as voiced
    pub vad_frame_floor: f32,
}

/// FreeSWITCH Event Socket connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EslConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub reconnect_delay_secs: u64,
}

/// Audio fork settings (call audio streamed to a WebSocket consumer).
///
/// `buffer_size`, `heart_beat_secs`, `suppress_log` and `message_deflate` are
/// set as `STREAM_*` channel variables right before the fork starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkConfig {
    pub enabled: bool,
    pub ws_url: String,
    pub mix_type: String,
    pub sample_rate: u32,
    /// Event that starts the fork on outbound calls
    pub outbound_trigger: ForkTrigger,
    pub buffer_size: u32,
    pub heart_beat_secs: u32,
    pub suppress_log: bool,
    pub message_deflate: bool,
}

/// When an outbound call gets its audio fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkTrigger {
    Answer,
    /// Wait until the far end is bridged in
    Bridge,
}

/// What the config API shows instead of the ESL password.
pub const REDACTED_PASSWORD: &str = "********";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            playback: PlaybackConfig {
                max_queue_depth: 10,
                dequeue_timeout_ms: 5000,
                idle_exit_polls: 2,
                attempt_timeout_ms: 3000,
                min_wait_secs: 0.5,
                max_wait_secs: 15.0,
                fallback_sample_rate: 24000,
                mechanisms: vec![
                    PlaybackMechanism::Broadcast,
                    PlaybackMechanism::Displace,
                    PlaybackMechanism::Playback,
                ],
            },
            admission: AdmissionConfig {
                enabled: true,
                rms_floor: 0.02,
                vad_threshold_secs: 0.15,
                vad_frame_floor: 0.01,
            },
            esl: EslConfig {
                enabled: false,
                host: "127.0.0.1".to_string(),
                port: 8021,
                password: "ClueCon".to_string(),
                reconnect_delay_secs: 10,
            },
            fork: ForkConfig {
                enabled: false,
                ws_url: "ws://localhost:8080/audio".to_string(),
                mix_type: "mono".to_string(),
                sample_rate: 16000,
                outbound_trigger: ForkTrigger::Bridge,
                buffer_size: 20,
                heart_beat_secs: 30,
                suppress_log: false,
                message_deflate: true,
            },
        }
    }
}

impl PlaybackConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_ESL_HOST=10.0.0.5`: Override the Event Socket host
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Queue depth and timeouts are non-zero
    /// - The wait clamp is a valid, positive range
    /// - At least one playback mechanism is configured
    /// - The ESL port is not 0 when the adapter is enabled
    /// - An enabled fork has a target URL and a sample rate
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let playback = &self.playback;
        if playback.max_queue_depth == 0 {
            return Err(anyhow::anyhow!("Max queue depth must be greater than 0"));
        }

        if playback.dequeue_timeout_ms == 0 || playback.attempt_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Playback timeouts must be greater than 0"));
        }

        if playback.min_wait_secs <= 0.0 || playback.min_wait_secs > playback.max_wait_secs {
            return Err(anyhow::anyhow!(
                "Invalid wait range: min {} / max {}",
                playback.min_wait_secs,
                playback.max_wait_secs
            ));
        }

        if playback.fallback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Fallback sample rate must be greater than 0"));
        }

        if playback.mechanisms.is_empty() {
            return Err(anyhow::anyhow!("At least one playback mechanism is required"));
        }

        if self.admission.rms_floor < 0.0 || self.admission.vad_threshold_secs < 0.0 {
            return Err(anyhow::anyhow!("Admission thresholds cannot be negative"));
        }

        if self.esl.enabled && self.esl.port == 0 {
            return Err(anyhow::anyhow!("ESL port cannot be 0"));
        }

        if self.fork.enabled && (self.fork.ws_url.trim().is_empty() || self.fork.sample_rate == 0) {
            return Err(anyhow::anyhow!("Audio fork needs a ws_url and a sample rate"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only fields present in the JSON are changed, e.g. `{"playback": {"max_queue_depth": 20}}`.
    /// Any field of any section may be sent. An ESL password equal to
    /// [`REDACTED_PASSWORD`] is ignored, so a config read from the API can be
    /// sent back unchanged. Nothing is changed if the result does not validate.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let mut partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial_config.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        if let Some(esl) = partial_config.get_mut("esl").and_then(|esl| esl.as_object_mut()) {
            if esl.get("password").and_then(|v| v.as_str()) == Some(REDACTED_PASSWORD) {
                esl.remove("password");
            }
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial_config);
        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;

        *self = updated;
        Ok(())
    }
}

/// Overlay `patch` onto `target`, object by object.
fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
