//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## What lives here:
//! - **config**: current [`AppConfig`], replaceable at runtime through the config API
//! - **controller**: the [`LifecycleController`] (and through it the session registry)
//! - **metrics**: request counters maintained by the middleware
//!
//! ## Thread Safety:
//! Everything is behind `Arc`, so cloning `AppState` is cheap and every worker
//! thread of the HTTP server sees the same sessions. Locks are `parking_lot`
//! locks: no poisoning, and none are held across an `.await`.

use crate::config::AppConfig;
use crate::playback::backend::PlaybackBackend;
use crate::playback::controller::LifecycleController;
use crate::playback::session::{PlaybackStatsSnapshot, SessionRegistry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub controller: Arc<LifecycleController>,
    /// Name of the playback backend in use ("freeswitch-esl", "dry-run", ...)
    pub backend_name: String,
    pub start_time: Instant,
}

/// HTTP and control-channel counters.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Open `/ws/control` connections
    pub active_connections: u32,
    /// Keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the registry and controller around `backend`.
    pub fn new(config: AppConfig, backend: Arc<dyn PlaybackBackend>) -> Self {
        let backend_name = backend.name().to_string();
        let registry = Arc::new(SessionRegistry::new(backend, &config.playback));
        let controller = Arc::new(LifecycleController::new(registry, &config));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            controller,
            backend_name,
            start_time: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.controller.registry()
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Validate and install a new configuration.
    ///
    /// Playback, admission and fork settings apply to new sessions and requests;
    /// server and ESL settings take effect on restart.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.controller.apply_config(&new_config);
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_connections(&self) {
        self.metrics.write().active_connections += 1;
    }

    /// Saturates at zero.
    pub fn decrement_active_connections(&self) {
        let mut metrics = self.metrics.write();
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// Copy of the counters, so no lock is held while serializing a response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn playback_stats(&self) -> PlaybackStatsSnapshot {
        self.registry().stats().snapshot()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
