pub mod config;
pub mod sessions;

pub use config::*;
pub use sessions::*;

use crate::health;
use actix_web::web;

/// Routes mounted under `/api/v1`.
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics))
        .route("/config", web::get().to(get_config))
        .route("/config", web::put().to(update_config))
        .route("/kill", web::post().to(kill_all_audio))
        .route("/sessions", web::get().to(list_sessions))
        .route("/sessions/{session_id}", web::get().to(get_session))
        .route("/sessions/{session_id}", web::post().to(start_session))
        .route("/sessions/{session_id}", web::delete().to(end_session))
        .route("/sessions/{session_id}/play", web::post().to(play_audio))
        .route("/sessions/{session_id}/kill", web::post().to(kill_session_audio));
}
