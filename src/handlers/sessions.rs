//! Session control over HTTP.
//!
//! Each route builds a [`ControlEvent`] and runs it through the same controller
//! the ESL listener and control WebSocket use.

use crate::{
    error::{AppError, AppResult},
    playback::controller::{ControlEvent, ControlOutcome, PlayRequest},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn outcome_response(outcome: ControlOutcome) -> AppResult<HttpResponse> {
    let body = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "result": outcome,
    });

    match &outcome {
        ControlOutcome::SessionStarted { created: true, .. } => Ok(HttpResponse::Created().json(body)),
        ControlOutcome::Enqueued { .. } => Ok(HttpResponse::Accepted().json(body)),
        ControlOutcome::Rejected { .. } => Ok(HttpResponse::UnprocessableEntity().json(body)),
        ControlOutcome::UnknownSession { session_id } => {
            Err(AppError::NotFound(format!("Session '{}' not found", session_id)))
        }
        _ => Ok(HttpResponse::Ok().json(body)),
    }
}

pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.registry().list_sessions();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let session = state
        .registry()
        .get_session(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;

    Ok(HttpResponse::Ok().json(session.info()))
}

/// POST /api/v1/sessions/{session_id}
pub async fn start_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    if session_id.trim().is_empty() {
        return Err(AppError::BadRequest("session id is required".to_string()));
    }

    let outcome = state
        .controller
        .handle(ControlEvent::SessionStart { session_id })
        .await;
    outcome_response(outcome)
}

/// POST /api/v1/sessions/{session_id}/play
pub async fn play_audio(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<PlayRequest>,
) -> AppResult<HttpResponse> {
    let outcome = state
        .controller
        .handle(ControlEvent::PlayAudio {
            session_id: path.into_inner(),
            request: body.into_inner(),
        })
        .await;
    outcome_response(outcome)
}

/// POST /api/v1/sessions/{session_id}/kill
pub async fn kill_session_audio(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let outcome = state
        .controller
        .handle(ControlEvent::KillAudio {
            session_id: Some(path.into_inner()),
        })
        .await;
    outcome_response(outcome)
}

/// POST /api/v1/kill
pub async fn kill_all_audio(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let outcome = state
        .controller
        .handle(ControlEvent::KillAudio { session_id: None })
        .await;
    outcome_response(outcome)
}

/// DELETE /api/v1/sessions/{session_id}
pub async fn end_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let outcome = state
        .controller
        .handle(ControlEvent::SessionEnd {
            session_id: path.into_inner(),
        })
        .await;
    outcome_response(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::handlers::configure_api;
    use crate::playback::backend::DryRunBackend;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn state() -> AppState {
        let mut config = AppConfig::default();
        config.admission.enabled = false;
        config.playback.min_wait_secs = 0.01;
        config.playback.max_wait_secs = 0.01;
        AppState::new(config, Arc::new(DryRunBackend))
    }

    #[actix_web::test]
    async fn test_session_routes() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(web::scope("/api/v1").configure(configure_api)),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/v1/sessions/call-1").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::post().uri("/api/v1/sessions/call-1").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri("/api/v1/sessions/call-1/play")
            .set_json(json!({"file": "/tmp/a.r16", "audioContentType": "raw", "sampleRate": 16000}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::ACCEPTED);

        let req = test::TestRequest::post()
            .uri("/api/v1/sessions/call-1/play")
            .set_json(json!({"audioContentType": "raw"}))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let req = test::TestRequest::get().uri("/api/v1/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["session_id"], "call-1");

        let req = test::TestRequest::delete().uri("/api/v1/sessions/call-1").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/api/v1/sessions/call-1").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_play_for_unknown_session_is_404() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .service(web::scope("/api/v1").configure(configure_api)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/sessions/ghost/play")
            .set_json(json!({"file": "/tmp/a.wav"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post().uri("/api/v1/kill").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }
}
