use crate::{
    config::{AppConfig, REDACTED_PASSWORD},
    error::AppError,
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Configuration as JSON with the ESL password masked.
fn redacted(config: &AppConfig) -> Result<serde_json::Value, AppError> {
    let mut value = serde_json::to_value(config)?;
    if let Some(esl) = value.get_mut("esl").and_then(|esl| esl.as_object_mut()) {
        esl.insert("password".to_string(), json!(REDACTED_PASSWORD));
    }
    Ok(value)
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "backend": state.backend_name,
        "config": redacted(&config)?
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(updated.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; playback and fork settings apply to new sessions",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&updated)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::configure_api;
    use crate::playback::backend::testing::{Call, RecordingBackend};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn state() -> (AppState, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let mut config = AppConfig::default();
        config.esl.password = "s3cret".to_string();
        (AppState::new(config, backend.clone()), backend)
    }

    #[actix_web::test]
    async fn test_fork_update_reaches_next_session() {
        let (state, backend) = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(web::scope("/api/v1").configure(configure_api)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"fork": {"enabled": true, "ws_url": "ws://media:9000/stream", "sample_rate": 8000}}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post().uri("/api/v1/sessions/call-1").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        assert_eq!(
            *backend.calls.lock(),
            vec![Call::ForkStart {
                session_id: "call-1".to_string(),
                ws_url: "ws://media:9000/stream".to_string(),
                sample_rate: 8000,
            }]
        );
    }

    #[actix_web::test]
    async fn test_config_round_trip_keeps_password() {
        let (state, _) = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(web::scope("/api/v1").configure(configure_api)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["esl"]["password"], REDACTED_PASSWORD);

        // Send back what GET returned, with one edit
        let mut config = body["config"].clone();
        config["esl"]["host"] = json!("10.0.0.5");
        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(config)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let current = state.get_config();
        assert_eq!(current.esl.host, "10.0.0.5");
        assert_eq!(current.esl.password, "s3cret");
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let (state, _) = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(web::scope("/api/v1").configure(configure_api)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"fork": {"enabled": true, "ws_url": ""}}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
        assert!(!state.get_config().fork.enabled);
    }
}
