//! # Call Audio Relay - Main Application Entry Point
//!
//! Plays audio clips into live FreeSWITCH calls, one ordered queue per call.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (`config.toml` + `APP_` environment variables)
//! - **playback**: per-call queues, workers, admission filter and the lifecycle controller
//! - **esl**: FreeSWITCH event socket client, playback backend and event listener
//! - **state**: shared application state and request metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and metrics collection
//! - **handlers**: HTTP control and configuration API
//! - **websocket**: control WebSocket carrying the same events as ESL
//! - **error**: error types and HTTP error responses
//!
//! ## Startup:
//! 1. Load `.env`, set up tracing, load and validate configuration
//! 2. Pick the playback backend: ESL when `esl.enabled`, otherwise dry-run
//! 3. Start the ESL event listener (ESL only) and the HTTP server
//! 4. On SIGINT/SIGTERM stop the server, then tear down every playback session

mod config;
mod error;
mod esl;
mod handlers;
mod health;
mod middleware;
mod playback;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use playback::backend::{DryRunBackend, PlaybackBackend};
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-audio-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let backend: Arc<dyn PlaybackBackend> = if config.esl.enabled {
        info!(
            host = %config.esl.host,
            port = config.esl.port,
            "Using FreeSWITCH ESL playback backend"
        );
        Arc::new(esl::EslBackend::new(config.esl.clone()))
    } else {
        warn!("ESL disabled, playback requests will only be logged");
        Arc::new(DryRunBackend)
    };

    let app_state = AppState::new(config.clone(), backend);

    let listener = if config.esl.enabled {
        Some(tokio::spawn(esl::run_event_listener(
            config.esl.clone(),
            app_state.controller.clone(),
        )))
    } else {
        None
    };

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware runs in reverse order of registration
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(web::scope("/api/v1").configure(handlers::configure_api))
            .route("/health", web::get().to(health::health_check))
            .route("/ws/control", web::get().to(websocket::control_websocket))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    if let Some(listener) = listener {
        listener.abort();
    }

    let removed = app_state.registry().shutdown().await;
    info!(sessions = removed, "Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `call_audio_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_audio_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on the first SIGTERM or SIGINT (Ctrl+C elsewhere).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C");
}
