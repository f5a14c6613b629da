//! # SpeechFlow Backend - Main Application Entry Point
//!
//! Actix-web server for real-time speech transcription over WebSocket.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **state**: Shared application state and service metrics
//! - **streaming**: The live-transcription core (engine, coordinator, protocol)
//! - **usage**: Tier quotas and per-user usage accounting
//! - **transcripts**: The persisted transcript record and its store seam
//! - **providers**: External collaborator seams (recognition, translation, identity)
//! - **websocket**: The per-connection socket actor at `/ws/live`
//! - **health / handlers / middleware**: HTTP surface around the core

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod providers;
mod state;
mod streaming;
mod transcripts;
mod usage;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use providers::identity::StaticIdentityProvider;
use providers::recognizer::SilentRecognizer;
use providers::translator::NoopTranslator;
use state::{AppMetrics, AppState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use streaming::{CoordinatorConfig, SessionCoordinator, StreamingEngine};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcripts::InMemoryTranscriptStore;
use usage::ledger::UsageLedger;
use usage::store::InMemoryUsageStore;

/// Global shutdown signal, set by the signal handler task and polled by
/// the main task to stop the server gracefully.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speechflow-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );

    // Default wiring: in-memory stores and inert providers. Deployments
    // swap in vendor adapters here.
    let metrics = Arc::new(RwLock::new(AppMetrics::default()));
    let coordinator = Arc::new(SessionCoordinator::new(
        Arc::new(StreamingEngine::new(Arc::new(SilentRecognizer))),
        Arc::new(UsageLedger::new(Arc::new(InMemoryUsageStore::new()))),
        Arc::new(NoopTranslator),
        Arc::new(InMemoryTranscriptStore::new()),
        Arc::new(StaticIdentityProvider::new()),
        metrics.clone(),
        CoordinatorConfig::from_app(&config),
    ));
    let app_state = AppState::new(config.clone(), coordinator, metrics);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::RequestLogging)
            .route("/ws/live", web::get().to(websocket::live_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            // Health check at root level for load balancers
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speechflow_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
