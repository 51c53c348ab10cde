//! # Realtime Audio Relay - Main Application Entry Point
//!
//! Relays a client's live microphone audio to a realtime conversational-audio
//! service and streams the synthesized answer back over the same WebSocket.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment)
//! - **state**: Shared state and conversation counters
//! - **health**: Health endpoint
//! - **websocket**: Client WebSocket endpoint, one conversation per connection
//! - **socket**: Transport-neutral view of a client connection
//! - **audio**: Ring buffer and socket-fed audio source
//! - **conversation**: Session traits, realtime client and the update dispatcher
//! - **error**: HTTP error responses

mod audio;
mod config;
mod conversation;
mod error;
mod health;
mod socket;
mod state;
mod websocket;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use state::AppState;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared application state**
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate()?;

    info!("Starting realtime-audio-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        endpoint = %config.conversation.endpoint,
        sample_rate = config.audio.sample_rate,
        window_seconds = config.audio.window_seconds,
        max_sessions = config.performance.max_concurrent_sessions,
        "Configuration loaded"
    );
    if config.conversation.api_key.is_none() {
        info!("No realtime API key configured (set REALTIME_API_KEY)");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = web::Data::new(AppState::new(config));

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1").route("/health", web::get().to(health::health_check)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/conversation", web::get().to(websocket::conversation_websocket))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {bind_addr}"))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "realtime_audio_relay=trace")
/// - If not set, defaults to "realtime_audio_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_audio_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Resolve on the first SIGTERM or SIGINT (Ctrl+C).
#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Received Ctrl+C");
    Ok(())
}
