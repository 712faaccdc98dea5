//! Main Entrypoint for the Callbridge Relay Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Loading the session instructions text.
//! 4. Constructing the Axum router.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use callbridge_relay::{config::Config, router::create_router, state::AppState};
use std::{fs, sync::Arc};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    let instructions = fs::read_to_string(&config.instructions_path).with_context(|| {
        format!(
            "Failed to read instructions from {}",
            config.instructions_path.display()
        )
    })?;

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        instructions: Arc::new(instructions),
    });
    let app = create_router(app_state);

    info!(
        bind_address = %config.bind_address,
        model = %config.realtime_model,
        voice = %config.voice,
        "Relay configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server has shut down.");
    Ok(())
}
