//! Callbridge server binary.
//!
//! Starts the axum HTTP server with structured logging, the intake
//! rate-limit sweeper, and graceful shutdown on SIGTERM/SIGINT.

use callbridge_server::{app, config, shutdown, AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("CALLBRIDGE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    let fault = shutdown::install_panic_hook();

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );
    tracing::debug!(voice = ?config.voice, policy = ?config.policy, "effective configuration");

    let state = AppState::from_config(&config)
        .expect("failed to initialise the voice provider client");
    state
        .rate_limiter
        .start_sweeper(Duration::from_millis(config.policy.sweep_interval_ms));

    let addr = SocketAddr::new(config.server.host, config.server.port);
    tracing::info!(%addr, mode = ?config.voice.mode, "starting callbridge server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown::shutdown_signal(fault))
    .await
    .expect("server error");

    shutdown::shutdown(&state, config.shutdown.grace()).await;
    tracing::info!("callbridge server shut down");
}
