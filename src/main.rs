// =============================================================================
// Canopy — Main Entry Point
// =============================================================================
//
// The engine starts Paused for safety: an operator must explicitly flip the
// scheduler to Running via the operator API once they're satisfied with the
// loaded configuration.
// =============================================================================

mod adapter;
mod allocator;
mod api;
mod app_state;
mod clock;
mod config;
mod error;
mod events;
mod journal;
mod portfolio;
mod registry;
mod risk;
mod scheduler;
mod types;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::types::EngineMode;

const CONFIG_PATH: &str = "canopy_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("canopy starting up");

    let config = match config::RuntimeConfig::load(CONFIG_PATH) {
        Ok(cfg) => cfg,
        Err(e) => {
            if std::path::Path::new(CONFIG_PATH).exists() {
                error!(error = %e, "failed to load existing runtime config");
                std::process::exit(2);
            }
            warn!(error = %e, "no runtime config found, starting from defaults");
            config::RuntimeConfig::default()
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "runtime config failed validation");
        std::process::exit(2);
    }

    let state = AppState::new_demo(config);

    let bind_addr = std::env::var("CANOPY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7331".into());
    let api_state = state.clone();
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr_clone).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, addr = %bind_addr_clone, "failed to bind operator API");
                return;
            }
        };
        info!(addr = %bind_addr_clone, "operator API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "operator API server failed");
        }
    });

    let engine = state.scheduler.clone();
    engine.set_mode(EngineMode::Paused);
    let run_handle = tokio::spawn(engine.clone().run());

    info!("canopy running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    engine.shutdown().await;
    run_handle.abort();

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("canopy shut down complete");
    Ok(())
}
