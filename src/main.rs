//! gpu-fleet-operator Entry Point
//!
//! Parses configuration, builds the shared `AppState`, spawns the
//! Reconciler as a background task, and runs the REST API server in the
//! foreground.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gpu_fleet_operator::auth::JwksCache;
use gpu_fleet_operator::config::{AppState, Config};
use gpu_fleet_operator::provider;
use gpu_fleet_operator::store::memory::MemoryStore;
use gpu_fleet_operator::store::StateStore;
use gpu_fleet_operator::{reconciler, rest_api};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    let config = Config::parse();
    info!(
        "starting gpu-fleet-operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = StateStore::new(MemoryStore::new());
    let provider = provider::shared_http_client(config.provider_base_url.clone(), store.clone());
    let jwks = JwksCache::new(config.jwks_url.clone());

    let state = AppState {
        config: Arc::new(config),
        store,
        provider,
        jwks,
        #[cfg(feature = "metrics")]
        metrics: gpu_fleet_operator::metrics::Metrics::new(),
    };

    let reconciler_state = state.clone();
    tokio::spawn(async move {
        reconciler::run(reconciler_state).await;
    });

    rest_api::run_server(state).await?;
    Ok(())
}
