//! speedcheck -- resilient network speed testing.
//!
//! Measures download throughput, upload throughput and latency against
//! ordered lists of public endpoints, falling back to the next endpoint when
//! one is blocked or down, and reporting partial results instead of failing.

pub mod api;
pub mod config;
pub mod probes;
pub mod throughput;

use anyhow::{Context, Result};

use crate::config::SpeedCheckConfig;

/// Start the HTTP API on `bind`.
pub async fn serve(bind: &str, config: &SpeedCheckConfig) -> Result<()> {
    let speed_test = throughput::SpeedTest::from_config(config)
        .context("failed to initialise speed test")?;
    let state = api::state::AppState::new(speed_test, config.api.history_size);

    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", bind))?;
    let app = api::router(state);

    tracing::info!(%addr, "speedcheck listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
