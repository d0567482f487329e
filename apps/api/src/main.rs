mod config;
mod db;
mod errors;
mod llm_client;
mod models;
mod pipeline;
mod rate_limit;
mod routes;
mod state;
mod store;
mod telemetry;
mod tools;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::LlmClient;
use crate::pipeline::TailoringPipeline;
use crate::rate_limit::{AdmissionGate, GlobalQuotaTracker, RateLimiter};
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::PgResultStore;
use crate::telemetry::PgTelemetrySink;
use crate::tools::http::HttpToolClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tailor API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;

    // Initialize LLM client
    let llm = LlmClient::new(
        config.anthropic_api_key.clone(),
        config.cerebras_api_key.clone(),
    )?;
    if config.cerebras_api_key.is_none() {
        warn!("CEREBRAS_API_KEY not set; Cerebras models will fail at generation time");
    }
    info!("LLM client initialized");

    // Initialize enrichment tools
    let tools = HttpToolClient::new(config.tools_base_url.clone())?;
    info!("Enrichment tools at {}", config.tools_base_url);

    // Admission: per-caller limiter, then the global upstream quota
    info!(
        "Rate limits: {}/min {}/hour {}/day ({} model overrides)",
        config.rate_limits.defaults.per_minute,
        config.rate_limits.defaults.per_hour,
        config.rate_limits.defaults.per_day,
        config.rate_limits.per_model.len()
    );
    let gate = AdmissionGate::new(
        RateLimiter::new(config.rate_limits.clone()),
        GlobalQuotaTracker::new(config.quota_limits),
        Arc::new(PgTelemetrySink::new(db.clone())),
        config.fingerprint_salt.clone(),
    );

    let pipeline = TailoringPipeline::new(
        Arc::new(llm),
        Arc::new(tools),
        Arc::new(PgResultStore::new(db)),
        config.pipeline_timeout,
    );

    // Build app state
    let state = AppState {
        gate: Arc::new(gate),
        pipeline: Arc::new(pipeline),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
