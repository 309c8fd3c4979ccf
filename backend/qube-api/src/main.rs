//! Qube API: entry point.
//!
//! Serves the publisher/affiliate REST API over SQLite and settles
//! conversions by withdrawing rewards from the escrow contract.

mod api;
mod config;
mod conversion;
mod db;
mod errors;
mod ledger;
mod models;
mod reward;
mod store;
mod validation;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use conversion::ConversionService;
use ledger::EscrowLedger;
use store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Read and validate configuration once; nothing re-reads the environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url).await?;

    let ledger = EscrowLedger::connect(&config)?;

    let conversions = ConversionService::new(
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(ledger),
        config.fee_recipient,
        config.token_decimals,
    );

    let api_state = Arc::new(api::ApiState { pool, conversions });

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
