use clap::Parser;
use r2d2::Pool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod config;
mod db;
mod llm;
mod pipeline;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs};
use crate::db::db_pool::ReadOnlyDuckDbManager;
use crate::db::introspect::SchemaIntrospector;
use crate::llm::LlmClient;
use crate::pipeline::QueryPipeline;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let args = CliArgs::parse();

    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "Opening analytics store read-only: {}",
        config.database.connection_string
    );
    let manager = ReadOnlyDuckDbManager::new(config.database.connection_string.clone());
    let pool = Pool::builder()
        .max_size(config.database.pool_size as u32)
        .build(manager)?;

    let introspector = Arc::new(SchemaIntrospector::for_store(
        pool.clone(),
        config.pipeline.allowed_tables.clone(),
        Duration::from_secs(config.pipeline.schema_ttl_secs),
    ));

    info!("Initializing LLM client with backend: {}", config.llm.backend);
    let llm = Arc::new(LlmClient::new(&config.llm)?);

    let pipeline = QueryPipeline::new(introspector.clone(), llm, pool, &config);

    // Warm the schema cache; the server still starts if the store is briefly
    // unreachable, and the first request will retry.
    if let Err(e) = introspector.get_schema().await {
        error!("Failed to load initial schema snapshot: {}", e);
    }

    let app_state = Arc::new(AppState::new(config.clone(), pipeline, introspector));

    info!(
        "Starting flowlens server on {}:{}",
        config.web.host, config.web.port
    );
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
