use std::sync::Arc;

use db::DBService;
use pipeline::{AgentContext, Dispatcher, PipelineConfig};
use providers::HttpGenerationProvider;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::assets::asset_dir;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from `.env` if present so local development picks up API keys
    dotenv::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,pipeline={level},db={level},providers={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    if !asset_dir().exists() {
        std::fs::create_dir_all(asset_dir())?;
    }

    let db = DBService::new().await?;
    let config = Arc::new(PipelineConfig::default());
    let provider = Arc::new(HttpGenerationProvider::from_env());

    tracing::info!(
        "Starting pipeline workers (count={}, db={})",
        config.worker_count,
        asset_dir().join("backlot.sqlite").display()
    );

    let ctx = AgentContext::new(db.pool.clone(), provider, config);
    let workers = Dispatcher::new(ctx).start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, aborting workers");
    for worker in workers {
        worker.abort();
    }

    Ok(())
}
