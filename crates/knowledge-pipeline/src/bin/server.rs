//! Pipeline server binary
//!
//! Run with: cargo run -p knowledge-pipeline --bin knowledge-pipeline-server -- --config pipeline.toml

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use knowledge_pipeline::{config::PipelineConfig, server::PipelineServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "knowledge-pipeline-server", version, about = "Document ingestion pipeline server")]
struct Args {
    /// TOML config file; falls back to $KNOWLEDGE_PIPELINE_CONFIG, then defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "knowledge_pipeline=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::load()?,
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    tracing::info!("Configuration loaded");
    tracing::info!("  - Database: {}", config.storage.database_path.display());
    tracing::info!("  - Embeddings: {:?} ({} dims)", config.embeddings.provider, config.embeddings.dimensions);
    tracing::info!(
        "  - Default slice range: [{}, {}]",
        config.slicing.length_range.0,
        config.slicing.length_range.1
    );
    match &config.managed {
        Some(managed) => tracing::info!("  - Managed service: {}", managed.base_url),
        None => tracing::info!("  - Managed service: disabled"),
    }

    let server = PipelineServer::new(config.clone()).await?;
    let state = server.state().clone();

    for source in state.orchestrator().backends().sources() {
        let backend = state.orchestrator().backends().get(source)?;
        match backend.health_check().await {
            Ok(true) => tracing::info!("Backend {} is healthy", backend.name()),
            Ok(false) => tracing::warn!("Backend {} reported unhealthy", backend.name()),
            Err(e) => tracing::warn!("Backend {} is unreachable: {}", backend.name(), e),
        }
    }

    let sweeper = state.sweeper();
    if config.recovery.run_on_startup {
        let report = sweeper.sweep_startup().await?;
        tracing::info!(
            "Startup recovery: {} re-driven, {} closed, {} superseded",
            report.redriven.len(),
            report.closed.len(),
            report.superseded.len()
        );
    }
    if let Some(secs) = config.recovery.interval_secs {
        tracing::info!("Periodic recovery every {}s", secs);
        sweeper.spawn_periodic(Duration::from_secs(secs.max(1)));
    }
    state.set_ready(true);

    tracing::info!("Health: http://{}/health", server.address());
    server.start().await?;

    Ok(())
}
