use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reu_store::{PgStore, ProgramStore};
use reu_sync::{SyncConfig, SyncPipeline};
use reu_web::AppState;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reu-cli")]
#[command(about = "REU Cafe ingestion and serving commands")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over all configured sources.
    Sync,
    /// Serve the read-path REST API.
    Serve,
    /// Apply store migrations.
    Migrate,
    /// Administrative: delete every stored program.
    ClearPrograms,
    /// Administrative: empty the `field` tag list on every stored program.
    ClearFields,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to program store")?;
            let pipeline = SyncPipeline::new(config, Arc::new(store))?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} sources={}/{} extracted={} inserted={} updated={} failed={} dropped={}",
                summary.run_id,
                summary.sources_total - summary.sources_failed,
                summary.sources_total,
                summary.extracted,
                summary.inserted,
                summary.updated,
                summary.failed,
                summary.dropped,
            );
        }
        Commands::Serve => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to program store")?;
            let state = AppState::new(Arc::new(store));
            println!("serving on port {}", config.web_port);
            reu_web::serve(state, config.web_port).await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to program store")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::ClearPrograms => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to program store")?;
            let deleted = store.clear_all().await?;
            println!("deleted {deleted} program(s)");
        }
        Commands::ClearFields => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to program store")?;
            let touched = store.clear_field_attribute().await?;
            println!("cleared field tags on {touched} program(s)");
        }
    }

    Ok(())
}
