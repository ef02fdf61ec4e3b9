use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ldq_engine::{
    load_routing_or_default, maybe_build_scheduler, CurationConfig, CurationPipeline,
    DuplicateDetector, EngineConfig, ReassignmentConfig, ReassignmentPipeline,
};
use ldq_oracle::{ClassifierOracle, OpenAiConfig, OpenAiOracle};
use ldq_store::{LeadStore, PgLeadStore};
use ldq_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "ldq-cli")]
#[command(about = "Lead data-quality engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the database schema migrations
    Migrate,
    /// Run the company-field curation batch once
    Curate,
    /// Run the category reassignment batch once
    Reassign,
    /// Serve the duplicate-check API, plus the scheduler when enabled
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            let pool = ldq_store::connect(&config.database_url).await?;
            ldq_store::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Curate => {
            let store = store_from(&config).await?;
            let oracle = oracle_from(&config)?;
            let (_, placeholders) = load_routing_or_default(&config.routing_path)?;
            let pipeline = CurationPipeline::new(
                store,
                oracle,
                CurationConfig {
                    generation_owner_id: config.generation_owner_id,
                    placeholders,
                    oracle_timeout: config.oracle_timeout,
                },
            );
            let summary = pipeline.run(&shutdown_token()).await?;
            println!(
                "curation complete: run_id={} processed={} deleted={} kept={}",
                summary.run_id, summary.processed, summary.deleted, summary.kept
            );
        }
        Commands::Reassign => {
            let store = store_from(&config).await?;
            let oracle = oracle_from(&config)?;
            let (routing, _) = load_routing_or_default(&config.routing_path)?;
            let pipeline = ReassignmentPipeline::new(
                store,
                oracle,
                ReassignmentConfig {
                    unrouted_owner_id: config.unrouted_owner_id,
                    routing,
                    oracle_timeout: config.oracle_timeout,
                },
            );
            let summary = pipeline.run(&shutdown_token()).await?;
            println!(
                "reassignment complete: run_id={} processed={} reassigned={} skipped={}",
                summary.run_id, summary.processed, summary.reassigned, summary.skipped
            );
        }
        Commands::Serve => {
            let store = store_from(&config).await?;
            let oracle = oracle_from(&config)?;
            let (routing, placeholders) = load_routing_or_default(&config.routing_path)?;

            let curation = Arc::new(CurationPipeline::new(
                Arc::clone(&store),
                Arc::clone(&oracle),
                CurationConfig {
                    generation_owner_id: config.generation_owner_id,
                    placeholders,
                    oracle_timeout: config.oracle_timeout,
                },
            ));
            let reassignment = Arc::new(ReassignmentPipeline::new(
                Arc::clone(&store),
                Arc::clone(&oracle),
                ReassignmentConfig {
                    unrouted_owner_id: config.unrouted_owner_id,
                    routing,
                    oracle_timeout: config.oracle_timeout,
                },
            ));
            if let Some(sched) = maybe_build_scheduler(&config, curation, reassignment).await? {
                sched.start().await.context("starting scheduler")?;
            }

            let detector = DuplicateDetector::new(store, oracle, config.oracle_timeout);
            ldq_web::serve(config.web_port, AppState::new(detector)).await?;
        }
    }

    Ok(())
}

async fn store_from(config: &EngineConfig) -> Result<Arc<dyn LeadStore>> {
    let pool = ldq_store::connect(&config.database_url)
        .await
        .context("connecting to the lead store")?;
    Ok(Arc::new(PgLeadStore::new(pool)))
}

fn oracle_from(config: &EngineConfig) -> Result<Arc<dyn ClassifierOracle>> {
    if config.oracle_api_key.is_none() {
        warn!("no oracle api key configured; classification calls may be rejected");
    }
    let oracle = OpenAiOracle::new(OpenAiConfig {
        base_url: config.oracle_base_url.clone(),
        api_key: config.oracle_api_key.clone(),
        model: config.oracle_model.clone(),
    })?;
    Ok(Arc::new(oracle))
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested, stopping at the next record boundary");
            handle.cancel();
        }
    });
    cancel
}
