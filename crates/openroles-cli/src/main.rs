use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use openroles_storage::PgGateway;
use openroles_sync::{build_scheduler, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "openroles-cli")]
#[command(about = "Job listing sync and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print the run summary.
    Sync {
        /// Limit the run to these source ids. Repeatable.
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Apply the Postgres migrations.
    Migrate,
    /// Serve the HTTP trigger, with the cron scheduler when enabled.
    Serve,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,openroles=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { sources: Vec::new() }) {
        Commands::Sync { sources } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = if sources.is_empty() {
                pipeline.run_once().await
            } else {
                pipeline.run_sources(&sources).await
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed > 0 {
                anyhow::bail!("{} of {} sources failed", summary.failed, summary.results.len());
            }
        }
        Commands::Migrate => {
            let gateway = PgGateway::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            gateway.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let port = config.port;
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let scheduler = build_scheduler(Arc::clone(&pipeline)).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
            }
            openroles_web::serve(pipeline, port).await?;
            if let Some(mut scheduler) = scheduler {
                if let Err(err) = scheduler.shutdown().await {
                    warn!(error = %err, "scheduler shutdown failed");
                }
            }
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut scheduler) = build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!("scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
