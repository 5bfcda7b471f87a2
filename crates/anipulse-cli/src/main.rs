use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anipulse_etl::EtlConfig;

#[derive(Debug, Parser)]
#[command(name = "anipulse")]
#[command(about = "Anime ranking snapshot pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extract-transform-load pass.
    Run {
        /// Override the configured number of records to collect.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Serve the read-only query API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = EtlConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { limit: None }) {
        Commands::Run { limit } => {
            if let Some(limit) = limit {
                config.fetch_limit = limit;
            }

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping at the next suspension point");
                    ctrl_c_cancel.cancel();
                }
            });

            let report = anipulse_etl::run_once(&config, cancel).await?;
            println!(
                "run {}: {} extracted={} upserted={} inserted={} dropped={} elapsed={:.2}s",
                report.run_id,
                report.outcome,
                report.records_extracted,
                report.animes_upserted,
                report.snapshots_inserted,
                report.snapshots_dropped,
                report.elapsed().as_secs_f64(),
            );
            Ok(if report.outcome.is_failure() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Migrate => {
            let pool = PgPool::connect(&config.database_url)
                .await
                .context("connecting to the store")?;
            anipulse_etl::MIGRATOR
                .run(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve => {
            let pool = PgPool::connect(&config.database_url)
                .await
                .context("connecting to the store")?;
            anipulse_web::serve(pool, config.web_port).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
