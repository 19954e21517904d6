use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use procura_provider::SearchFilter;
use procura_storage::PgOpportunityStore;
use procura_sync::{maybe_build_scheduler, IngestConfig, IngestServices};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "procura")]
#[command(about = "Procurement opportunity ingestion and analysis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring the given opportunities up to date, fetching only stale or missing ones.
    Refresh {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Run an analysis batch over every identifier that ended up available.
        #[arg(long)]
        analyze: bool,
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Pull every opportunity posted in a date range.
    Backfill {
        /// First posted date (YYYY-MM-DD). Defaults to PROCURA_BACKFILL_DAYS ago.
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last posted date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        keywords: Option<String>,
        #[arg(long)]
        ncode: Option<String>,
    },
    /// Analyse stored opportunities in one bounded batch.
    Analyze {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Stop starting new work after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the cron-driven backfill until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "procura=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgOpportunityStore::connect(url, 2)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Refresh {
            ids,
            analyze,
            max_concurrent,
        } => {
            let services = IngestServices::from_config(config).await?;
            let pipeline = services.pipeline()?;
            let max_concurrent = max_concurrent.unwrap_or(services.config.max_concurrent);
            if analyze {
                let summary = pipeline
                    .refresh_and_analyze(&ids, services.orchestrator()?, max_concurrent)
                    .await?;
                print_json(&summary)?;
            } else {
                let summary = pipeline.refresh(&ids).await?;
                print_json(&summary)?;
            }
            services.shutdown();
        }
        Commands::Backfill {
            from,
            to,
            keywords,
            ncode,
        } => {
            let services = IngestServices::from_config(config).await?;
            let to = to.unwrap_or_else(|| Utc::now().date_naive());
            let from =
                from.unwrap_or_else(|| to - ChronoDuration::days(services.config.backfill_days.max(1)));
            let filter = SearchFilter {
                keywords,
                classification_code: ncode.or_else(|| services.config.classification_code.clone()),
            };
            let summary = services.pipeline()?.ingest_range(from, to, &filter).await?;
            print_json(&summary)?;
            services.shutdown();
        }
        Commands::Analyze {
            ids,
            max_concurrent,
            deadline_secs,
        } => {
            let services = IngestServices::from_config(config).await?;
            let orchestrator = services.orchestrator()?;
            let max_concurrent = max_concurrent.unwrap_or(services.config.max_concurrent);
            let summary = match deadline_secs {
                Some(secs) => {
                    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
                    orchestrator
                        .run_batch_with_deadline(&ids, max_concurrent, deadline)
                        .await
                }
                None => orchestrator.run_batch(&ids, max_concurrent).await,
            };
            print_json(&summary)?;
            services.shutdown();
        }
        Commands::Schedule => {
            let services = IngestServices::from_config(config).await?;
            let Some(mut sched) =
                maybe_build_scheduler(&services.config, services.pipeline()?.clone()).await?
            else {
                anyhow::bail!("scheduler disabled; set PROCURA_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %services.config.backfill_cron, "scheduler running");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            services.shutdown();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
