use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use groupscholar_metrics_snapshots::db::{self, PgStore};
use groupscholar_metrics_snapshots::{
    queue, report, InvalidationHooks, MetricsService, RefreshWorker, WorkerSettings, SNAPSHOT_POLICY,
};

#[derive(Parser)]
#[command(name = "metrics-snapshots")]
#[command(about = "Staleness-aware performance snapshots for Group Scholar cohorts", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,
    #[arg(long, default_value_t = 5)]
    max_connections: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import exam and assignment results from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print one scholar's metrics with freshness metadata
    Scholar {
        #[arg(long)]
        id: Uuid,
        /// Print the classroom view instead of raw metrics
        #[arg(long)]
        classroom: bool,
    },
    /// Print a cohort summary, or write it as markdown
    Cohort {
        #[arg(long)]
        cohort: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Request a background refresh for a scholar
    Refresh {
        #[arg(long)]
        id: Uuid,
    },
    /// Show how many refresh tasks are waiting
    QueueDepth,
    /// Process one batch of due refresh tasks
    Drain {
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Keep draining until the queue is empty
        #[arg(long)]
        all: bool,
    },
    /// Run the refresh worker until interrupted
    Work {
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
        #[arg(long, default_value_t = 5)]
        batch: usize,
        /// Seconds before a claimed task counts as orphaned (at least 60)
        #[arg(long, default_value_t = 600)]
        claim_timeout_secs: i64,
    },
    /// Recompute every snapshot in a cohort right now
    Recompute {
        #[arg(long)]
        cohort: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(&cli.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let service = MetricsService::new(store.clone(), store.clone(), store.clone(), SNAPSHOT_POLICY);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let hooks = InvalidationHooks::new(store.clone(), store.clone());
            let summary = db::import_csv(&pool, &hooks, &csv).await?;
            println!(
                "Inserted {} results from {}; {} refreshes enqueued.",
                summary.inserted,
                csv.display(),
                summary.invalidated
            );
        }
        Commands::Scholar { id, classroom } => {
            if classroom {
                print_json(&service.scholar_classroom_view(id).await?)?;
            } else {
                print_json(&service.scholar_metrics(id).await?)?;
            }
        }
        Commands::Cohort { cohort, out } => {
            let response = service.cohort_metrics(&cohort).await?;
            match out {
                Some(path) => {
                    let markdown = report::render_markdown(&cohort, &response.metrics, &response.meta);
                    std::fs::write(&path, markdown)?;
                    println!("Report written to {}.", path.display());
                }
                None => print_json(&response)?,
            }
        }
        Commands::Refresh { id } => {
            let outcome = service.request_refresh(id).await?;
            println!("Refresh for {id}: {outcome:?}.");
        }
        Commands::QueueDepth => {
            println!("{} refresh tasks pending.", service.queue_depth().await?);
        }
        Commands::Drain { limit, all } => {
            let worker = RefreshWorker::new(
                store.clone(),
                store.clone(),
                store.clone(),
                WorkerSettings {
                    batch_size: limit,
                    ..WorkerSettings::default()
                },
            );
            let drained = if all {
                worker.drain_until_empty().await?
            } else {
                worker.drain(limit).await?
            };
            print_json(&drained)?;
        }
        Commands::Work {
            interval_secs,
            batch,
            claim_timeout_secs,
        } => {
            let worker = RefreshWorker::new(
                store.clone(),
                store.clone(),
                store.clone(),
                WorkerSettings {
                    batch_size: batch,
                    poll_interval: Duration::from_secs(interval_secs.max(1)),
                    claim_timeout: chrono::Duration::seconds(
                        claim_timeout_secs.max(queue::MIN_CLAIM_TIMEOUT_SECONDS),
                    ),
                },
            );
            worker
                .run(async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = ?err, "failed to listen for shutdown signal");
                    }
                })
                .await?;
        }
        Commands::Recompute { cohort } => {
            let snapshots = service.recompute_cohort(&cohort).await?;
            println!("Recomputed {} snapshots for cohort {cohort}.", snapshots.len());
        }
    }

    Ok(())
}
