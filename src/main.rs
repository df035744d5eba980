use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};

use timeout_migrator::config;
use timeout_migrator::db;
use timeout_migrator::model::{EndpointFilter, RunParameters};
use timeout_migrator::runner::{format_elapsed, MigrationOutcome, MigrationRunner};
use timeout_migrator::storage::SqliteTimeoutStorage;
use timeout_migrator::target::SqliteTarget;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Move pending timeouts from a legacy timeout store to native delayed delivery"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the endpoints that would be migrated and whether the target accepts them
    Preview {
        /// Only timeouts due at or before this time (RFC 3339) are migrated
        #[arg(long)]
        cutoff_time: DateTime<Utc>,
    },
    /// Migrate timeouts, resuming an interrupted migration first
    Migrate {
        /// Only timeouts due at or before this time (RFC 3339) are migrated
        #[arg(long)]
        cutoff_time: DateTime<Utc>,

        /// Endpoint to migrate; repeat for several
        #[arg(long = "endpoint", required_unless_present = "all_endpoints")]
        endpoints: Vec<String>,

        /// Migrate every endpoint found in the source store
        #[arg(long, conflicts_with = "endpoints")]
        all_endpoints: bool,
    },
    /// Abandon the ongoing migration and hand its timeouts back to the legacy store
    Abort,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let source_url = cfg.source_url();
    let target_url = cfg.target_url();

    let source_pool = db::init_pool(&source_url, false).await?;
    db::run_migrations(&source_pool).await?;
    let target_pool = db::init_pool(&target_url, true).await?;

    let storage = SqliteTimeoutStorage::with_page_size(source_pool, cfg.source.page_size);
    let mut target = SqliteTarget::new(target_pool);
    if let Some(max_delay) = cfg.max_delay() {
        target = target.with_max_delay(max_delay);
    }
    let runner = MigrationRunner::new(storage, target);

    let result = match args.command {
        Command::Preview { cutoff_time } => preview(&runner, cutoff_time).await,
        Command::Migrate {
            cutoff_time,
            endpoints,
            all_endpoints,
        } => {
            let filter = if all_endpoints {
                EndpointFilter::All
            } else {
                EndpointFilter::Only(endpoints)
            };
            let run_parameters = RunParameters::new()
                .with(RunParameters::CUTOFF_TIME, cutoff_time.to_rfc3339())
                .with(RunParameters::SOURCE, source_url.as_str())
                .with(RunParameters::TARGET, target_url.as_str());
            migrate(&runner, cutoff_time, &filter, &run_parameters).await
        }
        Command::Abort => abort(&runner).await,
    };

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
    Ok(())
}

async fn preview(
    runner: &MigrationRunner<SqliteTimeoutStorage, SqliteTarget>,
    cutoff: DateTime<Utc>,
) -> Result<()> {
    let preview = runner.preview(cutoff).await?;
    if let Some(ongoing) = &preview.ongoing {
        warn!(
            endpoint = %ongoing.endpoint_name,
            batches = ongoing.batches.len(),
            timeouts = ongoing.number_of_timeouts(),
            "a migration is in progress; migrate resumes it, abort discards it"
        );
    }
    if preview.endpoints.is_empty() {
        info!("no endpoints found in storage with timeouts that need migration");
    }
    for (endpoint, check) in &preview.endpoints {
        let destinations: Vec<&str> = endpoint.destinations.iter().map(String::as_str).collect();
        info!(
            endpoint = %endpoint.endpoint_name,
            timeouts = endpoint.nr_of_timeouts,
            shortest = %endpoint.shortest_timeout,
            longest = %endpoint.longest_timeout,
            destinations = %destinations.join(","),
            can_migrate = check.can_migrate(),
            "endpoint"
        );
        for problem in &check.problems {
            warn!(endpoint = %endpoint.endpoint_name, "{}", problem);
        }
    }
    Ok(())
}

async fn migrate(
    runner: &MigrationRunner<SqliteTimeoutStorage, SqliteTarget>,
    cutoff: DateTime<Utc>,
    filter: &EndpointFilter,
    run_parameters: &RunParameters,
) -> Result<()> {
    match runner.run(cutoff, filter, run_parameters).await? {
        MigrationOutcome::Completed { endpoints, elapsed } => {
            info!(
                endpoints = %endpoints.join(","),
                elapsed = %format_elapsed(elapsed),
                "migration finished"
            );
        }
        MigrationOutcome::NothingToMigrate { filtered_out } if filtered_out.is_empty() => {
            info!("nothing to migrate");
        }
        MigrationOutcome::NothingToMigrate { filtered_out } => {
            info!(endpoints = %filtered_out.join(","), "nothing to migrate; these endpoints were filtered out");
        }
    }
    Ok(())
}

async fn abort(runner: &MigrationRunner<SqliteTimeoutStorage, SqliteTarget>) -> Result<()> {
    if runner.abort().await? {
        info!("migration aborted");
    }
    Ok(())
}
