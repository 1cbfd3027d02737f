use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mirror_core::Package;
use mirror_storage::{DestinationStore, PgDestinationStore, PgSourceStore, SourceStore};
use mirror_sync::config::schedule_file_from_lookup;
use mirror_sync::{build_scheduler, load_schedule, Job, JobOutcome, JobRunner, JobSettings, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod dev;

#[derive(Debug, Parser)]
#[command(name = "mirror-cli")]
#[command(about = "Incremental mirror of engagement data into the analytics database")]
struct Cli {
    /// Use seeded in-memory stores instead of the configured databases.
    #[arg(long, global = true)]
    dev: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one job: ETL, a package name, COMMENT_REDACT, PURGE,
    /// ENGAGEMENT_CLOSEOUT or ENGAGEMENT_PUBLISH.
    Run { job: String },
    /// List recent run cycles, newest first.
    Cycles {
        #[arg(long)]
        package: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run jobs from the schedule file until interrupted.
    Schedule,
}

struct Stores {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    settings: JobSettings,
    schedule_file: PathBuf,
}

async fn open_stores(dev: bool) -> Result<Stores> {
    if dev {
        let settings = JobSettings::from_lookup(&|key: &str| std::env::var(key).ok())
            .context("loading job settings")?;
        let (source, destination) = dev::seeded_stores().await;
        return Ok(Stores {
            source: Arc::new(source),
            destination: Arc::new(destination),
            settings,
            schedule_file: schedule_file_from_lookup(&|key: &str| std::env::var(key).ok()),
        });
    }

    let config = SyncConfig::from_env().context("loading configuration")?;
    let source = PgSourceStore::connect(&config.database.source_url, &config.database.pool)
        .await
        .context("connecting to source database")?;
    let destination =
        PgDestinationStore::connect(&config.database.analytics_url, &config.database.pool)
            .await
            .context("connecting to analytics database")?;
    Ok(Stores {
        source: Arc::new(source),
        destination: Arc::new(destination),
        settings: config.jobs,
        schedule_file: config.schedule_file,
    })
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn print_outcome(outcome: &JobOutcome) -> Result<()> {
    match outcome {
        JobOutcome::Pipeline(report) => {
            for stage in &report.stages {
                let run_id = stage
                    .run_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                if stage.succeeded() {
                    println!(
                        "{:<20} ok      run_id={run_id} {}",
                        stage.package.as_str(),
                        stage.counts.describe()
                    );
                } else {
                    println!(
                        "{:<20} FAILED  run_id={run_id} {}",
                        stage.package.as_str(),
                        serde_json::to_string(&stage.status)?
                    );
                }
            }
        }
        JobOutcome::Sweep(report) => println!(
            "{} complete: scanned={} mutated={}",
            report.sweep, report.scanned, report.mutated
        ),
    }
    Ok(())
}

fn parse_package(value: &str) -> Result<Package> {
    Ok(value.trim().to_ascii_lowercase().parse::<Package>()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        job: "ETL".to_string(),
    });

    match command {
        Commands::Run { job } => {
            let job: Job = job.parse()?;
            let stores = open_stores(cli.dev).await?;
            let runner = JobRunner::new(stores.source, stores.destination, stores.settings);
            let outcome = runner.run(job).await?;
            print_outcome(&outcome)?;
            if let JobOutcome::Pipeline(report) = &outcome {
                if !report.is_success() {
                    bail!("{job} finished with failed stages: {:?}", report.failed_packages());
                }
            }
        }
        Commands::Cycles { package, limit } => {
            let package = package
                .map(|p| parse_package(&p))
                .transpose()
                .context("parsing --package")?;
            let stores = open_stores(cli.dev).await?;
            let runner = JobRunner::new(stores.source, stores.destination, stores.settings);
            let cycles = runner
                .orchestrator()
                .ledger()
                .recent_cycles(package, limit)
                .await
                .context("reading run cycles")?;
            let unfinished = cycles.iter().filter(|c| !c.success).count();
            for cycle in cycles {
                println!(
                    "{:>6} {:<20} {} {:<24} {}",
                    cycle.id,
                    cycle.package_name,
                    if cycle.success { "ok    " } else { "failed" },
                    cycle
                        .end_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into()),
                    cycle.description
                );
            }
            if unfinished > 0 {
                println!("{unfinished} cycle(s) never completed");
            }
        }
        Commands::Schedule => {
            let stores = open_stores(cli.dev).await?;
            let schedule = load_schedule(&stores.schedule_file).await?;
            let runner = Arc::new(JobRunner::new(
                stores.source,
                stores.destination,
                stores.settings,
            ));
            let mut scheduler = build_scheduler(runner, &schedule).await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(jobs = schedule.jobs.len(), "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_filter_ignores_case() {
        assert_eq!(parse_package("Engagement").unwrap(), Package::Engagement);
        assert_eq!(parse_package("REPORT_SETTING").unwrap(), Package::ReportSetting);
        assert!(parse_package("nope").is_err());
    }
}
