//! Cron-driven job scheduling from the schedule file.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, warn};

use crate::config::ScheduleFile;
use crate::jobs::{Job, JobRunner};

/// Builds a scheduler with one entry per enabled schedule line.
///
/// All entries share one gate: a tick that fires while another job is still
/// running is skipped rather than queued.
pub async fn build_scheduler(runner: Arc<JobRunner>, schedule: &ScheduleFile) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating job scheduler")?;
    let gate = Arc::new(Mutex::new(()));

    for entry in schedule.jobs.iter().filter(|e| e.enabled) {
        let job: Job = entry
            .job
            .parse()
            .with_context(|| format!("schedule entry for {:?}", entry.job))?;
        let runner = Arc::clone(&runner);
        let gate = Arc::clone(&gate);
        let cron_job = CronJob::new_async(entry.cron.as_str(), move |_uuid, _lock| {
            let runner = Arc::clone(&runner);
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                let Ok(_guard) = gate.try_lock() else {
                    warn!(%job, "previous scheduled job still running; skipping tick");
                    return;
                };
                match runner.run(job).await {
                    Ok(outcome) if outcome.is_success() => info!(%job, "scheduled job finished"),
                    Ok(_) => warn!(%job, "scheduled job finished with failures"),
                    Err(err) => warn!(%job, error = %format!("{err:#}"), "scheduled job failed"),
                }
            })
        })
        .with_context(|| format!("invalid cron expression {:?} for {job}", entry.cron))?;
        scheduler
            .add(cron_job)
            .await
            .context("registering scheduled job")?;
        info!(%job, cron = %entry.cron, "job scheduled");
    }

    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobSettings, ScheduleEntry};
    use mirror_storage::{InMemoryDestinationStore, InMemorySourceStore};

    fn runner() -> Arc<JobRunner> {
        Arc::new(JobRunner::new(
            Arc::new(InMemorySourceStore::new()),
            Arc::new(InMemoryDestinationStore::new()),
            JobSettings::default(),
        ))
    }

    #[tokio::test]
    async fn unknown_jobs_are_rejected() {
        let schedule = ScheduleFile {
            jobs: vec![ScheduleEntry {
                job: "REINDEX".into(),
                cron: "0 0 * * * *".into(),
                enabled: true,
            }],
        };
        assert!(build_scheduler(runner(), &schedule).await.is_err());
    }

    #[tokio::test]
    async fn disabled_entries_are_not_parsed() {
        let schedule = ScheduleFile {
            jobs: vec![ScheduleEntry {
                job: "REINDEX".into(),
                cron: "not a cron".into(),
                enabled: false,
            }],
        };
        assert!(build_scheduler(runner(), &schedule).await.is_ok());
    }
}
