//! Named jobs: the full ETL, a single package, or one of the sweeps.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use mirror_core::Package;
use mirror_storage::{DestinationStore, SourceStore};
use serde::Serialize;
use thiserror::Error;

use crate::config::JobSettings;
use crate::orchestrator::{Orchestrator, PipelineReport};
use crate::plan::PipelinePlan;
use crate::stages::{default_stages, Stage};
use crate::sweep::{
    run_sweep, CommentRedactionSweep, EngagementCloseoutSweep, PurgeSweep, ScheduledPublishSweep,
    SweepReport,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("unknown job {0:?}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Etl,
    Package(Package),
    CommentRedact,
    Purge,
    EngagementCloseout,
    EngagementPublish,
}

impl Job {
    pub const SWEEPS: &'static [Job] = &[
        Job::CommentRedact,
        Job::Purge,
        Job::EngagementCloseout,
        Job::EngagementPublish,
    ];
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Etl => f.write_str("ETL"),
            Job::Package(package) => write!(f, "{package}"),
            Job::CommentRedact => f.write_str("COMMENT_REDACT"),
            Job::Purge => f.write_str("PURGE"),
            Job::EngagementCloseout => f.write_str("ENGAGEMENT_CLOSEOUT"),
            Job::EngagementPublish => f.write_str("ENGAGEMENT_PUBLISH"),
        }
    }
}

impl FromStr for Job {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "ETL" => return Ok(Job::Etl),
            "COMMENT_REDACT" => return Ok(Job::CommentRedact),
            "PURGE" => return Ok(Job::Purge),
            "ENGAGEMENT_CLOSEOUT" => return Ok(Job::EngagementCloseout),
            "ENGAGEMENT_PUBLISH" => return Ok(Job::EngagementPublish),
            _ => {}
        }
        trimmed
            .to_ascii_lowercase()
            .parse::<Package>()
            .map(Job::Package)
            .map_err(|_| JobError::Unknown(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    Pipeline(PipelineReport),
    Sweep(SweepReport),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            JobOutcome::Pipeline(report) => report.is_success(),
            JobOutcome::Sweep(_) => true,
        }
    }
}

#[derive(Clone)]
pub struct JobRunner {
    orchestrator: Orchestrator,
    source: Arc<dyn SourceStore>,
    settings: JobSettings,
    stages: Vec<Arc<dyn Stage>>,
}

impl JobRunner {
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        settings: JobSettings,
    ) -> Self {
        Self::with_stages(source, destination, settings, default_stages())
    }

    pub fn with_stages(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        settings: JobSettings,
        stages: Vec<Arc<dyn Stage>>,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(Arc::clone(&source), destination),
            source,
            settings,
            stages,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub async fn run(&self, job: Job) -> Result<JobOutcome> {
        let now = Utc::now();
        let source = self.source.as_ref();
        let outcome = match job {
            Job::Etl => {
                let plan = PipelinePlan::new(self.stages.clone())?;
                JobOutcome::Pipeline(self.orchestrator.run(&plan).await)
            }
            Job::Package(package) => {
                let plan = PipelinePlan::only(self.stages.clone(), &[package])?;
                JobOutcome::Pipeline(self.orchestrator.run(&plan).await)
            }
            Job::CommentRedact => {
                let sweep = CommentRedactionSweep::from_settings(&self.settings)?;
                JobOutcome::Sweep(run_sweep(source, &sweep, now).await?)
            }
            Job::Purge => {
                let sweep = PurgeSweep::from_settings(&self.settings)?;
                JobOutcome::Sweep(run_sweep(source, &sweep, now).await?)
            }
            Job::EngagementCloseout => {
                JobOutcome::Sweep(run_sweep(source, &EngagementCloseoutSweep, now).await?)
            }
            Job::EngagementPublish => {
                let sweep = ScheduledPublishSweep::from_settings(&self.settings)?;
                JobOutcome::Sweep(run_sweep(source, &sweep, now).await?)
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_parse_case_insensitively() {
        assert_eq!("ETL".parse::<Job>().unwrap(), Job::Etl);
        assert_eq!("purge".parse::<Job>().unwrap(), Job::Purge);
        assert_eq!(
            "report_setting".parse::<Job>().unwrap(),
            Job::Package(Package::ReportSetting)
        );
        assert_eq!(
            "USERFEEDBACK".parse::<Job>().unwrap(),
            Job::Package(Package::UserFeedback)
        );
        assert_eq!(
            "REINDEX".parse::<Job>().unwrap_err(),
            JobError::Unknown("REINDEX".into())
        );
    }

    #[test]
    fn display_round_trips() {
        for job in Job::SWEEPS
            .iter()
            .copied()
            .chain([Job::Etl, Job::Package(Package::EmailVerification)])
        {
            assert_eq!(job.to_string().parse::<Job>().unwrap(), job);
        }
    }
}
