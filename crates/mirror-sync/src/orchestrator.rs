//! Runs a plan: one ledger cycle and one destination transaction per stage.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mirror_core::Package;
use mirror_storage::{DestinationStore, DestinationTx, SourceStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ledger::RunCycleLedger;
use crate::plan::PipelinePlan;
use crate::stages::{Stage, StageContext, StageCounts};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub package: Package,
    /// `None` when no cycle could be recorded.
    pub run_id: Option<i64>,
    pub watermark: Option<DateTime<Utc>>,
    pub committed_end_time: Option<DateTime<Utc>>,
    pub counts: StageCounts,
    pub status: StageStatus,
}

impl StageReport {
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    fn failed(package: Package, run_id: Option<i64>, err: &anyhow::Error) -> Self {
        Self {
            package,
            run_id,
            watermark: None,
            committed_end_time: None,
            counts: StageCounts::default(),
            status: StageStatus::Failed(format!("{err:#}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub invocation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(StageReport::succeeded)
    }

    pub fn failed_packages(&self) -> Vec<Package> {
        self.stages
            .iter()
            .filter(|s| !s.succeeded())
            .map(|s| s.package)
            .collect()
    }

    pub fn stage(&self, package: Package) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.package == package)
    }
}

struct CycleOutcome {
    watermark: DateTime<Utc>,
    end_time: DateTime<Utc>,
    counts: StageCounts,
}

#[derive(Clone)]
pub struct Orchestrator {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    ledger: RunCycleLedger,
}

impl Orchestrator {
    pub fn new(source: Arc<dyn SourceStore>, destination: Arc<dyn DestinationStore>) -> Self {
        let ledger = RunCycleLedger::new(Arc::clone(&destination));
        Self {
            source,
            destination,
            ledger,
        }
    }

    pub fn ledger(&self) -> &RunCycleLedger {
        &self.ledger
    }

    /// Runs every stage in plan order. A failed stage is rolled back and
    /// reported; later stages still run.
    pub async fn run(&self, plan: &PipelinePlan) -> PipelineReport {
        let invocation_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pipeline", %invocation_id);
        async {
            info!(order = ?plan.order(), "pipeline starting");
            let mut stages = Vec::with_capacity(plan.stages().len());
            for stage in plan.stages() {
                stages.push(self.run_stage(stage.as_ref()).await);
            }
            let report = PipelineReport {
                invocation_id,
                started_at,
                finished_at: Utc::now(),
                stages,
            };
            if report.is_success() {
                info!("pipeline finished");
            } else {
                warn!(failed = ?report.failed_packages(), "pipeline finished with failed stages");
            }
            report
        }
        .instrument(span)
        .await
    }

    pub async fn run_stage(&self, stage: &dyn Stage) -> StageReport {
        let package = stage.package();
        match self.ledger.lingering_failures(package).await {
            Ok(lingering) => {
                for cycle in lingering {
                    warn!(
                        package = %package,
                        run_id = cycle.id,
                        started = %cycle.start_time,
                        "earlier run cycle never completed"
                    );
                }
            }
            Err(err) => warn!(package = %package, error = %err, "could not inspect earlier run cycles"),
        }

        let run_id = match self.ledger.begin(package).await {
            Ok(id) => id,
            Err(err) => {
                let err = anyhow::Error::new(err).context("recording run cycle");
                warn!(package = %package, error = %format!("{err:#}"), "stage skipped");
                return StageReport::failed(package, None, &err);
            }
        };

        let span = info_span!("stage", package = %package, run_id);
        match self.execute_cycle(stage, run_id).instrument(span).await {
            Ok(outcome) => {
                info!(
                    package = %package,
                    run_id,
                    watermark = %outcome.watermark,
                    end_time = %outcome.end_time,
                    extracted = outcome.counts.extracted,
                    loaded = outcome.counts.loaded(),
                    deferred = outcome.counts.deferred,
                    "stage committed"
                );
                StageReport {
                    package,
                    run_id: Some(run_id),
                    watermark: Some(outcome.watermark),
                    committed_end_time: Some(outcome.end_time),
                    counts: outcome.counts,
                    status: StageStatus::Succeeded,
                }
            }
            Err(err) => {
                warn!(package = %package, run_id, error = %format!("{err:#}"), "stage failed; rolled back");
                StageReport::failed(package, Some(run_id), &err)
            }
        }
    }

    async fn execute_cycle(&self, stage: &dyn Stage, run_id: i64) -> Result<CycleOutcome> {
        let mut tx = self
            .destination
            .begin()
            .await
            .context("opening destination transaction")?;
        match self.load_in(&mut *tx, stage, run_id).await {
            Ok(outcome) => {
                tx.commit().await.context("committing stage transaction")?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn load_in(
        &self,
        tx: &mut dyn DestinationTx,
        stage: &dyn Stage,
        run_id: i64,
    ) -> Result<CycleOutcome> {
        let package = stage.package();
        let watermark = self
            .ledger
            .last_successful_watermark(tx, package)
            .await
            .context("reading watermark")?;
        // Rows changed after this instant belong to the next window.
        let started = Utc::now();
        let mut ctx = StageContext::new(
            package,
            run_id,
            watermark,
            started,
            self.source.as_ref(),
            &mut *tx,
        );
        stage.execute(&mut ctx).await?;
        let counts = ctx.finish();

        let end_time = self
            .ledger
            .commit_success(tx, run_id, package, &counts.describe(), started)
            .await
            .context("marking run cycle successful")?;
        Ok(CycleOutcome {
            watermark,
            end_time,
            counts,
        })
    }
}
