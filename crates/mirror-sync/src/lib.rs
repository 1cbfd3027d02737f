//! Watermark-driven incremental mirror of the operational database into the
//! analytics database, plus the retention and lifecycle sweeps that run
//! alongside it.

pub mod config;
pub mod extract;
pub mod jobs;
pub mod ledger;
pub mod load;
pub mod orchestrator;
pub mod plan;
pub mod resolve;
pub mod schedule;
pub mod stages;
pub mod sweep;

pub use config::{load_schedule, ConfigError, JobSettings, ScheduleFile, SyncConfig};
pub use extract::{extract, extract_with_backlog, ChangeBatch, SourceEntity};
pub use jobs::{Job, JobError, JobOutcome, JobRunner};
pub use ledger::RunCycleLedger;
pub use load::{LoadOutcome, LoadStrategy, ScdLoader};
pub use orchestrator::{Orchestrator, PipelineReport, StageReport, StageStatus};
pub use plan::{PipelinePlan, PlanError};
pub use resolve::{NaturalKeyResolver, Resolution};
pub use schedule::build_scheduler;
pub use stages::{default_stages, Stage, StageContext, StageCounts};
pub use sweep::{run_sweep, Sweep, SweepReport};

pub const CRATE_NAME: &str = "mirror-sync";
