//! Repository interfaces for the operational (source) and analytics
//! (destination) stores, plus Postgres and in-memory implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::{
    CommentRow, DeferredRow, EmailVerificationRow, EngagementRow, EngagementStatus, EntityKind,
    FeedbackRow, NewMirrorRow, Package, ParseEnumError, RedactionCandidate, ReportSettingRow,
    RunCycle, SubmissionRow, SurveyRow, UserRow,
};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{FaultPoint, InMemoryDestinationStore, InMemorySourceStore};
pub use postgres::{PgDestinationStore, PgSourceStore};

pub const CRATE_NAME: &str = "mirror-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Parse(#[from] ParseEnumError),
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("injected fault at {0}")]
    InjectedFault(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pool settings shared by both Postgres stores.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Time-windowed, read-only access to operational entities.
///
/// `*_changed_since` returns rows whose `COALESCE(updated_date, created_date)`
/// is strictly after `since`. `*_by_ids` ignores timestamps and is used to
/// re-read parked dependent rows.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn engagements_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<EngagementRow>>;
    async fn surveys_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SurveyRow>>;
    async fn submissions_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SubmissionRow>>;
    async fn comments_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<CommentRow>>;
    async fn users_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<UserRow>>;
    async fn email_verifications_changed_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EmailVerificationRow>>;
    async fn report_settings_changed_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ReportSettingRow>>;
    async fn feedback_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<FeedbackRow>>;

    async fn surveys_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<SurveyRow>>;
    async fn submissions_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<SubmissionRow>>;
    async fn comments_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<CommentRow>>;
    async fn report_settings_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<ReportSettingRow>>;
    async fn email_verifications_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<EmailVerificationRow>>;

    /// Opens the single transaction a sweep job mutates source rows in.
    async fn begin_sweep(&self) -> StoreResult<Box<dyn SourceSweepTx>>;
}

/// Source-side transaction used by sweep jobs. Scans take a coarse cutoff;
/// callers re-check their own retention predicate.
#[async_trait]
pub trait SourceSweepTx: Send {
    /// Rejected comments on closed engagements that ended before `ended_before`.
    async fn rejected_comments_on_closed_engagements(
        &mut self,
        ended_before: DateTime<Utc>,
    ) -> StoreResult<Vec<RedactionCandidate>>;
    async fn redact_comment_text(&mut self, comment_id: i64, text: &str) -> StoreResult<()>;
    /// Overwrites one top-level key of `submission_json`.
    async fn redact_submission_field(
        &mut self,
        submission_id: i64,
        key: &str,
        text: &str,
    ) -> StoreResult<()>;
    async fn engagements_with_status(
        &mut self,
        status: EngagementStatus,
    ) -> StoreResult<Vec<EngagementRow>>;
    async fn set_engagement_status(
        &mut self,
        engagement_id: i64,
        status: EngagementStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn email_verifications_created_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<EmailVerificationRow>>;
    async fn delete_email_verifications(&mut self, ids: &[i64]) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Analytics store owning the mirrored tables, the run-cycle ledger and the
/// deferred-row backlog.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn DestinationTx>>;
}

#[async_trait]
pub trait DestinationTx: Send {
    /// Serializes run-id allocation against other writers of the ledger.
    async fn lock_run_cycles(&mut self) -> StoreResult<()>;
    async fn max_run_cycle_id(&mut self) -> StoreResult<Option<i64>>;
    async fn insert_run_cycle(&mut self, cycle: &RunCycle) -> StoreResult<()>;
    /// Returns the number of ledger rows updated.
    async fn mark_run_cycle_success(
        &mut self,
        id: i64,
        package: Package,
        end_time: DateTime<Utc>,
        description: &str,
    ) -> StoreResult<u64>;
    async fn max_successful_end_time(&mut self, package: Package) -> StoreResult<Option<DateTime<Utc>>>;
    /// Most recent cycles first.
    async fn run_cycles(&mut self, package: Option<Package>, limit: usize) -> StoreResult<Vec<RunCycle>>;

    async fn find_active_keys(&mut self, kind: EntityKind, source_id: i64) -> StoreResult<Vec<i64>>;
    async fn insert_mirror(&mut self, row: &NewMirrorRow) -> StoreResult<i64>;
    async fn deactivate_mirror(
        &mut self,
        kind: EntityKind,
        key: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn defer_row(&mut self, row: &DeferredRow) -> StoreResult<()>;
    async fn deferred_ids(&mut self, package: Package, kind: EntityKind) -> StoreResult<Vec<i64>>;
    async fn clear_deferred(
        &mut self,
        package: Package,
        kind: EntityKind,
        source_ids: &[i64],
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
