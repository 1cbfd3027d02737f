//! Retention and lifecycle sweeps over the operational store. Each sweep
//! runs in one source transaction: either every mutation lands or none do.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mirror_core::{EngagementRow, EngagementStatus, RedactionCandidate};
use mirror_storage::{SourceSweepTx, SourceStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::JobSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sweep: &'static str,
    pub scanned: usize,
    pub mutated: usize,
}

impl SweepReport {
    fn new(sweep: &'static str) -> Self {
        Self {
            sweep,
            scanned: 0,
            mutated: 0,
        }
    }
}

#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, tx: &mut dyn SourceSweepTx, now: DateTime<Utc>) -> Result<SweepReport>;
}

pub async fn run_sweep(
    source: &dyn SourceStore,
    sweep: &dyn Sweep,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let span = info_span!("sweep", sweep = sweep.name());
    apply_in_tx(source, sweep, now).instrument(span).await
}

async fn apply_in_tx(
    source: &dyn SourceStore,
    sweep: &dyn Sweep,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let mut tx = source.begin_sweep().await.context("opening sweep transaction")?;
    match sweep.apply(&mut *tx, now).await {
        Ok(report) => {
            tx.commit().await.context("committing sweep")?;
            info!(scanned = report.scanned, mutated = report.mutated, "sweep committed");
            Ok(report)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "sweep rollback failed");
            }
            warn!(error = %format!("{err:#}"), "sweep failed; rolled back");
            Err(err)
        }
    }
}

fn days(value: i64) -> Result<Duration> {
    Duration::try_days(value).ok_or_else(|| anyhow!("{value} days is out of range"))
}

fn minutes(value: i64) -> Result<Duration> {
    Duration::try_minutes(value).ok_or_else(|| anyhow!("{value} minutes is out of range"))
}

/// Replaces the text of rejected comments once their engagement has been
/// closed for long enough, in both the comment row and the submission
/// payload.
#[derive(Debug, Clone)]
pub struct CommentRedactionSweep {
    pub redact_after: Duration,
    pub replacement: String,
}

impl CommentRedactionSweep {
    pub fn from_settings(settings: &JobSettings) -> Result<Self> {
        Ok(Self {
            redact_after: days(settings.redact_after_days)?,
            replacement: settings.redaction_text.clone(),
        })
    }

    pub fn is_due(&self, candidate: &RedactionCandidate, now: DateTime<Utc>) -> bool {
        candidate.engagement_end_date < now - self.redact_after
            && candidate.text != self.replacement
    }
}

#[async_trait]
impl Sweep for CommentRedactionSweep {
    fn name(&self) -> &'static str {
        "COMMENT_REDACT"
    }

    async fn apply(&self, tx: &mut dyn SourceSweepTx, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::new(self.name());
        let candidates = tx
            .rejected_comments_on_closed_engagements(now - self.redact_after)
            .await
            .context("scanning rejected comments")?;
        report.scanned = candidates.len();
        for candidate in candidates.iter().filter(|c| self.is_due(c, now)) {
            tx.redact_comment_text(candidate.comment_id, &self.replacement)
                .await
                .with_context(|| format!("redacting comment {}", candidate.comment_id))?;
            tx.redact_submission_field(
                candidate.submission_id,
                &candidate.component_id,
                &self.replacement,
            )
            .await
            .with_context(|| {
                format!(
                    "redacting field {} of submission {}",
                    candidate.component_id, candidate.submission_id
                )
            })?;
            report.mutated += 1;
        }
        Ok(report)
    }
}

/// Deletes email verifications older than the retention window.
#[derive(Debug, Clone)]
pub struct PurgeSweep {
    pub purge_after: Duration,
}

impl PurgeSweep {
    pub fn from_settings(settings: &JobSettings) -> Result<Self> {
        Ok(Self {
            purge_after: days(settings.purge_after_days)?,
        })
    }
}

#[async_trait]
impl Sweep for PurgeSweep {
    fn name(&self) -> &'static str {
        "PURGE"
    }

    async fn apply(&self, tx: &mut dyn SourceSweepTx, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::new(self.name());
        let cutoff = now - self.purge_after;
        let expired = tx
            .email_verifications_created_before(cutoff)
            .await
            .context("scanning email verifications")?;
        report.scanned = expired.len();
        let ids = expired
            .iter()
            .filter(|v| v.created_date < cutoff)
            .map(|v| v.id)
            .collect::<Vec<_>>();
        if !ids.is_empty() {
            let deleted = tx
                .delete_email_verifications(&ids)
                .await
                .context("deleting email verifications")?;
            report.mutated = usize::try_from(deleted).unwrap_or(usize::MAX);
        }
        Ok(report)
    }
}

pub fn closeout_due(engagement: &EngagementRow, now: DateTime<Utc>) -> bool {
    engagement.status == EngagementStatus::Published && engagement.end_date < now
}

pub fn publish_due(engagement: &EngagementRow, now: DateTime<Utc>, window: Duration) -> bool {
    engagement.status == EngagementStatus::Scheduled
        && engagement
            .scheduled_date
            .is_some_and(|at| at <= now + window)
}

/// Moves published engagements past their end date to closed.
#[derive(Debug, Clone, Default)]
pub struct EngagementCloseoutSweep;

#[async_trait]
impl Sweep for EngagementCloseoutSweep {
    fn name(&self) -> &'static str {
        "ENGAGEMENT_CLOSEOUT"
    }

    async fn apply(&self, tx: &mut dyn SourceSweepTx, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::new(self.name());
        let published = tx
            .engagements_with_status(EngagementStatus::Published)
            .await
            .context("scanning published engagements")?;
        report.scanned = published.len();
        for engagement in published.iter().filter(|e| closeout_due(e, now)) {
            tx.set_engagement_status(engagement.id, EngagementStatus::Closed, now)
                .await
                .with_context(|| format!("closing engagement {}", engagement.id))?;
            report.mutated += 1;
        }
        Ok(report)
    }
}

/// Publishes scheduled engagements whose start falls within the window.
#[derive(Debug, Clone)]
pub struct ScheduledPublishSweep {
    pub window: Duration,
}

impl ScheduledPublishSweep {
    pub fn from_settings(settings: &JobSettings) -> Result<Self> {
        Ok(Self {
            window: minutes(settings.publish_window_minutes)?,
        })
    }
}

#[async_trait]
impl Sweep for ScheduledPublishSweep {
    fn name(&self) -> &'static str {
        "ENGAGEMENT_PUBLISH"
    }

    async fn apply(&self, tx: &mut dyn SourceSweepTx, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::new(self.name());
        let scheduled = tx
            .engagements_with_status(EngagementStatus::Scheduled)
            .await
            .context("scanning scheduled engagements")?;
        report.scanned = scheduled.len();
        for engagement in scheduled.iter().filter(|e| publish_due(e, now, self.window)) {
            tx.set_engagement_status(engagement.id, EngagementStatus::Published, now)
                .await
                .with_context(|| format!("publishing engagement {}", engagement.id))?;
            report.mutated += 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mirror_core::{CommentRow, CommentStatus, EmailVerificationRow, SubmissionRow, VerificationType};
    use mirror_storage::InMemorySourceStore;
    use serde_json::json;

    fn ts(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, month, day, 8, 0, 0).single().unwrap()
    }

    fn engagement(id: i64, status: EngagementStatus, end: DateTime<Utc>) -> EngagementRow {
        EngagementRow {
            id,
            name: format!("engagement {id}"),
            status,
            start_date: ts(1, 1),
            end_date: end,
            published_date: None,
            scheduled_date: None,
            tenant_id: None,
            created_date: ts(1, 1),
            updated_date: None,
        }
    }

    #[test]
    fn closeout_requires_published_and_past_end() {
        let now = ts(6, 1);
        assert!(closeout_due(&engagement(1, EngagementStatus::Published, ts(5, 31)), now));
        assert!(!closeout_due(&engagement(2, EngagementStatus::Published, now), now));
        assert!(!closeout_due(&engagement(3, EngagementStatus::Draft, ts(5, 1)), now));
    }

    #[test]
    fn publish_window_is_inclusive() {
        let now = ts(6, 1);
        let window = Duration::minutes(5);
        let mut e = engagement(1, EngagementStatus::Scheduled, ts(7, 1));
        e.scheduled_date = Some(now + window);
        assert!(publish_due(&e, now, window));
        e.scheduled_date = Some(now + window + Duration::seconds(1));
        assert!(!publish_due(&e, now, window));
        e.scheduled_date = None;
        assert!(!publish_due(&e, now, window));
    }

    #[tokio::test]
    async fn redaction_updates_comment_and_payload_and_is_idempotent() {
        let source = InMemorySourceStore::new();
        source
            .put_engagement(engagement(1, EngagementStatus::Closed, ts(1, 10)))
            .await;
        source
            .put_submission(SubmissionRow {
                id: 20,
                survey_id: 3,
                engagement_id: 1,
                user_id: None,
                submission_json: json!({ "q1": "rude words", "q2": "fine" }),
                created_date: ts(1, 5),
                updated_date: None,
            })
            .await;
        source
            .put_comment(CommentRow {
                id: 30,
                text: "rude words".into(),
                submission_id: 20,
                survey_id: 3,
                user_id: None,
                component_id: "q1".into(),
                status: CommentStatus::Rejected,
                submission_date: ts(1, 5),
                created_date: ts(1, 5),
                updated_date: None,
            })
            .await;

        let sweep = CommentRedactionSweep::from_settings(&JobSettings::default()).unwrap();
        let report = run_sweep(&source, &sweep, ts(3, 1)).await.unwrap();
        assert_eq!(report.mutated, 1);

        let tables = source.snapshot().await;
        assert_eq!(tables.comments[&30].text, "[Comment Redacted]");
        assert_eq!(
            tables.submissions[&20].submission_json,
            json!({ "q1": "[Comment Redacted]", "q2": "fine" })
        );

        let again = run_sweep(&source, &sweep, ts(3, 2)).await.unwrap();
        assert_eq!(again.scanned, 1);
        assert_eq!(again.mutated, 0);
    }

    #[tokio::test]
    async fn purge_deletes_only_expired_verifications() {
        let source = InMemorySourceStore::new();
        for (id, created) in [(1, ts(1, 1)), (2, ts(5, 25))] {
            source
                .put_email_verification(EmailVerificationRow {
                    id,
                    verification_token: format!("token-{id}"),
                    survey_id: None,
                    user_id: None,
                    verification_type: VerificationType::Subscribe,
                    is_active: true,
                    created_date: created,
                    updated_date: None,
                })
                .await;
        }

        let sweep = PurgeSweep::from_settings(&JobSettings::default()).unwrap();
        let report = run_sweep(&source, &sweep, ts(6, 1)).await.unwrap();
        assert_eq!(report, SweepReport { sweep: "PURGE", scanned: 1, mutated: 1 });

        let remaining = source.snapshot().await.email_verifications;
        assert_eq!(remaining.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn lifecycle_sweeps_move_engagement_status() {
        let source = InMemorySourceStore::new();
        let now = ts(6, 1);
        source
            .put_engagement(engagement(1, EngagementStatus::Published, ts(5, 1)))
            .await;
        let mut scheduled = engagement(2, EngagementStatus::Scheduled, ts(9, 1));
        scheduled.scheduled_date = Some(now + Duration::minutes(2));
        source.put_engagement(scheduled).await;

        let closed = run_sweep(&source, &EngagementCloseoutSweep, now).await.unwrap();
        assert_eq!(closed.mutated, 1);
        let publisher = ScheduledPublishSweep::from_settings(&JobSettings::default()).unwrap();
        let published = run_sweep(&source, &publisher, now).await.unwrap();
        assert_eq!(published.mutated, 1);

        let tables = source.snapshot().await;
        assert_eq!(tables.engagements[&1].status, EngagementStatus::Closed);
        assert_eq!(tables.engagements[&2].status, EngagementStatus::Published);
        assert_eq!(tables.engagements[&2].published_date, Some(now));
    }
}
