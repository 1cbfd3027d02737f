//! Pipeline stages, one per package. Each stage maps source rows to typed
//! mirror payloads; extraction, resolution, loading and bookkeeping go
//! through [`StageContext`].

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::{
    ChangeTracked, CommentFacts, CommentRow, CommentStatus, DeferredRow, EmailVerificationFacts,
    EmailVerificationRow, EngagementFacts, EngagementRow, EngagementStatus, EntityKind,
    FeedbackFacts, FeedbackRow, MirrorPayload, NewMirrorRow, Package, ReportSettingFacts,
    ReportSettingRow, SubmissionFacts, SubmissionRow, SurveyFacts, SurveyRow, UserDetailFacts,
    UserRow,
};
use mirror_storage::{DestinationTx, SourceStore, StoreResult};
use serde::Serialize;
use tracing::{debug, warn};

use crate::extract::{extract_with_backlog, ChangeBatch, SourceEntity};
use crate::load::{LoadOutcome, LoadStrategy, ScdLoader};
use crate::resolve::{NaturalKeyResolver, Resolution};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub extracted: usize,
    pub from_backlog: usize,
    pub appended: usize,
    pub versioned: usize,
    pub superseded: usize,
    pub deferred: usize,
    pub anomalies: usize,
}

impl StageCounts {
    pub fn loaded(&self) -> usize {
        self.appended + self.versioned
    }

    /// Summary stored on the run cycle.
    pub fn describe(&self) -> String {
        format!(
            "extracted={} backlog={} appended={} versioned={} superseded={} deferred={} anomalies={}",
            self.extracted,
            self.from_backlog,
            self.appended,
            self.versioned,
            self.superseded,
            self.deferred,
            self.anomalies
        )
    }
}

/// Everything a stage may touch during one cycle. All destination writes go
/// through the single stage transaction.
pub struct StageContext<'a> {
    pub package: Package,
    pub run_id: i64,
    pub watermark: DateTime<Utc>,
    pub now: DateTime<Utc>,
    source: &'a dyn SourceStore,
    tx: &'a mut dyn DestinationTx,
    resolver: NaturalKeyResolver,
    counts: StageCounts,
}

impl<'a> StageContext<'a> {
    pub fn new(
        package: Package,
        run_id: i64,
        watermark: DateTime<Utc>,
        now: DateTime<Utc>,
        source: &'a dyn SourceStore,
        tx: &'a mut dyn DestinationTx,
    ) -> Self {
        Self {
            package,
            run_id,
            watermark,
            now,
            source,
            tx,
            resolver: NaturalKeyResolver::new(),
            counts: StageCounts::default(),
        }
    }

    pub async fn extract<T, P>(&mut self, predicate: P) -> StoreResult<ChangeBatch<T>>
    where
        T: SourceEntity,
        P: Fn(&T) -> bool + Send + Sync,
    {
        let batch =
            extract_with_backlog(self.source, &mut *self.tx, self.package, self.watermark, &predicate)
                .await?;
        self.counts.extracted += batch.from_window();
        self.counts.from_backlog += batch.from_backlog();
        Ok(batch)
    }

    pub async fn resolve(&mut self, kind: EntityKind, source_id: i64) -> StoreResult<Resolution> {
        self.resolver.resolve(&mut *self.tx, kind, source_id).await
    }

    /// Resolves `parent`, or parks `row` in the backlog and returns `None`.
    pub async fn resolve_or_defer<T: SourceEntity>(
        &mut self,
        row: &T,
        parent: EntityKind,
        parent_id: i64,
    ) -> StoreResult<Option<i64>> {
        match self.resolve(parent, parent_id).await? {
            Resolution::Found(key) => Ok(Some(key)),
            Resolution::NotFound => {
                self.defer(row, format!("{parent} {parent_id} is not mirrored"))
                    .await?;
                Ok(None)
            }
        }
    }

    pub async fn defer<T: SourceEntity>(&mut self, row: &T, reason: String) -> StoreResult<()> {
        warn!(
            package = %self.package,
            kind = %T::KIND,
            source_id = row.source_id(),
            reason = %reason,
            "deferring row until its parent is mirrored"
        );
        self.tx
            .defer_row(&DeferredRow {
                package: self.package,
                kind: T::KIND,
                source_id: row.source_id(),
                reason,
                deferred_at: self.now,
            })
            .await?;
        self.counts.deferred += 1;
        Ok(())
    }

    /// Loads `row` with the strategy its kind is kept under.
    pub async fn load<T: SourceEntity>(
        &mut self,
        row: &T,
        payload: MirrorPayload,
    ) -> StoreResult<LoadOutcome> {
        let strategy = LoadStrategy::for_kind(T::KIND);
        let new_row = NewMirrorRow {
            source_id: row.source_id(),
            is_active: true,
            runcycle_id: self.run_id,
            created_date: row.created_date(),
            updated_date: row.updated_date(),
            payload,
        };
        let outcome = ScdLoader::load(&mut *self.tx, strategy, new_row, self.now).await?;
        match outcome {
            LoadOutcome::Appended { .. } => self.counts.appended += 1,
            LoadOutcome::Versioned { superseded, .. } => {
                self.counts.versioned += 1;
                if superseded.is_some() {
                    self.counts.superseded += 1;
                }
            }
            LoadOutcome::Anomaly { .. } => {
                self.counts.versioned += 1;
                self.counts.anomalies += 1;
            }
        }
        Ok(outcome)
    }

    pub fn counts(&self) -> &StageCounts {
        &self.counts
    }

    /// Releases the transaction borrow and returns the final tallies.
    pub fn finish(self) -> StageCounts {
        let mut counts = self.counts;
        counts.anomalies += self.resolver.anomalies();
        counts
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn package(&self) -> Package;

    /// Packages whose mirrored rows this stage resolves against.
    fn depends_on(&self) -> &'static [Package] {
        &[]
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<()>;
}

/// Stages in declaration order; the plan derives execution order from
/// their dependencies.
pub fn default_stages() -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(EngagementStage),
        Arc::new(SurveyStage),
        Arc::new(SubmissionStage),
        Arc::new(ReportSettingStage),
        Arc::new(UserStage),
        Arc::new(EmailVerificationStage),
        Arc::new(FeedbackStage),
    ]
}

pub struct EngagementStage;

#[async_trait]
impl Stage for EngagementStage {
    fn package(&self) -> Package {
        Package::Engagement
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        let batch = ctx
            .extract(|e: &EngagementRow| e.status != EngagementStatus::Draft)
            .await
            .context("extracting engagements")?;
        for row in batch {
            let payload = MirrorPayload::Engagement(EngagementFacts {
                name: row.name.clone(),
                status: row.status,
                start_date: row.start_date,
                end_date: row.end_date,
                published_date: row.published_date,
                tenant_id: row.tenant_id,
            });
            ctx.load(&row, payload)
                .await
                .with_context(|| format!("loading engagement {}", row.id))?;
        }
        Ok(())
    }
}

pub struct SurveyStage;

#[async_trait]
impl Stage for SurveyStage {
    fn package(&self) -> Package {
        Package::Survey
    }

    fn depends_on(&self) -> &'static [Package] {
        &[Package::Engagement]
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        let batch = ctx
            .extract(|s: &SurveyRow| !s.is_template)
            .await
            .context("extracting surveys")?;
        for row in batch {
            let engagement_key = match row.engagement_id {
                Some(engagement_id) => {
                    match ctx
                        .resolve_or_defer(&row, EntityKind::Engagement, engagement_id)
                        .await?
                    {
                        Some(key) => Some(key),
                        None => continue,
                    }
                }
                None => None,
            };
            let payload = MirrorPayload::Survey(SurveyFacts {
                name: row.name.clone(),
                engagement_key,
                is_hidden: row.is_hidden,
            });
            ctx.load(&row, payload)
                .await
                .with_context(|| format!("loading survey {}", row.id))?;
        }
        Ok(())
    }
}

/// Submissions and their approved comments.
pub struct SubmissionStage;

impl SubmissionStage {
    async fn submissions(ctx: &mut StageContext<'_>) -> Result<()> {
        let batch = ctx
            .extract(|_: &SubmissionRow| true)
            .await
            .context("extracting submissions")?;
        for row in batch {
            let Some(survey_key) = ctx
                .resolve_or_defer(&row, EntityKind::Survey, row.survey_id)
                .await?
            else {
                continue;
            };
            let Some(engagement_key) = ctx
                .resolve_or_defer(&row, EntityKind::Engagement, row.engagement_id)
                .await?
            else {
                continue;
            };
            let payload = MirrorPayload::Submission(SubmissionFacts {
                survey_key,
                engagement_key,
                user_id: row.user_id,
            });
            ctx.load(&row, payload)
                .await
                .with_context(|| format!("loading submission {}", row.id))?;
        }
        Ok(())
    }

    async fn comments(ctx: &mut StageContext<'_>) -> Result<()> {
        let batch = ctx
            .extract(|c: &CommentRow| c.status == CommentStatus::Approved)
            .await
            .context("extracting comments")?;
        for row in batch {
            let Some(survey_key) = ctx
                .resolve_or_defer(&row, EntityKind::Survey, row.survey_id)
                .await?
            else {
                continue;
            };
            let payload = MirrorPayload::Comment(CommentFacts {
                survey_key,
                submission_id: row.submission_id,
                user_id: row.user_id,
                component_id: row.component_id.clone(),
                text: row.text.clone(),
                submission_date: row.submission_date,
            });
            ctx.load(&row, payload)
                .await
                .with_context(|| format!("loading comment {}", row.id))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for SubmissionStage {
    fn package(&self) -> Package {
        Package::Submission
    }

    fn depends_on(&self) -> &'static [Package] {
        &[Package::Survey, Package::Engagement]
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        Self::submissions(ctx).await?;
        Self::comments(ctx).await
    }
}

pub struct ReportSettingStage;

#[async_trait]
impl Stage for ReportSettingStage {
    fn package(&self) -> Package {
        Package::ReportSetting
    }

    fn depends_on(&self) -> &'static [Package] {
        &[Package::Survey]
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        let batch = ctx
            .extract(|_: &ReportSettingRow| true)
            .await
            .context("extracting report settings")?;
        for row in batch {
            let Some(survey_key) = ctx
                .resolve_or_defer(&row, EntityKind::Survey, row.survey_id)
                .await?
            else {
                continue;
            };
            let payload = MirrorPayload::ReportSetting(ReportSettingFacts {
                survey_key,
                question_id: row.question_id.clone(),
                question_key: row.question_key.clone(),
                question_type: row.question_type.clone(),
                question: row.question.clone(),
                display: row.display,
            });
            ctx.load(&row, payload)
                .await
                .with_context(|| format!("loading report setting {}", row.id))?;
        }
        Ok(())
    }
}

pub struct UserStage;

#[async_trait]
impl Stage for UserStage {
    fn package(&self) -> Package {
        Package::User
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        let batch = ctx
            .extract(|_: &UserRow| true)
            .await
            .context("extracting users")?;
        for row in batch {
            let payload = MirrorPayload::UserDetail(UserDetailFacts {
                external_id: row.external_id.clone(),
                display_name: row.display_name.clone(),
            });
            ctx.load(&row, payload)
                .await
                .with_context(|| format!("loading user {}", row.id))?;
        }
        Ok(())
    }
}

pub struct EmailVerificationStage;

#[async_trait]
impl Stage for EmailVerificationStage {
    fn package(&self) -> Package {
        Package::EmailVerification
    }

    fn depends_on(&self) -> &'static [Package] {
        &[Package::Survey]
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        let batch = ctx
            .extract(|_: &EmailVerificationRow| true)
            .await
            .context("extracting email verifications")?;
        for row in batch {
            let survey_key = match row.survey_id {
                Some(survey_id) => {
                    match ctx
                        .resolve_or_defer(&row, EntityKind::Survey, survey_id)
                        .await?
                    {
                        Some(key) => Some(key),
                        None => continue,
                    }
                }
                None => None,
            };
            let payload = MirrorPayload::EmailVerification(EmailVerificationFacts {
                survey_key,
                user_id: row.user_id,
                verification_type: row.verification_type,
            });
            ctx.load(&row, payload)
                .await
                .with_context(|| format!("loading email verification {}", row.id))?;
        }
        Ok(())
    }
}

pub struct FeedbackStage;

#[async_trait]
impl Stage for FeedbackStage {
    fn package(&self) -> Package {
        Package::UserFeedback
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<()> {
        let batch = ctx
            .extract(|_: &FeedbackRow| true)
            .await
            .context("extracting feedback")?;
        debug!(rows = batch.len(), "feedback batch");
        for row in batch {
            let payload = MirrorPayload::Feedback(FeedbackFacts {
                rating: row.rating,
                comment: row.comment.clone(),
                comment_type: row.comment_type.clone(),
                source_url: row.source_url.clone(),
            });
            ctx.load(&row, payload)
                .await
                .with_context(|| format!("loading feedback {}", row.id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_package_has_exactly_one_stage() {
        let stages = default_stages();
        let packages = stages.iter().map(|s| s.package()).collect::<HashSet<_>>();
        assert_eq!(packages.len(), Package::ALL.len());
        assert_eq!(stages.len(), Package::ALL.len());
    }

    #[test]
    fn describe_lists_every_counter() {
        let counts = StageCounts {
            extracted: 3,
            deferred: 1,
            ..StageCounts::default()
        };
        let text = counts.describe();
        assert!(text.starts_with("extracted=3 "));
        assert!(text.contains("deferred=1"));
        assert_eq!(counts.loaded(), 0);
    }
}
