//! Watermark extraction: rows changed strictly after the last committed
//! watermark, merged with any rows parked in the deferred backlog.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::{
    ChangeTracked, CommentRow, EmailVerificationRow, EngagementRow, EntityKind, FeedbackRow,
    Package, ReportSettingRow, SubmissionRow, SurveyRow, UserRow,
};
use mirror_storage::{DestinationTx, SourceStore, StoreResult};
use tracing::{debug, warn};

/// A source row type the extractor knows how to query.
#[async_trait]
pub trait SourceEntity: ChangeTracked + Send + Sync + Sized + 'static {
    /// Mirror kind this row is loaded as; also keys its backlog entries.
    const KIND: EntityKind;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>>;

    /// Re-read by id. Kinds that never wait on a parent have no backlog.
    async fn by_ids(source: &dyn SourceStore, ids: &[i64]) -> StoreResult<Vec<Self>> {
        let _ = (source, ids);
        Ok(Vec::new())
    }
}

#[async_trait]
impl SourceEntity for EngagementRow {
    const KIND: EntityKind = EntityKind::Engagement;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>> {
        source.engagements_changed_since(since).await
    }
}

#[async_trait]
impl SourceEntity for SurveyRow {
    const KIND: EntityKind = EntityKind::Survey;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>> {
        source.surveys_changed_since(since).await
    }

    async fn by_ids(source: &dyn SourceStore, ids: &[i64]) -> StoreResult<Vec<Self>> {
        source.surveys_by_ids(ids).await
    }
}

#[async_trait]
impl SourceEntity for SubmissionRow {
    const KIND: EntityKind = EntityKind::Submission;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>> {
        source.submissions_changed_since(since).await
    }

    async fn by_ids(source: &dyn SourceStore, ids: &[i64]) -> StoreResult<Vec<Self>> {
        source.submissions_by_ids(ids).await
    }
}

#[async_trait]
impl SourceEntity for CommentRow {
    const KIND: EntityKind = EntityKind::Comment;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>> {
        source.comments_changed_since(since).await
    }

    async fn by_ids(source: &dyn SourceStore, ids: &[i64]) -> StoreResult<Vec<Self>> {
        source.comments_by_ids(ids).await
    }
}

#[async_trait]
impl SourceEntity for ReportSettingRow {
    const KIND: EntityKind = EntityKind::ReportSetting;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>> {
        source.report_settings_changed_since(since).await
    }

    async fn by_ids(source: &dyn SourceStore, ids: &[i64]) -> StoreResult<Vec<Self>> {
        source.report_settings_by_ids(ids).await
    }
}

#[async_trait]
impl SourceEntity for EmailVerificationRow {
    const KIND: EntityKind = EntityKind::EmailVerification;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>> {
        source.email_verifications_changed_since(since).await
    }

    async fn by_ids(source: &dyn SourceStore, ids: &[i64]) -> StoreResult<Vec<Self>> {
        source.email_verifications_by_ids(ids).await
    }
}

#[async_trait]
impl SourceEntity for UserRow {
    const KIND: EntityKind = EntityKind::UserDetail;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>> {
        source.users_changed_since(since).await
    }
}

#[async_trait]
impl SourceEntity for FeedbackRow {
    const KIND: EntityKind = EntityKind::Feedback;

    async fn changed_since(source: &dyn SourceStore, since: DateTime<Utc>) -> StoreResult<Vec<Self>> {
        source.feedback_changed_since(since).await
    }
}

/// Rows pulled for one cycle. Iterating consumes the batch, so a window is
/// never processed twice.
#[derive(Debug)]
pub struct ChangeBatch<T> {
    rows: Vec<T>,
    from_window: usize,
    from_backlog: usize,
}

impl<T> ChangeBatch<T> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn from_window(&self) -> usize {
        self.from_window
    }

    pub fn from_backlog(&self) -> usize {
        self.from_backlog
    }
}

impl<T> IntoIterator for ChangeBatch<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Rows of `T` whose change timestamp is strictly after `watermark` and
/// that satisfy `predicate`.
pub async fn extract<T, P>(
    source: &dyn SourceStore,
    package: Package,
    watermark: DateTime<Utc>,
    predicate: &P,
) -> StoreResult<ChangeBatch<T>>
where
    T: SourceEntity,
    P: Fn(&T) -> bool + Send + Sync,
{
    let fetched = T::changed_since(source, watermark).await?;
    let total = fetched.len();
    let rows = fetched
        .into_iter()
        .filter(|row| row.changed_at() > watermark && predicate(row))
        .collect::<Vec<_>>();
    debug!(
        package = %package,
        kind = %T::KIND,
        %watermark,
        fetched = total,
        kept = rows.len(),
        "extracted change window"
    );
    Ok(ChangeBatch {
        from_window: rows.len(),
        from_backlog: 0,
        rows,
    })
}

/// `extract` plus the rows parked for `(package, T::KIND)`.
///
/// Parked ids are cleared inside `tx`; rows that still cannot resolve their
/// parent are expected to be parked again before the transaction commits.
/// Parked rows that vanished from the source or no longer satisfy the
/// predicate are dropped.
pub async fn extract_with_backlog<T, P>(
    source: &dyn SourceStore,
    tx: &mut dyn DestinationTx,
    package: Package,
    watermark: DateTime<Utc>,
    predicate: &P,
) -> StoreResult<ChangeBatch<T>>
where
    T: SourceEntity,
    P: Fn(&T) -> bool + Send + Sync,
{
    let mut batch = extract(source, package, watermark, predicate).await?;
    let parked = tx.deferred_ids(package, T::KIND).await?;
    if parked.is_empty() {
        return Ok(batch);
    }
    tx.clear_deferred(package, T::KIND, &parked).await?;

    let fetched = T::by_ids(source, &parked).await?;
    let found = fetched.iter().map(|r| r.source_id()).collect::<HashSet<_>>();
    for missing in parked.iter().filter(|id| !found.contains(id)) {
        warn!(package = %package, kind = %T::KIND, source_id = missing, "deferred row no longer exists in source; dropping");
    }

    let mut seen = batch.rows.iter().map(|r| r.source_id()).collect::<HashSet<_>>();
    for row in fetched {
        if !seen.insert(row.source_id()) {
            continue;
        }
        if !predicate(&row) {
            debug!(package = %package, kind = %T::KIND, source_id = row.source_id(), "deferred row no longer qualifies; dropping");
            continue;
        }
        batch.rows.push(row);
        batch.from_backlog += 1;
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mirror_core::{CommentStatus, DeferredRow};
    use mirror_storage::{DestinationStore, InMemoryDestinationStore, InMemorySourceStore};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, day, 12, 0, 0).single().unwrap()
    }

    fn comment(id: i64, status: CommentStatus, created: DateTime<Utc>) -> CommentRow {
        CommentRow {
            id,
            text: format!("comment {id}"),
            submission_id: 1,
            survey_id: 1,
            user_id: None,
            component_id: "q1".into(),
            status,
            submission_date: created,
            created_date: created,
            updated_date: None,
        }
    }

    fn approved(c: &CommentRow) -> bool {
        c.status == CommentStatus::Approved
    }

    #[tokio::test]
    async fn boundary_rows_are_excluded() {
        let source = InMemorySourceStore::new();
        source.put_comment(comment(1, CommentStatus::Approved, ts(2))).await;
        source.put_comment(comment(2, CommentStatus::Approved, ts(3))).await;
        source.put_comment(comment(3, CommentStatus::Rejected, ts(4))).await;

        let batch: ChangeBatch<CommentRow> =
            extract(&source, Package::Submission, ts(2), &approved).await.unwrap();
        assert_eq!(batch.from_window(), 1);
        assert_eq!(batch.into_iter().map(|c| c.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn backlog_rows_are_merged_once_and_cleared() {
        let source = InMemorySourceStore::new();
        source.put_comment(comment(1, CommentStatus::Approved, ts(1))).await;
        source.put_comment(comment(2, CommentStatus::Approved, ts(5))).await;
        source.put_comment(comment(3, CommentStatus::Rejected, ts(1))).await;

        let destination = InMemoryDestinationStore::new();
        let mut tx = destination.begin().await.unwrap();
        for id in [1, 2, 3, 99] {
            tx.defer_row(&DeferredRow {
                package: Package::Submission,
                kind: EntityKind::Comment,
                source_id: id,
                reason: "survey not mirrored".into(),
                deferred_at: ts(1),
            })
            .await
            .unwrap();
        }

        let batch: ChangeBatch<CommentRow> =
            extract_with_backlog(&source, &mut *tx, Package::Submission, ts(3), &approved)
                .await
                .unwrap();
        assert_eq!(batch.from_window(), 1);
        assert_eq!(batch.from_backlog(), 1);
        let mut ids = batch.into_iter().map(|c| c.id).collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        let remaining = tx
            .deferred_ids(Package::Submission, EntityKind::Comment)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }
}
