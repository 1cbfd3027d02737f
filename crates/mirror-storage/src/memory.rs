//! In-memory stores for local development and unit tests.
//!
//! Transactions operate on a snapshot of the tables and publish it on commit
//! (last writer wins); dropping or rolling back a transaction discards it.
//! Armed fault points fail exactly once, then disarm.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::{
    ChangeTracked, CommentRow, CommentStatus, DeferredRow, EmailVerificationRow, EngagementRow,
    EngagementStatus, EntityKind, FeedbackRow, MirrorRow, NewMirrorRow, Package,
    RedactionCandidate, ReportSettingRow, RunCycle, SubmissionRow, SurveyRow, UserRow,
};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{
    DestinationStore, DestinationTx, SourceStore, SourceSweepTx, StoreError, StoreResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    SourceRead,
    InsertMirror(EntityKind),
    DeactivateMirror,
    MarkRunCycleSuccess,
    CommitDestination,
    RedactCommentText,
    RedactSubmissionField,
    SetEngagementStatus,
    DeleteEmailVerifications,
}

#[derive(Debug, Clone, Default)]
struct Faults(Arc<Mutex<HashSet<FaultPoint>>>);

impl Faults {
    async fn arm(&self, point: FaultPoint) {
        self.0.lock().await.insert(point);
    }

    async fn trip(&self, point: FaultPoint) -> StoreResult<()> {
        if self.0.lock().await.remove(&point) {
            return Err(StoreError::InjectedFault(format!("{point:?}")));
        }
        Ok(())
    }
}

fn changed_since<T: ChangeTracked + Clone>(
    table: &BTreeMap<i64, T>,
    since: DateTime<Utc>,
) -> Vec<T> {
    table
        .values()
        .filter(|row| row.changed_at() > since)
        .cloned()
        .collect()
}

fn by_ids<T: Clone>(table: &BTreeMap<i64, T>, ids: &[i64]) -> Vec<T> {
    ids.iter().filter_map(|id| table.get(id).cloned()).collect()
}

#[derive(Debug, Clone, Default)]
pub struct SourceTables {
    pub engagements: BTreeMap<i64, EngagementRow>,
    pub surveys: BTreeMap<i64, SurveyRow>,
    pub submissions: BTreeMap<i64, SubmissionRow>,
    pub comments: BTreeMap<i64, CommentRow>,
    pub users: BTreeMap<i64, UserRow>,
    pub email_verifications: BTreeMap<i64, EmailVerificationRow>,
    pub report_settings: BTreeMap<i64, ReportSettingRow>,
    pub feedback: BTreeMap<i64, FeedbackRow>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySourceStore {
    tables: Arc<Mutex<SourceTables>>,
    faults: Faults,
}

impl InMemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn arm_fault(&self, point: FaultPoint) {
        self.faults.arm(point).await;
    }

    /// Copy of every table (primarily for tests).
    pub async fn snapshot(&self) -> SourceTables {
        self.tables.lock().await.clone()
    }

    pub async fn put_engagement(&self, row: EngagementRow) {
        self.tables.lock().await.engagements.insert(row.id, row);
    }

    pub async fn put_survey(&self, row: SurveyRow) {
        self.tables.lock().await.surveys.insert(row.id, row);
    }

    pub async fn put_submission(&self, row: SubmissionRow) {
        self.tables.lock().await.submissions.insert(row.id, row);
    }

    pub async fn put_comment(&self, row: CommentRow) {
        self.tables.lock().await.comments.insert(row.id, row);
    }

    pub async fn put_user(&self, row: UserRow) {
        self.tables.lock().await.users.insert(row.id, row);
    }

    pub async fn put_email_verification(&self, row: EmailVerificationRow) {
        self.tables
            .lock()
            .await
            .email_verifications
            .insert(row.id, row);
    }

    pub async fn put_report_setting(&self, row: ReportSettingRow) {
        self.tables.lock().await.report_settings.insert(row.id, row);
    }

    pub async fn put_feedback(&self, row: FeedbackRow) {
        self.tables.lock().await.feedback.insert(row.id, row);
    }

    async fn read(&self) -> StoreResult<tokio::sync::MutexGuard<'_, SourceTables>> {
        self.faults.trip(FaultPoint::SourceRead).await?;
        Ok(self.tables.lock().await)
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn engagements_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<EngagementRow>> {
        Ok(changed_since(&self.read().await?.engagements, since))
    }

    async fn surveys_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SurveyRow>> {
        Ok(changed_since(&self.read().await?.surveys, since))
    }

    async fn submissions_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SubmissionRow>> {
        Ok(changed_since(&self.read().await?.submissions, since))
    }

    async fn comments_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<CommentRow>> {
        Ok(changed_since(&self.read().await?.comments, since))
    }

    async fn users_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<UserRow>> {
        Ok(changed_since(&self.read().await?.users, since))
    }

    async fn email_verifications_changed_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EmailVerificationRow>> {
        Ok(changed_since(&self.read().await?.email_verifications, since))
    }

    async fn report_settings_changed_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ReportSettingRow>> {
        Ok(changed_since(&self.read().await?.report_settings, since))
    }

    async fn feedback_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<FeedbackRow>> {
        Ok(changed_since(&self.read().await?.feedback, since))
    }

    async fn surveys_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<SurveyRow>> {
        Ok(by_ids(&self.read().await?.surveys, ids))
    }

    async fn submissions_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<SubmissionRow>> {
        Ok(by_ids(&self.read().await?.submissions, ids))
    }

    async fn comments_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<CommentRow>> {
        Ok(by_ids(&self.read().await?.comments, ids))
    }

    async fn report_settings_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<ReportSettingRow>> {
        Ok(by_ids(&self.read().await?.report_settings, ids))
    }

    async fn email_verifications_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<EmailVerificationRow>> {
        Ok(by_ids(&self.read().await?.email_verifications, ids))
    }

    async fn begin_sweep(&self) -> StoreResult<Box<dyn SourceSweepTx>> {
        let working = self.tables.lock().await.clone();
        Ok(Box::new(InMemorySweepTx {
            working,
            shared: Arc::clone(&self.tables),
            faults: self.faults.clone(),
        }))
    }
}

struct InMemorySweepTx {
    working: SourceTables,
    shared: Arc<Mutex<SourceTables>>,
    faults: Faults,
}

#[async_trait]
impl SourceSweepTx for InMemorySweepTx {
    async fn rejected_comments_on_closed_engagements(
        &mut self,
        ended_before: DateTime<Utc>,
    ) -> StoreResult<Vec<RedactionCandidate>> {
        let tables = &self.working;
        Ok(tables
            .comments
            .values()
            .filter(|c| c.status == CommentStatus::Rejected)
            .filter_map(|c| {
                let submission = tables.submissions.get(&c.submission_id)?;
                let engagement = tables.engagements.get(&submission.engagement_id)?;
                (engagement.status == EngagementStatus::Closed
                    && engagement.end_date < ended_before)
                    .then(|| RedactionCandidate {
                        comment_id: c.id,
                        submission_id: submission.id,
                        component_id: c.component_id.clone(),
                        text: c.text.clone(),
                        engagement_id: engagement.id,
                        engagement_end_date: engagement.end_date,
                    })
            })
            .collect())
    }

    async fn redact_comment_text(&mut self, comment_id: i64, text: &str) -> StoreResult<()> {
        self.faults.trip(FaultPoint::RedactCommentText).await?;
        let comment = self
            .working
            .comments
            .get_mut(&comment_id)
            .ok_or(StoreError::NotFound {
                what: "comment",
                id: comment_id,
            })?;
        comment.text = text.to_string();
        Ok(())
    }

    async fn redact_submission_field(
        &mut self,
        submission_id: i64,
        key: &str,
        text: &str,
    ) -> StoreResult<()> {
        self.faults.trip(FaultPoint::RedactSubmissionField).await?;
        let submission = self
            .working
            .submissions
            .get_mut(&submission_id)
            .ok_or(StoreError::NotFound {
                what: "submission",
                id: submission_id,
            })?;
        let Some(object) = submission.submission_json.as_object_mut() else {
            return Err(StoreError::Integrity(format!(
                "submission {submission_id} payload is not a JSON object"
            )));
        };
        object.insert(key.to_string(), JsonValue::String(text.to_string()));
        Ok(())
    }

    async fn engagements_with_status(
        &mut self,
        status: EngagementStatus,
    ) -> StoreResult<Vec<EngagementRow>> {
        Ok(self
            .working
            .engagements
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn set_engagement_status(
        &mut self,
        engagement_id: i64,
        status: EngagementStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.faults.trip(FaultPoint::SetEngagementStatus).await?;
        let engagement = self
            .working
            .engagements
            .get_mut(&engagement_id)
            .ok_or(StoreError::NotFound {
                what: "engagement",
                id: engagement_id,
            })?;
        engagement.status = status;
        engagement.updated_date = Some(at);
        if status == EngagementStatus::Published && engagement.published_date.is_none() {
            engagement.published_date = Some(at);
        }
        Ok(())
    }

    async fn email_verifications_created_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<EmailVerificationRow>> {
        Ok(self
            .working
            .email_verifications
            .values()
            .filter(|v| v.created_date < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_email_verifications(&mut self, ids: &[i64]) -> StoreResult<u64> {
        self.faults.trip(FaultPoint::DeleteEmailVerifications).await?;
        let mut deleted = 0;
        for id in ids {
            if self.working.email_verifications.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        *self.shared.lock().await = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DestinationTables {
    pub run_cycles: BTreeMap<i64, RunCycle>,
    pub mirror: BTreeMap<EntityKind, Vec<MirrorRow>>,
    pub deferred: BTreeMap<(Package, EntityKind, i64), DeferredRow>,
    last_key: i64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDestinationStore {
    tables: Arc<Mutex<DestinationTables>>,
    faults: Faults,
}

impl InMemoryDestinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn arm_fault(&self, point: FaultPoint) {
        self.faults.arm(point).await;
    }

    pub async fn snapshot(&self) -> DestinationTables {
        self.tables.lock().await.clone()
    }

    pub async fn rows(&self, kind: EntityKind) -> Vec<MirrorRow> {
        self.tables
            .lock()
            .await
            .mirror
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn active_rows(&self, kind: EntityKind, source_id: i64) -> Vec<MirrorRow> {
        self.rows(kind)
            .await
            .into_iter()
            .filter(|r| r.source_id == source_id && r.is_active)
            .collect()
    }

    pub async fn run_cycles(&self) -> Vec<RunCycle> {
        self.tables.lock().await.run_cycles.values().cloned().collect()
    }

    pub async fn deferred(&self) -> Vec<DeferredRow> {
        self.tables.lock().await.deferred.values().cloned().collect()
    }

    /// Writes a mirror row directly, bypassing the loader (for seeding anomalies).
    pub async fn put_mirror_row(&self, row: NewMirrorRow) -> i64 {
        let mut tables = self.tables.lock().await;
        tables.last_key += 1;
        let key = tables.last_key;
        tables
            .mirror
            .entry(row.kind())
            .or_default()
            .push(MirrorRow::from_new(key, row));
        key
    }
}

#[async_trait]
impl DestinationStore for InMemoryDestinationStore {
    async fn begin(&self) -> StoreResult<Box<dyn DestinationTx>> {
        let working = self.tables.lock().await.clone();
        Ok(Box::new(InMemoryDestinationTx {
            working,
            shared: Arc::clone(&self.tables),
            faults: self.faults.clone(),
        }))
    }
}

struct InMemoryDestinationTx {
    working: DestinationTables,
    shared: Arc<Mutex<DestinationTables>>,
    faults: Faults,
}

#[async_trait]
impl DestinationTx for InMemoryDestinationTx {
    async fn lock_run_cycles(&mut self) -> StoreResult<()> {
        Ok(())
    }

    async fn max_run_cycle_id(&mut self) -> StoreResult<Option<i64>> {
        Ok(self.working.run_cycles.keys().next_back().copied())
    }

    async fn insert_run_cycle(&mut self, cycle: &RunCycle) -> StoreResult<()> {
        if self.working.run_cycles.contains_key(&cycle.id) {
            return Err(StoreError::Integrity(format!(
                "run cycle {} already exists",
                cycle.id
            )));
        }
        self.working.run_cycles.insert(cycle.id, cycle.clone());
        Ok(())
    }

    async fn mark_run_cycle_success(
        &mut self,
        id: i64,
        package: Package,
        end_time: DateTime<Utc>,
        description: &str,
    ) -> StoreResult<u64> {
        self.faults.trip(FaultPoint::MarkRunCycleSuccess).await?;
        match self.working.run_cycles.get_mut(&id) {
            Some(cycle) if cycle.package_name == package.as_str() => {
                cycle.success = true;
                cycle.end_time = Some(end_time);
                cycle.description = description.to_string();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn max_successful_end_time(&mut self, package: Package) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .working
            .run_cycles
            .values()
            .filter(|c| c.success && c.package_name == package.as_str())
            .filter_map(|c| c.end_time)
            .max())
    }

    async fn run_cycles(&mut self, package: Option<Package>, limit: usize) -> StoreResult<Vec<RunCycle>> {
        Ok(self
            .working
            .run_cycles
            .values()
            .rev()
            .filter(|c| package.map_or(true, |p| c.package_name == p.as_str()))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_active_keys(&mut self, kind: EntityKind, source_id: i64) -> StoreResult<Vec<i64>> {
        Ok(self
            .working
            .mirror
            .get(&kind)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.source_id == source_id && r.is_active)
                    .map(|r| r.key)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_mirror(&mut self, row: &NewMirrorRow) -> StoreResult<i64> {
        self.faults.trip(FaultPoint::InsertMirror(row.kind())).await?;
        self.working.last_key += 1;
        let key = self.working.last_key;
        self.working
            .mirror
            .entry(row.kind())
            .or_default()
            .push(MirrorRow::from_new(key, row.clone()));
        Ok(key)
    }

    async fn deactivate_mirror(
        &mut self,
        kind: EntityKind,
        key: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.faults.trip(FaultPoint::DeactivateMirror).await?;
        let row = self
            .working
            .mirror
            .get_mut(&kind)
            .and_then(|rows| rows.iter_mut().find(|r| r.key == key))
            .ok_or(StoreError::NotFound {
                what: "mirror row",
                id: key,
            })?;
        row.is_active = false;
        row.updated_date = Some(at);
        Ok(())
    }

    async fn defer_row(&mut self, row: &DeferredRow) -> StoreResult<()> {
        self.working
            .deferred
            .insert((row.package, row.kind, row.source_id), row.clone());
        Ok(())
    }

    async fn deferred_ids(&mut self, package: Package, kind: EntityKind) -> StoreResult<Vec<i64>> {
        Ok(self
            .working
            .deferred
            .keys()
            .filter(|(p, k, _)| *p == package && *k == kind)
            .map(|(_, _, id)| *id)
            .collect())
    }

    async fn clear_deferred(
        &mut self,
        package: Package,
        kind: EntityKind,
        source_ids: &[i64],
    ) -> StoreResult<()> {
        for id in source_ids {
            self.working.deferred.remove(&(package, kind, *id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.faults.trip(FaultPoint::CommitDestination).await?;
        *self.shared.lock().await = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mirror_core::{MirrorPayload, UserDetailFacts};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).single().unwrap()
    }

    fn user(id: i64, created: DateTime<Utc>, updated: Option<DateTime<Utc>>) -> UserRow {
        UserRow {
            id,
            external_id: format!("ext-{id}"),
            display_name: None,
            created_date: created,
            updated_date: updated,
        }
    }

    fn user_detail(source_id: i64) -> NewMirrorRow {
        NewMirrorRow {
            source_id,
            is_active: true,
            runcycle_id: 1,
            created_date: ts(1),
            updated_date: None,
            payload: MirrorPayload::UserDetail(UserDetailFacts {
                external_id: format!("ext-{source_id}"),
                display_name: None,
            }),
        }
    }

    #[tokio::test]
    async fn changed_since_is_strictly_after_the_watermark() {
        let store = InMemorySourceStore::new();
        store.put_user(user(1, ts(1), None)).await;
        store.put_user(user(2, ts(1), Some(ts(5)))).await;
        store.put_user(user(3, ts(3), None)).await;

        let rows = store.users_changed_since(ts(3)).await.unwrap();
        assert_eq!(rows.iter().map(|u| u.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn destination_rollback_discards_writes() {
        let store = InMemoryDestinationStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_mirror(&user_detail(9)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.rows(EntityKind::UserDetail).await.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert_mirror(&user_detail(9)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.rows(EntityKind::UserDetail).await.len(), 1);
    }

    #[tokio::test]
    async fn armed_fault_fires_once() {
        let store = InMemoryDestinationStore::new();
        store
            .arm_fault(FaultPoint::InsertMirror(EntityKind::UserDetail))
            .await;
        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_mirror(&user_detail(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InjectedFault(_)));
        assert!(tx.insert_mirror(&user_detail(1)).await.is_ok());
    }

    #[tokio::test]
    async fn run_cycles_are_listed_newest_first() {
        let store = InMemoryDestinationStore::new();
        let mut tx = store.begin().await.unwrap();
        for id in 1..=3 {
            let package = if id == 2 { Package::Survey } else { Package::Engagement };
            tx.insert_run_cycle(&RunCycle::started(id, package, ts(id as u32)))
                .await
                .unwrap();
        }
        let cycles = tx.run_cycles(Some(Package::Engagement), 10).await.unwrap();
        assert_eq!(cycles.iter().map(|c| c.id).collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(tx.max_run_cycle_id().await.unwrap(), Some(3));
    }
}
