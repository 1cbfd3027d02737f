//! Slowly-changing-dimension loader.

use chrono::{DateTime, Utc};
use mirror_core::{EntityKind, NewMirrorRow};
use mirror_storage::{DestinationTx, StoreResult};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Every extracted row becomes a new destination row.
    AppendOnly,
    /// At most one active row per source id; prior versions are deactivated.
    Versioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Appended { key: i64 },
    Versioned { key: i64, superseded: Option<i64> },
    /// More than one active row existed; the new row was inserted without
    /// deactivating any of them.
    Anomaly { key: i64, active_rows: usize },
}

impl LoadStrategy {
    pub fn for_kind(kind: EntityKind) -> Self {
        if kind.is_versioned() {
            LoadStrategy::Versioned
        } else {
            LoadStrategy::AppendOnly
        }
    }
}

impl LoadOutcome {
    pub fn key(&self) -> i64 {
        match self {
            LoadOutcome::Appended { key }
            | LoadOutcome::Versioned { key, .. }
            | LoadOutcome::Anomaly { key, .. } => *key,
        }
    }
}

pub struct ScdLoader;

impl ScdLoader {
    pub async fn load(
        tx: &mut dyn DestinationTx,
        strategy: LoadStrategy,
        row: NewMirrorRow,
        now: DateTime<Utc>,
    ) -> StoreResult<LoadOutcome> {
        match strategy {
            LoadStrategy::AppendOnly => Self::append(tx, row).await,
            LoadStrategy::Versioned => Self::upsert_version(tx, row, now).await,
        }
    }

    pub async fn append(tx: &mut dyn DestinationTx, row: NewMirrorRow) -> StoreResult<LoadOutcome> {
        let key = tx.insert_mirror(&row).await?;
        Ok(LoadOutcome::Appended { key })
    }

    /// Deactivates the current active version (stamping `now` as its
    /// `updated_date`) and inserts `row` as the new active one.
    pub async fn upsert_version(
        tx: &mut dyn DestinationTx,
        mut row: NewMirrorRow,
        now: DateTime<Utc>,
    ) -> StoreResult<LoadOutcome> {
        let kind = row.kind();
        row.is_active = true;
        let active = tx.find_active_keys(kind, row.source_id).await?;
        match active.as_slice() {
            [] => {
                let key = tx.insert_mirror(&row).await?;
                Ok(LoadOutcome::Versioned {
                    key,
                    superseded: None,
                })
            }
            [previous] => {
                tx.deactivate_mirror(kind, *previous, now).await?;
                let key = tx.insert_mirror(&row).await?;
                Ok(LoadOutcome::Versioned {
                    key,
                    superseded: Some(*previous),
                })
            }
            many => {
                warn!(
                    kind = %kind,
                    source_id = row.source_id,
                    active_rows = many.len(),
                    "multiple active versions; inserting without deactivation"
                );
                let key = tx.insert_mirror(&row).await?;
                Ok(LoadOutcome::Anomaly {
                    key,
                    active_rows: many.len(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{EntityKind, MirrorPayload, SurveyFacts};
    use mirror_storage::{DestinationStore, InMemoryDestinationStore};

    fn survey(source_id: i64, name: &str) -> NewMirrorRow {
        NewMirrorRow {
            source_id,
            is_active: true,
            runcycle_id: 1,
            created_date: Utc::now(),
            updated_date: None,
            payload: MirrorPayload::Survey(SurveyFacts {
                name: name.to_string(),
                engagement_key: None,
                is_hidden: false,
            }),
        }
    }

    #[tokio::test]
    async fn new_version_supersedes_the_active_one() {
        let store = InMemoryDestinationStore::new();
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();

        let first = ScdLoader::upsert_version(&mut *tx, survey(4, "v1"), now).await.unwrap();
        assert_eq!(first, LoadOutcome::Versioned { key: first.key(), superseded: None });

        let second = ScdLoader::upsert_version(&mut *tx, survey(4, "v2"), now).await.unwrap();
        assert_eq!(
            second,
            LoadOutcome::Versioned {
                key: second.key(),
                superseded: Some(first.key())
            }
        );
        tx.commit().await.unwrap();

        let rows = store.rows(EntityKind::Survey).await;
        assert_eq!(rows.len(), 2);
        let active = store.active_rows(EntityKind::Survey, 4).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, second.key());
        let retired = rows.iter().find(|r| r.key == first.key()).unwrap();
        assert!(!retired.is_active);
        assert_eq!(retired.updated_date, Some(now));
    }

    #[tokio::test]
    async fn ambiguous_history_is_left_alone() {
        let store = InMemoryDestinationStore::new();
        store.put_mirror_row(survey(4, "a")).await;
        store.put_mirror_row(survey(4, "b")).await;

        let mut tx = store.begin().await.unwrap();
        let outcome = ScdLoader::upsert_version(&mut *tx, survey(4, "c"), Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(outcome, LoadOutcome::Anomaly { active_rows: 2, .. }));
        assert_eq!(store.active_rows(EntityKind::Survey, 4).await.len(), 3);
    }

    #[tokio::test]
    async fn append_only_never_touches_existing_rows() {
        let store = InMemoryDestinationStore::new();
        let mut tx = store.begin().await.unwrap();
        ScdLoader::load(&mut *tx, LoadStrategy::AppendOnly, survey(1, "x"), Utc::now())
            .await
            .unwrap();
        ScdLoader::load(&mut *tx, LoadStrategy::AppendOnly, survey(1, "x"), Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.active_rows(EntityKind::Survey, 1).await.len(), 2);
    }

    #[test]
    fn strategy_follows_the_kind() {
        assert_eq!(LoadStrategy::for_kind(EntityKind::ReportSetting), LoadStrategy::Versioned);
        assert_eq!(LoadStrategy::for_kind(EntityKind::Comment), LoadStrategy::AppendOnly);
        assert_eq!(LoadStrategy::for_kind(EntityKind::Feedback), LoadStrategy::AppendOnly);
    }
}
