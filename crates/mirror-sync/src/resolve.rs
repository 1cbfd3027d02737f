//! Maps a parent's source id to the destination key of its active version.

use std::collections::HashMap;

use mirror_core::EntityKind;
use mirror_storage::{DestinationTx, StoreResult};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Found(i64),
    NotFound,
}

impl Resolution {
    pub fn key(self) -> Option<i64> {
        match self {
            Resolution::Found(key) => Some(key),
            Resolution::NotFound => None,
        }
    }
}

/// Per-stage lookup cache. A stage never writes the kinds it resolves, so
/// entries stay valid for the life of the stage transaction.
#[derive(Debug, Default)]
pub struct NaturalKeyResolver {
    cache: HashMap<(EntityKind, i64), i64>,
    anomalies: usize,
}

impl NaturalKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(
        &mut self,
        tx: &mut dyn DestinationTx,
        kind: EntityKind,
        source_id: i64,
    ) -> StoreResult<Resolution> {
        if let Some(key) = self.cache.get(&(kind, source_id)) {
            return Ok(Resolution::Found(*key));
        }
        let keys = tx.find_active_keys(kind, source_id).await?;
        let key = match keys.as_slice() {
            [] => return Ok(Resolution::NotFound),
            [key] => *key,
            many => {
                self.anomalies += 1;
                let newest = many.iter().copied().max().unwrap_or_default();
                warn!(
                    kind = %kind,
                    source_id,
                    active_rows = many.len(),
                    chosen_key = newest,
                    "multiple active mirror rows; resolving to the newest"
                );
                newest
            }
        };
        self.cache.insert((kind, source_id), key);
        Ok(Resolution::Found(key))
    }

    /// Lookups that hit more than one active row.
    pub fn anomalies(&self) -> usize {
        self.anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mirror_core::{EngagementFacts, EngagementStatus, MirrorPayload, NewMirrorRow};
    use mirror_storage::{DestinationStore, InMemoryDestinationStore};

    fn engagement(source_id: i64) -> NewMirrorRow {
        let now = Utc::now();
        NewMirrorRow {
            source_id,
            is_active: true,
            runcycle_id: 1,
            created_date: now,
            updated_date: None,
            payload: MirrorPayload::Engagement(EngagementFacts {
                name: format!("engagement {source_id}"),
                status: EngagementStatus::Published,
                start_date: now,
                end_date: now,
                published_date: None,
                tenant_id: None,
            }),
        }
    }

    #[tokio::test]
    async fn resolves_single_active_row() {
        let store = InMemoryDestinationStore::new();
        let key = store.put_mirror_row(engagement(7)).await;
        let mut tx = store.begin().await.unwrap();
        let mut resolver = NaturalKeyResolver::new();

        assert_eq!(
            resolver.resolve(&mut *tx, EntityKind::Engagement, 7).await.unwrap(),
            Resolution::Found(key)
        );
        assert_eq!(
            resolver.resolve(&mut *tx, EntityKind::Engagement, 8).await.unwrap(),
            Resolution::NotFound
        );
        assert_eq!(resolver.anomalies(), 0);
    }

    #[tokio::test]
    async fn multiple_active_rows_resolve_to_newest_and_count_an_anomaly() {
        let store = InMemoryDestinationStore::new();
        store.put_mirror_row(engagement(7)).await;
        let newest = store.put_mirror_row(engagement(7)).await;
        let mut tx = store.begin().await.unwrap();
        let mut resolver = NaturalKeyResolver::new();

        let resolution = resolver.resolve(&mut *tx, EntityKind::Engagement, 7).await.unwrap();
        assert_eq!(resolution.key(), Some(newest));
        assert_eq!(resolver.anomalies(), 1);
    }
}
