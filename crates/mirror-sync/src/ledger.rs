//! Run-cycle ledger: one row per pipeline attempt, and the source of every
//! package's watermark.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mirror_core::{sentinel_epoch, Package, RunCycle};
use mirror_storage::{DestinationStore, DestinationTx, StoreError, StoreResult};
use tracing::{info, warn};

/// How far back `lingering_failures` looks.
const LINGERING_SCAN: usize = 100;

#[derive(Clone)]
pub struct RunCycleLedger {
    store: Arc<dyn DestinationStore>,
}

impl RunCycleLedger {
    pub fn new(store: Arc<dyn DestinationStore>) -> Self {
        Self { store }
    }

    /// Records a new unsuccessful cycle and returns its id.
    ///
    /// Allocation runs in its own transaction so the attempt stays visible
    /// even when the stage that follows is rolled back.
    pub async fn begin(&self, package: Package) -> StoreResult<i64> {
        let mut tx = self.store.begin().await?;
        match allocate(&mut *tx, package).await {
            Ok(id) => {
                tx.commit().await?;
                info!(package = %package, run_id = id, "run cycle started");
                Ok(id)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(package = %package, error = %rollback_err, "rollback after failed run-cycle allocation failed");
                }
                Err(err)
            }
        }
    }

    /// Greatest `end_time` among successful cycles, or 1900-01-01.
    pub async fn last_successful_watermark(
        &self,
        tx: &mut dyn DestinationTx,
        package: Package,
    ) -> StoreResult<DateTime<Utc>> {
        Ok(tx
            .max_successful_end_time(package)
            .await?
            .unwrap_or_else(sentinel_epoch))
    }

    /// Marks the cycle successful inside the caller's transaction.
    ///
    /// `end_time` never moves behind the package's current watermark, so the
    /// sequence of committed watermarks is non-decreasing even under clock
    /// skew. Returns the recorded `end_time`.
    pub async fn commit_success(
        &self,
        tx: &mut dyn DestinationTx,
        run_id: i64,
        package: Package,
        description: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let watermark = self.last_successful_watermark(tx, package).await?;
        let end_time = now.max(watermark);
        let updated = tx
            .mark_run_cycle_success(run_id, package, end_time, description)
            .await?;
        if updated != 1 {
            return Err(StoreError::Integrity(format!(
                "run cycle {run_id} for package {package} not found"
            )));
        }
        Ok(end_time)
    }

    /// Earlier cycles of `package` that never committed, newest first.
    pub async fn lingering_failures(&self, package: Package) -> StoreResult<Vec<RunCycle>> {
        let cycles = self.read(Some(package), LINGERING_SCAN).await?;
        Ok(cycles.into_iter().filter(|c| !c.success).collect())
    }

    pub async fn recent_cycles(
        &self,
        package: Option<Package>,
        limit: usize,
    ) -> StoreResult<Vec<RunCycle>> {
        self.read(package, limit).await
    }

    async fn read(&self, package: Option<Package>, limit: usize) -> StoreResult<Vec<RunCycle>> {
        let mut tx = self.store.begin().await?;
        let result = tx.run_cycles(package, limit).await;
        tx.rollback().await?;
        result
    }
}

async fn allocate(tx: &mut dyn DestinationTx, package: Package) -> StoreResult<i64> {
    tx.lock_run_cycles().await?;
    let id = tx.max_run_cycle_id().await?.unwrap_or(0) + 1;
    tx.insert_run_cycle(&RunCycle::started(id, package, Utc::now()))
        .await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mirror_storage::{FaultPoint, InMemoryDestinationStore};

    fn ledger() -> (InMemoryDestinationStore, RunCycleLedger) {
        let store = InMemoryDestinationStore::new();
        let ledger = RunCycleLedger::new(Arc::new(store.clone()));
        (store, ledger)
    }

    #[tokio::test]
    async fn ids_are_allocated_sequentially_across_packages() {
        let (store, ledger) = ledger();
        assert_eq!(ledger.begin(Package::Engagement).await.unwrap(), 1);
        assert_eq!(ledger.begin(Package::Survey).await.unwrap(), 2);
        assert_eq!(ledger.begin(Package::Engagement).await.unwrap(), 3);

        let cycles = store.run_cycles().await;
        assert_eq!(cycles.len(), 3);
        assert!(cycles.iter().all(|c| !c.success && c.end_time.is_none()));
    }

    #[tokio::test]
    async fn watermark_defaults_to_sentinel() {
        let (store, ledger) = ledger();
        let mut tx = store.begin().await.unwrap();
        let watermark = ledger
            .last_successful_watermark(&mut *tx, Package::User)
            .await
            .unwrap();
        assert_eq!(watermark, sentinel_epoch());
    }

    #[tokio::test]
    async fn commit_success_never_regresses_the_watermark() {
        let (store, ledger) = ledger();
        let now = Utc::now();

        let first = ledger.begin(Package::Survey).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let recorded = ledger
            .commit_success(&mut *tx, first, Package::Survey, "first", now)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(recorded, now);

        let second = ledger.begin(Package::Survey).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let skewed = now - Duration::minutes(10);
        let recorded = ledger
            .commit_success(&mut *tx, second, Package::Survey, "skewed clock", skewed)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(recorded, now);
    }

    #[tokio::test]
    async fn commit_success_rejects_unknown_cycle() {
        let (store, ledger) = ledger();
        let mut tx = store.begin().await.unwrap();
        let err = ledger
            .commit_success(&mut *tx, 42, Package::User, "", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn failed_allocation_leaves_no_row() {
        let (store, ledger) = ledger();
        store.arm_fault(FaultPoint::CommitDestination).await;
        assert!(ledger.begin(Package::User).await.is_err());
        assert!(store.run_cycles().await.is_empty());
        assert_eq!(ledger.begin(Package::User).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lingering_failures_lists_only_unsuccessful_cycles() {
        let (store, ledger) = ledger();
        let failed = ledger.begin(Package::User).await.unwrap();
        let ok = ledger.begin(Package::User).await.unwrap();
        ledger.begin(Package::Survey).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        ledger
            .commit_success(&mut *tx, ok, Package::User, "", Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let lingering = ledger.lingering_failures(Package::User).await.unwrap();
        assert_eq!(lingering.iter().map(|c| c.id).collect::<Vec<_>>(), vec![failed]);

        let recent = ledger.recent_cycles(None, 2).await.unwrap();
        assert_eq!(recent.iter().map(|c| c.id).collect::<Vec<_>>(), vec![3, 2]);
    }
}
