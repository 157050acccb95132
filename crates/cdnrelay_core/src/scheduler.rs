use std::sync::Arc;

use cdnrelay_storage::ScheduleStore;
use cdnrelay_transfer::DeletionRecord;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::pool::AccountPool;

const MS_PER_MINUTE: i64 = 60_000;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Outcome counts of one sweep. Every expired record lands in `processed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub deleted: usize,
    pub missing: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct DeletionScheduler {
    store: Arc<dyn ScheduleStore>,
}

impl DeletionScheduler {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }

    pub async fn schedule(&self, file_name: &str, minutes: i64) -> Result<DeletionRecord, RelayError> {
        self.schedule_at(file_name, minutes, now_ms()).await
    }

    /// Replaces any earlier expiry stored for `file_name`.
    pub async fn schedule_at(
        &self,
        file_name: &str,
        minutes: i64,
        now_ms: i64,
    ) -> Result<DeletionRecord, RelayError> {
        let record = DeletionRecord {
            file_name: file_name.to_string(),
            delete_at_ms: now_ms.saturating_add(minutes.saturating_mul(MS_PER_MINUTE)),
        };
        self.store.save(&record).await?;
        debug!(file = %file_name, delete_at_ms = record.delete_at_ms, "deletion scheduled");
        Ok(record)
    }

    /// Deletes every file due at `now_ms` and drops its record. A record is
    /// removed whatever happened remotely; nothing is retried.
    pub async fn sweep(&self, pool: &AccountPool, now_ms: i64) -> Result<SweepReport, RelayError> {
        let expired = self.store.find_expired(now_ms).await?;
        let mut report = SweepReport::default();

        for record in expired {
            match pool.delete_by_name(&record.file_name).await {
                Ok(Some(account)) => {
                    info!(file = %record.file_name, account = %account, "deleted expired file");
                    report.deleted += 1;
                }
                Ok(None) => {
                    let miss = RelayError::FileNotFoundOnSweep(record.file_name.clone());
                    warn!(error = %miss, "expired file already gone");
                    report.missing += 1;
                }
                Err(err) => {
                    error!(file = %record.file_name, error = %err, "failed to delete expired file");
                    report.failed += 1;
                }
            }

            if let Err(err) = self.store.delete(&record.file_name).await {
                error!(file = %record.file_name, error = %err, "failed to drop deletion record");
            }
            report.processed += 1;
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                deleted = report.deleted,
                missing = report.missing,
                failed = report.failed,
                "cleaned up expired files"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdnrelay_cloud::{InMemoryCloud, Operation};
    use cdnrelay_storage::{MemoryStore, SqliteStore};

    async fn setup(cloud: &InMemoryCloud) -> (AccountPool, Arc<dyn ScheduleStore>) {
        let pool = AccountPool::initialize(cloud, "a@example.com:pa;b@example.com:pb")
            .await
            .expect("pool");
        (pool, Arc::new(MemoryStore::new()))
    }

    fn cloud() -> InMemoryCloud {
        InMemoryCloud::new()
            .with_account("a@example.com", "pa")
            .with_account("b@example.com", "pb")
    }

    #[tokio::test]
    async fn immediate_expiry_deletes_once_and_clears_the_record() {
        let cloud = cloud();
        cloud.seed_file("b@example.com", "a.png", b"png");
        let (pool, store) = setup(&cloud).await;
        let scheduler = DeletionScheduler::new(store.clone());

        scheduler.schedule("a.png", 0).await.expect("schedule");
        let report = scheduler.sweep(&pool, now_ms()).await.expect("sweep");

        assert_eq!(report, SweepReport { processed: 1, deleted: 1, missing: 0, failed: 0 });
        assert_eq!(cloud.calls_for("b@example.com", Operation::Delete), 1);
        assert_eq!(cloud.calls_for("a@example.com", Operation::Delete), 0);
        assert!(cloud.file_names("b@example.com").is_empty());
        assert_eq!(store.get("a.png").await.expect("get"), None);
    }

    #[tokio::test]
    async fn missing_files_still_count_and_lose_their_record() {
        let cloud = cloud();
        let (pool, store) = setup(&cloud).await;
        let scheduler = DeletionScheduler::new(store.clone());

        scheduler.schedule_at("ghost.png", 1, 0).await.expect("schedule");
        let report = scheduler.sweep(&pool, 60_000).await.expect("sweep");

        assert_eq!(report.processed, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(store.get("ghost.png").await.expect("get"), None);
    }

    #[tokio::test]
    async fn records_not_yet_due_are_left_alone() {
        let cloud = cloud();
        cloud.seed_file("a@example.com", "later.png", b"x");
        let (pool, store) = setup(&cloud).await;
        let scheduler = DeletionScheduler::new(store.clone());

        scheduler.schedule_at("later.png", 10, 0).await.expect("schedule");
        let report = scheduler.sweep(&pool, 599_999).await.expect("sweep");

        assert_eq!(report, SweepReport::default());
        assert!(store.get("later.png").await.expect("get").is_some());
        assert_eq!(cloud.file_names("a@example.com"), vec!["later.png"]);
    }

    #[tokio::test]
    async fn one_failing_delete_does_not_stop_the_sweep() {
        let cloud = cloud();
        cloud.seed_file("a@example.com", "one.png", b"1");
        cloud.seed_file("a@example.com", "two.png", b"2");
        cloud.fail_deletes(true);
        let (pool, store) = setup(&cloud).await;
        let scheduler = DeletionScheduler::new(store.clone());

        scheduler.schedule_at("one.png", 0, 0).await.expect("schedule");
        scheduler.schedule_at("two.png", 0, 0).await.expect("schedule");
        let report = scheduler.sweep(&pool, 0).await.expect("sweep");

        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 2);
        assert!(store.find_expired(i64::MAX).await.expect("expired").is_empty());
        // The holder was found, so no other account was tried.
        assert_eq!(cloud.calls_for("b@example.com", Operation::List), 0);
    }

    #[tokio::test]
    async fn rescheduling_keeps_only_the_latest_expiry() {
        let store: Arc<dyn ScheduleStore> =
            Arc::new(SqliteStore::connect("sqlite::memory:").await.expect("sqlite"));
        let scheduler = DeletionScheduler::new(store.clone());

        scheduler.schedule_at("a.png", 5, 1_000).await.expect("first");
        scheduler.schedule_at("a.png", 30, 1_000).await.expect("second");

        let record = store.get("a.png").await.expect("get").expect("present");
        assert_eq!(record.delete_at_ms, 1_000 + 30 * 60_000);
        assert_eq!(store.find_expired(i64::MAX).await.expect("all").len(), 1);
    }
}
