pub mod coordinator;
pub mod error;
pub mod pool;
pub mod reporter;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cdnrelay_cloud::CloudStorage;
use cdnrelay_storage::ScheduleStore;
use cdnrelay_transfer::{
    ByteSourceAdapter, DeletionRecord, Payload, QuotaReport, UploadMode, UploadResult,
    UploadTarget,
};
use futures::Stream;
use tracing::{error, info};

pub use coordinator::{UploadCoordinator, DEFAULT_UPLOAD_TIMEOUT};
pub use error::{RelayError, UploadFailure};
pub use pool::{parse_credentials, Account, AccountCredential, AccountPool};
pub use scheduler::{now_ms, DeletionScheduler, SweepReport};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upload_timeout: Duration,
    pub adapter: ByteSourceAdapter,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            adapter: ByteSourceAdapter::Memory,
        }
    }
}

/// The upload relay: account pool, upload coordination, scheduled deletion
/// and quota reporting behind one explicitly constructed handle.
pub struct Relay {
    pool: AccountPool,
    coordinator: UploadCoordinator,
    scheduler: DeletionScheduler,
    cloud: Arc<dyn CloudStorage>,
    store: Arc<dyn ScheduleStore>,
}

impl Relay {
    pub async fn initialize(
        credentials: &str,
        cloud: Arc<dyn CloudStorage>,
        store: Arc<dyn ScheduleStore>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let pool = AccountPool::initialize(cloud.as_ref(), credentials).await?;
        info!(
            accounts = pool.len(),
            store = store.backend(),
            "relay ready"
        );
        Ok(Self {
            pool,
            coordinator: UploadCoordinator::new(config.upload_timeout, config.adapter),
            scheduler: DeletionScheduler::new(store.clone()),
            cloud,
            store,
        })
    }

    /// Drains an inbound stream with the configured byte source adapter,
    /// giving up as soon as it grows past `max_bytes`.
    pub async fn materialize<S, E>(&self, source: S, max_bytes: u64) -> Result<Payload, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        self.coordinator
            .adapter()
            .materialize_within(source, max_bytes)
            .await
            .map_err(|err| RelayError::UploadFailed(err.into()))
    }

    pub async fn upload<S, E>(
        &self,
        name: &str,
        source: S,
        mode: UploadMode,
        target: &UploadTarget,
    ) -> Result<UploadResult, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        self.coordinator
            .upload(&self.pool, name, source, mode, target)
            .await
    }

    pub async fn upload_payload(
        &self,
        name: &str,
        payload: &Payload,
        mode: UploadMode,
        target: &UploadTarget,
    ) -> Result<UploadResult, RelayError> {
        self.coordinator
            .upload_payload(&self.pool, name, payload, mode, target)
            .await
    }

    pub async fn schedule_delete(
        &self,
        file_name: &str,
        minutes: i64,
    ) -> Result<DeletionRecord, RelayError> {
        self.scheduler.schedule(file_name, minutes).await
    }

    /// Number of records processed, including ones whose file was gone.
    pub async fn sweep_expired(&self, now_ms: i64) -> Result<usize, RelayError> {
        self.sweep_report(now_ms).await.map(|report| report.processed)
    }

    pub async fn sweep_report(&self, now_ms: i64) -> Result<SweepReport, RelayError> {
        self.scheduler.sweep(&self.pool, now_ms).await
    }

    pub fn account_count(&self) -> usize {
        self.pool.len()
    }

    pub fn account_emails(&self) -> Vec<String> {
        self.pool.emails()
    }

    pub async fn storage_info(&self) -> Vec<QuotaReport> {
        reporter::storage_info(&self.pool).await
    }

    /// Removes the first file named `name` found in the pool.
    pub async fn delete_file_by_name(&self, name: &str) -> Result<bool, RelayError> {
        let holder = self.pool.delete_by_name(name).await?;
        if let Some(account) = &holder {
            info!(file = %name, account = %account, "file deleted on request");
        }
        Ok(holder.is_some())
    }

    pub async fn file_name_from_url(&self, remote_url: &str) -> Result<String, RelayError> {
        Ok(self.cloud.describe(remote_url).await?.name)
    }

    pub fn pool(&self) -> &AccountPool {
        &self.pool
    }

    pub fn cloud(&self) -> &Arc<dyn CloudStorage> {
        &self.cloud
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Final sweep of everything already due, then closes the store.
    pub async fn cleanup(&self) {
        if let Err(err) = self.sweep_expired(now_ms()).await {
            error!(error = %err, "final sweep failed");
        }
        self.store.close().await;
        info!("cleanup completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdnrelay_cloud::{InMemoryCloud, Operation};
    use cdnrelay_storage::MemoryStore;
    use futures::stream;

    async fn relay(cloud: &InMemoryCloud) -> Relay {
        Relay::initialize(
            "a@example.com:pa;b@example.com:pb",
            Arc::new(cloud.clone()),
            Arc::new(MemoryStore::new()),
            RelayConfig::default(),
        )
        .await
        .expect("relay")
    }

    fn cloud() -> InMemoryCloud {
        InMemoryCloud::new()
            .with_account("a@example.com", "pa")
            .with_account("b@example.com", "pb")
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        stream::iter([Ok(Bytes::from_static(data))])
    }

    #[tokio::test]
    async fn upload_then_scheduled_sweep_removes_the_file() {
        let cloud = cloud();
        let relay = relay(&cloud).await;

        let result = relay
            .upload("1_1_2025_abc123.png", body(b"image"), UploadMode::Single, &UploadTarget::default())
            .await
            .expect("upload");
        assert_eq!(cloud.file_names("a@example.com"), vec!["1_1_2025_abc123.png"]);

        relay.schedule_delete(&result.name, 0).await.expect("schedule");
        assert_eq!(relay.sweep_expired(now_ms()).await.expect("sweep"), 1);
        assert!(cloud.file_names("a@example.com").is_empty());
        assert_eq!(cloud.calls_for("a@example.com", Operation::Delete), 1);
        assert_eq!(relay.store().get(&result.name).await.expect("get"), None);
    }

    #[tokio::test]
    async fn name_lookup_and_delete_by_name_follow_the_link() {
        let cloud = cloud();
        let url = cloud.seed_file("b@example.com", "clip.mp4", b"mp4").expect("seed");
        let relay = relay(&cloud).await;

        assert_eq!(relay.file_name_from_url(&url).await.expect("name"), "clip.mp4");
        assert!(relay.delete_file_by_name("clip.mp4").await.expect("delete"));
        assert!(!relay.delete_file_by_name("clip.mp4").await.expect("second delete"));

        let err = relay
            .file_name_from_url(&url)
            .await
            .expect_err("gone");
        assert_eq!(err.kind(), "file_not_found");
    }

    #[tokio::test]
    async fn account_listing_matches_successful_logins() {
        let cloud = cloud();
        let relay = Relay::initialize(
            "a@example.com:pa;b@example.com:nope",
            Arc::new(cloud.clone()),
            Arc::new(MemoryStore::new()),
            RelayConfig::default(),
        )
        .await
        .expect("relay");

        assert_eq!(relay.account_count(), 1);
        assert_eq!(relay.account_emails(), vec!["a@example.com"]);
        assert_eq!(relay.storage_info().await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_and_upload_on_one_account_take_turns() {
        let cloud = InMemoryCloud::new()
            .with_account("a@example.com", "pa")
            .with_operation_delay(std::time::Duration::from_millis(20));
        cloud.seed_file("a@example.com", "old.png", b"old");
        let relay = Relay::initialize(
            "a@example.com:pa",
            Arc::new(cloud.clone()),
            Arc::new(MemoryStore::new()),
            RelayConfig::default(),
        )
        .await
        .expect("relay");
        relay.schedule_delete("old.png", 0).await.expect("schedule");

        let target = UploadTarget::default();
        let (uploaded, swept) = tokio::join!(
            relay.upload("new.png", body(b"new"), UploadMode::Single, &target),
            relay.sweep_expired(now_ms()),
        );
        uploaded.expect("upload");
        assert_eq!(swept.expect("sweep"), 1);
        assert_eq!(cloud.file_names("a@example.com"), vec!["new.png"]);

        let mut calls = cloud.calls();
        assert_eq!(calls.len(), 4);
        calls.sort_by_key(|call| call.started);
        for pair in calls.windows(2) {
            assert!(
                pair[1].started >= pair[0].finished,
                "{:?} overlaps {:?}",
                pair[0].operation,
                pair[1].operation
            );
        }
    }

    #[tokio::test]
    async fn cleanup_drains_due_records_and_closes_the_store() {
        let cloud = cloud();
        cloud.seed_file("a@example.com", "old.png", b"x");
        let relay = relay(&cloud).await;
        relay.schedule_delete("old.png", 0).await.expect("schedule");

        relay.cleanup().await;
        assert!(cloud.file_names("a@example.com").is_empty());
    }
}
