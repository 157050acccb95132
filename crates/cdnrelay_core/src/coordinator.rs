use std::time::Duration;

use bytes::Bytes;
use cdnrelay_cloud::CloudSession;
use cdnrelay_transfer::{
    mime_for_name, ByteSourceAdapter, Payload, TransferError, UploadMode, UploadResult,
    UploadTarget,
};
use futures::Stream;
use tracing::{error, info};

use crate::error::{RelayError, UploadFailure};
use crate::pool::AccountPool;

pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

impl From<TransferError> for UploadFailure {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::EmptyPayload => UploadFailure::EmptyPayload,
            TransferError::TooLarge { limit } => UploadFailure::TooLarge(limit),
            other => UploadFailure::Source(other.to_string()),
        }
    }
}

/// Runs one upload against the pool: select, lock, transfer, link.
#[derive(Debug, Clone)]
pub struct UploadCoordinator {
    timeout: Duration,
    adapter: ByteSourceAdapter,
}

impl Default for UploadCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_TIMEOUT, ByteSourceAdapter::Memory)
    }
}

impl UploadCoordinator {
    pub fn new(timeout: Duration, adapter: ByteSourceAdapter) -> Self {
        Self { timeout, adapter }
    }

    pub fn adapter(&self) -> &ByteSourceAdapter {
        &self.adapter
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drains `source` while holding the selected account, then uploads it.
    pub async fn upload<S, E>(
        &self,
        pool: &AccountPool,
        name: &str,
        source: S,
        mode: UploadMode,
        target: &UploadTarget,
    ) -> Result<UploadResult, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let account = pool.select(mode, target)?;
        let session = account.lock().await;
        let outcome = match self.adapter.materialize(source).await {
            Ok(payload) => self.transfer(&**session, name, &payload).await,
            Err(err) => Err(err.into()),
        };
        drop(session);
        finish(account.email(), name, outcome)
    }

    /// Uploads an already materialized payload.
    pub async fn upload_payload(
        &self,
        pool: &AccountPool,
        name: &str,
        payload: &Payload,
        mode: UploadMode,
        target: &UploadTarget,
    ) -> Result<UploadResult, RelayError> {
        let account = pool.select(mode, target)?;
        let session = account.lock().await;
        let outcome = self.transfer(&**session, name, payload).await;
        drop(session);
        finish(account.email(), name, outcome)
    }

    async fn transfer(
        &self,
        session: &dyn CloudSession,
        name: &str,
        payload: &Payload,
    ) -> Result<UploadResult, UploadFailure> {
        if payload.is_empty() {
            return Err(UploadFailure::EmptyPayload);
        }
        let mime_type = mime_for_name(name).to_string();
        let body = payload.stream().await?;

        let completed = tokio::time::timeout(self.timeout, session.upload(name, payload.len(), body))
            .await
            .map_err(|_| UploadFailure::Timeout(self.timeout))?
            .map_err(|err| UploadFailure::Capability(err.to_string()))?;

        let remote_url = session
            .link(&completed)
            .await
            .map_err(|err| UploadFailure::LinkGeneration(err.to_string()))?;

        Ok(UploadResult {
            name: completed.name,
            size: completed.size,
            mime_type,
            remote_url,
        })
    }
}

fn finish(
    account: &str,
    name: &str,
    outcome: Result<UploadResult, UploadFailure>,
) -> Result<UploadResult, RelayError> {
    match outcome {
        Ok(result) => {
            info!(account = %account, file = %result.name, size = result.size, "upload complete");
            Ok(result)
        }
        Err(failure) => {
            error!(account = %account, file = %name, error = %failure, "upload failed");
            Err(failure.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cdnrelay_cloud::{CloudStorage, InMemoryCloud, Operation};
    use futures::stream;
    use futures::TryStreamExt;

    const EMAILS: &str = "a@example.com:pa;b@example.com:pb;c@example.com:pc";

    fn cloud() -> InMemoryCloud {
        InMemoryCloud::new()
            .with_account("a@example.com", "pa")
            .with_account("b@example.com", "pb")
            .with_account("c@example.com", "pc")
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        stream::iter(data.chunks(3).map(|chunk| Ok(Bytes::from_static(chunk))))
    }

    #[tokio::test]
    async fn uploaded_file_resolves_to_the_same_length() {
        let cloud = cloud();
        let pool = AccountPool::initialize(&cloud, EMAILS).await.expect("pool");
        let coordinator = UploadCoordinator::default();

        let result = coordinator
            .upload(&pool, "photo.png", body(b"0123456789"), UploadMode::Single, &UploadTarget::default())
            .await
            .expect("upload");
        assert_eq!(result.size, 10);
        assert_eq!(result.mime_type, "image/png");

        let described = cloud.describe(&result.remote_url).await.expect("describe");
        assert_eq!(described.size, 10);
        let (_, stream) = cloud.download(&result.remote_url).await.expect("download");
        let chunks: Vec<Bytes> = stream.try_collect().await.expect("read");
        assert_eq!(chunks.concat(), b"0123456789");
    }

    #[tokio::test]
    async fn empty_payloads_never_reach_the_capability() {
        let cloud = cloud();
        let pool = AccountPool::initialize(&cloud, EMAILS).await.expect("pool");
        let coordinator = UploadCoordinator::default();

        for name in ["a.png", "b", ""] {
            let err = coordinator
                .upload(&pool, name, body(b""), UploadMode::Single, &UploadTarget::default())
                .await
                .expect_err("empty");
            assert!(matches!(err, RelayError::UploadFailed(UploadFailure::EmptyPayload)));
        }
        let err = coordinator
            .upload_payload(
                &pool,
                "a.png",
                &Payload::from_bytes(Bytes::new()),
                UploadMode::Single,
                &UploadTarget::default(),
            )
            .await
            .expect_err("empty");
        assert!(matches!(err, RelayError::UploadFailed(UploadFailure::EmptyPayload)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn single_mode_touches_every_account_once_per_cycle() {
        let cloud = cloud();
        let pool = AccountPool::initialize(&cloud, EMAILS).await.expect("pool");
        let coordinator = UploadCoordinator::default();

        // Hints are ignored in single mode.
        let hint = UploadTarget::account("c@example.com");
        for i in 0..3 {
            coordinator
                .upload(&pool, &format!("{i}.txt"), body(b"x"), UploadMode::Single, &hint)
                .await
                .expect("upload");
        }

        let order: Vec<_> = cloud
            .calls()
            .into_iter()
            .filter(|call| call.operation == Operation::Upload)
            .map(|call| call.account)
            .collect();
        assert_eq!(order, vec!["a@example.com", "b@example.com", "c@example.com"]);
    }

    #[tokio::test]
    async fn unknown_hint_fails_before_any_capability_call() {
        let cloud = cloud();
        let pool = AccountPool::initialize(&cloud, EMAILS).await.expect("pool");
        let coordinator = UploadCoordinator::default();

        let err = coordinator
            .upload(
                &pool,
                "a.png",
                body(b"data"),
                UploadMode::Dual,
                &UploadTarget::account("nobody@example.com"),
            )
            .await
            .expect_err("unknown account");
        assert!(matches!(err, RelayError::AccountNotFound(_)));
        assert!(err.is_client_error());
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn concurrent_uploads_to_one_account_are_serialized() {
        let cloud = cloud().with_operation_delay(Duration::from_millis(20));
        let pool = Arc::new(AccountPool::initialize(&cloud, EMAILS).await.expect("pool"));
        let coordinator = UploadCoordinator::default();
        let target = UploadTarget::account("b@example.com");

        let uploads = (0..4).map(|i| {
            let pool = pool.clone();
            let coordinator = coordinator.clone();
            let target = target.clone();
            async move {
                coordinator
                    .upload(&pool, &format!("{i}.bin"), body(b"payload"), UploadMode::Dual, &target)
                    .await
            }
        });
        for result in futures::future::join_all(uploads).await {
            result.expect("upload");
        }

        let mut calls: Vec<_> = cloud
            .calls()
            .into_iter()
            .filter(|call| call.account == "b@example.com")
            .collect();
        assert_eq!(calls.len(), 8);
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
    async fn slow_transfers_time_out_and_release_the_account() {
        let cloud = cloud().with_operation_delay(Duration::from_millis(200));
        let pool = AccountPool::initialize(&cloud, "a@example.com:pa").await.expect("pool");
        let coordinator = UploadCoordinator::new(Duration::from_millis(20), ByteSourceAdapter::Memory);

        let err = coordinator
            .upload(&pool, "a.png", body(b"data"), UploadMode::Single, &UploadTarget::default())
            .await
            .expect_err("timeout");
        assert!(matches!(err, RelayError::UploadFailed(UploadFailure::Timeout(_))));

        let account = pool.select_round_robin();
        assert!(tokio::time::timeout(Duration::from_millis(50), account.lock())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn link_failure_fails_the_whole_upload() {
        let cloud = cloud();
        cloud.fail_links(true);
        let pool = AccountPool::initialize(&cloud, EMAILS).await.expect("pool");

        let err = UploadCoordinator::default()
            .upload(&pool, "a.png", body(b"data"), UploadMode::Single, &UploadTarget::default())
            .await
            .expect_err("link failure");
        assert_eq!(err.kind(), "link_generation_failed");
        assert!(err.to_string().starts_with("Upload failed: "));
    }

    #[tokio::test]
    async fn spooled_payloads_upload_like_buffered_ones() {
        let dir = std::env::temp_dir().join(format!("cdnrelay-coord-{}", std::process::id()));
        let cloud = cloud();
        let pool = AccountPool::initialize(&cloud, EMAILS).await.expect("pool");
        let coordinator = UploadCoordinator::new(DEFAULT_UPLOAD_TIMEOUT, ByteSourceAdapter::spool(&dir));

        let result = coordinator
            .upload(&pool, "doc.pdf", body(b"%PDF-1.7 body"), UploadMode::Single, &UploadTarget::default())
            .await
            .expect("upload");
        assert_eq!(result.size, 13);
        assert_eq!(result.mime_type, "application/pdf");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
