use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use cdnrelay_transfer::{mime_for_name, PayloadStream};
use futures::stream::{self, StreamExt};
use tracing::info;
use uuid::Uuid;

use crate::capability::{
    CloudError, CloudSession, CloudStorage, CompletedUpload, LinkedFile, PublicLink, Quota,
    RemoteFile,
};

const LINK_PREFIX: &str = "memory://file/";
const DEFAULT_QUOTA: u64 = 20 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Link,
    List,
    Delete,
    Quota,
}

/// One observed call against an account session.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub account: String,
    pub operation: Operation,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Clone)]
struct StoredObject {
    handle: String,
    key: String,
    name: String,
    data: Bytes,
}

#[derive(Debug)]
struct MemoryAccount {
    credential: String,
    files: Vec<StoredObject>,
    quota_total: u64,
    quota_fails: bool,
}

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<String, MemoryAccount>,
    calls: Vec<CallRecord>,
    login_attempts: usize,
    fail_links: bool,
    fail_deletes: bool,
    operation_delay: Duration,
}

/// Process-local provider. Records every session call so tests can check
/// ordering, and exposes switches for link, delete and quota failures.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCloud {
    state: Arc<Mutex<State>>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, email: &str, credential: &str) -> Self {
        self.lock().accounts.insert(
            email.to_string(),
            MemoryAccount {
                credential: credential.to_string(),
                files: Vec::new(),
                quota_total: DEFAULT_QUOTA,
                quota_fails: false,
            },
        );
        self
    }

    pub fn with_quota(self, email: &str, total: u64) -> Self {
        if let Some(account) = self.lock().accounts.get_mut(email) {
            account.quota_total = total;
        }
        self
    }

    /// Every session call sleeps this long before touching state.
    pub fn with_operation_delay(self, delay: Duration) -> Self {
        self.lock().operation_delay = delay;
        self
    }

    pub fn fail_links(&self, fail: bool) {
        self.lock().fail_links = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    pub fn fail_quota(&self, email: &str) {
        if let Some(account) = self.lock().accounts.get_mut(email) {
            account.quota_fails = true;
        }
    }

    /// Places a file directly into an account, bypassing sessions.
    pub fn seed_file(&self, email: &str, name: &str, data: &[u8]) -> Option<String> {
        let mut state = self.lock();
        let account = state.accounts.get_mut(email)?;
        let object = new_object(name, Bytes::copy_from_slice(data));
        let url = object_link(&object).to_url(LINK_PREFIX);
        account.files.push(object);
        Some(url)
    }

    pub fn file_names(&self, email: &str) -> Vec<String> {
        self.lock()
            .accounts
            .get(email)
            .map(|account| account.files.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, email: &str, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.account == email && call.operation == operation)
            .count()
    }

    pub fn login_attempts(&self) -> usize {
        self.lock().login_attempts
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, remote_url: &str) -> Result<StoredObject, CloudError> {
        let link = PublicLink::parse(LINK_PREFIX, remote_url)?;
        self.lock()
            .accounts
            .values()
            .flat_map(|account| account.files.iter())
            .find(|object| object.handle == link.handle && object.key == link.key)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(remote_url.to_string()))
    }
}

fn new_object(name: &str, data: Bytes) -> StoredObject {
    StoredObject {
        handle: Uuid::new_v4().simple().to_string(),
        key: Uuid::new_v4().simple().to_string()[..16].to_string(),
        name: name.to_string(),
        data,
    }
}

fn object_link(object: &StoredObject) -> PublicLink {
    PublicLink {
        handle: object.handle.clone(),
        key: object.key.clone(),
    }
}

fn linked_file(object: &StoredObject) -> LinkedFile {
    LinkedFile {
        name: object.name.clone(),
        size: object.data.len() as u64,
        mime_type: mime_for_name(&object.name).to_string(),
    }
}

#[async_trait]
impl CloudStorage for InMemoryCloud {
    async fn login(
        &self,
        email: &str,
        credential: &str,
    ) -> Result<Box<dyn CloudSession>, CloudError> {
        let mut state = self.lock();
        state.login_attempts += 1;
        match state.accounts.get(email) {
            Some(account) if account.credential == credential => {
                info!(account = %email, "in-memory session opened");
                Ok(Box::new(InMemorySession {
                    email: email.to_string(),
                    cloud: self.clone(),
                }))
            }
            _ => Err(CloudError::LoginRejected(email.to_string())),
        }
    }

    async fn describe(&self, remote_url: &str) -> Result<LinkedFile, CloudError> {
        self.find(remote_url).map(|object| linked_file(&object))
    }

    async fn download(&self, remote_url: &str) -> Result<(LinkedFile, PayloadStream), CloudError> {
        let object = self.find(remote_url)?;
        let data = object.data.clone();
        Ok((linked_file(&object), stream::once(async move { Ok(data) }).boxed()))
    }

    fn link_prefix(&self) -> &str {
        LINK_PREFIX
    }
}

struct InMemorySession {
    email: String,
    cloud: InMemoryCloud,
}

impl InMemorySession {
    async fn begin(&self) -> Instant {
        let started = Instant::now();
        let delay = self.cloud.lock().operation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        started
    }

    fn finish(&self, state: &mut State, operation: Operation, started: Instant) {
        state.calls.push(CallRecord {
            account: self.email.clone(),
            operation,
            started,
            finished: Instant::now(),
        });
    }

    fn account<'a>(&self, state: &'a mut State) -> Result<&'a mut MemoryAccount, CloudError> {
        state
            .accounts
            .get_mut(&self.email)
            .ok_or_else(|| CloudError::LoginRejected(self.email.clone()))
    }
}

#[async_trait]
impl CloudSession for InMemorySession {
    async fn upload(
        &self,
        name: &str,
        size: u64,
        mut body: PayloadStream,
    ) -> Result<CompletedUpload, CloudError> {
        let started = self.begin().await;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        let mut state = self.cloud.lock();
        self.finish(&mut state, Operation::Upload, started);
        if buffer.len() as u64 != size {
            return Err(CloudError::Transfer(format!(
                "declared {size} bytes but received {}",
                buffer.len()
            )));
        }

        let object = new_object(name, buffer.freeze());
        let completed = CompletedUpload {
            handle: object.handle.clone(),
            name: object.name.clone(),
            size,
        };
        self.account(&mut state)?.files.push(object);
        Ok(completed)
    }

    async fn link(&self, upload: &CompletedUpload) -> Result<String, CloudError> {
        let started = self.begin().await;
        let mut state = self.cloud.lock();
        self.finish(&mut state, Operation::Link, started);
        if state.fail_links {
            return Err(CloudError::Link("link service unavailable".to_string()));
        }

        self.account(&mut state)?
            .files
            .iter()
            .find(|object| object.handle == upload.handle)
            .map(|object| object_link(object).to_url(LINK_PREFIX))
            .ok_or_else(|| CloudError::NotFound(upload.name.clone()))
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>, CloudError> {
        let started = self.begin().await;
        let mut state = self.cloud.lock();
        self.finish(&mut state, Operation::List, started);
        Ok(self
            .account(&mut state)?
            .files
            .iter()
            .map(|object| RemoteFile {
                name: object.name.clone(),
                handle: object.handle.clone(),
            })
            .collect())
    }

    async fn delete(&self, file: &RemoteFile) -> Result<(), CloudError> {
        let started = self.begin().await;
        let mut state = self.cloud.lock();
        self.finish(&mut state, Operation::Delete, started);
        if state.fail_deletes {
            return Err(CloudError::Transfer("delete rejected".to_string()));
        }

        let account = self.account(&mut state)?;
        let before = account.files.len();
        account.files.retain(|object| object.handle != file.handle);
        if account.files.len() == before {
            return Err(CloudError::NotFound(file.name.clone()));
        }
        Ok(())
    }

    async fn quota(&self) -> Result<Quota, CloudError> {
        let started = self.begin().await;
        let mut state = self.cloud.lock();
        self.finish(&mut state, Operation::Quota, started);
        let account = self.account(&mut state)?;
        if account.quota_fails {
            return Err(CloudError::Quota("account info endpoint failed".to_string()));
        }
        Ok(Quota {
            used: account.files.iter().map(|f| f.data.len() as u64).sum(),
            total: account.quota_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn body(data: &'static [u8]) -> PayloadStream {
        stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
    }

    #[tokio::test]
    async fn login_requires_matching_credential() {
        let cloud = InMemoryCloud::new().with_account("a@example.com", "pw");
        assert!(cloud.login("a@example.com", "pw").await.is_ok());
        assert!(matches!(
            cloud.login("a@example.com", "nope").await,
            Err(CloudError::LoginRejected(_))
        ));
        assert!(cloud.login("ghost@example.com", "pw").await.is_err());
        assert_eq!(cloud.login_attempts(), 3);
    }

    #[tokio::test]
    async fn uploaded_file_is_linked_listed_and_downloadable() {
        let cloud = InMemoryCloud::new().with_account("a@example.com", "pw");
        let session = cloud.login("a@example.com", "pw").await.expect("login");

        let done = session.upload("a.png", 4, body(b"\x89PNG")).await.expect("upload");
        let url = session.link(&done).await.expect("link");
        assert!(url.starts_with(LINK_PREFIX));

        let listed = session.list_files().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a.png");

        let (meta, stream) = cloud.download(&url).await.expect("download");
        assert_eq!(meta.mime_type, "image/png");
        let bytes: Vec<Bytes> = stream.try_collect().await.expect("read");
        assert_eq!(bytes.concat(), b"\x89PNG");

        assert_eq!(cloud.calls_for("a@example.com", Operation::Upload), 1);
    }

    #[tokio::test]
    async fn declared_size_must_match_body() {
        let cloud = InMemoryCloud::new().with_account("a@example.com", "pw");
        let session = cloud.login("a@example.com", "pw").await.expect("login");
        let err = session
            .upload("a.txt", 10, body(b"short"))
            .await
            .expect_err("size mismatch");
        assert!(matches!(err, CloudError::Transfer(_)));
        assert!(cloud.file_names("a@example.com").is_empty());
    }

    #[tokio::test]
    async fn quota_reflects_stored_bytes() {
        let cloud = InMemoryCloud::new()
            .with_account("a@example.com", "pw")
            .with_quota("a@example.com", 100);
        cloud.seed_file("a@example.com", "x.bin", &[0u8; 40]);
        let session = cloud.login("a@example.com", "pw").await.expect("login");
        assert_eq!(session.quota().await.expect("quota"), Quota { used: 40, total: 100 });

        cloud.fail_quota("a@example.com");
        assert!(session.quota().await.is_err());
    }
}
