use std::io;
use std::path::{Path, PathBuf};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use cdnrelay_transfer::{mime_for_name, PayloadStream};
use futures::StreamExt;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::ReadDirStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{
    CloudError, CloudSession, CloudStorage, CompletedUpload, LinkedFile, PublicLink, Quota,
    RemoteFile,
};

const LINK_PREFIX: &str = "local://file/";
const META_EXTENSION: &str = "json";
const DATA_EXTENSION: &str = "bin";
const CREDENTIAL_FILE: &str = ".credential";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    name: String,
    size: u64,
    key: String,
    mime_type: String,
}

/// Filesystem-backed provider: one directory per account under `root`,
/// each object stored as `<handle>.bin` next to `<handle>.json`.
///
/// Each account directory holds an argon2 hash of its secret; a login must
/// match it. With `provision` set, the first login creates the directory and
/// records the hash.
#[derive(Debug, Clone)]
pub struct LocalCloud {
    root: PathBuf,
    quota_bytes: u64,
    provision: bool,
}

impl LocalCloud {
    pub fn new(root: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            root: root.into(),
            quota_bytes,
            provision: true,
        }
    }

    pub fn without_provisioning(mut self) -> Self {
        self.provision = false;
        self
    }

    fn account_dir(&self, email: &str) -> PathBuf {
        let safe: String = email
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_' | '+') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(safe)
    }

    async fn locate(&self, remote_url: &str) -> Result<(PathBuf, ObjectMeta), CloudError> {
        let link = PublicLink::parse(LINK_PREFIX, remote_url)?;
        let mut accounts = ReadDirStream::new(tokio::fs::read_dir(&self.root).await?);
        while let Some(entry) = accounts.next().await {
            let dir = entry?.path();
            let meta_path = dir.join(format!("{}.{META_EXTENSION}", link.handle));
            match read_meta(&meta_path).await {
                Ok(meta) if meta.key == link.key => {
                    return Ok((dir.join(format!("{}.{DATA_EXTENSION}", link.handle)), meta))
                }
                Ok(_) => break,
                Err(CloudError::Io(err)) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            }
        }
        Err(CloudError::NotFound(remote_url.to_string()))
    }
}

impl LocalCloud {
    async fn check_credential(
        &self,
        email: &str,
        dir: &Path,
        credential: &str,
    ) -> Result<(), CloudError> {
        let path = dir.join(CREDENTIAL_FILE);
        let stored = match tokio::fs::read_to_string(&path).await {
            Ok(stored) => stored,
            Err(err) if err.kind() == io::ErrorKind::NotFound && self.provision => {
                let hash = hash_secret(credential.to_string()).await?;
                tokio::fs::write(&path, hash).await?;
                info!(account = %email, "recorded local account credential");
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CloudError::LoginRejected(email.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        if verify_secret(credential.to_string(), stored).await? {
            Ok(())
        } else {
            Err(CloudError::LoginRejected(email.to_string()))
        }
    }
}

async fn hash_secret(secret: String) -> Result<String, CloudError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| CloudError::Credential(format!("hash secret: {err}")))
    })
    .await
    .map_err(|err| CloudError::Credential(err.to_string()))?
}

async fn verify_secret(secret: String, stored: String) -> Result<bool, CloudError> {
    tokio::task::spawn_blocking(move || {
        let hash = PasswordHash::new(stored.trim())
            .map_err(|err| CloudError::Credential(format!("unreadable credential: {err}")))?;
        Ok(Argon2::default()
            .verify_password(secret.as_bytes(), &hash)
            .is_ok())
    })
    .await
    .map_err(|err| CloudError::Credential(err.to_string()))?
}

async fn read_meta(path: &Path) -> Result<ObjectMeta, CloudError> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw)
        .map_err(|err| CloudError::Transfer(format!("corrupt metadata {}: {err}", path.display())))
}

fn linked_file(meta: ObjectMeta) -> LinkedFile {
    LinkedFile {
        name: meta.name,
        size: meta.size,
        mime_type: meta.mime_type,
    }
}

#[async_trait]
impl CloudStorage for LocalCloud {
    async fn login(
        &self,
        email: &str,
        credential: &str,
    ) -> Result<Box<dyn CloudSession>, CloudError> {
        if email.trim().is_empty() || credential.is_empty() {
            return Err(CloudError::LoginRejected(email.to_string()));
        }

        let dir = self.account_dir(email);
        if !tokio::fs::try_exists(&dir).await? {
            if !self.provision {
                return Err(CloudError::LoginRejected(email.to_string()));
            }
            tokio::fs::create_dir_all(&dir).await?;
            info!(account = %email, dir = %dir.display(), "provisioned local account directory");
        }
        self.check_credential(email, &dir, credential).await?;

        Ok(Box::new(LocalSession {
            dir,
            quota_bytes: self.quota_bytes,
        }))
    }

    async fn describe(&self, remote_url: &str) -> Result<LinkedFile, CloudError> {
        self.locate(remote_url).await.map(|(_, meta)| linked_file(meta))
    }

    async fn download(&self, remote_url: &str) -> Result<(LinkedFile, PayloadStream), CloudError> {
        let (data_path, meta) = self.locate(remote_url).await?;
        let file = tokio::fs::File::open(&data_path).await?;
        Ok((linked_file(meta), ReaderStream::new(file).boxed()))
    }

    fn link_prefix(&self) -> &str {
        LINK_PREFIX
    }
}

struct LocalSession {
    dir: PathBuf,
    quota_bytes: u64,
}

impl LocalSession {
    fn data_path(&self, handle: &str) -> PathBuf {
        self.dir.join(format!("{handle}.{DATA_EXTENSION}"))
    }

    fn meta_path(&self, handle: &str) -> PathBuf {
        self.dir.join(format!("{handle}.{META_EXTENSION}"))
    }

    async fn objects(&self) -> Result<Vec<(String, ObjectMeta)>, CloudError> {
        let mut entries = ReadDirStream::new(tokio::fs::read_dir(&self.dir).await?);
        let mut objects = Vec::new();
        while let Some(entry) = entries.next().await {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            let Some(handle) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match read_meta(&path).await {
                Ok(meta) => objects.push((handle.to_string(), meta)),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable object"),
            }
        }
        objects.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        Ok(objects)
    }
}

#[async_trait]
impl CloudSession for LocalSession {
    async fn upload(
        &self,
        name: &str,
        size: u64,
        mut body: PayloadStream,
    ) -> Result<CompletedUpload, CloudError> {
        let handle = Uuid::new_v4().simple().to_string();
        let data_path = self.data_path(&handle);
        let mut file = tokio::fs::File::create(&data_path).await?;

        let mut written: u64 = 0;
        let copied: Result<(), CloudError> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(err) = copied {
            tokio::fs::remove_file(&data_path).await.ok();
            return Err(err);
        }
        if written != size {
            tokio::fs::remove_file(&data_path).await.ok();
            return Err(CloudError::Transfer(format!(
                "declared {size} bytes but received {written}"
            )));
        }

        let meta = ObjectMeta {
            name: name.to_string(),
            size,
            key: Uuid::new_v4().simple().to_string()[..16].to_string(),
            mime_type: mime_for_name(name).to_string(),
        };
        let encoded = serde_json::to_vec(&meta)
            .map_err(|err| CloudError::Transfer(format!("encode metadata: {err}")))?;
        tokio::fs::write(self.meta_path(&handle), encoded).await?;
        debug!(file = %name, handle = %handle, size, "stored local object");

        Ok(CompletedUpload {
            handle,
            name: name.to_string(),
            size,
        })
    }

    async fn link(&self, upload: &CompletedUpload) -> Result<String, CloudError> {
        let meta = read_meta(&self.meta_path(&upload.handle))
            .await
            .map_err(|err| CloudError::Link(err.to_string()))?;
        Ok(PublicLink {
            handle: upload.handle.clone(),
            key: meta.key,
        }
        .to_url(LINK_PREFIX))
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>, CloudError> {
        Ok(self
            .objects()
            .await?
            .into_iter()
            .map(|(handle, meta)| RemoteFile {
                name: meta.name,
                handle,
            })
            .collect())
    }

    async fn delete(&self, file: &RemoteFile) -> Result<(), CloudError> {
        match tokio::fs::remove_file(self.meta_path(&file.handle)).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CloudError::NotFound(file.name.clone()))
            }
            other => other?,
        }
        tokio::fs::remove_file(self.data_path(&file.handle)).await.ok();
        Ok(())
    }

    async fn quota(&self) -> Result<Quota, CloudError> {
        let used = self.objects().await?.iter().map(|(_, meta)| meta.size).sum();
        Ok(Quota {
            used,
            total: self.quota_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{stream, TryStreamExt};

    fn scratch_root() -> PathBuf {
        std::env::temp_dir().join(format!("cdnrelay-local-{}", Uuid::new_v4().simple()))
    }

    fn body(data: &'static [u8]) -> PayloadStream {
        stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
    }

    #[tokio::test]
    async fn objects_survive_a_full_round_through_the_filesystem() {
        let root = scratch_root();
        let cloud = LocalCloud::new(&root, 1_000);
        let session = cloud.login("a@example.com", "pw").await.expect("login");

        let done = session.upload("notes.txt", 5, body(b"hello")).await.expect("upload");
        let url = session.link(&done).await.expect("link");

        let described = cloud.describe(&url).await.expect("describe");
        assert_eq!(described.name, "notes.txt");
        assert_eq!(described.mime_type, "text/plain");

        let (_, stream) = cloud.download(&url).await.expect("download");
        let chunks: Vec<Bytes> = stream.try_collect().await.expect("read");
        assert_eq!(chunks.concat(), b"hello");

        assert_eq!(session.quota().await.expect("quota"), Quota { used: 5, total: 1_000 });

        let listed = session.list_files().await.expect("list");
        assert_eq!(listed.len(), 1);
        session.delete(&listed[0]).await.expect("delete");
        assert!(session.list_files().await.expect("list").is_empty());
        assert!(matches!(
            session.delete(&listed[0]).await,
            Err(CloudError::NotFound(_))
        ));

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn unprovisioned_accounts_cannot_log_in() {
        let root = scratch_root();
        let cloud = LocalCloud::new(&root, 1_000).without_provisioning();
        assert!(matches!(
            cloud.login("a@example.com", "pw").await,
            Err(CloudError::LoginRejected(_))
        ));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_after_provisioning() {
        let root = scratch_root();
        let cloud = LocalCloud::new(&root, 1_000);
        cloud.login("a@example.com", "right").await.expect("first login");
        cloud.login("a@example.com", "right").await.expect("same secret");

        let reopened = LocalCloud::new(&root, 1_000).without_provisioning();
        assert!(matches!(
            reopened.login("a@example.com", "wrong").await,
            Err(CloudError::LoginRejected(_))
        ));
        reopened.login("a@example.com", "right").await.expect("reopened login");

        let session = cloud.login("a@example.com", "right").await.expect("login");
        assert!(session.list_files().await.expect("list").is_empty());

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn directory_without_a_credential_needs_provisioning() {
        let root = scratch_root();
        tokio::fs::create_dir_all(root.join("a@example.com")).await.expect("dir");

        let cloud = LocalCloud::new(&root, 1_000).without_provisioning();
        assert!(matches!(
            cloud.login("a@example.com", "pw").await,
            Err(CloudError::LoginRejected(_))
        ));

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn wrong_key_does_not_resolve() {
        let root = scratch_root();
        let cloud = LocalCloud::new(&root, 1_000);
        let session = cloud.login("a@example.com", "pw").await.expect("login");
        let done = session.upload("a.txt", 1, body(b"x")).await.expect("upload");
        let url = session.link(&done).await.expect("link");

        let (prefix, _) = url.split_once('#').expect("key separator");
        let forged = format!("{prefix}#0000");
        assert!(matches!(
            cloud.describe(&forged).await,
            Err(CloudError::NotFound(_))
        ));

        tokio::fs::remove_dir_all(&root).await.ok();
    }
}
