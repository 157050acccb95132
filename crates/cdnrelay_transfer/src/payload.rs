use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Byte stream handed to a storage capability once the payload size is known.
pub type PayloadStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("failed reading upload stream: {0}")]
    Read(String),
    #[error("spool file error: {0}")]
    Spool(#[from] io::Error),
}

/// Turns an inbound stream into a sized payload. The storage capability needs
/// the total byte count before the first byte is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ByteSourceAdapter {
    #[default]
    Memory,
    /// Two-pass mode: drain to a file under `dir`, then stream it back.
    Spool { dir: PathBuf },
}

impl ByteSourceAdapter {
    pub fn spool(dir: impl Into<PathBuf>) -> Self {
        ByteSourceAdapter::Spool { dir: dir.into() }
    }

    /// Drains `source` completely. The source must not be reused afterwards.
    pub async fn materialize<S, E>(&self, source: S) -> Result<Payload, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        self.materialize_within(source, u64::MAX).await
    }

    /// Like [`materialize`](Self::materialize), but stops reading with
    /// `TooLarge` as soon as more than `max_bytes` have arrived.
    pub async fn materialize_within<S, E>(
        &self,
        source: S,
        max_bytes: u64,
    ) -> Result<Payload, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let source = std::pin::pin!(source);
        match self {
            ByteSourceAdapter::Memory => buffer_in_memory(source, max_bytes).await,
            ByteSourceAdapter::Spool { dir } => spool_to_disk(dir, source, max_bytes).await,
        }
    }
}

fn check_limit(received: u64, max_bytes: u64) -> Result<(), TransferError> {
    if received > max_bytes {
        return Err(TransferError::TooLarge { limit: max_bytes });
    }
    Ok(())
}

async fn buffer_in_memory<S, E>(mut source: S, max_bytes: u64) -> Result<Payload, TransferError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut buffer = BytesMut::new();
    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|err| TransferError::Read(err.to_string()))?;
        check_limit((buffer.len() + chunk.len()) as u64, max_bytes)?;
        buffer.extend_from_slice(&chunk);
    }

    if buffer.is_empty() {
        return Err(TransferError::EmptyPayload);
    }

    Ok(Payload::from_bytes(buffer.freeze()))
}

async fn spool_to_disk<S, E>(
    dir: &Path,
    mut source: S,
    max_bytes: u64,
) -> Result<Payload, TransferError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    tokio::fs::create_dir_all(dir).await?;
    let spool = SpoolFile {
        path: dir.join(format!("{}.part", Uuid::now_v7().simple())),
    };

    let mut file = tokio::fs::File::create(&spool.path).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|err| TransferError::Read(err.to_string()))?;
        check_limit(written + chunk.len() as u64, max_bytes)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if written == 0 {
        return Err(TransferError::EmptyPayload);
    }

    debug!(path = %spool.path.display(), size = written, "upload spooled to disk");
    Ok(Payload {
        size: written,
        body: Body::Spooled(spool),
    })
}

#[derive(Debug)]
pub struct Payload {
    size: u64,
    body: Body,
}

#[derive(Debug)]
enum Body {
    Memory(Bytes),
    Spooled(SpoolFile),
}

impl Payload {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            size: bytes.len() as u64,
            body: Body::Memory(bytes),
        }
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Up to `limit` leading bytes, for content sniffing.
    pub async fn head(&self, limit: usize) -> Result<Bytes, TransferError> {
        match &self.body {
            Body::Memory(bytes) => Ok(bytes.slice(..bytes.len().min(limit))),
            Body::Spooled(spool) => {
                let file = tokio::fs::File::open(&spool.path).await?;
                let mut head = Vec::with_capacity(limit);
                file.take(limit as u64).read_to_end(&mut head).await?;
                Ok(Bytes::from(head))
            }
        }
    }

    /// Opens a fresh read over the payload. Can be called more than once.
    pub async fn stream(&self) -> Result<PayloadStream, TransferError> {
        match &self.body {
            Body::Memory(bytes) => {
                let bytes = bytes.clone();
                Ok(stream::once(async move { Ok(bytes) }).boxed())
            }
            Body::Spooled(spool) => {
                let file = tokio::fs::File::open(&spool.path).await?;
                Ok(ReaderStream::new(file).boxed())
            }
        }
    }
}

/// Removes the spool file when the payload is released, on every outcome.
#[derive(Debug)]
struct SpoolFile {
    path: PathBuf,
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove spool file");
            }
        }
    }
}
