use crate::prelude::*;

use crate::utils::retryable::Retryable;
use bytes::Bytes;

/// One object as reported by a source listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Full slash-separated key, including any folder prefix.
    pub path: String,
    pub size: u64,
    /// Opaque change marker (an entity tag for S3-compatible stores). Only compared for equality.
    pub fingerprint: String,
    pub last_modified: DateTime<Utc>,
}

/// Failure surfaced by a transport adapter, classified once at the adapter boundary.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// Timeouts, dropped connections and similar; worth another attempt.
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("cancelled")]
    Cancelled,
}

impl StorageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Local I/O errors: interruptions and timeouts are transient, missing files are
    /// `NotFound`, everything else is permanent.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(format!("{context}: {err}")),
            ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::Transient(format!("{context}: {err}")),
            _ => Self::Permanent(format!("{context}: {err}")),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn into_exhausted(self, attempts: usize) -> Self {
        match self {
            Self::Transient(msg) => Self::Permanent(format!("failed after {attempts} attempts: {msg}")),
            other => other,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Readable body of one object. `size` is the length the body is expected to produce.
pub struct ObjectStream {
    pub size: u64,
    pub body: BoxStream<'static, StorageResult<Bytes>>,
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream").field("size", &self.size).finish_non_exhaustive()
    }
}

impl ObjectStream {
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            size: data.len() as u64,
            body: futures::stream::once(async move { Ok(data) }).boxed(),
        }
    }

    /// Pulls the next chunk, giving up with [`StorageError::Cancelled`] as soon as `cancel`
    /// fires.
    pub async fn next_chunk(&mut self, cancel: &CancellationToken) -> StorageResult<Option<Bytes>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            chunk = self.body.next() => chunk.transpose(),
        }
    }

    /// Reads the whole body into memory, checking it against the announced size.
    pub async fn collect(mut self, cancel: &CancellationToken) -> StorageResult<Bytes> {
        let mut buf = bytes::BytesMut::with_capacity(self.size.min(64 << 20) as usize);
        while let Some(chunk) = self.next_chunk(cancel).await? {
            buf.extend_from_slice(&chunk);
        }
        check_length(buf.len() as u64, self.size)?;
        Ok(buf.freeze())
    }
}

pub fn check_length(written: u64, expected: u64) -> StorageResult<()> {
    if written != expected {
        return Err(StorageError::permanent(format!(
            "size mismatch: expected {expected} bytes, got {written}"
        )));
    }
    Ok(())
}

/// Where an S3-compatible store lives. Two stores with the same endpoint can copy between
/// each other without the bytes leaving the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub endpoint: String,
    pub bucket: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    ObjectStore,
    LocalPath,
}

#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Enumerates every object under `prefix` (empty = whole bucket) in batches.
    /// Pseudo-directory markers are never yielded. The stream is not resumable: a caller that
    /// needs to start over lists again.
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxStream<'a, StorageResult<Vec<ObjectMetadata>>>;

    /// Opens `path` for reading. Gives up with [`StorageError::Cancelled`] once `cancel` fires,
    /// including while waiting to retry.
    async fn fetch(&self, path: &str, cancel: &CancellationToken) -> StorageResult<ObjectStream>;

    fn location(&self) -> Option<&ObjectLocation> {
        None
    }
}

#[async_trait]
pub trait ObjectDestination: Send + Sync {
    fn kind(&self) -> DestinationKind;

    /// Whether an object is already stored at `path`. Absence is `Ok(false)`, never an error.
    async fn exists(&self, path: &str, cancel: &CancellationToken) -> StorageResult<bool>;

    /// Writes `stream` at `path`, replacing whatever is there. Returns the number of bytes
    /// written, which always equals `stream.size` on success.
    async fn put(
        &self,
        path: &str,
        stream: ObjectStream,
        cancel: &CancellationToken,
    ) -> StorageResult<u64>;

    /// Copies `source_path` from `source` to `path`. Stores able to do better than a plain
    /// fetch-and-put (server-side copy, multipart upload) override this.
    async fn copy_from(
        &self,
        source: &dyn ObjectSource,
        source_path: &str,
        path: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let mut stream = source.fetch(source_path, cancel).await?;
        stream.size = size;
        self.put(path, stream, cancel).await
    }
}
