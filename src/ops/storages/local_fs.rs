//! Local directory tree as a sync destination.
//!
//! Writes never expose a partial file at the final path: bytes go to a hidden sibling temp
//! file, which is synced and then renamed into place. A temp file left behind by a failed or
//! cancelled write is removed when its handle is dropped.
//!
//! A copy that fails transiently is retried from a fresh fetch of the source, since a
//! consumed byte stream cannot be replayed.

use crate::prelude::*;

use crate::ops::interface::*;
use crate::utils::retryable::{self, RetryOptions};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

const TEMP_PREFIX: &str = ".bucketsync-";
const TEMP_SUFFIX: &str = ".part";

pub struct LocalFsDestination {
    root: PathBuf,
    retry: RetryOptions,
}

impl LocalFsDestination {
    /// Opens (creating if needed) the destination root.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = std::path::absolute(root.as_ref())
            .with_context(|| format!("Failed to resolve `{}`", root.as_ref().display()))?;
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create destination root `{}`", root.display()))?;
        debug!("local destination root: {}", root.display());
        Ok(Self {
            root,
            retry: RetryOptions::default(),
        })
    }

    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a slash-separated relative path below the root. Anything that would escape the
    /// root (`..`, absolute components) is rejected.
    pub fn resolve(&self, relative: &str) -> StorageResult<PathBuf> {
        let mut full = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                    return Err(StorageError::permanent(format!(
                        "refusing to write outside destination root: `{relative}`"
                    )));
                }
            }
        }
        if full == self.root {
            return Err(StorageError::permanent(format!(
                "empty destination path for `{relative}`"
            )));
        }
        Ok(full)
    }

    /// Streams `stream` into `relative`, atomically replacing any existing file.
    pub async fn write(
        &self,
        relative: &str,
        mut stream: ObjectStream,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let final_path = self.resolve(relative)?;
        let parent = final_path
            .parent()
            .ok_or_else(|| StorageError::permanent(format!("no parent directory for `{relative}`")))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::from_io(&format!("create directory {}", parent.display()), e))?;

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&parent)
            .map_err(|e| StorageError::from_io(&format!("create temp file in {}", parent.display()), e))?;
        let (std_file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut written: u64 = 0;
        while let Some(chunk) = stream.next_chunk(cancel).await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| StorageError::from_io(&format!("write {relative}"), e))?;
            written += chunk.len() as u64;
        }
        check_length(written, stream.size)?;

        file.flush()
            .await
            .map_err(|e| StorageError::from_io(&format!("flush {relative}"), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::from_io(&format!("sync {relative}"), e))?;
        drop(file);

        temp_path
            .persist(&final_path)
            .map_err(|e| StorageError::from_io(&format!("rename into {}", final_path.display()), e.error))?;
        debug!("wrote {written} bytes to {}", final_path.display());
        Ok(written)
    }
}

#[async_trait]
impl ObjectDestination for LocalFsDestination {
    fn kind(&self) -> DestinationKind {
        DestinationKind::LocalPath
    }

    /// Only a regular file counts; a directory in the way is left for the write to report.
    async fn exists(&self, path: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        let full = self.resolve(path)?;
        let what = format!("stat {}", full.display());
        retryable::run(
            &what,
            || async {
                match tokio::fs::metadata(&full).await {
                    Ok(metadata) => Ok(metadata.is_file()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(StorageError::from_io(&what, e)),
                }
            },
            &self.retry,
            cancel,
        )
        .await
    }

    async fn put(
        &self,
        path: &str,
        stream: ObjectStream,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        self.write(path, stream, cancel).await
    }

    async fn copy_from(
        &self,
        source: &dyn ObjectSource,
        source_path: &str,
        path: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        retryable::run(
            &format!("copy {source_path} to {}", self.root.display()),
            || async {
                let mut stream = source.fetch(source_path, cancel).await?;
                stream.size = size;
                self.write(path, stream, cancel).await
            },
            &self.retry,
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn leftover_temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with(TEMP_PREFIX))
            .collect()
    }

    #[tokio::test]
    async fn write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path().join("out")).await.unwrap();
        let written = dest
            .write(
                "q1/reports/a.txt",
                ObjectStream::from_bytes(Bytes::from_static(b"hello")),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(written, 5);
        let content = std::fs::read_to_string(dir.path().join("out/q1/reports/a.txt")).unwrap();
        assert_eq!(content, "hello");
        assert!(dest.exists("q1/reports/a.txt", &CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_does_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path()).await.unwrap();
        let cancel = CancellationToken::new();
        assert!(!dest.exists("nope/a.txt", &cancel).await.unwrap());

        std::fs::create_dir_all(dir.path().join("nope/dir.txt")).unwrap();
        assert!(!dest.exists("nope/dir.txt", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn short_stream_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path()).await.unwrap();
        let mut stream = ObjectStream::from_bytes(Bytes::from_static(b"abc"));
        stream.size = 10;
        let err = dest
            .write("a.txt", stream, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Permanent(_)));
        assert!(!dir.path().join("a.txt").exists());
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failing_stream_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let dest = LocalFsDestination::new(dir.path()).await.unwrap();

        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"new")),
            Err(StorageError::transient("connection reset")),
        ])
        .boxed();
        let stream = ObjectStream { size: 6, body };
        assert!(dest
            .write("a.txt", stream, &CancellationToken::new())
            .await
            .is_err());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old");
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn cancelled_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dest
            .write(
                "a.txt",
                ObjectStream::from_bytes(Bytes::from_static(b"abc")),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::Cancelled);
        assert!(!dir.path().join("a.txt").exists());
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path()).await.unwrap();
        assert!(dest.resolve("../etc/passwd").is_err());
        assert!(dest.resolve("/abs").is_err());
        assert!(dest.resolve("").is_err());
        assert_eq!(dest.resolve("a/b").unwrap(), dest.root().join("a").join("b"));
    }

    /// Source whose first `failures` reads break off mid-stream with a transient error.
    struct FlakySource {
        data: Bytes,
        failures: usize,
        fetches: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ObjectSource for FlakySource {
        fn list<'a>(
            &'a self,
            _prefix: &'a str,
            _cancel: &'a CancellationToken,
        ) -> BoxStream<'a, StorageResult<Vec<ObjectMetadata>>> {
            futures::stream::empty().boxed()
        }

        async fn fetch(&self, _path: &str, _cancel: &CancellationToken) -> StorageResult<ObjectStream> {
            let attempt = self
                .fetches
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let body = if attempt < self.failures {
                futures::stream::iter(vec![
                    Ok(self.data.slice(..1)),
                    Err(StorageError::transient("connection reset")),
                ])
                .boxed()
            } else {
                futures::stream::iter(vec![Ok(self.data.clone())]).boxed()
            };
            Ok(ObjectStream {
                size: self.data.len() as u64,
                body,
            })
        }
    }

    fn flaky(failures: usize) -> FlakySource {
        FlakySource {
            data: Bytes::from_static(b"payload"),
            failures,
            fetches: Default::default(),
        }
    }

    const FAST_RETRY: RetryOptions = RetryOptions::fixed(3, std::time::Duration::from_millis(1));

    #[tokio::test]
    async fn transient_copy_failure_is_retried_from_a_fresh_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path())
            .await
            .unwrap()
            .with_retry_options(FAST_RETRY);
        let source = flaky(2);
        let written = dest
            .copy_from(&source, "a", "out/a.bin", 7, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(source.fetches.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(dir.path().join("out/a.bin")).unwrap(), b"payload");
        assert!(leftover_temp_files(&dir.path().join("out")).is_empty());
    }

    #[tokio::test]
    async fn copy_gives_up_after_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalFsDestination::new(dir.path())
            .await
            .unwrap()
            .with_retry_options(FAST_RETRY);
        let source = flaky(usize::MAX);
        let err = dest
            .copy_from(&source, "a", "a.bin", 7, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Permanent(_)));
        assert_eq!(source.fetches.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(!dir.path().join("a.bin").exists());
    }
}
