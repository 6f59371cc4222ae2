//! In-process object store. Serves as both source and destination, records what was read
//! and written, and can be told to fail, which makes it the workhorse of the test suite.

use crate::prelude::*;

use crate::ops::interface::*;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Bytes,
    fingerprint: String,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, MemoryObject>,
    fetches: HashMap<String, usize>,
    puts: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    fetch_failures: HashMap<String, StorageError>,
    put_failures: HashMap<String, StorageError>,
    /// Fail the listing once this many batches have been yielded.
    list_failure: Option<(usize, StorageError)>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    list_batch_size: usize,
    put_delay: Duration,
    bytes_read: AtomicU64,
    overlapping_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            list_batch_size: 1000,
            put_delay: Duration::ZERO,
            bytes_read: AtomicU64::new(0),
            overlapping_writes: AtomicBool::new(false),
        }
    }

    pub fn with_list_batch_size(mut self, size: usize) -> Self {
        self.list_batch_size = size.max(1);
        self
    }

    /// Makes every `put` linger, so concurrent writers overlap in time.
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store state poisoned")
    }

    pub fn insert(&self, path: &str, data: impl Into<Bytes>, fingerprint: &str) {
        self.state().objects.insert(
            path.to_string(),
            MemoryObject {
                data: data.into(),
                fingerprint: fingerprint.to_string(),
                last_modified: Utc::now(),
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.state().objects.get(path).map(|o| o.data.clone())
    }

    pub fn fail_fetch(&self, path: &str, err: StorageError) {
        self.state().fetch_failures.insert(path.to_string(), err);
    }

    pub fn fail_put(&self, path: &str, err: StorageError) {
        self.state().put_failures.insert(path.to_string(), err);
    }

    pub fn fail_listing_after(&self, batches: usize, err: StorageError) {
        self.state().list_failure = Some((batches, err));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fetch_failures.clear();
        state.put_failures.clear();
        state.list_failure = None;
    }

    pub fn fetch_count(&self, path: &str) -> usize {
        self.state().fetches.get(path).copied().unwrap_or(0)
    }

    pub fn put_count(&self, path: &str) -> usize {
        self.state().puts.get(path).copied().unwrap_or(0)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::SeqCst)
    }

    /// True if two writes to the same path were ever in flight at once.
    pub fn saw_overlapping_writes(&self) -> bool {
        self.overlapping_writes.load(Ordering::SeqCst)
    }

    fn snapshot(&self, prefix: &str) -> Vec<ObjectMetadata> {
        self.state()
            .objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix) && !path.ends_with('/'))
            .map(|(path, object)| ObjectMetadata {
                path: path.clone(),
                size: object.data.len() as u64,
                fingerprint: object.fingerprint.clone(),
                last_modified: object.last_modified,
            })
            .collect()
    }
}

#[async_trait]
impl ObjectSource for MemoryStore {
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxStream<'a, StorageResult<Vec<ObjectMetadata>>> {
        let objects = self.snapshot(prefix);
        let list_failure = self.state().list_failure.clone();
        let batches: Vec<StorageResult<Vec<ObjectMetadata>>> = objects
            .chunks(self.list_batch_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .enumerate()
            .flat_map(|(idx, batch)| match &list_failure {
                Some((after, err)) if idx == *after => vec![Err(err.clone())],
                Some((after, _)) if idx > *after => vec![],
                _ => vec![batch],
            })
            .collect();
        futures::stream::iter(batches).boxed()
    }

    async fn fetch(&self, path: &str, cancel: &CancellationToken) -> StorageResult<ObjectStream> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let object = {
            let mut state = self.state();
            *state.fetches.entry(path.to_string()).or_default() += 1;
            if let Some(err) = state.fetch_failures.get(path) {
                return Err(err.clone());
            }
            state
                .objects
                .get(path)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(path.to_string()))?
        };
        self.bytes_read
            .fetch_add(object.data.len() as u64, Ordering::SeqCst);
        Ok(ObjectStream::from_bytes(object.data))
    }
}

#[async_trait]
impl ObjectDestination for MemoryStore {
    fn kind(&self) -> DestinationKind {
        DestinationKind::ObjectStore
    }

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(self.state().objects.contains_key(path))
    }

    async fn put(
        &self,
        path: &str,
        stream: ObjectStream,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        {
            let mut state = self.state();
            *state.puts.entry(path.to_string()).or_default() += 1;
            if let Some(err) = state.put_failures.get(path) {
                return Err(err.clone());
            }
            let in_flight = state.in_flight.entry(path.to_string()).or_default();
            *in_flight += 1;
            if *in_flight > 1 {
                self.overlapping_writes.store(true, Ordering::SeqCst);
            }
        }

        let result = async {
            if !self.put_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                    _ = tokio::time::sleep(self.put_delay) => {}
                }
            }
            stream.collect(cancel).await
        }
        .await;

        let mut state = self.state();
        if let Some(in_flight) = state.in_flight.get_mut(path) {
            *in_flight -= 1;
        }
        let data = result?;
        let written = data.len() as u64;
        state.objects.insert(
            path.to_string(),
            MemoryObject {
                data,
                fingerprint: format!("mem-{written}"),
                last_modified: Utc::now(),
            },
        );
        Ok(written)
    }
}
