//! In-memory backend for tests and previews.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::instrument;

use crate::backend::{ListPage, ObjectBackend, ObjectMeta};
use crate::checksum::md5_hex;
use crate::error::{BucketError, Result};
use crate::session::Connection;
use crate::stream::{ObjectReader, ObjectWriter};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    checksum: Option<String>,
    modified: DateTime<Utc>,
}

/// Object map shared by every session of a memory connection.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    objects: Arc<DashMap<String, StoredObject>>,
    calls: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    record_checksums: bool,
}

impl MemoryStore {
    fn new(record_checksums: bool) -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
            record_checksums,
        }
    }

    fn count_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn store(&self, path: &str, data: Bytes) {
        let checksum = self.record_checksums.then(|| md5_hex(&data));
        self.objects.insert(
            path.to_string(),
            StoredObject {
                data,
                checksum,
                modified: Utc::now(),
            },
        );
    }

    /// Store an object directly under a backend path, bypassing any bucket.
    pub fn insert(&self, path: impl AsRef<str>, data: impl Into<Bytes>) {
        self.store(path.as_ref(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.get(path).map(|o| o.data.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of backend primitives invoked so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of writers opened so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

/// Backend keeping every object in a concurrent map.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    connection: Connection<MemoryStore>,
    page_size: usize,
}

impl MemoryBackend {
    /// Memory backend recording the MD5 of every object written.
    pub fn new() -> Self {
        Self::with_connection(Connection::new("memory", MemoryStore::new(true)))
    }

    /// Memory backend reporting no checksums, so every sync transfers.
    pub fn without_checksums() -> Self {
        Self::with_connection(Connection::new("memory", MemoryStore::new(false)))
    }

    /// Share an existing connection, and with it the stored objects.
    pub fn with_connection(connection: Connection<MemoryStore>) -> Self {
        Self {
            connection,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Limit listing pages, mostly to exercise pagination.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &MemoryStore {
        self.connection.handle()
    }

    fn not_found(path: &str) -> BucketError {
        BucketError::NotFound {
            bucket: "memory".to_string(),
            key: path.to_string(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryWriter {
    store: MemoryStore,
    path: String,
    buffer: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(BucketError::backend("memory", "write after close"));
        }
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(BucketError::backend("memory", "writer already closed"));
        }
        self.closed = true;
        let data = Bytes::from(std::mem::take(&mut self.buffer));
        self.store.store(&self.path, data);
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    type Handle = MemoryStore;

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn connection(&self) -> &Connection<MemoryStore> {
        &self.connection
    }

    async fn ping(&self, store: &MemoryStore) -> Result<()> {
        store.count_call();
        Ok(())
    }

    #[instrument(skip(self, store), level = "debug")]
    async fn open_reader(&self, store: &MemoryStore, path: &str) -> Result<ObjectReader> {
        store.count_call();
        let data = store.get(path).ok_or_else(|| Self::not_found(path))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    #[instrument(skip(self, store), level = "debug")]
    async fn open_writer(&self, store: &MemoryStore, path: &str) -> Result<Box<dyn ObjectWriter>> {
        store.count_call();
        store.writes.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryWriter {
            store: store.clone(),
            path: path.to_string(),
            buffer: Vec::new(),
            closed: false,
        }))
    }

    async fn stat(&self, store: &MemoryStore, path: &str) -> Result<Option<ObjectMeta>> {
        store.count_call();
        Ok(store.objects.get(path).map(|o| ObjectMeta {
            path: path.to_string(),
            size: o.data.len() as u64,
            checksum: o.checksum.clone(),
            last_modified: Some(o.modified),
        }))
    }

    #[instrument(skip(self, store), level = "debug")]
    async fn delete(&self, store: &MemoryStore, path: &str) -> Result<()> {
        store.count_call();
        store
            .objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn list_page(
        &self,
        store: &MemoryStore,
        prefix: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        store.count_call();
        let mut matching: Vec<ObjectMeta> = store
            .objects
            .iter()
            .filter(|e| prefix.map_or(true, |p| e.key().starts_with(p)))
            .filter(|e| cursor.map_or(true, |c| e.key().as_str() > c))
            .map(|e| ObjectMeta {
                path: e.key().clone(),
                size: e.data.len() as u64,
                checksum: e.checksum.clone(),
                last_modified: Some(e.modified),
            })
            .collect();
        matching.sort_by(|a, b| a.path.cmp(&b.path));

        let next = if matching.len() > self.page_size {
            matching.truncate(self.page_size);
            matching.last().map(|m| m.path.clone())
        } else {
            None
        };
        Ok(ListPage {
            objects: matching,
            next,
        })
    }
}
