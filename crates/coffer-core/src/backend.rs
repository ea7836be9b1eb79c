use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::session::Connection;
use crate::stream::{ObjectReader, ObjectWriter};

/// Metadata of one stored object, addressed by its backend path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    /// Hex MD5 of the content, when the backend knows it.
    pub checksum: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    /// Cursor for the next page. `None` once the listing is exhausted.
    pub next: Option<String>,
}

/// Storage primitives a backend provides to [`crate::BackendBucket`].
///
/// Backends deal in full object paths; key normalization, dry-run handling, session
/// accounting and cancellation all happen in the bucket layer.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Per-session handle cloned from the connection.
    type Handle: Clone + Send + Sync + 'static;

    /// Short backend name used in diagnostics, such as `"s3"`.
    fn kind(&self) -> &'static str;

    fn connection(&self) -> &Connection<Self::Handle>;

    /// Cheap liveness probe.
    async fn ping(&self, handle: &Self::Handle) -> Result<()>;

    /// Open a stored object. Missing objects yield [`crate::BucketError::NotFound`].
    async fn open_reader(&self, handle: &Self::Handle, path: &str) -> Result<ObjectReader>;

    /// Open a writer that creates or replaces the object on close.
    async fn open_writer(
        &self,
        handle: &Self::Handle,
        path: &str,
    ) -> Result<Box<dyn ObjectWriter>>;

    /// Metadata of an object, or `None` if nothing is stored under `path`.
    async fn stat(&self, handle: &Self::Handle, path: &str) -> Result<Option<ObjectMeta>>;

    async fn delete(&self, handle: &Self::Handle, path: &str) -> Result<()>;

    /// One page of objects whose path starts with `prefix`, in ascending path order.
    async fn list_page(
        &self,
        handle: &Self::Handle,
        prefix: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<ListPage>;
}
