//! Lazy listing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ObjectBackend, ObjectMeta};
use crate::bucket::BucketCore;
use crate::error::{BucketError, Result};
use crate::session::SessionLease;
use crate::stream::ObjectReader;

/// Single-pass cursor over the keys of a bucket.
///
/// ```ignore
/// let mut iter = bucket.list(&ctx, "logs/").await?;
/// while iter.next(&ctx).await {
///     let item = iter.item().unwrap();
///     println!("{}", item.name());
/// }
/// if let Some(err) = iter.take_err() { return Err(err); }
/// ```
#[async_trait]
pub trait BucketIterator: Send {
    /// Advance to the next item. Returns `false` once exhausted, failed or cancelled.
    async fn next(&mut self, ctx: &CancellationToken) -> bool;

    /// The current item, valid after `next` returned `true`.
    fn item(&self) -> Option<&BucketItem>;

    /// The fault that stopped iteration, `None` on clean exhaustion or cancellation.
    fn err(&self) -> Option<&BucketError>;

    /// Take ownership of the fault, leaving `None` behind.
    fn take_err(&mut self) -> Option<BucketError>;
}

#[async_trait]
pub(crate) trait ItemSource: Send + Sync {
    async fn open_item(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader>;
}

/// One object yielded by a [`BucketIterator`].
#[derive(Clone)]
pub struct BucketItem {
    key: String,
    bucket_prefix: String,
    checksum: Option<String>,
    size: u64,
    source: Weak<dyn ItemSource>,
}

impl BucketItem {
    /// Logical key, relative to the bucket prefix.
    pub fn name(&self) -> &str {
        &self.key
    }

    pub fn bucket_prefix(&self) -> &str {
        &self.bucket_prefix
    }

    /// Checksum reported by the backend, if any.
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open a reader through the bucket that produced this item.
    pub async fn get(&self, ctx: &CancellationToken) -> Result<ObjectReader> {
        let source = self
            .source
            .upgrade()
            .ok_or_else(|| BucketError::Detached(self.key.clone()))?;
        source.open_item(ctx, &self.key).await
    }
}

impl fmt::Debug for BucketItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketItem")
            .field("key", &self.key)
            .field("bucket_prefix", &self.bucket_prefix)
            .field("checksum", &self.checksum)
            .field("size", &self.size)
            .finish()
    }
}

/// Iterator fetching one backend page at a time.
pub(crate) struct PagedIterator<B: ObjectBackend> {
    core: Arc<BucketCore<B>>,
    lease: SessionLease<B::Handle>,
    query: Option<String>,
    buffer: VecDeque<ObjectMeta>,
    cursor: Option<String>,
    exhausted: bool,
    item: Option<BucketItem>,
    err: Option<BucketError>,
}

impl<B: ObjectBackend> PagedIterator<B> {
    pub(crate) fn new(
        ctx: &CancellationToken,
        core: Arc<BucketCore<B>>,
        query: Option<String>,
    ) -> Self {
        let lease = core.backend.connection().lease(ctx);
        Self {
            core,
            lease,
            query,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
            item: None,
            err: None,
        }
    }

    fn make_item(&self, meta: ObjectMeta) -> BucketItem {
        let source: Arc<dyn ItemSource> = self.core.clone();
        BucketItem {
            key: self.core.codec.denormalize(&meta.path).to_string(),
            bucket_prefix: self.core.codec.prefix().to_string(),
            checksum: meta.checksum,
            size: meta.size,
            source: Arc::downgrade(&source),
        }
    }

    fn stop(&mut self) -> bool {
        self.item = None;
        self.lease.finish();
        false
    }
}

#[async_trait]
impl<B: ObjectBackend> BucketIterator for PagedIterator<B> {
    async fn next(&mut self, ctx: &CancellationToken) -> bool {
        loop {
            if ctx.is_cancelled() || self.lease.token().is_cancelled() {
                return self.stop();
            }

            if let Some(meta) = self.buffer.pop_front() {
                self.item = Some(self.make_item(meta));
                return true;
            }

            if self.exhausted {
                return self.stop();
            }

            let page = {
                let fetch = self.core.backend.list_page(
                    self.lease.handle(),
                    self.query.as_deref(),
                    self.cursor.as_deref(),
                );
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => None,
                    _ = self.lease.token().cancelled() => None,
                    page = fetch => Some(page),
                }
            };

            match page {
                None => return self.stop(),
                Some(Ok(page)) => {
                    debug!(
                        "Listed {} objects under {:?}",
                        page.objects.len(),
                        self.query
                    );
                    self.exhausted = page.next.is_none();
                    self.cursor = page.next;
                    self.buffer.extend(page.objects);
                }
                Some(Err(err)) => {
                    self.err = Some(err);
                    return self.stop();
                }
            }
        }
    }

    fn item(&self) -> Option<&BucketItem> {
        self.item.as_ref()
    }

    fn err(&self) -> Option<&BucketError> {
        self.err.as_ref()
    }

    fn take_err(&mut self) -> Option<BucketError> {
        self.err.take()
    }
}
