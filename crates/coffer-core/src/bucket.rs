use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ObjectBackend, ObjectMeta};
use crate::context::{ensure_active, run_cancellable};
use crate::error::{AggregateError, BucketError, Result};
use crate::iter::{BucketIterator, ItemSource, PagedIterator};
use crate::keys::KeyCodec;
use crate::options::{BucketOptions, CopyOptions, SyncOptions};
use crate::stream::{
    copy_to_file, copy_to_writer, DiscardWriter, LeasedReader, LeasedWriter, ObjectReader,
    ObjectWriter,
};
use crate::{remove, sync};

/// Uniform object storage contract implemented by every backend.
///
/// Keys are logical: each bucket maps them to backend paths through its prefix.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Logical bucket name from the options.
    fn name(&self) -> &str;

    /// Verify the backend is reachable.
    async fn check(&self, ctx: &CancellationToken) -> Result<()>;

    /// Writer that creates or replaces `key` on close. Discards everything under dry-run.
    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>>;

    async fn reader(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader>;

    /// Store the full contents of `source` under `key`.
    async fn put(
        &self,
        ctx: &CancellationToken,
        key: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;

    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader>;

    /// Store a local file under `key`.
    async fn upload(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()>;

    /// Write the object stored under `key` to a local file, creating parent directories.
    async fn download(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()>;

    /// Mirror a local tree into the bucket.
    async fn push(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()>;

    /// Mirror part of the bucket into a local tree.
    async fn pull(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()>;

    /// Stream an object into another bucket, which may use any backend.
    async fn copy(&self, ctx: &CancellationToken, opts: CopyOptions<'_>) -> Result<()>;

    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()>;

    /// Remove every key, reporting all failures together.
    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()>;

    async fn remove_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<()>;

    /// Remove every key matching the regular expression.
    async fn remove_matching(&self, ctx: &CancellationToken, expression: &str) -> Result<()>;

    /// Lazily iterate over the keys starting with `prefix`.
    ///
    /// The empty prefix lists this bucket's namespace only: everything below the bucket
    /// prefix, or every object when the bucket has none.
    async fn list(&self, ctx: &CancellationToken, prefix: &str)
        -> Result<Box<dyn BucketIterator>>;
}

/// State shared by a bucket and the items its iterators hand out.
pub(crate) struct BucketCore<B: ObjectBackend> {
    pub(crate) backend: B,
    pub(crate) options: BucketOptions,
    pub(crate) codec: KeyCodec,
}

impl<B: ObjectBackend> BucketCore<B> {
    pub(crate) fn trace(&self, operation: &'static str, key: &str, path: Option<&Path>) {
        if !self.options.verbose {
            return;
        }
        debug!(
            backend = self.backend.kind(),
            dry_run = self.options.dry_run,
            operation,
            bucket = %self.options.name,
            bucket_prefix = %self.codec.prefix(),
            key,
            path = path.map(|p| p.display().to_string()),
            "bucket operation"
        );
    }

    pub(crate) async fn open_reader(
        &self,
        ctx: &CancellationToken,
        key: &str,
    ) -> Result<ObjectReader> {
        ensure_active(ctx)?;
        let path = self.codec.normalize(key);
        let lease = self.backend.connection().lease(ctx);
        match run_cancellable(ctx, self.backend.open_reader(lease.handle(), &path)).await {
            Ok(inner) => Ok(Box::new(LeasedReader::new(inner, lease))),
            Err(err) => {
                lease.finish();
                Err(err.context("opening", self.backend.kind(), path))
            }
        }
    }

    async fn open_writer(
        &self,
        ctx: &CancellationToken,
        key: &str,
    ) -> Result<Box<dyn ObjectWriter>> {
        ensure_active(ctx)?;
        if self.options.dry_run {
            return Ok(Box::new(DiscardWriter::new()));
        }
        let path = self.codec.normalize(key);
        let lease = self.backend.connection().lease(ctx);
        match run_cancellable(ctx, self.backend.open_writer(lease.handle(), &path)).await {
            Ok(inner) => Ok(Box::new(LeasedWriter::new(inner, lease))),
            Err(err) => {
                lease.finish();
                Err(err.context("creating", self.backend.kind(), path))
            }
        }
    }

    pub(crate) async fn stat(
        &self,
        ctx: &CancellationToken,
        key: &str,
    ) -> Result<Option<ObjectMeta>> {
        ensure_active(ctx)?;
        let path = self.codec.normalize(key);
        let session = self.backend.connection().session();
        run_cancellable(ctx, self.backend.stat(session.handle(), &path))
            .await
            .map_err(|err| err.context("inspecting", self.backend.kind(), path))
    }
}

#[async_trait]
impl<B: ObjectBackend> ItemSource for BucketCore<B> {
    async fn open_item(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.open_reader(ctx, key).await
    }
}

/// A [`Bucket`] over any [`ObjectBackend`].
pub struct BackendBucket<B: ObjectBackend> {
    core: Arc<BucketCore<B>>,
}

impl<B: ObjectBackend> Clone for BackendBucket<B> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<B: ObjectBackend> BackendBucket<B> {
    /// Validate the options and build a bucket over `backend`.
    pub fn new(backend: B, options: BucketOptions) -> Result<Self> {
        options.validate()?;
        let codec = KeyCodec::new(options.prefix.as_str());
        Ok(Self {
            core: Arc::new(BucketCore {
                backend,
                options,
                codec,
            }),
        })
    }

    pub fn backend(&self) -> &B {
        &self.core.backend
    }

    pub fn options(&self) -> &BucketOptions {
        &self.core.options
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.core.codec
    }

    pub(crate) fn core(&self) -> &BucketCore<B> {
        &self.core
    }
}

#[async_trait]
impl<B: ObjectBackend> Bucket for BackendBucket<B> {
    fn name(&self) -> &str {
        &self.core.options.name
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        self.core.trace("check", "", None);
        ensure_active(ctx)?;
        let session = self.backend().connection().session();
        run_cancellable(ctx, self.backend().ping(session.handle())).await
    }

    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
        self.core.trace("writer", key, None);
        self.core.open_writer(ctx, key).await
    }

    async fn reader(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.core.trace("reader", key, None);
        self.core.open_reader(ctx, key).await
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        key: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        self.core.trace("put", key, None);
        let mut writer = self.core.open_writer(ctx, key).await?;
        copy_to_writer(ctx, source, writer.as_mut()).await?;
        writer.close().await
    }

    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.core.trace("get", key, None);
        self.core.open_reader(ctx, key).await
    }

    async fn upload(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
        self.core.trace("upload", key, Some(path));
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BucketError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        self.put(ctx, key, &mut file).await
    }

    async fn download(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
        self.core.trace("download", key, Some(path));
        let mut reader = self.core.open_reader(ctx, key).await?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::File::create(path).await?;
        copy_to_file(ctx, &mut reader, &mut file).await?;
        Ok(())
    }

    async fn push(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        self.core.trace("push", &opts.remote, Some(&opts.local));
        sync::push(self, ctx, opts).await
    }

    async fn pull(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        self.core.trace("pull", &opts.remote, Some(&opts.local));
        sync::pull(self, ctx, opts).await
    }

    async fn copy(&self, ctx: &CancellationToken, opts: CopyOptions<'_>) -> Result<()> {
        self.core.trace("copy", &opts.source_key, None);
        let mut from = self.core.open_reader(ctx, &opts.source_key).await?;
        let mut to = opts
            .destination
            .writer(ctx, &opts.destination_key)
            .await
            .map_err(|err| {
                err.context("opening destination", opts.destination.name(), &opts.destination_key)
            })?;
        copy_to_writer(ctx, &mut from, to.as_mut()).await?;
        to.close().await
    }

    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        self.core.trace("remove", key, None);
        if self.core.options.dry_run {
            return Ok(());
        }
        ensure_active(ctx)?;
        let path = self.core.codec.normalize(key);
        let session = self.backend().connection().session();
        run_cancellable(ctx, self.backend().delete(session.handle(), &path))
            .await
            .map_err(|err| err.context("removing", self.backend().kind(), path))
    }

    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
        self.core.trace("remove_many", "", None);
        if self.core.options.dry_run {
            return Ok(());
        }
        let mut catcher = AggregateError::new();
        for key in keys {
            catcher.add(self.remove(ctx, key).await);
        }
        catcher.resolve()
    }

    async fn remove_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<()> {
        self.core.trace("remove_prefix", prefix, None);
        remove::remove_prefix(self, ctx, prefix).await
    }

    async fn remove_matching(&self, ctx: &CancellationToken, expression: &str) -> Result<()> {
        self.core.trace("remove_matching", expression, None);
        remove::remove_matching(self, ctx, expression).await
    }

    async fn list(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> Result<Box<dyn BucketIterator>> {
        self.core.trace("list", prefix, None);
        ensure_active(ctx)?;
        let query = self.core.codec.list_query(prefix);
        Ok(Box::new(PagedIterator::new(
            ctx,
            Arc::clone(&self.core),
            query,
        )))
    }
}
