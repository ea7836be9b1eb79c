use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coffer_core::checksum::md5_file;
use coffer_core::keys::SEPARATOR;
use coffer_core::{
    BucketError, Connection, ListPage, ObjectBackend, ObjectMeta, ObjectReader, ObjectWriter,
    Result,
};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::config::LocalConfig;

const PARTIAL_SUFFIX: &str = ".coffer-partial";
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Root directory handle shared by every session.
#[derive(Debug, Clone)]
pub struct LocalRoot(Arc<PathBuf>);

impl LocalRoot {
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Filesystem path of an object. Rejects paths escaping the root.
    fn object_path(&self, path: &str) -> Result<PathBuf> {
        let mut out = self.0.as_ref().clone();
        let mut depth = 0;
        for part in path.split(SEPARATOR) {
            match part {
                "" | "." => continue,
                ".." => {
                    return Err(BucketError::backend(
                        "local",
                        format!("object path '{}' escapes the root", path),
                    ))
                }
                part => {
                    out.push(part);
                    depth += 1;
                }
            }
        }
        if depth == 0 {
            return Err(BucketError::backend("local", "empty object path"));
        }
        Ok(out)
    }

    fn not_found(&self, path: &str) -> BucketError {
        BucketError::NotFound {
            bucket: self.0.display().to_string(),
            key: path.to_string(),
        }
    }
}

/// Backend storing objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    connection: Connection<LocalRoot>,
    page_size: usize,
}

impl LocalBackend {
    /// Create the backend, creating the root directory if needed.
    pub fn new(config: &LocalConfig) -> Result<Self> {
        if config.path.as_os_str().is_empty() {
            return Err(BucketError::Configuration(
                "local backend path must be specified".to_string(),
            ));
        }
        std::fs::create_dir_all(&config.path)?;
        let root = LocalRoot(Arc::new(config.path.clone()));
        Ok(Self::with_connection(Connection::new(
            config.path.display().to_string(),
            root,
        )))
    }

    /// Share the root of another local backend.
    pub fn with_connection(connection: Connection<LocalRoot>) -> Self {
        Self {
            connection,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        self.connection.handle().path()
    }
}

/// Writes to a hidden sibling file, renamed over the object on close.
struct LocalWriter {
    file: Option<File>,
    partial: PathBuf,
    dest: PathBuf,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BucketError::backend("local", "write after close"))?;
        file.write_all(buf).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| BucketError::backend("local", "writer already closed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&self.partial, &self.dest).await?;
        debug!("Committed {}", self.dest.display());
        Ok(())
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.partial) {
                warn!("Failed to remove partial file {}: {}", self.partial.display(), e);
            }
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}{}", name, PARTIAL_SUFFIX))
}

fn list_files(root: &Path) -> Result<Vec<ObjectMeta>> {
    let mut objects = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join(&SEPARATOR.to_string());
        if path.ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        objects.push(ObjectMeta {
            path,
            size: metadata.len(),
            // Hashing every listed file is too costly; stat computes it on demand.
            checksum: None,
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    Ok(objects)
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    type Handle = LocalRoot;

    fn kind(&self) -> &'static str {
        "local"
    }

    fn connection(&self) -> &Connection<LocalRoot> {
        &self.connection
    }

    async fn ping(&self, root: &LocalRoot) -> Result<()> {
        match fs::metadata(root.path()).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BucketError::Connectivity {
                target: root.path().display().to_string(),
                message: "not a directory".to_string(),
            }),
            Err(e) => Err(BucketError::Connectivity {
                target: root.path().display().to_string(),
                message: e.to_string(),
            }),
        }
    }

    #[instrument(skip(self, root), level = "debug")]
    async fn open_reader(&self, root: &LocalRoot, path: &str) -> Result<ObjectReader> {
        let file_path = root.object_path(path)?;
        match fs::metadata(&file_path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(root.not_found(path)),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(root.not_found(path)),
            Err(e) => return Err(e.into()),
        }
        let file = File::open(&file_path).await?;
        Ok(Box::new(file))
    }

    #[instrument(skip(self, root), level = "debug")]
    async fn open_writer(&self, root: &LocalRoot, path: &str) -> Result<Box<dyn ObjectWriter>> {
        let dest = root.object_path(path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&dest);
        let file = File::create(&partial).await?;
        Ok(Box::new(LocalWriter {
            file: Some(file),
            partial,
            dest,
        }))
    }

    #[instrument(skip(self, root), level = "debug")]
    async fn stat(&self, root: &LocalRoot, path: &str) -> Result<Option<ObjectMeta>> {
        let file_path = root.object_path(path)?;
        let meta = match fs::metadata(&file_path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checksum = md5_file(&file_path).await?;
        Ok(Some(ObjectMeta {
            path: path.to_string(),
            size: meta.len(),
            checksum: Some(checksum),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }))
    }

    #[instrument(skip(self, root), level = "debug")]
    async fn delete(&self, root: &LocalRoot, path: &str) -> Result<()> {
        let file_path = root.object_path(path)?;
        match fs::remove_file(&file_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(root.not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, root), level = "debug")]
    async fn list_page(
        &self,
        root: &LocalRoot,
        prefix: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<ListPage> {
        let dir = root.path().to_path_buf();
        let mut objects = tokio::task::spawn_blocking(move || list_files(&dir))
            .await
            .map_err(|e| BucketError::Io(std::io::Error::other(e)))??;

        objects.retain(|o| {
            prefix.map_or(true, |p| o.path.starts_with(p))
                && cursor.map_or(true, |c| o.path.as_str() > c)
        });
        objects.sort_by(|a, b| a.path.cmp(&b.path));

        let next = if objects.len() > self.page_size {
            objects.truncate(self.page_size);
            objects.last().map(|o| o.path.clone())
        } else {
            None
        };
        debug!("Listed {} files under {}", objects.len(), root.path().display());
        Ok(ListPage { objects, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_core::{
        BackendBucket, Bucket, BucketOptions, CancellationToken, CopyOptions, MemoryBackend,
        SyncOptions,
    };
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn setup() -> (LocalBackend, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(&LocalConfig::new(temp_dir.path().join("store"))).unwrap();
        (backend, temp_dir)
    }

    #[tokio::test]
    async fn test_write_commits_on_close() {
        let (backend, _temp_dir) = setup();
        let root = backend.connection().handle().clone();

        let mut writer = backend.open_writer(&root, "a/b.txt").await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        assert!(backend.stat(&root, "a/b.txt").await.unwrap().is_none());

        writer.close().await.unwrap();
        let meta = backend.stat(&root, "a/b.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.checksum.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_nothing() {
        let (backend, _temp_dir) = setup();
        let root = backend.connection().handle().clone();

        let mut writer = backend.open_writer(&root, "x.bin").await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        drop(writer);

        let page = backend.list_page(&root, None, None).await.unwrap();
        assert!(page.objects.is_empty());
        assert!(!backend.root().join(".x.bin.coffer-partial").exists());
    }

    #[tokio::test]
    async fn test_missing_object() {
        let (backend, _temp_dir) = setup();
        let root = backend.connection().handle().clone();

        let err = backend.open_reader(&root, "nope").await.err().unwrap();
        assert!(err.is_not_found());
        let err = backend.delete(&root, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_escaping_paths_rejected() {
        let (backend, _temp_dir) = setup();
        let root = backend.connection().handle().clone();
        assert!(backend.open_writer(&root, "../outside").await.is_err());
    }

    #[tokio::test]
    async fn test_list_pages_in_path_order() {
        let (backend, _temp_dir) = setup();
        let backend = backend.with_page_size(2);
        for rel in ["a/z.txt", "a.txt", "b/c/d.txt", "ab.txt"] {
            let path = backend.root().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "x").unwrap();
        }
        let root = backend.connection().handle().clone();

        let first = backend.list_page(&root, Some("a"), None).await.unwrap();
        let names: Vec<_> = first.objects.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "a/z.txt"]);

        let second = backend
            .list_page(&root, Some("a"), first.next.as_deref())
            .await
            .unwrap();
        let names: Vec<_> = second.objects.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(names, vec!["ab.txt"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_ping() {
        let (backend, _temp_dir) = setup();
        let root = backend.connection().handle().clone();
        backend.ping(&root).await.unwrap();

        std::fs::remove_dir_all(backend.root()).unwrap();
        assert!(matches!(
            backend.ping(&root).await,
            Err(BucketError::Connectivity { .. })
        ));
    }

    #[tokio::test]
    async fn test_bucket_round_trip_and_push() {
        let (backend, temp_dir) = setup();
        let bucket =
            BackendBucket::new(backend, BucketOptions::new("files").with_prefix("mirror")).unwrap();
        let ctx = CancellationToken::new();

        let src = temp_dir.path().join("src");
        std::fs::create_dir_all(src.join("docs")).unwrap();
        std::fs::write(src.join("docs/readme.md"), "# readme").unwrap();

        bucket
            .push(&ctx, &SyncOptions::new(&src, "site"))
            .await
            .unwrap();
        assert!(bucket
            .backend()
            .root()
            .join("mirror/site/docs/readme.md")
            .exists());

        let mut reader = bucket.get(&ctx, "site/docs/readme.md").await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "# readme");
    }

    #[tokio::test]
    async fn test_copy_between_memory_and_local_buckets() {
        let (backend, _temp_dir) = setup();
        let local = BackendBucket::new(backend, BucketOptions::new("disk").with_prefix("in")).unwrap();
        let memory =
            BackendBucket::new(MemoryBackend::new(), BucketOptions::new("mem").with_prefix("m"))
                .unwrap();
        let ctx = CancellationToken::new();

        let mut body: &[u8] = b"travelling bytes";
        memory.put(&ctx, "src.bin", &mut body).await.unwrap();

        memory
            .copy(&ctx, CopyOptions::new("src.bin", &local, "dir/dst.bin"))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(local.backend().root().join("in/dir/dst.bin")).unwrap(),
            "travelling bytes"
        );

        local
            .copy(&ctx, CopyOptions::new("dir/dst.bin", &memory, "back.bin"))
            .await
            .unwrap();
        assert!(memory.backend().store().contains("m/back.bin"));

        assert_eq!(local.backend().connection().open_sessions(), 0);
        assert_eq!(memory.backend().connection().open_sessions(), 0);
    }
}
