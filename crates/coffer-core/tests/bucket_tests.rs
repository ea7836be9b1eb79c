use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use coffer_core::{
    BackendBucket, Bucket, BucketError, BucketOptions, CancellationToken, Connection,
    CopyOptions, ListPage, MemoryBackend, MemoryBucket, ObjectBackend, ObjectMeta, ObjectReader,
    ObjectWriter, SyncOptions,
};
use rstest::*;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

fn bucket_with(options: BucketOptions) -> MemoryBucket {
    BackendBucket::new(MemoryBackend::new(), options).unwrap()
}

#[fixture]
fn bucket() -> MemoryBucket {
    bucket_with(BucketOptions::new("test").with_prefix("pfx"))
}

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

async fn read_key(bucket: &dyn Bucket, key: &str) -> String {
    let ctx = CancellationToken::new();
    let mut reader = bucket.get(&ctx, key).await.unwrap();
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    out
}

async fn list_keys(bucket: &dyn Bucket, prefix: &str) -> Vec<String> {
    let ctx = CancellationToken::new();
    let mut iter = bucket.list(&ctx, prefix).await.unwrap();
    let mut keys = Vec::new();
    while iter.next(&ctx).await {
        keys.push(iter.item().unwrap().name().to_string());
    }
    assert!(iter.err().is_none());
    keys.sort();
    keys
}

async fn wait_for_no_sessions<B: ObjectBackend>(bucket: &BackendBucket<B>) -> bool {
    for _ in 0..200 {
        if bucket.backend().connection().open_sessions() == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[rstest]
#[tokio::test]
async fn test_put_then_get(bucket: MemoryBucket) {
    let ctx = CancellationToken::new();
    let mut body: &[u8] = b"payload";
    bucket.put(&ctx, "dir/a.txt", &mut body).await.unwrap();

    assert!(bucket.backend().store().contains("pfx/dir/a.txt"));
    assert_eq!(read_key(&bucket, "dir/a.txt").await, "payload");
    assert!(wait_for_no_sessions(&bucket).await);
}

#[rstest]
#[tokio::test]
async fn test_get_missing_is_not_found(bucket: MemoryBucket) {
    let ctx = CancellationToken::new();
    let err = bucket.get(&ctx, "missing").await.err().unwrap();
    assert!(err.is_not_found());
    assert!(wait_for_no_sessions(&bucket).await);
}

#[tokio::test]
async fn test_dry_run_leaves_backend_untouched() {
    let bucket = bucket_with(BucketOptions::new("test").dry_run(true));
    let store = bucket.backend().store().clone();
    store.insert("keep.txt", "kept");
    let calls_before = store.calls();

    let ctx = CancellationToken::new();
    let mut body: &[u8] = b"ignored";
    bucket.put(&ctx, "new.txt", &mut body).await.unwrap();
    bucket.remove(&ctx, "keep.txt").await.unwrap();
    bucket
        .remove_many(&ctx, &["keep.txt".to_string(), "absent".to_string()])
        .await
        .unwrap();

    assert_eq!(store.paths(), vec!["keep.txt".to_string()]);
    assert_eq!(store.calls(), calls_before);

    // Reads are unaffected.
    assert_eq!(read_key(&bucket, "keep.txt").await, "kept");
}

#[rstest]
#[tokio::test]
async fn test_push_twice_uploads_nothing_the_second_time(bucket: MemoryBucket) {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "alpha");
    write(dir.path(), "nested/b.txt", "beta");

    let ctx = CancellationToken::new();
    let opts = SyncOptions::new(dir.path(), "remote");
    bucket.push(&ctx, &opts).await.unwrap();

    let store = bucket.backend().store();
    assert_eq!(store.writes(), 2);
    assert_eq!(
        store.paths(),
        vec!["pfx/remote/a.txt".to_string(), "pfx/remote/nested/b.txt".to_string()]
    );

    bucket.push(&ctx, &opts).await.unwrap();
    assert_eq!(store.writes(), 2);

    write(dir.path(), "a.txt", "changed");
    bucket.push(&ctx, &opts).await.unwrap();
    assert_eq!(store.writes(), 3);
    assert_eq!(read_key(&bucket, "remote/a.txt").await, "changed");
}

#[tokio::test]
async fn test_push_without_remote_checksums_always_uploads() {
    let bucket = BackendBucket::new(MemoryBackend::without_checksums(), BucketOptions::new("t"))
        .unwrap();
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "alpha");

    let ctx = CancellationToken::new();
    let opts = SyncOptions::new(dir.path(), "r");
    bucket.push(&ctx, &opts).await.unwrap();
    bucket.push(&ctx, &opts).await.unwrap();
    assert_eq!(bucket.backend().store().writes(), 2);
}

#[tokio::test]
async fn test_push_with_delete_reconciles_remote() {
    let bucket = bucket_with(BucketOptions::new("test").delete_on_push(true));
    let store = bucket.backend().store().clone();
    store.insert("remote/stale.txt", "old");
    store.insert("remote/a.txt", "old a");
    store.insert("elsewhere/x.txt", "untouched");

    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "alpha");
    write(dir.path(), "sub/b.txt", "beta");
    write(dir.path(), "skip.tmp", "excluded");

    let ctx = CancellationToken::new();
    let opts = SyncOptions::new(dir.path(), "remote").exclude(r"\.tmp$");
    bucket.push(&ctx, &opts).await.unwrap();

    assert_eq!(
        list_keys(&bucket, "remote").await,
        vec!["remote/a.txt".to_string(), "remote/sub/b.txt".to_string()]
    );
    assert!(store.contains("elsewhere/x.txt"));
    assert_eq!(read_key(&bucket, "remote/a.txt").await, "alpha");
}

#[tokio::test]
async fn test_push_with_delete_skipped_under_dry_run() {
    let bucket = bucket_with(
        BucketOptions::new("test")
            .delete_on_push(true)
            .dry_run(true),
    );
    let store = bucket.backend().store().clone();
    store.insert("remote/stale.txt", "old");

    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "alpha");

    let ctx = CancellationToken::new();
    bucket
        .push(&ctx, &SyncOptions::new(dir.path(), "remote"))
        .await
        .unwrap();
    assert_eq!(store.paths(), vec!["remote/stale.txt".to_string()]);
}

#[rstest]
#[tokio::test]
async fn test_push_bad_pattern_fails_before_io(bucket: MemoryBucket) {
    let ctx = CancellationToken::new();
    let opts = SyncOptions::new("/definitely/not/here", "r").exclude("(");
    let err = bucket.push(&ctx, &opts).await.unwrap_err();
    assert!(matches!(err, BucketError::Pattern { .. }));
    assert_eq!(bucket.backend().store().calls(), 0);
}

#[rstest]
#[tokio::test]
async fn test_push_missing_local_root_aborts(bucket: MemoryBucket) {
    let dir = TempDir::new().unwrap();
    let ctx = CancellationToken::new();
    let err = bucket
        .push(&ctx, &SyncOptions::new(dir.path().join("absent"), "r"))
        .await
        .unwrap_err();
    assert!(matches!(err, BucketError::TransferAborted { .. }));
}

#[rstest]
#[tokio::test]
async fn test_pull_downloads_absent_files(bucket: MemoryBucket) {
    let ctx = CancellationToken::new();
    for (key, body) in [("r/a.txt", "alpha"), ("r/deep/b.txt", "beta")] {
        let mut body = body.as_bytes();
        bucket.put(&ctx, key, &mut body).await.unwrap();
    }

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("out");
    bucket
        .pull(&ctx, &SyncOptions::new(&local, "r"))
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(local.join("a.txt")).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(local.join("deep/b.txt")).unwrap(), "beta");
    assert!(wait_for_no_sessions(&bucket).await);
}

#[tokio::test]
async fn test_pull_skips_matching_and_deletes_stale() {
    let bucket = bucket_with(BucketOptions::new("test").delete_on_pull(true));
    let ctx = CancellationToken::new();
    for (key, body) in [("r/same.txt", "same"), ("r/new.txt", "fresh"), ("r/x.log", "log")] {
        let mut body = body.as_bytes();
        bucket.put(&ctx, key, &mut body).await.unwrap();
    }

    let dir = TempDir::new().unwrap();
    write(dir.path(), "same.txt", "same");
    write(dir.path(), "stale.txt", "gone soon");
    let calls_before = bucket.backend().store().calls();

    bucket
        .pull(&ctx, &SyncOptions::new(dir.path(), "r").exclude(r"\.log$"))
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(dir.path().join("new.txt")).unwrap(), "fresh");
    assert_eq!(std::fs::read_to_string(dir.path().join("same.txt")).unwrap(), "same");
    assert!(!dir.path().join("stale.txt").exists());
    assert!(!dir.path().join("x.log").exists());

    // One list page and one read for new.txt.
    assert_eq!(bucket.backend().store().calls() - calls_before, 2);
}

#[tokio::test]
async fn test_pull_never_writes_outside_local_root() {
    let bucket = bucket_with(BucketOptions::new("test"));
    let store = bucket.backend().store().clone();
    store.insert("r/../escaped.txt", "outside");
    store.insert("r/./dot.txt", "dot");
    store.insert("r/inside.txt", "inside");

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("out");
    let ctx = CancellationToken::new();
    bucket.pull(&ctx, &SyncOptions::new(&local, "r")).await.unwrap();

    assert_eq!(std::fs::read_to_string(local.join("inside.txt")).unwrap(), "inside");
    assert!(!dir.path().join("escaped.txt").exists());
    assert!(!local.join("dot.txt").exists());
}

#[tokio::test]
async fn test_remove_many_attempts_every_key() {
    let bucket = bucket_with(BucketOptions::new("test"));
    let store = bucket.backend().store().clone();
    store.insert("a", "1");
    store.insert("c", "3");

    let ctx = CancellationToken::new();
    let keys = vec!["a".to_string(), "missing".to_string(), "c".to_string()];
    let err = bucket.remove_many(&ctx, &keys).await.unwrap_err();

    match err {
        BucketError::Aggregate(agg) => {
            assert_eq!(agg.len(), 1);
            assert!(agg.errors()[0].is_not_found());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(store.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_list_with_cancelled_token_makes_no_backend_call(bucket: MemoryBucket) {
    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = bucket.list(&ctx, "").await.err().unwrap();
    assert!(err.is_canceled());
    assert_eq!(bucket.backend().store().calls(), 0);
    assert_eq!(bucket.backend().connection().open_sessions(), 0);
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(1000)]
#[tokio::test]
async fn test_iterator_yields_each_object_once(#[case] page_size: usize) {
    let backend = MemoryBackend::new().with_page_size(page_size);
    for i in 0..7 {
        backend.store().insert(format!("logs/{i}.txt"), "x");
    }
    backend.store().insert("other/0.txt", "x");
    let bucket = BackendBucket::new(backend, BucketOptions::new("test")).unwrap();

    let ctx = CancellationToken::new();
    let mut iter = bucket.list(&ctx, "logs/").await.unwrap();
    let mut count = 0;
    while iter.next(&ctx).await {
        count += 1;
    }
    assert_eq!(count, 7);
    assert!(!iter.next(&ctx).await);
    assert!(iter.err().is_none());
    assert!(wait_for_no_sessions(&bucket).await);
}

#[tokio::test]
async fn test_list_prefix_is_literal() {
    let bucket = bucket_with(BucketOptions::new("test"));
    let store = bucket.backend().store().clone();
    store.insert("abc/1", "x");
    store.insert("abc123", "x");
    store.insert("ab", "x");

    assert_eq!(
        list_keys(&bucket, "abc").await,
        vec!["abc/1".to_string(), "abc123".to_string()]
    );
    assert_eq!(list_keys(&bucket, "").await.len(), 3);
}

#[tokio::test]
async fn test_iterator_stops_when_cancelled_and_releases_session() {
    let bucket = bucket_with(BucketOptions::new("test"));
    for i in 0..5 {
        bucket.backend().store().insert(format!("k{i}"), "x");
    }

    let ctx = CancellationToken::new();
    let mut iter = bucket.list(&ctx, "").await.unwrap();
    assert!(iter.next(&ctx).await);
    assert_eq!(bucket.backend().connection().open_sessions(), 1);

    ctx.cancel();
    assert!(!iter.next(&ctx).await);
    assert!(iter.err().is_none());
    assert!(wait_for_no_sessions(&bucket).await);
}

#[tokio::test]
async fn test_abandoned_iterator_releases_session_on_drop() {
    let bucket = bucket_with(BucketOptions::new("test"));
    bucket.backend().store().insert("k", "x");

    let ctx = CancellationToken::new();
    let mut iter = bucket.list(&ctx, "").await.unwrap();
    assert!(iter.next(&ctx).await);
    drop(iter);
    assert!(wait_for_no_sessions(&bucket).await);
}

#[tokio::test]
async fn test_item_reads_through_its_bucket() {
    let bucket = bucket_with(BucketOptions::new("test").with_prefix("p"));
    let ctx = CancellationToken::new();
    let mut body: &[u8] = b"contents";
    bucket.put(&ctx, "doc.txt", &mut body).await.unwrap();

    let mut iter = bucket.list(&ctx, "").await.unwrap();
    assert!(iter.next(&ctx).await);
    let item = iter.item().unwrap().clone();
    assert_eq!(item.name(), "doc.txt");
    assert_eq!(item.bucket_prefix(), "p");
    assert!(item.checksum().is_some());

    let mut out = String::new();
    item.get(&ctx).await.unwrap().read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "contents");

    drop(iter);
    drop(bucket);
    let err = item.get(&ctx).await.err().unwrap();
    assert!(matches!(err, BucketError::Detached(_)));
}

#[tokio::test]
async fn test_copy_between_buckets() {
    let source = bucket_with(BucketOptions::new("src").with_prefix("a"));
    let destination = bucket_with(BucketOptions::new("dst").with_prefix("b"));
    let ctx = CancellationToken::new();
    let mut body: &[u8] = b"copied bytes";
    source.put(&ctx, "in.bin", &mut body).await.unwrap();

    source
        .copy(&ctx, CopyOptions::new("in.bin", &destination, "out.bin"))
        .await
        .unwrap();

    assert!(destination.backend().store().contains("b/out.bin"));
    assert_eq!(read_key(&destination, "out.bin").await, "copied bytes");
}

#[tokio::test]
async fn test_remove_prefix_and_matching() {
    let bucket = bucket_with(BucketOptions::new("test"));
    let store = bucket.backend().store().clone();
    for path in ["tmp/a", "tmp/b", "keep/c.log", "keep/d.txt"] {
        store.insert(path, "x");
    }

    let ctx = CancellationToken::new();
    bucket.remove_prefix(&ctx, "tmp/").await.unwrap();
    assert_eq!(store.paths(), vec!["keep/c.log".to_string(), "keep/d.txt".to_string()]);

    bucket.remove_matching(&ctx, r"\.log$").await.unwrap();
    assert_eq!(store.paths(), vec!["keep/d.txt".to_string()]);

    let err = bucket.remove_matching(&ctx, "[").await.unwrap_err();
    assert!(matches!(err, BucketError::Pattern { .. }));
}

#[tokio::test]
async fn test_upload_missing_file() {
    let bucket = bucket_with(BucketOptions::new("test"));
    let dir = TempDir::new().unwrap();
    let ctx = CancellationToken::new();
    let err = bucket
        .upload(&ctx, "k", &dir.path().join("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, BucketError::FileNotFound(_)));
}

#[tokio::test]
async fn test_buckets_sharing_a_connection() {
    let first = bucket_with(BucketOptions::new("one").with_prefix("one"));
    let shared: Connection<_> = first.backend().connection().clone();
    let second = BackendBucket::new(
        MemoryBackend::with_connection(shared),
        BucketOptions::new("two").with_prefix("two"),
    )
    .unwrap();

    let ctx = CancellationToken::new();
    let mut body: &[u8] = b"x";
    second.put(&ctx, "k", &mut body).await.unwrap();
    assert!(first.backend().store().contains("two/k"));
    assert!(list_keys(&first, "").await.is_empty());
    first.check(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_put_leaves_no_object() {
    let bucket = bucket_with(BucketOptions::new("test"));
    let ctx = CancellationToken::new();
    let mut writer = bucket.writer(&ctx, "partial").await.unwrap();
    writer.write_all(b"half").await.unwrap();
    ctx.cancel();

    assert!(writer.write_all(b"rest").await.unwrap_err().is_canceled());
    assert!(writer.close().await.unwrap_err().is_canceled());
    assert!(!bucket.backend().store().contains("partial"));
    assert!(wait_for_no_sessions(&bucket).await);
}

/// Backend whose objects deliver one chunk and then stall until the test ends.
struct StalledSource {
    connection: Connection<()>,
    feeds: Mutex<Vec<DuplexStream>>,
}

impl StalledSource {
    fn new() -> Self {
        Self {
            connection: Connection::new("stalled", ()),
            feeds: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ObjectBackend for StalledSource {
    type Handle = ();

    fn kind(&self) -> &'static str {
        "stalled"
    }

    fn connection(&self) -> &Connection<()> {
        &self.connection
    }

    async fn ping(&self, _handle: &()) -> coffer_core::Result<()> {
        Ok(())
    }

    async fn open_reader(&self, _handle: &(), _path: &str) -> coffer_core::Result<ObjectReader> {
        let (mut feed, reader) = tokio::io::duplex(64);
        feed.write_all(b"first chunk").await?;
        self.feeds.lock().unwrap().push(feed);
        Ok(Box::new(reader))
    }

    async fn open_writer(
        &self,
        _handle: &(),
        _path: &str,
    ) -> coffer_core::Result<Box<dyn ObjectWriter>> {
        Err(BucketError::backend("stalled", "read only"))
    }

    async fn stat(&self, _handle: &(), _path: &str) -> coffer_core::Result<Option<ObjectMeta>> {
        Ok(None)
    }

    async fn delete(&self, _handle: &(), _path: &str) -> coffer_core::Result<()> {
        Ok(())
    }

    async fn list_page(
        &self,
        _handle: &(),
        _prefix: Option<&str>,
        _cursor: Option<&str>,
    ) -> coffer_core::Result<ListPage> {
        Ok(ListPage::default())
    }
}

#[tokio::test]
async fn test_cancelled_copy_leaves_no_object() {
    let source = BackendBucket::new(StalledSource::new(), BucketOptions::new("src")).unwrap();
    let destination = bucket_with(BucketOptions::new("dst"));
    let ctx = CancellationToken::new();

    let trigger = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let copy = source.copy(&ctx, CopyOptions::new("in.bin", &destination, "out.bin"));
    let err = tokio::time::timeout(Duration::from_secs(2), copy)
        .await
        .unwrap()
        .unwrap_err();

    assert!(err.is_canceled());
    assert!(!destination.backend().store().contains("out.bin"));
    assert!(wait_for_no_sessions(&source).await);
    assert!(wait_for_no_sessions(&destination).await);
}
