//! Checksum based push and pull between a local tree and a remote prefix.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backend::ObjectBackend;
use crate::bucket::{BackendBucket, Bucket};
use crate::checksum::{checksums_match, md5_file};
use crate::error::{AggregateError, BucketError, Result};
use crate::keys::{consistent_join, relative_key, SEPARATOR};
use crate::options::{SyncDirection, SyncOptions};
use crate::remove::{collect_keys, compile};

pub(crate) async fn push<B: ObjectBackend>(
    bucket: &BackendBucket<B>,
    ctx: &CancellationToken,
    opts: &SyncOptions,
) -> Result<()> {
    let exclude = compile_exclude(opts.exclude.as_deref())?;
    let abort = BucketError::aborted(SyncDirection::Push);

    let files = walk_local_tree(ctx, &opts.local).await.map_err(&abort)?;
    let (mut uploaded, mut skipped) = (0usize, 0usize);

    for rel in &files {
        if is_excluded(exclude.as_ref(), rel) {
            debug!("Excluded {} from push", rel);
            continue;
        }
        if ctx.is_cancelled() {
            return Err(abort(BucketError::Canceled));
        }

        let source = local_path(&opts.local, rel);
        let target = consistent_join(&opts.remote, rel);

        let needs_upload = match bucket.core().stat(ctx, &target).await.map_err(&abort)? {
            None => true,
            Some(meta) => {
                let local = md5_file(&source).await.map_err(&abort)?;
                !checksums_match(&local, meta.checksum.as_deref())
            }
        };

        if needs_upload {
            debug!("Uploading {} -> {}", source.display(), target);
            bucket.upload(ctx, &target, &source).await.map_err(&abort)?;
            uploaded += 1;
        } else {
            debug!("Skipping {}: checksum unchanged", target);
            skipped += 1;
        }
    }

    debug!("Push to '{}': {} uploaded, {} unchanged", opts.remote, uploaded, skipped);

    let options = bucket.options();
    if (options.delete_on_push || options.delete_on_sync) && !options.dry_run {
        delete_on_push(bucket, ctx, &files, &opts.remote)
            .await
            .map_err(&abort)?;
    }
    Ok(())
}

pub(crate) async fn pull<B: ObjectBackend>(
    bucket: &BackendBucket<B>,
    ctx: &CancellationToken,
    opts: &SyncOptions,
) -> Result<()> {
    let exclude = compile_exclude(opts.exclude.as_deref())?;
    let abort = BucketError::aborted(SyncDirection::Pull);

    let mut iter = bucket.list(ctx, &opts.remote).await.map_err(&abort)?;
    let mut pulled = HashSet::new();
    let (mut downloaded, mut skipped) = (0usize, 0usize);

    while iter.next(ctx).await {
        let Some(item) = iter.item() else { continue };
        let key = item.name().to_string();
        let checksum = item.checksum().map(str::to_string);

        let rel = relative_key(&opts.remote, &key).to_string();
        if rel.is_empty() {
            debug!("Skipping {}: no path below '{}'", key, opts.remote);
            continue;
        }
        if !stays_inside_root(&rel) {
            warn!("Skipping {}: resolves outside {}", key, opts.local.display());
            continue;
        }
        if is_excluded(exclude.as_ref(), &rel) {
            debug!("Excluded {} from pull", rel);
            continue;
        }

        let dest = local_path(&opts.local, &rel);
        pulled.insert(rel);

        let needs_download = match md5_file(&dest).await {
            Ok(local) => !checksums_match(&local, checksum.as_deref()),
            Err(err) if err.is_not_found() => true,
            Err(err) => return Err(abort(err)),
        };

        if needs_download {
            debug!("Downloading {} -> {}", key, dest.display());
            bucket.download(ctx, &key, &dest).await.map_err(&abort)?;
            downloaded += 1;
        } else {
            debug!("Skipping {}: checksum unchanged", dest.display());
            skipped += 1;
        }
    }

    if let Some(err) = iter.take_err() {
        return Err(abort(err));
    }
    if ctx.is_cancelled() {
        return Err(abort(BucketError::Canceled));
    }

    debug!("Pull from '{}': {} downloaded, {} unchanged", opts.remote, downloaded, skipped);

    let options = bucket.options();
    if (options.delete_on_pull || options.delete_on_sync) && !options.dry_run {
        delete_on_pull(ctx, &opts.local, &pulled).await.map_err(&abort)?;
    }
    Ok(())
}

/// Every regular file under `root`, as sorted `/`-separated paths relative to `root`.
pub async fn walk_local_tree(ctx: &CancellationToken, root: &Path) -> Result<Vec<String>> {
    let root = root.to_path_buf();
    let token = ctx.clone();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            if token.is_cancelled() {
                return Err(BucketError::Canceled);
            }
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.path().strip_prefix(&root) {
                Ok(rel) if !rel.as_os_str().is_empty() => files.push(to_key(rel)),
                _ => {}
            }
        }
        files.sort();
        Ok(files)
    })
    .await
    .map_err(|e| BucketError::Io(std::io::Error::other(e)))?
}

/// Remove remote objects under `remote` whose relative path is not in `local_files`.
pub async fn delete_on_push(
    bucket: &dyn Bucket,
    ctx: &CancellationToken,
    local_files: &[String],
    remote: &str,
) -> Result<()> {
    let keep: HashSet<&str> = local_files.iter().map(String::as_str).collect();
    let doomed = collect_keys(bucket, ctx, remote, |key| {
        !keep.contains(relative_key(remote, key))
    })
    .await?;

    if doomed.is_empty() {
        return Ok(());
    }
    debug!("Deleting {} remote objects missing locally", doomed.len());
    bucket.remove_many(ctx, &doomed).await
}

/// Remove local files under `root` whose relative path is not in `pulled`.
pub async fn delete_on_pull(
    ctx: &CancellationToken,
    root: &Path,
    pulled: &HashSet<String>,
) -> Result<()> {
    if !tokio::fs::try_exists(root).await? {
        return Ok(());
    }

    let mut catcher = AggregateError::new();
    for rel in walk_local_tree(ctx, root).await? {
        if pulled.contains(&rel) {
            continue;
        }
        let path = local_path(root, &rel);
        debug!("Deleting {}: missing remotely", path.display());
        catcher.add(tokio::fs::remove_file(&path).await.map_err(BucketError::from));
    }
    catcher.resolve()
}

fn compile_exclude(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        Some(p) if !p.is_empty() => compile(p).map(Some),
        _ => Ok(None),
    }
}

fn is_excluded(exclude: Option<&Regex>, rel: &str) -> bool {
    exclude.is_some_and(|re| re.is_match(rel))
}

fn to_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

/// Whether `rel` names a path below the local root, without `.` or `..` segments.
fn stays_inside_root(rel: &str) -> bool {
    rel.split(SEPARATOR).all(|part| part != ".." && part != ".")
}

fn local_path(root: &Path, rel: &str) -> PathBuf {
    rel.split(SEPARATOR)
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |path, part| path.join(part))
}
