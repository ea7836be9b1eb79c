use std::io::Write;

use anyhow::{bail, Context};
use coffer_core::{Bucket, BucketOptions, CancellationToken, CopyOptions, SyncOptions};
use tracing::info;

use crate::config::{BackendKind, Command, Config};

/// Open the bucket described by the configuration.
async fn open_bucket(config: &Config, options: BucketOptions) -> anyhow::Result<Box<dyn Bucket>> {
    let bucket: Box<dyn Bucket> = match config.backend {
        BackendKind::Local => {
            let local = config.local_config();
            Box::new(
                coffer_local::open_bucket(&local, options).with_context(|| {
                    format!("Failed to open local bucket at {}", local.path.display())
                })?,
            )
        }
        BackendKind::S3 => {
            let s3 = config.s3_config();
            Box::new(
                coffer_s3::open_bucket(&s3, options)
                    .await
                    .with_context(|| format!("Failed to open S3 bucket {}", s3.bucket))?,
            )
        }
    };
    Ok(bucket)
}

fn sync_options(
    local: &std::path::Path,
    remote: &str,
    exclude: &Option<String>,
) -> SyncOptions {
    let opts = SyncOptions::new(local, remote);
    match exclude {
        Some(pattern) => opts.exclude(pattern.as_str()),
        None => opts,
    }
}

pub async fn run(config: &Config, ctx: &CancellationToken) -> anyhow::Result<()> {
    let bucket = open_bucket(config, config.bucket_options()).await?;

    match &config.command {
        Command::Check => {
            bucket.check(ctx).await.context("Bucket check failed")?;
            info!("Bucket {} is reachable", bucket.name());
        }
        Command::Ls { prefix } => {
            let mut iter = bucket.list(ctx, prefix).await?;
            let mut out = std::io::stdout().lock();
            while iter.next(ctx).await {
                if let Some(item) = iter.item() {
                    writeln!(
                        out,
                        "{:>12}  {:<32}  {}",
                        item.size(),
                        item.checksum().unwrap_or("-"),
                        item.name()
                    )?;
                }
            }
            if let Some(err) = iter.take_err() {
                return Err(err).context("Listing failed");
            }
            if ctx.is_cancelled() {
                bail!("Listing canceled");
            }
        }
        Command::Upload { key, path } => {
            bucket
                .upload(ctx, key, path)
                .await
                .with_context(|| format!("Failed to upload {}", path.display()))?;
            info!("Uploaded {} to {}", path.display(), key);
        }
        Command::Download { key, path } => {
            bucket
                .download(ctx, key, path)
                .await
                .with_context(|| format!("Failed to download {}", key))?;
            info!("Downloaded {} to {}", key, path.display());
        }
        Command::Cat { key } => {
            let mut reader = bucket.get(ctx, key).await?;
            let mut stdout = tokio::io::stdout();
            tokio::select! {
                copied = tokio::io::copy(&mut reader, &mut stdout) => {
                    copied.with_context(|| format!("Failed to read {}", key))?;
                }
                _ = ctx.cancelled() => bail!("Read of {} canceled", key),
            }
        }
        Command::Push {
            local,
            remote,
            exclude,
            ..
        } => {
            bucket
                .push(ctx, &sync_options(local, remote, exclude))
                .await
                .context("Push failed")?;
            info!("Pushed {} to {}", local.display(), remote);
        }
        Command::Pull {
            remote,
            local,
            exclude,
            ..
        } => {
            bucket
                .pull(ctx, &sync_options(local, remote, exclude))
                .await
                .context("Pull failed")?;
            info!("Pulled {} to {}", remote, local.display());
        }
        Command::Cp {
            source,
            destination,
            to_prefix,
        } => {
            let target = match to_prefix {
                Some(prefix) => {
                    let options = config.bucket_options().with_prefix(prefix.as_str());
                    Some(open_bucket(config, options).await?)
                }
                None => None,
            };
            let target: &dyn Bucket = target.as_deref().unwrap_or(bucket.as_ref());
            bucket
                .copy(ctx, CopyOptions::new(source.as_str(), target, destination.as_str()))
                .await
                .with_context(|| format!("Failed to copy {} to {}", source, destination))?;
        }
        Command::Rm { keys } => {
            bucket.remove_many(ctx, keys).await?;
        }
        Command::RmPrefix { prefix } => {
            bucket.remove_prefix(ctx, prefix).await?;
        }
        Command::RmMatching { expression } => {
            bucket.remove_matching(ctx, expression).await?;
        }
    }

    Ok(())
}
