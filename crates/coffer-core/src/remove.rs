//! Bulk deletion built on listing and `remove_many`.

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bucket::Bucket;
use crate::error::{BucketError, Result};

/// Remove every object whose key starts with `prefix`.
pub async fn remove_prefix(
    bucket: &dyn Bucket,
    ctx: &CancellationToken,
    prefix: &str,
) -> Result<()> {
    let keys = collect_keys(bucket, ctx, prefix, |_| true).await?;
    debug!("Removing {} objects under prefix '{}'", keys.len(), prefix);
    bucket.remove_many(ctx, &keys).await
}

/// Remove every object whose key matches `expression`.
pub async fn remove_matching(
    bucket: &dyn Bucket,
    ctx: &CancellationToken,
    expression: &str,
) -> Result<()> {
    let pattern = compile(expression)?;
    let keys = collect_keys(bucket, ctx, "", |key| pattern.is_match(key)).await?;
    debug!("Removing {} objects matching '{}'", keys.len(), expression);
    bucket.remove_many(ctx, &keys).await
}

pub(crate) fn compile(expression: &str) -> Result<Regex> {
    Regex::new(expression).map_err(|source| BucketError::Pattern {
        pattern: expression.to_string(),
        source,
    })
}

/// Keys under `prefix` accepted by `keep`, failing if the listing does.
pub(crate) async fn collect_keys<F>(
    bucket: &dyn Bucket,
    ctx: &CancellationToken,
    prefix: &str,
    keep: F,
) -> Result<Vec<String>>
where
    F: Fn(&str) -> bool + Send,
{
    let mut iter = bucket.list(ctx, prefix).await?;
    let mut keys = Vec::new();
    while iter.next(ctx).await {
        if let Some(item) = iter.item() {
            if keep(item.name()) {
                keys.push(item.name().to_string());
            }
        }
    }
    if let Some(err) = iter.take_err() {
        return Err(err);
    }
    if ctx.is_cancelled() {
        return Err(BucketError::Canceled);
    }
    Ok(keys)
}
