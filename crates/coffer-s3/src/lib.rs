//! S3-compatible backend for coffer.
//!
//! Object paths map one to one onto S3 keys inside the configured bucket:
//! ```text
//! {s3 bucket}/
//!   {prefix}/
//!     {key}
//! ```

mod backend;
mod config;

pub use backend::S3Backend;
pub use config::{S3Config, DEFAULT_REGION};

/// Bucket over an S3-compatible store.
pub type S3Bucket = coffer_core::BackendBucket<S3Backend>;

/// Connect to the store described by `config` and build a bucket for `options`.
pub async fn open_bucket(
    config: &S3Config,
    options: coffer_core::BucketOptions,
) -> coffer_core::Result<S3Bucket> {
    let backend = S3Backend::connect(config).await?;
    coffer_core::BackendBucket::new(backend, options)
}
