//! Local filesystem backend for coffer.
//!
//! Objects are regular files below a root directory, named by their backend path:
//! ```text
//! {root}/
//!   {prefix}/
//!     {key}          # object bytes
//!     .{name}.coffer-partial   # in-flight write, renamed into place on close
//! ```

mod backend;
mod config;

pub use backend::{LocalBackend, LocalRoot};
pub use config::LocalConfig;

/// Bucket over the local filesystem.
pub type LocalBucket = coffer_core::BackendBucket<LocalBackend>;

/// Build a bucket for `options` over the directory described by `config`.
pub fn open_bucket(
    config: &LocalConfig,
    options: coffer_core::BucketOptions,
) -> coffer_core::Result<LocalBucket> {
    coffer_core::BackendBucket::new(LocalBackend::new(config)?, options)
}
