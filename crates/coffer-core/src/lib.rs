//! Core of the coffer object storage abstraction.
//!
//! A [`Bucket`] gives every backend the same operations: streaming reads and writes,
//! file transfers, lazy listing, bulk deletion and checksum based push/pull of local trees.
//! Backends only implement the storage primitives of [`ObjectBackend`]; [`BackendBucket`]
//! adds key prefixes, dry-run, session accounting and cancellation on top.

pub mod backend;
pub mod bucket;
pub mod checksum;
pub mod context;
pub mod error;
pub mod iter;
pub mod keys;
pub mod memory;
pub mod options;
pub mod remove;
pub mod session;
pub mod stream;
pub mod sync;

pub use backend::{ListPage, ObjectBackend, ObjectMeta};
pub use bucket::{BackendBucket, Bucket};
pub use context::{with_timeout, CancellationToken};
pub use error::{AggregateError, BucketError, Result};
pub use iter::{BucketItem, BucketIterator};
pub use keys::KeyCodec;
pub use memory::{MemoryBackend, MemoryStore};
pub use options::{BucketOptions, CopyOptions, SyncDirection, SyncOptions};
pub use session::{Connection, Session, SessionLease};
pub use stream::{DiscardWriter, ObjectReader, ObjectWriter};

/// Bucket over the in-memory backend.
pub type MemoryBucket = BackendBucket<MemoryBackend>;
