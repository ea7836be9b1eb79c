use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bucket::Bucket;
use crate::error::{BucketError, Result};

/// Options shared by every bucket backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketOptions {
    /// Logical bucket name. Required.
    pub name: String,
    /// Key prefix applied to every object of this bucket.
    pub prefix: String,
    /// Skip every mutating backend call while still opening readers and listing.
    pub dry_run: bool,
    /// Emit a diagnostic line for each public operation.
    pub verbose: bool,
    /// After a push, delete remote objects with no local counterpart.
    pub delete_on_push: bool,
    /// After a pull, delete local files with no remote counterpart.
    pub delete_on_pull: bool,
    /// Reserved for bidirectional sync. Counts towards the one-delete-flag limit.
    pub delete_on_sync: bool,
}

impl BucketOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn delete_on_push(mut self, enabled: bool) -> Self {
        self.delete_on_push = enabled;
        self
    }

    pub fn delete_on_pull(mut self, enabled: bool) -> Self {
        self.delete_on_pull = enabled;
        self
    }

    pub fn delete_on_sync(mut self, enabled: bool) -> Self {
        self.delete_on_sync = enabled;
        self
    }

    /// Check the options before a bucket is built from them.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BucketError::Configuration(
                "bucket name must be specified".to_string(),
            ));
        }

        let deletes = [self.delete_on_push, self.delete_on_pull, self.delete_on_sync]
            .iter()
            .filter(|flag| **flag)
            .count();
        if deletes > 1 {
            return Err(BucketError::Configuration(
                "cannot combine delete-on-push, delete-on-pull and delete-on-sync".to_string(),
            ));
        }

        Ok(())
    }
}

/// Arguments of a push or pull between a local directory and a remote key prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub local: PathBuf,
    pub remote: String,
    /// Regular expression; matching relative paths are skipped.
    #[serde(default)]
    pub exclude: Option<String>,
}

impl SyncOptions {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            exclude: None,
        }
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude = Some(pattern.into());
        self
    }
}

/// Arguments of a bucket-to-bucket copy.
pub struct CopyOptions<'a> {
    pub source_key: String,
    pub destination_key: String,
    pub destination: &'a dyn Bucket,
}

impl<'a> CopyOptions<'a> {
    pub fn new(
        source_key: impl Into<String>,
        destination: &'a dyn Bucket,
        destination_key: impl Into<String>,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            destination_key: destination_key.into(),
            destination,
        }
    }
}

impl fmt::Debug for CopyOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOptions")
            .field("source_key", &self.source_key)
            .field("destination_key", &self.destination_key)
            .field("destination", &self.destination.name())
            .finish()
    }
}

/// Direction of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Push,
    Pull,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => f.write_str("push"),
            Self::Pull => f.write_str("pull"),
        }
    }
}
