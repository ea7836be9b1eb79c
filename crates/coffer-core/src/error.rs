use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::options::SyncDirection;

/// Errors produced by buckets, backends and the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    /// Invalid or incomplete bucket options. Only raised while constructing a bucket.
    #[error("invalid bucket configuration: {0}")]
    Configuration(String),

    /// The backend could not be reached or did not answer a liveness probe.
    #[error("cannot reach {target}: {message}")]
    Connectivity { target: String, message: String },

    /// No object is stored under the requested path.
    #[error("object '{key}' not found in '{bucket}'")]
    NotFound { bucket: String, key: String },

    /// A local file taking part in a transfer does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("operation canceled")]
    Canceled,

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{backend} error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// A bucket item was resolved after its bucket was dropped.
    #[error("bucket item '{0}' outlived its bucket")]
    Detached(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Any other error, annotated with what was being done and to which object.
    #[error("problem {action} '{key}' in bucket '{bucket}': {source}")]
    Context {
        action: &'static str,
        bucket: String,
        key: String,
        #[source]
        source: Box<BucketError>,
    },

    /// A push or pull stopped at its first failure. Files already transferred stay transferred.
    #[error("{direction} aborted: {source}")]
    TransferAborted {
        direction: SyncDirection,
        #[source]
        source: Box<BucketError>,
    },
}

impl BucketError {
    pub fn backend(backend: &'static str, message: impl fmt::Display) -> Self {
        Self::Backend {
            backend,
            message: message.to_string(),
        }
    }

    /// Attach the action, bucket and key to an error.
    pub fn context(
        self,
        action: &'static str,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::Context {
            action,
            bucket: bucket.into(),
            key: key.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn aborted(direction: SyncDirection) -> impl Fn(BucketError) -> BucketError {
        move |err| Self::TransferAborted {
            direction,
            source: Box::new(err),
        }
    }

    /// Whether the root cause is a missing object or a missing local file.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::FileNotFound(_) => true,
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            Self::Context { source, .. } | Self::TransferAborted { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }

    /// Whether the root cause is cancellation of the governing token.
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Canceled => true,
            Self::Context { source, .. } | Self::TransferAborted { source, .. } => {
                source.is_canceled()
            }
            _ => false,
        }
    }
}

/// Collects one error per failed item of a bulk operation.
///
/// Every item is attempted; an empty collector resolves to `Ok(())`.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<BucketError>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one item, keeping only failures.
    pub fn add(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.errors.push(err);
        }
    }

    pub fn push(&mut self, err: BucketError) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[BucketError] {
        &self.errors
    }

    pub fn resolve(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(BucketError::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Result type alias for bucket operations.
pub type Result<T> = std::result::Result<T, BucketError>;
