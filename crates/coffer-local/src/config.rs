use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration of a local filesystem backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Root directory holding every object. Created if missing.
    pub path: PathBuf,
}

impl LocalConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}
