use coffer_core::{BucketError, Result};
use serde::{Deserialize, Serialize};

/// Region used when none is configured. R2 and most S3-compatible stores accept it.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for an S3-compatible object store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Name of the S3 bucket holding the objects.
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint, for R2, MinIO and the like.
    pub endpoint: Option<String>,
    /// Static credentials. When absent the default AWS provider chain is used.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Settings for a Cloudflare R2 bucket.
    pub fn r2(
        account_id: &str,
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: Some("auto".to_string()),
            endpoint: Some(format!("https://{}.r2.cloudflarestorage.com", account_id)),
            access_key_id: Some(access_key_id.into()),
            secret_access_key: Some(secret_access_key.into()),
            force_path_style: true,
        }
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(BucketError::Configuration(
                "S3 bucket must be specified".to_string(),
            ));
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(BucketError::Configuration(
                "S3 access key id and secret access key must be given together".to_string(),
            ));
        }
        Ok(())
    }
}
