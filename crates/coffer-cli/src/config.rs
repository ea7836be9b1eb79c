use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use coffer_core::BucketOptions;
use coffer_local::LocalConfig;
use coffer_s3::S3Config;

/// Storage backend behind the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Files below a local directory.
    Local,
    /// S3 or an S3-compatible store (R2, MinIO).
    S3,
}

/// Configuration for the coffer command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "coffer")]
#[command(about = "Object storage buckets and checksum based sync from the command line")]
pub struct Config {
    /// Storage backend
    #[arg(long, value_enum, default_value = "local", env = "COFFER_BACKEND")]
    pub backend: BackendKind,

    /// Logical bucket name
    #[arg(long, default_value = "coffer", env = "COFFER_BUCKET")]
    pub bucket: String,

    /// Key prefix applied to every object
    #[arg(long, default_value = "", env = "COFFER_PREFIX")]
    pub prefix: String,

    /// Root directory of the local backend
    #[arg(long, default_value = "./coffer-data", env = "COFFER_LOCAL_PATH")]
    pub local_path: PathBuf,

    /// S3 bucket name
    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// S3 region
    #[arg(long, env = "S3_REGION")]
    pub s3_region: Option<String>,

    /// Custom S3 endpoint (R2, MinIO)
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// S3 access key ID
    #[arg(long, env = "S3_ACCESS_KEY_ID")]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long, env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_access_key: Option<String>,

    /// Use path-style S3 addressing
    #[arg(long, env = "S3_FORCE_PATH_STYLE")]
    pub s3_force_path_style: bool,

    /// Report what would change without modifying the bucket
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Log every bucket operation
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Cancel the command after this many seconds
    #[arg(long, env = "COFFER_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Verify the backend is reachable
    Check,
    /// List keys under a prefix
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Store a local file under a key
    Upload { key: String, path: PathBuf },
    /// Write an object to a local file
    Download { key: String, path: PathBuf },
    /// Print an object to stdout
    Cat { key: String },
    /// Mirror a local directory under a remote prefix
    Push {
        local: PathBuf,
        remote: String,
        /// Skip relative paths matching this regular expression
        #[arg(long)]
        exclude: Option<String>,
        /// Delete remote objects missing locally
        #[arg(long)]
        delete: bool,
    },
    /// Mirror a remote prefix into a local directory
    Pull {
        remote: String,
        local: PathBuf,
        /// Skip relative paths matching this regular expression
        #[arg(long)]
        exclude: Option<String>,
        /// Delete local files missing remotely
        #[arg(long)]
        delete: bool,
    },
    /// Copy an object, optionally into another prefix of the same backend
    Cp {
        source: String,
        destination: String,
        #[arg(long)]
        to_prefix: Option<String>,
    },
    /// Remove objects
    Rm {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Remove every object under a prefix
    RmPrefix { prefix: String },
    /// Remove every object whose key matches a regular expression
    RmMatching { expression: String },
}

impl Config {
    /// Bucket options for the selected command.
    pub fn bucket_options(&self) -> BucketOptions {
        let mut options = BucketOptions::new(self.bucket.as_str())
            .with_prefix(self.prefix.as_str())
            .dry_run(self.dry_run)
            .verbose(self.verbose);
        match &self.command {
            Command::Push { delete, .. } => options = options.delete_on_push(*delete),
            Command::Pull { delete, .. } => options = options.delete_on_pull(*delete),
            _ => {}
        }
        options
    }

    pub fn local_config(&self) -> LocalConfig {
        LocalConfig::new(self.local_path.clone())
    }

    pub fn s3_config(&self) -> S3Config {
        S3Config {
            bucket: self.s3_bucket.clone().unwrap_or_else(|| self.bucket.clone()),
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone(),
            access_key_id: self.s3_access_key_id.clone(),
            secret_access_key: self.s3_secret_access_key.clone(),
            force_path_style: self.s3_force_path_style,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_delete_maps_to_options() {
        let config = Config::try_parse_from([
            "coffer", "--bucket", "site", "--prefix", "www", "push", "./public", "v1", "--delete",
            "--dry-run",
        ])
        .unwrap();

        let options = config.bucket_options();
        assert_eq!(options.name, "site");
        assert_eq!(options.prefix, "www");
        assert!(options.delete_on_push);
        assert!(!options.delete_on_pull);
        assert!(options.dry_run);
    }

    #[test]
    fn test_s3_bucket_defaults_to_logical_name() {
        let config =
            Config::try_parse_from(["coffer", "--backend", "s3", "--bucket", "art", "check"])
                .unwrap();
        assert_eq!(config.backend, BackendKind::S3);
        assert_eq!(config.s3_config().bucket, "art");
    }

    #[test]
    fn test_rm_requires_keys() {
        assert!(Config::try_parse_from(["coffer", "rm"]).is_err());
    }
}
