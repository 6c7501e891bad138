//! Configuration for the local tier, the remote tier and retention
//!
//! Everything here is plain data with `serde` support so the same structures
//! can be filled from CLI flags, environment variables or a JSON file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::compression::CompressionAlgorithm;
use crate::retention::RetentionPolicy;
use crate::{Result, SnapvaultError};

/// Default local snapshot directory
pub const DEFAULT_SNAPSHOT_DIR: &str = "/var/lib/snapvault/snapshots";

/// Local tier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding local snapshot artifacts
    pub snapshot_dir: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
        }
    }
}

/// Remote tier settings
///
/// Credentials are not configured here; they come from the standard AWS
/// provider chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// AWS region, defaults to the environment's
    #[serde(default)]
    pub region: Option<String>,
    /// Key prefix under which snapshots live, e.g. `cluster-a/`
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl S3Config {
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            prefix: String::new(),
            endpoint_url: None,
        }
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_endpoint_url<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    /// Prefix without a leading slash and with exactly one trailing slash,
    /// or empty
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(SnapvaultError::validation("S3 bucket name must not be empty"));
        }
        if self.bucket.contains('/') {
            return Err(SnapvaultError::validation(format!(
                "S3 bucket name '{}' must not contain '/'",
                self.bucket
            )));
        }
        if let Some(endpoint) = &self.endpoint_url {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(SnapvaultError::validation(format!(
                    "S3 endpoint '{endpoint}' must start with http:// or https://"
                )));
            }
        }
        Ok(())
    }
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub local: LocalConfig,
    /// Remote tier; `None` runs local-only
    pub remote: Option<S3Config>,
    pub policy: RetentionPolicy,
    /// Algorithm for newly ingested snapshots and preferred when resolving names
    pub compression: CompressionAlgorithm,
}

impl AppConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SnapvaultError::validation(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local.snapshot_dir.as_os_str().is_empty() {
            return Err(SnapvaultError::validation("Snapshot directory must not be empty"));
        }
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        Ok(())
    }
}

/// Where a snapshot to restore lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUri {
    /// A filesystem path or a bare snapshot name
    Local(PathBuf),
    /// `s3://bucket/key`
    Remote { bucket: String, key: String },
}

impl StorageUri {
    /// Split `s3://bucket/key` URIs from local paths
    pub fn parse(uri: &str) -> Result<Self> {
        let Some(rest) = uri.strip_prefix("s3://") else {
            if uri.is_empty() {
                return Err(SnapvaultError::validation("Snapshot source must not be empty"));
            }
            return Ok(StorageUri::Local(PathBuf::from(uri)));
        };

        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(SnapvaultError::validation(format!(
                "Invalid S3 URI '{uri}': missing bucket name"
            )));
        }
        if key.is_empty() || key.ends_with('/') {
            return Err(SnapvaultError::validation(format!(
                "Invalid S3 URI '{uri}': missing object key"
            )));
        }

        Ok(StorageUri::Remote {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Final path component: the snapshot name
    pub fn file_name(&self) -> Option<&str> {
        match self {
            StorageUri::Local(path) => path.file_name().and_then(|name| name.to_str()),
            StorageUri::Remote { key, .. } => key.rsplit('/').next(),
        }
    }

    /// Key prefix of a remote URI, including the trailing slash
    pub fn key_prefix(&self) -> Option<&str> {
        match self {
            StorageUri::Local(_) => None,
            StorageUri::Remote { key, .. } => Some(key.rfind('/').map_or("", |i| &key[..=i])),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageUri::Remote { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.local.snapshot_dir, PathBuf::from(DEFAULT_SNAPSHOT_DIR));
        assert!(config.remote.is_none());
        assert_eq!(config.policy, RetentionPolicy::default());
        assert_eq!(config.compression, CompressionAlgorithm::Zstd);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "local": {"snapshot_dir": "/tmp/snaps"},
                "remote": {"bucket": "backups", "prefix": "cluster-a"},
                "policy": {"keep_last": 2},
                "compression": "gzip"
            }"#,
        )
        .unwrap();

        assert_eq!(config.local.snapshot_dir, PathBuf::from("/tmp/snaps"));
        let remote = config.remote.as_ref().unwrap();
        assert_eq!(remote.bucket, "backups");
        assert_eq!(remote.normalized_prefix(), "cluster-a/");
        assert_eq!(config.policy.keep_last, 2);
        assert_eq!(config.policy.keep_hours, 24);
        assert_eq!(config.compression, CompressionAlgorithm::Gzip);
    }

    #[test]
    fn test_config_file_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("snapvault.json");
        let config = AppConfig {
            remote: Some(S3Config::new("backups").with_region("eu-west-1")),
            ..AppConfig::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(AppConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_s3_validation() {
        assert!(S3Config::new("backups").validate().is_ok());
        assert!(S3Config::new("").validate().is_err());
        assert!(S3Config::new("a/b").validate().is_err());
        assert!(S3Config::new("backups")
            .with_endpoint_url("localhost:4566")
            .validate()
            .is_err());
        assert!(S3Config::new("backups")
            .with_endpoint_url("http://localhost:4566")
            .validate()
            .is_ok());

        let config = AppConfig {
            remote: Some(S3Config::new(" ")),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(S3Config::new("b").normalized_prefix(), "");
        assert_eq!(S3Config::new("b").with_prefix("/").normalized_prefix(), "");
        assert_eq!(S3Config::new("b").with_prefix("/etcd/prod").normalized_prefix(), "etcd/prod/");
        assert_eq!(S3Config::new("b").with_prefix("etcd/").normalized_prefix(), "etcd/");
    }

    #[test]
    fn test_storage_uri_parsing() {
        let uri = StorageUri::parse("s3://backups/etcd/snap.db.zst").unwrap();
        assert_eq!(
            uri,
            StorageUri::Remote {
                bucket: "backups".to_string(),
                key: "etcd/snap.db.zst".to_string()
            }
        );
        assert_eq!(uri.file_name(), Some("snap.db.zst"));
        assert_eq!(uri.key_prefix(), Some("etcd/"));

        let flat = StorageUri::parse("s3://backups/snap.db").unwrap();
        assert_eq!(flat.key_prefix(), Some(""));

        let local = StorageUri::parse("/var/backups/snap.db").unwrap();
        assert!(!local.is_remote());
        assert_eq!(local.file_name(), Some("snap.db"));
    }

    #[test]
    fn test_storage_uri_rejects_incomplete_input() {
        assert!(StorageUri::parse("").is_err());
        assert!(StorageUri::parse("s3://").is_err());
        assert!(StorageUri::parse("s3:///key").is_err());
        assert!(StorageUri::parse("s3://bucket").is_err());
        assert!(StorageUri::parse("s3://bucket/dir/").is_err());
    }
}
