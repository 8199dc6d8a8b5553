//! Startup configuration: store connection/scoping, cache sizing and the
//! mount-time options that seed the root directory's attributes.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::meta::Scope;
use crate::store::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid cache size `{0}`: expected <number><K|M|G>, e.g. 512M")]
    CacheSize(String),
    #[error("invalid {field} `{value}`: must be non-empty and must not contain '/'")]
    Segment { field: &'static str, value: String },
    #[error("at least one cluster endpoint is required")]
    NoEndpoints,
    #[error("page size must be at least 1")]
    PageSize,
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Read consistency requested from the cluster.
///
/// `Strict` asks for linearizable reads; `Relaxed` lets any member answer from
/// its local state, which may lag behind the quorum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    #[default]
    Strict,
    Relaxed,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Cluster endpoints, e.g. `http://10.0.0.1:2379`.
    pub endpoints: Vec<String>,
    pub keyspace: String,
    pub owner_id: i64,
    pub environment: String,
    /// Cache capacity in bytes.
    pub cache_size: u64,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub consistency: Consistency,
    /// Directory entries fetched per listing page.
    pub page_size: usize,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            keyspace: "clusterfs".to_string(),
            owner_id: 1,
            environment: "prod".to_string(),
            cache_size: 0,
            cache_enabled: false,
            cache_ttl: Duration::from_secs(5),
            consistency: Consistency::Strict,
            page_size: 256,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    pub fn scope(&self) -> Scope {
        Scope::new(self.environment.clone(), self.owner_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        check_segment("keyspace", &self.keyspace)?;
        check_segment("environment", &self.environment)?;
        if self.page_size == 0 {
            return Err(ConfigError::PageSize);
        }
        Ok(())
    }
}

fn check_segment(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.contains('/') {
        return Err(ConfigError::Segment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Owner and permission bits reported for the root directory until it is
/// explicitly written, plus the TTLs handed to the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountOptions {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub entry_ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0o755,
            entry_ttl: Duration::from_secs(1),
            negative_ttl: Duration::from_secs(1),
        }
    }
}

impl MountOptions {
    /// Take owner and mode from the directory the filesystem is mounted on.
    pub fn from_mount_point(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
            ..Self::default()
        })
    }
}

/// Parse sizes such as `64K`, `512M` or `2G`.
pub fn parse_cache_size(size: &str) -> Result<u64, ConfigError> {
    let size = size.trim();
    let invalid = || ConfigError::CacheSize(size.to_string());
    let (last, _) = size.char_indices().last().ok_or_else(invalid)?;
    let (count, suffix) = size.split_at(last);
    let exp: u64 = match suffix.to_ascii_uppercase().as_str() {
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        _ => return Err(invalid()),
    };
    let count: u64 = count.parse().map_err(|_| invalid())?;
    count.checked_mul(exp).ok_or_else(invalid)
}

/// Optional YAML configuration file. Command line flags take precedence over
/// anything set here.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub endpoints: Option<Vec<String>>,
    pub keyspace: Option<String>,
    pub owner_id: Option<i64>,
    pub environment: Option<String>,
    pub cache: Option<String>,
    pub cache_ttl_secs: Option<f64>,
    pub consistency: Option<Consistency>,
    pub page_size: Option<usize>,
    pub max_retries: Option<u32>,
}

pub fn load_config(path: impl AsRef<Path>) -> Result<FileConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cache_size() {
        assert_eq!(parse_cache_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_cache_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_cache_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_cache_size("12").is_err());
        assert!(parse_cache_size("M").is_err());
        assert!(parse_cache_size("").is_err());
        assert!(parse_cache_size("-1K").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_segments() {
        let mut cfg = StoreConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.environment = "prod/eu".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Segment {
                field: "environment",
                ..
            })
        ));
        cfg.environment = "prod".into();
        cfg.endpoints.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoEndpoints)));
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusterfs.yaml");
        fs::write(
            &path,
            "endpoints: [\"http://10.0.0.1:2379\"]\nenvironment: staging\ncache: 64M\nconsistency: relaxed\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.environment.as_deref(), Some("staging"));
        assert_eq!(cfg.cache.as_deref(), Some("64M"));
        assert_eq!(cfg.consistency, Some(Consistency::Relaxed));
        assert!(cfg.owner_id.is_none());
    }

    #[test]
    fn test_mount_options_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let opts = MountOptions::from_mount_point(dir.path()).unwrap();
        let meta = fs::metadata(dir.path()).unwrap();
        assert_eq!(opts.uid, meta.uid());
        assert_eq!(opts.mode, meta.mode() & 0o7777);
    }
}
