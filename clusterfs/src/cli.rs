use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};

use crate::config::{Consistency, FileConfig, MountOptions, StoreConfig, load_config, parse_cache_size};
use crate::meta::DEFAULT_BLOCK_SIZE;

#[derive(Parser, Debug)]
#[command(name = "clusterfs", version, about = "Filesystem stored in an etcd/Xline cluster")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Turn on debug logging
    #[arg(long, global = true, env = "CLUSTERFS_DEBUG")]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mount a filesystem scope
    Mount(MountArgs),
    /// Write the schema marker of a keyspace
    InitSchema(InitSchemaArgs),
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// YAML configuration file; flags take precedence over its values
    #[arg(short, long, env = "CLUSTERFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cluster endpoints, comma separated
    #[arg(long = "server", env = "CLUSTERFS_SERVERS", value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Keyspace to use for the filesystem
    #[arg(long, env = "CLUSTERFS_KEYSPACE")]
    pub keyspace: Option<String>,
}

#[derive(Args, Debug)]
pub struct MountArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Mount directory
    #[arg(long, env = "CLUSTERFS_MOUNT", default_value = ".")]
    pub mount: PathBuf,

    /// ID of the filesystem owner
    #[arg(long, env = "CLUSTERFS_OWNER_ID")]
    pub owner: Option<i64>,

    /// Environment to mount
    #[arg(long, env = "CLUSTERFS_ENVIRONMENT")]
    pub environment: Option<String>,

    /// Metadata cache size with a K, M or G suffix; no cache when unset
    #[arg(long, env = "CLUSTERFS_CACHE")]
    pub cache: Option<String>,

    /// Metadata cache TTL in seconds
    #[arg(long, env = "CLUSTERFS_CACHE_TTL")]
    pub cache_ttl: Option<f64>,

    /// Read consistency requested from the cluster
    #[arg(long, value_enum, env = "CLUSTERFS_CONSISTENCY")]
    pub consistency: Option<Consistency>,

    /// Directory entries fetched per listing page
    #[arg(long, env = "CLUSTERFS_PAGE_SIZE")]
    pub page_size: Option<usize>,

    /// Retries of a request that failed with a transient error
    #[arg(long, env = "CLUSTERFS_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Kernel entry and attribute cache TTL in seconds
    #[arg(long, env = "CLUSTERFS_ENTRY_TTL", default_value_t = 1.0)]
    pub entry_ttl: f64,

    /// Kernel negative entry cache TTL in seconds
    #[arg(long, env = "CLUSTERFS_NEGATIVE_TTL", default_value_t = 1.0)]
    pub negative_ttl: f64,
}

#[derive(Args, Debug)]
pub struct InitSchemaArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Data block size in bytes, fixed for the lifetime of the keyspace
    #[arg(long, env = "CLUSTERFS_BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,
}

fn seconds(value: f64, what: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {what} `{value}`"))
}

impl StoreArgs {
    fn file(&self) -> anyhow::Result<FileConfig> {
        match &self.config {
            Some(path) => Ok(load_config(path)?),
            None => Ok(FileConfig::default()),
        }
    }

    /// Connection settings only; scope and cache keep their defaults.
    pub fn store_config(&self) -> anyhow::Result<StoreConfig> {
        let file = self.file()?;
        let mut config = StoreConfig::default();
        self.apply(&file, &mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, file: &FileConfig, config: &mut StoreConfig) {
        if !self.servers.is_empty() {
            config.endpoints = self.servers.clone();
        } else if let Some(endpoints) = &file.endpoints {
            config.endpoints = endpoints.clone();
        }
        if let Some(keyspace) = self.keyspace.as_ref().or(file.keyspace.as_ref()) {
            config.keyspace = keyspace.clone();
        }
    }
}

impl MountArgs {
    pub fn store_config(&self) -> anyhow::Result<StoreConfig> {
        let file = self.store.file()?;
        let mut config = StoreConfig::default();
        self.store.apply(&file, &mut config);

        if let Some(owner) = self.owner.or(file.owner_id) {
            config.owner_id = owner;
        }
        if let Some(environment) = self.environment.as_ref().or(file.environment.as_ref()) {
            config.environment = environment.clone();
        }
        if let Some(cache) = self.cache.as_ref().or(file.cache.as_ref()) {
            config.cache_size = parse_cache_size(cache)?;
            config.cache_enabled = config.cache_size > 0;
        }
        if let Some(ttl) = self.cache_ttl.or(file.cache_ttl_secs) {
            config.cache_ttl = seconds(ttl, "cache TTL")?;
        }
        if let Some(consistency) = self.consistency.or(file.consistency) {
            config.consistency = consistency;
        }
        if let Some(page_size) = self.page_size.or(file.page_size) {
            config.page_size = page_size;
        }
        if let Some(max_retries) = self.max_retries.or(file.max_retries) {
            config.retry.max_retries = max_retries;
        }
        config.validate()?;
        Ok(config)
    }

    /// Root owner and mode come from the mount point itself.
    pub fn mount_options(&self) -> anyhow::Result<MountOptions> {
        if !self.mount.is_dir() {
            bail!("mount point {} is not a directory", self.mount.display());
        }
        let mut options = MountOptions::from_mount_point(&self.mount)
            .with_context(|| format!("failed to stat {}", self.mount.display()))?;
        options.entry_ttl = seconds(self.entry_ttl, "entry TTL")?;
        options.negative_ttl = seconds(self.negative_ttl, "negative TTL")?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusterfs.yaml");
        std::fs::write(
            &path,
            "endpoints: [\"http://10.0.0.1:2379\"]\nenvironment: staging\nowner_id: 9\ncache: 1M\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "clusterfs",
            "mount",
            "--config",
            path.to_str().unwrap(),
            "--environment",
            "dev",
            "--consistency",
            "relaxed",
            "--mount",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();
        let Commands::Mount(args) = cli.command else {
            panic!("expected mount");
        };
        let config = args.store_config().unwrap();
        assert_eq!(config.endpoints, vec!["http://10.0.0.1:2379".to_string()]);
        assert_eq!(config.environment, "dev");
        assert_eq!(config.owner_id, 9);
        assert!(config.cache_enabled);
        assert_eq!(config.cache_size, 1 << 20);
        assert_eq!(config.consistency, Consistency::Relaxed);

        let options = args.mount_options().unwrap();
        assert_eq!(options.entry_ttl, Duration::from_secs(1));
    }

    #[test]
    fn test_init_schema_args() {
        let cli = Cli::try_parse_from([
            "clusterfs",
            "init-schema",
            "--server",
            "http://a:2379,http://b:2379",
            "--keyspace",
            "fs1",
            "--block-size",
            "8192",
        ])
        .unwrap();
        let Commands::InitSchema(args) = cli.command else {
            panic!("expected init-schema");
        };
        assert_eq!(args.block_size, 8192);
        let config = args.store.store_config().unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.keyspace, "fs1");
    }

    #[test]
    fn test_bad_cache_size_is_rejected() {
        let cli = Cli::try_parse_from(["clusterfs", "mount", "--cache", "12Q"]).unwrap();
        let Commands::Mount(args) = cli.command else {
            panic!("expected mount");
        };
        assert!(args.store_config().is_err());
    }
}
