//! Locations and tunables, computed once and passed around explicitly

use crate::error::*;
use serde::Deserialize;
use std::{fs, path::*};

/// Environment variable overriding the home directory
pub const HOME_ENV: &str = "OCIVM_HOME";
/// Environment variable disabling automatic pruning before pulls
pub const NO_AUTO_PRUNE_ENV: &str = "OCIVM_NO_AUTO_PRUNE";

pub const DEFAULT_HOME_NAME: &str = ".ocivm";

/// Tunables read from `<home>/config.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Number of layers transferred at the same time
    pub concurrency: usize,
    /// Uncompressed size of a v2 disk layer
    pub layer_size_bytes: u64,
    /// Upload blobs in chunks of this many MiB, 0 for a single monolithic PUT
    pub upload_chunk_size_mb: usize,
    /// How many times a pull is retried on network errors
    pub pull_retries: usize,
    /// A cached image is only used as a deduplication base if it saves at least this many bytes
    pub min_dedup_savings_bytes: u64,
    /// Prune caches before a pull if the disk does not have enough free space
    pub auto_prune: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            concurrency: 4,
            layer_size_bytes: 512 * 1024 * 1024,
            upload_chunk_size_mb: 0,
            pull_retries: 5,
            min_dedup_savings_bytes: 1024 * 1024 * 1024,
            auto_prune: true,
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self> {
        if path.is_file() {
            Ok(toml::from_str(&fs::read_to_string(path)?)?)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    home_dir: PathBuf,
    pub settings: Settings,
}

impl Config {
    /// Use `home` as the root of all persisted state, with default settings
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Config {
            home_dir: home.into(),
            settings: Settings::default(),
        }
    }

    /// Resolve the home directory from `$OCIVM_HOME` or `~/.ocivm` and load its `config.toml`
    pub fn from_env() -> Result<Self> {
        let home_dir = match std::env::var_os(HOME_ENV) {
            Some(home) => PathBuf::from(home),
            None => directories::BaseDirs::new()
                .ok_or(Error::NoValidHomeDirectory)?
                .home_dir()
                .join(DEFAULT_HOME_NAME),
        };
        let mut settings = Settings::from_path(&home_dir.join("config.toml"))?;
        if std::env::var_os(NO_AUTO_PRUNE_ENV).is_some() {
            settings.auto_prune = false;
        }
        let config = Config { home_dir, settings };
        fs::create_dir_all(config.cache_dir())?;
        Ok(config)
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home_dir.join("cache")
    }

    /// Content root of images pulled from registries
    pub fn oci_dir(&self) -> PathBuf {
        self.cache_dir().join("OCIs")
    }

    pub fn ipsw_dir(&self) -> PathBuf {
        self.cache_dir().join("IPSWs")
    }

    /// Scratch space for VM directories under construction
    pub fn tmp_dir(&self) -> PathBuf {
        self.home_dir.join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let config = Config::new("/var/ocivm");
        assert_eq!(config.oci_dir(), Path::new("/var/ocivm/cache/OCIs"));
        assert_eq!(config.ipsw_dir(), Path::new("/var/ocivm/cache/IPSWs"));
        assert_eq!(config.tmp_dir(), Path::new("/var/ocivm/tmp"));
    }

    #[test]
    fn settings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        assert_eq!(Settings::from_path(&path)?, Settings::default());

        fs::write(&path, "concurrency = 8\nmin-dedup-savings-bytes = 0\n")?;
        let settings = Settings::from_path(&path)?;
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.min_dedup_savings_bytes, 0);
        assert_eq!(settings.pull_retries, Settings::default().pull_retries);

        fs::write(&path, "concurrency = \"many\"")?;
        assert!(matches!(Settings::from_path(&path), Err(Error::InvalidToml(_))));
        Ok(())
    }
}
