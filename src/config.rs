//! Runtime configuration for memcached-tiny.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Compression gating and the item size ceiling live here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::format::{EntryOptions, MAX_ITEM_SIZE};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "memcached-tiny", about = "memcached distributed-cache adapter tools")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the backend key a cache key maps to.
    Key {
        key: String,
    },

    /// Encode a file and describe the items it would be stored as.
    Inspect {
        file: PathBuf,

        #[command(flatten)]
        expiration: ExpirationArgs,
    },

    /// Store a file in an in-memory backend, read it back and verify it.
    Roundtrip {
        file: PathBuf,

        #[command(flatten)]
        expiration: ExpirationArgs,
    },
}

/// Expiration flags shared by the file commands.
#[derive(Args, Debug, Clone, Default)]
pub struct ExpirationArgs {
    /// Sliding expiration window in seconds.
    #[arg(long, conflicts_with = "ttl_secs")]
    pub sliding_secs: Option<u64>,

    /// Expiration relative to now, in seconds.
    #[arg(long)]
    pub ttl_secs: Option<u64>,
}

impl ExpirationArgs {
    pub fn to_options(&self) -> Option<EntryOptions> {
        if let Some(secs) = self.sliding_secs {
            return Some(EntryOptions::sliding(Duration::from_secs(secs)));
        }
        self.ttl_secs
            .map(|secs| EntryOptions::relative(Duration::from_secs(secs)))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compression settings.
    pub compression: CompressionConfig,

    /// Item storage settings.
    pub storage: StorageConfig,
}

/// Compression codec for stored values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    Gzip,
    Zstd,
}

/// Adaptive compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compress values on write. Compressed items are always readable.
    pub enabled: bool,

    /// Values shorter than this are stored raw.
    pub min_size: usize,

    /// Keep the compressed form only if it is at most this percentage of
    /// the original.
    pub rate: u32,

    pub codec: CompressionCodec,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 4 * 1024 - 16,
            rate: 80,
            codec: CompressionCodec::Gzip,
            zstd_level: 3,
        }
    }
}

/// Item storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Largest item written to the backend; bigger values are sharded.
    pub max_item_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_item_size: MAX_ITEM_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no backend could work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=100).contains(&self.compression.rate) {
            anyhow::bail!(
                "compression.rate must be within 1..=100, got {}",
                self.compression.rate
            );
        }
        if !(1..=22).contains(&self.compression.zstd_level) {
            anyhow::bail!(
                "compression.zstd_level must be within 1..=22, got {}",
                self.compression.zstd_level
            );
        }
        if self.storage.max_item_size < 1024 {
            anyhow::bail!(
                "storage.max_item_size must be at least 1024 bytes, got {}",
                self.storage.max_item_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert!(cfg.compression.enabled);
        assert_eq!(cfg.compression.min_size, 4080);
        assert_eq!(cfg.compression.rate, 80);
        assert_eq!(cfg.compression.codec, CompressionCodec::Gzip);
        assert_eq!(cfg.storage.max_item_size, 1_044_480);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"compression": {{"codec": "zstd", "rate": 50}}}}"#).unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.compression.codec, CompressionCodec::Zstd);
        assert_eq!(cfg.compression.rate, 50);
        assert_eq!(cfg.compression.min_size, 4080);
        assert_eq!(cfg.storage.max_item_size, 1_044_480);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(cfg.compression.enabled);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"compression": {{"rate": 0}}}}"#).unwrap();
        assert!(Config::load(file.path()).is_err());

        let mut cfg = Config::default();
        cfg.storage.max_item_size = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_expiration_args() {
        let args = ExpirationArgs {
            sliding_secs: Some(30),
            ttl_secs: None,
        };
        let options = args.to_options().unwrap();
        assert_eq!(options.sliding_expiration, Some(Duration::from_secs(30)));
        assert!(ExpirationArgs::default().to_options().is_none());
    }
}
