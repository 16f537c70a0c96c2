//! Cache configuration snapshot.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use super::storage::ConfigError;
use crate::domain::ports::CompressFormat;

const APP_NAME: &str = "pixcache";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "pixcache";
const DISK_CACHE_DIR: &str = "images_cache";

/// Default memory cache size in kilobytes (5 MiB).
pub const DEFAULT_MEM_CACHE_SIZE_KB: usize = 1024 * 5;
/// Default disk cache size in bytes (10 MiB).
pub const DEFAULT_DISK_CACHE_SIZE: u64 = 1024 * 1024 * 10;
/// Default compression quality for the disk tier.
pub const DEFAULT_COMPRESS_QUALITY: u8 = 70;
/// Smallest accepted memory share for [`CacheConfig::set_mem_cache_size_percent`].
pub const MIN_MEM_PERCENT: f32 = 0.01;
/// Largest accepted memory share for [`CacheConfig::set_mem_cache_size_percent`].
pub const MAX_MEM_PERCENT: f32 = 0.8;

/// Rule deciding whether a pooled buffer can host a new decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReuseRegime {
    /// Dimensions must match exactly and no subsampling is allowed.
    Strict,
    /// The allocation only needs to be large enough for the subsampled output.
    #[default]
    Relaxed,
}

/// How a buffer's footprint is measured for memory accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FootprintMeasure {
    /// Bytes actually allocated, including slack left by reuse.
    #[default]
    Allocation,
    /// `width * height * bytes_per_pixel`.
    PixelBytes,
    /// `row_stride * height`.
    RowStride,
}

/// Immutable cache setup, handed to the cache once.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep decoded buffers in memory.
    pub memory_cache_enabled: bool,
    /// Memory tier capacity in kilobytes.
    pub memory_cache_size_kb: usize,
    /// Keep compressed encodings on disk.
    pub disk_cache_enabled: bool,
    /// Disk tier capacity in bytes.
    pub disk_cache_size: u64,
    /// Disk tier directory; the platform cache directory when unset.
    pub disk_cache_dir: Option<PathBuf>,
    /// Encoding used for the disk tier.
    pub compress_format: CompressFormat,
    /// Encoder quality, 0-100.
    pub compress_quality: u8,
    /// Open the disk tier while the cache is being set up instead of in the background.
    pub init_disk_cache_on_create: bool,
    /// Buffer reuse compatibility rule.
    pub reuse_regime: ReuseRegime,
    /// Footprint accounting strategy.
    pub footprint_measure: FootprintMeasure,
    /// Maximum buffers held by the reuse pool.
    pub reuse_pool_capacity: usize,
    /// Seconds a pooled buffer may sit unused before it is dropped.
    pub reuse_pool_max_idle_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_enabled: true,
            memory_cache_size_kb: DEFAULT_MEM_CACHE_SIZE_KB,
            disk_cache_enabled: true,
            disk_cache_size: DEFAULT_DISK_CACHE_SIZE,
            disk_cache_dir: None,
            compress_format: CompressFormat::default(),
            compress_quality: DEFAULT_COMPRESS_QUALITY,
            init_disk_cache_on_create: false,
            reuse_regime: ReuseRegime::default(),
            footprint_measure: FootprintMeasure::default(),
            reuse_pool_capacity: 16,
            reuse_pool_max_idle_secs: 60,
        }
    }
}

impl CacheConfig {
    /// Config with the disk tier rooted at `dir`.
    #[must_use]
    pub fn with_disk_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            disk_cache_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Sizes the memory tier as a share of total system memory.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidMemoryPercent` unless `0.01 <= percent <= 0.8`.
    pub fn set_mem_cache_size_percent(&mut self, percent: f32) -> Result<(), ConfigError> {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        self.memory_cache_size_kb = mem_cache_size_for_percent(percent, system.total_memory())?;
        Ok(())
    }

    /// Checks ranges that serde cannot express.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidQuality` if the quality exceeds 100.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compress_quality > 100 {
            return Err(ConfigError::InvalidQuality(self.compress_quality));
        }
        Ok(())
    }

    /// The configured disk directory, or the platform default.
    #[must_use]
    pub fn effective_disk_cache_dir(&self) -> Option<PathBuf> {
        self.disk_cache_dir.clone().or_else(Self::default_disk_cache_dir)
    }

    /// `<platform cache dir>/images_cache`.
    #[must_use]
    pub fn default_disk_cache_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.cache_dir().join(DISK_CACHE_DIR))
    }

    /// Idle time after which pooled buffers are dropped.
    #[must_use]
    pub const fn reuse_pool_max_idle(&self) -> Duration {
        Duration::from_secs(self.reuse_pool_max_idle_secs)
    }
}

/// Converts a share of `budget_bytes` into a kilobyte capacity.
///
/// # Errors
/// Returns `ConfigError::InvalidMemoryPercent` unless `0.01 <= percent <= 0.8`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn mem_cache_size_for_percent(percent: f32, budget_bytes: u64) -> Result<usize, ConfigError> {
    if !(MIN_MEM_PERCENT..=MAX_MEM_PERCENT).contains(&percent) {
        return Err(ConfigError::InvalidMemoryPercent(percent));
    }
    let kilobytes = (f64::from(percent) * budget_bytes as f64 / 1024.0).round();
    Ok(kilobytes as usize)
}
