//! Application configuration.

pub mod app_config;
pub mod args;
pub mod cache_config;
pub mod storage;

pub use app_config::{AppConfig, LogLevel};
pub use args::{CliArgs, Command};
pub use cache_config::{CacheConfig, FootprintMeasure, ReuseRegime, mem_cache_size_for_percent};
pub use storage::{ConfigError, StorageManager};
