use super::app_config::LogLevel;
use crate::domain::entities::SizeClass;
use crate::domain::ports::CompressFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "pixcache",
    version,
    about = "Inspect and maintain a tiered decoded-image cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, value_name = "PATH", env = "PIXCACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Memory cache capacity in kilobytes.
    #[arg(long, value_name = "KB")]
    pub memory_cache_kb: Option<usize>,

    /// Memory cache capacity as a share of system memory (0.01 - 0.8).
    #[arg(long, value_name = "SHARE", conflicts_with = "memory_cache_kb")]
    pub memory_percent: Option<f32>,

    /// Disk cache capacity in bytes.
    #[arg(long, value_name = "BYTES")]
    pub disk_cache_bytes: Option<u64>,

    /// Encoding used for the disk tier.
    #[arg(long, value_enum)]
    pub compress_format: Option<CompressFormat>,

    /// Encoder quality (0 - 100).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub compress_quality: Option<u8>,

    /// Disable the memory tier.
    #[arg(long)]
    pub no_memory_cache: bool,

    /// Disable the disk tier.
    #[arg(long)]
    pub no_disk_cache: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Cache maintenance commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decode an image file and store it under a source identifier.
    Put {
        /// Source identifier, usually the image URL.
        source: String,
        /// Size class to store it as.
        #[arg(short, long, value_enum, default_value_t = SizeClass::Medium)]
        size: SizeClass,
        /// Image file to decode.
        file: PathBuf,
    },
    /// Look up a cached image and optionally write it out as PNG.
    Get {
        /// Source identifier.
        source: String,
        /// Size class to look up.
        #[arg(short, long, value_enum, default_value_t = SizeClass::Medium)]
        size: SizeClass,
        /// Where to write the decoded image.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Delete every cached entry.
    Clear,
    /// Print cache status.
    Stats,
}
