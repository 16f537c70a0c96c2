use std::path::Path;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, eyre};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pixcache::domain::entities::{CacheKey, CachedImage, SizeClass};
use pixcache::domain::ports::{CompressFormat, ImageCodec};
use pixcache::infrastructure::config::Command;
use pixcache::infrastructure::{AppConfig, CliArgs, ImageCache, ImageCrateCodec, StorageManager};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry().with(filter).init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let storage = StorageManager::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    if let Some(percent) = args.memory_percent {
        config.cache.set_mem_cache_size_percent(percent)?;
    }
    config.cache.validate()?;
    Ok(config)
}

async fn put_file(cache: &ImageCache, source: String, size: SizeClass, file: &Path) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;
    let pool = cache.reuse_pool().clone();
    let buffer = tokio::task::spawn_blocking(move || {
        ImageCrateCodec::new().decode(&bytes, size.pixels(), size.pixels(), Some(&*pool))
    })
    .await??;

    let key = CacheKey::new(source, size);
    println!(
        "Stored {key} ({}x{}, digest {})",
        buffer.width(),
        buffer.height(),
        key.digest()
    );
    cache.put(key, CachedImage::plain(buffer));
    Ok(())
}

async fn get_image(
    cache: &ImageCache,
    source: String,
    size: SizeClass,
    output: Option<&Path>,
) -> Result<()> {
    let key = CacheKey::new(source, size);
    let Some(loaded) = cache.lookup(&key).await else {
        return Err(eyre!("{key} is not cached"));
    };
    let buffer = loaded.image.buffer();
    println!(
        "Found {key} in {} cache ({}x{}, {} bytes)",
        loaded.source,
        buffer.width(),
        buffer.height(),
        buffer.byte_count()
    );

    if let Some(output) = output {
        let encoded = ImageCrateCodec::new().encode(buffer, CompressFormat::Png, 100)?;
        tokio::fs::write(output, encoded)
            .await
            .wrap_err_with(|| format!("failed to write {}", output.display()))?;
        println!("Wrote {}", output.display());
    }
    Ok(())
}

async fn print_stats(cache: &ImageCache) {
    let config = cache.config();
    match config.effective_disk_cache_dir() {
        Some(dir) => println!("Disk directory: {}", dir.display()),
        None => println!("Disk directory: unavailable"),
    }
    match cache.disk_size().await {
        Some(size) => println!(
            "Disk: {} ({size}/{} bytes)",
            cache.disk_phase(),
            config.disk_cache_size
        ),
        None => println!("Disk: {}", cache.disk_phase()),
    }
    match cache.memory_stats() {
        Some(stats) => println!("{stats}"),
        None => println!("Memory cache disabled"),
    }
    println!("{}", cache.reuse_pool().stats());
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = pixcache::VERSION, "Starting {}", pixcache::NAME);

    let cache = ImageCache::open(config.cache).await;

    let result = match args.command {
        Command::Put { source, size, file } => put_file(&cache, source, size, &file).await,
        Command::Get {
            source,
            size,
            output,
        } => get_image(&cache, source, size, output.as_deref()).await,
        Command::Clear => {
            cache.clear_cache().await;
            println!("Cache cleared");
            Ok(())
        }
        Command::Stats => {
            print_stats(&cache).await;
            Ok(())
        }
    };

    cache.close().await;
    result
}
