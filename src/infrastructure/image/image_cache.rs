//! Tiered image cache: memory, then disk.
//!
//! Reads go to the memory tier first and fall back to the disk tier, whose
//! hits are decoded and promoted into memory. Writes land in memory
//! immediately and are handed to a background writer that encodes them for
//! the disk tier.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::codec::ImageCrateCodec;
use super::disk_cache::{DiskCacheCoordinator, DiskPhase};
use super::file_store::FileStoreOpener;
use super::memory_cache::{CacheStats, MemoryImageCache};
use super::reuse_pool::ReusePool;
use super::space::SysinfoSpaceProbe;
use crate::domain::entities::{CacheKey, CachedImage, ImageSource, LoadedImage};
use crate::domain::ports::{
    CacheError, CompressFormat, ImageCachePort, ImageCodec, ReuseSource, SpaceProbe, StoreOpener,
};
use crate::infrastructure::config::CacheConfig;

/// Disk writes that may wait for the writer at once. Each one holds its
/// decoded buffer, so writes beyond this are dropped instead of queued.
pub const PENDING_WRITE_LIMIT: usize = 16;

/// Collaborators the cache is built from.
#[derive(Clone)]
pub struct ImageCacheComponents {
    /// Decoder for disk hits and encoder for disk writes.
    pub codec: Arc<dyn ImageCodec>,
    /// Opens the journaled store behind the disk tier.
    pub opener: Arc<dyn StoreOpener>,
    /// Free-space check run before the store is opened.
    pub probe: Arc<dyn SpaceProbe>,
}

impl Default for ImageCacheComponents {
    fn default() -> Self {
        Self {
            codec: Arc::new(ImageCrateCodec::new()),
            opener: Arc::new(FileStoreOpener),
            probe: Arc::new(SysinfoSpaceProbe),
        }
    }
}

#[derive(Debug)]
enum WriterCommand {
    Initialize,
    Store { key: CacheKey, image: CachedImage },
    Barrier(oneshot::Sender<()>),
}

/// State for the background writer loop.
struct WriterState {
    disk: Arc<DiskCacheCoordinator>,
    codec: Arc<dyn ImageCodec>,
    format: CompressFormat,
    quality: u8,
    command_rx: mpsc::Receiver<WriterCommand>,
}

/// Two-tier image cache.
pub struct ImageCache {
    config: CacheConfig,
    memory: Option<Arc<MemoryImageCache>>,
    disk: Arc<DiskCacheCoordinator>,
    pool: Arc<ReusePool>,
    codec: Arc<dyn ImageCodec>,
    command_tx: mpsc::Sender<WriterCommand>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("config", &self.config)
            .field("disk", &self.disk)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Opens a cache with the default codec, file store and space probe.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(config: CacheConfig) -> Self {
        Self::open_with(config, ImageCacheComponents::default()).await
    }

    /// Opens a cache with the given collaborators.
    ///
    /// With `init_disk_cache_on_create` the disk tier is opened before this
    /// returns. Otherwise opening is queued on the writer and disk readers
    /// wait for it.
    pub async fn open_with(config: CacheConfig, components: ImageCacheComponents) -> Self {
        let pool = Arc::new(ReusePool::new(
            config.reuse_regime,
            config.reuse_pool_capacity,
            config.reuse_pool_max_idle(),
        ));
        let memory = config.memory_cache_enabled.then(|| {
            Arc::new(MemoryImageCache::new(
                config.memory_cache_size_kb,
                config.footprint_measure,
                Some(pool.clone()),
            ))
        });
        let disk = Arc::new(DiskCacheCoordinator::new(
            &config,
            components.opener,
            components.probe,
        ));

        let (command_tx, command_rx) = mpsc::channel(PENDING_WRITE_LIMIT);
        tokio::spawn(Self::run_writer_loop(WriterState {
            disk: disk.clone(),
            codec: components.codec.clone(),
            format: config.compress_format,
            quality: config.compress_quality,
            command_rx,
        }));

        if config.init_disk_cache_on_create {
            disk.initialize().await;
        } else if disk.request_initialize() {
            let _ = command_tx.try_send(WriterCommand::Initialize);
        }

        info!(
            memory_kb = config.memory_cache_size_kb,
            memory_enabled = config.memory_cache_enabled,
            disk_bytes = config.disk_cache_size,
            disk_phase = %disk.phase(),
            "Image cache opened"
        );

        Self {
            config,
            memory,
            disk,
            pool,
            codec: components.codec,
            command_tx,
        }
    }

    /// Runs disk commands in submission order.
    async fn run_writer_loop(mut state: WriterState) {
        while let Some(command) = state.command_rx.recv().await {
            match command {
                WriterCommand::Initialize => {
                    state.disk.initialize().await;
                }
                WriterCommand::Store { key, image } => {
                    let codec = state.codec.clone();
                    let (format, quality) = (state.format, state.quality);
                    let outcome = state
                        .disk
                        .put(&key, move || codec.encode(image.buffer(), format, quality))
                        .await;
                    trace!(key = %key, ?outcome, "Disk write finished");
                }
                WriterCommand::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Disk writer stopped");
    }

    /// Waits until every command queued so far has run.
    async fn drain_writes(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(WriterCommand::Barrier(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Looks `key` up in memory, then on disk.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        self.lookup(key).await.map(|loaded| loaded.image)
    }

    /// Like [`Self::get`], also reporting which tier answered.
    pub async fn lookup(&self, key: &CacheKey) -> Option<LoadedImage> {
        if let Some(image) = self.get_from_memory(key) {
            return Some(LoadedImage {
                key: key.clone(),
                image,
                source: ImageSource::MemoryCache,
            });
        }
        let image = self.get_from_disk(key).await?;
        Some(LoadedImage {
            key: key.clone(),
            image,
            source: ImageSource::DiskCache,
        })
    }

    /// Memory tier only.
    #[must_use]
    pub fn get_from_memory(&self, key: &CacheKey) -> Option<CachedImage> {
        self.memory.as_ref()?.get(key)
    }

    /// Disk tier only. A hit is decoded at full size and promoted into memory.
    pub async fn get_from_disk(&self, key: &CacheKey) -> Option<CachedImage> {
        let bytes = self.disk.get(key).await?;
        let codec = self.codec.clone();
        let pool = self.pool.clone();

        let decoded = tokio::task::spawn_blocking(move || {
            let reuse: &dyn ReuseSource = &*pool;
            codec.decode(&bytes, u32::MAX, u32::MAX, Some(reuse))
        })
        .await;

        let buffer = match decoded {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Failed to decode disk cache entry");
                return None;
            }
            Err(e) => {
                let e = CacheError::TaskFailed(e.to_string());
                error!(key = %key, error = %e, "Decode task failed");
                return None;
            }
        };

        let image = CachedImage::plain(buffer);
        let Some(memory) = &self.memory else {
            return Some(image);
        };
        // A put that landed during the decode is newer than the disk copy.
        let resident = memory.put_if_absent(key.clone(), image.clone());
        if resident.ptr_eq(&image) {
            debug!(key = %key, "Promoted disk cache hit into memory");
        } else {
            debug!(key = %key, "Newer entry already in memory, disk copy not promoted");
        }
        Some(resident)
    }

    /// Stores `image` in memory and queues it for the disk tier.
    ///
    /// When [`PENDING_WRITE_LIMIT`] writes are already waiting the disk write
    /// is dropped; the image stays in memory.
    pub fn put(&self, key: CacheKey, image: CachedImage) {
        if let Some(memory) = &self.memory {
            memory.put(key.clone(), image.clone());
        }
        if !self.config.disk_cache_enabled {
            return;
        }
        match self.command_tx.try_send(WriterCommand::Store { key, image }) {
            Ok(()) => {}
            Err(TrySendError::Full(WriterCommand::Store { key, .. })) => {
                debug!(key = %key, "Disk write queue full, write dropped");
            }
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => warn!("Disk writer stopped, write dropped"),
        }
    }

    /// Opens the disk tier now instead of waiting for the writer.
    pub async fn initialize_disk_cache(&self) -> DiskPhase {
        self.disk.initialize().await
    }

    /// Clears both tiers.
    pub async fn clear_cache(&self) {
        self.clear_memory_cache();
        self.clear_disk_cache().await;
    }

    /// Evicts every memory entry.
    pub fn clear_memory_cache(&self) {
        if let Some(memory) = &self.memory {
            memory.evict_all();
            debug!("Memory cache cleared");
        }
    }

    /// Waits for queued writes, then empties the disk tier.
    pub async fn clear_disk_cache(&self) {
        self.drain_writes().await;
        self.disk.clear().await;
    }

    /// Waits for queued writes, then persists the disk journal.
    pub async fn flush(&self) {
        self.drain_writes().await;
        self.disk.flush().await;
    }

    /// Waits for queued writes, then closes the disk tier.
    pub async fn close(&self) {
        self.drain_writes().await;
        self.disk.close().await;
    }

    /// Memory tier statistics, if the tier is enabled.
    #[must_use]
    pub fn memory_stats(&self) -> Option<CacheStats> {
        self.memory.as_ref().map(|memory| memory.stats())
    }

    /// Disk tier phase.
    #[must_use]
    pub fn disk_phase(&self) -> DiskPhase {
        self.disk.phase()
    }

    /// Bytes committed to the disk tier, if it is open.
    pub async fn disk_size(&self) -> Option<u64> {
        self.disk.size().await
    }

    /// Buffers held for reuse by the decoder.
    #[must_use]
    pub const fn reuse_pool(&self) -> &Arc<ReusePool> {
        &self.pool
    }

    /// Configuration the cache was opened with.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }
}

#[async_trait]
impl ImageCachePort for ImageCache {
    async fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        self.lookup(key).await.map(|loaded| loaded.image)
    }

    async fn put(&self, key: CacheKey, image: CachedImage) {
        Self::put(self, key, image);
    }

    async fn clear(&self) {
        self.clear_cache().await;
    }

    async fn flush(&self) {
        Self::flush(self).await;
    }

    async fn close(&self) {
        Self::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{DiskDigest, PixelBuffer, PixelFormat, SizeClass};
    use crate::domain::errors::StoreResult;
    use crate::domain::ports::mocks::MockSpaceProbe;
    use crate::domain::ports::{CacheResult, Editor, JournaledStore, Snapshot};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Holds the store open until the gate is notified.
    struct GatedOpener {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl StoreOpener for GatedOpener {
        async fn open(
            &self,
            directory: &Path,
            app_version: u32,
            value_count: usize,
            max_size: u64,
        ) -> StoreResult<Box<dyn JournaledStore>> {
            self.gate.notified().await;
            FileStoreOpener
                .open(directory, app_version, value_count, max_size)
                .await
        }
    }

    /// Reports each decode, then blocks it until resumed.
    struct PausingCodec {
        started: mpsc::UnboundedSender<()>,
        resume: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ImageCodec for PausingCodec {
        fn decode(
            &self,
            bytes: &[u8],
            max_width: u32,
            max_height: u32,
            reuse: Option<&dyn ReuseSource>,
        ) -> CacheResult<PixelBuffer> {
            let _ = self.started.send(());
            let _ = self.resume.lock().recv();
            ImageCrateCodec::new().decode(bytes, max_width, max_height, reuse)
        }

        fn encode(
            &self,
            buffer: &PixelBuffer,
            format: CompressFormat,
            quality: u8,
        ) -> CacheResult<Vec<u8>> {
            ImageCrateCodec::new().encode(buffer, format, quality)
        }
    }

    /// Counts store reads on top of the file store.
    struct CountingOpener {
        gets: Arc<AtomicUsize>,
    }

    struct CountingStore {
        inner: Box<dyn JournaledStore>,
        gets: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StoreOpener for CountingOpener {
        async fn open(
            &self,
            directory: &Path,
            app_version: u32,
            value_count: usize,
            max_size: u64,
        ) -> StoreResult<Box<dyn JournaledStore>> {
            let inner = FileStoreOpener
                .open(directory, app_version, value_count, max_size)
                .await?;
            Ok(Box::new(CountingStore {
                inner,
                gets: self.gets.clone(),
            }))
        }
    }

    #[async_trait]
    impl JournaledStore for CountingStore {
        async fn get(&self, digest: &DiskDigest) -> StoreResult<Option<Box<dyn Snapshot>>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(digest).await
        }
        async fn edit(&self, digest: &DiskDigest) -> StoreResult<Option<Box<dyn Editor>>> {
            self.inner.edit(digest).await
        }
        async fn flush(&self) -> StoreResult<()> {
            self.inner.flush().await
        }
        async fn close(&self) -> StoreResult<()> {
            self.inner.close().await
        }
        async fn delete(&self) -> StoreResult<()> {
            self.inner.delete().await
        }
        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
        fn size(&self) -> u64 {
            self.inner.size()
        }
        fn max_size(&self) -> u64 {
            self.inner.max_size()
        }
    }

    fn test_config(dir: &Path) -> CacheConfig {
        let mut config = CacheConfig::with_disk_dir(dir);
        config.compress_format = CompressFormat::Png;
        config
    }

    fn components(opener: Arc<dyn StoreOpener>) -> ImageCacheComponents {
        let mut probe = MockSpaceProbe::new();
        probe.expect_usable_space().returning(|_| Some(u64::MAX));
        ImageCacheComponents {
            codec: Arc::new(ImageCrateCodec::new()),
            opener,
            probe: Arc::new(probe),
        }
    }

    async fn create_test_cache(config: CacheConfig) -> ImageCache {
        ImageCache::open_with(config, components(Arc::new(FileStoreOpener))).await
    }

    fn test_image(width: u32, height: u32) -> CachedImage {
        let mut buffer = PixelBuffer::new(width, height, PixelFormat::Rgba8888);
        for px in buffer.pixels_mut().chunks_exact_mut(4) {
            px.copy_from_slice(&[10, 20, 30, 255]);
        }
        CachedImage::plain(buffer)
    }

    fn key(source: &str) -> CacheKey {
        CacheKey::new(source, SizeClass::Thumbnail)
    }

    #[tokio::test]
    async fn test_put_then_get_is_served_from_memory() {
        let temp = TempDir::new().unwrap();
        let cache = create_test_cache(test_config(temp.path())).await;
        let image = test_image(8, 8);

        cache.put(key("a"), image.clone());
        let loaded = cache.lookup(&key("a")).await.unwrap();

        assert_eq!(loaded.source, ImageSource::MemoryCache);
        assert!(loaded.image.ptr_eq(&image));
    }

    #[tokio::test]
    async fn test_disk_hit_is_promoted_into_memory() {
        let temp = TempDir::new().unwrap();
        {
            let cache = create_test_cache(test_config(temp.path())).await;
            cache.put(key("a"), test_image(8, 4));
            cache.close().await;
        }

        let gets = Arc::new(AtomicUsize::new(0));
        let mut config = test_config(temp.path());
        config.init_disk_cache_on_create = true;
        let cache = ImageCache::open_with(
            config,
            components(Arc::new(CountingOpener { gets: gets.clone() })),
        )
        .await;

        let first = cache.lookup(&key("a")).await.unwrap();
        assert_eq!(first.source, ImageSource::DiskCache);
        assert_eq!((first.image.buffer().width(), first.image.buffer().height()), (8, 4));
        assert_eq!(&first.image.buffer().pixels()[..4], &[10, 20, 30, 255]);
        assert_eq!(gets.load(Ordering::SeqCst), 1);

        let second = cache.lookup(&key("a")).await.unwrap();
        assert_eq!(second.source, ImageSource::MemoryCache);
        assert!(second.image.ptr_eq(&first.image));
        assert_eq!(gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put_during_disk_decode_is_not_overwritten() {
        let temp = TempDir::new().unwrap();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel();
        let mut parts = components(Arc::new(FileStoreOpener));
        parts.codec = Arc::new(PausingCodec {
            started: started_tx,
            resume: parking_lot::Mutex::new(resume_rx),
        });
        let cache = Arc::new(ImageCache::open_with(test_config(temp.path()), parts).await);
        cache.put(key("a"), test_image(4, 4));
        cache.flush().await;
        cache.clear_memory_cache();

        let reader = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_from_disk(&key("a")).await }
        });
        started_rx.recv().await.unwrap();
        let fresh = test_image(4, 4);
        cache.put(key("a"), fresh.clone());
        resume_tx.send(()).unwrap();

        let returned = reader.await.unwrap().unwrap();
        assert!(returned.ptr_eq(&fresh));
        assert!(cache.get_from_memory(&key("a")).unwrap().ptr_eq(&fresh));
    }

    #[tokio::test]
    async fn test_queued_writes_during_initialization_are_bounded() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        config.memory_cache_size_kb = 8;
        let gate = Arc::new(Notify::new());
        let cache = ImageCache::open_with(
            config,
            components(Arc::new(GatedOpener { gate: gate.clone() })),
        )
        .await;

        for i in 0..200 {
            cache.put(key(&format!("img-{i}")), test_image(32, 32));
        }

        assert_eq!(cache.disk_phase(), DiskPhase::Initializing);
        let stats = cache.memory_stats().unwrap();
        assert_eq!(stats.size_kb, 8);
        assert_eq!(stats.evictions, 198);
        assert!(!cache.reuse_pool().is_empty());

        gate.notify_one();
        cache.flush().await;

        assert_eq!(cache.disk_phase(), DiskPhase::Ready);
        assert!(cache.get_from_disk(&key("img-0")).await.is_some());
        assert!(cache.get_from_disk(&key("img-100")).await.is_none());
        assert!(cache.disk_size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_memory_tier_disabled() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        config.memory_cache_enabled = false;
        let cache = create_test_cache(config).await;

        cache.put(key("a"), test_image(4, 4));
        cache.flush().await;

        assert!(cache.memory_stats().is_none());
        assert!(cache.get_from_memory(&key("a")).is_none());
        let loaded = cache.lookup(&key("a")).await.unwrap();
        assert_eq!(loaded.source, ImageSource::DiskCache);
        let again = cache.lookup(&key("a")).await.unwrap();
        assert_eq!(again.source, ImageSource::DiskCache);
    }

    #[tokio::test]
    async fn test_disk_tier_disabled_keeps_memory_working() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        config.disk_cache_enabled = false;
        let cache = create_test_cache(config).await;

        cache.put(key("a"), test_image(4, 4));
        cache.flush().await;

        assert_eq!(cache.disk_phase(), DiskPhase::Disabled);
        assert!(cache.get(&key("a")).await.is_some());
        assert!(cache.get_from_disk(&key("a")).await.is_none());
    }

    #[tokio::test]
    async fn test_lazy_initialization_never_reports_uninitialized() {
        let temp = TempDir::new().unwrap();
        let cache = create_test_cache(test_config(temp.path())).await;

        assert_ne!(cache.disk_phase(), DiskPhase::Uninitialized);
        cache.flush().await;
        assert_eq!(cache.disk_phase(), DiskPhase::Ready);
    }

    #[tokio::test]
    async fn test_eager_initialization() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        config.init_disk_cache_on_create = true;

        let cache = create_test_cache(config).await;
        assert_eq!(cache.disk_phase(), DiskPhase::Ready);
    }

    #[tokio::test]
    async fn test_clear_cache_empties_both_tiers() {
        let temp = TempDir::new().unwrap();
        let cache = create_test_cache(test_config(temp.path())).await;
        cache.put(key("a"), test_image(4, 4));
        cache.flush().await;

        cache.clear_cache().await;

        assert!(cache.get(&key("a")).await.is_none());
        assert_eq!(cache.memory_stats().unwrap().size, 0);
        assert_eq!(cache.disk_phase(), DiskPhase::Ready);

        cache.put(key("b"), test_image(4, 4));
        cache.flush().await;
        cache.clear_memory_cache();
        assert!(cache.get(&key("b")).await.is_some());
    }

    #[tokio::test]
    async fn test_close_keeps_memory_tier() {
        let temp = TempDir::new().unwrap();
        let cache = create_test_cache(test_config(temp.path())).await;
        cache.put(key("a"), test_image(4, 4));
        cache.put(key("b"), test_image(4, 4));

        cache.close().await;
        cache.clear_memory_cache();
        cache.put(key("a"), test_image(4, 4));

        assert_eq!(cache.disk_phase(), DiskPhase::Closed);
        assert!(cache.get(&key("a")).await.is_some());
        assert!(cache.get(&key("b")).await.is_none());
        assert_eq!(cache.initialize_disk_cache().await, DiskPhase::Ready);
        assert!(cache.get(&key("b")).await.is_some());
    }

    #[tokio::test]
    async fn test_through_port() {
        let temp = TempDir::new().unwrap();
        let cache: Arc<dyn ImageCachePort> = Arc::new(create_test_cache(test_config(temp.path())).await);

        cache.put(key("a"), test_image(2, 2)).await;
        assert!(cache.get(&key("a")).await.is_some());
        cache.clear().await;
        assert!(cache.get(&key("a")).await.is_none());
        cache.close().await;
    }
}
