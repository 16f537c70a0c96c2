//! Disk tier coordinator: owns the journaled store and its lifecycle.
//!
//! Initialization may run in the background. Readers that arrive while it is
//! in flight wait for it to settle instead of reporting a miss.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::ports::{CacheError, CacheResult, JournaledStore, SpaceProbe, StoreOpener};
use crate::infrastructure::config::CacheConfig;

/// Version written into the store; bumping it discards existing entries.
pub const APP_VERSION: u32 = 1;
/// Values per entry: the encoded image.
pub const VALUE_COUNT: usize = 1;
const IMAGE_VALUE: usize = 0;

/// Lifecycle of the disk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskPhase {
    /// Nothing requested yet.
    Uninitialized,
    /// The store is being opened; readers wait.
    Initializing,
    /// The store is open.
    Ready,
    /// Turned off, no directory, not enough space, or the store failed to open.
    Disabled,
    /// Closed; can be initialized again.
    Closed,
}

impl std::fmt::Display for DiskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Disabled => write!(f, "disabled"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// What happened to a disk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskWriteOutcome {
    /// The encoding was committed.
    Committed,
    /// An entry already existed and was kept.
    AlreadyPresent,
    /// Another edit of the same entry is in progress.
    Busy,
    /// The disk tier is not ready.
    Unavailable,
    /// Encoding or storing failed; the edit was discarded.
    Failed,
}

/// Serializes all access to the journaled store.
pub struct DiskCacheCoordinator {
    enabled: bool,
    directory: Option<PathBuf>,
    capacity: u64,
    opener: Arc<dyn StoreOpener>,
    probe: Arc<dyn SpaceProbe>,
    store: Mutex<Option<Box<dyn JournaledStore>>>,
    phase: watch::Sender<DiskPhase>,
}

impl DiskCacheCoordinator {
    /// Creates an uninitialized coordinator for the configured directory.
    #[must_use]
    pub fn new(
        config: &CacheConfig,
        opener: Arc<dyn StoreOpener>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Self {
        let (phase, _) = watch::channel(DiskPhase::Uninitialized);
        Self {
            enabled: config.disk_cache_enabled,
            directory: config.effective_disk_cache_dir(),
            capacity: config.disk_cache_size,
            opener,
            probe,
            store: Mutex::new(None),
            phase,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> DiskPhase {
        *self.phase.borrow()
    }

    /// Watches phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DiskPhase> {
        self.phase.subscribe()
    }

    /// Store directory, if one could be determined.
    #[must_use]
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Marks initialization as pending so readers wait for it.
    ///
    /// Returns `false` if the tier is already initializing, ready or disabled.
    pub fn request_initialize(&self) -> bool {
        self.phase.send_if_modified(|phase| match phase {
            DiskPhase::Uninitialized | DiskPhase::Closed => {
                *phase = DiskPhase::Initializing;
                true
            }
            _ => false,
        })
    }

    /// Opens the store, holding the store lock for the whole attempt.
    ///
    /// The phase moves to `Initializing` before this returns, so readers that
    /// arrive before the future is first polled already wait for it. The
    /// future must be driven to completion.
    pub fn initialize(&self) -> impl Future<Output = DiskPhase> + Send + '_ {
        self.request_initialize();
        self.open_store()
    }

    async fn open_store(&self) -> DiskPhase {
        let mut store = self.store.lock().await;
        let current = self.phase();
        if matches!(current, DiskPhase::Ready | DiskPhase::Disabled) {
            return current;
        }
        self.phase.send_replace(DiskPhase::Initializing);
        let next = self.open_locked(&mut store).await;
        self.phase.send_replace(next);
        next
    }

    async fn open_locked(&self, slot: &mut Option<Box<dyn JournaledStore>>) -> DiskPhase {
        if !self.enabled {
            debug!("Disk cache turned off by configuration");
            return DiskPhase::Disabled;
        }
        let Some(dir) = self.directory.clone() else {
            warn!("No cache directory available, disk cache disabled");
            return DiskPhase::Disabled;
        };
        if let Err(e) = fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to create disk cache directory");
            return DiskPhase::Disabled;
        }

        let probe = self.probe.clone();
        let probe_dir = dir.clone();
        let usable = tokio::task::spawn_blocking(move || probe.usable_space(&probe_dir))
            .await
            .ok()
            .flatten();
        if let Some(available) = usable
            && available <= self.capacity
        {
            let e = CacheError::InsufficientSpace {
                available,
                required: self.capacity,
            };
            warn!(dir = %dir.display(), error = %e, "Disk cache disabled");
            return DiskPhase::Disabled;
        }

        match self
            .opener
            .open(&dir, APP_VERSION, VALUE_COUNT, self.capacity)
            .await
        {
            Ok(store) => {
                info!(dir = %dir.display(), size = store.size(), "Disk cache initialized");
                *slot = Some(store);
                DiskPhase::Ready
            }
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Failed to open disk cache");
                DiskPhase::Disabled
            }
        }
    }

    /// Waits while initialization is in flight and returns the settled phase.
    async fn settled_phase(&self) -> DiskPhase {
        let mut phase = self.phase.subscribe();
        match phase.wait_for(|p| *p != DiskPhase::Initializing).await {
            Ok(settled) => *settled,
            Err(_) => self.phase(),
        }
    }

    /// Reads the encoded image stored under `key`.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        if self.settled_phase().await != DiskPhase::Ready {
            return None;
        }
        let guard = self.store.lock().await;
        let store = guard.as_ref()?;
        let digest = key.digest();

        let mut snapshot = match store.get(&digest).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                trace!(key = %key, "Disk cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Disk cache read failed");
                return None;
            }
        };
        match snapshot.read_value(IMAGE_VALUE).await {
            Ok(bytes) => {
                trace!(key = %key, digest = %digest, bytes = bytes.len(), "Disk cache hit");
                Some(bytes)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read disk cache entry");
                None
            }
        }
    }

    /// Stores the output of `encode` under `key` unless an entry already exists.
    ///
    /// The encoder runs on the blocking pool while the store lock is held.
    pub async fn put<F>(&self, key: &CacheKey, encode: F) -> DiskWriteOutcome
    where
        F: FnOnce() -> CacheResult<Vec<u8>> + Send + 'static,
    {
        if self.settled_phase().await != DiskPhase::Ready {
            return DiskWriteOutcome::Unavailable;
        }
        let guard = self.store.lock().await;
        let Some(store) = guard.as_ref() else {
            return DiskWriteOutcome::Unavailable;
        };
        let digest = key.digest();

        match store.get(&digest).await {
            Ok(Some(_)) => {
                trace!(key = %key, "Already on disk, keeping existing entry");
                return DiskWriteOutcome::AlreadyPresent;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Disk cache lookup failed");
                return DiskWriteOutcome::Failed;
            }
        }

        let mut editor = match store.edit(&digest).await {
            Ok(Some(editor)) => editor,
            Ok(None) => {
                debug!(key = %key, "Entry is being written elsewhere");
                return DiskWriteOutcome::Busy;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to start disk cache edit");
                return DiskWriteOutcome::Failed;
            }
        };

        let encoded = match tokio::task::spawn_blocking(encode).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Failed to encode image for disk cache");
                let _ = editor.abort().await;
                return DiskWriteOutcome::Failed;
            }
            Err(e) => {
                let e = CacheError::TaskFailed(e.to_string());
                error!(key = %key, error = %e, "Encode task failed");
                let _ = editor.abort().await;
                return DiskWriteOutcome::Failed;
            }
        };

        let size = encoded.len();
        let result = match editor.set_value(IMAGE_VALUE, Bytes::from(encoded)) {
            Ok(()) => editor.commit().await,
            Err(e) => {
                let _ = editor.abort().await;
                Err(e)
            }
        };
        match result {
            Ok(()) => {
                trace!(key = %key, digest = %digest, bytes = size, "Stored in disk cache");
                DiskWriteOutcome::Committed
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to commit disk cache entry");
                DiskWriteOutcome::Failed
            }
        }
    }

    /// Persists the store journal.
    pub async fn flush(&self) {
        let guard = self.store.lock().await;
        if let Some(store) = guard.as_ref()
            && let Err(e) = store.flush().await
        {
            warn!(error = %e, "Failed to flush disk cache");
        }
    }

    /// Deletes every entry and reopens an empty store.
    ///
    /// A tier that is not open is left alone.
    pub async fn clear(&self) {
        let mut guard = self.store.lock().await;
        let Some(store) = guard.take() else {
            debug!(phase = %self.phase(), "Disk cache not open, nothing to clear");
            return;
        };
        self.phase.send_replace(DiskPhase::Initializing);
        if let Err(e) = store.delete().await {
            warn!(error = %e, "Failed to delete disk cache");
        }
        drop(store);
        let next = self.open_locked(&mut guard).await;
        self.phase.send_replace(next);
        debug!(phase = %next, "Disk cache cleared");
    }

    /// Closes the store. A later [`Self::initialize`] reopens it.
    pub async fn close(&self) {
        let mut guard = self.store.lock().await;
        if let Some(store) = guard.take() {
            if let Err(e) = store.close().await {
                warn!(error = %e, "Failed to close disk cache");
            }
            self.phase.send_replace(DiskPhase::Closed);
            debug!("Disk cache closed");
        }
    }

    /// Committed bytes, if the store is open.
    pub async fn size(&self) -> Option<u64> {
        self.store.lock().await.as_ref().map(|store| store.size())
    }
}

impl std::fmt::Debug for DiskCacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCacheCoordinator")
            .field("directory", &self.directory)
            .field("capacity", &self.capacity)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::SizeClass;
    use crate::domain::errors::StoreResult;
    use crate::domain::ports::Editor;
    use crate::domain::ports::mocks::MockSpaceProbe;
    use crate::infrastructure::image::file_store::{FileJournalStore, FileStoreOpener};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

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

    fn plenty_of_space() -> MockSpaceProbe {
        let mut probe = MockSpaceProbe::new();
        probe.expect_usable_space().returning(|_| Some(u64::MAX));
        probe
    }

    fn create_coordinator(config: &CacheConfig, probe: MockSpaceProbe) -> DiskCacheCoordinator {
        DiskCacheCoordinator::new(config, Arc::new(FileStoreOpener), Arc::new(probe))
    }

    fn key(source: &str) -> CacheKey {
        CacheKey::new(source, SizeClass::Medium)
    }

    fn encoded(data: &'static [u8]) -> impl FnOnce() -> CacheResult<Vec<u8>> + Send + 'static {
        move || Ok(data.to_vec())
    }

    #[tokio::test]
    async fn test_read_before_initialization_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());

        let result = tokio::time::timeout(Duration::from_millis(200), disk.get(&key("a"))).await;

        assert_eq!(result.unwrap(), None);
        assert_eq!(disk.phase(), DiskPhase::Uninitialized);
        assert_eq!(disk.put(&key("a"), encoded(b"x")).await, DiskWriteOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let temp = TempDir::new().unwrap();
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());

        assert_eq!(disk.initialize().await, DiskPhase::Ready);
        assert_eq!(disk.put(&key("a"), encoded(b"encoded")).await, DiskWriteOutcome::Committed);

        assert_eq!(disk.get(&key("a")).await, Some(Bytes::from_static(b"encoded")));
        assert_eq!(disk.get(&key("b")).await, None);
        assert_eq!(disk.size().await, Some(7));
    }

    #[tokio::test]
    async fn test_existing_entry_wins() {
        let temp = TempDir::new().unwrap();
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());
        disk.initialize().await;

        disk.put(&key("a"), encoded(b"first")).await;
        let outcome = disk.put(&key("a"), encoded(b"second")).await;

        assert_eq!(outcome, DiskWriteOutcome::AlreadyPresent);
        assert_eq!(disk.get(&key("a")).await, Some(Bytes::from_static(b"first")));
    }

    #[tokio::test]
    async fn test_encode_failure_releases_the_entry() {
        let temp = TempDir::new().unwrap();
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());
        disk.initialize().await;

        let outcome = disk
            .put(&key("a"), || Err(CacheError::EncodeError("unsupported".into())))
            .await;
        assert_eq!(outcome, DiskWriteOutcome::Failed);
        assert_eq!(disk.get(&key("a")).await, None);

        assert_eq!(disk.put(&key("a"), encoded(b"ok")).await, DiskWriteOutcome::Committed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reader_waits_for_background_initialization() {
        let temp = TempDir::new().unwrap();
        let entry = key("https://example.com/a.png");
        {
            let store = FileJournalStore::open(temp.path(), APP_VERSION, VALUE_COUNT, 1024 * 1024)
                .await
                .unwrap();
            let mut editor = store.edit(&entry.digest()).await.unwrap().unwrap();
            editor.set_value(IMAGE_VALUE, Bytes::from_static(b"cached")).unwrap();
            editor.commit().await.unwrap();
            store.close().await.unwrap();
        }

        let gate = Arc::new(Notify::new());
        let disk = Arc::new(DiskCacheCoordinator::new(
            &CacheConfig::with_disk_dir(temp.path()),
            Arc::new(GatedOpener { gate: gate.clone() }),
            Arc::new(plenty_of_space()),
        ));

        assert!(disk.request_initialize());
        assert!(!disk.request_initialize());
        let init = tokio::spawn({
            let disk = disk.clone();
            async move { disk.initialize().await }
        });
        let reader = tokio::spawn({
            let disk = disk.clone();
            let entry = entry.clone();
            async move { disk.get(&entry).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_finished());
        assert_eq!(disk.phase(), DiskPhase::Initializing);

        gate.notify_one();

        assert_eq!(init.await.unwrap(), DiskPhase::Ready);
        assert_eq!(reader.await.unwrap(), Some(Bytes::from_static(b"cached")));
    }

    #[tokio::test]
    async fn test_reader_polled_before_initialization_waits_for_it() {
        let temp = TempDir::new().unwrap();
        let entry = key("a");
        {
            let store = FileJournalStore::open(temp.path(), APP_VERSION, VALUE_COUNT, 1024 * 1024)
                .await
                .unwrap();
            let mut editor = store.edit(&entry.digest()).await.unwrap().unwrap();
            editor.set_value(IMAGE_VALUE, Bytes::from_static(b"cached")).unwrap();
            editor.commit().await.unwrap();
            store.close().await.unwrap();
        }
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());

        let init = disk.initialize();
        assert_eq!(disk.phase(), DiskPhase::Initializing);

        let (read, phase) = tokio::join!(disk.get(&entry), init);
        assert_eq!(phase, DiskPhase::Ready);
        assert_eq!(read, Some(Bytes::from_static(b"cached")));
    }

    #[tokio::test]
    async fn test_panicking_encoder_fails_the_write() {
        let temp = TempDir::new().unwrap();
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());
        disk.initialize().await;

        let outcome = disk.put(&key("a"), || panic!("encoder crashed")).await;

        assert_eq!(outcome, DiskWriteOutcome::Failed);
        assert_eq!(disk.get(&key("a")).await, None);
        assert_eq!(disk.put(&key("a"), encoded(b"ok")).await, DiskWriteOutcome::Committed);
    }

    #[tokio::test]
    async fn test_insufficient_space_disables_tier() {
        let temp = TempDir::new().unwrap();
        let mut config = CacheConfig::with_disk_dir(temp.path());
        config.disk_cache_size = 1024;
        let mut probe = MockSpaceProbe::new();
        probe.expect_usable_space().times(1).returning(|_| Some(1024));
        let disk = create_coordinator(&config, probe);

        assert_eq!(disk.initialize().await, DiskPhase::Disabled);
        assert_eq!(disk.initialize().await, DiskPhase::Disabled);
        assert!(!disk.request_initialize());
        assert_eq!(disk.get(&key("a")).await, None);
        assert_eq!(disk.put(&key("a"), encoded(b"x")).await, DiskWriteOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_unknown_space_permits_opening() {
        let temp = TempDir::new().unwrap();
        let mut probe = MockSpaceProbe::new();
        probe.expect_usable_space().returning(|_| None);
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), probe);

        assert_eq!(disk.initialize().await, DiskPhase::Ready);
    }

    #[tokio::test]
    async fn test_disabled_by_configuration() {
        let temp = TempDir::new().unwrap();
        let mut config = CacheConfig::with_disk_dir(temp.path());
        config.disk_cache_enabled = false;
        let mut probe = MockSpaceProbe::new();
        probe.expect_usable_space().never();
        let disk = create_coordinator(&config, probe);

        assert_eq!(disk.initialize().await, DiskPhase::Disabled);
    }

    #[tokio::test]
    async fn test_close_and_reinitialize() {
        let temp = TempDir::new().unwrap();
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());
        disk.initialize().await;
        disk.put(&key("a"), encoded(b"kept")).await;

        disk.close().await;
        assert_eq!(disk.phase(), DiskPhase::Closed);
        assert_eq!(disk.get(&key("a")).await, None);

        assert!(disk.request_initialize());
        assert_eq!(disk.initialize().await, DiskPhase::Ready);
        assert_eq!(disk.get(&key("a")).await, Some(Bytes::from_static(b"kept")));
    }

    #[tokio::test]
    async fn test_clear_leaves_an_empty_usable_store() {
        let temp = TempDir::new().unwrap();
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());
        disk.initialize().await;
        disk.put(&key("a"), encoded(b"old")).await;

        disk.clear().await;

        assert_eq!(disk.phase(), DiskPhase::Ready);
        assert_eq!(disk.get(&key("a")).await, None);
        assert_eq!(disk.put(&key("a"), encoded(b"new")).await, DiskWriteOutcome::Committed);
        assert_eq!(disk.get(&key("a")).await, Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_clear_before_initialization_does_not_block_readers() {
        let temp = TempDir::new().unwrap();
        let disk = create_coordinator(&CacheConfig::with_disk_dir(temp.path()), plenty_of_space());

        disk.clear().await;

        assert_eq!(disk.phase(), DiskPhase::Uninitialized);
        let result = tokio::time::timeout(Duration::from_millis(200), disk.get(&key("a"))).await;
        assert_eq!(result.unwrap(), None);
    }
}
