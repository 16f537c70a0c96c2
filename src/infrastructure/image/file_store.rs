//! Filesystem-backed journaled store.
//!
//! Each entry value lives in `<digest>.<index>`. Edits are written to
//! `<digest>.<index>.tmp` and renamed into place on commit, so readers only
//! ever see committed bytes. `journal.toml` records the store version and the
//! access order, and is rewritten on flush and close.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::domain::entities::DiskDigest;
use crate::domain::errors::{StoreError, StoreResult};
use crate::domain::ports::{Editor, JournaledStore, Snapshot, StoreOpener};

/// Name of the journal file inside the store directory.
pub const JOURNAL_FILE: &str = "journal.toml";

const STORE_FORMAT: u32 = 1;
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Serialize, Deserialize)]
struct Journal {
    format: u32,
    app_version: u32,
    value_count: usize,
    /// Least recently used first.
    #[serde(default)]
    entries: Vec<String>,
}

/// Opens [`FileJournalStore`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStoreOpener;

#[async_trait]
impl StoreOpener for FileStoreOpener {
    async fn open(
        &self,
        directory: &Path,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> StoreResult<Box<dyn JournaledStore>> {
        let store = FileJournalStore::open(directory, app_version, value_count, max_size).await?;
        Ok(Box::new(store))
    }
}

/// Journaled key/value store on the local filesystem, bounded by total bytes.
pub struct FileJournalStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    app_version: u32,
    value_count: usize,
    max_size: u64,
    state: Mutex<StoreState>,
    closed: AtomicBool,
}

struct StoreState {
    entries: LruCache<String, u64>,
    size: u64,
    editing: HashSet<String>,
}

struct ScannedEntry {
    indices: usize,
    size: u64,
    modified: SystemTime,
}

impl FileJournalStore {
    /// Opens the store in `dir`, creating it if needed.
    ///
    /// Leftover temporary files and incomplete entries are removed. A journal
    /// written with another `app_version` or `value_count` discards the store.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the directory cannot be created or read.
    pub async fn open(
        dir: &Path,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> StoreResult<Self> {
        fs::create_dir_all(dir).await?;

        let recorded = match read_journal(dir).await {
            Some(journal)
                if journal.format == STORE_FORMAT
                    && journal.app_version == app_version
                    && journal.value_count == value_count =>
            {
                journal.entries
            }
            Some(journal) => {
                debug!(
                    dir = %dir.display(),
                    found_version = journal.app_version,
                    app_version,
                    "Store version changed, discarding entries"
                );
                clear_dir(dir).await?;
                Vec::new()
            }
            None => Vec::new(),
        };

        let scanned = scan_entries(dir, value_count).await?;

        let mut order: Vec<String> = Vec::with_capacity(scanned.len());
        let mut seen = HashSet::new();
        for key in recorded {
            if scanned.contains_key(&key) && seen.insert(key.clone()) {
                order.push(key);
            }
        }
        // Entries committed after the last journal write are the most recent.
        let mut unrecorded: Vec<(&String, SystemTime)> = scanned
            .iter()
            .filter(|(key, _)| !seen.contains(*key))
            .map(|(key, entry)| (key, entry.modified))
            .collect();
        unrecorded.sort_by_key(|(_, modified)| *modified);
        order.extend(unrecorded.into_iter().map(|(key, _)| key.clone()));

        let mut entries = LruCache::unbounded();
        let mut size = 0u64;
        for key in order {
            if let Some(entry) = scanned.get(&key) {
                size += entry.size;
                entries.put(key, entry.size);
            }
        }

        let inner = Arc::new(StoreInner {
            dir: dir.to_path_buf(),
            app_version,
            value_count,
            max_size,
            state: Mutex::new(StoreState {
                entries,
                size,
                editing: HashSet::new(),
            }),
            closed: AtomicBool::new(false),
        });

        let victims = {
            let mut state = inner.state.lock();
            inner.trim_locked(&mut state)
        };
        inner.remove_files(victims).await;
        inner.write_journal().await?;

        debug!(dir = %dir.display(), size = inner.state.lock().size, "Opened journaled store");
        Ok(Self { inner })
    }

    /// Number of committed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// True if no entry is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.inner.dir
    }
}

#[async_trait]
impl JournaledStore for FileJournalStore {
    async fn get(&self, digest: &DiskDigest) -> StoreResult<Option<Box<dyn Snapshot>>> {
        self.inner.ensure_open()?;
        let key = digest.to_hex();
        let present = {
            let mut state = self.inner.state.lock();
            state.entries.get(&key).is_some()
        };
        if !present {
            return Ok(None);
        }

        let mut files = Vec::with_capacity(self.inner.value_count);
        for index in 0..self.inner.value_count {
            match fs::File::open(self.inner.value_path(&key, index)).await {
                Ok(file) => files.push(file),
                // Trimmed between the index lookup and the open.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        trace!(digest = %digest, "Store hit");
        Ok(Some(Box::new(FileSnapshot { files })))
    }

    async fn edit(&self, digest: &DiskDigest) -> StoreResult<Option<Box<dyn Editor>>> {
        self.inner.ensure_open()?;
        let key = digest.to_hex();
        {
            let mut state = self.inner.state.lock();
            if !state.editing.insert(key.clone()) {
                return Ok(None);
            }
        }
        Ok(Some(Box::new(FileEditor {
            inner: self.inner.clone(),
            key,
            values: vec![None; self.inner.value_count],
            finished: false,
        })))
    }

    async fn flush(&self) -> StoreResult<()> {
        self.inner.ensure_open()?;
        self.inner.write_journal().await
    }

    async fn close(&self) -> StoreResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = self.inner.write_journal().await;
        self.inner.closed.store(true, Ordering::Release);
        result
    }

    async fn delete(&self) -> StoreResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        {
            let mut state = self.inner.state.lock();
            state.entries.clear();
            state.size = 0;
        }
        match fs::remove_dir_all(&self.inner.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn size(&self) -> u64 {
        self.inner.state.lock().size
    }

    fn max_size(&self) -> u64 {
        self.inner.max_size
    }
}

impl StoreInner {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn value_path(&self, key: &str, index: usize) -> PathBuf {
        self.dir.join(format!("{key}.{index}"))
    }

    fn temp_path(&self, key: &str, index: usize) -> PathBuf {
        self.dir.join(format!("{key}.{index}{TEMP_SUFFIX}"))
    }

    /// Drops least recently used entries until the store fits its budget.
    /// Returns the keys whose files must be deleted.
    fn trim_locked(&self, state: &mut StoreState) -> Vec<String> {
        let mut victims = Vec::new();
        while state.size > self.max_size {
            let Some((key, size)) = state.entries.pop_lru() else {
                break;
            };
            state.size -= size;
            victims.push(key);
        }
        victims
    }

    async fn remove_files(&self, keys: Vec<String>) {
        for key in keys {
            for index in 0..self.value_count {
                let path = self.value_path(&key, index);
                if let Err(e) = fs::remove_file(&path).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %e, "Failed to remove trimmed entry");
                }
            }
            trace!(key = %key, "Trimmed store entry");
        }
    }

    async fn write_journal(&self) -> StoreResult<()> {
        let journal = {
            let state = self.state.lock();
            Journal {
                format: STORE_FORMAT,
                app_version: self.app_version,
                value_count: self.value_count,
                entries: state.entries.iter().rev().map(|(key, _)| key.clone()).collect(),
            }
        };
        let content =
            toml::to_string_pretty(&journal).map_err(|e| StoreError::Journal(e.to_string()))?;
        let dir = self.dir.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut temp_file = tempfile::NamedTempFile::new_in(&dir)?;
            temp_file.write_all(content.as_bytes())?;
            temp_file.persist(dir.join(JOURNAL_FILE)).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Journal(format!("journal task failed: {e}")))??;
        Ok(())
    }
}

struct FileSnapshot {
    files: Vec<fs::File>,
}

#[async_trait]
impl Snapshot for FileSnapshot {
    async fn read_value(&mut self, index: usize) -> StoreResult<Bytes> {
        let value_count = self.files.len();
        let file = self
            .files
            .get_mut(index)
            .ok_or(StoreError::InvalidIndex { index, value_count })?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

struct FileEditor {
    inner: Arc<StoreInner>,
    key: String,
    values: Vec<Option<Bytes>>,
    finished: bool,
}

impl FileEditor {
    async fn discard(&mut self) {
        for index in 0..self.values.len() {
            let _ = fs::remove_file(self.inner.temp_path(&self.key, index)).await;
        }
        self.inner.state.lock().editing.remove(&self.key);
        self.finished = true;
    }

    async fn write_temp(&self, index: usize, value: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(self.inner.temp_path(&self.key, index)).await?;
        file.write_all(value).await?;
        file.flush().await?;
        file.sync_data().await
    }
}

#[async_trait]
impl Editor for FileEditor {
    fn set_value(&mut self, index: usize, value: Bytes) -> StoreResult<()> {
        let value_count = self.values.len();
        let slot = self
            .values
            .get_mut(index)
            .ok_or(StoreError::InvalidIndex { index, value_count })?;
        *slot = Some(value);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        if let Err(e) = this.inner.ensure_open() {
            this.discard().await;
            return Err(e);
        }
        let values: Vec<Bytes> = match this.values.iter().cloned().collect::<Option<Vec<_>>>() {
            Some(values) => values,
            None => {
                this.discard().await;
                return Err(StoreError::IncompleteEdit(this.key.clone()));
            }
        };

        for (index, value) in values.iter().enumerate() {
            if let Err(e) = this.write_temp(index, value).await {
                this.discard().await;
                return Err(e.into());
            }
        }
        for index in 0..values.len() {
            let from = this.inner.temp_path(&this.key, index);
            let to = this.inner.value_path(&this.key, index);
            if let Err(e) = fs::rename(&from, &to).await {
                this.discard().await;
                return Err(e.into());
            }
        }

        let total: u64 = values.iter().map(|v| v.len() as u64).sum();
        let victims = {
            let mut state = this.inner.state.lock();
            if let Some(previous) = state.entries.pop(&this.key) {
                state.size -= previous;
            }
            state.entries.put(this.key.clone(), total);
            state.size += total;
            state.editing.remove(&this.key);
            this.inner.trim_locked(&mut state)
        };
        this.finished = true;
        trace!(key = %this.key, size = total, "Committed store entry");
        this.inner.remove_files(victims).await;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.discard().await;
        Ok(())
    }
}

impl Drop for FileEditor {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for index in 0..self.values.len() {
            let _ = std::fs::remove_file(self.inner.temp_path(&self.key, index));
        }
        self.inner.state.lock().editing.remove(&self.key);
    }
}

async fn read_journal(dir: &Path) -> Option<Journal> {
    let content = fs::read_to_string(dir.join(JOURNAL_FILE)).await.ok()?;
    match toml::from_str(&content) {
        Ok(journal) => Some(journal),
        Err(e) => {
            warn!(error = %e, "Unreadable store journal, rebuilding from directory scan");
            None
        }
    }
}

async fn clear_dir(dir: &Path) -> StoreResult<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file()
            && let Err(e) = fs::remove_file(&path).await
        {
            warn!(path = %path.display(), error = %e, "Failed to remove store file");
        }
    }
    Ok(())
}

/// Finds complete entries on disk, removing temporary and incomplete ones.
async fn scan_entries(dir: &Path, value_count: usize) -> StoreResult<HashMap<String, ScannedEntry>> {
    let mut found: HashMap<String, ScannedEntry> = HashMap::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        if name.ends_with(TEMP_SUFFIX) {
            let _ = fs::remove_file(&path).await;
            continue;
        }
        let Some((key, index)) = name.rsplit_once('.') else {
            continue;
        };
        let Ok(index) = index.parse::<usize>() else {
            continue;
        };
        if index >= value_count || DiskDigest::from_hex(key).is_none() {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let scanned = found.entry(key.to_owned()).or_insert(ScannedEntry {
            indices: 0,
            size: 0,
            modified: SystemTime::UNIX_EPOCH,
        });
        scanned.indices += 1;
        scanned.size += meta.len();
        scanned.modified = scanned.modified.max(modified);
    }

    let incomplete: Vec<String> = found
        .iter()
        .filter(|(_, entry)| entry.indices < value_count)
        .map(|(key, _)| key.clone())
        .collect();
    for key in incomplete {
        found.remove(&key);
        for index in 0..value_count {
            let _ = fs::remove_file(dir.join(format!("{key}.{index}"))).await;
        }
    }

    Ok(found)
}
