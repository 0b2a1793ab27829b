//! Reference-counted LRU file cache.
//!
//! Blobs live under a flat root as `<hash>_<size>` (plus `_exec` for the
//! executable variant); materialized input directories as
//! `<hash>_<size>_dir`. Entries carry a reference count; only unreferenced
//! entries sit in the LRU order, which is kept as an external map keyed by a
//! monotonic release sequence. The cache stays within its size budget after
//! every successful put, and never evicts a referenced entry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use granary_api::{Digest, DigestUtil, Directory, DirectoryNode, FileNode, Status};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::{CacheError, CacheResult};

/// How long a positive disk-existence check is trusted.
const EXISTS_DEADLINE: Duration = Duration::from_secs(10);

/// Where cache misses are filled from (other workers, in production).
#[async_trait::async_trait]
pub trait BlobSource: Send + Sync {
    async fn open(
        &self,
        digest: &Digest,
        offset: i64,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, Status>;
}

/// Cache change notifications, consumed by the blob-location announcer.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheEvent {
    Put(Digest),
    Expired(Vec<Digest>),
}

#[derive(Clone, Debug)]
pub struct CasFileCacheConfig {
    pub root: PathBuf,
    pub max_size_bytes: i64,
}

struct Entry {
    digest: Digest,
    is_executable: bool,
    size: i64,
    refs: u32,
    containing_directories: HashSet<Digest>,
    exists_deadline: Instant,
    /// Sequence under which this entry is listed in the LRU order; present
    /// iff `refs == 0`.
    lru_seq: Option<u64>,
}

struct DirectoryEntry {
    directory: Directory,
    /// Cache keys of every file hard-linked into the materialization.
    inputs: Vec<String>,
    exists_deadline: Instant,
}

#[derive(Default)]
struct CacheState {
    storage: HashMap<String, Entry>,
    directories: HashMap<String, DirectoryEntry>,
    /// release sequence -> entry key; oldest release first.
    lru: BTreeMap<u64, String>,
    next_seq: u64,
    size_bytes: i64,
}

impl CacheState {
    fn push_lru(&mut self, key: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.lru.insert(seq, key.to_string());
        self.storage
            .get_mut(key)
            .expect("lru key present in storage")
            .lru_seq = Some(seq);
    }

    fn touch_lru(&mut self, key: &str) {
        let unreferenced = self
            .storage
            .get(key)
            .map(|entry| entry.refs == 0)
            .unwrap_or(false);
        if unreferenced {
            if let Some(seq) = self
                .storage
                .get_mut(key)
                .and_then(|entry| entry.lru_seq.take())
            {
                self.lru.remove(&seq);
            }
            self.push_lru(key);
        }
    }

    fn increment(&mut self, key: &str) {
        let seq = {
            let entry = self.storage.get_mut(key).expect("entry present");
            let seq = if entry.refs == 0 {
                Some(entry.lru_seq.take().expect("unreferenced entry listed"))
            } else {
                None
            };
            entry.refs += 1;
            seq
        };
        if let Some(seq) = seq {
            self.lru.remove(&seq);
        }
    }
}

pub struct CasFileCache {
    root: PathBuf,
    max_size_bytes: i64,
    source: Arc<dyn BlobSource>,
    state: Mutex<CacheState>,
    /// Signaled whenever a reference count drops to zero.
    unreferenced: Notify,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: Option<mpsc::UnboundedSender<CacheEvent>>,
}

impl CasFileCache {
    pub fn new(
        config: CasFileCacheConfig,
        source: Arc<dyn BlobSource>,
        events: Option<mpsc::UnboundedSender<CacheEvent>>,
    ) -> CasFileCache {
        CasFileCache {
            root: config.root,
            max_size_bytes: config.max_size_bytes,
            source,
            state: Mutex::new(CacheState::default()),
            unreferenced: Notify::new(),
            key_locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn size_bytes(&self) -> i64 {
        self.lock().size_bytes
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache state poisoned")
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn file_name(digest: &Digest, is_executable: bool) -> String {
        if is_executable {
            format!("{digest}_exec")
        } else {
            digest.to_key()
        }
    }

    pub fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn directory_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(format!("{digest}_dir"))
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .expect("key locks poisoned")
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Parse `<hash>_<size>[_exec]`; `None` for anything else.
    fn parse_file_name(file_name: &str) -> Option<(Digest, bool)> {
        let (stem, is_executable) = match file_name.strip_suffix("_exec") {
            Some(stem) => (stem, true),
            None => (file_name, false),
        };
        Digest::parse_key(stem).map(|digest| (digest, is_executable))
    }

    /// Trust a recent existence check; stat otherwise.
    fn entry_exists(entry: &mut Entry, path: &Path) -> bool {
        if entry.exists_deadline > Instant::now() {
            return true;
        }
        if path.exists() {
            entry.exists_deadline = Instant::now() + EXISTS_DEADLINE;
            return true;
        }
        false
    }

    /// Recover persisted entries by walking one level of the root. Files
    /// with foreign names and undersized partial writes are deleted;
    /// materialized directories are verified against recomputed digests.
    /// Returns the digests of recovered blobs.
    pub async fn start(&self) -> CacheResult<Vec<Digest>> {
        tokio::fs::create_dir_all(&self.root).await?;

        let mut recovered = Vec::new();
        let mut directories = Vec::new();
        // (dev, ino) -> entry key, for rebuilding directory contents from
        // their hard links.
        let mut file_ids: HashMap<(u64, u64), String> = HashMap::new();

        let mut dirents = tokio::fs::read_dir(&self.root).await?;
        while let Some(dirent) = dirents.next_entry().await? {
            let path = dirent.path();
            let metadata = dirent.metadata().await?;
            let file_name = dirent.file_name().to_string_lossy().into_owned();
            if metadata.is_dir() {
                directories.push((path, file_name));
                continue;
            }
            let parsed = Self::parse_file_name(&file_name)
                .filter(|(digest, _)| digest.size_bytes == metadata.len() as i64);
            let (digest, is_executable) = match parsed {
                Some(parsed) => parsed,
                None => {
                    debug!(file = %path.display(), "removing unrecognized cache file");
                    tokio::fs::remove_file(&path).await?;
                    continue;
                }
            };
            let size = metadata.len() as i64;
            let over_budget = {
                let mut state = self.lock();
                if state.size_bytes + size > self.max_size_bytes {
                    true
                } else {
                    if !state.storage.contains_key(&file_name) {
                        state.storage.insert(
                            file_name.clone(),
                            Entry {
                                digest: digest.clone(),
                                is_executable,
                                size,
                                refs: 0,
                                containing_directories: HashSet::new(),
                                exists_deadline: Instant::now() + EXISTS_DEADLINE,
                                lru_seq: None,
                            },
                        );
                        state.push_lru(&file_name);
                        state.size_bytes += size;
                    }
                    false
                }
            };
            if over_budget {
                tokio::fs::remove_file(&path).await?;
                continue;
            }
            file_ids.insert((metadata.dev(), metadata.ino()), file_name);
            recovered.push(digest);
        }

        for (path, dir_name) in directories {
            let digest = dir_name.strip_suffix("_dir").and_then(Digest::parse_key);
            let valid = match digest {
                Some(digest) => self.recover_directory(&path, &digest, &file_ids).await?,
                None => false,
            };
            if !valid {
                debug!(directory = %path.display(), "removing invalid cache directory");
                tokio::fs::remove_dir_all(&path).await?;
            }
        }

        Ok(recovered)
    }

    /// Rebuild the Directory message for a materialization from disk and
    /// register it when its digest matches the directory name.
    async fn recover_directory(
        &self,
        path: &Path,
        digest: &Digest,
        file_ids: &HashMap<(u64, u64), String>,
    ) -> CacheResult<bool> {
        let mut inputs = Vec::new();
        let directory = match self.compute_directory(path, file_ids, &mut inputs).await? {
            Some(directory) => directory,
            None => return Ok(false),
        };
        if &DigestUtil.compute_message(&directory) != digest {
            return Ok(false);
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        if !inputs.iter().all(|input| state.storage.contains_key(input)) {
            return Ok(false);
        }
        for input in &inputs {
            state
                .storage
                .get_mut(input)
                .expect("input present")
                .containing_directories
                .insert(digest.clone());
        }
        state.directories.insert(
            digest.to_key(),
            DirectoryEntry {
                directory,
                inputs,
                exists_deadline: Instant::now() + EXISTS_DEADLINE,
            },
        );
        Ok(true)
    }

    fn compute_directory<'a>(
        &'a self,
        path: &'a Path,
        file_ids: &'a HashMap<(u64, u64), String>,
        inputs: &'a mut Vec<String>,
    ) -> BoxFuture<'a, CacheResult<Option<Directory>>> {
        Box::pin(async move {
            let mut directory = Directory::default();
            let mut dirents = tokio::fs::read_dir(path).await?;
            let mut entries = Vec::new();
            while let Some(dirent) = dirents.next_entry().await? {
                entries.push(dirent);
            }
            entries.sort_by_key(|dirent| dirent.file_name());
            for dirent in entries {
                let name = dirent.file_name().to_string_lossy().into_owned();
                let metadata = dirent.metadata().await?;
                if metadata.is_dir() {
                    let child_path = dirent.path();
                    let child = match self.compute_directory(&child_path, file_ids, inputs).await? {
                        Some(child) => child,
                        None => return Ok(None),
                    };
                    directory.directories.push(DirectoryNode {
                        name,
                        digest: Some(DigestUtil.compute_message(&child)),
                    });
                } else if metadata.is_file() {
                    if metadata.len() == 0 {
                        directory.files.push(FileNode {
                            name,
                            digest: Some(DigestUtil.empty()),
                            is_executable: false,
                        });
                        continue;
                    }
                    let key = match file_ids.get(&(metadata.dev(), metadata.ino())) {
                        Some(key) => key.clone(),
                        None => return Ok(None),
                    };
                    let (file_digest, is_executable) =
                        Self::parse_file_name(&key).expect("recovered key parses");
                    inputs.push(key);
                    directory.files.push(FileNode {
                        name,
                        digest: Some(file_digest),
                        is_executable,
                    });
                } else {
                    return Ok(None);
                }
            }
            Ok(Some(directory))
        })
    }

    /// Digests absent from the cache, in input order.
    pub async fn find_missing_blobs(&self, digests: &[Digest]) -> Vec<Digest> {
        let mut missing = Vec::new();
        for digest in digests {
            if digest.is_empty() {
                continue;
            }
            if !self.contains(digest) {
                missing.push(digest.clone());
            }
        }
        missing
    }

    fn contains(&self, digest: &Digest) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        for is_executable in [false, true] {
            let key = Self::file_name(digest, is_executable);
            let path = self.root.join(&key);
            let exists = match state.storage.get_mut(&key) {
                Some(entry) => Self::entry_exists(entry, &path),
                None => false,
            };
            if exists {
                state.touch_lru(&key);
                return true;
            }
        }
        false
    }

    /// Open the backing file at an offset. A missing backing file removes
    /// the entry so callers can fall through to a remote fetch.
    pub async fn new_input(&self, digest: &Digest, offset: i64) -> CacheResult<tokio::fs::File> {
        for is_executable in [false, true] {
            let key = Self::file_name(digest, is_executable);
            if !self.lock().storage.contains_key(&key) {
                continue;
            }
            match tokio::fs::File::open(self.key_path(&key)).await {
                Ok(mut file) => {
                    if offset > 0 {
                        file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
                    }
                    self.lock().touch_lru(&key);
                    return Ok(file);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    let expired = {
                        let mut guard = self.lock();
                        self.remove_entry_locked(&mut guard, &key)
                    };
                    self.expire_directories(expired).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(CacheError::NotFound(digest.clone()))
    }

    /// Whole-blob read.
    pub async fn get_blob(&self, digest: &Digest) -> CacheResult<Bytes> {
        if digest.is_empty() {
            return Ok(Bytes::new());
        }
        let mut file = self.new_input(digest, 0).await?;
        let mut contents = Vec::with_capacity(digest.size_bytes as usize);
        file.read_to_end(&mut contents).await?;
        Ok(Bytes::from(contents))
    }

    /// Store a blob directly (worker-local writes: outputs, uploads).
    pub async fn put_blob(&self, digest: &Digest, blob: Bytes) -> CacheResult<()> {
        if digest.is_empty() {
            return Ok(());
        }
        struct OneShot(Mutex<Option<Bytes>>);

        #[async_trait::async_trait]
        impl BlobSource for OneShot {
            async fn open(
                &self,
                digest: &Digest,
                _offset: i64,
            ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, Status> {
                let blob = self
                    .0
                    .lock()
                    .expect("oneshot poisoned")
                    .take()
                    .ok_or_else(|| Status::not_found(format!("blobs/{digest}")))?;
                Ok(Box::pin(futures::stream::iter([Ok(blob)])))
            }
        }

        let source = OneShot(Mutex::new(Some(blob)));
        let key = self.put_from(digest, false, None, &source).await?;
        self.decrement_references(&[key], &[]);
        Ok(())
    }

    /// Ensure a blob is cached and referenced; returns its cache key.
    ///
    /// The caller owns one reference (plus directory bookkeeping when
    /// `containing_directory` is set) and must release it through
    /// [`CasFileCache::decrement_references`].
    pub async fn put(
        &self,
        digest: &Digest,
        is_executable: bool,
        containing_directory: Option<&Digest>,
    ) -> CacheResult<String> {
        let source = self.source.clone();
        self.put_from(digest, is_executable, containing_directory, source.as_ref())
            .await
    }

    async fn put_from(
        &self,
        digest: &Digest,
        is_executable: bool,
        containing_directory: Option<&Digest>,
        source: &dyn BlobSource,
    ) -> CacheResult<String> {
        if digest.size_bytes <= 0 {
            return Err(CacheError::InvalidEntry(
                "file entries may not be empty".to_string(),
            ));
        }
        let key = Self::file_name(digest, is_executable);
        let key_lock = self.key_lock(&key);
        let _guard = key_lock.lock().await;

        // Fast path: present and intact.
        let stale = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let path = self.root.join(&key);
            let exists = match state.storage.get_mut(&key) {
                Some(entry) => Self::entry_exists(entry, &path),
                None => false,
            };
            if exists {
                if let Some(directory) = containing_directory {
                    state
                        .storage
                        .get_mut(&key)
                        .expect("entry present")
                        .containing_directories
                        .insert(directory.clone());
                }
                state.increment(&key);
                return Ok(key);
            }
            state.storage.contains_key(&key)
        };
        if stale {
            let removed = {
                let mut guard = self.lock();
                self.remove_entry_locked(&mut guard, &key)
            };
            self.expire_directories(removed).await?;
        }

        // Reserve space, evicting while over budget.
        self.reserve(digest.size_bytes, &key).await?;

        if let Err(err) = self
            .fetch_into_place(digest, is_executable, &key, source)
            .await
        {
            self.lock().size_bytes -= digest.size_bytes;
            return Err(err);
        }

        {
            let mut state = self.lock();
            let mut containing_directories = HashSet::new();
            if let Some(directory) = containing_directory {
                containing_directories.insert(directory.clone());
            }
            let replaced = state.storage.insert(
                key.clone(),
                Entry {
                    digest: digest.clone(),
                    is_executable,
                    size: digest.size_bytes,
                    refs: 1,
                    containing_directories,
                    exists_deadline: Instant::now() + EXISTS_DEADLINE,
                    lru_seq: None,
                },
            );
            debug_assert!(replaced.is_none(), "storage conflict for {key}");
        }
        self.emit(CacheEvent::Put(digest.clone()));
        Ok(key)
    }

    /// Account `size` against the budget, evicting LRU-first until it fits.
    /// Waits when every entry is referenced. Keeps positive headroom while
    /// eviction candidates remain.
    async fn reserve(&self, size: i64, for_key: &str) -> CacheResult<()> {
        self.lock().size_bytes += size;
        loop {
            let victim = {
                let state = self.lock();
                let over = state.size_bytes > self.max_size_bytes
                    || (state.size_bytes == self.max_size_bytes && !state.lru.is_empty());
                if !over {
                    return Ok(());
                }
                if state.storage.is_empty() {
                    break;
                }
                state.lru.values().next().cloned()
            };
            match victim {
                Some(victim_key) => {
                    let victim_lock = self.key_lock(&victim_key);
                    match victim_lock.try_lock() {
                        Ok(_victim_guard) => self.evict(&victim_key).await?,
                        Err(_) => {
                            // Contended: refresh its position and pick the
                            // next victim.
                            self.lock().touch_lru(&victim_key);
                        }
                    };
                }
                None => {
                    debug!(key = for_key, "cache full of referenced entries; waiting");
                    self.unreferenced.notified().await;
                }
            }
        }
        self.lock().size_bytes -= size;
        Err(CacheError::InvalidEntry(format!(
            "blob {for_key} exceeds the cache size budget"
        )))
    }

    /// Remove one unreferenced entry and its on-disk file. The caller holds
    /// the victim's key lock.
    async fn evict(&self, key: &str) -> CacheResult<()> {
        let entry = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let evictable = state
                .storage
                .get(key)
                .map(|entry| entry.refs == 0)
                .unwrap_or(false);
            if !evictable {
                // Re-referenced or gone since selection.
                return Ok(());
            }
            let entry = state.storage.remove(key).expect("entry present");
            if let Some(seq) = entry.lru_seq {
                state.lru.remove(&seq);
            }
            state.size_bytes -= entry.size;
            entry
        };

        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(key, "expired key did not exist to delete");
            }
            Err(err) => return Err(err.into()),
        }
        let expired_dirs: Vec<Digest> = entry.containing_directories.iter().cloned().collect();
        self.expire_directories(expired_dirs).await?;

        // Report the digest gone only when the sibling variant is gone too.
        let sibling = Self::file_name(&entry.digest, !entry.is_executable);
        let sibling_present = self.lock().storage.contains_key(&sibling);
        if !sibling_present {
            self.emit(CacheEvent::Expired(vec![entry.digest.clone()]));
        }
        debug!(key, size = entry.size, "evicted cache entry");
        Ok(())
    }

    /// Drop an entry from the maps (no disk I/O); returns directories to
    /// expire. Used when the backing file has gone missing.
    fn remove_entry_locked(&self, guard: &mut MutexGuard<'_, CacheState>, key: &str) -> Vec<Digest> {
        let state = &mut **guard;
        match state.storage.remove(key) {
            Some(entry) => {
                if entry.refs != 0 {
                    warn!(key, refs = entry.refs, "removed referenced entry");
                }
                if let Some(seq) = entry.lru_seq {
                    state.lru.remove(&seq);
                }
                state.size_bytes -= entry.size;
                entry.containing_directories.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// Expire directory materializations: unregister, clear back-pointers,
    /// and remove the trees from disk.
    async fn expire_directories(&self, digests: Vec<Digest>) -> CacheResult<()> {
        for digest in digests {
            let removed = {
                let mut guard = self.lock();
                let state = &mut *guard;
                let removed = state.directories.remove(&digest.to_key());
                if let Some(dir_entry) = &removed {
                    for input in &dir_entry.inputs {
                        if let Some(file_entry) = state.storage.get_mut(input) {
                            file_entry.containing_directories.remove(&digest);
                        }
                    }
                }
                removed.is_some()
            };
            if removed {
                match tokio::fs::remove_dir_all(self.directory_path(&digest)).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    async fn fetch_into_place(
        &self,
        digest: &Digest,
        is_executable: bool,
        key: &str,
        source: &dyn BlobSource,
    ) -> CacheResult<()> {
        let path = self.key_path(key);
        let tmp_path = self.root.join(format!("{key}.tmp"));
        match self.write_tmp(digest, is_executable, &tmp_path, source).await {
            Ok(()) => {
                tokio::fs::rename(&tmp_path, &path).await?;
                Ok(())
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(err)
            }
        }
    }

    async fn write_tmp(
        &self,
        digest: &Digest,
        is_executable: bool,
        tmp_path: &Path,
        source: &dyn BlobSource,
    ) -> CacheResult<()> {
        let mut stream = source.open(digest, 0).await.map_err(CacheError::Fetch)?;
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut written: i64 = 0;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as i64;
        }
        if written != digest.size_bytes {
            return Err(CacheError::SizeMismatch {
                expected: digest.size_bytes,
                actual: written,
            });
        }
        let mode = if is_executable { 0o755 } else { 0o644 };
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Materialize a directory tree under `<root>/<hash>_<size>_dir`,
    /// holding one reference on every contained file. Concurrent calls for
    /// the same digest serialize; an intact existing materialization is
    /// reused.
    pub async fn put_directory(
        &self,
        digest: &Digest,
        index: &HashMap<Digest, Directory>,
    ) -> CacheResult<PathBuf> {
        let path = self.directory_path(digest);
        let dir_lock = self.key_lock(&format!("{digest}_dir"));
        let _guard = dir_lock.lock().await;

        // Reuse path: take references on the existing inputs, then verify.
        let mut held: Vec<String> = Vec::new();
        let mut stored: Option<(Directory, bool)> = None;
        let mut lost_input = false;
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let existing = state.directories.get(&digest.to_key()).map(|dir_entry| {
                (
                    dir_entry.inputs.clone(),
                    dir_entry.directory.clone(),
                    dir_entry.exists_deadline > Instant::now(),
                )
            });
            if let Some((inputs, directory, trusted)) = existing {
                if inputs.iter().all(|input| state.storage.contains_key(input)) {
                    for input in &inputs {
                        state.increment(input);
                    }
                    held = inputs;
                    stored = Some((directory, trusted));
                } else {
                    warn!(directory = %digest, "materialized directory lost an input; refetching");
                    lost_input = true;
                }
            }
        }
        if let Some((directory, trusted)) = stored {
            let intact = trusted || self.directory_exists(&path, &directory, index).await;
            if intact {
                if !trusted {
                    if let Some(dir_entry) = self.lock().directories.get_mut(&digest.to_key()) {
                        dir_entry.exists_deadline = Instant::now() + EXISTS_DEADLINE;
                    }
                }
                return Ok(path);
            }
            warn!(directory = %digest, "materialized directory failed verification; refetching");
            self.decrement_references(&held, &[]);
            self.expire_directories(vec![digest.clone()]).await?;
        } else if lost_input {
            self.expire_directories(vec![digest.clone()]).await?;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut inputs = Vec::new();
        if let Err(err) = self
            .fetch_directory(&path, digest, digest, index, &mut inputs)
            .await
        {
            // Roll back whatever was acquired before the failure.
            {
                let mut state = self.lock();
                for input in &inputs {
                    if let Some(entry) = state.storage.get_mut(input) {
                        entry.containing_directories.remove(digest);
                    }
                }
            }
            self.decrement_references(&inputs, &[]);
            let _ = tokio::fs::remove_dir_all(&path).await;
            return Err(err);
        }

        let directory = index
            .get(digest)
            .cloned()
            .ok_or_else(|| CacheError::InvalidEntry(format!("directory {digest} not in index")))?;
        self.lock().directories.insert(
            digest.to_key(),
            DirectoryEntry {
                directory,
                inputs,
                exists_deadline: Instant::now() + EXISTS_DEADLINE,
            },
        );
        Ok(path)
    }

    fn fetch_directory<'a>(
        &'a self,
        path: &'a Path,
        digest: &'a Digest,
        containing: &'a Digest,
        index: &'a HashMap<Digest, Directory>,
        inputs: &'a mut Vec<String>,
    ) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            let directory = index
                .get(digest)
                .ok_or_else(|| {
                    CacheError::InvalidEntry(format!("directory {digest} not in directories index"))
                })?
                .clone();
            tokio::fs::create_dir_all(path).await?;
            for file in &directory.files {
                let file_digest = file
                    .digest
                    .clone()
                    .ok_or_else(|| CacheError::InvalidEntry("file node without digest".into()))?;
                let file_path = path.join(&file.name);
                if file_digest.is_empty() {
                    tokio::fs::File::create(&file_path).await?;
                    continue;
                }
                let key = self
                    .put(&file_digest, file.is_executable, Some(containing))
                    .await?;
                inputs.push(key.clone());
                tokio::fs::hard_link(self.key_path(&key), &file_path).await?;
            }
            for subdirectory in &directory.directories {
                let child_digest = subdirectory.digest.clone().ok_or_else(|| {
                    CacheError::InvalidEntry("directory node without digest".into())
                })?;
                let child_path = path.join(&subdirectory.name);
                self.fetch_directory(&child_path, &child_digest, containing, index, inputs)
                    .await?;
            }
            Ok(())
        })
    }

    fn directory_exists<'a>(
        &'a self,
        path: &'a Path,
        directory: &'a Directory,
        index: &'a HashMap<Digest, Directory>,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if !path.is_dir() {
                return false;
            }
            for file in &directory.files {
                if !path.join(&file.name).exists() {
                    return false;
                }
            }
            for subdirectory in &directory.directories {
                let child = subdirectory
                    .digest
                    .as_ref()
                    .and_then(|digest| index.get(digest));
                let child = match child {
                    Some(child) => child,
                    None => return false,
                };
                let child_path = path.join(&subdirectory.name);
                if !self.directory_exists(&child_path, child, index).await {
                    return false;
                }
            }
            true
        })
    }

    /// Release references taken by `put` and `put_directory`. Entries
    /// reaching zero become eviction candidates in release order.
    pub fn decrement_references(&self, files: &[String], directories: &[Digest]) {
        let mut dereferenced = 0;
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut to_release: Vec<String> = files.to_vec();
            for directory in directories {
                match state.directories.get(&directory.to_key()) {
                    Some(dir_entry) => to_release.extend(dir_entry.inputs.iter().cloned()),
                    None => {
                        warn!(directory = %directory, "released a directory that is not materialized");
                    }
                }
            }
            for key in &to_release {
                let now_unreferenced = match state.storage.get_mut(key) {
                    Some(entry) => {
                        assert!(entry.refs > 0, "entry {key} released below zero");
                        entry.refs -= 1;
                        entry.refs == 0
                    }
                    None => {
                        warn!(key, "released an entry that is no longer stored");
                        continue;
                    }
                };
                if now_unreferenced {
                    state.push_lru(key);
                    dereferenced += 1;
                }
            }
        }
        if dereferenced > 0 {
            self.unreferenced.notify_waiters();
        }
    }

    #[cfg(test)]
    fn refs(&self, key: &str) -> Option<u32> {
        self.lock().storage.get(key).map(|entry| entry.refs)
    }
}
