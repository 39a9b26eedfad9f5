use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use filetime::FileTime;
use lru::LruCache;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::CacheKey;

/// Directory for in-progress edits, relative to the store root.
const TMP_DIR: &str = "tmp";

/// Which entries are on disk, in least-recently-used order, with their sizes.
struct Index {
    entries: LruCache<String, u64>,
    size: u64,
}

struct StoreInner {
    /// The directory chosen at open time.
    root: PathBuf,
    /// `root/v{generation}`, holding all committed entries.
    entries_dir: PathBuf,
    /// `root/tmp`, holding the files of outstanding edits.
    tmp_dir: PathBuf,
    generation: u32,
    max_size: u64,
    index: Mutex<Index>,
    /// Relative paths of all keys that currently have an outstanding [`Editor`].
    editing: Mutex<HashSet<String>>,
}

/// A bounded, file-system backed key to blob store.
///
/// Entries are written through an [`Editor`] and only become visible once it is committed. The
/// store is bounded by the total size of its files and evicts whole entries in
/// least-recently-used order whenever a commit pushes it over its bound.
///
/// All entries live in a directory named after the store's generation. Opening the store with
/// another generation wipes the entries of every other generation.
///
/// All methods do blocking file-system I/O.
#[derive(Clone)]
pub struct PersistentStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore")
            .field("root", &self.inner.root)
            .field("generation", &self.inner.generation)
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

impl PersistentStore {
    /// Opens the store in the first usable directory out of `candidates`.
    ///
    /// A directory is usable if it can be created and written to. The choice is made once, here,
    /// and never revisited for the lifetime of the store.
    pub fn open(candidates: &[PathBuf], generation: u32, max_size: u64) -> io::Result<Self> {
        let mut last_error = None;

        for root in candidates {
            match StoreInner::open(root, generation, max_size) {
                Ok(inner) => {
                    tracing::info!(
                        root = %root.display(),
                        generation,
                        entries = inner.index.lock().unwrap().entries.len(),
                        "Opened persistent cache"
                    );
                    return Ok(Self {
                        inner: Arc::new(inner),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        root = %root.display(),
                        error = &e as &dyn std::error::Error,
                        "Cache directory is unusable"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no cache directory configured")
        }))
    }

    /// The directory this store was opened in.
    pub fn directory(&self) -> &Path {
        &self.inner.root
    }

    pub fn generation(&self) -> u32 {
        self.inner.generation
    }

    /// Reads the entry stored under `key`.
    ///
    /// A hit marks the entry as most recently used, both in memory and via its `mtime`.
    pub fn get(&self, key: &CacheKey) -> io::Result<Option<Bytes>> {
        let rel = key.cache_path();
        let path = self.inner.entries_dir.join(&rel);

        match catch_not_found(|| fs::read(&path))? {
            Some(data) => {
                self.inner.index.lock().unwrap().entries.promote(&rel);
                if let Err(e) = filetime::set_file_mtime(&path, FileTime::now()) {
                    tracing::trace!(path = %path.display(), "Failed to touch cache file: {e}");
                }
                metric!(counter("caches.file.hit") += 1);
                Ok(Some(Bytes::from(data)))
            }
            None => {
                // the file might have been deleted behind our back
                let mut index = self.inner.index.lock().unwrap();
                if let Some(size) = index.entries.pop(&rel) {
                    index.size -= size;
                }
                metric!(counter("caches.file.miss") += 1);
                Ok(None)
            }
        }
    }

    /// Whether a committed entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let rel = key.cache_path();
        self.inner.index.lock().unwrap().entries.contains(&rel)
    }

    /// Starts writing the entry for `key`.
    ///
    /// Returns `None` if another [`Editor`] for the same key is still outstanding. This is not
    /// an error, the caller should simply try again later.
    pub fn edit(&self, key: &CacheKey) -> io::Result<Option<Editor>> {
        let rel = key.cache_path();
        if !self.inner.editing.lock().unwrap().insert(rel.clone()) {
            tracing::trace!(%key, "Cache entry is already being written");
            return Ok(None);
        }
        let lock = EditLock {
            store: self.inner.clone(),
            rel,
        };

        let file = self.inner.tempfile()?;
        Ok(Some(Editor {
            lock,
            file,
            written: 0,
        }))
    }

    /// Removes the entry stored under `key`, returning whether there was one.
    pub fn remove(&self, key: &CacheKey) -> io::Result<bool> {
        let rel = key.cache_path();
        let mut index = self.inner.index.lock().unwrap();
        if let Some(size) = index.entries.pop(&rel) {
            index.size -= size;
        }
        let removed = catch_not_found(|| fs::remove_file(self.inner.entries_dir.join(&rel)))?;
        Ok(removed.is_some())
    }

    /// Wipes all entries and reinitializes the store in the same directory.
    pub fn delete(&self) -> io::Result<()> {
        let mut index = self.inner.index.lock().unwrap();
        catch_not_found(|| fs::remove_dir_all(&self.inner.entries_dir))?;
        index.entries.clear();
        index.size = 0;
        fs::create_dir_all(&self.inner.entries_dir)?;
        tracing::info!(root = %self.inner.root.display(), "Deleted persistent cache");
        Ok(())
    }

    /// Total size of all committed entries, in bytes.
    pub fn size(&self) -> u64 {
        self.inner.index.lock().unwrap().size
    }

    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    pub fn len(&self) -> usize {
        self.inner.index.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoreInner {
    fn open(root: &Path, generation: u32, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let current = format!("v{generation}");

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_stale_generation = name != current
                && name
                    .strip_prefix('v')
                    .is_some_and(|v| v.parse::<u32>().is_ok());
            if is_stale_generation || name == TMP_DIR {
                tracing::debug!(path = %entry.path().display(), "Removing stale cache directory");
                catch_not_found(|| fs::remove_dir_all(entry.path()))?;
            }
        }

        let entries_dir = root.join(&current);
        let tmp_dir = root.join(TMP_DIR);
        fs::create_dir_all(&entries_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        // make sure we can actually write here before committing to this directory
        tempfile::Builder::new()
            .prefix("probe")
            .tempfile_in(&tmp_dir)?;

        let mut index = Index {
            entries: LruCache::unbounded(),
            size: 0,
        };
        for (rel, size) in scan_entries(&entries_dir)? {
            index.entries.put(rel, size);
            index.size += size;
        }

        let inner = Self {
            root: root.to_owned(),
            entries_dir,
            tmp_dir,
            generation,
            max_size,
            index: Mutex::new(index),
            editing: Mutex::new(HashSet::new()),
        };
        inner.shrink(&mut inner.index.lock().unwrap());

        Ok(inner)
    }

    /// Create a new temporary file for an edit.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // the tmp directory can be wiped while we run, recreate it on every attempt
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", self.tmp_dir.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", self.tmp_dir.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Records a freshly committed entry and evicts older ones if this exceeds the bound.
    fn insert(&self, rel: String, size: u64) {
        let mut index = self.index.lock().unwrap();
        if let Some(previous) = index.entries.put(rel, size) {
            index.size -= previous;
        }
        index.size += size;
        self.shrink(&mut index);
        metric!(gauge("caches.file.size") = index.size);
    }

    /// Deletes least recently used entries until the store fits into `max_size`.
    fn shrink(&self, index: &mut Index) {
        let mut evicted: i64 = 0;
        while index.size > self.max_size {
            let Some((rel, size)) = index.entries.pop_lru() else {
                break;
            };
            index.size -= size;
            evicted += 1;

            let path = self.entries_dir.join(&rel);
            if let Err(e) = catch_not_found(|| fs::remove_file(&path)) {
                tracing::error!(
                    path = %path.display(),
                    error = &e as &dyn std::error::Error,
                    "Failed to evict cache file"
                );
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, size = index.size, "Evicted persistent cache entries");
            metric!(counter("caches.file.evicted") += evicted);
        }
    }
}

/// Lists all committed entries below `entries_dir`, least recently used first.
fn scan_entries(entries_dir: &Path) -> io::Result<Vec<(String, u64)>> {
    let mut files = vec![];
    for entry in WalkDir::new(entries_dir).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata().map_err(io::Error::from)?;
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let Ok(rel) = entry.path().strip_prefix(entries_dir) else {
            continue;
        };
        let rel: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();

        files.push((rel.join("/"), metadata.len(), mtime));
    }

    files.sort_by_key(|(_, _, mtime)| *mtime);
    Ok(files
        .into_iter()
        .map(|(rel, size, _)| (rel, size))
        .collect())
}

/// Marks a key as being edited for as long as it is alive.
struct EditLock {
    store: Arc<StoreInner>,
    rel: String,
}

impl Drop for EditLock {
    fn drop(&mut self) {
        self.store.editing.lock().unwrap().remove(&self.rel);
    }
}

/// A pending write of one [`PersistentStore`] entry.
///
/// Nothing becomes visible until [`commit`](Self::commit) succeeds. Dropping the editor without
/// committing abandons the edit and deletes everything written so far.
pub struct Editor {
    lock: EditLock,
    file: NamedTempFile,
    written: u64,
}

impl fmt::Debug for Editor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Editor")
            .field("path", &self.lock.rel)
            .field("written", &self.written)
            .finish()
    }
}

impl Editor {
    /// Appends `data` to the entry.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Atomically publishes the entry, replacing any previous one.
    pub fn commit(self) -> io::Result<()> {
        let Self {
            lock,
            mut file,
            written,
        } = self;
        file.flush()?;

        let cache_path = lock.store.entries_dir.join(&lock.rel);
        persist_tempfile(file, &cache_path)?;

        tracing::trace!(path = %cache_path.display(), written, "Committed cache file");
        metric!(counter("caches.file.write") += 1);
        lock.store.insert(lock.rel.clone(), written);
        Ok(())
    }

    /// Discards the edit.
    pub fn abandon(self) {}
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // `delete` may remove the parent directories concurrently, so they are recreated on retry
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
