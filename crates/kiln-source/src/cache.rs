use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct CacheEntry {
    bytes: Arc<[u8]>,
    last_read: Instant,
    /// Content came from a transformation, not from disk; never evicted.
    pinned: bool,
}

/// Library files keyed by path.
///
/// An entry is read from disk only when absent or after [`ReferenceCache::invalidate`].
/// A single lock guards lookup, insertion and eviction.
#[derive(Debug)]
pub struct ReferenceCache {
    libraries: PathBuf,
    idle_eviction: Duration,
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl ReferenceCache {
    pub fn new(libraries: impl Into<PathBuf>, idle_eviction: Duration) -> Self {
        Self {
            libraries: libraries.into(),
            idle_eviction,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn libraries_dir(&self) -> &Path {
        &self.libraries
    }

    /// `<libraries>/<name>.dll`
    pub fn library_path(&self, name: &str) -> PathBuf {
        self.libraries.join(library_file_name(name))
    }

    pub fn library_exists(&self, name: &str) -> bool {
        let path = self.library_path(name);
        self.entries.lock().contains_key(&path) || path.is_file()
    }

    /// Bytes of `<name>.dll`, read from disk only if not cached.
    pub fn load_library(&self, name: &str) -> io::Result<Arc<[u8]>> {
        self.load(&self.library_path(name))
    }

    pub fn load(&self, path: &Path) -> io::Result<Arc<[u8]>> {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.last_read = Instant::now();
            return Ok(entry.bytes.clone());
        }

        // Read outside the lock; a racing reader simply inserts the same bytes.
        let bytes: Arc<[u8]> = std::fs::read(path)?.into();
        tracing::trace!(target: "kiln.cache", path = %path.display(), len = bytes.len(), "cached library");
        let mut entries = self.entries.lock();
        let entry = entries.entry(path.to_path_buf()).or_insert(CacheEntry {
            bytes,
            last_read: Instant::now(),
            pinned: false,
        });
        Ok(entry.bytes.clone())
    }

    /// Store transformed content for `path`. Pinned entries are never evicted
    /// and shadow the file on disk.
    pub fn insert_pinned(&self, path: impl Into<PathBuf>, bytes: Arc<[u8]>) {
        self.entries.lock().insert(
            path.into(),
            CacheEntry {
                bytes,
                last_read: Instant::now(),
                pinned: true,
            },
        );
    }

    /// Drop the entry for `path` so the next load re-reads it.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.entries.lock().remove(path).is_some()
    }

    /// Evict unpinned entries not read within the idle interval.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.pinned || now.saturating_duration_since(entry.last_read) < self.idle_eviction
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(target: "kiln.cache", evicted, "evicted idle library entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn library_file_name(name: &str) -> String {
    format!("{name}.dll")
}
