//! Cache of open source-file handles shared across reads.

use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use dashmap::DashMap;
use tracing::{debug, trace};
use crate::error::{ProviderError, Result};

pub const DEFAULT_MAX_OPEN_FILES: usize = 256;

/// Open source files keyed by source path.
///
/// Each outstanding read holds an [`Arc`] to its file, so the strong count is
/// the reference count. Handles with no outstanding read stay open until
/// [`HandleCache::close_all`], or until the cache grows past `max_open` and
/// idle ones are evicted.
#[derive(Debug)]
pub struct HandleCache {
    handles: DashMap<PathBuf, Arc<File>>,
    max_open: usize,
    enabled: bool,
}

impl HandleCache {
    pub fn new(max_open: usize, enabled: bool) -> Self {
        Self {
            handles: DashMap::new(),
            max_open: max_open.max(1),
            enabled,
        }
    }

    /// A cache that opens and closes the file on every request.
    pub fn disabled() -> Self {
        Self::new(DEFAULT_MAX_OPEN_FILES, false)
    }

    /// Returns a handle to `path`, opening it if needed.
    pub fn open(&self, path: &Path) -> Result<CachedHandle> {
        if !self.enabled {
            return Ok(CachedHandle { file: Arc::new(open_source(path)?) });
        }

        let cached = self.handles.get(path).map(|entry| entry.value().clone());
        if let Some(file) = cached {
            if self.still_current(path, &file)? {
                trace!("Handle cache hit for {}", path.display());
                return Ok(CachedHandle { file });
            }
            debug!("{} was replaced on disk, reopening", path.display());
            self.handles.remove_if(path, |_, cached| Arc::ptr_eq(cached, &file));
        }

        let file = open_source(path)?;
        if self.handles.len() >= self.max_open {
            self.evict_idle();
        }
        // Another reader may have opened the same path meanwhile; keep theirs.
        let file = self
            .handles
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(file))
            .value()
            .clone();
        Ok(CachedHandle { file })
    }

    /// Whether `file` is still the file at `path`. A save that renames a new
    /// file over the old one leaves the cached handle on the old file.
    fn still_current(&self, path: &Path, file: &File) -> Result<bool> {
        let on_disk = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.handles.remove(path);
                return Err(ProviderError::NotFound { path: path.to_path_buf() });
            }
            Err(e) => return Err(ProviderError::SourceRead { path: path.to_path_buf(), source: e }),
        };
        let opened = file
            .metadata()
            .map_err(|e| ProviderError::SourceRead { path: path.to_path_buf(), source: e })?;
        Ok(FileIdentity::of(&opened) == FileIdentity::of(&on_disk))
    }

    /// Closes every handle no read is using. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|_, file| Arc::strong_count(file) > 1);
        let evicted = before.saturating_sub(self.handles.len());
        if evicted > 0 {
            debug!("Evicted {} idle source handles", evicted);
        }
        evicted
    }

    /// Drops every cached handle. Reads still in progress keep theirs alive
    /// until they finish.
    pub fn close_all(&self) {
        let count = self.handles.len();
        self.handles.clear();
        debug!("Closed {} cached source handles", count);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for HandleCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPEN_FILES, true)
    }
}

/// What tells two opens of a path apart.
#[derive(Debug, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    device: u64,
    #[cfg(unix)]
    inode: u64,
    #[cfg(not(unix))]
    len: u64,
    #[cfg(not(unix))]
    modified: Option<std::time::SystemTime>,
    #[cfg(not(unix))]
    created: Option<std::time::SystemTime>,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self { device: metadata.dev(), inode: metadata.ino() }
    }

    // Stable Rust has no file index on Windows; size and times stand in.
    #[cfg(not(unix))]
    fn of(metadata: &Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            created: metadata.created().ok(),
        }
    }
}

fn open_source(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ProviderError::NotFound { path: path.to_path_buf() }
        } else {
            ProviderError::SourceRead { path: path.to_path_buf(), source: e }
        }
    })
}

/// One read's reference to an open source file.
#[derive(Debug, Clone)]
pub struct CachedHandle {
    file: Arc<File>,
}

impl CachedHandle {
    /// Current length of the file.
    pub fn len(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }

    pub fn is_dir(&self) -> io::Result<bool> {
        self.file.metadata().map(|m| m.is_dir())
    }

    /// Fills `buf` from `offset` without moving any shared file cursor.
    #[cfg(unix)]
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    /// Fills `buf` from `offset` without moving any shared file cursor.
    #[cfg(windows)]
    pub fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "failed to fill whole buffer"));
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_open_reuses_handle() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"data").unwrap();

        let cache = HandleCache::default();
        let first = cache.open(&path).unwrap();
        let second = cache.open(&path).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&first.file, &second.file));
    }

    #[test]
    fn test_positional_reads() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("digits");
        fs::write(&path, b"0123456789").unwrap();

        let handle = HandleCache::default().open(&path).unwrap();
        let mut buf = [0u8; 3];
        handle.read_exact_at(&mut buf, 7).unwrap();
        assert_eq!(&buf, b"789");
        handle.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"012");
        assert_eq!(handle.len().unwrap(), 10);

        let err = handle.read_exact_at(&mut buf, 9).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp = tempdir().unwrap();
        let err = HandleCache::default().open(&temp.path().join("missing")).unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[test]
    fn test_eviction_keeps_busy_handles() {
        let temp = tempdir().unwrap();
        let cache = HandleCache::new(2, true);
        let paths: Vec<_> = (0..3)
            .map(|i| {
                let path = temp.path().join(format!("f{}", i));
                fs::write(&path, b"x").unwrap();
                path
            })
            .collect();

        let busy = cache.open(&paths[0]).unwrap();
        drop(cache.open(&paths[1]).unwrap());
        // Full: the idle handle for f1 is evicted to make room.
        let _third = cache.open(&paths[2]).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.handles.contains_key(&paths[0]));
        assert!(!cache.handles.contains_key(&paths[1]));
        drop(busy);

        cache.close_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replaced_file_is_reopened() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"data").unwrap();

        let cache = HandleCache::default();
        let old = cache.open(&path).unwrap();
        let mut buf = [0u8; 4];
        old.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"data");

        // Editor-style save: write a sibling, then rename it over the original.
        let staged = temp.path().join("a.tmp");
        fs::write(&staged, b"NEWDATA!").unwrap();
        fs::rename(&staged, &path).unwrap();

        let new = cache.open(&path).unwrap();
        assert!(!Arc::ptr_eq(&old.file, &new.file));
        assert_eq!(new.len().unwrap(), 8);
        new.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"NEWD");
        assert_eq!(cache.len(), 1);

        // The superseded handle still serves the read that held it.
        old.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn test_deleted_file_drops_cached_handle() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("gone.txt");
        fs::write(&path, b"x").unwrap();

        let cache = HandleCache::default();
        drop(cache.open(&path).unwrap());
        fs::remove_file(&path).unwrap();

        let err = cache.open(&path).unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_holds_nothing() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a");
        fs::write(&path, b"x").unwrap();

        let cache = HandleCache::disabled();
        let _handle = cache.open(&path).unwrap();
        assert!(cache.is_empty());
    }
}
