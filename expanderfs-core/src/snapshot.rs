//! Point-in-time listings of source directories.
//!
//! A snapshot is taken once when an enumeration session starts and is never
//! mutated afterwards, so a session keeps showing the directory as it was when
//! the session began even if the source tree changes underneath it.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};
use crate::error::{ProviderError, Result};
use crate::metadata;
use crate::types::{FileAttributes, PlaceholderInfo};

/// One child of a snapshotted directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub name: String,
    pub info: PlaceholderInfo,
}

/// The ordered children of one source directory.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    entries: Vec<SnapshotEntry>,
}

impl DirectorySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SnapshotEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

/// Lists the immediate children of `source_dir`, sorted with `compare`.
///
/// `compare` must be the host's collation so the host can merge these entries
/// with its own cached ones. Fails with `NotFound` if `source_dir` is missing
/// or is not a directory.
pub fn build<F>(source_dir: &Path, compare: F) -> Result<DirectorySnapshot>
where
    F: Fn(&str, &str) -> Ordering,
{
    let dir_info = metadata::placeholder_for(source_dir)?;
    if !dir_info.is_directory {
        return Err(ProviderError::NotFound { path: source_dir.to_path_buf() });
    }

    let read_dir = fs::read_dir(source_dir)
        .map_err(|e| ProviderError::from_attribute_query(source_dir.to_path_buf(), e))?;

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry
            .map_err(|e| ProviderError::from_attribute_query(source_dir.to_path_buf(), e))?;

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            warn!("Skipping non-unicode name in {}: {:?}", source_dir.display(), file_name);
            continue;
        };

        let path = entry.path();
        let info = match metadata::placeholder_for(&path) {
            Ok(info) => info,
            Err(ProviderError::NotFound { .. }) => match dangling_link_info(&path) {
                Ok(info) => info,
                Err(e) => {
                    // Removed between the listing and the stat.
                    debug!("Entry vanished during snapshot of {}: {}", source_dir.display(), e);
                    continue;
                }
            },
            Err(e) => return Err(e),
        };

        entries.push(SnapshotEntry { name: name.to_string(), info });
    }

    entries.sort_by(|a, b| compare(&a.name, &b.name));
    debug!("Snapshot of {} holds {} entries", source_dir.display(), entries.len());
    Ok(DirectorySnapshot { entries })
}

// A symlink whose target is gone still shows up, as an empty reparse point.
fn dangling_link_info(path: &Path) -> io::Result<PlaceholderInfo> {
    let link = fs::symlink_metadata(path)?;
    let mut native = metadata::from_metadata(&link);
    native.size = 0;
    native.attributes.remove(FileAttributes::NORMAL);
    native.attributes.insert(FileAttributes::REPARSE_POINT);
    Ok(metadata::translate(&native))
}
