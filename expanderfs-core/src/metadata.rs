//! Translation from source-tree attributes to placeholder descriptors.

use std::fs;
use std::path::Path;
use crate::error::{ProviderError, Result};
use crate::types::{FileAttributes, FileTime, NativeAttributes, PlaceholderInfo};

/// Converts a native attribute record into a placeholder descriptor.
///
/// Directories always report a size of zero whatever the native record says.
pub fn translate(native: &NativeAttributes) -> PlaceholderInfo {
    let mut attributes = native.attributes;
    if native.is_directory {
        attributes.insert(FileAttributes::DIRECTORY);
        attributes.remove(FileAttributes::NORMAL);
    }

    PlaceholderInfo {
        is_directory: native.is_directory,
        size: if native.is_directory { 0 } else { native.size },
        creation_time: native.creation_time,
        last_access_time: native.last_access_time,
        last_write_time: native.last_write_time,
        change_time: native.change_time,
        attributes,
    }
}

/// Queries the attributes of `path`, following symlinks.
pub fn query(path: &Path) -> Result<NativeAttributes> {
    let metadata = fs::metadata(path)
        .map_err(|e| ProviderError::from_attribute_query(path.to_path_buf(), e))?;
    Ok(from_metadata(&metadata))
}

/// Queries and translates in one step.
pub fn placeholder_for(path: &Path) -> Result<PlaceholderInfo> {
    query(path).map(|native| translate(&native))
}

#[cfg(windows)]
pub fn from_metadata(metadata: &fs::Metadata) -> NativeAttributes {
    use std::os::windows::fs::MetadataExt;

    let last_write_time = FileTime(metadata.last_write_time() as i64);
    NativeAttributes {
        size: metadata.file_size(),
        is_directory: metadata.is_dir(),
        creation_time: FileTime(metadata.creation_time() as i64),
        last_access_time: FileTime(metadata.last_access_time() as i64),
        last_write_time,
        change_time: last_write_time,
        attributes: FileAttributes::from_bits(metadata.file_attributes()),
    }
}

#[cfg(unix)]
pub fn from_metadata(metadata: &fs::Metadata) -> NativeAttributes {
    use std::os::unix::fs::MetadataExt;
    use std::time::{Duration, UNIX_EPOCH};

    let unix_time = |secs: i64, nanos: i64| {
        let nanos = Duration::from_nanos(nanos.clamp(0, 999_999_999) as u64);
        let time = if secs >= 0 {
            UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
        };
        FileTime::from(time)
    };

    let last_write_time = unix_time(metadata.mtime(), metadata.mtime_nsec());
    let creation_time = metadata.created().map(FileTime::from).unwrap_or(last_write_time);

    let mut attributes = FileAttributes::default();
    if metadata.is_dir() {
        attributes.insert(FileAttributes::DIRECTORY);
    }
    if metadata.mode() & 0o222 == 0 {
        attributes.insert(FileAttributes::READONLY);
    }
    if attributes.bits() == 0 {
        attributes = FileAttributes::NORMAL;
    }

    NativeAttributes {
        size: metadata.len(),
        is_directory: metadata.is_dir(),
        creation_time,
        last_access_time: unix_time(metadata.atime(), metadata.atime_nsec()),
        last_write_time,
        change_time: unix_time(metadata.ctime(), metadata.ctime_nsec()),
        attributes,
    }
}

#[cfg(not(any(unix, windows)))]
pub fn from_metadata(metadata: &fs::Metadata) -> NativeAttributes {
    let last_write_time = metadata.modified().map(FileTime::from).unwrap_or_default();
    let attributes = if metadata.is_dir() {
        FileAttributes::DIRECTORY
    } else {
        FileAttributes::NORMAL
    };
    NativeAttributes {
        size: metadata.len(),
        is_directory: metadata.is_dir(),
        creation_time: metadata.created().map(FileTime::from).unwrap_or(last_write_time),
        last_access_time: metadata.accessed().map(FileTime::from).unwrap_or(last_write_time),
        last_write_time,
        change_time: last_write_time,
        attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn native(size: u64, is_directory: bool, attributes: FileAttributes) -> NativeAttributes {
        NativeAttributes {
            size,
            is_directory,
            creation_time: FileTime(10),
            last_access_time: FileTime(20),
            last_write_time: FileTime(30),
            change_time: FileTime(40),
            attributes,
        }
    }

    #[test]
    fn test_translate_file() {
        let flags = FileAttributes::READONLY | FileAttributes::ARCHIVE;
        let info = translate(&native(4096, false, flags));
        assert!(!info.is_directory);
        assert_eq!(info.size, 4096);
        assert_eq!(info.attributes, flags);
        assert_eq!(info.creation_time, FileTime(10));
        assert_eq!(info.last_access_time, FileTime(20));
        assert_eq!(info.last_write_time, FileTime(30));
        assert_eq!(info.change_time, FileTime(40));
    }

    #[test]
    fn test_translate_directory_reports_zero_size() {
        let info = translate(&native(8192, true, FileAttributes::NORMAL));
        assert!(info.is_directory);
        assert_eq!(info.size, 0);
        assert!(info.attributes.contains(FileAttributes::DIRECTORY));
        assert!(!info.attributes.contains(FileAttributes::NORMAL));
    }

    #[test]
    fn test_query_real_file() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("a.txt");
        fs::write(&file, b"data").unwrap();

        let info = placeholder_for(&file).unwrap();
        assert!(!info.is_directory);
        assert_eq!(info.size, 4);

        let dir_info = placeholder_for(temp.path()).unwrap();
        assert!(dir_info.is_directory);
        assert_eq!(dir_info.size, 0);
    }

    #[test]
    fn test_query_missing_is_not_found() {
        let temp = tempdir().unwrap();
        let err = query(&temp.path().join("missing")).unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }
}
