use std::fmt;
use std::ops::BitOr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of 100ns ticks between 1601-01-01 and the Unix epoch.
const EPOCH_DIFFERENCE_TICKS: i64 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Timestamp in 100ns ticks since 1601-01-01 UTC, the unit the host expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileTime(pub i64);

impl FileTime {
    pub fn ticks(&self) -> i64 {
        self.0
    }
}

impl From<SystemTime> for FileTime {
    fn from(time: SystemTime) -> Self {
        let ticks = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => duration_ticks(after),
            Err(before) => -duration_ticks(before.duration()),
        };
        FileTime(EPOCH_DIFFERENCE_TICKS.saturating_add(ticks))
    }
}

fn duration_ticks(duration: Duration) -> i64 {
    let seconds = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
    seconds
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(i64::from(duration.subsec_nanos() / 100))
}

/// Host file attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileAttributes(u32);

impl FileAttributes {
    pub const READONLY: FileAttributes = FileAttributes(0x0000_0001);
    pub const HIDDEN: FileAttributes = FileAttributes(0x0000_0002);
    pub const SYSTEM: FileAttributes = FileAttributes(0x0000_0004);
    pub const DIRECTORY: FileAttributes = FileAttributes(0x0000_0010);
    pub const ARCHIVE: FileAttributes = FileAttributes(0x0000_0020);
    pub const NORMAL: FileAttributes = FileAttributes(0x0000_0080);
    pub const REPARSE_POINT: FileAttributes = FileAttributes(0x0000_0400);

    pub const fn from_bits(bits: u32) -> Self {
        FileAttributes(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: FileAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FileAttributes) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FileAttributes) {
        self.0 &= !other.0;
    }
}

impl BitOr for FileAttributes {
    type Output = FileAttributes;

    fn bitor(self, rhs: FileAttributes) -> FileAttributes {
        FileAttributes(self.0 | rhs.0)
    }
}

impl fmt::Display for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Attribute record as the source tree reports it, before translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeAttributes {
    pub size: u64,
    pub is_directory: bool,
    pub creation_time: FileTime,
    pub last_access_time: FileTime,
    pub last_write_time: FileTime,
    pub change_time: FileTime,
    pub attributes: FileAttributes,
}

/// Provider-neutral description of one placeholder, consumed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderInfo {
    pub is_directory: bool,
    /// Always zero for directories.
    pub size: u64,
    pub creation_time: FileTime,
    pub last_access_time: FileTime,
    pub last_write_time: FileTime,
    pub change_time: FileTime,
    pub attributes: FileAttributes,
}
