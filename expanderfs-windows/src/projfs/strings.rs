use std::ffi::{OsStr, OsString};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use windows::core::{GUID, PCWSTR};

/// Null-terminated UTF-16 copy of `value`.
pub fn wide(value: impl AsRef<OsStr>) -> Vec<u16> {
    value.as_ref().encode_wide().chain(std::iter::once(0)).collect()
}

/// Path from a ProjFS-owned string. A null pointer is the virtualization root.
///
/// # Safety
/// `value` must be null or point at a null-terminated UTF-16 string that stays
/// valid for the duration of the call.
pub unsafe fn path_from_pcwstr(value: PCWSTR) -> PathBuf {
    if value.is_null() {
        return PathBuf::new();
    }
    PathBuf::from(OsString::from_wide(value.as_wide()))
}

/// Lossy UTF-8 copy of a ProjFS-owned string, `None` for a null pointer.
///
/// # Safety
/// Same contract as [`path_from_pcwstr`].
pub unsafe fn string_from_pcwstr(value: PCWSTR) -> Option<String> {
    if value.is_null() {
        return None;
    }
    Some(String::from_utf16_lossy(value.as_wide()))
}

/// GUID bytes in their in-memory order.
pub fn guid_to_bytes(guid: &GUID) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[0..4].copy_from_slice(&guid.data1.to_le_bytes());
    bytes[4..6].copy_from_slice(&guid.data2.to_le_bytes());
    bytes[6..8].copy_from_slice(&guid.data3.to_le_bytes());
    bytes[8..16].copy_from_slice(&guid.data4);
    bytes
}

pub fn guid_from_bytes(bytes: &[u8; 16]) -> GUID {
    let mut data4 = [0u8; 8];
    data4.copy_from_slice(&bytes[8..16]);
    GUID {
        data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        data2: u16::from_le_bytes([bytes[4], bytes[5]]),
        data3: u16::from_le_bytes([bytes[6], bytes[7]]),
        data4,
    }
}
