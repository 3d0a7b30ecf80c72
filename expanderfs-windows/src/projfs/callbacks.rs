//! Raw ProjFS callbacks.
//!
//! Each callback recovers the provider from the instance context, translates
//! the callback data into the core's types and hands back the provider's
//! status as an HRESULT. A provider that has already gone away answers
//! `ERROR_INVALID_STATE` without touching any other state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};
use windows::core::{GUID, HRESULT, PCWSTR};
use windows::Win32::Foundation::{
    BOOLEAN, E_FAIL, E_INVALIDARG, ERROR_INSUFFICIENT_BUFFER, ERROR_INVALID_STATE,
};
use windows::Win32::Storage::ProjectedFileSystem::{
    PrjFillDirEntryBuffer, PRJ_CALLBACKS, PRJ_CALLBACK_DATA, PRJ_CB_DATA_FLAG_ENUM_RESTART_SCAN,
    PRJ_CB_DATA_FLAG_ENUM_RETURN_SINGLE_ENTRY, PRJ_DIR_ENTRY_BUFFER_HANDLE, PRJ_NOTIFICATION,
    PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_FILE_DELETED,
    PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_FILE_MODIFIED,
    PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_NO_MODIFICATION, PRJ_NOTIFICATION_FILE_OPENED,
    PRJ_NOTIFICATION_FILE_OVERWRITTEN, PRJ_NOTIFICATION_FILE_PRE_CONVERT_TO_FULL,
    PRJ_NOTIFICATION_FILE_RENAMED, PRJ_NOTIFICATION_HARDLINK_CREATED,
    PRJ_NOTIFICATION_NEW_FILE_CREATED, PRJ_NOTIFICATION_PARAMETERS, PRJ_NOTIFICATION_PRE_DELETE,
    PRJ_NOTIFICATION_PRE_RENAME, PRJ_NOTIFICATION_PRE_SET_HARDLINK,
};
use expanderfs_core::{
    CallbackData, CallbackFlags, CommandId, DataStreamId, DirEntrySink, EnumerationId,
    NotificationKind, PlaceholderInfo, ProviderCallbacks, SinkError, Status,
};
use crate::error::status_to_hresult;
use super::host::{file_basic_info, InstanceContext};
use super::strings::{guid_to_bytes, path_from_pcwstr, string_from_pcwstr, wide};

/// The callback set registered with `PrjStartVirtualizing`.
pub fn callback_table() -> PRJ_CALLBACKS {
    PRJ_CALLBACKS {
        StartDirectoryEnumerationCallback: Some(start_directory_enumeration_callback),
        EndDirectoryEnumerationCallback: Some(end_directory_enumeration_callback),
        GetDirectoryEnumerationCallback: Some(get_directory_enumeration_callback),
        GetPlaceholderInfoCallback: Some(get_placeholder_info_callback),
        GetFileDataCallback: Some(get_file_data_callback),
        QueryFileNameCallback: Some(query_file_name_callback),
        NotificationCallback: Some(notification_callback),
        CancelCommandCallback: Some(cancel_command_callback),
    }
}

/// Recovers the live provider from the instance context.
///
/// # Safety
/// `data.InstanceContext` must be null or the [`InstanceContext`] registered
/// with `PrjStartVirtualizing`, which outlives every callback.
unsafe fn dispatcher(data: &PRJ_CALLBACK_DATA) -> Option<Arc<dyn ProviderCallbacks>> {
    let context = data.InstanceContext as *const InstanceContext;
    if context.is_null() {
        return None;
    }
    (*context).dispatcher.upgrade()
}

/// # Safety
/// `data` must be the callback data ProjFS passed to the current callback.
unsafe fn callback_data(data: &PRJ_CALLBACK_DATA) -> CallbackData {
    let flags = data.Flags.0;
    CallbackData {
        command_id: CommandId(data.CommandId),
        relative_path: path_from_pcwstr(data.FilePathName),
        data_stream_id: DataStreamId::from_bytes(guid_to_bytes(&data.DataStreamId)),
        flags: CallbackFlags {
            restart_scan: flags & PRJ_CB_DATA_FLAG_ENUM_RESTART_SCAN.0 != 0,
            return_single_entry: flags & PRJ_CB_DATA_FLAG_ENUM_RETURN_SINGLE_ENTRY.0 != 0,
        },
        triggering_process_id: data.TriggeringProcessId,
    }
}

/// Runs `handler` against the provider behind `data`, keeping panics on this side
/// of the boundary.
unsafe fn dispatch<F>(name: &str, data: *const PRJ_CALLBACK_DATA, handler: F) -> HRESULT
where
    F: FnOnce(&dyn ProviderCallbacks, CallbackData) -> Status,
{
    if data.is_null() {
        return E_INVALIDARG;
    }
    let data = &*data;
    let Some(provider) = dispatcher(data) else {
        warn!("{} arrived after the provider was dropped", name);
        return HRESULT::from(ERROR_INVALID_STATE);
    };
    let request = callback_data(data);

    match catch_unwind(AssertUnwindSafe(|| handler(provider.as_ref(), request))) {
        Ok(status) => status_to_hresult(status),
        Err(_) => {
            error!("{}[{}] panicked", name, data.CommandId);
            E_FAIL
        }
    }
}

unsafe fn enumeration_id(id: *const GUID) -> Option<EnumerationId> {
    if id.is_null() {
        return None;
    }
    Some(EnumerationId::from_bytes(guid_to_bytes(&*id)))
}

/// [`DirEntrySink`] over the buffer handle of one get-entries callback.
struct DirEntryBuffer {
    handle: PRJ_DIR_ENTRY_BUFFER_HANDLE,
}

impl DirEntrySink for DirEntryBuffer {
    fn add(&mut self, name: &str, info: &PlaceholderInfo) -> Result<(), SinkError> {
        let name_wide = wide(name);
        let basic = file_basic_info(info);
        let result = unsafe {
            PrjFillDirEntryBuffer(PCWSTR::from_raw(name_wide.as_ptr()), Some(&basic), self.handle)
        };
        result.map_err(|e| fill_error(name, e.code()))
    }
}

fn fill_error(name: &str, code: HRESULT) -> SinkError {
    if code == HRESULT::from(ERROR_INSUFFICIENT_BUFFER) {
        return SinkError::Full;
    }
    warn!("PrjFillDirEntryBuffer failed for {}: {:?}", name, code);
    SinkError::Failed(code.0)
}

const NOTIFICATIONS: [(PRJ_NOTIFICATION, NotificationKind); 12] = [
    (PRJ_NOTIFICATION_FILE_OPENED, NotificationKind::FileOpened),
    (PRJ_NOTIFICATION_NEW_FILE_CREATED, NotificationKind::NewFileCreated),
    (PRJ_NOTIFICATION_FILE_OVERWRITTEN, NotificationKind::FileOverwritten),
    (PRJ_NOTIFICATION_PRE_DELETE, NotificationKind::PreDelete),
    (PRJ_NOTIFICATION_PRE_RENAME, NotificationKind::PreRename),
    (PRJ_NOTIFICATION_PRE_SET_HARDLINK, NotificationKind::PreSetHardlink),
    (PRJ_NOTIFICATION_FILE_RENAMED, NotificationKind::FileRenamed),
    (PRJ_NOTIFICATION_HARDLINK_CREATED, NotificationKind::HardlinkCreated),
    (PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_NO_MODIFICATION, NotificationKind::FileHandleClosedNoModification),
    (PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_FILE_MODIFIED, NotificationKind::FileHandleClosedFileModified),
    (PRJ_NOTIFICATION_FILE_HANDLE_CLOSED_FILE_DELETED, NotificationKind::FileHandleClosedFileDeleted),
    (PRJ_NOTIFICATION_FILE_PRE_CONVERT_TO_FULL, NotificationKind::FilePreConvertToFull),
];

fn notification_kind(notification: PRJ_NOTIFICATION) -> NotificationKind {
    NOTIFICATIONS
        .iter()
        .find(|(raw, _)| *raw == notification)
        .map(|(_, kind)| *kind)
        .unwrap_or(NotificationKind::Other(notification.0 as u32))
}

pub extern "system" fn start_directory_enumeration_callback(
    callback_data: *const PRJ_CALLBACK_DATA,
    enumeration_id: *const GUID,
) -> HRESULT {
    unsafe {
        let Some(id) = self::enumeration_id(enumeration_id) else {
            return E_INVALIDARG;
        };
        dispatch("StartDirectoryEnumeration", callback_data, |provider, data| {
            provider.start_directory_enumeration(&data, id)
        })
    }
}

pub extern "system" fn end_directory_enumeration_callback(
    callback_data: *const PRJ_CALLBACK_DATA,
    enumeration_id: *const GUID,
) -> HRESULT {
    unsafe {
        let Some(id) = self::enumeration_id(enumeration_id) else {
            return E_INVALIDARG;
        };
        dispatch("EndDirectoryEnumeration", callback_data, |provider, data| {
            provider.end_directory_enumeration(&data, id)
        })
    }
}

pub extern "system" fn get_directory_enumeration_callback(
    callback_data: *const PRJ_CALLBACK_DATA,
    enumeration_id: *const GUID,
    search_expression: PCWSTR,
    dir_entry_buffer_handle: PRJ_DIR_ENTRY_BUFFER_HANDLE,
) -> HRESULT {
    unsafe {
        let Some(id) = self::enumeration_id(enumeration_id) else {
            return E_INVALIDARG;
        };
        let search_expression = string_from_pcwstr(search_expression);
        dispatch("GetDirectoryEnumeration", callback_data, |provider, data| {
            let mut sink = DirEntryBuffer { handle: dir_entry_buffer_handle };
            provider.get_directory_enumeration(&data, id, search_expression.as_deref(), &mut sink)
        })
    }
}

pub extern "system" fn get_placeholder_info_callback(
    callback_data: *const PRJ_CALLBACK_DATA,
) -> HRESULT {
    unsafe {
        dispatch("GetPlaceholderInfo", callback_data, |provider, data| {
            provider.get_placeholder_info(&data)
        })
    }
}

pub extern "system" fn get_file_data_callback(
    callback_data: *const PRJ_CALLBACK_DATA,
    byte_offset: u64,
    length: u32,
) -> HRESULT {
    unsafe {
        dispatch("GetFileData", callback_data, |provider, data| {
            provider.get_file_data(&data, byte_offset, length)
        })
    }
}

pub extern "system" fn query_file_name_callback(
    callback_data: *const PRJ_CALLBACK_DATA,
) -> HRESULT {
    unsafe {
        dispatch("QueryFileName", callback_data, |provider, data| {
            provider.query_file_name(&data)
        })
    }
}

pub extern "system" fn notification_callback(
    callback_data: *const PRJ_CALLBACK_DATA,
    is_directory: BOOLEAN,
    notification: PRJ_NOTIFICATION,
    destination_file_name: PCWSTR,
    _operation_parameters: *mut PRJ_NOTIFICATION_PARAMETERS,
) -> HRESULT {
    unsafe {
        let destination = if destination_file_name.is_null() {
            None
        } else {
            Some(path_from_pcwstr(destination_file_name))
        };
        let kind = notification_kind(notification);
        dispatch("Notification", callback_data, |provider, data| {
            provider.notify(&data, is_directory.as_bool(), kind, destination.as_deref())
        })
    }
}

pub extern "system" fn cancel_command_callback(callback_data: *const PRJ_CALLBACK_DATA) {
    unsafe {
        dispatch("CancelCommand", callback_data, |provider, data| {
            provider.cancel_command(&data);
            Status::Ok
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_kinds() {
        assert_eq!(notification_kind(PRJ_NOTIFICATION_PRE_DELETE), NotificationKind::PreDelete);
        assert_eq!(
            notification_kind(PRJ_NOTIFICATION_FILE_PRE_CONVERT_TO_FULL),
            NotificationKind::FilePreConvertToFull
        );
        assert_eq!(notification_kind(PRJ_NOTIFICATION(0x10000)), NotificationKind::Other(0x10000));
    }

    #[test]
    fn test_fill_failures_are_not_reported_as_full() {
        assert_eq!(fill_error("a", HRESULT::from(ERROR_INSUFFICIENT_BUFFER)), SinkError::Full);
        let failed = fill_error("a", E_FAIL);
        assert_eq!(failed, SinkError::Failed(E_FAIL.0));
        // The host sees the original HRESULT, not a retry request.
        let SinkError::Failed(code) = failed else { unreachable!() };
        assert_eq!(status_to_hresult(Status::Failed(code)), E_FAIL);
    }

    #[test]
    fn test_null_callback_data_is_rejected() {
        assert_eq!(get_placeholder_info_callback(std::ptr::null()), E_INVALIDARG);
        assert_eq!(get_file_data_callback(std::ptr::null(), 0, 16), E_INVALIDARG);
    }

    #[test]
    fn test_callback_without_provider_is_invalid_state() {
        let data = PRJ_CALLBACK_DATA::default();
        assert_eq!(query_file_name_callback(&data), HRESULT::from(ERROR_INVALID_STATE));
    }
}
