use std::cmp::Ordering;
use std::ffi::c_void;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Weak;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{GUID, HRESULT, PCWSTR};
use windows::Win32::Foundation::{BOOLEAN, ERROR_INVALID_STATE, ERROR_REPARSE_POINT_ENCOUNTERED};
use windows::Win32::Storage::ProjectedFileSystem::{
    PrjAllocateAlignedBuffer, PrjCompleteCommand, PrjFileNameCompare, PrjFileNameMatch,
    PrjFreeAlignedBuffer, PrjGetVirtualizationInstanceInfo, PrjMarkDirectoryAsPlaceholder,
    PrjStartVirtualizing, PrjStopVirtualizing, PrjWriteFileData, PrjWritePlaceholderInfo,
    PRJ_FILE_BASIC_INFO, PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT, PRJ_PLACEHOLDER_INFO,
    PRJ_STARTVIRTUALIZING_OPTIONS, PRJ_VIRTUALIZATION_INSTANCE_INFO,
};
use expanderfs_core::{
    CommandId, DataStreamId, HostError, PlaceholderInfo, ProviderCallbacks, StartOptions, Status,
    VirtualizationHost,
};
use crate::error::{status_to_hresult, WindowsError};
use super::callbacks;
use super::strings::{guid_from_bytes, wide};

/// What every raw callback receives as its instance context.
pub(crate) struct InstanceContext {
    pub(crate) dispatcher: Weak<dyn ProviderCallbacks>,
}

struct Running {
    context: PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT,
    // Freed only after PrjStopVirtualizing has drained every callback.
    instance: Box<InstanceContext>,
}

/// Transfer buffer from `PrjAllocateAlignedBuffer`, freed on drop.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The allocation is owned exclusively by this value.
unsafe impl Send for AlignedBuffer {}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { PrjFreeAlignedBuffer(self.ptr.as_ptr() as *const c_void) };
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len).finish()
    }
}

/// [`VirtualizationHost`] over the Windows Projected File System.
///
/// One host drives one virtualization instance at a time.
pub struct ProjFsHost {
    running: RwLock<Option<Running>>,
    // Serializes start and stop against each other.
    lifecycle: Mutex<()>,
}

impl ProjFsHost {
    pub fn new() -> Self {
        Self {
            running: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn is_virtualizing(&self) -> bool {
        self.running.read().is_some()
    }

    fn context(&self, operation: &'static str) -> Result<PRJ_NAMESPACE_VIRTUALIZATION_CONTEXT, HostError> {
        self.running
            .read()
            .as_ref()
            .map(|running| running.context)
            .ok_or_else(|| WindowsError::from_hresult(operation, HRESULT::from(ERROR_INVALID_STATE)).into())
    }
}

impl Default for ProjFsHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProjFsHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjFsHost")
            .field("virtualizing", &self.is_virtualizing())
            .finish()
    }
}

impl Drop for ProjFsHost {
    fn drop(&mut self) {
        self.stop_virtualizing();
    }
}

pub(crate) fn file_basic_info(info: &PlaceholderInfo) -> PRJ_FILE_BASIC_INFO {
    PRJ_FILE_BASIC_INFO {
        IsDirectory: BOOLEAN::from(info.is_directory),
        FileSize: if info.is_directory { 0 } else { info.size as i64 },
        CreationTime: info.creation_time.ticks(),
        LastAccessTime: info.last_access_time.ticks(),
        LastWriteTime: info.last_write_time.ticks(),
        ChangeTime: info.change_time.ticks(),
        FileAttributes: info.attributes.bits(),
    }
}

impl VirtualizationHost for ProjFsHost {
    type Buffer = AlignedBuffer;

    fn mark_virtualization_root(&self, root: &Path, instance_id: Uuid) -> Result<(), HostError> {
        let root_wide = wide(root);
        let guid = GUID::from_u128(instance_id.as_u128());
        let result = unsafe {
            PrjMarkDirectoryAsPlaceholder(
                PCWSTR::from_raw(root_wide.as_ptr()),
                PCWSTR::null(),
                None,
                &guid,
            )
        };
        match result {
            Ok(()) => {
                info!("Marked {} as a virtualization root", root.display());
                Ok(())
            }
            Err(e) if e.code() == HRESULT::from(ERROR_REPARSE_POINT_ENCOUNTERED) => {
                debug!("{} is already a virtualization root", root.display());
                Ok(())
            }
            Err(e) => Err(WindowsError::new("PrjMarkDirectoryAsPlaceholder", &e).into()),
        }
    }

    fn start_virtualizing(
        &self,
        root: &Path,
        dispatcher: Weak<dyn ProviderCallbacks>,
        options: &StartOptions,
    ) -> Result<(), HostError> {
        let _lifecycle = self.lifecycle.lock();
        if self.running.read().is_some() {
            return Err(WindowsError::from_hresult("PrjStartVirtualizing", HRESULT::from(ERROR_INVALID_STATE)).into());
        }

        let instance = Box::new(InstanceContext { dispatcher });
        let table = callbacks::callback_table();
        let start_options = PRJ_STARTVIRTUALIZING_OPTIONS {
            PoolThreadCount: options.pool_thread_count,
            ConcurrentThreadCount: options.concurrent_thread_count,
            ..Default::default()
        };
        let root_wide = wide(root);

        let context = unsafe {
            PrjStartVirtualizing(
                PCWSTR::from_raw(root_wide.as_ptr()),
                &table,
                Some(instance.as_ref() as *const InstanceContext as *const c_void),
                Some(&start_options),
            )
        }
        .map_err(|e| WindowsError::new("PrjStartVirtualizing", &e))?;

        info!(
            "Virtualizing {} (instance {}, {} pool / {} concurrent threads)",
            root.display(),
            options.instance_id,
            options.pool_thread_count,
            options.concurrent_thread_count
        );
        *self.running.write() = Some(Running { context, instance });
        Ok(())
    }

    fn stop_virtualizing(&self) {
        let _lifecycle = self.lifecycle.lock();
        let running = self.running.write().take();
        if let Some(running) = running {
            unsafe { PrjStopVirtualizing(running.context) };
            drop(running.instance);
            info!("Stopped virtualizing");
        }
    }

    fn write_alignment(&self) -> Result<u32, HostError> {
        let context = self.context("PrjGetVirtualizationInstanceInfo")?;
        let mut instance_info = PRJ_VIRTUALIZATION_INSTANCE_INFO::default();
        unsafe { PrjGetVirtualizationInstanceInfo(context, &mut instance_info) }
            .map_err(|e| WindowsError::new("PrjGetVirtualizationInstanceInfo", &e))?;
        Ok(instance_info.WriteAlignment)
    }

    fn allocate_buffer(&self, size: usize) -> Option<AlignedBuffer> {
        let context = self.context("PrjAllocateAlignedBuffer").ok()?;
        let raw = unsafe { PrjAllocateAlignedBuffer(context, size) };
        NonNull::new(raw as *mut u8).map(|ptr| AlignedBuffer { ptr, len: size })
    }

    fn write_file_data(
        &self,
        stream: &DataStreamId,
        buffer: &AlignedBuffer,
        offset: u64,
    ) -> Result<(), HostError> {
        let context = self.context("PrjWriteFileData")?;
        let stream_guid = guid_from_bytes(stream.as_bytes());
        unsafe {
            PrjWriteFileData(
                context,
                &stream_guid,
                buffer.ptr.as_ptr() as *const c_void,
                offset,
                buffer.len as u32,
            )
        }
        .map_err(|e| WindowsError::new("PrjWriteFileData", &e).into())
    }

    fn write_placeholder_info(
        &self,
        relative_path: &Path,
        info: &PlaceholderInfo,
    ) -> Result<(), HostError> {
        let context = self.context("PrjWritePlaceholderInfo")?;
        let path_wide = wide(relative_path);
        let placeholder = PRJ_PLACEHOLDER_INFO {
            FileBasicInfo: file_basic_info(info),
            ..Default::default()
        };
        unsafe {
            PrjWritePlaceholderInfo(
                context,
                PCWSTR::from_raw(path_wide.as_ptr()),
                &placeholder,
                std::mem::size_of::<PRJ_PLACEHOLDER_INFO>() as u32,
            )
        }
        .map_err(|e| WindowsError::new("PrjWritePlaceholderInfo", &e).into())
    }

    fn complete_command(&self, command: CommandId, status: Status) -> Result<(), HostError> {
        let context = self.context("PrjCompleteCommand")?;
        let result = unsafe { PrjCompleteCommand(context, command.0, status_to_hresult(status), None) };
        if let Err(ref e) = result {
            warn!("PrjCompleteCommand[{}] failed: {:?}", command, e.code());
        }
        result.map_err(|e| WindowsError::new("PrjCompleteCommand", &e).into())
    }

    fn compare_names(&self, a: &str, b: &str) -> Ordering {
        let a = wide(a);
        let b = wide(b);
        let result = unsafe { PrjFileNameCompare(PCWSTR::from_raw(a.as_ptr()), PCWSTR::from_raw(b.as_ptr())) };
        result.cmp(&0)
    }

    fn name_matches(&self, name: &str, pattern: &str) -> bool {
        let name = wide(name);
        let pattern = wide(pattern);
        unsafe { PrjFileNameMatch(PCWSTR::from_raw(name.as_ptr()), PCWSTR::from_raw(pattern.as_ptr())) }
            .as_bool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expanderfs_core::{FileAttributes, FileTime};

    #[test]
    fn test_basic_info_for_directory_has_no_size() {
        let info = PlaceholderInfo {
            is_directory: true,
            size: 4096,
            creation_time: FileTime(1),
            last_access_time: FileTime(2),
            last_write_time: FileTime(3),
            change_time: FileTime(4),
            attributes: FileAttributes::DIRECTORY,
        };
        let basic = file_basic_info(&info);
        assert!(basic.IsDirectory.as_bool());
        assert_eq!(basic.FileSize, 0);
        assert_eq!(basic.ChangeTime, 4);
        assert_eq!(basic.FileAttributes, FileAttributes::DIRECTORY.bits());
    }

    #[test]
    fn test_host_without_instance_refuses_writes() {
        let host = ProjFsHost::new();
        assert!(!host.is_virtualizing());
        assert!(host.write_alignment().is_err());
        assert!(host.allocate_buffer(4096).is_none());
        assert!(host.complete_command(CommandId(1), Status::Ok).is_err());
    }

    #[test]
    fn test_name_rules_come_from_projfs() {
        let host = ProjFsHost::new();
        assert_eq!(host.compare_names("a.txt", "A.TXT"), Ordering::Equal);
        assert_eq!(host.compare_names("a", "b"), Ordering::Less);
        assert!(host.name_matches("report.TXT", "*.txt"));
        assert!(!host.name_matches("report.doc", "*.txt"));
    }
}
