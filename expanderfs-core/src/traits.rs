//! Core traits at the boundary between the provider and the host runtime.
//!
//! The host runtime intercepts filesystem operations on the virtualization root
//! and forwards them as callbacks. [`ProviderCallbacks`] is the set of callbacks
//! the provider answers; [`VirtualizationHost`] is everything the provider may
//! ask of the host in return; [`DirEntrySink`] is the bounded receiver handed to
//! a single get-entries call.

use std::cmp::Ordering;
use std::ops::DerefMut;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use uuid::Uuid;
use crate::error::{HostError, Status};
use crate::names;
use crate::types::{CommandId, DataStreamId, EnumerationId, PlaceholderInfo};

/// Why a sink refused an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// No room for another entry; the host asks again with a fresh buffer.
    Full,
    /// The host rejected the entry itself, with this raw code.
    Failed(i32),
}

/// Bounded receiver for directory entries during one get-entries call.
pub trait DirEntrySink {
    /// Adds one entry, or reports why it could not.
    fn add(&mut self, name: &str, info: &PlaceholderInfo) -> Result<(), SinkError>;
}

/// Flags the host attaches to a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallbackFlags {
    /// Restart the enumeration from the first entry.
    pub restart_scan: bool,
    /// Return at most one entry from this get-entries call.
    pub return_single_entry: bool,
}

/// Per-invocation information the host passes with every callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackData {
    pub command_id: CommandId,
    /// Path relative to the virtualization root. Empty for the root itself.
    pub relative_path: PathBuf,
    pub data_stream_id: DataStreamId,
    pub flags: CallbackFlags,
    pub triggering_process_id: u32,
}

impl CallbackData {
    pub fn new(command_id: CommandId, relative_path: impl Into<PathBuf>) -> Self {
        Self {
            command_id,
            relative_path: relative_path.into(),
            data_stream_id: DataStreamId::default(),
            flags: CallbackFlags::default(),
            triggering_process_id: 0,
        }
    }

    pub fn with_flags(mut self, flags: CallbackFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_stream(mut self, stream: DataStreamId) -> Self {
        self.data_stream_id = stream;
        self
    }
}

/// File-system notifications the host can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    FileOpened,
    NewFileCreated,
    FileOverwritten,
    PreDelete,
    PreRename,
    PreSetHardlink,
    FileRenamed,
    HardlinkCreated,
    FileHandleClosedNoModification,
    FileHandleClosedFileModified,
    FileHandleClosedFileDeleted,
    FilePreConvertToFull,
    /// A notification this provider has no name for, with the host's raw code.
    Other(u32),
}

/// Options passed to the host when virtualization starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub instance_id: Uuid,
    pub pool_thread_count: u32,
    pub concurrent_thread_count: u32,
}

/// The callbacks the host invokes, one method per host callback.
///
/// Every method may run on any host worker thread, concurrently with any other.
/// Failures are reported through the returned [`Status`]; nothing unwinds
/// across this boundary.
pub trait ProviderCallbacks: Send + Sync {
    /// Starts an enumeration session for the directory at `data.relative_path`.
    ///
    /// # Returns
    /// `Ok`, `NotFound` if the directory does not exist in the source tree, or
    /// `Pending` if the snapshot is built in the background.
    fn start_directory_enumeration(&self, data: &CallbackData, id: EnumerationId) -> Status;

    /// Ends an enumeration session and discards its state.
    fn end_directory_enumeration(&self, data: &CallbackData, id: EnumerationId) -> Status;

    /// Fills `sink` with the next entries of an enumeration session.
    ///
    /// # Arguments
    /// * `search_expression` - Wildcard filter, captured on first use or on restart
    /// * `sink` - The host's bounded transfer buffer for this call
    ///
    /// # Returns
    /// `Ok` if at least one entry was added or nothing is left to add,
    /// `InsufficientBuffer` if the sink could not take even one entry.
    fn get_directory_enumeration(
        &self,
        data: &CallbackData,
        id: EnumerationId,
        search_expression: Option<&str>,
        sink: &mut dyn DirEntrySink,
    ) -> Status;

    /// Writes the placeholder descriptor for `data.relative_path` back to the host.
    fn get_placeholder_info(&self, data: &CallbackData) -> Status;

    /// Streams `[byte_offset, byte_offset + length)` of the file back to the host.
    fn get_file_data(&self, data: &CallbackData, byte_offset: u64, length: u32) -> Status;

    /// Existence probe for a path.
    fn query_file_name(&self, data: &CallbackData) -> Status;

    /// Delivers a file-system notification.
    fn notify(
        &self,
        data: &CallbackData,
        is_directory: bool,
        kind: NotificationKind,
        destination: Option<&Path>,
    ) -> Status;

    /// Cancels the in-flight operation identified by `data.command_id`.
    fn cancel_command(&self, data: &CallbackData);
}

/// Everything the provider needs from the host runtime.
pub trait VirtualizationHost: Send + Sync + 'static {
    /// Transfer buffer from the host's aligned allocator. Dropping it releases it.
    type Buffer: DerefMut<Target = [u8]> + Send;

    /// Marks `root` as the virtualization root for instance `instance_id`.
    fn mark_virtualization_root(&self, root: &Path, instance_id: Uuid) -> Result<(), HostError>;

    /// Registers the callback set and starts dispatching.
    ///
    /// The host holds the dispatcher weakly; callbacks arriving after the
    /// provider is gone fail without touching freed state.
    fn start_virtualizing(
        &self,
        root: &Path,
        dispatcher: Weak<dyn ProviderCallbacks>,
        options: &StartOptions,
    ) -> Result<(), HostError>;

    /// Stops dispatching. No callback starts after this returns.
    fn stop_virtualizing(&self);

    /// Required write alignment in bytes. Always a power of two.
    fn write_alignment(&self) -> Result<u32, HostError>;

    /// Allocates a transfer buffer of exactly `size` bytes.
    fn allocate_buffer(&self, size: usize) -> Option<Self::Buffer>;

    /// Hands the whole of `buffer` to the host as file content at `offset`.
    fn write_file_data(
        &self,
        stream: &DataStreamId,
        buffer: &Self::Buffer,
        offset: u64,
    ) -> Result<(), HostError>;

    /// Hands a placeholder descriptor for one path to the host.
    fn write_placeholder_info(
        &self,
        relative_path: &Path,
        info: &PlaceholderInfo,
    ) -> Result<(), HostError>;

    /// Completes a callback that previously returned `Pending`.
    fn complete_command(&self, command: CommandId, status: Status) -> Result<(), HostError>;

    /// The host's name collation.
    fn compare_names(&self, a: &str, b: &str) -> Ordering {
        names::compare(a, b)
    }

    /// The host's wildcard matcher.
    fn name_matches(&self, name: &str, pattern: &str) -> bool {
        names::matches(name, pattern)
    }
}
