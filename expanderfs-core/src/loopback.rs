//! In-process stand-in for the host virtualization runtime.
//!
//! [`LoopbackHost`] implements [`VirtualizationHost`] without any OS support. It
//! records everything the provider hands back so tests and the CLI's dry run can
//! inspect it: placeholder descriptors, reassembled file data, the chunk layout
//! of every transfer, completed deferred commands, and the number of transfer
//! buffers still outstanding.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};
use tracing::trace;
use uuid::Uuid;
use crate::error::{HostError, Status};
use crate::traits::{CallbackData, DirEntrySink, ProviderCallbacks, SinkError, StartOptions, VirtualizationHost};
use crate::types::{CommandId, DataStreamId, PlaceholderInfo};

/// Raw code the loopback host reports for rejected requests.
pub const LOOPBACK_FAILURE: i32 = 0x8000_4005_u32 as i32;

const DEFAULT_ALIGNMENT: u32 = 4096;

/// Directory-entry sink with a fixed capacity, like the host's transfer buffer.
#[derive(Debug, Clone)]
pub struct BoundedSink {
    capacity: usize,
    entries: Vec<(String, PlaceholderInfo)>,
}

impl BoundedSink {
    /// A sink that accepts at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity, entries: Vec::new() }
    }

    /// A sink that never fills up.
    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn entries(&self) -> &[(String, PlaceholderInfo)] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DirEntrySink for BoundedSink {
    fn add(&mut self, name: &str, info: &PlaceholderInfo) -> Result<(), SinkError> {
        if self.entries.len() >= self.capacity {
            return Err(SinkError::Full);
        }
        self.entries.push((name.to_string(), *info));
        Ok(())
    }
}

/// Transfer buffer handed out by [`LoopbackHost`]. Dropping it releases it.
#[derive(Debug)]
pub struct LoopbackBuffer {
    data: Vec<u8>,
    outstanding: Arc<AtomicUsize>,
}

impl Deref for LoopbackBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for LoopbackBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for LoopbackBuffer {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One chunk received through `write_file_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub offset: u64,
    pub length: usize,
}

#[derive(Debug, Default)]
struct Recorded {
    // Per stream, chunk bytes keyed by offset.
    file_data: HashMap<DataStreamId, BTreeMap<u64, Vec<u8>>>,
    chunk_log: HashMap<DataStreamId, Vec<ChunkRecord>>,
    placeholders: Vec<(PathBuf, PlaceholderInfo)>,
    completions: Vec<(CommandId, Status)>,
}

/// Host runtime that lives entirely in memory.
pub struct LoopbackHost {
    alignment: u32,
    outstanding: Arc<AtomicUsize>,
    allocations: AtomicUsize,
    fail_allocations: AtomicBool,
    reject_transfers_from: Mutex<Option<u64>>,
    cancel_at: Mutex<Option<(u64, CommandId)>>,
    recorded: Mutex<Recorded>,
    completed: Condvar,
    dispatcher: Mutex<Option<Weak<dyn ProviderCallbacks>>>,
    marked_root: Mutex<Option<(PathBuf, Uuid)>>,
    started: AtomicBool,
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self::with_alignment(DEFAULT_ALIGNMENT)
    }

    /// A host reporting `alignment` as its write alignment.
    pub fn with_alignment(alignment: u32) -> Self {
        Self {
            alignment,
            outstanding: Arc::new(AtomicUsize::new(0)),
            allocations: AtomicUsize::new(0),
            fail_allocations: AtomicBool::new(false),
            reject_transfers_from: Mutex::new(None),
            cancel_at: Mutex::new(None),
            recorded: Mutex::new(Recorded::default()),
            completed: Condvar::new(),
            dispatcher: Mutex::new(None),
            marked_root: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Makes every later allocation fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// Rejects every chunk written at or past `offset`.
    pub fn reject_transfers_from(&self, offset: Option<u64>) {
        *self.reject_transfers_from.lock() = offset;
    }

    /// Sends `CancelCommand` for `command` once a chunk at or past `offset`
    /// has been received, the way a user aborting a slow read would.
    pub fn cancel_after_transfer_at(&self, offset: u64, command: CommandId) {
        *self.cancel_at.lock() = Some((offset, command));
    }

    /// Transfer buffers allocated and not yet dropped.
    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Total number of successful allocations.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// The bytes received for `stream`, concatenated in offset order.
    pub fn file_data(&self, stream: &DataStreamId) -> Vec<u8> {
        let recorded = self.recorded.lock();
        recorded
            .file_data
            .get(stream)
            .map(|chunks| chunks.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Every chunk received for `stream`, in arrival order.
    pub fn chunks(&self, stream: &DataStreamId) -> Vec<ChunkRecord> {
        self.recorded.lock().chunk_log.get(stream).cloned().unwrap_or_default()
    }

    pub fn placeholders(&self) -> Vec<(PathBuf, PlaceholderInfo)> {
        self.recorded.lock().placeholders.clone()
    }

    pub fn placeholder(&self, relative_path: &Path) -> Option<PlaceholderInfo> {
        self.recorded
            .lock()
            .placeholders
            .iter()
            .rev()
            .find(|(path, _)| path == relative_path)
            .map(|(_, info)| *info)
    }

    pub fn completions(&self) -> Vec<(CommandId, Status)> {
        self.recorded.lock().completions.clone()
    }

    /// Blocks until `command` is completed or `timeout` passes.
    pub fn wait_for_completion(&self, command: CommandId, timeout: Duration) -> Option<Status> {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.recorded.lock();
        loop {
            let found = recorded
                .completions
                .iter()
                .find(|(id, _)| *id == command)
                .map(|(_, status)| *status);
            if found.is_some() {
                return found;
            }
            if self.completed.wait_until(&mut recorded, deadline).timed_out() {
                return None;
            }
        }
    }

    /// The callback set registered by `start_virtualizing`, if it is still alive.
    pub fn dispatcher(&self) -> Option<Arc<dyn ProviderCallbacks>> {
        self.dispatcher.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn marked_root(&self) -> Option<(PathBuf, Uuid)> {
        self.marked_root.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackHost {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualizationHost for LoopbackHost {
    type Buffer = LoopbackBuffer;

    fn mark_virtualization_root(&self, root: &Path, instance_id: Uuid) -> Result<(), HostError> {
        *self.marked_root.lock() = Some((root.to_path_buf(), instance_id));
        Ok(())
    }

    fn start_virtualizing(
        &self,
        _root: &Path,
        dispatcher: Weak<dyn ProviderCallbacks>,
        _options: &StartOptions,
    ) -> Result<(), HostError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HostError::new(LOOPBACK_FAILURE, "already virtualizing"));
        }
        *self.dispatcher.lock() = Some(dispatcher);
        Ok(())
    }

    fn stop_virtualizing(&self) {
        self.started.store(false, Ordering::SeqCst);
        *self.dispatcher.lock() = None;
    }

    fn write_alignment(&self) -> Result<u32, HostError> {
        Ok(self.alignment)
    }

    fn allocate_buffer(&self, size: usize) -> Option<LoopbackBuffer> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return None;
        }
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(LoopbackBuffer {
            data: vec![0; size],
            outstanding: self.outstanding.clone(),
        })
    }

    fn write_file_data(
        &self,
        stream: &DataStreamId,
        buffer: &LoopbackBuffer,
        offset: u64,
    ) -> Result<(), HostError> {
        if let Some(limit) = *self.reject_transfers_from.lock() {
            if offset >= limit {
                return Err(HostError::new(LOOPBACK_FAILURE, format!("transfer at {} rejected", offset)));
            }
        }
        trace!("Loopback received {} bytes at offset {}", buffer.len(), offset);
        {
            let mut recorded = self.recorded.lock();
            recorded.file_data.entry(*stream).or_default().insert(offset, buffer.to_vec());
            recorded
                .chunk_log
                .entry(*stream)
                .or_default()
                .push(ChunkRecord { offset, length: buffer.len() });
        }

        let cancel = {
            let mut cancel_at = self.cancel_at.lock();
            match *cancel_at {
                Some((at, _)) if offset >= at => cancel_at.take().map(|(_, command)| command),
                _ => None,
            }
        };
        if let Some(command) = cancel {
            if let Some(dispatcher) = self.dispatcher() {
                dispatcher.cancel_command(&CallbackData::new(command, PathBuf::new()));
            }
        }
        Ok(())
    }

    fn write_placeholder_info(&self, relative_path: &Path, info: &PlaceholderInfo) -> Result<(), HostError> {
        self.recorded.lock().placeholders.push((relative_path.to_path_buf(), *info));
        Ok(())
    }

    fn complete_command(&self, command: CommandId, status: Status) -> Result<(), HostError> {
        self.recorded.lock().completions.push((command, status));
        self.completed.notify_all();
        Ok(())
    }
}
