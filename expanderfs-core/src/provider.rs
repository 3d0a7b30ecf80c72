//! The provider: callback handlers plus the registration lifecycle.
//!
//! [`Provider`] is the owning facade. The state the callbacks touch lives in
//! [`ProviderState`], shared behind an [`Arc`] and handed to the host and to the
//! job workers only as a [`Weak`], so neither keeps a stopped provider alive.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::delivery::{DeliveryOutcome, DeliveryRequest, FileDataDelivery};
use crate::enumeration::{EmissionStop, EmitRequest, EnumerationTable};
use crate::error::{ProviderError, Result, Status};
use crate::handles::HandleCache;
use crate::inflight::InflightRegistry;
use crate::jobs::{Job, JobKind, JobQueue, JobRunner, JobSender};
use crate::metadata;
use crate::resolver::PathResolver;
use crate::stats::{ProviderStats, StatsSnapshot};
use crate::traits::{
    CallbackData, DirEntrySink, NotificationKind, ProviderCallbacks, StartOptions, VirtualizationHost,
};
use crate::types::{CommandId, DataStreamId, DeferralConfig, EnumerationId, ProviderConfig, ResolvedRoots};

/// Everything a callback needs, shared between the host and the job workers.
pub struct ProviderState<H: VirtualizationHost> {
    host: Arc<H>,
    resolver: PathResolver,
    sessions: EnumerationTable,
    delivery: FileDataDelivery,
    inflight: Arc<InflightRegistry>,
    stats: ProviderStats,
    deferral: DeferralConfig,
    jobs: RwLock<Option<JobSender>>,
}

impl<H: VirtualizationHost> ProviderState<H> {
    fn new(host: Arc<H>, roots: ResolvedRoots, config: &ProviderConfig) -> Self {
        let handles = Arc::new(HandleCache::new(config.max_open_files, config.cache_open_files));
        Self {
            host,
            resolver: PathResolver::new(roots),
            sessions: EnumerationTable::new(),
            delivery: FileDataDelivery::new(handles, config.chunk_size),
            inflight: Arc::new(InflightRegistry::new()),
            stats: ProviderStats::new(),
            deferral: config.deferral.clone(),
            jobs: RwLock::new(None),
        }
    }

    pub fn sessions(&self) -> &EnumerationTable {
        &self.sessions
    }

    pub fn inflight(&self) -> &InflightRegistry {
        &self.inflight
    }

    pub fn stats(&self) -> &ProviderStats {
        &self.stats
    }

    /// Hands `job` to the queue. Gives it back when deferral is off or the
    /// queue has no room.
    fn defer(&self, job: Job) -> std::result::Result<(), Job> {
        let jobs = self.jobs.read();
        let Some(sender) = jobs.as_ref() else {
            return Err(job);
        };
        let command = job.command_id;
        let kind = job.kind.name();
        sender.enqueue(job)?;
        self.stats.record_deferred_job();
        debug!("Deferred {} for command {}", kind, command);
        Ok(())
    }

    fn start_session(&self, id: EnumerationId, relative_path: &Path) -> Status {
        let resolved = self.resolver.resolve(relative_path);
        let host = &self.host;
        match self.sessions.start(id, resolved, |a, b| host.compare_names(a, b)) {
            Ok(()) => {
                self.stats.record_enumeration_started();
                Status::Ok
            }
            Err(e) => self.fail("StartDirectoryEnumeration", relative_path, e),
        }
    }

    fn read_file(
        &self,
        relative_path: &Path,
        stream: DataStreamId,
        offset: u64,
        length: u32,
        cancel: &CancellationToken,
    ) -> Status {
        let source = self.resolver.resolve_source(relative_path);
        let request = DeliveryRequest { source: &source, stream, offset, length };
        match self.delivery.deliver(&*self.host, &request, cancel) {
            Ok(DeliveryOutcome::Completed { bytes, chunks }) => {
                self.stats.record_file_read(bytes, chunks as u64);
                Status::Ok
            }
            Ok(DeliveryOutcome::Cancelled { bytes }) => {
                debug!("Read of {} cancelled after {} bytes", relative_path.display(), bytes);
                Status::Ok
            }
            Err(e) => self.fail("GetFileData", relative_path, e),
        }
    }

    // Absent paths are routine for the host; everything else is worth a warning.
    fn fail(&self, operation: &str, relative_path: &Path, err: ProviderError) -> Status {
        match err {
            ProviderError::NotFound { .. } | ProviderError::NotSupported { .. } => {
                debug!("{} {}: {}", operation, relative_path.display(), err);
            }
            _ => {
                self.stats.record_failure();
                warn!("{} {} failed: {}", operation, relative_path.display(), err);
            }
        }
        err.status()
    }
}

fn check_path(data: &CallbackData) -> Result<()> {
    PathResolver::check_relative(&data.relative_path)
}

impl<H: VirtualizationHost> ProviderCallbacks for ProviderState<H> {
    fn start_directory_enumeration(&self, data: &CallbackData, id: EnumerationId) -> Status {
        debug!(
            "StartDirectoryEnumeration[{}]: Path={}, EnumId={}",
            data.command_id,
            data.relative_path.display(),
            id
        );
        if let Err(e) = check_path(data) {
            return self.fail("StartDirectoryEnumeration", &data.relative_path, e);
        }

        let registration = self.inflight.begin(data.command_id);
        if self.deferral.defer_enumerations {
            let kind = JobKind::DirectoryEnumerate { id, relative_path: data.relative_path.clone() };
            match self.defer(Job::registered(registration, kind)) {
                Ok(()) => return Status::Pending,
                Err(job) => return self.execute(&job),
            }
        }
        self.start_session(id, &data.relative_path)
    }

    fn end_directory_enumeration(&self, data: &CallbackData, id: EnumerationId) -> Status {
        debug!("EndDirectoryEnumeration[{}]: EnumId={}", data.command_id, id);
        if self.sessions.end(id).is_some() {
            self.stats.record_enumeration_ended();
        } else {
            warn!("EndDirectoryEnumeration for unknown session {}", id);
        }
        Status::Ok
    }

    fn get_directory_enumeration(
        &self,
        data: &CallbackData,
        id: EnumerationId,
        search_expression: Option<&str>,
        sink: &mut dyn DirEntrySink,
    ) -> Status {
        debug!(
            "GetDirectoryEnumeration[{}]: EnumId={}, Search={:?}, Restart={}",
            data.command_id,
            id,
            search_expression,
            data.flags.restart_scan
        );
        let registration = self.inflight.begin(data.command_id);
        let request = EmitRequest {
            search_expression,
            restart: data.flags.restart_scan,
            single_entry: data.flags.return_single_entry,
        };
        let host = &self.host;
        let matches = |name: &str, pattern: &str| host.name_matches(name, pattern);

        match self.sessions.get_entries(id, request, sink, &matches, registration.token()) {
            Ok(emission) => {
                self.stats.add_entries_emitted(emission.added as u64);
                match emission.stop {
                    EmissionStop::SinkFull if emission.added == 0 => Status::InsufficientBuffer,
                    EmissionStop::SinkFailed(code) => {
                        self.stats.record_failure();
                        error!(
                            "Enumeration {} could not hand entry {} to the host (code {:#x})",
                            id,
                            emission.added,
                            code
                        );
                        Status::Failed(code)
                    }
                    EmissionStop::Cancelled => {
                        debug!("Enumeration {} cancelled after {} entries", id, emission.added);
                        Status::Ok
                    }
                    _ => Status::Ok,
                }
            }
            Err(e) => self.fail("GetDirectoryEnumeration", &data.relative_path, e),
        }
    }

    fn get_placeholder_info(&self, data: &CallbackData) -> Status {
        debug!("GetPlaceholderInfo[{}]: Path={}", data.command_id, data.relative_path.display());
        if let Err(e) = check_path(data) {
            return self.fail("GetPlaceholderInfo", &data.relative_path, e);
        }

        let source = self.resolver.resolve_source(&data.relative_path);
        let info = match metadata::placeholder_for(&source) {
            Ok(info) => info,
            Err(e) => return self.fail("GetPlaceholderInfo", &data.relative_path, e),
        };
        match self.host.write_placeholder_info(&data.relative_path, &info) {
            Ok(()) => {
                self.stats.record_placeholder_written();
                Status::Ok
            }
            Err(e) => {
                self.stats.record_failure();
                error!("Failed to write placeholder for {}: {}", data.relative_path.display(), e);
                Status::Failed(e.code)
            }
        }
    }

    fn get_file_data(&self, data: &CallbackData, byte_offset: u64, length: u32) -> Status {
        debug!(
            "GetFileData[{}]: Path={}, Offset={}, Length={}",
            data.command_id,
            data.relative_path.display(),
            byte_offset,
            length
        );
        if let Err(e) = check_path(data) {
            return self.fail("GetFileData", &data.relative_path, e);
        }

        let registration = self.inflight.begin(data.command_id);
        if self.deferral.enabled && u64::from(length) > self.deferral.read_threshold {
            let kind = JobKind::Read {
                relative_path: data.relative_path.clone(),
                stream: data.data_stream_id,
                offset: byte_offset,
                length,
            };
            match self.defer(Job::registered(registration, kind)) {
                Ok(()) => return Status::Pending,
                Err(job) => return self.execute(&job),
            }
        }
        self.read_file(
            &data.relative_path,
            data.data_stream_id,
            byte_offset,
            length,
            registration.token(),
        )
    }

    fn query_file_name(&self, data: &CallbackData) -> Status {
        debug!("QueryFileName[{}]: Path={}", data.command_id, data.relative_path.display());
        Status::NotSupported
    }

    fn notify(
        &self,
        data: &CallbackData,
        is_directory: bool,
        kind: NotificationKind,
        destination: Option<&Path>,
    ) -> Status {
        debug!(
            "Notify[{}]: Path={}, Directory={}, Kind={:?}, Destination={:?}",
            data.command_id,
            data.relative_path.display(),
            is_directory,
            kind,
            destination
        );
        Status::NotSupported
    }

    fn cancel_command(&self, data: &CallbackData) {
        if self.inflight.cancel(data.command_id) {
            self.stats.record_cancellation();
            debug!("CancelCommand[{}]: cancelled", data.command_id);
        } else {
            debug!("CancelCommand[{}]: not in flight", data.command_id);
        }
    }
}

impl<H: VirtualizationHost> JobRunner for ProviderState<H> {
    fn execute(&self, job: &Job) -> Status {
        match &job.kind {
            JobKind::Read { relative_path, stream, offset, length } => {
                self.read_file(relative_path, *stream, *offset, *length, &job.cancel)
            }
            JobKind::Write { destination, .. } => {
                let err = ProviderError::not_supported("write-back");
                self.fail("Write", destination, err)
            }
            JobKind::DirectoryEnumerate { id, relative_path } => {
                self.start_session(*id, relative_path)
            }
        }
    }

    fn complete(&self, command: CommandId, status: Status) {
        if let Err(e) = self.host.complete_command(command, status) {
            error!("Failed to complete command {}: {}", command, e);
        }
    }
}

/// A passthrough provider bound to one host.
pub struct Provider<H: VirtualizationHost> {
    state: Arc<ProviderState<H>>,
    config: ProviderConfig,
    roots: ResolvedRoots,
    queue: Mutex<Option<JobQueue>>,
    instance_id: Mutex<Option<Uuid>>,
    running: AtomicBool,
}

impl<H: VirtualizationHost> Provider<H> {
    /// Validates `config` and prepares both roots. Nothing is registered with
    /// the host until [`Provider::start`].
    pub fn new(config: ProviderConfig, host: Arc<H>) -> Result<Self> {
        let roots = config.normalize()?;
        info!(
            "Provider configured: {} -> {}",
            roots.source_root.display(),
            roots.virtualization_root.display()
        );
        Ok(Self {
            state: Arc::new(ProviderState::new(host, roots.clone(), &config)),
            config,
            roots,
            queue: Mutex::new(None),
            instance_id: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Marks the virtualization root and starts dispatching callbacks.
    ///
    /// With deferral enabled this must run inside a tokio runtime, whose
    /// handle drives the job workers.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProviderError::configuration("provider is already running"));
        }
        if let Err(e) = self.start_inner() {
            self.running.store(false, Ordering::SeqCst);
            self.shutdown_queue();
            return Err(e);
        }
        Ok(())
    }

    fn start_inner(&self) -> Result<()> {
        let host = &self.state.host;
        let root = &self.roots.virtualization_root;
        let instance_id = Uuid::new_v4();

        host.mark_virtualization_root(root, instance_id).map_err(|e| {
            ProviderError::configuration(format!("cannot mark {} as virtualization root: {}", root.display(), e))
        })?;

        if self.config.deferral.enabled {
            let handle = Handle::try_current().map_err(|e| {
                ProviderError::configuration(format!("deferral needs a tokio runtime: {}", e))
            })?;
            let state: Arc<dyn JobRunner> = self.state.clone();
            let queue = JobQueue::start(
                handle,
                self.config.deferral.workers,
                self.config.deferral.queue_capacity,
                Arc::downgrade(&state),
            )?;
            *self.state.jobs.write() = Some(queue.sender());
            *self.queue.lock() = Some(queue);
        }

        let options = StartOptions {
            instance_id,
            pool_thread_count: self.config.pool_thread_count,
            concurrent_thread_count: self.config.concurrent_thread_count,
        };
        let dispatcher: Arc<dyn ProviderCallbacks> = self.state.clone();
        let dispatcher: Weak<dyn ProviderCallbacks> = Arc::downgrade(&dispatcher);
        host.start_virtualizing(root, dispatcher, &options).map_err(|e| {
            ProviderError::configuration(format!("cannot start virtualizing {}: {}", root.display(), e))
        })?;

        *self.instance_id.lock() = Some(instance_id);
        info!("Virtualizing {} (instance {})", root.display(), instance_id);
        Ok(())
    }

    /// Stops dispatching, drains the job queue and closes cached handles.
    /// Does nothing if the provider is not running.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.state.host.stop_virtualizing();
        self.state.inflight.cancel_all();
        self.shutdown_queue();
        self.state.sessions.clear();
        self.state.delivery.handles().close_all();
        *self.instance_id.lock() = None;
        info!("Stopped virtualizing {}", self.roots.virtualization_root.display());
    }

    fn shutdown_queue(&self) {
        *self.state.jobs.write() = None;
        if let Some(queue) = self.queue.lock().take() {
            queue.shutdown();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        *self.instance_id.lock()
    }

    pub fn roots(&self) -> &ResolvedRoots {
        &self.roots
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<H> {
        &self.state.host
    }

    pub fn state(&self) -> &Arc<ProviderState<H>> {
        &self.state
    }

    /// The callback set, for hosts that dispatch to it directly.
    pub fn callbacks(&self) -> Arc<dyn ProviderCallbacks> {
        self.state.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }
}

impl<H: VirtualizationHost> Drop for Provider<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<H: VirtualizationHost> fmt::Debug for Provider<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("virtualization_root", &self.roots.virtualization_root)
            .field("source_root", &self.roots.source_root)
            .field("running", &self.is_running())
            .field("active_enumerations", &self.state.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{BoundedSink, LoopbackHost};
    use crate::traits::{CallbackFlags, SinkError};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        provider: Provider<LoopbackHost>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("a.txt"), b"data").unwrap();
        fs::write(source.join("b.md"), b"markdown").unwrap();

        let config = ProviderConfig::new(temp.path().join("virt"), &source);
        let provider = Provider::new(config, Arc::new(LoopbackHost::new())).unwrap();
        Fixture { _temp: temp, provider }
    }

    fn data(command: i32, path: &str) -> CallbackData {
        CallbackData::new(CommandId(command), path)
    }

    #[test]
    fn test_new_rejects_same_roots() {
        let temp = TempDir::new().unwrap();
        let config = ProviderConfig::new(temp.path(), temp.path());
        let err = Provider::new(config, Arc::new(LoopbackHost::new())).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration { .. }));
    }

    #[test]
    fn test_start_registers_with_host() {
        let f = fixture();
        f.provider.start().unwrap();
        let host = f.provider.host();

        assert!(host.is_started());
        let (root, instance) = host.marked_root().unwrap();
        assert_eq!(root, f.provider.roots().virtualization_root);
        assert_eq!(Some(instance), f.provider.instance_id());
        assert!(host.dispatcher().is_some());

        let err = f.provider.start().unwrap_err();
        assert!(matches!(err, ProviderError::Configuration { .. }));

        f.provider.stop();
        assert!(!host.is_started());
        assert!(host.dispatcher().is_none());
    }

    #[test]
    fn test_deferral_without_runtime_fails_to_start() {
        let temp = TempDir::new().unwrap();
        let mut config = ProviderConfig::new(temp.path().join("virt"), temp.path().join("src"));
        config.deferral.enabled = true;
        let provider = Provider::new(config, Arc::new(LoopbackHost::new())).unwrap();

        let err = provider.start().unwrap_err();
        assert!(matches!(err, ProviderError::Configuration { .. }));
        assert!(!provider.is_running());
    }

    #[test]
    fn test_enumeration_with_filter() {
        let f = fixture();
        let callbacks = f.provider.callbacks();
        let id = EnumerationId::from_bytes([1; 16]);

        assert_eq!(callbacks.start_directory_enumeration(&data(1, ""), id), Status::Ok);
        let mut sink = BoundedSink::unbounded();
        let status = callbacks.get_directory_enumeration(&data(2, ""), id, Some("*.txt"), &mut sink);
        assert_eq!(status, Status::Ok);
        assert_eq!(sink.names(), vec!["a.txt"]);

        assert_eq!(callbacks.end_directory_enumeration(&data(3, ""), id), Status::Ok);
        assert!(f.provider.state().sessions().is_empty());
        assert_eq!(f.provider.stats().enumerations_ended, 1);
    }

    #[test]
    fn test_insufficient_buffer_only_when_nothing_fits() {
        let f = fixture();
        let callbacks = f.provider.callbacks();
        let id = EnumerationId::from_bytes([2; 16]);
        callbacks.start_directory_enumeration(&data(1, ""), id);

        let mut empty = BoundedSink::with_capacity(0);
        let status = callbacks.get_directory_enumeration(&data(2, ""), id, None, &mut empty);
        assert_eq!(status, Status::InsufficientBuffer);

        let mut one = BoundedSink::with_capacity(1);
        let status = callbacks.get_directory_enumeration(&data(3, ""), id, None, &mut one);
        assert_eq!(status, Status::Ok);
        assert_eq!(one.names(), vec!["a.txt"]);
    }

    /// Takes `room` entries, then fails every later one with `code`.
    struct RejectingSink {
        inner: BoundedSink,
        room: usize,
        code: i32,
    }

    impl DirEntrySink for RejectingSink {
        fn add(&mut self, name: &str, info: &crate::types::PlaceholderInfo) -> std::result::Result<(), SinkError> {
            if self.inner.len() >= self.room {
                return Err(SinkError::Failed(self.code));
            }
            self.inner.add(name, info)
        }
    }

    #[test]
    fn test_rejected_entry_fails_the_call() {
        let f = fixture();
        let callbacks = f.provider.callbacks();
        let id = EnumerationId::from_bytes([6; 16]);
        callbacks.start_directory_enumeration(&data(1, ""), id);

        let mut rejecting = RejectingSink { inner: BoundedSink::unbounded(), room: 1, code: 0x8007_0057_u32 as i32 };
        let status = callbacks.get_directory_enumeration(&data(2, ""), id, None, &mut rejecting);
        assert_eq!(status, Status::Failed(0x8007_0057_u32 as i32));
        assert_eq!(f.provider.stats().failures, 1);

        // The rejected entry is offered again on the next call.
        let mut sink = BoundedSink::unbounded();
        let status = callbacks.get_directory_enumeration(&data(3, ""), id, None, &mut sink);
        assert_eq!(status, Status::Ok);
        assert_eq!(sink.names(), vec!["b.md", "sub"]);
    }

    #[test]
    fn test_restart_and_single_entry_flags() {
        let f = fixture();
        let callbacks = f.provider.callbacks();
        let id = EnumerationId::from_bytes([3; 16]);
        callbacks.start_directory_enumeration(&data(1, ""), id);

        let single = data(2, "").with_flags(CallbackFlags { return_single_entry: true, ..Default::default() });
        let mut sink = BoundedSink::unbounded();
        callbacks.get_directory_enumeration(&single, id, None, &mut sink);
        assert_eq!(sink.names(), vec!["a.txt"]);

        let restart = data(3, "").with_flags(CallbackFlags { restart_scan: true, ..Default::default() });
        let mut sink = BoundedSink::unbounded();
        callbacks.get_directory_enumeration(&restart, id, None, &mut sink);
        assert_eq!(sink.names(), vec!["a.txt", "b.md", "sub"]);
    }

    #[test]
    fn test_unknown_session_is_invalid_parameter() {
        let f = fixture();
        let mut sink = BoundedSink::unbounded();
        let status = f.provider.callbacks().get_directory_enumeration(
            &data(1, ""),
            EnumerationId::from_bytes([9; 16]),
            None,
            &mut sink,
        );
        assert_eq!(status, Status::InvalidParameter);
    }

    #[test]
    fn test_placeholder_info_is_written() {
        let f = fixture();
        let callbacks = f.provider.callbacks();

        assert_eq!(callbacks.get_placeholder_info(&data(1, "a.txt")), Status::Ok);
        let info = f.provider.host().placeholder(Path::new("a.txt")).unwrap();
        assert_eq!(info.size, 4);
        assert!(!info.is_directory);

        assert_eq!(callbacks.get_placeholder_info(&data(2, "missing")), Status::NotFound);
        assert_eq!(callbacks.get_placeholder_info(&data(3, "../escape")), Status::InvalidParameter);
        assert_eq!(f.provider.stats().placeholders_written, 1);
    }

    #[test]
    fn test_file_data_and_unsupported_callbacks() {
        let f = fixture();
        let callbacks = f.provider.callbacks();
        let stream = DataStreamId::from_bytes([4; 16]);

        let read = data(1, "b.md").with_stream(stream);
        assert_eq!(callbacks.get_file_data(&read, 0, 8), Status::Ok);
        assert_eq!(f.provider.host().file_data(&stream), b"markdown");
        assert!(!f.provider.state().inflight().is_in_flight(CommandId(1)));

        assert_eq!(callbacks.query_file_name(&data(2, "a.txt")), Status::NotSupported);
        let status = callbacks.notify(&data(3, "a.txt"), false, NotificationKind::FileOpened, None);
        assert_eq!(status, Status::NotSupported);
    }

    #[test]
    fn test_cancel_unknown_command_is_harmless() {
        let f = fixture();
        f.provider.callbacks().cancel_command(&data(42, ""));
        assert_eq!(f.provider.stats().cancellations, 0);
    }

    #[test]
    fn test_drop_stops_provider() {
        let f = fixture();
        let host = f.provider.host().clone();
        f.provider.start().unwrap();
        drop(f);
        assert!(!host.is_started());
    }
}
