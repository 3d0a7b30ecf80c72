//! Enumeration sessions and the table that owns them.
//!
//! The table lock is held only while the map itself is touched. Snapshot
//! building happens before the insert and emission happens after the lookup,
//! each under the session's own lock, so unrelated sessions never wait on one
//! another and concurrent get-entries calls for the same id are serialized.

pub mod session;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use crate::error::{ProviderError, Result};
use crate::resolver::ResolvedPath;
use crate::snapshot;
use crate::traits::DirEntrySink;
use crate::types::EnumerationId;

pub use session::{EmitRequest, Emission, EmissionStop, EnumerationSession, SearchFilter, SessionState};

type SharedSession = Arc<Mutex<EnumerationSession>>;

/// Concurrency-safe map from enumeration id to session state.
#[derive(Debug, Default)]
pub struct EnumerationTable {
    sessions: Mutex<BTreeMap<EnumerationId, SharedSession>>,
}

impl EnumerationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots the source directory and registers a session for it.
    ///
    /// Fails with `NotFound` if the source directory does not exist and with
    /// `SessionExists` if the host reuses an id that is still in flight.
    pub fn start<F>(&self, id: EnumerationId, path: ResolvedPath, compare: F) -> Result<()>
    where
        F: Fn(&str, &str) -> Ordering,
    {
        if self.contains(id) {
            return Err(ProviderError::SessionExists { id });
        }
        let snapshot = snapshot::build(&path.source, compare)?;
        let session = EnumerationSession::new(id, path.virtual_path, path.source, snapshot);
        self.insert(session)
    }

    /// Registers an already-built session.
    pub fn insert(&self, session: EnumerationSession) -> Result<()> {
        let id = session.id();
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(ProviderError::SessionExists { id });
        }
        debug!(
            "Enumeration {} started for {} ({} entries)",
            id,
            session.virtual_path().display(),
            session.snapshot().len()
        );
        sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Emits the next entries of session `id` into `sink`.
    pub fn get_entries(
        &self,
        id: EnumerationId,
        request: EmitRequest<'_>,
        sink: &mut dyn DirEntrySink,
        matches: &dyn Fn(&str, &str) -> bool,
        cancel: &CancellationToken,
    ) -> Result<Emission> {
        let session = self.lookup(id)?;
        let mut session = session.lock();
        let emission = session.emit(request, sink, matches, cancel);
        trace!(
            "Enumeration {} emitted {} entries ({:?}), cursor at {}",
            id,
            emission.added,
            emission.stop,
            session.cursor()
        );
        Ok(emission)
    }

    /// Removes session `id`, returning it if it existed.
    pub fn end(&self, id: EnumerationId) -> Option<SharedSession> {
        self.sessions.lock().remove(&id)
    }

    pub fn contains(&self, id: EnumerationId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Drops every session. Used at teardown.
    pub fn clear(&self) {
        self.sessions.lock().clear();
    }

    fn lookup(&self, id: EnumerationId) -> Result<SharedSession> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ProviderError::InvalidSession { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::BoundedSink;
    use crate::names;
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use tempfile::TempDir;

    fn source_tree(count: usize) -> TempDir {
        let temp = TempDir::new().unwrap();
        for i in 0..count {
            fs::write(temp.path().join(format!("file{:03}", i)), b"x").unwrap();
        }
        temp
    }

    fn resolved(temp: &TempDir) -> ResolvedPath {
        ResolvedPath {
            source: temp.path().to_path_buf(),
            virtual_path: PathBuf::from("virt"),
        }
    }

    fn id(byte: u8) -> EnumerationId {
        EnumerationId::from_bytes([byte; 16])
    }

    fn drain(table: &EnumerationTable, id: EnumerationId, capacity: usize) -> Vec<String> {
        let mut names = Vec::new();
        loop {
            let mut sink = BoundedSink::with_capacity(capacity);
            let emission = table
                .get_entries(id, EmitRequest::default(), &mut sink, &names::matches, &CancellationToken::new())
                .unwrap();
            names.extend(sink.names().into_iter().map(String::from));
            if emission.stop == EmissionStop::Exhausted {
                return names;
            }
        }
    }

    #[test]
    fn test_start_missing_directory() {
        let temp = TempDir::new().unwrap();
        let table = EnumerationTable::new();
        let path = ResolvedPath {
            source: temp.path().join("missing"),
            virtual_path: PathBuf::from("virt/missing"),
        };
        let err = table.start(id(1), path, names::compare).unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let temp = source_tree(1);
        let table = EnumerationTable::new();
        table.start(id(1), resolved(&temp), names::compare).unwrap();
        let err = table.start(id(1), resolved(&temp), names::compare).unwrap_err();
        assert!(matches!(err, ProviderError::SessionExists { .. }));
    }

    #[test]
    fn test_unknown_session() {
        let table = EnumerationTable::new();
        let mut sink = BoundedSink::unbounded();
        let err = table
            .get_entries(id(9), EmitRequest::default(), &mut sink, &names::matches, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidSession { .. }));
    }

    #[test]
    fn test_end_removes_session() {
        let temp = source_tree(2);
        let table = EnumerationTable::new();
        table.start(id(1), resolved(&temp), names::compare).unwrap();
        assert!(table.end(id(1)).is_some());
        assert!(!table.contains(id(1)));
        assert!(table.end(id(1)).is_none());
    }

    #[test]
    fn test_partial_fills_match_single_pass() {
        let temp = source_tree(23);
        let table = EnumerationTable::new();
        table.start(id(1), resolved(&temp), names::compare).unwrap();
        table.start(id(2), resolved(&temp), names::compare).unwrap();

        let whole = drain(&table, id(1), usize::MAX);
        let pieces = drain(&table, id(2), 4);
        assert_eq!(whole.len(), 23);
        assert_eq!(whole, pieces);
    }

    #[test]
    fn test_sessions_over_same_directory_are_independent() {
        let temp = source_tree(6);
        let table = EnumerationTable::new();
        table.start(id(1), resolved(&temp), names::compare).unwrap();
        table.start(id(2), resolved(&temp), names::compare).unwrap();

        let mut sink = BoundedSink::with_capacity(4);
        table
            .get_entries(id(1), EmitRequest::default(), &mut sink, &names::matches, &CancellationToken::new())
            .unwrap();

        let second = drain(&table, id(2), usize::MAX);
        assert_eq!(second.len(), 6);
        assert_eq!(second[0], "file000");
    }

    #[test]
    fn test_concurrent_sessions_and_shared_id() {
        let temp = source_tree(50);
        let table = Arc::new(EnumerationTable::new());
        for n in 0..8u8 {
            table.start(id(n), resolved(&temp), names::compare).unwrap();
        }

        // One thread per session, plus two threads racing on session 0.
        let mut handles = Vec::new();
        for n in 1..8u8 {
            let table = table.clone();
            handles.push(thread::spawn(move || drain(&table, id(n), 3)));
        }
        let mut racers = Vec::new();
        for _ in 0..2 {
            let table = table.clone();
            racers.push(thread::spawn(move || drain(&table, id(0), 5)));
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap().len(), 50);
        }

        // The racers share one cursor, so together they see each entry exactly once.
        let mut shared: Vec<String> = racers.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(shared.len(), 50);
        shared.sort();
        shared.dedup();
        assert_eq!(shared.len(), 50);
    }
}
