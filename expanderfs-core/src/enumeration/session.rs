use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use crate::snapshot::DirectorySnapshot;
use crate::traits::{DirEntrySink, SinkError};
use crate::types::EnumerationId;

/// Filter captured for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    MatchAll,
    Pattern(String),
}

impl SearchFilter {
    /// No expression, an empty one, or `*` all mean match-all.
    pub fn from_expression(expression: Option<&str>) -> Self {
        match expression {
            None => SearchFilter::MatchAll,
            Some(e) if e.is_empty() || e == "*" => SearchFilter::MatchAll,
            Some(e) => SearchFilter::Pattern(e.to_string()),
        }
    }

    fn admits(&self, name: &str, matches: &dyn Fn(&str, &str) -> bool) -> bool {
        match self {
            SearchFilter::MatchAll => true,
            SearchFilter::Pattern(pattern) => matches(name, pattern),
        }
    }
}

/// Where a session sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    FilterCaptured,
    Emitting,
    Paused,
    Completed,
}

/// Why an emission call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionStop {
    /// Every remaining entry was emitted; the session is complete.
    Exhausted,
    /// The sink refused an entry; it will be the first one next time.
    SinkFull,
    /// The host failed to take an entry, with this raw code. The cursor
    /// stays on that entry.
    SinkFailed(i32),
    /// One entry was requested and one was emitted.
    SingleEntry,
    /// The host cancelled the call.
    Cancelled,
}

/// Result of one get-entries call against a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub added: usize,
    pub stop: EmissionStop,
}

/// Options for one emission call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitRequest<'a> {
    pub search_expression: Option<&'a str>,
    pub restart: bool,
    pub single_entry: bool,
}

/// State of one enumeration session between its start and end callbacks.
#[derive(Debug)]
pub struct EnumerationSession {
    id: EnumerationId,
    virtual_path: PathBuf,
    source_path: PathBuf,
    filter: SearchFilter,
    filter_captured: bool,
    snapshot: DirectorySnapshot,
    /// Index of the next snapshot entry to consider.
    cursor: usize,
    completed: bool,
    state: SessionState,
}

impl EnumerationSession {
    pub fn new(
        id: EnumerationId,
        virtual_path: PathBuf,
        source_path: PathBuf,
        snapshot: DirectorySnapshot,
    ) -> Self {
        Self {
            id,
            virtual_path,
            source_path,
            filter: SearchFilter::MatchAll,
            filter_captured: false,
            snapshot,
            cursor: 0,
            completed: false,
            state: SessionState::Created,
        }
    }

    pub fn id(&self) -> EnumerationId {
        self.id
    }

    pub fn virtual_path(&self) -> &Path {
        &self.virtual_path
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn filter(&self) -> &SearchFilter {
        &self.filter
    }

    pub fn is_filter_captured(&self) -> bool {
        self.filter_captured
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> &DirectorySnapshot {
        &self.snapshot
    }

    /// Captures the filter and rewinds to the first entry.
    pub fn capture_filter(&mut self, expression: Option<&str>) {
        self.filter = SearchFilter::from_expression(expression);
        self.filter_captured = true;
        self.cursor = 0;
        self.completed = false;
        self.state = SessionState::FilterCaptured;
    }

    /// Emits entries from the cursor into `sink` until it is full or the
    /// snapshot runs out.
    ///
    /// The filter is captured on the first call and re-captured on restart;
    /// otherwise `search_expression` is ignored. A completed session keeps
    /// returning zero entries until restarted.
    pub fn emit(
        &mut self,
        request: EmitRequest<'_>,
        sink: &mut dyn DirEntrySink,
        matches: &dyn Fn(&str, &str) -> bool,
        cancel: &CancellationToken,
    ) -> Emission {
        if !self.filter_captured || request.restart {
            self.capture_filter(request.search_expression);
        }
        if self.completed {
            return Emission { added: 0, stop: EmissionStop::Exhausted };
        }

        self.state = SessionState::Emitting;
        let mut added = 0;
        while let Some(entry) = self.snapshot.get(self.cursor) {
            if !self.filter.admits(&entry.name, matches) {
                self.cursor += 1;
                continue;
            }
            if request.single_entry && added == 1 {
                return self.pause(added, EmissionStop::SingleEntry);
            }
            if cancel.is_cancelled() {
                return self.pause(added, EmissionStop::Cancelled);
            }
            match sink.add(&entry.name, &entry.info) {
                Ok(()) => {
                    added += 1;
                    self.cursor += 1;
                }
                Err(SinkError::Full) => return self.pause(added, EmissionStop::SinkFull),
                Err(SinkError::Failed(code)) => {
                    return self.pause(added, EmissionStop::SinkFailed(code));
                }
            }
        }

        self.completed = true;
        self.state = SessionState::Completed;
        Emission { added, stop: EmissionStop::Exhausted }
    }

    fn pause(&mut self, added: usize, stop: EmissionStop) -> Emission {
        self.state = SessionState::Paused;
        Emission { added, stop }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::BoundedSink;
    use crate::names;
    use crate::snapshot;
    use std::fs;
    use tempfile::TempDir;

    fn session_over(names_on_disk: &[&str]) -> (TempDir, EnumerationSession) {
        let temp = TempDir::new().unwrap();
        for name in names_on_disk {
            fs::write(temp.path().join(name), name.as_bytes()).unwrap();
        }
        let snapshot = snapshot::build(temp.path(), names::compare).unwrap();
        let session = EnumerationSession::new(
            EnumerationId::from_bytes([7; 16]),
            PathBuf::from("virt"),
            temp.path().to_path_buf(),
            snapshot,
        );
        (temp, session)
    }

    fn emit(
        session: &mut EnumerationSession,
        request: EmitRequest<'_>,
        sink: &mut BoundedSink,
    ) -> Emission {
        session.emit(request, sink, &names::matches, &CancellationToken::new())
    }

    #[test]
    fn test_first_call_captures_match_all() {
        let (_temp, mut session) = session_over(&["b", "a", "c"]);
        assert_eq!(session.state(), SessionState::Created);

        let mut sink = BoundedSink::unbounded();
        let emission = emit(&mut session, EmitRequest::default(), &mut sink);

        assert_eq!(emission, Emission { added: 3, stop: EmissionStop::Exhausted });
        assert_eq!(sink.names(), vec!["a", "b", "c"]);
        assert_eq!(session.filter(), &SearchFilter::MatchAll);
        assert!(session.is_completed());
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[test]
    fn test_resumes_after_sink_full() {
        let (_temp, mut session) = session_over(&["a", "b", "c", "d", "e"]);
        let mut collected = Vec::new();

        loop {
            let mut sink = BoundedSink::with_capacity(2);
            let emission = emit(&mut session, EmitRequest::default(), &mut sink);
            collected.extend(sink.names().into_iter().map(String::from));
            if emission.stop == EmissionStop::Exhausted {
                break;
            }
            assert_eq!(emission.stop, EmissionStop::SinkFull);
            assert_eq!(session.state(), SessionState::Paused);
        }

        assert_eq!(collected, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_completed_session_keeps_returning_nothing() {
        let (_temp, mut session) = session_over(&["a"]);
        let mut sink = BoundedSink::unbounded();
        emit(&mut session, EmitRequest::default(), &mut sink);

        let mut sink = BoundedSink::unbounded();
        let emission = emit(&mut session, EmitRequest::default(), &mut sink);
        assert_eq!(emission, Emission { added: 0, stop: EmissionStop::Exhausted });
        assert!(sink.names().is_empty());
    }

    #[test]
    fn test_filter_is_sticky_until_restart() {
        let (_temp, mut session) = session_over(&["a.txt", "b.md", "c.txt"]);
        let first = EmitRequest { search_expression: Some("*.txt"), ..Default::default() };
        let mut sink = BoundedSink::with_capacity(1);
        emit(&mut session, first, &mut sink);
        assert_eq!(sink.names(), vec!["a.txt"]);

        // A different expression without restart is ignored.
        let later = EmitRequest { search_expression: Some("*.md"), ..Default::default() };
        let mut sink = BoundedSink::unbounded();
        emit(&mut session, later, &mut sink);
        assert_eq!(sink.names(), vec!["c.txt"]);

        let restart = EmitRequest { search_expression: Some("*.md"), restart: true, ..Default::default() };
        let mut sink = BoundedSink::unbounded();
        emit(&mut session, restart, &mut sink);
        assert_eq!(sink.names(), vec!["b.md"]);
    }

    #[test]
    fn test_restart_rewinds_from_any_state() {
        let (_temp, mut session) = session_over(&["a", "b", "c"]);
        let mut sink = BoundedSink::with_capacity(2);
        emit(&mut session, EmitRequest::default(), &mut sink);
        assert_eq!(session.cursor(), 2);

        let restart = EmitRequest { restart: true, ..Default::default() };
        let mut sink = BoundedSink::unbounded();
        emit(&mut session, restart, &mut sink);
        assert_eq!(sink.names(), vec!["a", "b", "c"]);

        // And again after completion.
        let mut sink = BoundedSink::unbounded();
        emit(&mut session, restart, &mut sink);
        assert_eq!(sink.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_single_entry_request() {
        let (_temp, mut session) = session_over(&["a", "b"]);
        let single = EmitRequest { single_entry: true, ..Default::default() };

        let mut sink = BoundedSink::unbounded();
        let emission = emit(&mut session, single, &mut sink);
        assert_eq!(emission, Emission { added: 1, stop: EmissionStop::SingleEntry });

        let mut sink = BoundedSink::unbounded();
        let emission = emit(&mut session, single, &mut sink);
        assert_eq!(emission, Emission { added: 1, stop: EmissionStop::Exhausted });
        assert_eq!(sink.names(), vec!["b"]);
    }

    #[test]
    fn test_sink_full_on_first_entry() {
        let (_temp, mut session) = session_over(&["a"]);
        let mut sink = BoundedSink::with_capacity(0);
        let emission = emit(&mut session, EmitRequest::default(), &mut sink);
        assert_eq!(emission, Emission { added: 0, stop: EmissionStop::SinkFull });
        assert_eq!(session.cursor(), 0);
        assert!(!session.is_completed());
    }

    #[test]
    fn test_cancelled_emission_keeps_cursor() {
        let (_temp, mut session) = session_over(&["a", "b"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut sink = BoundedSink::unbounded();
        let emission = session.emit(EmitRequest::default(), &mut sink, &names::matches, &cancel);
        assert_eq!(emission, Emission { added: 0, stop: EmissionStop::Cancelled });
        assert_eq!(session.cursor(), 0);

        let mut sink = BoundedSink::unbounded();
        emit(&mut session, EmitRequest::default(), &mut sink);
        assert_eq!(sink.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_search_filter_from_expression() {
        assert_eq!(SearchFilter::from_expression(None), SearchFilter::MatchAll);
        assert_eq!(SearchFilter::from_expression(Some("")), SearchFilter::MatchAll);
        assert_eq!(SearchFilter::from_expression(Some("*")), SearchFilter::MatchAll);
        assert_eq!(
            SearchFilter::from_expression(Some("*.rs")),
            SearchFilter::Pattern("*.rs".to_string())
        );
    }
}
