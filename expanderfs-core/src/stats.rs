//! Operation counters for a running provider.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

/// Provider statistics tracker.
#[derive(Debug, Default)]
pub struct ProviderStats {
    enumerations_started: AtomicU64,
    enumerations_ended: AtomicU64,
    entries_emitted: AtomicU64,
    placeholders_written: AtomicU64,
    file_reads: AtomicU64,
    bytes_delivered: AtomicU64,
    chunks_delivered: AtomicU64,
    deferred_jobs: AtomicU64,
    cancellations: AtomicU64,
    failures: AtomicU64,
}

impl ProviderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enumeration_started(&self) {
        self.enumerations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enumeration_ended(&self) {
        self.enumerations_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_entries_emitted(&self, count: u64) {
        self.entries_emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_placeholder_written(&self) {
        self.placeholders_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_read(&self, bytes: u64, chunks: u64) {
        self.file_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes, Ordering::Relaxed);
        self.chunks_delivered.fetch_add(chunks, Ordering::Relaxed);
    }

    pub fn record_deferred_job(&self) {
        self.deferred_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enumerations_started: self.enumerations_started.load(Ordering::Relaxed),
            enumerations_ended: self.enumerations_ended.load(Ordering::Relaxed),
            entries_emitted: self.entries_emitted.load(Ordering::Relaxed),
            placeholders_written: self.placeholders_written.load(Ordering::Relaxed),
            file_reads: self.file_reads.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            chunks_delivered: self.chunks_delivered.load(Ordering::Relaxed),
            deferred_jobs: self.deferred_jobs.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`ProviderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enumerations_started: u64,
    pub enumerations_ended: u64,
    pub entries_emitted: u64,
    pub placeholders_written: u64,
    pub file_reads: u64,
    pub bytes_delivered: u64,
    pub chunks_delivered: u64,
    pub deferred_jobs: u64,
    pub cancellations: u64,
    pub failures: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enumerations {}/{} ({} entries), placeholders {}, reads {} ({} bytes in {} chunks), deferred {}, cancelled {}, failed {}",
            self.enumerations_started,
            self.enumerations_ended,
            self.entries_emitted,
            self.placeholders_written,
            self.file_reads,
            self.bytes_delivered,
            self.chunks_delivered,
            self.deferred_jobs,
            self.cancellations,
            self.failures
        )
    }
}
