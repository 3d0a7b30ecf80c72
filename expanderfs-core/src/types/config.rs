//! Configuration types for the provider.

use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use serde::{Deserialize, Serialize};
use crate::error::{ProviderError, Result};

/// Default soft cap on a single file-data chunk.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Verbosity of the provider's tracing output, as written in a config file
/// or on the command line. Parses the same names as [`tracing::Level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::DEBUG => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

// Lowercase, so it can be dropped straight into a filter directive.
impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&tracing::Level::from(*self).as_str().to_ascii_lowercase())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<tracing::Level>()
            .map(LogLevel::from)
            .map_err(|e| format!("{}: {}", s, e))
    }
}

/// Controls which callbacks are handed to background workers instead of
/// completing on the host's dispatch thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferralConfig {
    /// Master switch. When false every callback completes synchronously.
    pub enabled: bool,

    /// File-data requests longer than this many bytes are deferred.
    pub read_threshold: u64,

    /// Whether enumeration starts (snapshot builds) are deferred.
    pub defer_enumerations: bool,

    /// Number of worker tasks consuming the job queue.
    pub workers: usize,

    /// Bound on queued jobs; a full queue falls back to synchronous completion.
    pub queue_capacity: usize,
}

impl Default for DeferralConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            read_threshold: 8 * 1024 * 1024,
            defer_enumerations: false,
            workers: 2,
            queue_capacity: 64,
        }
    }
}

/// Provider configuration. Set once before virtualization starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Directory the host projects the source tree into
    pub virtualization_root: PathBuf,

    /// Directory whose contents are projected
    pub source_root: PathBuf,

    /// Number of threads in the host's callback pool
    pub pool_thread_count: u32,

    /// Number of callbacks the host may run at once
    pub concurrent_thread_count: u32,

    /// Soft cap on a single file-data chunk, in bytes
    pub chunk_size: u32,

    /// Keep source files open between reads
    pub cache_open_files: bool,

    /// Upper bound on idle cached handles
    pub max_open_files: usize,

    pub deferral: DeferralConfig,

    pub log_level: LogLevel,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let threads = num_cpus::get().max(1) as u32;
        Self {
            virtualization_root: PathBuf::new(),
            source_root: PathBuf::new(),
            pool_thread_count: threads,
            concurrent_thread_count: threads,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_open_files: true,
            max_open_files: 256,
            deferral: DeferralConfig::default(),
            log_level: LogLevel::Info,
        }
    }
}

impl ProviderConfig {
    /// Creates a config for the given roots with default tuning.
    pub fn new(virtualization_root: impl Into<PathBuf>, source_root: impl Into<PathBuf>) -> Self {
        Self {
            virtualization_root: virtualization_root.into(),
            source_root: source_root.into(),
            ..Self::default()
        }
    }

    /// Loads a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ProviderError::configuration(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            ProviderError::configuration(format!("invalid config file {}: {}", path.display(), e))
        })
    }

    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.virtualization_root.as_os_str().is_empty() {
            errors.push("virtualization root must be defined".to_string());
        }
        if self.source_root.as_os_str().is_empty() {
            errors.push("source root must be defined".to_string());
        }
        if self.pool_thread_count == 0 || self.concurrent_thread_count == 0 {
            errors.push("thread counts must be at least 1".to_string());
        }
        if self.chunk_size == 0 {
            errors.push("chunk size must be greater than zero".to_string());
        }
        if self.deferral.enabled {
            if self.deferral.workers == 0 {
                errors.push("deferral requires at least one worker".to_string());
            }
            if self.deferral.queue_capacity == 0 {
                errors.push("deferral queue capacity must be greater than zero".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validates the config, normalizes both roots and creates them if missing.
    pub fn normalize(&self) -> Result<ResolvedRoots> {
        self.validate()
            .map_err(|errors| ProviderError::configuration(errors.join("; ")))?;

        let virtualization_root = normalize_root(&self.virtualization_root)?;
        let source_root = normalize_root(&self.source_root)?;

        ensure_directory(&virtualization_root, "virtualization root")?;
        ensure_directory(&source_root, "source root")?;

        let canonical_virtual = fs::canonicalize(&virtualization_root).map_err(|e| {
            ProviderError::configuration(format!("cannot resolve virtualization root: {}", e))
        })?;
        let canonical_source = fs::canonicalize(&source_root).map_err(|e| {
            ProviderError::configuration(format!("cannot resolve source root: {}", e))
        })?;
        if canonical_virtual == canonical_source {
            return Err(ProviderError::configuration(
                "virtualization root and source root must be distinct",
            ));
        }
        if canonical_virtual.starts_with(&canonical_source) {
            return Err(ProviderError::configuration(
                "virtualization root must not live inside the source root",
            ));
        }
        if canonical_source.starts_with(&canonical_virtual) {
            return Err(ProviderError::configuration(
                "source root must not live inside the virtualization root",
            ));
        }

        Ok(ResolvedRoots { virtualization_root, source_root })
    }
}

/// Both roots after normalization. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoots {
    pub virtualization_root: PathBuf,
    pub source_root: PathBuf,
}

/// Unifies separators and strips trailing ones, keeping a bare root intact.
pub fn normalize_root(path: &Path) -> Result<PathBuf> {
    let raw = path.to_str().ok_or_else(|| {
        ProviderError::configuration(format!("path is not valid unicode: {}", path.display()))
    })?;
    if raw.is_empty() {
        return Err(ProviderError::configuration("path must not be empty"));
    }

    let unified: String = raw
        .chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect();
    let trimmed = unified.trim_end_matches(MAIN_SEPARATOR);

    let normalized = if trimmed.is_empty() || trimmed.ends_with(':') {
        // "/" or "C:\" must keep their separator
        format!("{}{}", trimmed, MAIN_SEPARATOR)
    } else {
        trimmed.to_string()
    };
    Ok(PathBuf::from(normalized))
}

fn ensure_directory(path: &Path, what: &str) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        ProviderError::configuration(format!(
            "could not create directory for the {} {}: {}",
            what,
            path.display(),
            e
        ))
    })?;
    if !path.is_dir() {
        return Err(ProviderError::configuration(format!(
            "{} is not a directory: {}",
            what,
            path.display()
        )));
    }
    Ok(())
}
