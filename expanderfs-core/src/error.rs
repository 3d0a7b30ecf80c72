//! Error types for the ExpanderFS provider.
//!
//! Every callback failure is a [`ProviderError`]. Before it crosses back into the
//! host runtime it is collapsed into a [`Status`], which is the only thing the
//! host ever sees.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use crate::types::EnumerationId;

/// Status code handed back to the host for every callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The callback completed.
    Ok,
    /// The path does not exist in the source tree.
    NotFound,
    /// The request was malformed or referred to an unknown session.
    InvalidParameter,
    /// The sink was full before a single entry could be added.
    InsufficientBuffer,
    /// The callback was deferred; completion is reported later.
    Pending,
    /// The host could not allocate a transfer buffer.
    OutOfMemory,
    /// The operation is deliberately unimplemented.
    NotSupported,
    /// A failure reported by the host or the OS, carrying its raw code.
    Failed(i32),
}

/// Raw code used when an OS error carries no code of its own.
pub const GENERIC_FAILURE: i32 = -1;

impl Status {
    /// Returns true for statuses the host treats as success.
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok | Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::NotFound => write!(f, "not found"),
            Status::InvalidParameter => write!(f, "invalid parameter"),
            Status::InsufficientBuffer => write!(f, "insufficient buffer"),
            Status::Pending => write!(f, "pending"),
            Status::OutOfMemory => write!(f, "out of memory"),
            Status::NotSupported => write!(f, "not supported"),
            Status::Failed(code) => write!(f, "failed (code {})", code),
        }
    }
}

/// Error reported by the host runtime through one of its write-back primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("host error (code {code}): {message}")]
pub struct HostError {
    /// Raw host status code, passed back unchanged.
    pub code: i32,
    pub message: String,
}

impl HostError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Comprehensive error type for provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Path absent from the source tree.
    #[error("Path not found: {}", path.display())]
    NotFound {
        path: PathBuf,
    },

    /// The host referred to an enumeration session that does not exist.
    #[error("Unknown enumeration session: {id}")]
    InvalidSession {
        id: EnumerationId,
    },

    /// The host started a session with an id that is still in flight.
    #[error("Enumeration session already exists: {id}")]
    SessionExists {
        id: EnumerationId,
    },

    /// Malformed request from the host.
    #[error("Invalid parameter: {reason}")]
    InvalidParameter {
        reason: String,
    },

    /// The host allocator could not provide a transfer buffer.
    #[error("Failed to allocate a {size} byte transfer buffer")]
    AllocationFailed {
        size: usize,
    },

    /// The host rejected a write-back.
    #[error("Transfer rejected at offset {offset}")]
    TransferFailed {
        offset: u64,
        #[source]
        source: HostError,
    },

    /// Querying native attributes in the source tree failed.
    #[error("Failed to query attributes of {}", path.display())]
    AttributeQueryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading file contents from the source tree failed.
    #[error("Failed to read {}", path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Startup or teardown configuration failure.
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
    },

    /// Deliberately unimplemented operation.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        operation: String,
    },
}

impl ProviderError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ProviderError::Configuration { message: message.into() }
    }

    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        ProviderError::InvalidParameter { reason: reason.into() }
    }

    pub fn not_supported(operation: impl Into<String>) -> Self {
        ProviderError::NotSupported { operation: operation.into() }
    }

    /// Classifies an I/O error from a source-tree attribute query.
    pub fn from_attribute_query(path: PathBuf, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            ProviderError::NotFound { path }
        } else {
            ProviderError::AttributeQueryFailed { path, source }
        }
    }

    /// The status code the host receives for this error.
    pub fn status(&self) -> Status {
        match self {
            ProviderError::NotFound { .. } => Status::NotFound,
            ProviderError::InvalidSession { .. }
            | ProviderError::SessionExists { .. }
            | ProviderError::InvalidParameter { .. }
            | ProviderError::Configuration { .. } => Status::InvalidParameter,
            ProviderError::AllocationFailed { .. } => Status::OutOfMemory,
            ProviderError::TransferFailed { source, .. } => Status::Failed(source.code),
            ProviderError::AttributeQueryFailed { source, .. }
            | ProviderError::SourceRead { source, .. } => {
                Status::Failed(source.raw_os_error().unwrap_or(GENERIC_FAILURE))
            }
            ProviderError::NotSupported { .. } => Status::NotSupported,
        }
    }
}

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
