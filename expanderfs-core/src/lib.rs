//! # ExpanderFS Core
//!
//! The platform-neutral half of ExpanderFS, a passthrough virtual-filesystem
//! provider. A host virtualization runtime (Windows Projected File System, or
//! the in-memory [`loopback::LoopbackHost`]) intercepts filesystem operations on
//! a virtualization root and forwards them to the provider as callbacks; the
//! provider answers them from a real source tree, materializing directory
//! listings and file contents on demand.
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use expanderfs_core::{Provider, ProviderConfig};
//!
//! fn example<H: expanderfs_core::VirtualizationHost>(host: Arc<H>) -> expanderfs_core::Result<()> {
//!     let config = ProviderConfig::new("C:\\virt", "D:\\source");
//!     let provider = Provider::new(config, host)?;
//!     provider.start()?;
//!     // Callbacks are now dispatched by the host until the provider is stopped.
//!     provider.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`resolver`]: maps virtual-relative paths onto both roots
//! - [`metadata`]: source attributes to placeholder descriptors
//! - [`snapshot`]: point-in-time, host-ordered directory listings
//! - [`enumeration`]: resumable enumeration sessions and the table that owns them
//! - [`delivery`]: aligned, chunked file-data transfer
//! - [`jobs`]: the deferred job queue and its workers
//! - [`provider`]: the callback handlers and the start/stop lifecycle
//! - [`traits`]: the seams between the provider and the host runtime
//!
//! ## Platform Support
//!
//! - `expanderfs-windows`: the Projected File System binding
//! - [`loopback`]: an in-process host for tests and dry runs

pub mod traits;
pub mod types;
pub mod error;
pub mod names;
pub mod resolver;
pub mod metadata;
pub mod snapshot;
pub mod enumeration;
pub mod handles;
pub mod inflight;
pub mod delivery;
pub mod jobs;
pub mod stats;
pub mod provider;
pub mod loopback;

pub use error::{HostError, ProviderError, Result, Status};
pub use provider::{Provider, ProviderState};
pub use stats::StatsSnapshot;
pub use traits::{
    CallbackData, CallbackFlags, DirEntrySink, NotificationKind, ProviderCallbacks, SinkError,
    StartOptions, VirtualizationHost,
};
pub use types::{
    CommandId, DataStreamId, EnumerationId, FileAttributes, FileTime, PlaceholderInfo,
    ProviderConfig,
};
