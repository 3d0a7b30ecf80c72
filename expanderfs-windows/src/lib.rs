//! # ExpanderFS Windows
//!
//! Windows Projected File System binding for ExpanderFS. [`ProjFsHost`]
//! implements the core's `VirtualizationHost` over the `Prj*` API, and the
//! `extern "system"` callbacks in [`projfs::callbacks`] translate every raw
//! ProjFS callback into a call on the provider's callback trait.

#![cfg(windows)]

pub mod error;
pub mod projfs;

pub use error::{status_to_hresult, WindowsError};
pub use projfs::{AlignedBuffer, ProjFsHost};
