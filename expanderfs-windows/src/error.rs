//! Translation between ProjFS results and the core's status codes.

use expanderfs_core::{HostError, Status};
use thiserror::Error;
use windows::core::HRESULT;
use windows::Win32::Foundation::{
    E_NOTIMPL, E_OUTOFMEMORY, ERROR_FILE_NOT_FOUND, ERROR_INSUFFICIENT_BUFFER,
    ERROR_INVALID_PARAMETER, ERROR_IO_PENDING, S_OK, WIN32_ERROR,
};

/// A failed `Prj*` call.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed (HRESULT 0x{:08X})", .hresult.0)]
pub struct WindowsError {
    pub operation: &'static str,
    pub hresult: HRESULT,
}

impl WindowsError {
    pub fn new(operation: &'static str, error: &windows::core::Error) -> Self {
        Self { operation, hresult: error.code() }
    }

    pub fn from_hresult(operation: &'static str, hresult: HRESULT) -> Self {
        Self { operation, hresult }
    }
}

impl From<WindowsError> for HostError {
    fn from(error: WindowsError) -> Self {
        HostError::new(error.hresult.0, error.to_string())
    }
}

/// HRESULT handed back to ProjFS for a callback status.
///
/// Positive raw codes are Win32 errors from the source tree; anything else is
/// already an HRESULT reported by ProjFS itself.
pub fn status_to_hresult(status: Status) -> HRESULT {
    match status {
        Status::Ok => S_OK,
        Status::NotFound => HRESULT::from(ERROR_FILE_NOT_FOUND),
        Status::InvalidParameter => HRESULT::from(ERROR_INVALID_PARAMETER),
        Status::InsufficientBuffer => HRESULT::from(ERROR_INSUFFICIENT_BUFFER),
        Status::Pending => HRESULT::from(ERROR_IO_PENDING),
        Status::OutOfMemory => E_OUTOFMEMORY,
        Status::NotSupported => E_NOTIMPL,
        Status::Failed(code) if code > 0 => HRESULT::from(WIN32_ERROR(code as u32)),
        Status::Failed(code) => HRESULT(code),
    }
}
