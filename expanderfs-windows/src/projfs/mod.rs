pub mod callbacks;
pub mod host;
pub(crate) mod strings;

pub use host::{AlignedBuffer, ProjFsHost};
