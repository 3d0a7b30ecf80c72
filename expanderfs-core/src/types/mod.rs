// Module declarations
pub mod ids;
pub mod placeholder;
pub mod config;

// Re-export all types from submodules
pub use ids::{EnumerationId, CommandId, DataStreamId};
pub use placeholder::{FileTime, FileAttributes, NativeAttributes, PlaceholderInfo};
pub use config::{LogLevel, DeferralConfig, ProviderConfig, ResolvedRoots, DEFAULT_CHUNK_SIZE};
