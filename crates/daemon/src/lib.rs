// Mount daemon internals.
pub mod config;
pub mod fs;
pub mod fs_client;
pub mod process;
pub mod remounter;
pub mod resolver;
pub mod watchers;

// Kernel-facing adapter.
#[cfg(feature = "fuse")]
pub mod fuse;

// Re-exports for consumers (CLI, sync daemon, tests).
pub use config::Config;
pub use fs::{DaemonError, FileRef, WildlandFs};
pub use fs_client::{WatchEvent, WildlandFsClient};
pub use remounter::Remounter;
pub use resolver::{ConflictResolver, Resolved, ResolverStorage};
