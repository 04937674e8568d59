/**
 * Syncer state machine, conflict records and the syncer contract.
 */
pub mod base;
/**
 * The sync daemon: job table + control socket commands.
 */
pub mod daemon;
/**
 * Persistent per-(backend, path) hash memory.
 */
pub mod hashdb;
/**
 * The hash-driven replicator.
 */
pub mod naive;

pub use base::{SyncConflict, SyncEvent, SyncState, SyncerError};
pub use daemon::SyncDaemon;
pub use hashdb::{HashDb, HashDbError};
pub use naive::{NaiveSyncer, Side};
