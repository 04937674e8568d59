//! Syncer state machine and shared types.

use std::path::PathBuf;

use common::storage::{BackendError, FsError};
use parking_lot::Mutex;

/// Lifecycle of a syncer:
/// `Init → OneShot → Synced ⇄ Running → (Error | Stopped)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Init,
    OneShot,
    Synced,
    Running,
    Error,
    Stopped,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Init => "INIT",
            SyncState::OneShot => "ONE_SHOT",
            SyncState::Synced => "SYNCED",
            SyncState::Running => "RUNNING",
            SyncState::Error => "ERROR",
            SyncState::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State holder enforcing the transition rules: `Error` is sticky until
/// an explicit restart; a `Synced` assignment never overwrites it.
#[derive(Debug, Default)]
pub struct SyncStateCell {
    state: Mutex<Option<SyncState>>,
}

impl SyncStateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Some(SyncState::Init)),
        }
    }

    pub fn get(&self) -> SyncState {
        self.state.lock().unwrap_or(SyncState::Init)
    }

    pub fn set(&self, new: SyncState) {
        let mut state = self.state.lock();
        let current = state.unwrap_or(SyncState::Init);
        if current == SyncState::Error && new == SyncState::Synced {
            return;
        }
        if new == SyncState::Init {
            // Only an explicit restart leaves ERROR.
            *state = Some(SyncState::Init);
            return;
        }
        if current == SyncState::Error && new != SyncState::Stopped {
            return;
        }
        *state = Some(new);
    }
}

/// A file conflict between the two synced storages. Recorded, never
/// silently merged.
#[derive(Debug, Clone)]
pub struct SyncConflict {
    pub path: PathBuf,
    pub backend1: String,
    pub backend2: String,
}

impl std::fmt::Display for SyncConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Conflict detected on {} in storages {} and {}",
            self.path.display(),
            self.backend1,
            self.backend2
        )
    }
}

impl PartialEq for SyncConflict {
    fn eq(&self, other: &Self) -> bool {
        if self.path != other.path {
            return false;
        }
        let mut ours = [&self.backend1, &self.backend2];
        let mut theirs = [&other.backend1, &other.backend2];
        ours.sort();
        theirs.sort();
        ours == theirs
    }
}

/// Out-of-band notifications from a running syncer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    State(SyncState),
    Conflict(String),
    Error(String),
}

pub type SyncEventHandler = std::sync::Arc<dyn Fn(SyncEvent) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("hash database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_sticky() {
        let cell = SyncStateCell::new();
        cell.set(SyncState::OneShot);
        cell.set(SyncState::Error);
        cell.set(SyncState::Synced);
        assert_eq!(cell.get(), SyncState::Error);
        cell.set(SyncState::Running);
        assert_eq!(cell.get(), SyncState::Error);

        // Explicit restart clears it.
        cell.set(SyncState::Init);
        assert_eq!(cell.get(), SyncState::Init);
        cell.set(SyncState::Synced);
        assert_eq!(cell.get(), SyncState::Synced);
    }

    #[test]
    fn test_stop_overrides_error() {
        let cell = SyncStateCell::new();
        cell.set(SyncState::Error);
        cell.set(SyncState::Stopped);
        assert_eq!(cell.get(), SyncState::Stopped);
    }

    #[test]
    fn test_conflict_equality_ignores_order() {
        let a = SyncConflict {
            path: PathBuf::from("f"),
            backend1: "b1".into(),
            backend2: "b2".into(),
        };
        let b = SyncConflict {
            path: PathBuf::from("f"),
            backend1: "b2".into(),
            backend2: "b1".into(),
        };
        assert_eq!(a, b);
    }
}
