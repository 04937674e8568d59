//! Watch subscriptions over the control socket.
//!
//! One backend watcher feeds any number of per-pattern subscribers. The
//! backend watcher starts when the first subscriber for a storage arrives
//! and stops when the last one leaves; if a backend cannot watch, events
//! generated by the daemon's own operations are dispatched instead.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use common::control::ConnectionHandle;
use common::storage::{FileEvent, FileEventType};
use serde_json::json;

/// A watch added by a connected control client.
pub struct Watch {
    pub id: u64,
    pub storage_id: i64,
    pub pattern: String,
    matcher: globset::GlobMatcher,
    handler: Arc<ConnectionHandle>,
}

impl std::fmt::Display for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.storage_id, self.pattern)
    }
}

/// Wire name for an event type.
pub fn event_type_name(event_type: FileEventType) -> &'static str {
    match event_type {
        FileEventType::Create => "CREATE",
        FileEventType::Modify => "MODIFY",
        FileEventType::Delete => "DELETE",
    }
}

/// Registry of watches of one kind (file watches or subcontainer watches).
pub struct WatchRegistry {
    label: &'static str,
    watches: HashMap<u64, Watch>,
    storage_watches: HashMap<i64, BTreeSet<u64>>,
    // Storages with a running backend watcher.
    active_watchers: BTreeSet<i64>,
}

impl WatchRegistry {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            watches: HashMap::new(),
            storage_watches: HashMap::new(),
            active_watchers: BTreeSet::new(),
        }
    }

    /// Register a watch. Returns its id and whether this is the first
    /// watch for the storage (the caller should then start the backend
    /// watcher).
    pub fn add_watch(
        &mut self,
        watch_id: u64,
        storage_id: i64,
        pattern: &str,
        handler: Arc<ConnectionHandle>,
    ) -> Result<(u64, bool), globset::Error> {
        let matcher = globset::GlobBuilder::new(pattern)
            .build()?
            .compile_matcher();
        let watch = Watch {
            id: watch_id,
            storage_id,
            pattern: pattern.to_string(),
            matcher,
            handler,
        };
        tracing::debug!("adding {} watch: {}", self.label, watch);
        let entry = self.storage_watches.entry(storage_id).or_default();
        entry.insert(watch_id);
        let first = entry.len() == 1;
        self.watches.insert(watch_id, watch);
        Ok((watch_id, first))
    }

    /// Record that a backend watcher is running for a storage.
    pub fn watcher_started(&mut self, storage_id: i64) {
        self.active_watchers.insert(storage_id);
    }

    pub fn has_watcher(&self, storage_id: i64) -> bool {
        self.active_watchers.contains(&storage_id)
    }

    /// Remove one watch. Returns the storage id whose backend watcher
    /// should stop, if this was its last watch.
    pub fn remove_watch(&mut self, watch_id: u64) -> Option<i64> {
        let watch = self.watches.remove(&watch_id)?;
        tracing::debug!("removing {} watch: {}", self.label, watch);
        let remaining = match self.storage_watches.get_mut(&watch.storage_id) {
            Some(entry) => {
                entry.remove(&watch_id);
                entry.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.storage_watches.remove(&watch.storage_id);
            if self.active_watchers.remove(&watch.storage_id) {
                return Some(watch.storage_id);
            }
        }
        None
    }

    /// Drop all watches of a storage (unmount cascade). Returns whether a
    /// backend watcher was running and should stop.
    pub fn remove_storage(&mut self, storage_id: i64) -> bool {
        if let Some(ids) = self.storage_watches.remove(&storage_id) {
            for watch_id in ids {
                self.watches.remove(&watch_id);
            }
        }
        self.active_watchers.remove(&storage_id)
    }

    /// Dispatch a batch of events from a storage's backend watcher to
    /// every matching subscriber.
    pub fn dispatch(&self, storage_id: i64, events: &[FileEvent]) {
        let Some(watch_ids) = self.storage_watches.get(&storage_id) else {
            return;
        };
        for watch_id in watch_ids {
            let Some(watch) = self.watches.get(watch_id) else {
                continue;
            };
            let matching: Vec<_> = events
                .iter()
                .filter(|event| watch.matcher.is_match(&event.path))
                .map(|event| {
                    json!({
                        "type": event_type_name(event.event_type),
                        "path": event.path.display().to_string(),
                        "watch-id": watch.id,
                        "storage-id": watch.storage_id,
                    })
                })
                .collect();
            if matching.is_empty() {
                continue;
            }
            tracing::debug!("notify {} watch {}: {} events", self.label, watch, matching.len());
            watch.handler.send_event(matching);
        }
    }

    /// Dispatch an event generated by the daemon's own VFS operation,
    /// used only when the storage has no backend watcher running.
    pub fn notify_own_operation(
        &self,
        storage_id: i64,
        event_type: FileEventType,
        relpath: &Path,
    ) {
        if self.has_watcher(storage_id) {
            return;
        }
        let event = FileEvent::new(event_type, relpath);
        self.dispatch(storage_id, &[event]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> Arc<ConnectionHandle> {
        ConnectionHandle::detached(1)
    }

    #[test]
    fn test_first_and_last_watch() {
        let mut registry = WatchRegistry::new("file");
        let (id1, first) = registry.add_watch(1, 7, "*.yaml", handler()).unwrap();
        assert!(first);
        registry.watcher_started(7);

        let (_id2, first) = registry.add_watch(2, 7, "*", handler()).unwrap();
        assert!(!first);

        assert_eq!(registry.remove_watch(id1), None);
        assert_eq!(registry.remove_watch(2), Some(7));
        assert!(!registry.has_watcher(7));
    }

    #[test]
    fn test_remove_storage_cascades() {
        let mut registry = WatchRegistry::new("file");
        registry.add_watch(1, 7, "*", handler()).unwrap();
        registry.add_watch(2, 7, "*", handler()).unwrap();
        registry.watcher_started(7);

        assert!(registry.remove_storage(7));
        assert_eq!(registry.remove_watch(1), None);
        assert!(registry.watches.is_empty());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let mut registry = WatchRegistry::new("file");
        assert!(registry.add_watch(1, 7, "broken[", handler()).is_err());
    }
}
