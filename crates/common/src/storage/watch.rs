//! Watching backends for changes.
//!
//! A [`StorageWatcher`] runs on its own thread, repeatedly waiting for a
//! batch of events and handing it to the subscriber callback. The thread
//! honours a shared stop flag within one wait cycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a single wait cycle blocks before re-checking the stop flag.
pub const WAIT_CYCLE: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventType {
    Create,
    Modify,
    Delete,
}

impl FileEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventType::Create => "create",
            FileEventType::Modify => "modify",
            FileEventType::Delete => "delete",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "create" => Some(FileEventType::Create),
            "modify" => Some(FileEventType::Modify),
            "delete" => Some(FileEventType::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file change event, with a path relative to the backend root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub event_type: FileEventType,
    pub path: PathBuf,
}

impl FileEvent {
    pub fn new(event_type: FileEventType, path: impl Into<PathBuf>) -> Self {
        Self {
            event_type,
            path: path.into(),
        }
    }
}

/// Subscriber callback invoked with each event batch.
pub type WatchHandler = Arc<dyn Fn(Vec<FileEvent>) + Send + Sync>;

/// A watcher thread feeding batched events to a handler.
pub struct StorageWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StorageWatcher {
    /// Spawn the watcher thread. `wait` blocks for up to one cycle and
    /// returns the next batch (empty batches are dropped).
    pub fn spawn<W>(name: &str, mut wait: W, handler: WatchHandler) -> Self
    where
        W: FnMut() -> Option<Vec<FileEvent>> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(format!("watch-{}", name))
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    if let Some(events) = wait() {
                        if !events.is_empty() {
                            handler(events);
                        }
                    }
                }
            })
            .expect("failed to spawn watcher thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Signal the thread to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StorageWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for StorageWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWatcher")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_watcher_delivers_batches() {
        let (tx, rx) = flume::unbounded::<Vec<FileEvent>>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_handler = seen.clone();

        let mut watcher = StorageWatcher::spawn(
            "test",
            move || rx.recv_timeout(WAIT_CYCLE).ok(),
            Arc::new(move |events| seen_handler.lock().unwrap().extend(events)),
        );

        tx.send(vec![FileEvent::new(FileEventType::Create, "a.txt")])
            .unwrap();
        tx.send(vec![]).unwrap();
        tx.send(vec![FileEvent::new(FileEventType::Delete, "a.txt")])
            .unwrap();

        // Give the thread a moment to drain, then stop it.
        std::thread::sleep(Duration::from_millis(100));
        watcher.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event_type, FileEventType::Create);
        assert_eq!(seen[1].event_type, FileEventType::Delete);
    }

    #[test]
    fn test_watcher_stops_within_cycle() {
        let mut watcher = StorageWatcher::spawn(
            "idle",
            move || {
                std::thread::sleep(Duration::from_millis(10));
                None
            },
            Arc::new(|_| {}),
        );
        watcher.stop();
        assert!(watcher.thread.is_none());
    }
}
