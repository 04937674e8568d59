//! Naive syncer: assumes zero special capabilities of the backends.
//!
//! Replication is driven purely by content hashes. Per `(backend, path)`
//! the syncer remembers the last-known hash (in memory, persisted to the
//! [`HashDb`]); divergence on both sides becomes a recorded
//! [`SyncConflict`], never a silent merge. Copies stream in fixed-size
//! blocks through safe-replace handles where the backend offers them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use common::storage::{FileEvent, FileEventType, FsError, StorageBackend};

use crate::base::{SyncConflict, SyncEvent, SyncEventHandler, SyncState, SyncStateCell, SyncerError};
use crate::hashdb::HashDb;

const BLOCK_SIZE: usize = 1024 * 1024;

/// Which of the two backends a path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Target,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Source => Side::Target,
            Side::Target => Side::Source,
        }
    }
}

struct Inner {
    hashes: HashMap<Side, HashMap<PathBuf, String>>,
    conflicts: Vec<SyncConflict>,
    watching: Vec<Side>,
}

/// The syncer. Shared between the control thread and the watcher threads
/// through an `Arc`; all mutable state sits behind one mutex.
pub struct NaiveSyncer {
    source: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    log_prefix: String,
    db: Option<Arc<HashDb>>,
    state: SyncStateCell,
    inner: Mutex<Inner>,
    event_handler: Mutex<Option<SyncEventHandler>>,
}

impl NaiveSyncer {
    pub fn new(
        source: Arc<dyn StorageBackend>,
        target: Arc<dyn StorageBackend>,
        log_prefix: impl Into<String>,
        db: Option<Arc<HashDb>>,
    ) -> Self {
        let mut hashes = HashMap::new();
        hashes.insert(Side::Source, HashMap::new());
        hashes.insert(Side::Target, HashMap::new());
        Self {
            source,
            target,
            log_prefix: log_prefix.into(),
            db,
            state: SyncStateCell::new(),
            inner: Mutex::new(Inner {
                hashes,
                conflicts: Vec::new(),
                watching: Vec::new(),
            }),
            event_handler: Mutex::new(None),
        }
    }

    pub fn set_event_handler(&self, handler: SyncEventHandler) {
        *self.event_handler.lock() = Some(handler);
    }

    pub fn state(&self) -> SyncState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state.get(),
            SyncState::OneShot | SyncState::Synced | SyncState::Running
        )
    }

    pub fn iter_conflicts(&self) -> Vec<SyncConflict> {
        self.inner.lock().conflicts.clone()
    }

    fn backend(&self, side: Side) -> &Arc<dyn StorageBackend> {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    fn notify_event(&self, event: SyncEvent) {
        if let Some(handler) = self.event_handler.lock().clone() {
            handler(event);
        }
    }

    /// Start continuous syncing: mount, install watchers, run the initial
    /// one-shot pass.
    pub fn start_sync(self: &Arc<Self>, unidirectional: bool) -> Result<(), SyncerError> {
        tracing::debug!("{}: starting file syncing", self.log_prefix);
        let mut sides = vec![Side::Source];
        if !unidirectional {
            sides.push(Side::Target);
        }
        for side in sides {
            let backend = self.backend(side).clone();
            backend.request_mount()?;
            let me = self.clone();
            backend.start_watcher(
                Arc::new(move |events: Vec<FileEvent>| me.handle_events(side, events)),
                true,
            )?;
            self.inner.lock().watching.push(side);
            tracing::debug!(
                "{}: added watcher for storage {}",
                self.log_prefix,
                backend.backend_id()
            );
        }
        // The target still needs to be mounted for unidirectional runs.
        if unidirectional {
            self.target.request_mount()?;
        }
        self.one_shot_sync(unidirectional)
    }

    /// One rsync-style pass: reconcile the two snapshots.
    pub fn one_shot_sync(&self, unidirectional: bool) -> Result<(), SyncerError> {
        self.state.set(SyncState::OneShot);

        let mut dirs: HashMap<Side, Vec<PathBuf>> = HashMap::new();
        {
            let mut inner = self.inner.lock();
            for side in [Side::Source, Side::Target] {
                let backend = self.backend(side).clone();
                let mut hashes = HashMap::new();
                let mut side_dirs = Vec::new();
                for (path, attr) in backend.walk(Path::new(""))? {
                    if attr.is_dir() {
                        side_dirs.push(path);
                    } else {
                        match backend.get_hash(&path) {
                            Ok(hash) => {
                                hashes.insert(path, hash);
                            }
                            Err(FsError::NotFound(_)) => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                dirs.insert(side, side_dirs);
                inner.hashes.insert(side, hashes);
            }

            let mut directions = vec![(Side::Source, Side::Target)];
            if !unidirectional {
                directions.push((Side::Target, Side::Source));
            }

            // Directory structure first.
            for (from, to) in &directions {
                let missing: Vec<PathBuf> = dirs[from]
                    .iter()
                    .filter(|path| !dirs[to].contains(path))
                    .cloned()
                    .collect();
                for path in missing {
                    tracing::debug!(
                        "{}: creating directory {} in storage {}",
                        self.log_prefix,
                        path.display(),
                        self.backend(*to).backend_id()
                    );
                    match self.backend(*to).mkdir(&path) {
                        Ok(()) => {}
                        Err(FsError::Exists(_)) | Err(FsError::NotADirectory(_)) => {
                            self.handle_conflict(&mut inner, &path);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            // Files present on both sides with differing content are
            // conflicts, not merge candidates.
            let differing: Vec<PathBuf> = inner.hashes[&Side::Source]
                .iter()
                .filter(|(path, hash)| {
                    inner.hashes[&Side::Target]
                        .get(*path)
                        .is_some_and(|other| other != *hash)
                })
                .map(|(path, _)| path.clone())
                .collect();
            for path in differing {
                self.handle_conflict(&mut inner, &path);
            }

            // Files present on one side only: replay offline deletions,
            // copy the rest.
            for (from, to) in &directions {
                let only_here: Vec<(PathBuf, String)> = inner.hashes[from]
                    .iter()
                    .filter(|(path, _)| !inner.hashes[to].contains_key(*path))
                    .map(|(path, hash)| (path.clone(), hash.clone()))
                    .collect();
                for (path, current_hash) in only_here {
                    let last_known = self.last_known_hash(&inner, *to, &path);
                    if last_known.as_deref() == Some(current_hash.as_str()) {
                        // The other side knew this exact content and no
                        // longer has it: the file was deleted offline.
                        tracing::debug!(
                            "{}: removing file {} in backend {}",
                            self.log_prefix,
                            path.display(),
                            self.backend(*from).backend_id()
                        );
                        match self.backend(*from).unlink(&path) {
                            Ok(()) => {
                                inner.hashes.get_mut(from).map(|h| h.remove(&path));
                                self.forget_hash(*from, &path);
                                self.forget_hash(*to, &path);
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "{}: cannot remove file {} in backend {}: {}",
                                    self.log_prefix,
                                    path.display(),
                                    self.backend(*from).backend_id(),
                                    e
                                );
                            }
                        }
                        continue;
                    }
                    self.sync_file(&mut inner, *from, *to, &path)?;
                }
            }

            self.persist_hashes(&inner);
        }

        // This will not overwrite an ERROR state; see the state cell.
        self.state.set(SyncState::Synced);
        Ok(())
    }

    /// Stop all watchers cleanly.
    pub fn stop_sync(&self) {
        tracing::debug!("{}: stopping file syncing", self.log_prefix);
        let watching: Vec<Side> = {
            let mut inner = self.inner.lock();
            inner.conflicts.clear();
            std::mem::take(&mut inner.watching)
        };
        for side in watching {
            let backend = self.backend(side);
            backend.stop_watcher();
            let _ = backend.request_unmount();
        }
        self.state.set(SyncState::Stopped);
        tracing::debug!("{}: file syncing stopped", self.log_prefix);
    }

    /* Event handling */

    /// Process one watcher batch from `side`. Any unrecoverable error
    /// moves the syncer to ERROR; further events are accepted but the
    /// state stays ERROR until a fresh start.
    pub fn handle_events(&self, side: Side, events: Vec<FileEvent>) {
        self.state.set(SyncState::Running);
        {
            let mut inner = self.inner.lock();
            for event in events {
                tracing::debug!(
                    "{}: handling event {} for {} from storage {}",
                    self.log_prefix,
                    event.event_type,
                    event.path.display(),
                    self.backend(side).backend_id()
                );
                let result = self.handle_one_event(&mut inner, side, &event);
                if let Err(e) = result {
                    self.notify_event(SyncEvent::Error(e.to_string()));
                    self.state.set(SyncState::Error);
                    break;
                }
            }
            self.persist_hashes(&inner);
        }
        self.state.set(SyncState::Synced);
    }

    fn handle_one_event(
        &self,
        inner: &mut Inner,
        side: Side,
        event: &FileEvent,
    ) -> Result<(), SyncerError> {
        let other = side.other();
        let path = &event.path;
        match event.event_type {
            FileEventType::Delete => {
                let old_source_hash = inner.hashes[&side].get(path).cloned();
                // Nothing hashed under this path: it was a directory.
                let is_dir = old_source_hash.is_none();
                let old_target_hash = inner.hashes[&other].get(path).cloned();

                if old_source_hash == old_target_hash {
                    self.remove_object(inner, side, other, path, is_dir, old_source_hash)?;
                } else {
                    tracing::warn!(
                        "{}: conflict resolved via removal of {} from storage {}; \
                         version from {} is now authoritative",
                        self.log_prefix,
                        path.display(),
                        self.backend(side).backend_id(),
                        self.backend(other).backend_id()
                    );
                    self.create_object(inner, other, side, path)?;
                }
            }
            FileEventType::Create => self.create_object(inner, side, other, path)?,
            FileEventType::Modify => self.sync_file(inner, side, other, path)?,
        }
        Ok(())
    }

    /* Copying */

    /// Copy one file `from → to`, honouring the hash memory rules.
    fn sync_file(
        &self,
        inner: &mut Inner,
        from: Side,
        to: Side,
        path: &Path,
    ) -> Result<(), SyncerError> {
        let source = self.backend(from).clone();
        let target = self.backend(to).clone();
        tracing::debug!(
            "{}: attempting to sync file {} from {} to {}",
            self.log_prefix,
            path.display(),
            source.backend_id(),
            target.backend_id()
        );

        let source_hash = match source.get_hash(path) {
            Ok(hash) => hash,
            Err(FsError::NotFound(_)) | Err(FsError::IsADirectory(_)) => {
                // Deleted or replaced before we got to it; the follow-up
                // event will deal with whatever took its place.
                inner.hashes.get_mut(&from).map(|h| h.remove(path));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let old_source_hash = inner.hashes[&from].get(path).cloned();
        inner
            .hashes
            .get_mut(&from)
            .map(|h| h.insert(path.to_path_buf(), source_hash.clone()));

        let target_hash = match target.get_hash(path) {
            Ok(hash) => Some(hash),
            Err(FsError::NotFound(_)) => None,
            Err(FsError::IsADirectory(_)) => {
                // A file syncing onto a directory can never go well.
                self.handle_conflict(inner, path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let old_target_hash = inner.hashes[&to].get(path).cloned();

        if let (Some(old_target), Some(old_source)) = (&old_target_hash, &old_source_hash) {
            if old_target != old_source && target_hash.is_some() {
                tracing::warn!(
                    "{}: known conflict on {} prevents syncing",
                    self.log_prefix,
                    path.display()
                );
                return Ok(());
            }
        }

        if target_hash.as_deref() == Some(source_hash.as_str()) {
            inner
                .hashes
                .get_mut(&to)
                .map(|h| h.insert(path.to_path_buf(), source_hash));
            return Ok(());
        }

        // The target changed under us since the last sync.
        if let (Some(old_target), Some(current_target)) = (&old_target_hash, &target_hash) {
            if current_target != old_target {
                self.handle_conflict(inner, path);
                return Ok(());
            }
        }

        let target_file = match &target_hash {
            None => match target.create(path, libc::O_CREAT | libc::O_WRONLY, 0o644) {
                Ok(file) => file,
                Err(FsError::Unsupported) => {
                    tracing::warn!(
                        "{}: cannot sync {} to {}: operation not supported",
                        self.log_prefix,
                        path.display(),
                        target.backend_id()
                    );
                    return Ok(());
                }
                Err(FsError::NotADirectory(_)) => {
                    // Parent is a file on the other side.
                    self.handle_conflict(inner, path);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
            Some(expected) => {
                match target.open_for_safe_replace(path, libc::O_RDWR, expected) {
                    Ok(file) => file,
                    Err(FsError::Unsupported) => match target.open(path, libc::O_WRONLY) {
                        Ok(file) => file,
                        Err(FsError::Unsupported) => {
                            tracing::warn!(
                                "{}: cannot sync {} to {}: operation not supported",
                                self.log_prefix,
                                path.display(),
                                target.backend_id()
                            );
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    },
                    Err(FsError::HashMismatch(_)) => {
                        tracing::warn!(
                            "{}: unexpected hash for {} in {}, cannot sync",
                            self.log_prefix,
                            path.display(),
                            target.backend_id()
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        match self.copy_blocks(source.as_ref(), path, target_file) {
            Ok(resulting_hash) => {
                inner
                    .hashes
                    .get_mut(&from)
                    .map(|h| h.insert(path.to_path_buf(), resulting_hash.clone()));
                inner
                    .hashes
                    .get_mut(&to)
                    .map(|h| h.insert(path.to_path_buf(), resulting_hash));
                Ok(())
            }
            Err(FsError::HashMismatch(_)) => {
                tracing::warn!(
                    "{}: unexpected hash for {} in {}, cannot sync",
                    self.log_prefix,
                    path.display(),
                    target.backend_id()
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stream the file block by block, hashing along the way. The commit
    /// (and its hash check) happens inside the handle's release.
    fn copy_blocks(
        &self,
        source: &dyn StorageBackend,
        path: &Path,
        mut target_file: Box<dyn common::storage::FileHandle>,
    ) -> Result<String, FsError> {
        let mut source_file = source.open(path, libc::O_RDONLY)?;
        let mut hasher = Sha256::new();

        target_file.ftruncate(0)?;
        let mut offset = 0u64;
        loop {
            let data = source_file.read(BLOCK_SIZE, offset)?;
            if data.is_empty() {
                break;
            }
            let written = target_file.write(&data, offset)?;
            hasher.update(&data[..written]);
            offset += written as u64;
        }
        source_file.release()?;
        target_file.release()?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Replicate a whole directory tree `from → to`.
    fn sync_dir(
        &self,
        inner: &mut Inner,
        from: Side,
        to: Side,
        path: &Path,
    ) -> Result<(), SyncerError> {
        tracing::debug!(
            "{}: attempting to sync directory {} from {} to {}",
            self.log_prefix,
            path.display(),
            self.backend(from).backend_id(),
            self.backend(to).backend_id()
        );
        for (file_path, attr) in self.backend(from).walk(path)? {
            if attr.is_dir() {
                match self.backend(to).mkdir(&file_path) {
                    Ok(()) | Err(FsError::Exists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                self.sync_file(inner, from, to, &file_path)?;
            }
        }
        Ok(())
    }

    /// Create a file or directory on `to` from its counterpart on `from`.
    fn create_object(
        &self,
        inner: &mut Inner,
        from: Side,
        to: Side,
        path: &Path,
    ) -> Result<(), SyncerError> {
        let is_dir = match self.backend(from).getattr(path) {
            Ok(attr) => attr.is_dir(),
            // Deleted before we managed to look at it.
            Err(FsError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if is_dir {
            match self.backend(to).mkdir(path) {
                Ok(()) | Err(FsError::Exists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.sync_dir(inner, from, to, path)
        } else {
            self.sync_file(inner, from, to, path)
        }
    }

    /// Remove `path` on `to` after it disappeared from `from`, but only
    /// if `to` still holds the content the syncer expects.
    fn remove_object(
        &self,
        inner: &mut Inner,
        from: Side,
        to: Side,
        path: &Path,
        source_was_dir: bool,
        old_source_hash: Option<String>,
    ) -> Result<(), SyncerError> {
        tracing::debug!(
            "{}: attempting to sync removal of {} from {} in {}",
            self.log_prefix,
            path.display(),
            self.backend(from).backend_id(),
            self.backend(to).backend_id()
        );
        self.remove_subdir_paths(inner, from, path);

        let target_is_dir = match self.backend(to).getattr(path) {
            Ok(attr) => attr.is_dir(),
            Err(FsError::NotFound(_)) => {
                self.already_removed(inner, to, path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if target_is_dir != source_was_dir {
            self.handle_conflict(inner, path);
            return Ok(());
        }

        if target_is_dir {
            return self.remove_whole_dir(inner, to, path);
        }

        let target_hash = match self.backend(to).get_hash(path) {
            Ok(hash) => hash,
            Err(FsError::NotFound(_)) => {
                self.already_removed(inner, to, path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let expected = old_source_hash.or_else(|| inner.hashes[&to].get(path).cloned());
        if expected.as_deref() != Some(target_hash.as_str()) {
            // The target drifted since the deleted copy was recorded:
            // the surviving side becomes authoritative.
            self.handle_conflict(inner, path);
            self.create_object(inner, to, from, path)?;
            return Ok(());
        }

        match self.backend(to).unlink(path) {
            Ok(()) => {}
            Err(FsError::NotFound(_)) => {
                self.already_removed(inner, to, path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        inner.hashes.get_mut(&to).map(|h| h.remove(path));
        self.forget_hash(to, path);
        self.forget_hash(from, path);
        Ok(())
    }

    /// Recursively remove a directory, verifying each file against its
    /// remembered hash first.
    fn remove_whole_dir(
        &self,
        inner: &mut Inner,
        side: Side,
        dir_path: &Path,
    ) -> Result<(), SyncerError> {
        tracing::debug!(
            "{}: attempting to remove directory {} in {}",
            self.log_prefix,
            dir_path.display(),
            self.backend(side).backend_id()
        );
        let mut entries = self.backend(side).walk(dir_path)?;
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        for (path, attr) in entries {
            if attr.is_dir() {
                self.backend(side).rmdir(&path)?;
            } else {
                let current = self.backend(side).get_hash(&path)?;
                if inner.hashes[&side].get(&path) != Some(&current) {
                    tracing::warn!(
                        "{}: unexpected hash for {} in {}, not removing",
                        self.log_prefix,
                        path.display(),
                        self.backend(side).backend_id()
                    );
                    return Ok(());
                }
                self.backend(side).unlink(&path)?;
            }
            inner.hashes.get_mut(&side).map(|h| h.remove(&path));
            self.forget_hash(side, &path);
        }
        self.backend(side).rmdir(dir_path)?;
        Ok(())
    }

    /// Forget hashes of everything at or below a path.
    fn remove_subdir_paths(&self, inner: &mut Inner, side: Side, path: &Path) {
        let stale: Vec<PathBuf> = inner.hashes[&side]
            .keys()
            .filter(|known| *known == path || known.starts_with(path))
            .cloned()
            .collect();
        for known in stale {
            inner.hashes.get_mut(&side).map(|h| h.remove(&known));
            self.forget_hash(side, &known);
        }
    }

    fn already_removed(&self, inner: &mut Inner, side: Side, path: &Path) {
        tracing::warn!(
            "{}: removal of {} from {} skipped: already removed",
            self.log_prefix,
            path.display(),
            self.backend(side).backend_id()
        );
        self.remove_subdir_paths(inner, side, path);
    }

    fn handle_conflict(&self, inner: &mut Inner, path: &Path) {
        tracing::warn!(
            "{}: conflict between storages detected: storages {} and {} differ on file {}",
            self.log_prefix,
            self.source.backend_id(),
            self.target.backend_id(),
            path.display()
        );
        let conflict = SyncConflict {
            path: path.to_path_buf(),
            backend1: self.source.backend_id().to_string(),
            backend2: self.target.backend_id().to_string(),
        };
        self.notify_event(SyncEvent::Conflict(conflict.to_string()));
        inner.conflicts.push(conflict);
    }

    /* Hash memory */

    /// Last-known hash for a path: the in-memory map first, falling back
    /// to the persistent table.
    fn last_known_hash(&self, inner: &Inner, side: Side, path: &Path) -> Option<String> {
        if let Some(hash) = inner.hashes[&side].get(path) {
            return Some(hash.clone());
        }
        let db = self.db.as_ref()?;
        db.retrieve_hash(self.backend(side).backend_id(), path)
            .ok()
            .flatten()
            .map(|(hash, _token)| hash)
    }

    fn forget_hash(&self, side: Side, path: &Path) {
        if let Some(db) = &self.db {
            if let Err(e) = db.remove_hash(self.backend(side).backend_id(), path) {
                tracing::warn!("{}: hash db error: {}", self.log_prefix, e);
            }
        }
    }

    fn persist_hashes(&self, inner: &Inner) {
        let Some(db) = &self.db else {
            return;
        };
        for side in [Side::Source, Side::Target] {
            let entries: Vec<(PathBuf, String, Option<String>)> = inner.hashes[&side]
                .iter()
                .map(|(path, hash)| (path.clone(), hash.clone(), None))
                .collect();
            if let Err(e) = db.store_hashes(self.backend(side).backend_id(), &entries) {
                tracing::warn!("{}: hash db error: {}", self.log_prefix, e);
            }
        }
    }
}

impl std::fmt::Debug for NaiveSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NaiveSyncer")
            .field("source", &self.source.backend_id())
            .field("target", &self.target.backend_id())
            .field("state", &self.state.get())
            .finish()
    }
}
