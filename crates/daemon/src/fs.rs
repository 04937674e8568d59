//! The mount daemon core.
//!
//! [`WildlandFs`] owns the mount table and proxies VFS calls to the owning
//! backend through the conflict resolver. One mutex guards the table, the
//! resolver tree and the watch registries; it is held only across pure
//! in-memory operations, never across a backend call; backends are
//! required to be internally thread-safe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use common::control::{CommandError, CommandHandler, ConnectionHandle};
use common::storage::{
    Attr, BackendError, BackendRegistry, FileEvent, FileEventType, FileHandle, FsError,
    StorageBackend,
};

use crate::resolver::{ConflictResolver, Resolved, ResolverStorage};
use crate::watchers::WatchRegistry;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("storage already mounted under main path: {0}")]
    AlreadyMounted(String),

    #[error("storage not found: {0}")]
    NoStorage(i64),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("{0}")]
    Other(String),
}

/// A storage registered in the mount table. The backend's `mount()` is
/// deferred to first use unless the mount command said otherwise.
struct LazyStorage {
    backend: Arc<dyn StorageBackend>,
    initialized: bool,
}

struct FsState {
    storages: HashMap<i64, LazyStorage>,
    storage_extra: HashMap<i64, Value>,
    storage_paths: HashMap<i64, Vec<PathBuf>>,
    // Reverse index over each mount's primary path, for remount detection.
    main_paths: HashMap<PathBuf, i64>,
    storage_counter: i64,
    resolver: ConflictResolver,
    file_watchers: WatchRegistry,
    children_watchers: WatchRegistry,
    watch_counter: u64,
}

impl FsState {
    fn new() -> Self {
        Self {
            storages: HashMap::new(),
            storage_extra: HashMap::new(),
            storage_paths: HashMap::new(),
            main_paths: HashMap::new(),
            storage_counter: 1,
            resolver: ConflictResolver::new(),
            file_watchers: WatchRegistry::new("file"),
            children_watchers: WatchRegistry::new("children"),
            watch_counter: 1,
        }
    }
}

/// Deferred backend work collected while the state lock is held.
#[derive(Default)]
struct Cleanup {
    unmount: Vec<(Arc<dyn StorageBackend>, bool)>,
    stop_file_watcher: Vec<Arc<dyn StorageBackend>>,
    stop_children_watcher: Vec<Arc<dyn StorageBackend>>,
}

impl Cleanup {
    fn run(self) {
        for backend in self.stop_file_watcher {
            backend.stop_watcher();
        }
        for backend in self.stop_children_watcher {
            backend.stop_subcontainer_watcher();
        }
        for (backend, initialized) in self.unmount {
            if initialized {
                if let Err(e) = backend.request_unmount() {
                    tracing::warn!("backend {} unmount failed: {}", backend.backend_id(), e);
                }
            }
        }
    }
}

/// The daemon state machine: mount table, resolver, watches.
pub struct WildlandFs {
    inner: Arc<Mutex<FsState>>,
    registry: BackendRegistry,
    default_user: Option<String>,
}

impl WildlandFs {
    pub fn new(registry: BackendRegistry, default_user: Option<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FsState::new())),
            registry,
            default_user,
        }
    }

    fn access(&self) -> StorageAccess {
        StorageAccess {
            inner: self.inner.clone(),
        }
    }

    /* Mount table */

    /// Mount a storage under a set of paths. With `remount`, atomically
    /// replaces whatever is mounted at the primary path.
    pub fn mount_storage(
        &self,
        paths: Vec<PathBuf>,
        backend: Arc<dyn StorageBackend>,
        extra: Option<Value>,
        remount: bool,
        lazy: bool,
    ) -> Result<i64, DaemonError> {
        if paths.is_empty() {
            return Err(DaemonError::Other("mount needs at least one path".into()));
        }
        let main_path = paths[0].clone();
        let mut cleanup = Cleanup::default();

        let ident = {
            let mut state = self.inner.lock();
            tracing::debug!(
                "mounting storage (backend-id={}) under paths: {:?}",
                backend.backend_id(),
                paths
            );
            if let Some(current) = state.main_paths.get(&main_path).copied() {
                if !remount {
                    return Err(DaemonError::AlreadyMounted(main_path.display().to_string()));
                }
                tracing::debug!(
                    "unmounting current storage {} for main path {}",
                    current,
                    main_path.display()
                );
                Self::unmount_locked(&mut state, current, &mut cleanup)?;
            }

            let ident = state.storage_counter;
            state.storage_counter += 1;
            state.storages.insert(
                ident,
                LazyStorage {
                    backend: backend.clone(),
                    initialized: false,
                },
            );
            state
                .storage_extra
                .insert(ident, extra.unwrap_or_else(|| json!({})));
            state.storage_paths.insert(ident, paths.clone());
            state.main_paths.insert(main_path, ident);
            for path in &paths {
                state.resolver.mount(path, ident);
            }
            ident
        };
        cleanup.run();

        if !lazy || backend.mount_reference_container() {
            if let Err(e) = self.initialize_storage(ident) {
                // Roll the record back; a storage that cannot mount must
                // not shadow the previous one.
                let _ = self.unmount_storage(ident);
                return Err(e);
            }
        }
        Ok(ident)
    }

    pub fn unmount_storage(&self, storage_id: i64) -> Result<(), DaemonError> {
        let mut cleanup = Cleanup::default();
        {
            let mut state = self.inner.lock();
            Self::unmount_locked(&mut state, storage_id, &mut cleanup)?;
        }
        cleanup.run();
        Ok(())
    }

    fn unmount_locked(
        state: &mut FsState,
        storage_id: i64,
        cleanup: &mut Cleanup,
    ) -> Result<(), DaemonError> {
        let storage = state
            .storages
            .remove(&storage_id)
            .ok_or(DaemonError::NoStorage(storage_id))?;

        if state.file_watchers.remove_storage(storage_id) {
            cleanup.stop_file_watcher.push(storage.backend.clone());
        }
        if state.children_watchers.remove_storage(storage_id) {
            cleanup.stop_children_watcher.push(storage.backend.clone());
        }

        let paths = state.storage_paths.remove(&storage_id).unwrap_or_default();
        if let Some(main) = paths.first() {
            state.main_paths.remove(main);
        }
        for path in &paths {
            state.resolver.unmount(path, storage_id);
        }
        state.storage_extra.remove(&storage_id);
        cleanup.unmount.push((storage.backend, storage.initialized));
        tracing::debug!("unmounted storage {}", storage_id);
        Ok(())
    }

    /// Transition a lazily mounted storage to initialized, calling the
    /// backend's `mount()`. Failure surfaces at use time.
    fn initialize_storage(&self, storage_id: i64) -> Result<(), DaemonError> {
        let backend = {
            let state = self.inner.lock();
            let storage = state
                .storages
                .get(&storage_id)
                .ok_or(DaemonError::NoStorage(storage_id))?;
            if storage.initialized {
                return Ok(());
            }
            storage.backend.clone()
        };
        backend.request_mount().map_err(|e| {
            tracing::warn!(
                "backend {} not mounted due to error: {}",
                backend.backend_id(),
                e
            );
            DaemonError::Backend(BackendError::MountFailed(e.to_string()))
        })?;
        let mut state = self.inner.lock();
        if let Some(storage) = state.storages.get_mut(&storage_id) {
            storage.initialized = true;
        }
        Ok(())
    }

    fn backend(&self, storage_id: i64) -> Result<Arc<dyn StorageBackend>, FsError> {
        let backend = {
            let state = self.inner.lock();
            let storage = state
                .storages
                .get(&storage_id)
                .ok_or_else(|| FsError::NotFound(format!("storage {}", storage_id)))?;
            if storage.initialized {
                return Ok(storage.backend.clone());
            }
            storage.backend.clone()
        };
        self.initialize_storage(storage_id)
            .map_err(|e| FsError::Io(std::io::Error::other(e.to_string())))?;
        Ok(backend)
    }

    /* VFS surface */

    pub fn getattr(&self, path: &Path) -> Result<Attr, FsError> {
        let access = self.access();
        let (attr, _res) =
            self.with_resolver(|resolver| resolver.getattr_extended(&access, path))?;
        Ok(attr)
    }

    pub fn readdir(&self, path: &Path) -> Result<Vec<String>, FsError> {
        let access = self.access();
        self.with_resolver(|resolver| resolver.readdir(&access, path))
    }

    pub fn open(&self, path: &Path, flags: i32) -> Result<FileRef, FsError> {
        let writable = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        let (backend, res) = self.resolve_for_io(path, false, writable)?;
        let handle = backend.open(&res.relpath, flags)?;
        Ok(FileRef {
            handle,
            storage_id: res.ident,
            relpath: res.relpath,
            writable,
            created: false,
        })
    }

    pub fn create(&self, path: &Path, flags: i32, mode: u32) -> Result<FileRef, FsError> {
        let (backend, res) = self.resolve_for_io(path, true, true)?;
        let handle = backend.create(&res.relpath, flags, mode)?;
        Ok(FileRef {
            handle,
            storage_id: res.ident,
            relpath: res.relpath,
            writable: true,
            created: true,
        })
    }

    /// Close a handle, notifying watchers about a create or modify.
    pub fn release(&self, mut file: FileRef) -> Result<(), FsError> {
        file.handle.release()?;
        let event_type = if file.created {
            Some(FileEventType::Create)
        } else if file.writable {
            Some(FileEventType::Modify)
        } else {
            None
        };
        if let Some(event_type) = event_type {
            self.notify(file.storage_id, event_type, &file.relpath);
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, _mode: u32) -> Result<(), FsError> {
        let (backend, res) = self.resolve_for_io(path, true, true)?;
        backend.mkdir(&res.relpath)?;
        self.notify(res.ident, FileEventType::Create, &res.relpath);
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<(), FsError> {
        let (backend, res) = self.resolve_for_io(path, false, true)?;
        backend.rmdir(&res.relpath)?;
        self.notify(res.ident, FileEventType::Delete, &res.relpath);
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> Result<(), FsError> {
        let (backend, res) = self.resolve_for_io(path, false, true)?;
        backend.unlink(&res.relpath)?;
        self.notify(res.ident, FileEventType::Delete, &res.relpath);
        Ok(())
    }

    pub fn truncate(&self, path: &Path, length: u64) -> Result<(), FsError> {
        let (backend, res) = self.resolve_for_io(path, false, true)?;
        backend.truncate(&res.relpath, length)?;
        self.notify(res.ident, FileEventType::Modify, &res.relpath);
        Ok(())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        let (backend, res) = self.resolve_for_io(path, false, true)?;
        backend.chmod(&res.relpath, mode)?;
        self.notify(res.ident, FileEventType::Modify, &res.relpath);
        Ok(())
    }

    pub fn utimens(&self, path: &Path, atime: i64, mtime: i64) -> Result<(), FsError> {
        let (backend, res) = self.resolve_for_io(path, false, true)?;
        backend.utimens(&res.relpath, atime, mtime)?;
        self.notify(res.ident, FileEventType::Modify, &res.relpath);
        Ok(())
    }

    /// Rename within one storage; crossing storages fails with `EXDEV`.
    pub fn rename(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        let (backend, res_src) = self.resolve_for_io(src, false, true)?;
        let (_, res_dst) = self.resolve_for_io(dst, true, true)?;
        if res_src.ident != res_dst.ident {
            return Err(FsError::CrossStorage);
        }
        backend.rename(&res_src.relpath, &res_dst.relpath)?;
        self.notify(res_src.ident, FileEventType::Modify, &res_src.relpath);
        self.notify(res_dst.ident, FileEventType::Create, &res_dst.relpath);
        Ok(())
    }

    /// Resolve a path for I/O. With `parent`, the parent directory is
    /// resolved instead (creating entries). A path no storage owns fails
    /// `EACCES` (or `EROFS` for mutating operations, since the only
    /// unowned-but-existing nodes are synthetic directories.
    fn resolve_for_io(
        &self,
        path: &Path,
        parent: bool,
        modify: bool,
    ) -> Result<(Arc<dyn StorageBackend>, Resolved), FsError> {
        let access = self.access();
        let lookup = if parent {
            path.parent().unwrap_or(Path::new("/"))
        } else {
            path
        };
        let resolved = self
            .with_resolver(|resolver| resolver.getattr_extended(&access, lookup))
            .and_then(|(_, res)| {
                res.ok_or_else(|| FsError::PermissionDenied(path.display().to_string()))
            });
        let res = match resolved {
            Ok(res) => res,
            Err(FsError::PermissionDenied(p)) if modify => {
                return Err(FsError::ReadOnly(p));
            }
            Err(e) => return Err(e),
        };

        let relpath = if parent {
            match path.file_name() {
                Some(name) => res.relpath.join(name),
                None => res.relpath.clone(),
            }
        } else {
            res.relpath.clone()
        };

        let backend = self.backend(res.ident)?;
        if modify && backend.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        Ok((
            backend,
            Resolved {
                ident: res.ident,
                relpath,
            },
        ))
    }

    fn with_resolver<T>(
        &self,
        run: impl FnOnce(&ConflictResolver) -> Result<T, FsError>,
    ) -> Result<T, FsError> {
        // Storage callbacks re-enter the state lock through
        // StorageAccess, so resolution cannot run under it. The prefix
        // tree is small (one node per mount path component): snapshot it
        // under the lock, resolve against the copy.
        let snapshot = self.inner.lock().resolver.clone();
        run(&snapshot)
    }

    /// Send an event for an operation the daemon itself performed.
    fn notify(&self, storage_id: i64, event_type: FileEventType, relpath: &Path) {
        let state = self.inner.lock();
        state
            .file_watchers
            .notify_own_operation(storage_id, event_type, relpath);
        state
            .children_watchers
            .notify_own_operation(storage_id, event_type, relpath);
    }

    /* Control commands */

    pub fn paths(&self) -> HashMap<String, Vec<i64>> {
        let state = self.inner.lock();
        let mut result: HashMap<String, Vec<i64>> = HashMap::new();
        for (ident, paths) in &state.storage_paths {
            for path in paths {
                result
                    .entry(path.display().to_string())
                    .or_default()
                    .push(*ident);
            }
        }
        for idents in result.values_mut() {
            idents.sort();
        }
        result
    }

    pub fn info(&self) -> Value {
        let state = self.inner.lock();
        let mut result = serde_json::Map::new();
        for (ident, storage) in &state.storages {
            let paths: Vec<String> = state
                .storage_paths
                .get(ident)
                .map(|paths| paths.iter().map(|p| p.display().to_string()).collect())
                .unwrap_or_default();
            result.insert(
                ident.to_string(),
                json!({
                    "paths": paths,
                    "type": storage.backend.backend_type(),
                    "extra": state.storage_extra.get(ident).cloned().unwrap_or(json!({})),
                }),
            );
        }
        Value::Object(result)
    }

    pub fn status(&self) -> Value {
        match &self.default_user {
            Some(user) => json!({ "default-user": user }),
            None => json!({}),
        }
    }

    pub fn dirinfo(&self, path: &Path) -> Value {
        let idents = {
            let state = self.inner.lock();
            state.resolver.find_storage_ids(path)
        };
        let mut result = Vec::new();
        for ident in idents {
            let Ok(backend) = self.backend(ident) else {
                continue;
            };
            let params = common::manifest::yaml_to_json(&serde_yaml::Value::Mapping(
                backend.params().clone(),
            ))
            .unwrap_or(json!({}));
            result.push(json!({
                "storage": {
                    "container-path": params.get("container-path").cloned().unwrap_or(Value::Null),
                    "backend-id": backend.backend_id(),
                    "owner": params.get("owner").cloned().unwrap_or(Value::Null),
                    "read-only": backend.is_read_only(),
                    "hash": backend.instance_hash(),
                    "id": ident,
                }
            }));
        }
        Value::Array(result)
    }

    pub fn fileinfo(&self, path: &Path) -> Value {
        let access = self.access();
        let resolved = self.with_resolver(|resolver| resolver.getattr_extended(&access, path));
        let (attr, res) = match resolved {
            Ok((attr, Some(res))) => (attr, res),
            _ => return json!({}),
        };
        if attr.is_dir() {
            return json!({});
        }
        let Ok(backend) = self.backend(res.ident) else {
            return json!({});
        };
        let params = common::manifest::yaml_to_json(&serde_yaml::Value::Mapping(
            backend.params().clone(),
        ))
        .unwrap_or(json!({}));
        let token = backend.get_file_token(&res.relpath).ok();
        json!({
            "storage": {
                "container-path": params.get("container-path").cloned().unwrap_or(Value::Null),
                "backend-id": backend.backend_id(),
                "owner": params.get("owner").cloned().unwrap_or(Value::Null),
                "read-only": backend.is_read_only(),
                "hash": backend.instance_hash(),
                "id": res.ident,
            },
            "token": token,
        })
    }

    pub fn clear_cache(&self, storage_id: Option<i64>) -> Result<(), DaemonError> {
        let backends: Vec<Arc<dyn StorageBackend>> = {
            let state = self.inner.lock();
            match storage_id {
                Some(ident) => {
                    let storage = state
                        .storages
                        .get(&ident)
                        .ok_or(DaemonError::NoStorage(ident))?;
                    vec![storage.backend.clone()]
                }
                None => state
                    .storages
                    .values()
                    .map(|storage| storage.backend.clone())
                    .collect(),
            }
        };
        for backend in backends {
            tracing::debug!("clearing cache for backend {}", backend.backend_id());
            backend.clear_cache();
        }
        Ok(())
    }

    /// Register a file watch. Starts the backend's own watcher when this
    /// is the storage's first watch and the backend supports watching.
    pub fn add_watch(
        &self,
        storage_id: i64,
        pattern: &str,
        ignore_own: bool,
        handler: Arc<ConnectionHandle>,
    ) -> Result<u64, DaemonError> {
        if pattern.starts_with('/') {
            return Err(DaemonError::Other("pattern should not start with /".into()));
        }
        let (watch_id, first, backend) = {
            let mut state = self.inner.lock();
            let storage = state
                .storages
                .get(&storage_id)
                .ok_or(DaemonError::NoStorage(storage_id))?;
            let backend = storage.backend.clone();
            let watch_id = state.watch_counter;
            state.watch_counter += 1;
            let (watch_id, first) = state
                .file_watchers
                .add_watch(watch_id, storage_id, pattern, handler.clone())
                .map_err(|e| DaemonError::Other(format!("invalid pattern: {}", e)))?;
            (watch_id, first, backend)
        };

        // Connection gone: release the watch.
        let inner = self.inner.clone();
        handler.on_close(move || {
            let stop = {
                let mut state = inner.lock();
                state.file_watchers.remove_watch(watch_id)
            };
            let _ = stop;
        });

        if first {
            let inner = self.inner.clone();
            let started = backend
                .start_watcher(
                    Arc::new(move |events: Vec<FileEvent>| {
                        let state = inner.lock();
                        state.file_watchers.dispatch(storage_id, &events);
                    }),
                    ignore_own,
                )
                .unwrap_or(false);
            if started {
                tracing::debug!("started backend watcher for storage {}", storage_id);
                self.inner.lock().file_watchers.watcher_started(storage_id);
            }
        }
        Ok(watch_id)
    }

    /// Register a subcontainer watch against an already-mounted storage,
    /// identified by its params hash.
    pub fn add_subcontainer_watch(
        &self,
        backend_params_hash: &str,
        handler: Arc<ConnectionHandle>,
    ) -> Result<u64, DaemonError> {
        let (watch_id, first, storage_id, backend) = {
            let mut state = self.inner.lock();
            let found = state
                .storages
                .iter()
                .find(|(_, storage)| storage.backend.instance_hash() == backend_params_hash)
                .map(|(ident, storage)| (*ident, storage.backend.clone()));
            let (storage_id, backend) = found.ok_or_else(|| {
                DaemonError::Other(format!("unknown storage {}", backend_params_hash))
            })?;
            let watch_id = state.watch_counter;
            state.watch_counter += 1;
            let (watch_id, first) = state
                .children_watchers
                .add_watch(watch_id, storage_id, "*", handler.clone())
                .map_err(|e| DaemonError::Other(format!("invalid pattern: {}", e)))?;
            (watch_id, first, storage_id, backend)
        };

        let inner = self.inner.clone();
        handler.on_close(move || {
            let mut state = inner.lock();
            let _ = state.children_watchers.remove_watch(watch_id);
        });

        if first {
            let inner = self.inner.clone();
            let started = backend
                .start_subcontainer_watcher(Arc::new(move |events: Vec<FileEvent>| {
                    let state = inner.lock();
                    state.children_watchers.dispatch(storage_id, &events);
                }))
                .unwrap_or(false);
            if started {
                self.inner
                    .lock()
                    .children_watchers
                    .watcher_started(storage_id);
            }
        }
        Ok(watch_id)
    }
}

/// An open file tracked by the daemon: the backend handle plus what the
/// release-time watcher notification needs.
pub struct FileRef {
    pub handle: Box<dyn FileHandle>,
    pub storage_id: i64,
    pub relpath: PathBuf,
    pub writable: bool,
    pub created: bool,
}

/// Resolver-side storage access: takes the state lock only long enough to
/// clone the backend handle, then calls into it unlocked.
struct StorageAccess {
    inner: Arc<Mutex<FsState>>,
}

impl StorageAccess {
    fn backend(&self, ident: i64) -> Result<(Arc<dyn StorageBackend>, bool), FsError> {
        let state = self.inner.lock();
        let storage = state
            .storages
            .get(&ident)
            .ok_or_else(|| FsError::NotFound(format!("storage {}", ident)))?;
        Ok((storage.backend.clone(), storage.initialized))
    }

    fn ready_backend(&self, ident: i64) -> Result<Arc<dyn StorageBackend>, FsError> {
        let (backend, initialized) = self.backend(ident)?;
        if !initialized {
            backend
                .request_mount()
                .map_err(|e| FsError::Io(std::io::Error::other(e.to_string())))?;
            let mut state = self.inner.lock();
            if let Some(storage) = state.storages.get_mut(&ident) {
                storage.initialized = true;
            }
        }
        Ok(backend)
    }
}

impl ResolverStorage for StorageAccess {
    fn storage_getattr(&self, ident: i64, relpath: &Path) -> Result<Attr, FsError> {
        let backend = self.ready_backend(ident)?;
        let attr = backend.getattr(relpath)?;
        Ok(if backend.is_read_only() {
            attr.read_only()
        } else {
            attr
        })
    }

    fn storage_readdir(&self, ident: i64, relpath: &Path) -> Result<Vec<String>, FsError> {
        let backend = self.ready_backend(ident)?;
        backend.readdir(relpath)
    }
}

/* Control protocol dispatch */

impl CommandHandler for WildlandFs {
    fn handle(
        &self,
        cmd: &str,
        args: Value,
        conn: &Arc<ConnectionHandle>,
    ) -> Result<Value, CommandError> {
        match cmd {
            "mount" => self.cmd_mount(args),
            "unmount" => {
                let storage_id = require_i64(&args, "storage-id")?;
                self.unmount_storage(storage_id)
                    .map_err(|e| CommandError::new("WildlandError", e))?;
                Ok(Value::Null)
            }
            "clear-cache" => {
                let storage_id = args.get("storage-id").and_then(Value::as_i64);
                self.clear_cache(storage_id)
                    .map_err(|e| CommandError::new("WildlandError", e))?;
                Ok(Value::Null)
            }
            "paths" => Ok(serde_json::to_value(self.paths())
                .map_err(|e| CommandError::new("ControlError", e))?),
            "info" => Ok(self.info()),
            "status" => Ok(self.status()),
            "dirinfo" => {
                let path = require_str(&args, "path")?;
                Ok(self.dirinfo(Path::new(&path)))
            }
            "fileinfo" => {
                let path = require_str(&args, "path")?;
                Ok(self.fileinfo(Path::new(&path)))
            }
            "add-watch" => {
                let storage_id = require_i64(&args, "storage-id")?;
                let pattern = require_str(&args, "pattern")?;
                let ignore_own = args
                    .get("ignore-own")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let watch_id = self
                    .add_watch(storage_id, &pattern, ignore_own, conn.clone())
                    .map_err(|e| CommandError::new("WildlandError", e))?;
                Ok(json!(watch_id))
            }
            "add-subcontainer-watch" => {
                let params = args
                    .get("backend-param")
                    .cloned()
                    .ok_or_else(|| CommandError::control("expecting backend-param"))?;
                let backend = self
                    .construct_backend(&params)
                    .map_err(|e| CommandError::new("WildlandError", e))?;
                let watch_id = self
                    .add_subcontainer_watch(&backend.instance_hash(), conn.clone())
                    .map_err(|e| CommandError::new("WildlandError", e))?;
                Ok(json!(watch_id))
            }
            "test" => Ok(json!({ "kwargs": args })),
            other => Err(CommandError::control(format!("unknown command: {}", other))),
        }
    }
}

impl WildlandFs {
    fn construct_backend(&self, params: &Value) -> Result<Arc<dyn StorageBackend>, DaemonError> {
        let yaml: serde_yaml::Value = serde_yaml::to_value(params)
            .map_err(|e| DaemonError::Other(format!("invalid storage params: {}", e)))?;
        let mapping = match yaml {
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => return Err(DaemonError::Other("storage params must be a mapping".into())),
        };
        Ok(self.registry.construct(mapping)?)
    }

    /// The `mount` command: insert every item, aggregating per-item
    /// errors; one bad storage does not stop the batch.
    fn cmd_mount(&self, args: Value) -> Result<Value, CommandError> {
        let items = args
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| CommandError::control("expecting an items list"))?;
        let lazy = args.get("lazy").and_then(Value::as_bool).unwrap_or(true);

        let mut errors = Vec::new();
        for item in items {
            if let Err(e) = self.mount_item(item, lazy) {
                let backend_id = item
                    .get("storage")
                    .and_then(|storage| storage.get("backend-id"))
                    .and_then(Value::as_str)
                    .unwrap_or("?");
                tracing::error!("backend {} not mounted: {}", backend_id, e);
                errors.push(format!("{}: {}", backend_id, e));
            }
        }
        if !errors.is_empty() {
            return Err(CommandError::new("WildlandError", errors.join("; ")));
        }
        Ok(Value::Null)
    }

    fn mount_item(&self, item: &Value, lazy: bool) -> Result<i64, DaemonError> {
        let paths: Vec<PathBuf> = item
            .get("paths")
            .and_then(Value::as_array)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(Value::as_str)
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
        let storage_params = item
            .get("storage")
            .cloned()
            .ok_or_else(|| DaemonError::Other("mount item needs storage params".into()))?;
        let backend = self.construct_backend(&storage_params)?;
        let extra = item.get("extra").cloned().filter(|v| !v.is_null());
        let remount = item
            .get("remount")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.mount_storage(paths, backend, extra, remount, lazy)
    }
}

fn require_str(args: &Value, name: &str) -> Result<String, CommandError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CommandError::control(format!("expecting {:?}", name)))
}

fn require_i64(args: &Value, name: &str) -> Result<i64, CommandError> {
    args.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| CommandError::control(format!("expecting {:?}", name)))
}
