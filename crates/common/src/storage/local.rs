//! Local-directory storage backend.
//!
//! Serves a directory tree rooted at the `location` param. Supports the
//! full mutable VFS surface, safe-replace handles, content hashing with a
//! token-keyed cache, a notify-based change watcher and subcontainer
//! enumeration through a manifest pattern.

use std::collections::HashMap;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use notify::{RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use crate::obj::derive_backend_id;

use super::watch::{FileEvent, FileEventType, StorageWatcher, WatchHandler, WAIT_CYCLE};
use super::{Attr, BackendError, ChildStub, FileHandle, FsError, HashCache, StorageBackend};

pub const TYPE: &str = "local";

/// Events for paths the backend itself touched within this window are
/// considered "own" and may be filtered out.
const OWN_WRITE_WINDOW: Duration = Duration::from_secs(2);

type OwnWrites = Arc<Mutex<HashMap<PathBuf, Instant>>>;

pub struct LocalStorageBackend {
    params: Mapping,
    backend_id: String,
    root: PathBuf,
    hash_cache: HashCache,
    own_writes: OwnWrites,
    watcher: Mutex<Option<(notify::RecommendedWatcher, StorageWatcher)>>,
    children_watcher: Mutex<Option<(notify::RecommendedWatcher, StorageWatcher)>>,
}

impl LocalStorageBackend {
    pub fn from_params(params: Mapping) -> Result<Self, BackendError> {
        let location = params
            .get("location")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Params("local storage needs a location".into()))?;
        let backend_id = match params.get("backend-id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => derive_backend_id(&params)
                .map_err(|e| BackendError::Params(e.to_string()))?,
        };
        Ok(Self {
            root: PathBuf::from(location),
            backend_id,
            params,
            hash_cache: HashCache::new(),
            own_writes: Arc::new(Mutex::new(HashMap::new())),
            watcher: Mutex::new(None),
            children_watcher: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, FsError> {
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::RootDir => {}
                _ => return Err(FsError::PermissionDenied(path.display().to_string())),
            }
        }
        let relative = path.strip_prefix("/").unwrap_or(path);
        Ok(self.root.join(relative))
    }

    fn mark_own_write(&self, path: &Path) {
        self.own_writes
            .lock()
            .insert(path.to_path_buf(), Instant::now());
    }

    fn attr_from_metadata(metadata: &std::fs::Metadata) -> Attr {
        Attr {
            mode: metadata.mode(),
            size: metadata.size(),
            timestamp: metadata.mtime(),
        }
    }

    fn manifest_globs(&self) -> Result<GlobSet, FsError> {
        let pattern = self
            .params
            .get("manifest-pattern")
            .and_then(Value::as_mapping);
        let mut builder = GlobSetBuilder::new();
        match pattern {
            Some(mapping) if mapping.get("type").and_then(Value::as_str) == Some("glob") => {
                let path = mapping
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or("/*.yaml");
                let glob = path.replace("{path}", "*").replace("{object-type}", "*");
                builder.add(
                    GlobBuilder::new(&glob)
                        .build()
                        .map_err(|_| FsError::Unsupported)?,
                );
            }
            Some(mapping) if mapping.get("type").and_then(Value::as_str) == Some("list") => {
                for path in mapping
                    .get("paths")
                    .and_then(Value::as_sequence)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                {
                    builder.add(
                        GlobBuilder::new(path.trim_start_matches('/'))
                            .build()
                            .map_err(|_| FsError::Unsupported)?,
                    );
                }
            }
            _ => {
                builder.add(
                    GlobBuilder::new("**/*.yaml")
                        .build()
                        .map_err(|_| FsError::Unsupported)?,
                );
            }
        }
        builder.build().map_err(|_| FsError::Unsupported)
    }

    /// Spawn a notify watcher over the backend root, translating raw
    /// events to relative [`FileEvent`]s through an optional path filter.
    fn spawn_notify_watcher(
        &self,
        handler: WatchHandler,
        filter: Option<GlobSet>,
        ignore_own: bool,
    ) -> Result<(notify::RecommendedWatcher, StorageWatcher), FsError> {
        let (tx, rx) = flume::unbounded::<notify::Event>();
        let mut notify_watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = tx.send(event);
                }
            })
            .map_err(|e| FsError::Io(std::io::Error::other(e)))?;
        notify_watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| FsError::Io(std::io::Error::other(e)))?;

        let root = self.root.clone();
        let own_writes = self.own_writes.clone();
        let watcher = StorageWatcher::spawn(
            &self.backend_id,
            move || {
                let first = rx.recv_timeout(WAIT_CYCLE).ok()?;
                let mut raw = vec![first];
                while let Ok(more) = rx.try_recv() {
                    raw.push(more);
                }

                let now = Instant::now();
                let own = own_writes.lock();
                let mut events = Vec::new();
                for event in raw {
                    let event_type = match event.kind {
                        notify::EventKind::Create(_) => FileEventType::Create,
                        notify::EventKind::Modify(_) => FileEventType::Modify,
                        notify::EventKind::Remove(_) => FileEventType::Delete,
                        _ => continue,
                    };
                    for path in event.paths {
                        let relative = match path.strip_prefix(&root) {
                            Ok(relative) => relative.to_path_buf(),
                            Err(_) => continue,
                        };
                        if ignore_own {
                            if let Some(touched) = own.get(&relative) {
                                if now.duration_since(*touched) < OWN_WRITE_WINDOW {
                                    continue;
                                }
                            }
                        }
                        if let Some(filter) = &filter {
                            if !filter.is_match(&relative) {
                                continue;
                            }
                        }
                        events.push(FileEvent::new(event_type, relative));
                    }
                }
                Some(events)
            },
            handler,
        );
        Ok((notify_watcher, watcher))
    }
}

impl StorageBackend for LocalStorageBackend {
    fn backend_type(&self) -> &'static str {
        TYPE
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn request_mount(&self) -> Result<(), BackendError> {
        if !self.root.is_dir() {
            return Err(BackendError::MountFailed(format!(
                "location does not exist: {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn request_unmount(&self) -> Result<(), BackendError> {
        self.stop_watcher();
        self.stop_subcontainer_watcher();
        self.clear_cache();
        Ok(())
    }

    fn clear_cache(&self) {
        self.hash_cache.clear();
    }

    fn getattr(&self, path: &Path) -> Result<Attr, FsError> {
        let local = self.resolve(path)?;
        let metadata = std::fs::metadata(&local).map_err(|_| FsError::not_found(path))?;
        let mut attr = Self::attr_from_metadata(&metadata);
        if self.is_read_only() {
            attr = attr.read_only();
        }
        Ok(attr)
    }

    fn readdir(&self, path: &Path) -> Result<Vec<String>, FsError> {
        let local = self.resolve(path)?;
        if !local.exists() {
            return Err(FsError::not_found(path));
        }
        if !local.is_dir() {
            return Err(FsError::NotADirectory(path.display().to_string()));
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&local)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn open(&self, path: &Path, flags: i32) -> Result<Box<dyn FileHandle>, FsError> {
        let local = self.resolve(path)?;
        let writable = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        if writable && self.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&local)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => FsError::not_found(path),
                _ => FsError::Io(e),
            })?;
        Ok(Box::new(LocalFile {
            file,
            path: path.to_path_buf(),
            own_writes: self.own_writes.clone(),
        }))
    }

    fn create(&self, path: &Path, _flags: i32, mode: u32) -> Result<Box<dyn FileHandle>, FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        let local = self.resolve(path)?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&local)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => FsError::Exists(path.display().to_string()),
                std::io::ErrorKind::NotFound => FsError::not_found(path),
                _ => FsError::Io(e),
            })?;
        self.mark_own_write(path);
        Ok(Box::new(LocalFile {
            file,
            path: path.to_path_buf(),
            own_writes: self.own_writes.clone(),
        }))
    }

    fn mkdir(&self, path: &Path) -> Result<(), FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        let local = self.resolve(path)?;
        std::fs::create_dir(&local).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => FsError::Exists(path.display().to_string()),
            _ => FsError::Io(e),
        })?;
        self.mark_own_write(path);
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> Result<(), FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        let local = self.resolve(path)?;
        std::fs::remove_dir(&local).map_err(FsError::Io)?;
        self.mark_own_write(path);
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<(), FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        let local = self.resolve(path)?;
        std::fs::remove_file(&local).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FsError::not_found(path),
            _ => FsError::Io(e),
        })?;
        self.hash_cache.invalidate(path);
        self.mark_own_write(path);
        Ok(())
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly(src.display().to_string()));
        }
        let local_src = self.resolve(src)?;
        let local_dst = self.resolve(dst)?;
        std::fs::rename(&local_src, &local_dst).map_err(FsError::Io)?;
        self.hash_cache.invalidate(src);
        self.hash_cache.invalidate(dst);
        self.mark_own_write(src);
        self.mark_own_write(dst);
        Ok(())
    }

    fn truncate(&self, path: &Path, length: u64) -> Result<(), FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        let local = self.resolve(path)?;
        let file = std::fs::OpenOptions::new().write(true).open(&local)?;
        file.set_len(length)?;
        self.hash_cache.invalidate(path);
        self.mark_own_write(path);
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        use std::os::unix::fs::PermissionsExt;
        let local = self.resolve(path)?;
        std::fs::set_permissions(&local, std::fs::Permissions::from_mode(mode))?;
        self.mark_own_write(path);
        Ok(())
    }

    fn utimens(&self, path: &Path, _atime: i64, _mtime: i64) -> Result<(), FsError> {
        // Timestamps are taken from the underlying filesystem; accept the
        // call so editors relying on utimens keep working.
        let local = self.resolve(path)?;
        if !local.exists() {
            return Err(FsError::not_found(path));
        }
        Ok(())
    }

    fn get_hash(&self, path: &Path) -> Result<String, FsError> {
        let token = self.get_file_token(path)?;
        if let Some(hash) = self.hash_cache.get(path, &token) {
            return Ok(hash);
        }
        let hash = super::compute_hash(self, path)?;
        self.hash_cache.store(path, hash.clone(), token);
        Ok(hash)
    }

    fn open_for_safe_replace(
        &self,
        path: &Path,
        _flags: i32,
        expected_hash: &str,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        let target = self.resolve(path)?;
        let file_name = target
            .file_name()
            .ok_or_else(|| FsError::not_found(path))?
            .to_string_lossy()
            .into_owned();
        let tmp_path = target.with_file_name(format!(".{}.wltmp", file_name));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        self.mark_own_write(path);
        Ok(Box::new(SafeReplaceFile {
            file,
            tmp_path,
            target,
            rel_path: path.to_path_buf(),
            expected_hash: expected_hash.to_string(),
            own_writes: self.own_writes.clone(),
            done: false,
        }))
    }

    fn start_watcher(&self, handler: WatchHandler, ignore_own: bool) -> Result<bool, FsError> {
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return Ok(true);
        }
        *guard = Some(self.spawn_notify_watcher(handler, None, ignore_own)?);
        Ok(true)
    }

    fn stop_watcher(&self) {
        if let Some((notify_watcher, mut watcher)) = self.watcher.lock().take() {
            drop(notify_watcher);
            watcher.stop();
        }
    }

    fn get_children(&self, query: Option<&str>) -> Result<Vec<ChildStub>, FsError> {
        let globs = self.manifest_globs()?;
        let query_glob = match query {
            Some(pattern) if pattern != "*" => Some(
                GlobBuilder::new(pattern)
                    .build()
                    .map_err(|_| FsError::Unsupported)?
                    .compile_matcher(),
            ),
            _ => None,
        };

        let mut children = Vec::new();
        for (path, attr) in self.walk(Path::new(""))? {
            if attr.is_dir() {
                continue;
            }
            let absolute = Path::new("/").join(&path);
            if !globs.is_match(&absolute) && !globs.is_match(&path) {
                continue;
            }
            if let Some(query_glob) = &query_glob {
                if !query_glob.is_match(&path) {
                    continue;
                }
            }
            let data = std::fs::read(self.resolve(&path)?)?;
            children.push(ChildStub { path, data });
        }
        Ok(children)
    }

    fn start_subcontainer_watcher(&self, handler: WatchHandler) -> Result<bool, FsError> {
        let mut guard = self.children_watcher.lock();
        if guard.is_some() {
            return Ok(true);
        }
        let globs = self.manifest_globs()?;
        *guard = Some(self.spawn_notify_watcher(handler, Some(globs), false)?);
        Ok(true)
    }

    fn stop_subcontainer_watcher(&self) {
        if let Some((notify_watcher, mut watcher)) = self.children_watcher.lock().take() {
            drop(notify_watcher);
            watcher.stop();
        }
    }
}

impl std::fmt::Debug for LocalStorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorageBackend")
            .field("backend_id", &self.backend_id)
            .field("root", &self.root)
            .finish()
    }
}

struct LocalFile {
    file: std::fs::File,
    path: PathBuf,
    own_writes: OwnWrites,
}

impl FileHandle for LocalFile {
    fn read(&mut self, len: usize, offset: u64) -> Result<Vec<u8>, FsError> {
        let mut buffer = vec![0u8; len];
        let read = self.file.read_at(&mut buffer, offset)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn write(&mut self, data: &[u8], offset: u64) -> Result<usize, FsError> {
        let written = self.file.write_at(data, offset)?;
        self.own_writes
            .lock()
            .insert(self.path.clone(), Instant::now());
        Ok(written)
    }

    fn ftruncate(&mut self, length: u64) -> Result<(), FsError> {
        self.file.set_len(length)?;
        Ok(())
    }

    fn fgetattr(&mut self) -> Result<Attr, FsError> {
        let metadata = self.file.metadata()?;
        Ok(LocalStorageBackend::attr_from_metadata(&metadata))
    }

    fn fsync(&mut self) -> Result<(), FsError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Writes to a temporary sibling; commits by atomic rename, but only when
/// the target still hashes to the value observed at open time.
struct SafeReplaceFile {
    file: std::fs::File,
    tmp_path: PathBuf,
    target: PathBuf,
    rel_path: PathBuf,
    expected_hash: String,
    own_writes: OwnWrites,
    done: bool,
}

impl FileHandle for SafeReplaceFile {
    fn read(&mut self, len: usize, offset: u64) -> Result<Vec<u8>, FsError> {
        let mut buffer = vec![0u8; len];
        let read = self.file.read_at(&mut buffer, offset)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn write(&mut self, data: &[u8], offset: u64) -> Result<usize, FsError> {
        Ok(self.file.write_at(data, offset)?)
    }

    fn ftruncate(&mut self, length: u64) -> Result<(), FsError> {
        self.file.set_len(length)?;
        Ok(())
    }

    fn fgetattr(&mut self) -> Result<Attr, FsError> {
        let metadata = self.file.metadata()?;
        Ok(LocalStorageBackend::attr_from_metadata(&metadata))
    }

    fn fsync(&mut self) -> Result<(), FsError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn release(&mut self) -> Result<(), FsError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.file.sync_all()?;

        if self.target.exists() && !self.expected_hash.is_empty() {
            let current = hash_local_file(&self.target)?;
            if current != self.expected_hash {
                let _ = std::fs::remove_file(&self.tmp_path);
                return Err(FsError::HashMismatch(self.rel_path.display().to_string()));
            }
        }
        std::fs::rename(&self.tmp_path, &self.target)?;
        self.own_writes
            .lock()
            .insert(self.rel_path.clone(), Instant::now());
        Ok(())
    }
}

impl Drop for SafeReplaceFile {
    fn drop(&mut self) {
        if !self.done {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

fn hash_local_file(path: &Path) -> Result<String, FsError> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut HasherWriter(&mut hasher))?;
    Ok(hex::encode(hasher.finalize()))
}

struct HasherWriter<'a>(&'a mut Sha256);

impl std::io::Write for HasherWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &Path) -> LocalStorageBackend {
        let mut params = Mapping::new();
        params.insert("type".into(), TYPE.into());
        params.insert("location".into(), dir.display().to_string().into());
        params.insert("backend-id".into(), "test-backend".into());
        LocalStorageBackend::from_params(params).unwrap()
    }

    #[test]
    fn test_basic_file_ops() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.request_mount().unwrap();

        let mut handle = backend
            .create(Path::new("hello.txt"), libc::O_WRONLY, 0o644)
            .unwrap();
        handle.write(b"hello world", 0).unwrap();
        handle.release().unwrap();

        let attr = backend.getattr(Path::new("hello.txt")).unwrap();
        assert!(!attr.is_dir());
        assert_eq!(attr.size, 11);

        let mut handle = backend.open(Path::new("hello.txt"), libc::O_RDONLY).unwrap();
        assert_eq!(handle.read(1024, 6).unwrap(), b"world");
        handle.release().unwrap();

        assert_eq!(backend.readdir(Path::new("")).unwrap(), vec!["hello.txt"]);

        backend.unlink(Path::new("hello.txt")).unwrap();
        assert!(matches!(
            backend.getattr(Path::new("hello.txt")),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_requires_parent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        assert!(backend
            .create(Path::new("missing/file.txt"), 0, 0o644)
            .is_err());
    }

    #[test]
    fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        assert!(matches!(
            backend.getattr(Path::new("../outside")),
            Err(FsError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_read_only_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"data").unwrap();
        let mut params = Mapping::new();
        params.insert("type".into(), TYPE.into());
        params.insert("location".into(), dir.path().display().to_string().into());
        params.insert("backend-id".into(), "ro".into());
        params.insert("read-only".into(), true.into());
        let backend = LocalStorageBackend::from_params(params).unwrap();

        assert!(matches!(
            backend.create(Path::new("new"), 0, 0o644),
            Err(FsError::ReadOnly(_))
        ));
        assert!(matches!(
            backend.unlink(Path::new("file")),
            Err(FsError::ReadOnly(_))
        ));
        assert!(backend.open(Path::new("file"), libc::O_RDONLY).is_ok());
        let attr = backend.getattr(Path::new("file")).unwrap();
        assert_eq!(attr.mode & 0o222, 0);
    }

    #[test]
    fn test_get_hash_cached_by_token() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        std::fs::write(dir.path().join("file"), b"aaaa").unwrap();

        let first = backend.get_hash(Path::new("file")).unwrap();
        assert_eq!(first, hex::encode(Sha256::digest(b"aaaa")));
        assert_eq!(backend.get_hash(Path::new("file")).unwrap(), first);
    }

    #[test]
    fn test_safe_replace_commits() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        std::fs::write(dir.path().join("file"), b"old").unwrap();
        let old_hash = backend.get_hash(Path::new("file")).unwrap();

        let mut handle = backend
            .open_for_safe_replace(Path::new("file"), libc::O_RDWR, &old_hash)
            .unwrap();
        handle.write(b"new content", 0).unwrap();
        handle.release().unwrap();

        assert_eq!(std::fs::read(dir.path().join("file")).unwrap(), b"new content");
    }

    #[test]
    fn test_safe_replace_aborts_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        std::fs::write(dir.path().join("file"), b"old").unwrap();
        let old_hash = backend.get_hash(Path::new("file")).unwrap();

        let mut handle = backend
            .open_for_safe_replace(Path::new("file"), libc::O_RDWR, &old_hash)
            .unwrap();
        handle.write(b"replacement", 0).unwrap();

        // Concurrent modification of the target.
        std::fs::write(dir.path().join("file"), b"changed meanwhile").unwrap();

        assert!(matches!(
            handle.release(),
            Err(FsError::HashMismatch(_))
        ));
        // Target was not clobbered.
        assert_eq!(
            std::fs::read(dir.path().join("file")).unwrap(),
            b"changed meanwhile"
        );
    }

    #[test]
    fn test_walk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"y").unwrap();

        let mut paths: Vec<String> = backend
            .walk(Path::new(""))
            .unwrap()
            .into_iter()
            .map(|(path, _)| path.display().to_string())
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["sub", "sub/inner.txt", "top.txt"]);
    }

    #[test]
    fn test_get_children_with_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".manifests")).unwrap();
        std::fs::write(dir.path().join(".manifests/a.container.yaml"), b"a: 1\n").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"no").unwrap();

        let mut params = Mapping::new();
        params.insert("type".into(), TYPE.into());
        params.insert("location".into(), dir.path().display().to_string().into());
        params.insert("backend-id".into(), "cat".into());
        let mut pattern = Mapping::new();
        pattern.insert("type".into(), "glob".into());
        pattern.insert("path".into(), "/.manifests/{path}.container.yaml".into());
        params.insert("manifest-pattern".into(), Value::Mapping(pattern));
        let backend = LocalStorageBackend::from_params(params).unwrap();

        let children = backend.get_children(None).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(
            children[0].path.display().to_string(),
            ".manifests/a.container.yaml"
        );
        assert_eq!(children[0].data, b"a: 1\n");
    }

    #[test]
    fn test_watcher_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let (tx, rx) = flume::unbounded();

        let started = backend
            .start_watcher(
                Arc::new(move |events: Vec<FileEvent>| {
                    let _ = tx.send(events);
                }),
                false,
            )
            .unwrap();
        assert!(started);

        std::fs::write(dir.path().join("watched.txt"), b"data").unwrap();

        let events = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no events received");
        assert!(events
            .iter()
            .any(|event| event.path == Path::new("watched.txt")));
        backend.stop_watcher();
    }
}
