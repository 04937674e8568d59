//! Storage backend interface.
//!
//! Every backend exposes the same VFS-shaped capability set; optional
//! operations default to [`FsError::Unsupported`], which the daemon maps to
//! `ENOSYS`. Backends must be internally thread-safe: the daemon never
//! wraps them in its own lock.

pub mod local;
pub mod static_backend;
pub mod watch;

pub use local::LocalStorageBackend;
pub use static_backend::StaticStorageBackend;
pub use watch::{FileEvent, FileEventType, StorageWatcher, WatchHandler};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

/// VFS-level errors, carrying enough to map onto an errno.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no entry: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("read-only storage: {0}")]
    ReadOnly(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("cross-storage rename")]
    CrossStorage,

    #[error("operation not supported")]
    Unsupported,

    #[error("unexpected content hash for {0}")]
    HashMismatch(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Map onto the errno returned through the FUSE callback interface.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::ReadOnly(_) => libc::EROFS,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::Exists(_) => libc::EEXIST,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::CrossStorage => libc::EXDEV,
            FsError::Unsupported => libc::ENOSYS,
            FsError::HashMismatch(_) => libc::EIO,
            FsError::Io(err) => match err.raw_os_error() {
                Some(errno) => errno,
                None => match err.kind() {
                    std::io::ErrorKind::NotFound => libc::ENOENT,
                    std::io::ErrorKind::PermissionDenied => libc::EACCES,
                    std::io::ErrorKind::AlreadyExists => libc::EEXIST,
                    _ => libc::EIO,
                },
            },
        }
    }

    pub fn not_found(path: &Path) -> Self {
        FsError::NotFound(path.display().to_string())
    }
}

/// Errors in backend construction and lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unsupported backend type: {0:?}")]
    Unsupported(String),

    #[error("invalid backend parameters: {0}")]
    Params(String),

    #[error("backend mount failed: {0}")]
    MountFailed(String),

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// File attributes: mode carries the file-type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub mode: u32,
    pub size: u64,
    pub timestamp: i64,
}

impl Attr {
    pub fn file(size: u64, timestamp: i64) -> Self {
        Self {
            mode: libc::S_IFREG as u32 | 0o644,
            size,
            timestamp,
        }
    }

    pub fn dir(timestamp: i64) -> Self {
        Self {
            mode: libc::S_IFDIR as u32 | 0o755,
            size: 0,
            timestamp,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    /// Attributes as seen through a read-only storage.
    pub fn read_only(mut self) -> Self {
        self.mode &= !0o222;
        self
    }
}

/// An open file handle.
pub trait FileHandle: Send {
    fn read(&mut self, len: usize, offset: u64) -> Result<Vec<u8>, FsError>;
    fn write(&mut self, data: &[u8], offset: u64) -> Result<usize, FsError>;
    fn ftruncate(&mut self, length: u64) -> Result<(), FsError>;
    fn fgetattr(&mut self) -> Result<Attr, FsError>;

    fn fsync(&mut self) -> Result<(), FsError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), FsError> {
        Ok(())
    }

    /// Called exactly once when the handle is closed.
    fn release(&mut self) -> Result<(), FsError> {
        Ok(())
    }
}

/// A subcontainer found by a catalog-style backend: the relative path of
/// the manifest file and its raw bytes.
#[derive(Debug, Clone)]
pub struct ChildStub {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// The storage backend interface.
///
/// `request_mount` is idempotent and must complete before any I/O;
/// `request_unmount` after the last I/O. Optional operations return
/// [`FsError::Unsupported`].
pub trait StorageBackend: Send + Sync {
    fn backend_type(&self) -> &'static str;

    /// The manifest fields this backend was constructed from, passed
    /// verbatim through the mount command.
    fn params(&self) -> &Mapping;

    fn backend_id(&self) -> &str;

    fn is_read_only(&self) -> bool {
        self.params()
            .get("read-only")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Backends serving reference containers are mounted eagerly instead
    /// of on first use.
    fn mount_reference_container(&self) -> bool {
        false
    }

    /// A hash of this backend's identity: params plus type. Used by the
    /// daemon to find an already-mounted instance of the same storage.
    fn instance_hash(&self) -> String {
        let bytes = crate::manifest::canonical_bytes(self.params()).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    fn request_mount(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn request_unmount(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn clear_cache(&self) {}

    /* VFS surface */

    fn getattr(&self, path: &Path) -> Result<Attr, FsError>;

    fn readdir(&self, path: &Path) -> Result<Vec<String>, FsError>;

    fn open(&self, path: &Path, flags: i32) -> Result<Box<dyn FileHandle>, FsError>;

    fn create(
        &self,
        _path: &Path,
        _flags: i32,
        _mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        Err(FsError::Unsupported)
    }

    fn mkdir(&self, _path: &Path) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn rmdir(&self, _path: &Path) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn unlink(&self, _path: &Path) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn rename(&self, _src: &Path, _dst: &Path) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn truncate(&self, _path: &Path, _length: u64) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn chmod(&self, _path: &Path, _mode: u32) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn chown(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn utimens(&self, _path: &Path, _atime: i64, _mtime: i64) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    /* Hashing */

    /// SHA-256 of the file contents, hex encoded. Backends with a cache
    /// key it by `(path, token)` and silently discard stale entries.
    fn get_hash(&self, path: &Path) -> Result<String, FsError> {
        compute_hash(self, path)
    }

    /// Opaque freshness marker for the hash cache; changes whenever the
    /// content may have changed.
    fn get_file_token(&self, path: &Path) -> Result<String, FsError> {
        let attr = self.getattr(path)?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory(path.display().to_string()));
        }
        Ok(format!("{}.{}", attr.timestamp, attr.size))
    }

    /// Open a handle whose writes land in a temporary file, committed by
    /// atomic rename only if the target still hashes to `expected_hash`.
    fn open_for_safe_replace(
        &self,
        _path: &Path,
        _flags: i32,
        _expected_hash: &str,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        Err(FsError::Unsupported)
    }

    /* Watching */

    /// Start the backend's own change watcher, if it has one. Returns
    /// false when the backend cannot watch (callers fall back to the
    /// daemon's own-operation events).
    fn start_watcher(&self, _handler: WatchHandler, _ignore_own: bool) -> Result<bool, FsError> {
        Ok(false)
    }

    fn stop_watcher(&self) {}

    /* Subcontainers */

    /// Enumerate subcontainer manifests (catalog backends only).
    fn get_children(&self, _query: Option<&str>) -> Result<Vec<ChildStub>, FsError> {
        Err(FsError::Unsupported)
    }

    fn start_subcontainer_watcher(&self, _handler: WatchHandler) -> Result<bool, FsError> {
        Ok(false)
    }

    fn stop_subcontainer_watcher(&self) {}

    /// Walk all entries below `start`, depth-first, yielding relative
    /// paths and attributes.
    fn walk(&self, start: &Path) -> Result<Vec<(PathBuf, Attr)>, FsError> {
        let mut result = Vec::new();
        let mut pending = vec![start.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for name in self.readdir(&dir)? {
                let path = dir.join(&name);
                let attr = match self.getattr(&path) {
                    Ok(attr) => attr,
                    Err(FsError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                if attr.is_dir() {
                    pending.push(path.clone());
                }
                result.push((path, attr));
            }
        }
        Ok(result)
    }
}

/// Hash a file by streaming it through its backend handle.
pub fn compute_hash(backend: &(impl StorageBackend + ?Sized), path: &Path) -> Result<String, FsError> {
    let attr = backend.getattr(path)?;
    if attr.is_dir() {
        return Err(FsError::IsADirectory(path.display().to_string()));
    }
    let mut handle = backend.open(path, libc::O_RDONLY)?;
    let mut hasher = Sha256::new();
    let mut offset = 0u64;
    loop {
        let block = handle.read(1024 * 1024, offset)?;
        if block.is_empty() {
            break;
        }
        offset += block.len() as u64;
        hasher.update(&block);
    }
    handle.release()?;
    Ok(hex::encode(hasher.finalize()))
}

/// In-memory hash cache keyed by `(path, token)`.
///
/// A mismatching token invalidates the entry silently; entries never
/// survive a backend remount (the cache lives inside the backend).
#[derive(Debug, Default)]
pub struct HashCache {
    entries: parking_lot::Mutex<HashMap<PathBuf, (String, String)>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path, token: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            Some((hash, cached_token)) if cached_token == token => Some(hash.clone()),
            Some(_) => {
                entries.remove(path);
                None
            }
            None => None,
        }
    }

    pub fn store(&self, path: &Path, hash: String, token: String) {
        self.entries.lock().insert(path.to_path_buf(), (hash, token));
    }

    pub fn invalidate(&self, path: &Path) {
        self.entries.lock().remove(path);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Backend constructor registry, keyed by the manifest `type` tag.
pub struct BackendRegistry {
    constructors: HashMap<&'static str, fn(Mapping) -> Result<Arc<dyn StorageBackend>, BackendError>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(local::TYPE, |params| {
            Ok(Arc::new(LocalStorageBackend::from_params(params)?))
        });
        registry.register(static_backend::TYPE, |params| {
            Ok(Arc::new(StaticStorageBackend::from_params(params)?))
        });
        registry
    }

    pub fn register(
        &mut self,
        backend_type: &'static str,
        constructor: fn(Mapping) -> Result<Arc<dyn StorageBackend>, BackendError>,
    ) {
        self.constructors.insert(backend_type, constructor);
    }

    /// Instantiate a backend from its manifest params.
    pub fn construct(&self, params: Mapping) -> Result<Arc<dyn StorageBackend>, BackendError> {
        let backend_type = params
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Params("missing backend type".into()))?;
        let constructor = self
            .constructors
            .get(backend_type)
            .ok_or_else(|| BackendError::Unsupported(backend_type.to_string()))?;
        constructor(params)
    }

    pub fn supports(&self, backend_type: &str) -> bool {
        self.constructors.contains_key(backend_type)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_modes() {
        let file = Attr::file(10, 0);
        assert!(!file.is_dir());
        assert_eq!(file.mode & 0o777, 0o644);
        assert_eq!(file.read_only().mode & 0o777, 0o444);

        let dir = Attr::dir(0);
        assert!(dir.is_dir());
    }

    #[test]
    fn test_hash_cache_token_mismatch() {
        let cache = HashCache::new();
        let path = Path::new("a/b");
        cache.store(path, "hash1".into(), "token1".into());
        assert_eq!(cache.get(path, "token1").as_deref(), Some("hash1"));
        // Stale token discards the entry.
        assert_eq!(cache.get(path, "token2"), None);
        assert_eq!(cache.get(path, "token1"), None);
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = BackendRegistry::with_defaults();
        let mut params = Mapping::new();
        params.insert("type".into(), "antigravity".into());
        assert!(matches!(
            registry.construct(params),
            Err(BackendError::Unsupported(_))
        ));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(FsError::Unsupported.errno(), libc::ENOSYS);
        assert_eq!(FsError::CrossStorage.errno(), libc::EXDEV);
        let io = FsError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(io.errno(), libc::ENOENT);
    }
}
