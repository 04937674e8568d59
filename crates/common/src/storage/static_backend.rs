//! Static in-memory storage backend.
//!
//! Serves a fixed tree described inline in the storage params under
//! `content`: nested mappings are directories, strings are file bodies.
//! Always read-only. Used by tests and for pseudomanifest files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_yaml::{Mapping, Value};

use crate::obj::derive_backend_id;

use super::{Attr, BackendError, FileHandle, FsError, StorageBackend};

pub const TYPE: &str = "static";

pub struct StaticStorageBackend {
    params: Mapping,
    backend_id: String,
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    created_at: i64,
}

impl StaticStorageBackend {
    pub fn from_params(params: Mapping) -> Result<Self, BackendError> {
        let backend_id = match params.get("backend-id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                derive_backend_id(&params).map_err(|e| BackendError::Params(e.to_string()))?
            }
        };
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        if let Some(content) = params.get("content").and_then(Value::as_mapping) {
            collect_tree(PathBuf::new(), content, &mut files, &mut dirs)
                .map_err(BackendError::Params)?;
        }
        Ok(Self {
            params,
            backend_id,
            files,
            dirs,
            created_at: Utc::now().timestamp(),
        })
    }
}

fn collect_tree(
    prefix: PathBuf,
    content: &Mapping,
    files: &mut BTreeMap<PathBuf, Vec<u8>>,
    dirs: &mut BTreeSet<PathBuf>,
) -> Result<(), String> {
    for (name, value) in content {
        let name = name
            .as_str()
            .ok_or_else(|| "content keys must be strings".to_string())?;
        let path = prefix.join(name);
        match value {
            Value::String(body) => {
                files.insert(path, body.clone().into_bytes());
            }
            Value::Mapping(subtree) => {
                dirs.insert(path.clone());
                collect_tree(path, subtree, files, dirs)?;
            }
            _ => return Err(format!("unsupported content entry for {:?}", name)),
        }
    }
    Ok(())
}

impl StorageBackend for StaticStorageBackend {
    fn backend_type(&self) -> &'static str {
        TYPE
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn getattr(&self, path: &Path) -> Result<Attr, FsError> {
        let path = path.strip_prefix("/").unwrap_or(path);
        if path.as_os_str().is_empty() || self.dirs.contains(path) {
            return Ok(Attr::dir(self.created_at).read_only());
        }
        match self.files.get(path) {
            Some(body) => Ok(Attr::file(body.len() as u64, self.created_at).read_only()),
            None => Err(FsError::not_found(path)),
        }
    }

    fn readdir(&self, path: &Path) -> Result<Vec<String>, FsError> {
        let path = path.strip_prefix("/").unwrap_or(path).to_path_buf();
        if !path.as_os_str().is_empty() {
            if self.files.contains_key(&path) {
                return Err(FsError::NotADirectory(path.display().to_string()));
            }
            if !self.dirs.contains(&path) {
                return Err(FsError::not_found(&path));
            }
        }
        let mut names = BTreeSet::new();
        for entry in self.files.keys().chain(self.dirs.iter()) {
            if let Ok(rest) = entry.strip_prefix(&path) {
                if let Some(first) = rest.components().next() {
                    names.insert(first.as_os_str().to_string_lossy().into_owned());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn open(&self, path: &Path, flags: i32) -> Result<Box<dyn FileHandle>, FsError> {
        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            return Err(FsError::ReadOnly(path.display().to_string()));
        }
        let stripped = path.strip_prefix("/").unwrap_or(path);
        let body = self
            .files
            .get(stripped)
            .ok_or_else(|| FsError::not_found(path))?;
        Ok(Box::new(StaticFile {
            body: body.clone(),
            timestamp: self.created_at,
        }))
    }
}

impl std::fmt::Debug for StaticStorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticStorageBackend")
            .field("backend_id", &self.backend_id)
            .field("files", &self.files.len())
            .finish()
    }
}

struct StaticFile {
    body: Vec<u8>,
    timestamp: i64,
}

impl FileHandle for StaticFile {
    fn read(&mut self, len: usize, offset: u64) -> Result<Vec<u8>, FsError> {
        let start = (offset as usize).min(self.body.len());
        let end = start.saturating_add(len).min(self.body.len());
        Ok(self.body[start..end].to_vec())
    }

    fn write(&mut self, _data: &[u8], _offset: u64) -> Result<usize, FsError> {
        Err(FsError::ReadOnly("static".into()))
    }

    fn ftruncate(&mut self, _length: u64) -> Result<(), FsError> {
        Err(FsError::ReadOnly("static".into()))
    }

    fn fgetattr(&mut self) -> Result<Attr, FsError> {
        Ok(Attr::file(self.body.len() as u64, self.timestamp).read_only())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> StaticStorageBackend {
        let text = concat!(
            "type: static\n",
            "backend-id: static-1\n",
            "content:\n",
            "  file1: hello\n",
            "  subdir:\n",
            "    nested.txt: world\n",
        );
        let params = match serde_yaml::from_str(text).unwrap() {
            Value::Mapping(mapping) => mapping,
            _ => unreachable!(),
        };
        StaticStorageBackend::from_params(params).unwrap()
    }

    #[test]
    fn test_readdir_levels() {
        let backend = backend();
        assert_eq!(backend.readdir(Path::new("")).unwrap(), vec!["file1", "subdir"]);
        assert_eq!(
            backend.readdir(Path::new("subdir")).unwrap(),
            vec!["nested.txt"]
        );
        assert!(backend.readdir(Path::new("file1")).is_err());
        assert!(backend.readdir(Path::new("missing")).is_err());
    }

    #[test]
    fn test_read_content() {
        let backend = backend();
        let mut handle = backend
            .open(Path::new("subdir/nested.txt"), libc::O_RDONLY)
            .unwrap();
        assert_eq!(handle.read(1024, 0).unwrap(), b"world");
        // Reads past EOF are empty, not errors.
        assert_eq!(handle.read(1024, 100).unwrap(), b"");
    }

    #[test]
    fn test_read_only() {
        let backend = backend();
        assert!(backend.open(Path::new("file1"), libc::O_RDWR).is_err());
        let attr = backend.getattr(Path::new("file1")).unwrap();
        assert_eq!(attr.mode & 0o222, 0);
    }
}
