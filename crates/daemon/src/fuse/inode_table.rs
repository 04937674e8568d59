//! Inode <-> path translation for the FUSE adapter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode/path table. Inode 1 is the filesystem root.
#[derive(Debug)]
pub struct InodeTable {
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    next: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next: ROOT_INODE + 1,
        };
        table.paths.insert(ROOT_INODE, PathBuf::from("/"));
        table.inodes.insert(PathBuf::from("/"), ROOT_INODE);
        table
    }

    pub fn get_path(&self, inode: u64) -> Option<&Path> {
        self.paths.get(&inode).map(PathBuf::as_path)
    }

    pub fn get_or_create(&mut self, path: &Path) -> u64 {
        if let Some(inode) = self.inodes.get(path) {
            return *inode;
        }
        let inode = self.next;
        self.next += 1;
        self.paths.insert(inode, path.to_path_buf());
        self.inodes.insert(path.to_path_buf(), inode);
        inode
    }

    /// Drop the mapping for a removed or renamed path.
    pub fn forget_path(&mut self, path: &Path) {
        if let Some(inode) = self.inodes.remove(path) {
            self.paths.remove(&inode);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_one() {
        let table = InodeTable::new();
        assert_eq!(table.get_path(ROOT_INODE), Some(Path::new("/")));
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let mut table = InodeTable::new();
        let a = table.get_or_create(Path::new("/x/a"));
        let b = table.get_or_create(Path::new("/x/b"));
        assert_ne!(a, b);
        assert_eq!(table.get_or_create(Path::new("/x/a")), a);
    }

    #[test]
    fn test_forget() {
        let mut table = InodeTable::new();
        let a = table.get_or_create(Path::new("/x/a"));
        table.forget_path(Path::new("/x/a"));
        assert_eq!(table.get_path(a), None);
        assert_ne!(table.get_or_create(Path::new("/x/a")), a);
    }
}
