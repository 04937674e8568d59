//! Virtual-path conflict resolution.
//!
//! A prefix tree ([`MountDir`]) records which storages are mounted where.
//! The [`ConflictResolver`] merges the views of every storage responsible
//! for a path into one coherent directory tree:
//!
//! - Multiple directories with the same name collapse into one *synthetic*
//!   directory. Synthetic directories are read-only (`0o555`): the list of
//!   entries cannot be modified, the entries themselves can.
//! - Multiple files with the same name (or a file colliding with a
//!   directory) are renamed to `<name>.wl.<storage-id>`; a directory among
//!   them keeps the bare name. Inaccessible entries count as files.
//!
//! Results are sorted; the resolver keeps no insertion order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use common::storage::{Attr, FsError};

/// A path resolution result: the storage id and the path relative to the
/// storage's mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub ident: i64,
    pub relpath: PathBuf,
}

/// Storage access used during resolution. Implementations are expected to
/// be cheap to call repeatedly (local metadata or cached results).
pub trait ResolverStorage {
    fn storage_getattr(&self, ident: i64, relpath: &Path) -> Result<Attr, FsError>;
    fn storage_readdir(&self, ident: i64, relpath: &Path) -> Result<Vec<String>, FsError>;
}

fn synthetic_attr() -> Attr {
    Attr {
        mode: libc::S_IFDIR as u32 | 0o555,
        size: 0,
        timestamp: 0,
    }
}

fn path_parts(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Prefix tree of mount points.
#[derive(Debug, Clone, Default)]
pub struct MountDir {
    storage_ids: BTreeSet<i64>,
    children: BTreeMap<String, MountDir>,
}

impl MountDir {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.storage_ids.is_empty()
    }

    fn mount(&mut self, parts: &[String], storage_id: i64) {
        match parts.split_first() {
            None => {
                self.storage_ids.insert(storage_id);
            }
            Some((first, rest)) => {
                self.children
                    .entry(first.clone())
                    .or_default()
                    .mount(rest, storage_id);
            }
        }
    }

    fn unmount(&mut self, parts: &[String], storage_id: i64) {
        match parts.split_first() {
            None => {
                self.storage_ids.remove(&storage_id);
            }
            Some((first, rest)) => {
                if let Some(child) = self.children.get_mut(first) {
                    child.unmount(rest, storage_id);
                    if child.is_empty() {
                        self.children.remove(first);
                    }
                }
            }
        }
    }

    /// A synthetic directory has more than one storage mounted at it, or
    /// further storages mounted below it.
    fn is_synthetic(&self, parts: &[String]) -> bool {
        match parts.split_first() {
            None => !(self.children.is_empty() && self.storage_ids.len() == 1),
            Some((first, rest)) => match self.children.get(first) {
                Some(child) => child.is_synthetic(rest),
                None => false,
            },
        }
    }

    /// Synthetic sub-directories directly under a path.
    fn readdir(&self, parts: &[String]) -> Option<Vec<String>> {
        match parts.split_first() {
            None => Some(self.children.keys().cloned().collect()),
            Some((first, rest)) => self.children.get(first)?.readdir(rest),
        }
    }

    /// All storages that could be responsible for a path.
    fn resolve(&self, parts: &[String], out: &mut Vec<Resolved>) {
        for storage_id in &self.storage_ids {
            out.push(Resolved {
                ident: *storage_id,
                relpath: parts.iter().collect(),
            });
        }
        if let Some((first, rest)) = parts.split_first() {
            if let Some(child) = self.children.get(first) {
                child.resolve(rest, out);
            }
        }
    }
}

/// The conflict resolver proper.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    root: MountDir,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, path: &Path, storage_id: i64) {
        self.root.mount(&path_parts(path), storage_id);
    }

    pub fn unmount(&mut self, path: &Path, storage_id: i64) {
        self.root.unmount(&path_parts(path), storage_id);
    }

    /// Every storage id responsible for a path, outermost mount first.
    pub fn find_storage_ids(&self, path: &Path) -> Vec<i64> {
        let mut resolved = Vec::new();
        self.root.resolve(&path_parts(path), &mut resolved);
        resolved.into_iter().map(|res| res.ident).collect()
    }

    /// List a directory, merging synthetic children with the contributing
    /// storages' own listings and applying the `.wl.<id>` rename rule.
    pub fn readdir(
        &self,
        storage: &dyn ResolverStorage,
        path: &Path,
    ) -> Result<Vec<String>, FsError> {
        let parts = path_parts(path);
        let mut resolved = Vec::new();
        self.root.resolve(&parts, &mut resolved);
        let synthetic = self.root.readdir(&parts);

        if resolved.is_empty() && synthetic.is_none() {
            if parts.is_empty() {
                return Ok(Vec::new());
            }
            return Err(FsError::not_found(path));
        }

        let mut result: BTreeSet<String> = BTreeSet::new();
        if let Some(synthetic) = &synthetic {
            result.extend(synthetic.iter().cloned());
        }

        // Single storage, no synthetic entries: let its errors surface.
        if resolved.len() == 1 && result.is_empty() {
            let res = &resolved[0];
            result.extend(storage.storage_readdir(res.ident, &res.relpath)?);
            return Ok(sorted_names(result));
        }

        let mut dir_sources = Vec::new();
        let mut file_sources = Vec::new();
        for res in resolved {
            match storage.storage_getattr(res.ident, &res.relpath) {
                Ok(attr) if attr.is_dir() => dir_sources.push(res),
                Ok(_) => file_sources.push(res),
                Err(_) => {}
            }
        }

        if dir_sources.is_empty() && result.is_empty() {
            return match file_sources.len() {
                0 => Err(FsError::not_found(path)),
                1 => Err(FsError::NotADirectory(path.display().to_string())),
                // Multiple files under this name: they get renamed, the
                // bare path itself does not exist.
                _ => Err(FsError::not_found(path)),
            };
        }

        // One directory source: nothing to disambiguate.
        if dir_sources.len() == 1 {
            let res = &dir_sources[0];
            if let Ok(names) = storage.storage_readdir(res.ident, &res.relpath) {
                result.extend(names);
            }
            return Ok(sorted_names(result));
        }

        let mut seen: BTreeMap<String, Vec<&Resolved>> = BTreeMap::new();
        for res in &dir_sources {
            let names = storage
                .storage_readdir(res.ident, &res.relpath)
                .unwrap_or_default();
            for name in names {
                seen.entry(name).or_default().push(res);
            }
        }

        for (name, sources) in seen {
            if sources.len() == 1 && !result.contains(&name) {
                result.insert(name);
                continue;
            }
            for res in sources {
                match storage.storage_getattr(res.ident, &res.relpath.join(&name)) {
                    Ok(attr) if attr.is_dir() => {
                        result.insert(name.clone());
                    }
                    // Inaccessible entries are treated as files.
                    Ok(_) | Err(_) => {
                        result.insert(format!("{}.wl.{}", name, res.ident));
                    }
                }
            }
        }

        Ok(sorted_names(result))
    }

    /// Get attributes for a path.
    pub fn getattr(
        &self,
        storage: &dyn ResolverStorage,
        path: &Path,
    ) -> Result<Attr, FsError> {
        self.getattr_extended(storage, path).map(|(attr, _)| attr)
    }

    /// Resolve a path to the storages owning it and compute its merged
    /// attributes. The second element is the unique owner, when there is
    /// exactly one (synthetic nodes have none).
    pub fn getattr_extended(
        &self,
        storage: &dyn ResolverStorage,
        path: &Path,
    ) -> Result<(Attr, Option<Resolved>), FsError> {
        let parts = path_parts(path);
        if parts.is_empty() {
            return Ok((synthetic_attr(), None));
        }

        // foo.wl.<N> addresses storage N's view of foo.
        let (real_parts, suffix) = split_conflict_suffix(&parts);

        if self.root.is_synthetic(&real_parts) {
            if suffix.is_some() {
                return Err(FsError::not_found(path));
            }
            return Ok((synthetic_attr(), None));
        }

        let mut resolved = Vec::new();
        self.root.resolve(&real_parts, &mut resolved);
        if resolved.is_empty() {
            return Err(FsError::not_found(path));
        }

        if resolved.len() == 1 {
            if suffix.is_some() {
                return Err(FsError::not_found(path));
            }
            // Single storage: propagate its errors directly.
            let res = resolved.into_iter().next().unwrap();
            let attr = storage.storage_getattr(res.ident, &res.relpath)?;
            return Ok((attr, Some(res)));
        }

        let mut dir_results = Vec::new();
        let mut file_results = Vec::new();
        for res in resolved {
            match storage.storage_getattr(res.ident, &res.relpath) {
                Ok(attr) if attr.is_dir() => dir_results.push((attr, res)),
                Ok(attr) => file_results.push((attr, res)),
                Err(_) => {}
            }
        }

        if dir_results.len() == 1 {
            if suffix.is_some() {
                return Err(FsError::not_found(path));
            }
            let (attr, res) = dir_results.into_iter().next().unwrap();
            return Ok((attr, Some(res)));
        }
        if dir_results.len() > 1 {
            if suffix.is_some() {
                return Err(FsError::not_found(path));
            }
            return Ok((synthetic_attr(), None));
        }

        match file_results.len() {
            0 => Err(FsError::not_found(path)),
            1 => {
                if suffix.is_some() {
                    return Err(FsError::not_found(path));
                }
                let (attr, res) = file_results.into_iter().next().unwrap();
                Ok((attr, Some(res)))
            }
            _ => {
                // Multiple file claimants: only the suffixed names exist.
                let suffix = suffix.ok_or_else(|| FsError::not_found(path))?;
                file_results
                    .into_iter()
                    .find(|(_, res)| res.ident == suffix)
                    .map(|(attr, res)| (attr, Some(res)))
                    .ok_or_else(|| FsError::not_found(path))
            }
        }
    }
}

/// Sorted listing: plain lexicographic, except that `.wl.<id>` suffixes
/// on the same name order by numeric id.
fn sorted_names(names: std::collections::BTreeSet<String>) -> Vec<String> {
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort_by_key(|name| {
        let (parts, suffix) = split_conflict_suffix(&[name.clone()]);
        (parts.into_iter().next().unwrap_or_default(), suffix)
    });
    names
}

/// Parse a trailing `.wl.<id>` disambiguation suffix off the last path
/// component. Returns the real parts and the storage id, if any.
fn split_conflict_suffix(parts: &[String]) -> (Vec<String>, Option<i64>) {
    let Some((last, init)) = parts.split_last() else {
        return (parts.to_vec(), None);
    };
    let Some(pos) = last.rfind(".wl.") else {
        return (parts.to_vec(), None);
    };
    let (stem, id_str) = last.split_at(pos);
    let id_str = &id_str[".wl.".len()..];
    if stem.is_empty() || id_str.is_empty() || !id_str.bytes().all(|b| b.is_ascii_digit()) {
        return (parts.to_vec(), None);
    }
    let ident: i64 = match id_str.parse() {
        Ok(ident) => ident,
        Err(_) => return (parts.to_vec(), None),
    };
    let mut real = init.to_vec();
    real.push(stem.to_string());
    (real, Some(ident))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Storage stub: maps `(ident, path)` to attrs and listings.
    #[derive(Default)]
    struct FakeStorages {
        dirs: HashMap<(i64, PathBuf), Vec<String>>,
        files: HashMap<(i64, PathBuf), u64>,
    }

    impl FakeStorages {
        fn add_dir(&mut self, ident: i64, path: &str, names: &[&str]) {
            self.dirs.insert(
                (ident, PathBuf::from(path)),
                names.iter().map(|s| s.to_string()).collect(),
            );
        }

        fn add_file(&mut self, ident: i64, path: &str, size: u64) {
            self.files.insert((ident, PathBuf::from(path)), size);
        }
    }

    impl ResolverStorage for FakeStorages {
        fn storage_getattr(&self, ident: i64, relpath: &Path) -> Result<Attr, FsError> {
            let key = (ident, relpath.to_path_buf());
            if self.dirs.contains_key(&key) {
                return Ok(Attr::dir(0));
            }
            if let Some(size) = self.files.get(&key) {
                return Ok(Attr::file(*size, 0));
            }
            Err(FsError::not_found(relpath))
        }

        fn storage_readdir(&self, ident: i64, relpath: &Path) -> Result<Vec<String>, FsError> {
            self.dirs
                .get(&(ident, relpath.to_path_buf()))
                .cloned()
                .ok_or_else(|| FsError::not_found(relpath))
        }
    }

    #[test]
    fn test_single_storage_readdir() {
        let mut storages = FakeStorages::default();
        storages.add_dir(1, "", &["file1"]);
        storages.add_file(1, "file1", 3);

        let mut resolver = ConflictResolver::new();
        resolver.mount(Path::new("/path"), 1);

        assert_eq!(
            resolver.readdir(&storages, Path::new("/path")).unwrap(),
            vec!["file1"]
        );
        // The mount path's parent is a synthetic directory.
        assert_eq!(
            resolver.readdir(&storages, Path::new("/")).unwrap(),
            vec!["path"]
        );
        let (attr, res) = resolver
            .getattr_extended(&storages, Path::new("/path/file1"))
            .unwrap();
        assert!(!attr.is_dir());
        assert_eq!(res.unwrap().ident, 1);
    }

    #[test]
    fn test_readdir_is_stable() {
        let mut storages = FakeStorages::default();
        storages.add_dir(1, "", &["b", "a", "c"]);
        let mut resolver = ConflictResolver::new();
        resolver.mount(Path::new("/x"), 1);

        let first = resolver.readdir(&storages, Path::new("/x")).unwrap();
        let second = resolver.readdir(&storages, Path::new("/x")).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_two_files_get_suffixes() {
        let mut storages = FakeStorages::default();
        storages.add_dir(1, "", &["a"]);
        storages.add_file(1, "a", 1);
        storages.add_dir(2, "", &["a"]);
        storages.add_file(2, "a", 2);

        let mut resolver = ConflictResolver::new();
        resolver.mount(Path::new("/x"), 1);
        resolver.mount(Path::new("/x"), 2);

        assert_eq!(
            resolver.readdir(&storages, Path::new("/x")).unwrap(),
            vec!["a.wl.1", "a.wl.2"]
        );

        // Bare name does not exist; suffixed names resolve to the owner.
        assert!(resolver
            .getattr_extended(&storages, Path::new("/x/a"))
            .is_err());
        let (attr, res) = resolver
            .getattr_extended(&storages, Path::new("/x/a.wl.2"))
            .unwrap();
        assert_eq!(attr.size, 2);
        assert_eq!(res.unwrap().ident, 2);
        // A suffix pointing at a non-claimant fails.
        assert!(resolver
            .getattr_extended(&storages, Path::new("/x/a.wl.3"))
            .is_err());
    }

    #[test]
    fn test_directory_keeps_bare_name_among_files() {
        let mut storages = FakeStorages::default();
        storages.add_dir(1, "", &["a"]);
        storages.add_file(1, "a", 1);
        storages.add_dir(2, "", &["a"]);
        storages.add_file(2, "a", 2);
        storages.add_dir(3, "", &["a"]);
        storages.add_dir(3, "a", &["inner"]);

        let mut resolver = ConflictResolver::new();
        resolver.mount(Path::new("/x"), 1);
        resolver.mount(Path::new("/x"), 2);
        resolver.mount(Path::new("/x"), 3);

        assert_eq!(
            resolver.readdir(&storages, Path::new("/x")).unwrap(),
            vec!["a", "a.wl.1", "a.wl.2"]
        );
        let (attr, res) = resolver
            .getattr_extended(&storages, Path::new("/x/a"))
            .unwrap();
        assert!(attr.is_dir());
        assert_eq!(res.unwrap().ident, 3);
    }

    #[test]
    fn test_multiple_directories_merge() {
        let mut storages = FakeStorages::default();
        storages.add_dir(1, "", &["shared"]);
        storages.add_dir(1, "shared", &["one"]);
        storages.add_file(1, "shared/one", 1);
        storages.add_dir(2, "", &["shared"]);
        storages.add_dir(2, "shared", &["two"]);
        storages.add_file(2, "shared/two", 2);

        let mut resolver = ConflictResolver::new();
        resolver.mount(Path::new("/x"), 1);
        resolver.mount(Path::new("/x"), 2);

        // The shared directory is synthetic and read-only.
        let (attr, res) = resolver
            .getattr_extended(&storages, Path::new("/x/shared"))
            .unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.mode & 0o777, 0o555);
        assert!(res.is_none());

        assert_eq!(
            resolver.readdir(&storages, Path::new("/x/shared")).unwrap(),
            vec!["one", "two"]
        );
        // Non-conflicting files inside keep their bare names and owners.
        let (_, res) = resolver
            .getattr_extended(&storages, Path::new("/x/shared/one"))
            .unwrap();
        assert_eq!(res.unwrap().ident, 1);
    }

    #[test]
    fn test_nested_mounts() {
        let mut storages = FakeStorages::default();
        storages.add_dir(1, "", &["data"]);
        storages.add_dir(1, "data", &[]);
        storages.add_dir(2, "", &["deep"]);
        storages.add_file(2, "deep", 9);

        let mut resolver = ConflictResolver::new();
        resolver.mount(Path::new("/x"), 1);
        resolver.mount(Path::new("/x/sub"), 2);

        // /x is synthetic now: storage 2 is mounted below it.
        let (attr, res) = resolver
            .getattr_extended(&storages, Path::new("/x"))
            .unwrap();
        assert!(attr.is_dir());
        assert!(res.is_none());

        let names = resolver.readdir(&storages, Path::new("/x")).unwrap();
        assert_eq!(names, vec!["data", "sub"]);

        let (_, res) = resolver
            .getattr_extended(&storages, Path::new("/x/sub/deep"))
            .unwrap();
        assert_eq!(res.unwrap().ident, 2);
    }

    #[test]
    fn test_unmount_restores_tree() {
        let mut storages = FakeStorages::default();
        storages.add_dir(1, "", &["a"]);
        storages.add_file(1, "a", 1);
        storages.add_dir(2, "", &["a"]);
        storages.add_file(2, "a", 2);

        let mut resolver = ConflictResolver::new();
        resolver.mount(Path::new("/x"), 1);
        resolver.mount(Path::new("/x"), 2);
        resolver.unmount(Path::new("/x"), 2);

        assert_eq!(
            resolver.readdir(&storages, Path::new("/x")).unwrap(),
            vec!["a"]
        );
        assert!(resolver
            .getattr_extended(&storages, Path::new("/x/a"))
            .is_ok());
    }

    #[test]
    fn test_missing_path() {
        let storages = FakeStorages::default();
        let mut resolver = ConflictResolver::new();
        resolver.mount(Path::new("/x"), 1);
        assert!(matches!(
            resolver.readdir(&storages, Path::new("/nope")),
            Err(FsError::NotFound(_))
        ));
        // With a mount present, the root lists its synthetic children.
        assert_eq!(
            resolver.readdir(&storages, Path::new("/")).unwrap(),
            vec!["x"]
        );
    }

    #[test]
    fn test_suffix_ordering_is_numeric() {
        let names: std::collections::BTreeSet<String> = ["a.wl.10", "a.wl.2", "a", "b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(sorted_names(names), vec!["a", "a.wl.2", "a.wl.10", "b"]);
    }

    #[test]
    fn test_suffix_parsing() {
        let (parts, suffix) = split_conflict_suffix(&["a.wl.12".to_string()]);
        assert_eq!(parts, vec!["a"]);
        assert_eq!(suffix, Some(12));

        let (parts, suffix) = split_conflict_suffix(&["a.wl.x".to_string()]);
        assert_eq!(parts, vec!["a.wl.x"]);
        assert_eq!(suffix, None);
    }
}
