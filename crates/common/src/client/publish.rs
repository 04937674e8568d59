//! Publishing containers into a manifest catalog.
//!
//! Between two publish operations paths and storages may have changed;
//! the container uuid and the catalog's manifest pattern are assumed
//! stable. Publishing picks the first writable catalog storage with a
//! glob manifest pattern and writes the signed manifest at the pattern's
//! expansion of the container's uuid path.

use std::path::{Path, PathBuf};

use crate::obj::{Container, ManifestPattern, Storage};
use crate::storage::{FsError, StorageBackend};

use super::search::catalog_sources_for_owner;
use super::{Client, ClientError};

pub struct Publisher<'a> {
    client: &'a mut Client,
    container: Container,
}

impl<'a> Publisher<'a> {
    pub fn new(client: &'a mut Client, container: Container) -> Self {
        Self { client, container }
    }

    /// Write the container manifest into the owner's catalog.
    /// Returns the relative path it was stored at.
    pub fn publish(&mut self) -> Result<PathBuf, ClientError> {
        let data = self
            .container
            .manifest()
            .ok_or_else(|| ClientError::Search("container has no signed manifest".into()))?
            .to_bytes()?;

        let mut rejected = Vec::new();
        for storage in self.catalog_storages()? {
            let path = match self.manifest_path(&storage) {
                Some(path) => path,
                None => {
                    rejected.push(format!(
                        "storage {} has no usable manifest pattern",
                        storage.backend_id()
                    ));
                    continue;
                }
            };
            if storage.is_read_only() {
                rejected.push(format!("storage {} is read-only", storage.backend_id()));
                continue;
            }
            match self.write_manifest(&storage, &path, &data) {
                Ok(()) => {
                    tracing::info!(
                        "published {} to {}:{}",
                        self.container,
                        storage.backend_id(),
                        path.display()
                    );
                    return Ok(path);
                }
                Err(e) => rejected.push(format!("storage {}: {}", storage.backend_id(), e)),
            }
        }
        Err(ClientError::Search(format!(
            "cannot publish {}: {}",
            self.container,
            rejected.join("; ")
        )))
    }

    /// Remove every copy of this container's manifest from the owner's
    /// catalogs. Returns how many files were removed.
    pub fn unpublish(&mut self) -> Result<usize, ClientError> {
        let Some(uuid) = self.container.uuid() else {
            return Ok(0);
        };
        let needle = format!("/.uuid/{}", uuid);

        let mut removed = 0;
        for storage in self.catalog_storages()? {
            let backend = self
                .client
                .registry()
                .construct(storage.params().clone())?;
            backend.request_mount()?;
            let children = backend.get_children(None).unwrap_or_default();
            for child in children {
                if !manifest_mentions_path(&child.data, &needle) {
                    continue;
                }
                match backend.unlink(&child.path) {
                    Ok(()) => {
                        tracing::info!(
                            "unpublished {} from {}:{}",
                            self.container,
                            storage.backend_id(),
                            child.path.display()
                        );
                        removed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "cannot unpublish {}: {}",
                            child.path.display(),
                            e
                        );
                    }
                }
            }
            let _ = backend.request_unmount();
        }
        Ok(removed)
    }

    fn catalog_storages(&mut self) -> Result<Vec<Storage>, ClientError> {
        let owner = self.container.owner().to_string();
        let sources = catalog_sources_for_owner(self.client, &owner)?;
        Ok(sources
            .into_iter()
            .flat_map(|source| source.storages)
            .collect())
    }

    /// Expand the storage's glob manifest pattern for this container.
    fn manifest_path(&self, storage: &Storage) -> Option<PathBuf> {
        let pattern = match storage.manifest_pattern()? {
            ManifestPattern::Glob { path } => path.clone(),
            // A fixed file list leaves no room for new manifests.
            ManifestPattern::List { .. } => return None,
        };
        let uuid_path = self.container.uuid_path()?;
        let expanded = pattern
            .replace("{path}", uuid_path.trim_start_matches('/'))
            .replace("{object-type}", "container");
        if expanded.contains('*') || expanded.contains('{') {
            return None;
        }
        Some(PathBuf::from(expanded.trim_start_matches('/')))
    }

    fn write_manifest(
        &self,
        storage: &Storage,
        path: &Path,
        data: &[u8],
    ) -> Result<(), ClientError> {
        let backend = self
            .client
            .registry()
            .construct(storage.params().clone())?;
        backend.request_mount()?;
        let result = write_backend_file(backend.as_ref(), path, data);
        let _ = backend.request_unmount();
        Ok(result?)
    }
}

fn write_backend_file(
    backend: &dyn StorageBackend,
    path: &Path,
    data: &[u8],
) -> Result<(), FsError> {
    // Create missing parent directories, shallowest first.
    let parents: Vec<&Path> = std::iter::successors(path.parent(), |p| p.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    for parent in parents.into_iter().rev() {
        match backend.mkdir(parent) {
            Ok(()) | Err(FsError::Exists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let mut handle = match backend.create(path, libc::O_CREAT | libc::O_WRONLY, 0o644) {
        Ok(handle) => handle,
        // Re-publishing overwrites in place.
        Err(FsError::Exists(_)) => backend.open(path, libc::O_WRONLY)?,
        Err(e) => return Err(e),
    };
    handle.ftruncate(0)?;
    let mut offset = 0u64;
    while offset < data.len() as u64 {
        let written = handle.write(&data[offset as usize..], offset)?;
        offset += written as u64;
    }
    handle.release()?;
    Ok(())
}

fn manifest_mentions_path(data: &[u8], needle: &str) -> bool {
    std::str::from_utf8(data)
        .map(|text| text.contains(needle))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, Search, WildlandPath};
    use crate::crypto::{DummySigContext, SigContext as _};
    use crate::manifest::Manifest;
    use crate::obj::User;
    use serde_yaml::Value;

    /// A client whose default user has an empty local catalog with a glob
    /// manifest pattern.
    fn publishable_client() -> (tempfile::TempDir, Client, String) {
        let dir = tempfile::tempdir().unwrap();
        let catalog_dir = dir.path().join("catalog");
        std::fs::create_dir_all(&catalog_dir).unwrap();

        let mut sig = DummySigContext::new();
        let (owner, pubkey) = sig.generate().unwrap();

        let stub_text = format!(
            concat!(
                "paths:\n",
                "- /.uuid/51917752-1b95-4b6e-9c33-1908ec0a8011\n",
                "backends:\n",
                "  storage:\n",
                "  - type: local\n",
                "    location: {}\n",
                "    backend-id: catalog-1\n",
                "    manifest-pattern:\n",
                "      type: glob\n",
                "      path: /.manifests/{{path}}.{{object-type}}.yaml\n",
            ),
            catalog_dir.display()
        );
        let stub: Value = serde_yaml::from_str(&stub_text).unwrap();

        let mut user_fields =
            User::make_fields(&owner, &[pubkey], &[format!("/users/{}", owner)]).unwrap();
        user_fields.insert("manifests-catalog".into(), Value::Sequence(vec![stub]));
        let mut user_manifest = Manifest::from_fields(user_fields).unwrap();
        user_manifest.sign(&sig, true).unwrap();
        let user = User::from_manifest(user_manifest).unwrap();

        let mut config = ClientConfig::new(dir.path());
        config.default_user = Some(owner.clone());
        let mut client = Client::new(config, Box::new(sig));
        client.add_user(user);
        (dir, client, owner)
    }

    fn signed_container(client: &Client, owner: &str) -> Container {
        let container = Container::new(owner, vec!["/work/report".into()], vec![]);
        let mut manifest = Manifest::from_fields(container.to_fields().unwrap()).unwrap();
        manifest.sign(client.sig(), false).unwrap();
        Container::from_manifest(manifest).unwrap()
    }

    #[test]
    fn test_publish_then_search_finds_container() {
        let (_dir, mut client, owner) = publishable_client();
        let container = signed_container(&client, &owner);
        let uuid = container.uuid().unwrap();

        let path = Publisher::new(&mut client, container).publish().unwrap();
        assert_eq!(
            path.display().to_string(),
            format!(".manifests/.uuid/{}.container.yaml", uuid)
        );

        let wlpath = WildlandPath::from_str("wildland:@default:/work/report:").unwrap();
        let found = Search::new(&mut client, wlpath).read_container().unwrap();
        assert_eq!(found[0].uuid(), Some(uuid));
    }

    #[test]
    fn test_publish_is_idempotent() {
        let (_dir, mut client, owner) = publishable_client();
        let container = signed_container(&client, &owner);

        let first = Publisher::new(&mut client, container.clone())
            .publish()
            .unwrap();
        let second = Publisher::new(&mut client, container).publish().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unpublish_removes_manifest() {
        let (_dir, mut client, owner) = publishable_client();
        let container = signed_container(&client, &owner);

        Publisher::new(&mut client, container.clone())
            .publish()
            .unwrap();
        let removed = Publisher::new(&mut client, container)
            .unpublish()
            .unwrap();
        assert_eq!(removed, 1);

        let wlpath = WildlandPath::from_str("wildland:@default:/work/report:").unwrap();
        assert!(Search::new(&mut client, wlpath).read_container().is_err());
    }
}
