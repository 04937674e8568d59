//! Wildland path resolution.
//!
//! A path is walked hop by hop: intermediate hops cross *bridges* into
//! other users' namespaces (endorsing their keys along the way), the
//! final hop selects containers out of the owner's manifest catalogs.

use std::path::Path;

use serde_yaml::Mapping;

use crate::manifest::{Manifest, SelfSigned};
use crate::obj::{Bridge, CatalogEntry, Container, Link, Storage, User, UserLocation};
use crate::storage::StorageBackend;

use super::{read_backend_file, Client, ClientError, WildlandPath};

/// One resolved catalog: the container advertising manifests plus its
/// usable storages.
#[derive(Debug, Clone)]
pub struct CatalogSource {
    pub container: Container,
    pub storages: Vec<Storage>,
}

/// A single Wildland-path resolution.
pub struct Search<'a> {
    client: &'a mut Client,
    wlpath: WildlandPath,
}

impl<'a> Search<'a> {
    pub fn new(client: &'a mut Client, wlpath: WildlandPath) -> Self {
        Self { client, wlpath }
    }

    /// Resolve the path to the containers it addresses.
    pub fn read_container(&mut self) -> Result<Vec<Container>, ClientError> {
        let owners = self.resolve_final_owners()?;
        let last_hop = self
            .wlpath
            .hops
            .last()
            .cloned()
            .ok_or_else(|| ClientError::Search("path has no hops".into()))?;

        let mut result = Vec::new();
        for owner in owners {
            for source in self.catalog_sources(&owner)? {
                for manifest in self.read_catalog_manifests(&source) {
                    if manifest.object_type().ok() != Some("container") {
                        continue;
                    }
                    let container = match Container::from_manifest(manifest) {
                        Ok(container) => container,
                        Err(e) => {
                            tracing::debug!("skipping catalog entry: {}", e);
                            continue;
                        }
                    };
                    let matched = container
                        .expanded_paths()
                        .iter()
                        .any(|path| WildlandPath::component_matches(&last_hop, path));
                    if matched {
                        result.push(container);
                    }
                }
            }
        }
        if result.is_empty() {
            return Err(ClientError::Search(format!(
                "no container matches {}",
                self.wlpath
            )));
        }
        Ok(result)
    }

    /// Resolve the path and read the addressed file out of the first
    /// matching container's first storage.
    pub fn read_file(&mut self) -> Result<Vec<u8>, ClientError> {
        let file_path = self
            .wlpath
            .file_path
            .clone()
            .ok_or_else(|| ClientError::Search("path does not address a file".into()))?;
        let containers = self.read_container()?;
        for container in containers {
            let storages = self.client.get_storages_to_mount(&container)?;
            for storage in storages {
                let backend = match self.client.registry().construct(storage.params().clone()) {
                    Ok(backend) => backend,
                    Err(_) => continue,
                };
                if backend.request_mount().is_err() {
                    continue;
                }
                let result = read_backend_file(backend.as_ref(), Path::new(&file_path));
                let _ = backend.request_unmount();
                if let Ok(data) = result {
                    return Ok(data);
                }
            }
        }
        Err(ClientError::Search(format!(
            "cannot read file through {}",
            self.wlpath
        )))
    }

    /// What the remounter needs to watch this path: the catalog containers
    /// to mount (uniquely, under their owner hierarchy) and the glob
    /// patterns matching the published container manifests.
    pub fn get_watch_params(
        &mut self,
    ) -> Result<(Vec<CatalogSource>, Vec<String>), ClientError> {
        let owners = self.resolve_final_owners()?;
        let mut sources = Vec::new();
        let mut patterns = Vec::new();

        for owner in owners {
            for source in self.catalog_sources(&owner)? {
                let container_uuid = match source.container.uuid() {
                    Some(uuid) => uuid,
                    None => continue,
                };
                for storage in &source.storages {
                    let unique_path = format!(
                        "/.users/{}/.backends/{}/{}",
                        source.container.owner(),
                        container_uuid,
                        storage.backend_id()
                    );
                    let globs = match storage.manifest_pattern() {
                        Some(pattern) => pattern.watch_patterns(),
                        None => vec!["/*.yaml".to_string()],
                    };
                    for glob in globs {
                        patterns.push(format!(
                            "{}/{}",
                            unique_path,
                            glob.trim_start_matches('/')
                        ));
                    }
                }
                sources.push(source);
            }
        }
        if patterns.is_empty() {
            return Err(ClientError::Search(format!(
                "no manifest catalog to watch for {}",
                self.wlpath
            )));
        }
        Ok((sources, patterns))
    }

    /// Walk all but the last hop across bridges, returning the owners
    /// whose catalogs serve the final hop.
    fn resolve_final_owners(&mut self) -> Result<Vec<String>, ClientError> {
        let start = self
            .client
            .resolve_owner_alias(self.wlpath.owner.as_deref())?;
        let mut owners = vec![start];

        let hops = self.wlpath.hops.clone();
        for hop in &hops[..hops.len().saturating_sub(1)] {
            let mut next = Vec::new();
            for owner in &owners {
                for source in self.catalog_sources(owner)? {
                    for manifest in self.read_catalog_manifests(&source) {
                        if manifest.object_type().ok() != Some("bridge") {
                            continue;
                        }
                        let bridge = match Bridge::from_manifest(manifest) {
                            Ok(bridge) => bridge,
                            Err(e) => {
                                tracing::debug!("skipping catalog bridge: {}", e);
                                continue;
                            }
                        };
                        let matched = bridge
                            .paths()
                            .iter()
                            .any(|path| WildlandPath::component_matches(hop, path));
                        if matched {
                            match self.follow_bridge(&bridge) {
                                Ok(target) => next.push(target),
                                Err(e) => {
                                    tracing::warn!(
                                        "cannot follow bridge {} -> {}: {}",
                                        bridge.owner(),
                                        bridge.user_id(),
                                        e
                                    );
                                }
                            }
                        }
                    }
                }
            }
            if next.is_empty() {
                return Err(ClientError::Search(format!(
                    "no bridge matches hop {:?} in {}",
                    hop, self.wlpath
                )));
            }
            next.sort();
            next.dedup();
            owners = next;
        }
        Ok(owners)
    }

    /// Cross one bridge: endorse the target key under the bridge owner,
    /// load and verify the target user, register them.
    ///
    /// A target whose manifest no longer verifies against the endorsed
    /// key is rejected outright; the bridge must be refreshed first.
    fn follow_bridge(&mut self, bridge: &Bridge) -> Result<String, ClientError> {
        let fingerprint = self.client.sig().fingerprint(bridge.user_pubkey())?;
        if fingerprint != bridge.user_id() {
            return Err(ClientError::Search(format!(
                "bridge user-pubkey fingerprint {} does not match user-id {}",
                fingerprint,
                bridge.user_id()
            )));
        }
        if let Some(user) = self.client.find_user(bridge.user_id()) {
            return Ok(user.owner().to_string());
        }

        self.client
            .sig_mut()
            .add_pubkey(bridge.user_pubkey(), Some(bridge.owner()))?;

        let data = match bridge.user_location() {
            UserLocation::Url(url) => self.client.read_bytes_from_url_public(url)?,
            UserLocation::Link(link) => {
                self.client.read_link_with_owner(bridge.user_id(), link)?
            }
        };
        let manifest = Manifest::from_bytes(
            &data,
            self.client.sig(),
            None,
            SelfSigned::Allow,
            None,
        )?;
        let user = User::from_manifest(manifest)?;
        if user.owner() != bridge.user_id() {
            return Err(ClientError::Search(format!(
                "bridge target manifest is owned by {}, expected {}",
                user.owner(),
                bridge.user_id()
            )));
        }
        let owner = user.owner().to_string();
        self.client.add_user(user);
        Ok(owner)
    }

    /// A user's manifest catalogs as containers with resolved storages.
    fn catalog_sources(&mut self, owner: &str) -> Result<Vec<CatalogSource>, ClientError> {
        catalog_sources_for_owner(self.client, owner)
    }

    /// All manifests published in a catalog, read directly through the
    /// catalog's backends. Failures are logged, not propagated: a broken
    /// storage must not break the search.
    fn read_catalog_manifests(&self, source: &CatalogSource) -> Vec<Manifest> {
        let mut manifests = Vec::new();
        for storage in &source.storages {
            let backend = match self.client.registry().construct(storage.params().clone()) {
                Ok(backend) => backend,
                Err(e) => {
                    tracing::warn!("cannot construct catalog backend: {}", e);
                    continue;
                }
            };
            if let Err(e) = backend.request_mount() {
                tracing::warn!("cannot mount catalog backend: {}", e);
                continue;
            }
            let children = backend.get_children(None);
            let _ = backend.request_unmount();
            let children = match children {
                Ok(children) => children,
                Err(e) => {
                    tracing::debug!("catalog backend cannot list children: {}", e);
                    continue;
                }
            };
            let trusted_owner = storage.is_trusted().then(|| storage.owner().to_string());
            for child in children {
                match Manifest::from_bytes(
                    &child.data,
                    self.client.sig(),
                    None,
                    SelfSigned::Disallow,
                    trusted_owner.as_deref(),
                ) {
                    Ok(manifest) => manifests.push(manifest),
                    Err(e) => {
                        tracing::debug!(
                            "skipping manifest {}: {}",
                            child.path.display(),
                            e
                        );
                    }
                }
            }
            if !manifests.is_empty() {
                break;
            }
        }
        manifests
    }
}

/// A user's manifest catalogs: each advertised container with its
/// resolved storages. Shared by the search walk and the publisher.
pub fn catalog_sources_for_owner(
    client: &mut Client,
    owner: &str,
) -> Result<Vec<CatalogSource>, ClientError> {
    let user = client
        .find_user(owner)
        .cloned()
        .ok_or_else(|| ClientError::Search(format!("unknown user {}", owner)))?;

    let mut sources = Vec::new();
    for entry in user.manifests_catalog() {
        let container = match catalog_entry_container(client, &user, entry) {
            Ok(container) => container,
            Err(e) => {
                tracing::warn!("skipping catalog of {}: {}", owner, e);
                continue;
            }
        };
        let storages = client.get_storages_to_mount(&container)?;
        if storages.is_empty() {
            continue;
        }
        sources.push(CatalogSource {
            container,
            storages,
        });
    }
    Ok(sources)
}

fn catalog_entry_container(
    client: &Client,
    user: &User,
    entry: &CatalogEntry,
) -> Result<Container, ClientError> {
    match entry {
        // Inline stubs sit inside the user's signed manifest; they carry
        // the user's trust.
        CatalogEntry::Stub(stub) => {
            let fields = complete_stub(user.owner(), stub.clone());
            let mut manifest = Manifest::from_fields(fields)?;
            manifest.skip_signing();
            Ok(Container::from_manifest(manifest)?)
        }
        CatalogEntry::Link(link) => {
            let data = client.read_link_with_owner(user.owner(), link)?;
            let manifest =
                Manifest::from_bytes(&data, client.sig(), None, SelfSigned::Disallow, None)?;
            Ok(Container::from_manifest(manifest)?)
        }
        CatalogEntry::Url(url) => {
            let data = client.read_bytes_from_url_public(url)?;
            let manifest =
                Manifest::from_bytes(&data, client.sig(), None, SelfSigned::Disallow, None)?;
            Ok(Container::from_manifest(manifest)?)
        }
    }
}

// Catalog stubs may omit the boilerplate fields.
fn complete_stub(owner: &str, mut stub: Mapping) -> Mapping {
    if stub.get("object").is_none() {
        stub.insert("object".into(), "container".into());
    }
    if stub.get("owner").is_none() {
        stub.insert("owner".into(), owner.into());
    }
    if stub.get("version").is_none() {
        stub.insert("version".into(), "1".into());
    }
    stub
}

impl Client {
    /// Resolve a link outside any container context (catalog and bridge
    /// targets): the expected owner fills the inline storage fields.
    pub fn read_link_with_owner(
        &self,
        owner: &str,
        link: &Link,
    ) -> Result<Vec<u8>, ClientError> {
        let mut fields = link.storage_fields().clone();
        if fields.get("owner").is_none() {
            fields.insert("owner".into(), owner.into());
        }
        let backend = self.registry().construct(fields)?;
        backend.request_mount()?;
        let result = read_backend_file(backend.as_ref(), Path::new(link.file()));
        let _ = backend.request_unmount();
        Ok(result?)
    }

    /// Read a URL without any trust attached (bridge targets are verified
    /// by signature, not by location).
    pub fn read_bytes_from_url_public(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let path = match url.strip_prefix("file://") {
            Some(path) => std::path::PathBuf::from(path),
            None if url.starts_with('/') => std::path::PathBuf::from(url),
            None => {
                return Err(ClientError::Search(format!(
                    "unsupported URL scheme: {}",
                    url
                )))
            }
        };
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::crypto::{DummySigContext, SigContext as _};
    use crate::obj::WildlandObject;

    /// Build a client whose default user publishes a catalog in a local
    /// directory with one container manifest inside.
    fn searchable_client() -> (tempfile::TempDir, Client, String) {
        let dir = tempfile::tempdir().unwrap();
        let catalog_dir = dir.path().join("catalog");
        std::fs::create_dir_all(&catalog_dir).unwrap();

        let mut sig = DummySigContext::new();
        let (owner, pubkey) = sig.generate().unwrap();

        // Published container manifest inside the catalog dir.
        let container = Container::new(&owner, vec!["/work/notes".into()], vec![]);
        let mut manifest = Manifest::from_fields(container.to_fields().unwrap()).unwrap();
        manifest.sign(&sig, false).unwrap();
        std::fs::write(
            catalog_dir.join("notes.container.yaml"),
            manifest.to_bytes().unwrap(),
        )
        .unwrap();

        // User with an inline catalog stub pointing at the local dir.
        let stub_text = format!(
            concat!(
                "paths:\n",
                "- /.uuid/0b087acc-7d29-4b61-b1f4-a6aa917bb2a4\n",
                "backends:\n",
                "  storage:\n",
                "  - type: local\n",
                "    location: {}\n",
                "    trusted: false\n",
            ),
            catalog_dir.display()
        );
        let stub: serde_yaml::Value = serde_yaml::from_str(&stub_text).unwrap();

        let mut user_fields =
            User::make_fields(&owner, &[pubkey], &[format!("/users/{}", owner)]).unwrap();
        user_fields.insert(
            "manifests-catalog".into(),
            serde_yaml::Value::Sequence(vec![stub]),
        );
        let mut user_manifest = Manifest::from_fields(user_fields).unwrap();
        user_manifest.sign(&sig, true).unwrap();
        let user = User::from_manifest(user_manifest).unwrap();

        let mut config = ClientConfig::new(dir.path());
        config.default_user = Some(owner.clone());
        let mut client = Client::new(config, Box::new(sig));
        client.add_user(user);
        (dir, client, owner)
    }

    #[test]
    fn test_read_container_by_path() {
        let (_dir, mut client, owner) = searchable_client();
        let wlpath =
            WildlandPath::from_str(&format!("wildland:{}:/work/notes:", owner)).unwrap();
        let containers = Search::new(&mut client, wlpath).read_container().unwrap();
        assert_eq!(containers.len(), 1);
        assert!(containers[0]
            .paths()
            .contains(&"/work/notes".to_string()));
    }

    #[test]
    fn test_read_container_with_wildcard() {
        let (_dir, mut client, _owner) = searchable_client();
        let wlpath = WildlandPath::from_str("wildland:@default:/work/*:").unwrap();
        let containers = Search::new(&mut client, wlpath).read_container().unwrap();
        assert_eq!(containers.len(), 1);
    }

    #[test]
    fn test_no_match_is_an_error() {
        let (_dir, mut client, _owner) = searchable_client();
        let wlpath = WildlandPath::from_str("wildland:@default:/absent:").unwrap();
        assert!(matches!(
            Search::new(&mut client, wlpath).read_container(),
            Err(ClientError::Search(_))
        ));
    }

    #[test]
    fn test_watch_params_cover_catalog() {
        let (_dir, mut client, owner) = searchable_client();
        let wlpath = WildlandPath::from_str("wildland:@default:/work/*:").unwrap();
        let (sources, patterns) = Search::new(&mut client, wlpath)
            .get_watch_params()
            .unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].starts_with(&format!("/.users/{}/.backends/", owner)));
        assert!(patterns[0].ends_with("/*.yaml"));
    }

    #[test]
    fn test_client_loads_container_via_wildland_name(){
        let (_dir, mut client, owner) = searchable_client();
        let name = format!("wildland:{}:/work/notes:", owner);
        let loaded = client
            .load_object_from_name(WildlandObject::Container, &name)
            .unwrap();
        assert!(matches!(loaded, crate::client::LoadedObject::Container(_)));
    }
}
