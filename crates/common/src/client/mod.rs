//! Object loader.
//!
//! The [`Client`] resolves *names* (short strings, local paths, `file://`
//! URLs or Wildland paths) into parsed, validated objects, and saves
//! objects back under per-type directories.

pub mod publish;
pub mod search;
pub mod wlpath;

pub use publish::Publisher;
pub use search::Search;
pub use wlpath::{PathError, WildlandPath};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::crypto::{SigContext, SigError};
use crate::manifest::{Manifest, ManifestError, SelfSigned};
use crate::obj::{
    Bridge, Container, Link, ObjectError, Storage, StorageRef, User, WildlandObject,
};
use crate::storage::{BackendError, BackendRegistry, FsError, StorageBackend};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Sig(#[from] SigError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("cannot resolve wildland path: {0}")]
    Search(String),
}

/// Client-side configuration: directories and socket paths.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_dir: PathBuf,
    pub key_dir: PathBuf,
    pub mount_dir: PathBuf,
    pub socket_path: PathBuf,
    pub sync_socket_path: PathBuf,
    pub default_user: Option<String>,
    pub aliases: HashMap<String, String>,
}

impl ClientConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            key_dir: base_dir.join("keys"),
            mount_dir: base_dir.join("mnt"),
            socket_path: base_dir.join("wlfuse.sock"),
            sync_socket_path: base_dir.join("wlsync.sock"),
            default_user: None,
            aliases: HashMap::new(),
            base_dir,
        }
    }

    fn type_dir(&self, object_type: WildlandObject) -> PathBuf {
        self.base_dir.join(object_type.type_dir())
    }
}

/// Any object the loader can produce.
#[derive(Debug, Clone)]
pub enum LoadedObject {
    User(User),
    Container(Container),
    Storage(Storage),
    Bridge(Bridge),
}

/// Resolves local paths to trusted storage owners. Implemented by the
/// fs-client against the daemon's `fileinfo` command; files inside a
/// trusted mounted storage may skip signature verification.
pub trait TrustedLocationProvider: Send + Sync {
    fn trusted_owner(&self, local_path: &Path) -> Option<String>;
}

/// The object loader: owns the signature context, the known users and the
/// backend registry.
pub struct Client {
    config: ClientConfig,
    sig: Box<dyn SigContext>,
    users: HashMap<String, User>,
    registry: BackendRegistry,
    trust_provider: Option<Box<dyn TrustedLocationProvider>>,
}

impl Client {
    pub fn new(config: ClientConfig, sig: Box<dyn SigContext>) -> Self {
        Self {
            config,
            sig,
            users: HashMap::new(),
            registry: BackendRegistry::with_defaults(),
            trust_provider: None,
        }
    }

    /* Accessors */

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn sig(&self) -> &dyn SigContext {
        self.sig.as_ref()
    }

    pub fn sig_mut(&mut self) -> &mut dyn SigContext {
        self.sig.as_mut()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn set_trust_provider(&mut self, provider: Box<dyn TrustedLocationProvider>) {
        self.trust_provider = Some(provider);
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn find_user(&self, owner: &str) -> Option<&User> {
        self.users.get(owner)
    }

    /// The fingerprint behind `@default` (or a configured alias).
    pub fn resolve_owner_alias(&self, owner: Option<&str>) -> Result<String, ClientError> {
        match owner {
            Some(fingerprint) => Ok(fingerprint.to_string()),
            None => self
                .config
                .default_user
                .clone()
                .ok_or_else(|| ClientError::Search("no default user configured".into())),
        }
    }

    /* Users */

    /// Load every user manifest from the users directory and register
    /// their keys (self-signed manifests bootstrap their own key).
    pub fn load_users(&mut self) -> Result<usize, ClientError> {
        let dir = self.config.type_dir(WildlandObject::User);
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
            .collect();
        entries.sort();

        let mut loaded = 0;
        for path in entries {
            match self.load_user_from_path(&path) {
                Ok(user) => {
                    self.add_user(user);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!("cannot load user manifest {}: {}", path.display(), e);
                }
            }
        }
        Ok(loaded)
    }

    fn load_user_from_path(&mut self, path: &Path) -> Result<User, ClientError> {
        let data = std::fs::read(path)?;
        let manifest =
            Manifest::from_bytes(&data, self.sig.as_ref(), None, SelfSigned::Allow, None)?;
        Ok(User::from_manifest(manifest)?)
    }

    /// Register a user and their keys.
    pub fn add_user(&mut self, user: User) {
        if let Err(e) = user.add_user_keys(self.sig.as_mut()) {
            tracing::warn!("cannot register keys of user {}: {}", user.owner(), e);
        }
        self.users.insert(user.owner().to_string(), user);
    }

    /* Loading */

    /// Resolve a name to an object of the expected type.
    ///
    /// Resolution order: `<type-dir>/<name>.<type>.yaml`, a literal
    /// filesystem path, a `file://` URL, finally a Wildland path.
    pub fn load_object_from_name(
        &mut self,
        object_type: WildlandObject,
        name: &str,
    ) -> Result<LoadedObject, ClientError> {
        if WildlandPath::matches(name) {
            let wlpath = WildlandPath::from_str(name)?;
            let containers = Search::new(self, wlpath).read_container()?;
            return containers
                .into_iter()
                .next()
                .map(LoadedObject::Container)
                .ok_or_else(|| ClientError::NotFound(name.to_string()));
        }

        let shortcut = self
            .config
            .type_dir(object_type)
            .join(format!("{}.{}.yaml", name, object_type.as_str()));
        let literal = PathBuf::from(name);
        let from_url = name.strip_prefix("file://").map(PathBuf::from);

        let path = if shortcut.is_file() {
            shortcut
        } else if literal.is_file() {
            literal
        } else if let Some(url_path) = from_url.filter(|path| path.is_file()) {
            url_path
        } else {
            return Err(ClientError::NotFound(name.to_string()));
        };
        self.load_object_from_file_path(object_type, &path)
    }

    pub fn load_object_from_file_path(
        &self,
        object_type: WildlandObject,
        path: &Path,
    ) -> Result<LoadedObject, ClientError> {
        let data = std::fs::read(path)?;
        let trusted_owner = self
            .trust_provider
            .as_ref()
            .and_then(|provider| provider.trusted_owner(path));
        self.load_object_from_bytes(object_type, &data, trusted_owner.as_deref())
    }

    pub fn load_object_from_bytes(
        &self,
        object_type: WildlandObject,
        data: &[u8],
        trusted_owner: Option<&str>,
    ) -> Result<LoadedObject, ClientError> {
        // User manifests may carry their own pubkey (bootstrapping);
        // everything else must verify against known keys.
        let self_signed = match object_type {
            WildlandObject::User => SelfSigned::Allow,
            _ => SelfSigned::Disallow,
        };
        let manifest =
            Manifest::from_bytes(data, self.sig.as_ref(), None, self_signed, trusted_owner)?;
        Ok(match object_type {
            WildlandObject::User => LoadedObject::User(User::from_manifest(manifest)?),
            WildlandObject::Container => {
                LoadedObject::Container(Container::from_manifest(manifest)?)
            }
            WildlandObject::Storage => LoadedObject::Storage(Storage::from_manifest(manifest)?),
            WildlandObject::Bridge => LoadedObject::Bridge(Bridge::from_manifest(manifest)?),
            WildlandObject::Link => {
                return Err(ClientError::Object(ObjectError::Invalid(
                    "links cannot be loaded standalone".into(),
                )))
            }
        })
    }

    /* Saving */

    /// Save a signed manifest under the type directory.
    ///
    /// Picks `<name>.<type>.yaml`, suffixing `.1`, `.2`, … on collision.
    /// Idempotent per object uuid: re-saving a manifest with the same
    /// uuid overwrites the existing file.
    pub fn save_object(
        &self,
        object_type: WildlandObject,
        manifest: &Manifest,
        name: &str,
    ) -> Result<PathBuf, ClientError> {
        let dir = self.config.type_dir(object_type);
        std::fs::create_dir_all(&dir)?;
        let data = manifest.to_bytes()?;
        let uuid = manifest_uuid(manifest);

        // Same uuid: overwrite in place.
        if let Some(uuid) = &uuid {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if !path.extension().is_some_and(|ext| ext == "yaml") {
                    continue;
                }
                if let Ok(existing) = std::fs::read(&path) {
                    if let Ok(mut parsed) = Manifest::from_unsigned_bytes(&existing) {
                        // Only the uuid is read; no signature check needed.
                        parsed.skip_signing();
                        if manifest_uuid(&parsed).as_deref() == Some(uuid) {
                            std::fs::write(&path, &data)?;
                            return Ok(path);
                        }
                    }
                }
            }
        }

        let mut candidate = dir.join(format!("{}.{}.yaml", name, object_type.as_str()));
        let mut counter = 0;
        while candidate.exists() {
            counter += 1;
            candidate = dir.join(format!("{}.{}.{}.yaml", name, counter, object_type.as_str()));
        }
        std::fs::write(&candidate, &data)?;
        Ok(candidate)
    }

    /* Storage resolution */

    /// Resolve the storages usable for mounting a container: load every
    /// reference, validate against the container, skip unsupported
    /// backends with a warning, put the primary storage first.
    pub fn get_storages_to_mount(
        &self,
        container: &Container,
    ) -> Result<Vec<Storage>, ClientError> {
        let mut storages = Vec::new();
        let mut seen_ids = std::collections::HashSet::new();

        for reference in container.backends() {
            let storage = match self.resolve_storage_ref(container, reference) {
                Ok(storage) => storage,
                Err(e) => {
                    tracing::warn!(
                        "skipping storage of container {}: {}",
                        container,
                        e
                    );
                    continue;
                }
            };
            if let Err(e) = storage.validate_for(container) {
                tracing::warn!("skipping storage of container {}: {}", container, e);
                continue;
            }
            if !self.registry.supports(storage.storage_type()) {
                tracing::warn!(
                    "skipping storage with unsupported backend {:?} of container {}",
                    storage.storage_type(),
                    container
                );
                continue;
            }
            if !seen_ids.insert(storage.backend_id().to_string()) {
                return Err(ClientError::Object(ObjectError::Invalid(format!(
                    "duplicate backend-id {} in container {}",
                    storage.backend_id(),
                    container
                ))));
            }
            storages.push(storage);
        }

        storages.sort_by_key(|storage| !storage.is_primary());
        Ok(storages)
    }

    fn resolve_storage_ref(
        &self,
        container: &Container,
        reference: &StorageRef,
    ) -> Result<Storage, ClientError> {
        match reference {
            StorageRef::Url(url) => {
                let data = self.read_bytes_from_url(url)?;
                let manifest = Manifest::from_bytes(
                    &data,
                    self.sig.as_ref(),
                    None,
                    SelfSigned::Disallow,
                    None,
                )?;
                Ok(Storage::from_manifest(manifest)?)
            }
            StorageRef::Inline(fields) => {
                let fields = self.fill_inline_storage(container, fields.clone());
                Ok(Storage::from_fields(fields)?)
            }
            StorageRef::Link(link) => {
                let data = self.read_bytes_from_link(container, link)?;
                let manifest = Manifest::from_bytes(
                    &data,
                    self.sig.as_ref(),
                    None,
                    SelfSigned::Disallow,
                    None,
                )?;
                Ok(Storage::from_manifest(manifest)?)
            }
        }
    }

    // Inline storages inherit identity fields from their container.
    fn fill_inline_storage(&self, container: &Container, mut fields: Mapping) -> Mapping {
        if fields.get("owner").is_none() {
            fields.insert("owner".into(), container.owner().into());
        }
        if fields.get("container-path").is_none() {
            if let Some(uuid_path) = container.uuid_path() {
                fields.insert("container-path".into(), uuid_path.into());
            }
        }
        if fields.get("object").is_none() {
            fields.insert("object".into(), "storage".into());
        }
        if fields.get("version").is_none() {
            fields.insert("version".into(), "1".into());
        }
        fields
    }

    /// Resolve a link by instantiating its storage and reading the file.
    pub fn read_bytes_from_link(
        &self,
        container: &Container,
        link: &Link,
    ) -> Result<Vec<u8>, ClientError> {
        let fields = self.fill_inline_storage(container, link.storage_fields().clone());
        let backend = self.registry.construct(fields)?;
        backend.request_mount()?;
        let result = read_backend_file(backend.as_ref(), Path::new(link.file()));
        let _ = backend.request_unmount();
        Ok(result?)
    }

    fn read_bytes_from_url(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let path = match url.strip_prefix("file://") {
            Some(path) => PathBuf::from(path),
            None if url.starts_with('/') => PathBuf::from(url),
            None => {
                return Err(ClientError::NotFound(format!(
                    "unsupported URL scheme: {}",
                    url
                )))
            }
        };
        Ok(std::fs::read(path)?)
    }

    /// Paths under which bridges owned by anyone locally known expose the
    /// given user.
    pub fn get_bridge_paths_for_user(&self, owner: &str) -> Vec<String> {
        let dir = self.config.type_dir(WildlandObject::Bridge);
        let mut paths = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return paths,
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "yaml") {
                continue;
            }
            if let Ok(LoadedObject::Bridge(bridge)) =
                self.load_object_from_file_path(WildlandObject::Bridge, &path)
            {
                if bridge.user_id() == owner {
                    paths.extend(bridge.paths().iter().cloned());
                }
            }
        }
        paths
    }
}

/// Read a whole file out of a backend.
pub fn read_backend_file(
    backend: &dyn StorageBackend,
    path: &Path,
) -> Result<Vec<u8>, FsError> {
    let mut handle = backend.open(path, libc::O_RDONLY)?;
    let mut data = Vec::new();
    let mut offset = 0u64;
    loop {
        let block = handle.read(64 * 1024, offset)?;
        if block.is_empty() {
            break;
        }
        offset += block.len() as u64;
        data.extend_from_slice(&block);
    }
    handle.release()?;
    Ok(data)
}

fn manifest_uuid(manifest: &Manifest) -> Option<String> {
    let paths = manifest
        .fields()
        .ok()?
        .get("paths")
        .and_then(Value::as_sequence)?;
    paths
        .iter()
        .filter_map(Value::as_str)
        .find_map(|path| path.strip_prefix("/.uuid/"))
        .map(str::to_string)
}
