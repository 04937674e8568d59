//! Library side of the control protocol: what the CLI and the remounter
//! use to talk to a running mount daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use common::client::TrustedLocationProvider;
use common::control::{ControlClient, ControlClientError};
use common::obj::{Container, Storage};
use common::storage::FileEventType;

#[derive(Debug, thiserror::Error)]
pub enum FsClientError {
    #[error(transparent)]
    Control(#[from] ControlClientError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot resolve to storage: {0}")]
    NoStorage(String),

    #[error("unexpected daemon response: {0}")]
    Protocol(String),
}

/// A change event as seen by control clients: the event type, the full
/// path in the mounted namespace and the pattern that matched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: FileEventType,
    pub path: PathBuf,
    pub pattern: String,
}

/// Per-storage info snapshot from the daemon.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub paths: Vec<PathBuf>,
    pub storage_type: String,
    pub tag: Option<String>,
    pub trusted_owner: Option<String>,
}

/// Client for the mount daemon.
///
/// Keeps `paths` and `info` snapshots cached between calls; callers that
/// mutate the mount table must [`WildlandFsClient::clear_cache`].
pub struct WildlandFsClient {
    socket_path: PathBuf,
    mount_dir: PathBuf,
    path_cache: Option<HashMap<PathBuf, Vec<i64>>>,
    info_cache: Option<HashMap<i64, StorageInfo>>,
}

impl WildlandFsClient {
    pub fn new(socket_path: PathBuf, mount_dir: PathBuf) -> Self {
        Self {
            socket_path,
            mount_dir,
            path_cache: None,
            info_cache: None,
        }
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    pub fn run_command(&self, cmd: &str, args: Value) -> Result<Value, FsClientError> {
        let mut client = ControlClient::connect(&self.socket_path)?;
        Ok(client.run_command(cmd, args)?)
    }

    pub fn clear_cache(&mut self) {
        self.path_cache = None;
        self.info_cache = None;
    }

    /* Snapshots */

    /// Mounted storage ids by path.
    pub fn get_paths(&mut self) -> Result<&HashMap<PathBuf, Vec<i64>>, FsClientError> {
        if self.path_cache.is_none() {
            let data = self.run_command("paths", json!({}))?;
            let map = data
                .as_object()
                .ok_or_else(|| FsClientError::Protocol("paths is not an object".into()))?;
            let mut cache = HashMap::new();
            for (path, idents) in map {
                let idents = idents
                    .as_array()
                    .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                cache.insert(PathBuf::from(path), idents);
            }
            self.path_cache = Some(cache);
        }
        Ok(self.path_cache.as_ref().unwrap())
    }

    /// Storage info by id.
    pub fn get_info(&mut self) -> Result<&HashMap<i64, StorageInfo>, FsClientError> {
        if self.info_cache.is_none() {
            let data = self.run_command("info", json!({}))?;
            let map = data
                .as_object()
                .ok_or_else(|| FsClientError::Protocol("info is not an object".into()))?;
            let mut cache = HashMap::new();
            for (ident, info) in map {
                let ident: i64 = ident
                    .parse()
                    .map_err(|_| FsClientError::Protocol("bad storage id".into()))?;
                let paths = info
                    .get("paths")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(PathBuf::from)
                            .collect()
                    })
                    .unwrap_or_default();
                let extra = info.get("extra").cloned().unwrap_or(json!({}));
                cache.insert(
                    ident,
                    StorageInfo {
                        paths,
                        storage_type: info
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        tag: extra.get("tag").and_then(Value::as_str).map(str::to_string),
                        trusted_owner: extra
                            .get("trusted-owner")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    },
                );
            }
            self.info_cache = Some(cache);
        }
        Ok(self.info_cache.as_ref().unwrap())
    }

    /* Mounting */

    pub fn unmount_storage(&self, storage_id: i64) -> Result<(), FsClientError> {
        self.run_command("unmount", json!({ "storage-id": storage_id }))?;
        Ok(())
    }

    /// Mount a batch of containers in one daemon command.
    pub fn mount_multiple_containers(
        &mut self,
        batch: &[(Container, Vec<Storage>, Vec<String>)],
        remount: bool,
        unique_path_only: bool,
    ) -> Result<(), FsClientError> {
        let mut items = Vec::new();
        for (container, storages, user_paths) in batch {
            for storage in storages {
                items.push(self.get_command_for_mount_container(
                    container,
                    storage,
                    user_paths,
                    remount,
                    unique_path_only,
                ));
            }
        }
        if items.is_empty() {
            return Ok(());
        }
        self.run_command("mount", json!({ "items": items }))?;
        self.clear_cache();
        Ok(())
    }

    /// Build one `mount` item for a container's storage.
    ///
    /// Every mount carries its owner-scoped paths (`/.users/<owner>/…`),
    /// a backend-unique path (`…/.backends/<uuid>/<backend-id>`) and, for
    /// each user path (e.g. `/` for the default user, bridge paths for
    /// others), the user-visible paths.
    pub fn get_command_for_mount_container(
        &self,
        container: &Container,
        storage: &Storage,
        user_paths: &[String],
        remount: bool,
        unique_path_only: bool,
    ) -> Value {
        let paths = self.get_mount_paths(container, storage, user_paths, unique_path_only);
        let params = common::manifest::yaml_to_json(&serde_yaml::Value::Mapping(
            storage.params().clone(),
        ))
        .unwrap_or(json!({}));
        let trusted_owner = storage.is_trusted().then(|| storage.owner().to_string());
        json!({
            "paths": paths,
            "storage": params,
            "extra": {
                "tag": Self::get_storage_tag(&paths, &params),
                "trusted-owner": trusted_owner,
            },
            "remount": remount,
        })
    }

    fn get_mount_paths(
        &self,
        container: &Container,
        storage: &Storage,
        user_paths: &[String],
        unique_path_only: bool,
    ) -> Vec<String> {
        let owner = container.owner();
        let unique_path = container
            .uuid()
            .map(|uuid| {
                format!(
                    "/.users/{}/.backends/{}/{}",
                    owner,
                    uuid,
                    storage.backend_id()
                )
            })
            .unwrap_or_else(|| format!("/.users/{}/.backends/{}", owner, storage.backend_id()));
        if unique_path_only {
            return vec![unique_path];
        }

        let mut paths = Vec::new();
        for path in container.expanded_paths() {
            paths.push(Self::get_user_path(owner, &path));
        }
        paths.push(unique_path);
        for user_path in user_paths {
            for path in container.expanded_paths() {
                paths.push(format!(
                    "{}/{}",
                    user_path.trim_end_matches('/'),
                    path.trim_start_matches('/')
                ));
            }
        }
        paths
    }

    /// Prepend an absolute path with the owner namespace.
    pub fn get_user_path(owner: &str, path: &str) -> String {
        format!("/.users/{}/{}", owner, path.trim_start_matches('/'))
    }

    /// The daemon-side primary path of a container.
    pub fn get_user_container_path(owner: &str, container_path: &str) -> PathBuf {
        PathBuf::from(Self::get_user_path(owner, container_path))
    }

    /// Hash of `(paths, params)`: decides whether a mounted storage is
    /// stale and needs a remount.
    pub fn get_storage_tag(paths: &[String], params: &Value) -> String {
        let canonical = serde_json::to_string(&json!({
            "paths": paths,
            "params": sorted_json(params),
        }))
        .unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /* Queries */

    pub fn find_storage_id_by_path(&mut self, path: &Path) -> Result<Option<i64>, FsClientError> {
        let paths = self.get_paths()?;
        Ok(paths.get(path).and_then(|idents| idents.first().copied()))
    }

    /// The storage mounted at the container's primary path, if any.
    pub fn find_primary_storage_id(
        &mut self,
        container: &Container,
    ) -> Result<Option<i64>, FsClientError> {
        let Some(uuid_path) = container.uuid_path() else {
            return Ok(None);
        };
        let main_path = Self::get_user_container_path(container.owner(), uuid_path);
        self.find_storage_id_by_path(&main_path)
    }

    /// All storages serving a path (or a glob pattern under a mount):
    /// `(storage id, mount path, relative remainder)`.
    pub fn find_all_storage_ids_for_path(
        &mut self,
        path: &Path,
    ) -> Result<Vec<(i64, PathBuf, PathBuf)>, FsClientError> {
        let paths = self.get_paths()?;
        let mut found = Vec::new();
        for (mount_path, idents) in paths {
            if let Ok(relpath) = path.strip_prefix(mount_path) {
                for ident in idents {
                    found.push((*ident, mount_path.clone(), relpath.to_path_buf()));
                }
            }
        }
        // Longest (most specific) mount path first.
        found.sort_by_key(|(_, mount_path, _)| std::cmp::Reverse(mount_path.components().count()));
        Ok(found)
    }

    /// Does this storage need a remount? Compares the mounted tag with
    /// the tag of the would-be mount command.
    pub fn should_remount(
        &mut self,
        container: &Container,
        storage: &Storage,
        user_paths: &[String],
    ) -> Result<bool, FsClientError> {
        let Some(storage_id) = self.find_primary_storage_id(container)? else {
            return Ok(true);
        };
        let paths = self.get_mount_paths(container, storage, user_paths, false);
        let params = common::manifest::yaml_to_json(&serde_yaml::Value::Mapping(
            storage.params().clone(),
        ))
        .unwrap_or(json!({}));
        let tag = Self::get_storage_tag(&paths, &params);
        let info = self.get_info()?;
        Ok(info
            .get(&storage_id)
            .and_then(|entry| entry.tag.as_deref())
            != Some(tag.as_str()))
    }

    /// Paths of mounted storages belonging to a container that are no
    /// longer among its declared storages.
    pub fn get_orphaned_container_storage_paths(
        &mut self,
        container: &Container,
        storages: &[Storage],
    ) -> Result<Vec<PathBuf>, FsClientError> {
        let Some(uuid) = container.uuid() else {
            return Ok(Vec::new());
        };
        let prefix = format!("/.users/{}/.backends/{}/", container.owner(), uuid);
        let keep: Vec<String> = storages
            .iter()
            .map(|storage| format!("{}{}", prefix, storage.backend_id()))
            .collect();

        let paths = self.get_paths()?;
        let mut orphans = Vec::new();
        for mount_path in paths.keys() {
            let text = mount_path.display().to_string();
            if text.starts_with(&prefix) && !keep.contains(&text) {
                orphans.push(mount_path.clone());
            }
        }
        Ok(orphans)
    }

    /* Watching */

    /// Open a long-lived subscription over the given absolute patterns.
    ///
    /// With `with_initial`, files already present under the mount dir
    /// yield one synthetic `CREATE` batch first.
    pub fn watch(
        &mut self,
        patterns: &[String],
        with_initial: bool,
    ) -> Result<WatchSubscription, FsClientError> {
        let mut client = ControlClient::connect(&self.socket_path)?;
        let mut watches: HashMap<u64, (PathBuf, String)> = HashMap::new();

        for pattern in patterns {
            let found = self.find_all_storage_ids_for_path(Path::new(pattern))?;
            if found.is_empty() {
                return Err(FsClientError::NoStorage(pattern.clone()));
            }
            for (storage_id, storage_path, relpattern) in found {
                let relpattern = relpattern.display().to_string();
                tracing::debug!("watching {}:{}", storage_id, relpattern);
                let watch_id = client
                    .run_command(
                        "add-watch",
                        json!({ "storage-id": storage_id, "pattern": relpattern }),
                    )?
                    .as_u64()
                    .ok_or_else(|| FsClientError::Protocol("add-watch returned no id".into()))?;
                watches.insert(watch_id, (storage_path, pattern.clone()));
            }
        }

        let initial = if with_initial {
            let mut events = Vec::new();
            for pattern in patterns {
                for path in glob_mount_dir(&self.mount_dir, pattern)? {
                    events.push(WatchEvent {
                        event_type: FileEventType::Create,
                        path,
                        pattern: pattern.clone(),
                    });
                }
            }
            (!events.is_empty()).then_some(events)
        } else {
            None
        };

        Ok(WatchSubscription {
            client,
            watches,
            initial,
        })
    }
}

/// A live watch subscription; iterate to receive event batches.
pub struct WatchSubscription {
    client: ControlClient,
    watches: HashMap<u64, (PathBuf, String)>,
    initial: Option<Vec<WatchEvent>>,
}

impl WatchSubscription {
    /// Block until the next batch (the synthetic initial batch first).
    pub fn next_batch(&mut self) -> Result<Vec<WatchEvent>, FsClientError> {
        if let Some(initial) = self.initial.take() {
            return Ok(initial);
        }
        loop {
            let raw = self.client.wait_event()?;
            let mut events = Vec::new();
            for event in raw {
                let Some(watch_id) = event.get("watch-id").and_then(Value::as_u64) else {
                    continue;
                };
                let Some((storage_path, pattern)) = self.watches.get(&watch_id) else {
                    continue;
                };
                let Some(event_type) = event
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(parse_event_type)
                else {
                    continue;
                };
                let relpath = event.get("path").and_then(Value::as_str).unwrap_or("");
                events.push(WatchEvent {
                    event_type,
                    path: storage_path.join(relpath.trim_start_matches('/')),
                    pattern: pattern.clone(),
                });
            }
            if !events.is_empty() {
                return Ok(events);
            }
        }
    }
}

fn parse_event_type(name: &str) -> Option<FileEventType> {
    match name {
        "CREATE" => Some(FileEventType::Create),
        "MODIFY" => Some(FileEventType::Modify),
        "DELETE" => Some(FileEventType::Delete),
        _ => FileEventType::from_str(&name.to_ascii_lowercase()),
    }
}

/// Expand a glob pattern against the mounted tree, returning fs-absolute
/// paths (rooted at `/`, not at the mount dir).
fn glob_mount_dir(mount_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, FsClientError> {
    let matcher = match globset::GlobBuilder::new(pattern.trim_start_matches('/'))
        .build()
    {
        Ok(glob) => glob.compile_matcher(),
        Err(_) => return Ok(Vec::new()),
    };
    let mut result = Vec::new();
    let mut pending = vec![mount_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(mount_dir) {
                if matcher.is_match(relative) {
                    result.push(Path::new("/").join(relative));
                }
            }
        }
    }
    result.sort();
    Ok(result)
}

/// Trust resolution through the daemon: a local path inside a trusted
/// mounted storage maps to that storage's owner.
pub struct DaemonTrustProvider {
    socket_path: PathBuf,
    mount_dir: PathBuf,
}

impl DaemonTrustProvider {
    pub fn new(socket_path: PathBuf, mount_dir: PathBuf) -> Self {
        Self {
            socket_path,
            mount_dir,
        }
    }
}

impl TrustedLocationProvider for DaemonTrustProvider {
    fn trusted_owner(&self, local_path: &Path) -> Option<String> {
        let relative = local_path.strip_prefix(&self.mount_dir).ok()?;
        let fs_path = Path::new("/").join(relative);
        let mut client = ControlClient::connect(&self.socket_path).ok()?;
        let info = client
            .run_command("fileinfo", json!({ "path": fs_path.display().to_string() }))
            .ok()?;
        let storage = info.get("storage")?;
        // Only trusted storages propagate their owner.
        let mut fs_client =
            WildlandFsClient::new(self.socket_path.clone(), self.mount_dir.clone());
        let storage_id = storage.get("id")?.as_i64()?;
        let trusted = fs_client
            .get_info()
            .ok()?
            .get(&storage_id)?
            .trusted_owner
            .clone();
        trusted
    }
}

fn sorted_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| key.as_str());
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, val)| (key.clone(), sorted_json(val)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sorted_json).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_tag_is_stable() {
        let params = json!({"type": "local", "location": "/srv"});
        let shuffled = json!({"location": "/srv", "type": "local"});
        let paths = vec!["/a".to_string(), "/b".to_string()];

        let tag1 = WildlandFsClient::get_storage_tag(&paths, &params);
        let tag2 = WildlandFsClient::get_storage_tag(&paths, &shuffled);
        assert_eq!(tag1, tag2);

        let other_paths = vec!["/a".to_string()];
        assert_ne!(
            tag1,
            WildlandFsClient::get_storage_tag(&other_paths, &params)
        );
    }

    #[test]
    fn test_user_path() {
        assert_eq!(
            WildlandFsClient::get_user_path("0xaaa", "/data"),
            "/.users/0xaaa/data"
        );
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(parse_event_type("CREATE"), Some(FileEventType::Create));
        assert_eq!(parse_event_type("delete"), Some(FileEventType::Delete));
        assert_eq!(parse_event_type("??"), None);
    }
}
