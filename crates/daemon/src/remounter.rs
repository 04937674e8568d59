//! Keeps the daemon's mount table convergent with the declared set of
//! containers.
//!
//! Watches manifest files (through daemon watches) and resolved Wildland
//! paths (through [`Search`]), diffs changed containers against the mount
//! table and issues unmount/mount batches. A single failing container
//! never stops the loop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use common::client::{Client, ClientError, Search, WildlandPath};
use common::obj::{Container, Storage, WildlandObject};
use common::storage::FileEventType;

use crate::fs_client::{FsClientError, WatchEvent, WildlandFsClient};

#[derive(Debug, thiserror::Error)]
pub enum RemounterError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    FsClient(#[from] FsClientError),
}

/// The remounter loop state.
pub struct Remounter<'a> {
    client: &'a mut Client,
    fs_client: WildlandFsClient,

    // Filesystem glob patterns, as given.
    patterns: Vec<String>,
    // Wildland paths to keep resolved.
    wlpaths: Vec<WildlandPath>,
    // Derived pattern -> the wlpaths it serves.
    wlpath_patterns: HashMap<String, Vec<WildlandPath>>,

    // Queued operations, flushed after each event batch.
    to_mount: Vec<(Container, Vec<Storage>, Vec<String>)>,
    to_unmount: Vec<i64>,

    // Watched manifest path -> primary mount path of its container.
    main_paths: HashMap<PathBuf, PathBuf>,
    // wlpath -> primary mount paths it currently resolves to.
    wlpath_main_paths: HashMap<String, HashSet<PathBuf>>,
}

impl<'a> Remounter<'a> {
    pub fn new(
        client: &'a mut Client,
        fs_client: WildlandFsClient,
        container_names: &[String],
        additional_patterns: &[String],
    ) -> Result<Self, RemounterError> {
        let mut patterns: Vec<String> = additional_patterns.to_vec();
        let mut wlpaths = Vec::new();
        for name in container_names {
            if WildlandPath::matches(name) {
                wlpaths.push(WildlandPath::from_str(name).map_err(ClientError::from)?);
                continue;
            }
            // Names are manifest paths under the mount dir; watch them as
            // absolute patterns inside the mounted namespace.
            let path = PathBuf::from(name);
            let pattern = match path.strip_prefix(fs_client.mount_dir()) {
                Ok(relative) => format!("/{}", relative.display()),
                Err(_) => name.clone(),
            };
            patterns.push(pattern);
        }
        Ok(Self {
            client,
            fs_client,
            patterns,
            wlpaths,
            wlpath_patterns: HashMap::new(),
            to_mount: Vec::new(),
            to_unmount: Vec::new(),
            main_paths: HashMap::new(),
            wlpath_main_paths: HashMap::new(),
        })
    }

    /// Resolve the watched Wildland paths into concrete patterns,
    /// mounting the necessary catalog containers (uniquely, under their
    /// owner hierarchy, so they never pollute the user view).
    ///
    /// Returns whether the derived pattern set changed.
    pub fn init_wlpath_patterns(&mut self) -> Result<bool, RemounterError> {
        let mut patterns: HashMap<String, Vec<WildlandPath>> = HashMap::new();

        for wlpath in self.wlpaths.clone() {
            let result = Search::new(self.client, wlpath.clone()).get_watch_params();
            match result {
                Ok((sources, path_patterns)) => {
                    // Mount only catalogs not yet present.
                    let mut batch = Vec::new();
                    for source in sources {
                        let mounted = self
                            .fs_client
                            .find_primary_storage_id(&source.container)?
                            .is_some();
                        if !mounted {
                            batch.push((source.container, source.storages, Vec::new()));
                        }
                    }
                    if let Err(e) =
                        self.fs_client
                            .mount_multiple_containers(&batch, false, true)
                    {
                        tracing::error!(
                            "failed to mount container(s) to watch WL path {}: {}",
                            wlpath,
                            e
                        );
                        // Keep the old patterns for this path.
                        for (pattern, paths) in &self.wlpath_patterns {
                            if paths.contains(&wlpath) {
                                patterns
                                    .entry(pattern.clone())
                                    .or_default()
                                    .push(wlpath.clone());
                            }
                        }
                        continue;
                    }
                    for pattern in path_patterns {
                        patterns.entry(pattern).or_default().push(wlpath.clone());
                    }
                }
                Err(e) => {
                    tracing::error!("failed to resolve WL path {}: {}", wlpath, e);
                }
            }
        }

        let changed = patterns.keys().collect::<HashSet<_>>()
            != self.wlpath_patterns.keys().collect::<HashSet<_>>();
        self.wlpath_patterns = patterns;
        Ok(changed)
    }

    /// All patterns to watch in the current iteration.
    pub fn effective_patterns(&self) -> Vec<String> {
        let mut patterns = self.patterns.clone();
        patterns.extend(self.wlpath_patterns.keys().cloned());
        patterns
    }

    /// Run the main loop. Never returns unless the watch subscription
    /// cannot be (re)established.
    pub fn run(&mut self) -> Result<(), RemounterError> {
        self.init_wlpath_patterns()?;
        loop {
            let patterns = self.effective_patterns();
            tracing::info!("using patterns: {:?}", patterns);
            let mut subscription = self.fs_client.watch(&patterns, true)?;
            loop {
                let events = subscription.next_batch()?;
                let any_wlpath_changed = self.handle_events(&events);

                self.unmount_pending();
                self.mount_pending();

                if any_wlpath_changed && self.init_wlpath_patterns()? {
                    tracing::info!("wlpath patterns changed, re-registering watches");
                    break;
                }
            }
        }
    }

    /// Handle one event batch. Returns whether any Wildland-path pattern
    /// was touched (the caller then re-derives patterns).
    pub fn handle_events(&mut self, events: &[WatchEvent]) -> bool {
        let mut any_wlpath_changed = false;
        let mut wlpaths_processed: HashSet<String> = HashSet::new();

        for event in events {
            let result = if let Some(wlpaths) = self.wlpath_patterns.get(&event.pattern) {
                any_wlpath_changed = true;
                let wlpaths = wlpaths.clone();
                let mut result = Ok(());
                for wlpath in wlpaths {
                    let key = wlpath.to_string();
                    if wlpaths_processed.insert(key) {
                        if let Err(e) = self.handle_wlpath_event(event, &wlpath) {
                            result = Err(e);
                        }
                    }
                }
                result
            } else {
                self.handle_file_event(event)
            };
            if let Err(e) = result {
                tracing::error!("error handling event {:?}: {}", event.path, e);
            }
        }
        any_wlpath_changed
    }

    /// Re-resolve a Wildland path after one of its watched manifests
    /// changed; queue mounts for changed containers and unmounts for
    /// containers the path no longer resolves to.
    fn handle_wlpath_event(
        &mut self,
        event: &WatchEvent,
        wlpath: &WildlandPath,
    ) -> Result<(), RemounterError> {
        tracing::info!(
            "WL path {} event {}: {}",
            wlpath,
            event.event_type,
            event.path.display()
        );

        let containers = Search::new(self.client, wlpath.clone()).read_container();
        let key = wlpath.to_string();
        let mut new_main_paths = HashSet::new();

        let containers = match containers {
            Ok(containers) => containers,
            Err(e) => {
                // Do not forget earlier containers on a failed search.
                self.wlpath_main_paths
                    .entry(key)
                    .or_default()
                    .extend(new_main_paths);
                return Err(e.into());
            }
        };

        for container in containers {
            if let Some(uuid_path) = container.uuid_path() {
                new_main_paths.insert(WildlandFsClient::get_user_container_path(
                    container.owner(),
                    uuid_path,
                ));
            }
            self.handle_changed_container(&container)?;
        }

        let stale = self
            .wlpath_main_paths
            .get(&key)
            .map(|previous| previous - &new_main_paths)
            .unwrap_or_default();
        for main_path in stale {
            match self.fs_client.find_storage_id_by_path(&main_path)? {
                Some(storage_id) => {
                    tracing::info!("  (unmount {})", storage_id);
                    self.to_unmount.push(storage_id);
                }
                None => tracing::info!("  (not mounted)"),
            }
        }
        self.wlpath_main_paths.insert(key, new_main_paths);
        Ok(())
    }

    /// Handle an event about a watched manifest file.
    fn handle_file_event(&mut self, event: &WatchEvent) -> Result<(), RemounterError> {
        tracing::info!("event {}: {}", event.event_type, event.path.display());

        let known_main_path = self.main_paths.get(&event.path).cloned();

        if event.event_type == FileEventType::Delete {
            self.main_paths.remove(&event.path);
            let storage_id = match known_main_path {
                Some(main_path) => self.fs_client.find_storage_id_by_path(&main_path)?,
                None => None,
            };
            match storage_id {
                Some(storage_id) => {
                    tracing::info!("  (unmount {})", storage_id);
                    self.to_unmount.push(storage_id);
                }
                None => tracing::info!("  (not mounted)"),
            }
            return Ok(());
        }

        // Create or modify: load the manifest through the mounted tree.
        let relative = event
            .path
            .strip_prefix("/")
            .unwrap_or(&event.path)
            .to_path_buf();
        let local_path = self.fs_client.mount_dir().join(relative);
        let container = match self
            .client
            .load_object_from_file_path(WildlandObject::Container, &local_path)?
        {
            common::client::LoadedObject::Container(container) => container,
            _ => return Ok(()),
        };

        if let Some(uuid_path) = container.uuid_path() {
            self.main_paths.insert(
                event.path.clone(),
                WildlandFsClient::get_user_container_path(container.owner(), uuid_path),
            );
        }
        self.handle_changed_container(&container)
    }

    /// Queue mount/remount for a container: new containers are mounted
    /// whole, known ones get their orphaned storages unmounted and their
    /// stale storages remounted.
    fn handle_changed_container(&mut self, container: &Container) -> Result<(), RemounterError> {
        let mut user_paths = self.client.get_bridge_paths_for_user(container.owner());
        if self.client.config().default_user.as_deref() == Some(container.owner()) {
            user_paths.insert(0, "/".to_string());
        }
        let storages = self.client.get_storages_to_mount(container)?;

        if self.fs_client.find_primary_storage_id(container)?.is_none() {
            tracing::info!("  new: {}", container);
            self.to_mount
                .push((container.clone(), storages, user_paths));
            return Ok(());
        }

        for path in self
            .fs_client
            .get_orphaned_container_storage_paths(container, &storages)?
        {
            if let Some(storage_id) = self.fs_client.find_storage_id_by_path(&path)? {
                tracing::info!("  (removing orphan {} @ id: {})", path.display(), storage_id);
                self.to_unmount.push(storage_id);
            }
        }

        let mut to_remount = Vec::new();
        for storage in storages {
            if self
                .fs_client
                .should_remount(container, &storage, &user_paths)?
            {
                tracing::info!("  (remounting: {})", storage.backend_id());
                to_remount.push(storage);
            } else {
                tracing::info!("  (not changed: {})", storage.backend_id());
            }
        }
        if !to_remount.is_empty() {
            self.to_mount
                .push((container.clone(), to_remount, user_paths));
        }
        Ok(())
    }

    /// Unmount queued storages. Errors are logged, never propagated.
    pub fn unmount_pending(&mut self) {
        for storage_id in self.to_unmount.drain(..) {
            if let Err(e) = self.fs_client.unmount_storage(storage_id) {
                tracing::error!("failed to unmount storage {}: {}", storage_id, e);
            }
        }
        self.fs_client.clear_cache();
    }

    /// Mount queued storages in one batched command with `remount=true`.
    pub fn mount_pending(&mut self) {
        let batch = std::mem::take(&mut self.to_mount);
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.fs_client.mount_multiple_containers(&batch, true, false) {
            tracing::error!("failed to mount some storages: {}", e);
        }
    }

    /* Test hooks */

    pub fn pending_unmounts(&self) -> &[i64] {
        &self.to_unmount
    }

    pub fn pending_mounts(&self) -> &[(Container, Vec<Storage>, Vec<String>)] {
        &self.to_mount
    }
}
