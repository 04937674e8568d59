//! Remounter behaviour against an in-process daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::client::{Client, ClientConfig};
use common::control::ControlServer;
use common::crypto::{DummySigContext, SigContext};
use common::manifest::{CommandSet, Manifest, Schema};
use common::obj::{Container, StorageRef};
use common::storage::{BackendRegistry, FileEventType};
use serde_yaml::Mapping;
use wildland_daemon::fs_client::{WatchEvent, WildlandFsClient};
use wildland_daemon::{Remounter, WildlandFs};

const UUID: &str = "7a5af4d9-8d31-4e4c-9a8b-4a24cc1b9d6f";

struct Harness {
    _base: tempfile::TempDir,
    fs: Arc<WildlandFs>,
    server: Option<common::control::ServerHandle>,
    socket: PathBuf,
    mount_dir: PathBuf,
    backing: PathBuf,
    owner: String,
    sig: DummySigContext,
}

async fn harness() -> Harness {
    let base = tempfile::tempdir().unwrap();
    let socket = base.path().join("wlfuse.sock");
    let mount_dir = base.path().join("mnt");
    let backing = base.path().join("backing");
    std::fs::create_dir_all(mount_dir.join("manifests")).unwrap();
    std::fs::create_dir_all(&backing).unwrap();
    std::fs::write(backing.join("file1"), b"content").unwrap();

    let mut sig = DummySigContext::new();
    let (owner, _) = sig.generate().unwrap();

    let fs = Arc::new(WildlandFs::new(
        BackendRegistry::with_defaults(),
        Some(owner.clone()),
    ));
    let server = ControlServer::new(fs.clone(), Schema::load_commands(CommandSet::Fs).unwrap());
    let handle = server.start(&socket).unwrap();

    Harness {
        fs,
        server: Some(handle),
        socket,
        mount_dir,
        backing,
        owner,
        sig,
        _base: base,
    }
}

fn container_manifest(harness: &Harness, extra_paths: &[&str]) -> Vec<u8> {
    let mut inline = Mapping::new();
    inline.insert("type".into(), "local".into());
    inline.insert(
        "location".into(),
        harness.backing.display().to_string().into(),
    );
    inline.insert("backend-id".into(), "b1".into());

    let mut paths = vec![format!("/.uuid/{}", UUID), "/path".to_string()];
    paths.extend(extra_paths.iter().map(|p| p.to_string()));

    let container = Container::new(&harness.owner, paths, vec![StorageRef::Inline(inline)]);
    let mut manifest = Manifest::from_fields(container.to_fields().unwrap()).unwrap();
    manifest.sign(&harness.sig, false).unwrap();
    manifest.to_bytes().unwrap()
}

fn write_manifest(harness: &Harness, data: &[u8]) {
    std::fs::write(
        harness.mount_dir.join("manifests/c.container.yaml"),
        data,
    )
    .unwrap();
}

fn event(event_type: FileEventType) -> WatchEvent {
    WatchEvent {
        event_type,
        path: PathBuf::from("/manifests/c.container.yaml"),
        pattern: "/manifests/*.yaml".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remounter_mounts_and_remounts_on_change() {
    let harness = harness().await;
    let manifest_v1 = container_manifest(&harness, &[]);
    let manifest_v2 = container_manifest(&harness, &["/new/path"]);
    write_manifest(&harness, &manifest_v1);

    let fs = harness.fs.clone();
    let socket = harness.socket.clone();
    let owner = harness.owner.clone();
    let sig = harness.sig.clone();
    let base_dir = harness.mount_dir.parent().unwrap().to_path_buf();
    let mount_dir = harness.mount_dir.clone();

    tokio::task::spawn_blocking(move || {
        let mut config = ClientConfig::new(&base_dir);
        config.default_user = Some(owner.clone());
        let mut client = Client::new(config, Box::new(sig));

        let fs_client = WildlandFsClient::new(socket.clone(), mount_dir.clone());
        let mut remounter = Remounter::new(&mut client, fs_client, &[], &[]).unwrap();

        // Initial create event mounts the container.
        remounter.handle_events(&[event(FileEventType::Create)]);
        assert_eq!(remounter.pending_mounts().len(), 1);
        assert!(remounter.pending_unmounts().is_empty());
        remounter.unmount_pending();
        remounter.mount_pending();

        let paths = fs.paths();
        let uuid_main = format!("/.users/{}/.uuid/{}", owner, UUID);
        assert!(paths.contains_key(&uuid_main));
        assert!(paths.contains_key("/path"));
        assert!(!paths.contains_key("/new/path"));
        let first_id = paths[&uuid_main][0];

        // Unchanged manifest: nothing to do.
        remounter.handle_events(&[event(FileEventType::Modify)]);
        assert!(remounter.pending_mounts().is_empty());
        assert!(remounter.pending_unmounts().is_empty());

        // The manifest gains /new/path: exactly one remount, no unmount.
        std::fs::write(mount_dir.join("manifests/c.container.yaml"), &manifest_v2).unwrap();
        remounter.handle_events(&[event(FileEventType::Modify)]);
        assert_eq!(remounter.pending_mounts().len(), 1);
        assert!(remounter.pending_unmounts().is_empty());
        remounter.unmount_pending();
        remounter.mount_pending();

        let paths = fs.paths();
        assert!(paths.contains_key("/path"));
        assert!(paths.contains_key("/new/path"));
        // Replaced atomically: one storage, with a fresh id.
        assert_eq!(paths[&uuid_main].len(), 1);
        assert_ne!(paths[&uuid_main][0], first_id);

        // Delete event unmounts.
        std::fs::remove_file(mount_dir.join("manifests/c.container.yaml")).unwrap();
        remounter.handle_events(&[event(FileEventType::Delete)]);
        assert_eq!(remounter.pending_unmounts().len(), 1);
        remounter.unmount_pending();
        remounter.mount_pending();

        let paths = fs.paths();
        assert!(!paths.contains_key("/path"));
    })
    .await
    .unwrap();

    harness.server.unwrap().stop().await;
}
