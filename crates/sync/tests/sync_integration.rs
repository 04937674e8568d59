//! Syncer scenarios over local-directory backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::Mapping;

use common::storage::{FileEvent, FileEventType, LocalStorageBackend, StorageBackend};
use wildland_sync::naive::Side;
use wildland_sync::{HashDb, NaiveSyncer, SyncState};

struct Fixture {
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    _db_dir: tempfile::TempDir,
    _rt: tokio::runtime::Runtime,
    side_a: PathBuf,
    side_b: PathBuf,
    syncer: Arc<NaiveSyncer>,
    db: Arc<HashDb>,
}

fn backend(dir: &Path, backend_id: &str) -> Arc<dyn StorageBackend> {
    let mut params = Mapping::new();
    params.insert("type".into(), "local".into());
    params.insert("location".into(), dir.display().to_string().into());
    params.insert("backend-id".into(), backend_id.into());
    Arc::new(LocalStorageBackend::from_params(params).unwrap())
}

fn fixture() -> Fixture {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let db = Arc::new(HashDb::open(db_dir.path(), rt.handle().clone()).unwrap());

    let syncer = Arc::new(NaiveSyncer::new(
        backend(dir_a.path(), "backend-a"),
        backend(dir_b.path(), "backend-b"),
        "test",
        Some(db.clone()),
    ));
    Fixture {
        side_a: dir_a.path().to_path_buf(),
        side_b: dir_b.path().to_path_buf(),
        _dirs: (dir_a, dir_b),
        _db_dir: db_dir,
        _rt: rt,
        syncer,
        db,
    }
}

fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let name = path.strip_prefix(dir).unwrap().display().to_string();
                entries.push((name, std::fs::read(&path).unwrap()));
            }
        }
    }
    entries.sort();
    entries
}

#[test]
fn test_one_shot_converges() {
    let fx = fixture();
    std::fs::write(fx.side_a.join("f"), b"abcd").unwrap();
    std::fs::create_dir(fx.side_a.join("sub")).unwrap();
    std::fs::write(fx.side_a.join("sub/deep.txt"), b"deep").unwrap();
    std::fs::write(fx.side_b.join("other"), b"from-b").unwrap();

    fx.syncer.one_shot_sync(false).unwrap();

    assert_eq!(snapshot(&fx.side_a), snapshot(&fx.side_b));
    assert_eq!(fx.syncer.state(), SyncState::Synced);
    assert!(fx.syncer.iter_conflicts().is_empty());

    // Hash memory agrees on both sides.
    let (hash_a, _) = fx
        .db
        .retrieve_hash("backend-a", Path::new("f"))
        .unwrap()
        .unwrap();
    let (hash_b, _) = fx
        .db
        .retrieve_hash("backend-b", Path::new("f"))
        .unwrap()
        .unwrap();
    assert_eq!(hash_a, hash_b);
}

#[test]
fn test_one_shot_unidirectional_leaves_source_alone() {
    let fx = fixture();
    std::fs::write(fx.side_a.join("from-a"), b"a").unwrap();
    std::fs::write(fx.side_b.join("from-b"), b"b").unwrap();

    fx.syncer.one_shot_sync(true).unwrap();

    // Source content flowed to the target, but not the other way.
    assert!(fx.side_b.join("from-a").exists());
    assert!(!fx.side_a.join("from-b").exists());
}

#[test]
fn test_conflict_recorded_not_merged() {
    let fx = fixture();
    std::fs::write(fx.side_a.join("f"), b"aaa").unwrap();
    std::fs::write(fx.side_b.join("f"), b"bbb").unwrap();

    fx.syncer.one_shot_sync(false).unwrap();

    // Both sides unchanged; exactly one conflict for f.
    assert_eq!(std::fs::read(fx.side_a.join("f")).unwrap(), b"aaa");
    assert_eq!(std::fs::read(fx.side_b.join("f")).unwrap(), b"bbb");
    let conflicts = fx.syncer.iter_conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].path, Path::new("f"));
}

#[test]
fn test_continuous_replicates_and_deletes() {
    let fx = fixture();
    std::fs::write(fx.side_a.join("f"), b"abcd").unwrap();

    fx.syncer.one_shot_sync(false).unwrap();
    assert_eq!(std::fs::read(fx.side_b.join("f")).unwrap(), b"abcd");

    // Delete on A; replay the watcher event.
    std::fs::remove_file(fx.side_a.join("f")).unwrap();
    fx.syncer.handle_events(
        Side::Source,
        vec![FileEvent::new(FileEventType::Delete, "f")],
    );
    assert!(!fx.side_b.join("f").exists());
    assert_eq!(fx.syncer.state(), SyncState::Synced);
}

#[test]
fn test_create_event_copies_file() {
    let fx = fixture();
    fx.syncer.one_shot_sync(false).unwrap();

    std::fs::write(fx.side_a.join("new.bin"), b"payload").unwrap();
    fx.syncer.handle_events(
        Side::Source,
        vec![FileEvent::new(FileEventType::Create, "new.bin")],
    );
    assert_eq!(std::fs::read(fx.side_b.join("new.bin")).unwrap(), b"payload");
}

#[test]
fn test_modify_event_updates_target() {
    let fx = fixture();
    std::fs::write(fx.side_a.join("f"), b"v1").unwrap();
    fx.syncer.one_shot_sync(false).unwrap();

    std::fs::write(fx.side_a.join("f"), b"v2-new").unwrap();
    fx.syncer.handle_events(
        Side::Source,
        vec![FileEvent::new(FileEventType::Modify, "f")],
    );
    assert_eq!(std::fs::read(fx.side_b.join("f")).unwrap(), b"v2-new");
}

#[test]
fn test_delete_vs_edit_recreates_survivor() {
    let fx = fixture();
    std::fs::write(fx.side_a.join("f"), b"v1").unwrap();
    fx.syncer.one_shot_sync(false).unwrap();

    // B edits (without the syncer noticing) while A deletes: the
    // surviving side wins and the file is re-created on A.
    std::fs::write(fx.side_b.join("f"), b"edited-on-b").unwrap();
    std::fs::remove_file(fx.side_a.join("f")).unwrap();
    fx.syncer.handle_events(
        Side::Source,
        vec![FileEvent::new(FileEventType::Delete, "f")],
    );

    assert_eq!(std::fs::read(fx.side_a.join("f")).unwrap(), b"edited-on-b");
    assert_eq!(std::fs::read(fx.side_b.join("f")).unwrap(), b"edited-on-b");
    assert_eq!(fx.syncer.iter_conflicts().len(), 1);
}

#[test]
fn test_offline_deletion_replay() {
    let fx = fixture();
    std::fs::write(fx.side_a.join("f"), b"abcd").unwrap();
    fx.syncer.one_shot_sync(false).unwrap();
    assert!(fx.side_b.join("f").exists());

    // Simulate an offline deletion on B, then a fresh one-shot pass with
    // a new syncer sharing the same hash database.
    std::fs::remove_file(fx.side_b.join("f")).unwrap();
    let fresh = Arc::new(NaiveSyncer::new(
        backend(&fx.side_a, "backend-a"),
        backend(&fx.side_b, "backend-b"),
        "test2",
        Some(fx.db.clone()),
    ));
    fresh.one_shot_sync(false).unwrap();

    // B knew exactly this content: the deletion wins and propagates to A.
    assert!(!fx.side_a.join("f").exists());
    assert!(!fx.side_b.join("f").exists());
}

#[test]
fn test_offline_divergent_deletion_recreates() {
    let fx = fixture();
    std::fs::write(fx.side_a.join("f"), b"v1").unwrap();
    fx.syncer.one_shot_sync(false).unwrap();

    // B deletes, A changes the file afterwards: hashes no longer match
    // the recorded state, so the file is copied back instead of deleted.
    std::fs::remove_file(fx.side_b.join("f")).unwrap();
    std::fs::write(fx.side_a.join("f"), b"v2-after").unwrap();

    let fresh = Arc::new(NaiveSyncer::new(
        backend(&fx.side_a, "backend-a"),
        backend(&fx.side_b, "backend-b"),
        "test2",
        Some(fx.db.clone()),
    ));
    fresh.one_shot_sync(false).unwrap();

    assert_eq!(std::fs::read(fx.side_a.join("f")).unwrap(), b"v2-after");
    assert_eq!(std::fs::read(fx.side_b.join("f")).unwrap(), b"v2-after");
}

#[test]
fn test_directory_deletion_cascades() {
    let fx = fixture();
    std::fs::create_dir(fx.side_a.join("dir")).unwrap();
    std::fs::write(fx.side_a.join("dir/inner"), b"x").unwrap();
    fx.syncer.one_shot_sync(false).unwrap();
    assert!(fx.side_b.join("dir/inner").exists());

    std::fs::remove_file(fx.side_a.join("dir/inner")).unwrap();
    std::fs::remove_dir(fx.side_a.join("dir")).unwrap();
    fx.syncer.handle_events(
        Side::Source,
        vec![FileEvent::new(FileEventType::Delete, "dir")],
    );
    assert!(!fx.side_b.join("dir").exists());
}

#[test]
fn test_watcher_driven_continuous_sync() {
    let fx = fixture();
    fx.syncer.start_sync(false).unwrap();

    std::fs::write(fx.side_a.join("live.txt"), b"live").unwrap();

    // The notify watcher delivers the event asynchronously.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !fx.side_b.join("live.txt").exists() {
        assert!(
            std::time::Instant::now() < deadline,
            "file was not replicated in time"
        );
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    assert_eq!(std::fs::read(fx.side_b.join("live.txt")).unwrap(), b"live");

    fx.syncer.stop_sync();
    assert_eq!(fx.syncer.state(), SyncState::Stopped);
}
