//! Persistent hash memory.
//!
//! One sqlite database per sync daemon, keyed by backend id: the
//! last-known content hash (and freshness token) per `(backend, path)`,
//! plus which backends belong to which container. Opened once per
//! process; access is serialized behind a mutex and driven through a held
//! runtime handle, since callers live on sync threads.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::runtime::Handle;

#[derive(Debug, thiserror::Error)]
pub enum HashDbError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct HashDb {
    pool: SqlitePool,
    handle: Handle,
    write_lock: Mutex<()>,
}

impl HashDb {
    /// Open (creating if necessary) `wlhashes.db` under the base dir.
    pub fn open(base_dir: &Path, handle: Handle) -> Result<Self, HashDbError> {
        let path = base_dir.join("wlhashes.db");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = handle.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS container_backends (
                    container_id TEXT NOT NULL,
                    backend_id TEXT NOT NULL,
                    PRIMARY KEY (container_id, backend_id))",
            )
            .execute(&pool)
            .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS hashes (
                    backend_id TEXT NOT NULL,
                    path TEXT NOT NULL,
                    hash TEXT,
                    token TEXT,
                    PRIMARY KEY (backend_id, path))",
            )
            .execute(&pool)
            .await?;
            Ok::<_, sqlx::Error>(pool)
        })?;
        Ok(Self {
            pool,
            handle,
            write_lock: Mutex::new(()),
        })
    }

    /// Record that the given backends serve a container.
    pub fn update_storages_for_container(
        &self,
        container_id: &str,
        backend_ids: &[String],
    ) -> Result<(), HashDbError> {
        let _guard = self.write_lock.lock();
        self.handle.block_on(async {
            for backend_id in backend_ids {
                sqlx::query("INSERT OR REPLACE INTO container_backends VALUES (?, ?)")
                    .bind(container_id)
                    .bind(backend_id)
                    .execute(&self.pool)
                    .await?;
            }
            Ok(())
        })
    }

    pub fn store_hash(
        &self,
        backend_id: &str,
        path: &Path,
        hash: &str,
        token: Option<&str>,
    ) -> Result<(), HashDbError> {
        self.store_hashes(backend_id, &[(path.to_path_buf(), hash.to_string(), token.map(str::to_string))])
    }

    /// Store a batch of hashes in one transaction.
    pub fn store_hashes(
        &self,
        backend_id: &str,
        entries: &[(PathBuf, String, Option<String>)],
    ) -> Result<(), HashDbError> {
        let _guard = self.write_lock.lock();
        self.handle.block_on(async {
            let mut tx = self.pool.begin().await?;
            for (path, hash, token) in entries {
                sqlx::query("INSERT OR REPLACE INTO hashes VALUES (?, ?, ?, ?)")
                    .bind(backend_id)
                    .bind(path.display().to_string())
                    .bind(hash)
                    .bind(token)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    pub fn remove_hash(&self, backend_id: &str, path: &Path) -> Result<(), HashDbError> {
        let _guard = self.write_lock.lock();
        self.handle.block_on(async {
            sqlx::query("DELETE FROM hashes WHERE backend_id = ? AND path = ?")
                .bind(backend_id)
                .bind(path.display().to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    /// The last-known `(hash, token)` for a path, if any.
    pub fn retrieve_hash(
        &self,
        backend_id: &str,
        path: &Path,
    ) -> Result<Option<(String, Option<String>)>, HashDbError> {
        self.handle.block_on(async {
            let row = sqlx::query(
                "SELECT hash, token FROM hashes WHERE backend_id = ? AND path = ?",
            )
            .bind(backend_id)
            .bind(path.display().to_string())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(|row| (row.get::<String, _>(0), row.get::<Option<String>, _>(1))))
        })
    }

    /// Paths on which two backends of the same container disagree:
    /// `(path, backend_1, backend_2)` tuples.
    pub fn get_conflicts(
        &self,
        container_id: &str,
    ) -> Result<Vec<(String, String, String)>, HashDbError> {
        self.handle.block_on(async {
            let rows = sqlx::query(
                "SELECT DISTINCT h1.path, h1.backend_id, h2.backend_id
                 FROM hashes h1
                 INNER JOIN container_backends c1 ON h1.backend_id = c1.backend_id
                 INNER JOIN container_backends c2 ON c2.container_id = c1.container_id
                     AND c1.backend_id > c2.backend_id
                 INNER JOIN hashes h2 ON h2.backend_id = c2.backend_id
                     AND h1.path = h2.path
                 WHERE h1.hash <> h2.hash AND c1.container_id = ?",
            )
            .bind(container_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows
                .into_iter()
                .map(|row| {
                    (
                        row.get::<String, _>(0),
                        row.get::<String, _>(1),
                        row.get::<String, _>(2),
                    )
                })
                .collect())
        })
    }
}

impl std::fmt::Debug for HashDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashDb").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> (tempfile::TempDir, tokio::runtime::Runtime, HashDb) {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let db = HashDb::open(dir.path(), rt.handle().clone()).unwrap();
        (dir, rt, db)
    }

    #[test]
    fn test_store_and_retrieve() {
        let (_dir, _rt, db) = db();
        let path = Path::new("a/b.txt");
        db.store_hash("backend-1", path, "abc", Some("1.3")).unwrap();

        let (hash, token) = db.retrieve_hash("backend-1", path).unwrap().unwrap();
        assert_eq!(hash, "abc");
        assert_eq!(token.as_deref(), Some("1.3"));

        assert!(db.retrieve_hash("backend-2", path).unwrap().is_none());

        db.remove_hash("backend-1", path).unwrap();
        assert!(db.retrieve_hash("backend-1", path).unwrap().is_none());
    }

    #[test]
    fn test_conflicts_between_container_backends() {
        let (_dir, _rt, db) = db();
        db.update_storages_for_container("uuid-1", &["b1".into(), "b2".into()])
            .unwrap();
        db.store_hash("b1", Path::new("f"), "aaa", None).unwrap();
        db.store_hash("b2", Path::new("f"), "bbb", None).unwrap();
        db.store_hash("b1", Path::new("same"), "xxx", None).unwrap();
        db.store_hash("b2", Path::new("same"), "xxx", None).unwrap();

        let conflicts = db.get_conflicts("uuid-1").unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].0, "f");
    }
}
