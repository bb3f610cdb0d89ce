//! SQLite-backed state store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::{Database, db_err};
use crate::runtime::types::SandboxKey;
use crate::sandbox::Sandbox;
use crate::store::keys::sandbox_key;
use crate::store::{StateStore, TransitionCommit};
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// State store shared by every process that opens the same database file.
///
/// Expiry uses wall-clock milliseconds so that processes agree on it.
/// Statements run on the blocking pool: a write contended by another process
/// can sit in SQLite's busy timeout.
#[derive(Clone, Debug)]
pub struct SqliteStateStore {
    db: Database,
}

impl SqliteStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, op: F) -> SandplaneResult<T>
    where
        F: FnOnce(&mut Connection) -> SandplaneResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&mut db.conn()))
            .await
            .map_err(|e| SandplaneError::Internal(format!("State store task failed: {}", e)))?
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expires_at(ttl: Duration) -> i64 {
    now_ms().saturating_add(ttl.as_millis() as i64)
}

const UPSERT_SANDBOX: &str = "
    INSERT INTO sandboxes (key, team_id, sandbox_id, state, data, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT(key) DO UPDATE SET
        state = excluded.state,
        data = excluded.data,
        updated_at = excluded.updated_at
";

const UPSERT_MARKER: &str = "
    INSERT INTO markers (key, value, expires_at) VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET
        value = excluded.value,
        expires_at = excluded.expires_at
";

fn upsert_sandbox(conn: &Connection, sandbox: &Sandbox) -> SandplaneResult<()> {
    let data = serde_json::to_string(sandbox)?;
    db_err!(conn.execute(
        UPSERT_SANDBOX,
        params![
            sandbox_key(&sandbox.key()),
            sandbox.team_id.to_string(),
            sandbox.sandbox_id,
            sandbox.state.as_str(),
            data,
            Utc::now().to_rfc3339(),
        ],
    ))?;
    Ok(())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get_sandbox(&self, key: &SandboxKey) -> SandplaneResult<Option<Sandbox>> {
        let row_key = sandbox_key(key);
        let data: Option<String> = self
            .blocking(move |conn| {
                db_err!(
                    conn.query_row(
                        "SELECT data FROM sandboxes WHERE key = ?1",
                        params![row_key],
                        |row| row.get(0),
                    )
                    .optional()
                )
            })
            .await?;

        data.map(|raw| serde_json::from_str::<Sandbox>(&raw).map_err(SandplaneError::from))
            .transpose()
    }

    async fn insert_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()> {
        let data = serde_json::to_string(sandbox)?;
        let row_key = sandbox_key(&sandbox.key());
        let team_id = sandbox.team_id.to_string();
        let sandbox_id = sandbox.sandbox_id.clone();
        let state = sandbox.state.as_str();

        self.blocking(move |conn| {
            let inserted = db_err!(conn.execute(
                "INSERT OR IGNORE INTO sandboxes (key, team_id, sandbox_id, state, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row_key, team_id, sandbox_id, state, data, Utc::now().to_rfc3339()],
            ))?;

            if inserted == 0 {
                return Err(SandplaneError::AlreadyExists(sandbox_id));
            }
            Ok(())
        })
        .await
    }

    async fn put_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()> {
        let sandbox = sandbox.clone();
        self.blocking(move |conn| upsert_sandbox(conn, &sandbox))
            .await
    }

    async fn remove_sandbox(&self, key: &SandboxKey) -> SandplaneResult<bool> {
        let row_key = sandbox_key(key);
        self.blocking(move |conn| {
            let deleted = db_err!(conn.execute(
                "DELETE FROM sandboxes WHERE key = ?1",
                params![row_key],
            ))?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn get_marker(&self, key: &str) -> SandplaneResult<Option<String>> {
        let key = key.to_string();
        self.blocking(move |conn| {
            db_err!(
                conn.query_row(
                    "SELECT value FROM markers WHERE key = ?1 AND expires_at > ?2",
                    params![key, now_ms()],
                    |row| row.get(0),
                )
                .optional()
            )
        })
        .await
    }

    async fn set_marker(&self, key: &str, value: &str, ttl: Duration) -> SandplaneResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.blocking(move |conn| {
            db_err!(conn.execute(UPSERT_MARKER, params![key, value, expires_at(ttl)]))?;
            Ok(())
        })
        .await
    }

    async fn delete_marker(&self, key: &str) -> SandplaneResult<()> {
        let key = key.to_string();
        self.blocking(move |conn| {
            db_err!(conn.execute("DELETE FROM markers WHERE key = ?1", params![key]))?;
            Ok(())
        })
        .await
    }

    async fn commit_transition(&self, commit: &TransitionCommit<'_>) -> SandplaneResult<()> {
        let sandbox = commit.sandbox.clone();
        let transition_key = commit.transition_key.to_string();
        let descriptor = commit.descriptor.to_string();
        let transition_expires_at = expires_at(commit.transition_ttl);
        let result_key = commit.result_key.to_string();
        let result_expires_at = expires_at(commit.result_ttl);

        self.blocking(move |conn| {
            let tx = db_err!(conn.transaction_with_behavior(TransactionBehavior::Immediate))?;

            // Expired markers are only ever read as absent; drop them while we
            // hold the write lock anyway.
            db_err!(tx.execute(
                "DELETE FROM markers WHERE expires_at <= ?1",
                params![now_ms()]
            ))?;

            upsert_sandbox(&tx, &sandbox)?;
            db_err!(tx.execute(
                UPSERT_MARKER,
                params![transition_key, descriptor, transition_expires_at],
            ))?;
            db_err!(tx.execute(
                UPSERT_MARKER,
                params![result_key, "", result_expires_at],
            ))?;

            db_err!(tx.commit())
        })
        .await
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> SandplaneResult<bool> {
        let key = key.to_string();
        let token = token.to_string();
        self.blocking(move |conn| {
            let tx = db_err!(conn.transaction_with_behavior(TransactionBehavior::Immediate))?;

            // Sweeps every expired lock, not just this key's.
            db_err!(tx.execute(
                "DELETE FROM locks WHERE expires_at <= ?1",
                params![now_ms()],
            ))?;
            let inserted = db_err!(tx.execute(
                "INSERT OR IGNORE INTO locks (key, token, expires_at) VALUES (?1, ?2, ?3)",
                params![key, token, expires_at(ttl)],
            ))?;

            db_err!(tx.commit())?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn release_lock(&self, key: &str, token: &str) -> SandplaneResult<bool> {
        let key = key.to_string();
        let token = token.to_string();
        self.blocking(move |conn| {
            let deleted = db_err!(conn.execute(
                "DELETE FROM locks WHERE key = ?1 AND token = ?2 AND expires_at > ?3",
                params![key, token, now_ms()],
            ))?;
            Ok(deleted == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxState;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn create_test_store() -> (TempDir, SqliteStateStore) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("state.db")).unwrap();
        (dir, SqliteStateStore::new(db))
    }

    fn test_sandbox(id: &str) -> Sandbox {
        Sandbox::new(Uuid::new_v4(), id, "node-1", chrono::Duration::minutes(5))
    }

    #[tokio::test]
    async fn test_insert_get_put_remove() {
        let (_dir, store) = create_test_store();
        let mut sbx = test_sandbox("sbx");

        store.insert_sandbox(&sbx).await.unwrap();
        assert_eq!(store.get_sandbox(&sbx.key()).await.unwrap(), Some(sbx.clone()));

        sbx.state = SandboxState::Pausing;
        store.put_sandbox(&sbx).await.unwrap();
        let stored = store.get_sandbox(&sbx.key()).await.unwrap().unwrap();
        assert_eq!(stored.state, SandboxState::Pausing);

        assert!(store.remove_sandbox(&sbx.key()).await.unwrap());
        assert!(store.get_sandbox(&sbx.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let (_dir, store) = create_test_store();
        let sbx = test_sandbox("sbx");

        store.insert_sandbox(&sbx).await.unwrap();
        let err = store.insert_sandbox(&sbx).await.unwrap_err();
        assert!(matches!(err, SandplaneError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_expired_marker_reads_as_absent() {
        let (_dir, store) = create_test_store();
        store
            .set_marker("m", "v", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.get_marker("m").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_transition_is_visible_together() {
        let (_dir, store) = create_test_store();
        let mut sbx = test_sandbox("sbx");
        store.insert_sandbox(&sbx).await.unwrap();

        sbx.state = SandboxState::Snapshotting;
        store
            .commit_transition(&TransitionCommit {
                sandbox: &sbx,
                transition_key: "t",
                descriptor: "{}",
                transition_ttl: Duration::from_secs(60),
                result_key: "r",
                result_ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let stored = store.get_sandbox(&sbx.key()).await.unwrap().unwrap();
        assert_eq!(stored.state, SandboxState::Snapshotting);
        assert_eq!(store.get_marker("t").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(store.get_marker("r").await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_lock_shared_across_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        // Two handles model two API processes sharing the file.
        let a = SqliteStateStore::new(Database::open(&path).unwrap());
        let b = SqliteStateStore::new(Database::open(&path).unwrap());
        let ttl = Duration::from_secs(10);

        assert!(a.try_acquire_lock("lock:x", "token-a", ttl).await.unwrap());
        assert!(!b.try_acquire_lock("lock:x", "token-b", ttl).await.unwrap());
        assert!(!b.release_lock("lock:x", "token-b").await.unwrap());

        assert!(a.release_lock("lock:x", "token-a").await.unwrap());
        assert!(b.try_acquire_lock("lock:x", "token-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_contended_write_does_not_stall_runtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let store = SqliteStateStore::new(Database::open(&path).unwrap());

        // Another process holding the write lock.
        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = std::time::Instant::now();
        let acquire = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .try_acquire_lock("lock:x", "a", Duration::from_secs(10))
                    .await
            }
        });

        // The timer only fires if the runtime thread is free.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        other.execute_batch("COMMIT").unwrap();

        assert!(acquire.await.unwrap().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let (_dir, store) = create_test_store();

        assert!(store
            .try_acquire_lock("lock:x", "a", Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store
            .try_acquire_lock("lock:x", "b", Duration::from_secs(10))
            .await
            .unwrap());
    }
}
