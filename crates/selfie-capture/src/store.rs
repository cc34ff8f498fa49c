use std::path::Path;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;
use tokio_rusqlite::Connection;

use crate::storage::{BlobStorage, ProfileStore, StorageError};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// SQLite-backed blob and profile storage.
///
/// Blobs live in `blobs` keyed by object key; each profile row points at
/// its current avatar by public reference. Public references are
/// `{public_base_url}/{key}`.
#[derive(Clone)]
pub struct SqliteAvatarStore {
    conn: Connection,
    public_base_url: String,
}

impl SqliteAvatarStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, public_base_url: &str) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS blobs (
                     key TEXT PRIMARY KEY,
                     bytes BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS profiles (
                     user_id TEXT PRIMARY KEY,
                     avatar_ref TEXT,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn public_ref(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base_url)
    }

    /// Store (or replace) a blob. Returns its public reference.
    pub async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        let created_at = chrono::Utc::now().to_rfc3339();
        let key_owned = key.to_string();
        let size = bytes.len();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO blobs (key, bytes, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![key_owned, bytes, created_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(key, size, "blob stored");
        Ok(self.public_ref(key))
    }

    pub async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let bytes = conn
                    .query_row("SELECT bytes FROM blobs WHERE key = ?1", [&key], |row| {
                        row.get::<_, Vec<u8>>(0)
                    })
                    .optional()?;
                Ok(bytes)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Point a user's profile at a new avatar, creating the profile if needed.
    pub async fn set_avatar_ref(&self, user_id: &str, public_ref: &str) -> Result<(), StoreError> {
        let updated_at = chrono::Utc::now().to_rfc3339();
        let user_id = user_id.to_string();
        let public_ref = public_ref.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO profiles (user_id, avatar_ref, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id) DO UPDATE SET avatar_ref = ?2, updated_at = ?3",
                    rusqlite::params![user_id, public_ref, updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn avatar_for(&self, user_id: &str) -> Result<Option<AvatarInfo>, StoreError> {
        let user_id = user_id.to_string();
        self.conn
            .call(move |conn| {
                let info = conn
                    .query_row(
                        "SELECT user_id, avatar_ref, updated_at FROM profiles
                         WHERE user_id = ?1 AND avatar_ref IS NOT NULL",
                        [&user_id],
                        |row| {
                            Ok(AvatarInfo {
                                user_id: row.get(0)?,
                                public_ref: row.get(1)?,
                                updated_at: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(info)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Resolve a public reference produced by this store back to its key.
    pub fn key_for_ref<'a>(&self, public_ref: &'a str) -> Option<&'a str> {
        public_ref
            .strip_prefix(self.public_base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    pub async fn count_blobs(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 = conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl BlobStorage for SqliteAvatarStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        Ok(self.put_blob(key, bytes).await?)
    }
}

#[async_trait]
impl ProfileStore for SqliteAvatarStore {
    async fn update_avatar_reference(
        &self,
        user_id: &str,
        public_ref: &str,
    ) -> Result<(), StorageError> {
        Ok(self.set_avatar_ref(user_id, public_ref).await?)
    }
}

// ── Public types ──────────────────────────────────────────────────────────────

/// A user's current avatar.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AvatarInfo {
    pub user_id: String,
    pub public_ref: String,
    pub updated_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteAvatarStore {
        SqliteAvatarStore::open(Path::new(":memory:"), "https://cdn.example.org/")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get_blob() {
        let store = memory_store().await;
        let public_ref = store
            .put_blob("avatars/alice/one.jpg", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(public_ref, "https://cdn.example.org/avatars/alice/one.jpg");
        assert_eq!(
            store.get_blob("avatars/alice/one.jpg").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(store.get_blob("avatars/alice/none.jpg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_same_key_replaces() {
        let store = memory_store().await;
        store.put_blob("k.jpg", vec![1]).await.unwrap();
        store.put_blob("k.jpg", vec![2]).await.unwrap();
        assert_eq!(store.count_blobs().await.unwrap(), 1);
        assert_eq!(store.get_blob("k.jpg").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_avatar_ref_upsert() {
        let store = memory_store().await;
        assert!(store.avatar_for("alice").await.unwrap().is_none());

        store.set_avatar_ref("alice", "ref-1").await.unwrap();
        store.set_avatar_ref("alice", "ref-2").await.unwrap();
        store.set_avatar_ref("bob", "ref-3").await.unwrap();

        let alice = store.avatar_for("alice").await.unwrap().unwrap();
        assert_eq!(alice.public_ref, "ref-2");
        assert_eq!(store.avatar_for("bob").await.unwrap().unwrap().public_ref, "ref-3");
    }

    #[tokio::test]
    async fn test_trait_round_trip_through_public_ref() {
        let store = memory_store().await;
        let blobs: &dyn BlobStorage = &store;
        let profiles: &dyn ProfileStore = &store;

        let public_ref = blobs.put("avatars/alice/x.jpg", vec![9, 9]).await.unwrap();
        profiles
            .update_avatar_reference("alice", &public_ref)
            .await
            .unwrap();

        let avatar = store.avatar_for("alice").await.unwrap().unwrap();
        let key = store.key_for_ref(&avatar.public_ref).unwrap();
        assert_eq!(key, "avatars/alice/x.jpg");
        assert_eq!(store.get_blob(key).await.unwrap(), Some(vec![9, 9]));
    }

    #[tokio::test]
    async fn test_key_for_foreign_ref_is_none() {
        let store = memory_store().await;
        assert_eq!(store.key_for_ref("https://elsewhere.example/k.jpg"), None);
    }
}
