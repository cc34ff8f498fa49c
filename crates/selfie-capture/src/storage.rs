//! Persistence contracts for committed stills.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Object storage for encoded stills.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` under `key` and return a reference the profile can
    /// point at. Putting the same key twice replaces the object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError>;
}

/// The user's profile record.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn update_avatar_reference(
        &self,
        user_id: &str,
        public_ref: &str,
    ) -> Result<(), StorageError>;
}

/// Object key for one captured still: `avatars/{user_id}/{capture_id}.jpg`.
pub fn avatar_key(user_id: &str, capture_id: &uuid::Uuid) -> String {
    format!("avatars/{user_id}/{capture_id}.jpg")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avatar_key_layout() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            avatar_key("alice", &id),
            "avatars/alice/00000000-0000-0000-0000-000000000000.jpg"
        );
    }

    #[test]
    fn test_avatar_keys_unique_per_capture() {
        let a = avatar_key("alice", &uuid::Uuid::new_v4());
        let b = avatar_key("alice", &uuid::Uuid::new_v4());
        assert_ne!(a, b);
    }
}
