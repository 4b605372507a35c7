//! Durable object storage collaborator interface
//!
//! A plain blob put/get/list/delete service. Archive objects are namespaced
//! `archive/{guild}/{user}.zip`.

use std::time::Duration;

use async_trait::async_trait;

use anticrop_state::{GuildId, UserId};

/// Prefix under which all evidence archives live.
pub const ARCHIVE_PREFIX: &str = "archive/";

/// Storage error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No object at the key.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Transient transport failure.
    #[error("storage transport failed: {0}")]
    Transport(String),
}

impl StorageError {
    /// Whether a retry with backoff may succeed.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Object storage operations the archive manager depends on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` at `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Fetches the object at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Removes the object at `key`, if present.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// A time-limited download link for the object at `key`.
    async fn presigned_download_url(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError>;
}

/// Object key for one user's evidence archive in one guild.
#[must_use]
pub fn archive_key(guild: GuildId, user: UserId) -> String {
    format!("{ARCHIVE_PREFIX}{guild}/{user}.zip")
}

/// Key prefix for all archives of one guild.
#[must_use]
pub fn guild_archive_prefix(guild: GuildId) -> String {
    format!("{ARCHIVE_PREFIX}{guild}/")
}

/// All archive keys belonging to `user`, across guilds.
///
/// # Errors
/// Propagates the underlying `list` failure.
pub async fn user_archives(
    store: &dyn ObjectStore,
    user: UserId,
) -> Result<Vec<String>, StorageError> {
    let keys = store.list(ARCHIVE_PREFIX).await?;
    Ok(keys
        .into_iter()
        .filter(|key| {
            key.split('/')
                .nth(2)
                .and_then(|name| name.strip_suffix(".zip"))
                .is_some_and(|stem| stem == user.to_string())
        })
        .collect())
}

/// Deletes every archive belonging to `user`. Returns how many were removed.
///
/// # Errors
/// Propagates the first failing storage call.
pub async fn delete_user_archives(
    store: &dyn ObjectStore,
    user: UserId,
) -> Result<usize, StorageError> {
    let keys = user_archives(store, user).await?;
    let count = keys.len();
    for key in keys {
        store.delete(&key).await?;
    }
    Ok(count)
}
