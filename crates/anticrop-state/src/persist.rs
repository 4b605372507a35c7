//! Single-blob state persistence
//!
//! The entire [`BotState`] is serialized as one compact binary document,
//! written on a fixed interval and on graceful shutdown, read once at
//! startup. Writes go to a sibling temp file first and are renamed into
//! place, so a crash mid-write can never leave a torn blob behind.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StateError;
use crate::state::BotState;

/// Loads and saves the process-wide state blob.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The blob location.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state, or fresh state when no blob exists yet.
    ///
    /// # Errors
    /// - `StateError::Io` if the blob exists but cannot be read
    /// - `StateError::Codec` if the blob cannot be decoded; scan progress is
    ///   unrecoverable and startup must abort
    pub fn load(&self) -> Result<BotState, StateError> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "no state blob, starting fresh");
            return Ok(BotState::new());
        }
        let bytes = fs::read(&self.path)?;
        let state = bincode::deserialize(&bytes)?;
        tracing::info!(path = %self.path.display(), "loaded state blob");
        Ok(state)
    }

    /// Writes the state atomically: serialize, write a temp file alongside,
    /// rename over the blob.
    ///
    /// # Errors
    /// - `StateError::Codec` if serialization fails
    /// - `StateError::Io` if the temp write or rename fails
    pub fn save(&self, state: &BotState) -> Result<(), StateError> {
        let bytes = bincode::serialize(state)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            bytes = bytes.len(),
            "saved state blob"
        );
        Ok(())
    }
}
