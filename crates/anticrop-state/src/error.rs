//! Error types for state management

use crate::types::GuildId;

/// State errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A scan is already active or finalizing for the guild.
    #[error("a scan is already active for guild {0}")]
    ScanInProgress(GuildId),

    /// Reading or writing the state blob failed.
    #[error("state blob io failed: {0}")]
    Io(#[from] std::io::Error),

    /// The state blob could not be encoded or decoded.
    #[error("state blob codec failed: {0}")]
    Codec(#[from] bincode::Error),
}
