//! Identifier and permission types
//!
//! Ids are platform-assigned snowflakes; newtypes keep the five id spaces
//! from being confused at call sites.

use serde::{Deserialize, Serialize};

/// Guild (server) identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GuildId(pub u64);

impl std::fmt::Display for GuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top-level channel identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ThreadId(pub u64);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier; ascending ids order messages oldest to newest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Cursor value meaning traversal has not started.
    pub const UNSTARTED: Self = Self(0);

    /// Cursor sentinel meaning the channel is fully scanned.
    pub const EXHAUSTED: Self = Self(u64::MAX);
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel permissions the crawler cares about.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Permission {
    /// See the channel at all.
    ViewChannel,
    /// Page through past messages.
    ReadHistory,
    /// Delete other members' messages.
    ManageMessages,
    /// Enumerate archived private threads without having joined them.
    ManageThreads,
}

impl Permission {
    /// Human-readable name used in the requester summary.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::ViewChannel => "View Channel",
            Self::ReadHistory => "Read Message History",
            Self::ManageMessages => "Manage Messages",
            Self::ManageThreads => "Manage Threads",
        }
    }
}

/// Per-user opt-out flags.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum OptOutFlag {
    /// Scan and delete, but never archive.
    Archiving,
    /// Skip the user's messages entirely.
    Everything,
}
