//! Chat platform collaborator interface
//!
//! The crawl engine talks to the chat platform only through this trait:
//! paged history retrieval, thread enumeration, permission introspection,
//! message deletion, and direct messages. The production implementation
//! wraps the platform client; tests substitute an in-memory fake.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use anticrop_state::{ChannelId, GuildId, MessageId, Permission, ThreadId, UserId};

/// Gateway error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The channel cannot hold the requested kind of threads.
    #[error("unsupported channel type")]
    UnsupportedChannelType,

    /// The platform asked us to slow down.
    #[error("rate limited")]
    RateLimited,

    /// The referenced entity no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// The recipient does not accept direct messages.
    #[error("direct messages disabled for user {0}")]
    DmsDisabled(UserId),

    /// Transient transport failure.
    #[error("transport failed: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Whether a retry with backoff may succeed.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transport(_))
    }

    /// Whether this is specifically the rate-limit class. Opening a DM
    /// channel retries without bound only on this.
    #[inline]
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// A top-level guild channel.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Channel id.
    pub id: ChannelId,
    /// Display name.
    pub name: String,
    /// Whether the channel can contain threads.
    pub supports_threads: bool,
}

/// A thread discovered under a parent channel.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    /// Thread id.
    pub id: ThreadId,
    /// Whether the thread is archived.
    pub archived: bool,
    /// Whether the thread is locked against new activity.
    pub locked: bool,
}

/// Where a message lives: a channel's own history or a thread's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSource {
    /// A top-level channel.
    Channel(ChannelId),
    /// A thread.
    Thread(ThreadId),
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "channel {id}"),
            Self::Thread(id) => write!(f, "thread {id}"),
        }
    }
}

/// An image attachment on a message.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Original file name.
    pub filename: String,
    /// Download URL.
    pub url: String,
    /// Whether the platform classified the attachment as an image.
    pub is_image: bool,
}

/// One message out of a history page.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Message id; ids ascend oldest to newest.
    pub id: MessageId,
    /// Author.
    pub author: UserId,
    /// Raw text content.
    pub content: String,
    /// Attachments.
    pub attachments: Vec<Attachment>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Stable link back to the message.
    pub permalink: String,
}

/// Chat platform operations the crawl engine depends on.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Display name of a guild, if it still exists.
    async fn guild_name(&self, guild: GuildId) -> Option<String>;

    /// All top-level channels of a guild.
    async fn guild_channels(&self, guild: GuildId) -> Result<Vec<ChannelInfo>, GatewayError>;

    /// Permissions this bot holds in a channel.
    async fn permissions(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<BTreeSet<Permission>, GatewayError>;

    /// Up to `limit` messages strictly after `after`, ascending by id.
    async fn history_after(
        &self,
        guild: GuildId,
        source: MessageSource,
        after: MessageId,
        limit: u16,
    ) -> Result<Vec<ChatMessage>, GatewayError>;

    /// Currently active threads under a channel.
    async fn active_threads(&self, channel: ChannelId) -> Result<Vec<ThreadInfo>, GatewayError>;

    /// Archived public threads under a channel.
    async fn archived_public_threads(
        &self,
        channel: ChannelId,
    ) -> Result<Vec<ThreadInfo>, GatewayError>;

    /// Archived private threads; with `joined_only` restricted to those the
    /// bot has joined.
    async fn archived_private_threads(
        &self,
        channel: ChannelId,
        joined_only: bool,
    ) -> Result<Vec<ThreadInfo>, GatewayError>;

    /// Deletes one message. Safe to retry.
    async fn delete_message(
        &self,
        source: MessageSource,
        message: MessageId,
    ) -> Result<(), GatewayError>;

    /// Sends a direct message. Safe to retry.
    async fn send_dm(&self, user: UserId, text: &str) -> Result<(), GatewayError>;

    /// Display name of a channel, if it still exists.
    async fn channel_name(&self, channel: ChannelId) -> Option<String>;

    /// Whether the user account still exists.
    async fn user_exists(&self, user: UserId) -> bool;

    /// Whether the bot has ever exchanged a DM with the user. Drives the
    /// first-contact wording of archive notifications.
    async fn has_prior_dm(&self, user: UserId) -> bool;
}
