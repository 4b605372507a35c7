//! Anticrop Crawl - resumable crawl-and-remediate orchestration
//!
//! Walks a guild's channels and threads, classifies every image with the
//! Acropalypse detector, and archives then deletes matches above the
//! configured confidence threshold. Survives restarts through persisted
//! cursors and a per-user closing ledger; cancellation is cooperative and
//! checked at every loop boundary.
//!
//! External collaborators (chat gateway, object storage, image download)
//! are narrow traits; production implementations live with the platform
//! glue, in-memory fakes with the tests.

#![warn(unreachable_pub)]

pub mod archive;
pub mod config;
pub mod fetch;
pub mod gateway;
pub mod orchestrator;
pub mod retry;
pub mod storage;
pub mod summary;

pub use archive::{ArchiveError, ArchiveManager};
pub use config::CrawlConfig;
pub use fetch::{FetchError, HttpFetcher, ImageFetcher};
pub use gateway::{
    Attachment, ChannelInfo, ChatGateway, ChatMessage, GatewayError, MessageSource, ThreadInfo,
};
pub use orchestrator::Crawler;
pub use retry::{retry, RetryError, Shutdown};
pub use storage::{
    archive_key, delete_user_archives, guild_archive_prefix, user_archives, ObjectStore,
    StorageError, ARCHIVE_PREFIX,
};
pub use summary::{archive_notice, scan_summary, NoticeKind};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
