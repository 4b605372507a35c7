//! Anticrop State - persisted scan state
//!
//! The data model behind the crawl-and-remediate engine:
//! - Id newtypes, permissions, and opt-out flags
//! - The `BotState` arena of per-guild scan state with entry-scoped
//!   interior mutability
//! - Resumable paging cursors and the closing-phase ledger
//! - Atomic single-blob persistence

#![warn(unreachable_pub)]

pub mod error;
pub mod persist;
pub mod state;
pub mod types;

pub use error::StateError;
pub use persist::StateStore;
pub use state::{
    BotState, ChannelScanState, ClosingState, PageCursor, ScanPhase, ScanState, Tally,
    ThreadScanState,
};
pub use types::{ChannelId, GuildId, MessageId, OptOutFlag, Permission, ThreadId, UserId};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
