//! Scan state arena
//!
//! `BotState` owns every piece of persisted state: active scans, per-guild
//! deletion policy, finished-scan records, and opt-out flags. Entities are
//! kept in id-keyed maps with per-entry interior mutability so concurrent
//! channel and thread tasks mutate disjoint entries without a global lock.
//!
//! Removing a guild's entry from `scans` is the sole cancellation signal;
//! every crawl loop checks membership before proceeding.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use anticrop_scan::{ScanConfidence, ScanVerdict};

use crate::error::StateError;
use crate::types::{ChannelId, GuildId, MessageId, OptOutFlag, Permission, ThreadId, UserId};

/// Resumable paging cursor over one channel or thread.
///
/// `0` means unstarted; `u64::MAX` means fully scanned. Advancement is
/// monotonic, so a racing stale update can never move the cursor backwards.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PageCursor(AtomicU64);

impl PageCursor {
    /// Current position.
    #[inline]
    #[must_use]
    pub fn get(&self) -> MessageId {
        MessageId(self.0.load(Ordering::Acquire))
    }

    /// Advances to `id` if it is ahead of the current position.
    pub fn advance_to(&self, id: MessageId) {
        self.0.fetch_max(id.0, Ordering::AcqRel);
    }

    /// Marks the traversal complete.
    pub fn mark_exhausted(&self) {
        self.0.store(MessageId::EXHAUSTED.0, Ordering::Release);
    }

    /// Whether the traversal already completed.
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.get() == MessageId::EXHAUSTED
    }
}

/// Traversal state for one thread.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ThreadScanState {
    /// Paging cursor.
    pub cursor: PageCursor,
}

/// Traversal state for one top-level channel.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChannelScanState {
    /// Paging cursor for the channel's own messages.
    pub cursor: PageCursor,
    missing_permissions: Mutex<BTreeSet<Permission>>,
    threads: DashMap<ThreadId, Arc<ThreadScanState>>,
}

impl ChannelScanState {
    /// Records a sticky permission skip; once set the channel is never
    /// rechecked on later resumes.
    pub fn record_missing_permissions(&self, missing: BTreeSet<Permission>) {
        self.missing_permissions.lock().extend(missing);
    }

    /// Whether this channel was skipped for lack of permissions.
    #[must_use]
    pub fn is_permission_skipped(&self) -> bool {
        !self.missing_permissions.lock().is_empty()
    }

    /// The permissions found missing, if any.
    #[must_use]
    pub fn missing_permissions(&self) -> BTreeSet<Permission> {
        self.missing_permissions.lock().clone()
    }

    /// Looks up or creates the state for one thread under this channel.
    #[must_use]
    pub fn thread_state(&self, thread: ThreadId) -> Arc<ThreadScanState> {
        self.threads
            .entry(thread)
            .or_insert_with(|| Arc::new(ThreadScanState::default()))
            .clone()
    }
}

/// Confidence tally for one scan.
///
/// Pre-seeded with zeros for every level at or below the deletion threshold
/// (or all levels for a count-only scan) so the summary always lists them.
/// Opted-out messages are counted out-of-band, never against the ladder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tally {
    counts: std::collections::BTreeMap<ScanConfidence, u64>,
    opted_out: u64,
}

impl Tally {
    /// Creates a tally seeded for the given deletion threshold.
    #[must_use]
    pub fn seeded(threshold: Option<ScanConfidence>) -> Self {
        let mut counts = std::collections::BTreeMap::new();
        for level in ScanConfidence::all() {
            if threshold.map_or(true, |t| level <= t) {
                counts.insert(level, 0);
            }
        }
        Self {
            counts,
            opted_out: 0,
        }
    }

    /// Records one verdict.
    pub fn record(&mut self, verdict: ScanVerdict) {
        match verdict {
            ScanVerdict::Confidence(level) => *self.counts.entry(level).or_insert(0) += 1,
            ScanVerdict::OptedOut => self.opted_out += 1,
        }
    }

    /// Count of messages at or above `threshold`.
    #[must_use]
    pub fn at_or_above(&self, threshold: ScanConfidence) -> u64 {
        self.counts
            .iter()
            .filter(|(level, _)| **level >= threshold)
            .map(|(_, count)| count)
            .sum()
    }

    /// Ascending (level, count) pairs.
    pub fn levels(&self) -> impl Iterator<Item = (ScanConfidence, u64)> + '_ {
        self.counts.iter().map(|(level, count)| (*level, *count))
    }

    /// Messages skipped because their author opted out.
    #[inline]
    #[must_use]
    pub fn opted_out(&self) -> u64 {
        self.opted_out
    }
}

/// Progress of the closing phase, tracked per user so a crash mid-closing
/// resumes without duplicate uploads or notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClosingState {
    /// Whether the requester already received the scan summary.
    pub requester_notified: bool,
    /// Users whose archive upload completed.
    pub uploaded: BTreeSet<UserId>,
    /// Users whose notification DM was delivered.
    pub notified: BTreeSet<UserId>,
    /// Users whose notification DM failed; never retried.
    pub notify_failed: BTreeSet<UserId>,
}

impl ClosingState {
    /// Whether `user` was already handled, successfully or not.
    #[must_use]
    pub fn notification_attempted(&self, user: UserId) -> bool {
        self.notified.contains(&user) || self.notify_failed.contains(&user)
    }
}

/// Lifecycle phase of a guild scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// Traversal is in progress.
    Active,
    /// Traversal finished; uploads and notifications are draining.
    Closing,
}

/// State of one guild's scan, owned exclusively by [`BotState`].
#[derive(Debug, Serialize, Deserialize)]
pub struct ScanState {
    requester: UserId,
    threshold: Option<ScanConfidence>,
    channels: DashMap<ChannelId, Arc<ChannelScanState>>,
    tally: Mutex<Tally>,
    closing: Mutex<Option<ClosingState>>,
}

impl ScanState {
    /// Creates state for a freshly confirmed scan.
    #[must_use]
    pub fn new(requester: UserId, threshold: Option<ScanConfidence>) -> Self {
        Self {
            requester,
            threshold,
            channels: DashMap::new(),
            tally: Mutex::new(Tally::seeded(threshold)),
            closing: Mutex::new(None),
        }
    }

    /// The user who requested the scan.
    #[inline]
    #[must_use]
    pub fn requester(&self) -> UserId {
        self.requester
    }

    /// The deletion threshold; `None` means count-only.
    #[inline]
    #[must_use]
    pub fn threshold(&self) -> Option<ScanConfidence> {
        self.threshold
    }

    /// Whether this scan deletes matching messages.
    #[inline]
    #[must_use]
    pub fn deletes(&self) -> bool {
        self.threshold.is_some()
    }

    /// The confidence the detector is asked to establish per message.
    #[inline]
    #[must_use]
    pub fn effective_threshold(&self) -> ScanConfidence {
        self.threshold.unwrap_or(ScanConfidence::Certain)
    }

    /// Looks up or creates the state for one top-level channel.
    #[must_use]
    pub fn channel_state(&self, channel: ChannelId) -> Arc<ChannelScanState> {
        self.channels
            .entry(channel)
            .or_insert_with(|| Arc::new(ChannelScanState::default()))
            .clone()
    }

    /// Records one verdict into the tally. The increment is a critical
    /// section; channel and thread tasks call this concurrently.
    pub fn record_verdict(&self, verdict: ScanVerdict) {
        self.tally.lock().record(verdict);
    }

    /// A point-in-time copy of the tally.
    #[must_use]
    pub fn tally(&self) -> Tally {
        self.tally.lock().clone()
    }

    /// Channels skipped for missing permissions, with what was missing.
    #[must_use]
    pub fn skipped_channels(&self) -> Vec<(ChannelId, BTreeSet<Permission>)> {
        let mut skipped: Vec<_> = self
            .channels
            .iter()
            .filter(|entry| entry.value().is_permission_skipped())
            .map(|entry| (*entry.key(), entry.value().missing_permissions()))
            .collect();
        skipped.sort_by_key(|(id, _)| *id);
        skipped
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> ScanPhase {
        if self.closing.lock().is_some() {
            ScanPhase::Closing
        } else {
            ScanPhase::Active
        }
    }

    /// Transitions to the closing phase. Idempotent: a resume after the
    /// transition was persisted keeps the recorded progress.
    pub fn begin_closing(&self) {
        let mut closing = self.closing.lock();
        if closing.is_none() {
            *closing = Some(ClosingState::default());
        }
    }

    /// Runs `f` against the closing record, if the scan is closing.
    pub fn with_closing<R>(&self, f: impl FnOnce(&mut ClosingState) -> R) -> Option<R> {
        self.closing.lock().as_mut().map(f)
    }
}

/// Process-wide persisted state: the single owned context object handed to
/// every component. No ambient or static access anywhere.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BotState {
    scans: DashMap<GuildId, Arc<ScanState>>,
    deletion_threshold: DashMap<GuildId, ScanConfidence>,
    finished_scans: DashMap<GuildId, Option<ScanConfidence>>,
    opt_out: DashMap<UserId, BTreeSet<OptOutFlag>>,
}

impl BotState {
    /// Creates empty state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a scan for `guild`.
    ///
    /// # Errors
    /// - `StateError::ScanInProgress` if the guild already has one
    pub fn begin_scan(
        &self,
        guild: GuildId,
        requester: UserId,
        threshold: Option<ScanConfidence>,
    ) -> Result<Arc<ScanState>, StateError> {
        match self.scans.entry(guild) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StateError::ScanInProgress(guild))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let scan = Arc::new(ScanState::new(requester, threshold));
                entry.insert(scan.clone());
                Ok(scan)
            }
        }
    }

    /// The active scan for `guild`, if any.
    #[must_use]
    pub fn scan(&self, guild: GuildId) -> Option<Arc<ScanState>> {
        self.scans.get(&guild).map(|entry| entry.value().clone())
    }

    /// Whether `guild` still has an active scan. Crawl loops poll this as
    /// their cancellation check.
    #[inline]
    #[must_use]
    pub fn scan_active(&self, guild: GuildId) -> bool {
        self.scans.contains_key(&guild)
    }

    /// Cancels a scan by removing its state. Returns whether one existed.
    pub fn cancel_scan(&self, guild: GuildId) -> bool {
        self.scans.remove(&guild).is_some()
    }

    /// Guilds with scans to resume at startup.
    #[must_use]
    pub fn active_guilds(&self) -> Vec<GuildId> {
        self.scans.iter().map(|entry| *entry.key()).collect()
    }

    /// Completes a scan: drops its state and records the finished threshold,
    /// keeping the lowest threshold ever fully scanned.
    pub fn finish_scan(&self, guild: GuildId, threshold: Option<ScanConfidence>) {
        self.scans.remove(&guild);
        match self.finished_scans.entry(guild) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(threshold);
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if let Some(new) = threshold {
                    let merged = match entry.get() {
                        Some(previous) => new.min(*previous),
                        None => new,
                    };
                    entry.insert(Some(merged));
                }
            }
        }
    }

    /// The lowest threshold this guild was ever fully scanned at.
    /// `Some(None)` means a count-only scan completed.
    #[must_use]
    pub fn previous_scan(&self, guild: GuildId) -> Option<Option<ScanConfidence>> {
        self.finished_scans.get(&guild).map(|entry| *entry.value())
    }

    /// The configured deletion threshold for `guild`.
    #[must_use]
    pub fn deletion_threshold(&self, guild: GuildId) -> ScanConfidence {
        self.deletion_threshold
            .get(&guild)
            .map_or(ScanConfidence::DEFAULT, |entry| *entry.value())
    }

    /// Configures the deletion threshold for `guild`.
    pub fn set_deletion_threshold(&self, guild: GuildId, level: ScanConfidence) {
        self.deletion_threshold.insert(guild, level);
    }

    /// Opts `user` out. `Everything` supersedes and clears other flags.
    pub fn opt_out(&self, user: UserId, flag: OptOutFlag) {
        let mut flags = self.opt_out.entry(user).or_default();
        if flag == OptOutFlag::Everything {
            flags.clear();
        }
        flags.insert(flag);
    }

    /// Removes one opt-out flag, dropping the entry once empty.
    pub fn opt_back_in(&self, user: UserId, flag: OptOutFlag) {
        let remove = if let Some(mut flags) = self.opt_out.get_mut(&user) {
            flags.remove(&flag);
            flags.is_empty()
        } else {
            false
        };
        if remove {
            self.opt_out.remove_if(&user, |_, flags| flags.is_empty());
        }
    }

    /// Whether `user` opted out of `flag`. `Everything` implies every flag.
    #[must_use]
    pub fn is_opted_out(&self, user: UserId, flag: OptOutFlag) -> bool {
        self.opt_out.get(&user).is_some_and(|flags| {
            flags.contains(&OptOutFlag::Everything) || flags.contains(&flag)
        })
    }
}
