//! Crawl orchestrator
//!
//! Drives the per-guild scan state machine (`Active -> Closing -> removed`):
//! one task per top-level channel, fanning out to one task per thread, each
//! paging strictly after its persisted cursor. Cancellation is cooperative:
//! removing the guild's scan state, or raising the process-wide shutdown
//! signal, stops every loop at its next boundary. Page bodies run without
//! cancellation checks so the cursor can never get ahead of completed work.

use std::collections::BTreeSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task::JoinSet;

use anticrop_scan::{ScanConfidence, ScanVerdict, Scanner};
use anticrop_state::{
    BotState, ChannelScanState, GuildId, OptOutFlag, PageCursor, Permission, ScanPhase,
    ScanState, StateError, ThreadScanState, UserId,
};

use crate::archive::ArchiveManager;
use crate::config::CrawlConfig;
use crate::fetch::ImageFetcher;
use crate::gateway::{
    ChatGateway, ChatMessage, ChannelInfo, GatewayError, MessageSource, ThreadInfo,
};
use crate::retry::{retry, RetryError, Shutdown};
use crate::summary::scan_summary;

static PNG_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://\S+\.png").expect("static pattern"));

/// Cursor-bearing state for whichever kind of source is being paged.
enum Traversal {
    Channel(Arc<ChannelScanState>),
    Thread(Arc<ThreadScanState>),
}

impl Traversal {
    fn cursor(&self) -> &PageCursor {
        match self {
            Self::Channel(state) => &state.cursor,
            Self::Thread(state) => &state.cursor,
        }
    }
}

/// Outcome of one thread-listing call.
enum ThreadFetch {
    Got(Vec<ThreadInfo>),
    Unsupported,
    Failed,
}

/// The crawl-and-remediate engine for all guilds.
pub struct Crawler {
    state: Arc<BotState>,
    gateway: Arc<dyn ChatGateway>,
    fetcher: Arc<dyn ImageFetcher>,
    scanner: Arc<Scanner>,
    archive: Option<Arc<ArchiveManager>>,
    config: CrawlConfig,
    shutdown: Shutdown,
}

impl Crawler {
    /// Creates a crawler over the given collaborators. `archive` is `None`
    /// when no object storage is configured; scans then delete without
    /// preserving evidence.
    #[must_use]
    pub fn new(
        state: Arc<BotState>,
        gateway: Arc<dyn ChatGateway>,
        fetcher: Arc<dyn ImageFetcher>,
        scanner: Arc<Scanner>,
        archive: Option<Arc<ArchiveManager>>,
        config: CrawlConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            state,
            gateway,
            fetcher,
            scanner,
            archive,
            config,
            shutdown,
        }
    }

    /// The shared state arena.
    #[inline]
    #[must_use]
    pub fn state(&self) -> &Arc<BotState> {
        &self.state
    }

    /// Registers a scan: deletion scans take the guild's configured
    /// threshold, count-only scans none.
    ///
    /// # Errors
    /// - `StateError::ScanInProgress` if the guild already has one
    pub fn begin_scan(
        &self,
        guild: GuildId,
        requester: UserId,
        delete: bool,
    ) -> Result<Arc<ScanState>, StateError> {
        let threshold = delete.then(|| self.state.deletion_threshold(guild));
        self.state.begin_scan(guild, requester, threshold)
    }

    /// Requests shutdown, then waits out the configured grace period so
    /// in-flight network calls can finish before the process exits.
    pub async fn shutdown(&self) {
        tracing::info!("shutdown requested");
        self.shutdown
            .trigger_with_grace(self.config.shutdown_grace)
            .await;
    }

    /// Spawns a scan task for every guild with persisted state, resuming
    /// after a restart.
    pub fn resume_all(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.state
            .active_guilds()
            .into_iter()
            .map(|guild| {
                tracing::info!(%guild, "resuming scan");
                let crawler = self.clone();
                tokio::spawn(async move { crawler.scan_guild(guild).await })
            })
            .collect()
    }

    /// Runs one guild's scan to completion, resuming whatever phase its
    /// persisted state is in.
    pub async fn scan_guild(self: Arc<Self>, guild: GuildId) {
        let Some(scan) = self.state.scan(guild) else {
            tracing::error!(%guild, "no scan state for guild");
            return;
        };
        let guild_name = self
            .gateway
            .guild_name(guild)
            .await
            .unwrap_or_else(|| format!("guild {guild}"));
        tracing::info!(%guild, name = %guild_name, "scanning guild");

        if scan.deletes() {
            if let Some(archive) = &self.archive {
                if let Err(e) = archive.prepare_guild(guild).await {
                    tracing::warn!(%guild, error = %e, "could not prepare archive spool");
                }
            }
        }

        if scan.phase() == ScanPhase::Active {
            let channels = match retry(
                self.config.network_retry_attempts,
                &self.shutdown,
                GatewayError::is_retryable,
                || self.gateway.guild_channels(guild),
            )
            .await
            {
                Ok(channels) => channels,
                Err(RetryError::Cancelled) => return,
                Err(RetryError::Inner(e)) => {
                    tracing::warn!(%guild, error = %e, "could not list channels; will retry on resume");
                    return;
                }
            };

            let mut tasks = JoinSet::new();
            for channel in channels {
                let crawler = self.clone();
                let scan = scan.clone();
                tasks.spawn(async move { crawler.crawl_channel(guild, scan, channel).await });
            }
            while tasks.join_next().await.is_some() {}

            // The closing transition happens only on a clean, complete pass.
            if self.shutdown.is_triggered() || !self.state.scan_active(guild) {
                return;
            }
            scan.begin_closing();
        }

        self.close_guild(guild, &guild_name, &scan).await;
    }

    /// Gates one channel on permissions, then crawls its messages and its
    /// threads concurrently.
    async fn crawl_channel(
        self: Arc<Self>,
        guild: GuildId,
        scan: Arc<ScanState>,
        channel: ChannelInfo,
    ) {
        let channel_state = scan.channel_state(channel.id);
        if channel_state.is_permission_skipped() {
            return;
        }
        let held = match self.gateway.permissions(guild, channel.id).await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(channel = %channel.id, error = %e, "permission check failed");
                return;
            }
        };
        let mut required: BTreeSet<Permission> =
            [Permission::ViewChannel, Permission::ReadHistory].into();
        if scan.deletes() {
            required.insert(Permission::ManageMessages);
        }
        let missing: BTreeSet<Permission> = required.difference(&held).copied().collect();
        if !missing.is_empty() {
            tracing::debug!(channel = %channel.id, ?missing, "skipping channel for missing permissions");
            channel_state.record_missing_permissions(missing);
            return;
        }

        tracing::debug!(channel = %channel.id, name = %channel.name, "scanning channel");
        let mut tasks = JoinSet::new();
        {
            let crawler = self.clone();
            let scan = scan.clone();
            let traversal = Traversal::Channel(channel_state.clone());
            let name = channel.name.clone();
            let source = MessageSource::Channel(channel.id);
            tasks.spawn(async move {
                crawler.crawl_source(guild, scan, source, traversal, name).await;
            });
        }
        if channel.supports_threads {
            let joined_only = !held.contains(&Permission::ManageThreads);
            for thread in self.discover_threads(&channel, joined_only).await {
                if thread.archived && thread.locked {
                    continue;
                }
                let crawler = self.clone();
                let scan = scan.clone();
                let traversal = Traversal::Thread(channel_state.thread_state(thread.id));
                let name = channel.name.clone();
                let source = MessageSource::Thread(thread.id);
                tasks.spawn(async move {
                    crawler.crawl_source(guild, scan, source, traversal, name).await;
                });
            }
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Enumerates active, archived-public, and archived-private threads. A
    /// failure stops further discovery for this channel but keeps whatever
    /// was already found; unsupported-channel-type answers are ignored.
    async fn discover_threads(&self, channel: &ChannelInfo, joined_only: bool) -> Vec<ThreadInfo> {
        let mut threads = Vec::new();
        match self.fetch_threads(|| self.gateway.active_threads(channel.id)).await {
            ThreadFetch::Got(more) => threads.extend(more),
            ThreadFetch::Unsupported => {}
            ThreadFetch::Failed => return threads,
        }
        match self
            .fetch_threads(|| self.gateway.archived_public_threads(channel.id))
            .await
        {
            ThreadFetch::Got(more) => threads.extend(more),
            ThreadFetch::Unsupported => {}
            ThreadFetch::Failed => return threads,
        }
        match self
            .fetch_threads(|| self.gateway.archived_private_threads(channel.id, joined_only))
            .await
        {
            ThreadFetch::Got(more) => threads.extend(more),
            ThreadFetch::Unsupported => {}
            ThreadFetch::Failed => {}
        }
        threads
    }

    async fn fetch_threads<F, Fut>(&self, op: F) -> ThreadFetch
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<ThreadInfo>, GatewayError>>,
    {
        match retry(
            self.config.network_retry_attempts,
            &self.shutdown,
            GatewayError::is_retryable,
            op,
        )
        .await
        {
            Ok(threads) => ThreadFetch::Got(threads),
            Err(RetryError::Cancelled) => ThreadFetch::Failed,
            Err(RetryError::Inner(GatewayError::UnsupportedChannelType)) => {
                ThreadFetch::Unsupported
            }
            Err(RetryError::Inner(e)) => {
                tracing::error!(error = %e, "unexpected error while enumerating threads");
                ThreadFetch::Failed
            }
        }
    }

    /// Pages through one channel's or thread's history strictly after the
    /// persisted cursor, oldest to newest. Each page is scanned and
    /// remediated before the cursor advances; an empty page parks the
    /// cursor at the terminal sentinel.
    async fn crawl_source(
        &self,
        guild: GuildId,
        scan: Arc<ScanState>,
        source: MessageSource,
        traversal: Traversal,
        channel_name: String,
    ) {
        let cursor = traversal.cursor();
        loop {
            if cursor.is_exhausted() {
                return;
            }
            if !self.state.scan_active(guild) {
                tracing::debug!(%source, "aborting scan due to cancellation");
                return;
            }
            if self.shutdown.is_triggered() {
                return;
            }

            tracing::debug!(%source, after = %cursor.get(), "fetching history page");
            let mut page = match retry(
                self.config.network_retry_attempts,
                &self.shutdown,
                GatewayError::is_retryable,
                || self.gateway.history_after(guild, source, cursor.get(), self.config.page_size),
            )
            .await
            {
                Ok(page) => page,
                Err(RetryError::Cancelled) => return,
                Err(RetryError::Inner(e)) => {
                    tracing::warn!(%source, error = %e, "history fetch failed; channel resumes later");
                    return;
                }
            };

            if page.is_empty() {
                cursor.mark_exhausted();
                return;
            }
            page.sort_by_key(|message| message.id);
            let page_end = page.last().map(|message| message.id);

            let eligible: Vec<ChatMessage> = match self.config.cutoff {
                Some(cutoff) => page
                    .into_iter()
                    .filter(|message| message.created_at < cutoff)
                    .collect(),
                None => page,
            };
            if eligible.is_empty() {
                // Ids ascend, so everything past here postdates the cutoff.
                cursor.mark_exhausted();
                return;
            }

            // Page body: no cancellation checks until the cursor advance.
            for message in &eligible {
                let verdict = self.scan_message(&scan, message).await;
                if let Some(threshold) = scan.threshold() {
                    if verdict.meets(threshold) {
                        self.remediate(guild, source, &channel_name, message).await;
                    }
                }
            }
            if let Some(last) = page_end {
                cursor.advance_to(last);
            }
        }
    }

    /// Scans one message: every image attachment, then every PNG URL in the
    /// text, keeping the maximum confidence. Stops as soon as the effective
    /// threshold is reached. Messages with nothing scannable tally nothing.
    async fn scan_message(&self, scan: &ScanState, message: &ChatMessage) -> ScanVerdict {
        if self.state.is_opted_out(message.author, OptOutFlag::Everything) {
            tracing::debug!(author = %message.author, "author opted out; skipping message");
            scan.record_verdict(ScanVerdict::OptedOut);
            return ScanVerdict::OptedOut;
        }

        let threshold = scan.effective_threshold();
        let mut confidence: Option<ScanConfidence> = None;
        for attachment in message.attachments.iter().filter(|a| a.is_image) {
            let result = self.scan_url(&attachment.url, threshold).await;
            confidence = Some(confidence.map_or(result, |c| c.max(result)));
            if confidence.is_some_and(|c| c >= threshold) {
                break;
            }
        }
        if !confidence.is_some_and(|c| c >= threshold) {
            for found in PNG_URL.find_iter(&message.content) {
                let result = self.scan_url(found.as_str(), threshold).await;
                confidence = Some(confidence.map_or(result, |c| c.max(result)));
                if confidence.is_some_and(|c| c >= threshold) {
                    break;
                }
            }
        }

        let Some(confidence) = confidence else {
            return ScanVerdict::Confidence(ScanConfidence::None);
        };
        if confidence > ScanConfidence::None {
            tracing::debug!(
                message = %message.permalink,
                ?confidence,
                "message contained a suspicious image"
            );
        }
        let verdict = ScanVerdict::Confidence(confidence);
        scan.record_verdict(verdict);
        verdict
    }

    /// Downloads and classifies one URL. Download failures degrade to the
    /// `Error` confidence; non-PNG URLs are `None` without a download.
    async fn scan_url(&self, url: &str, threshold: ScanConfidence) -> ScanConfidence {
        if !url.to_ascii_lowercase().contains(".png") {
            return ScanConfidence::None;
        }
        let bytes = match self.fetcher.fetch(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(%url, error = %e, "image download failed");
                return ScanConfidence::Error;
            }
        };
        let scanner = self.scanner.clone();
        match tokio::task::spawn_blocking(move || scanner.scan(&bytes, threshold)).await {
            Ok(confidence) => confidence,
            Err(e) => {
                tracing::error!(%url, error = %e, "scan task failed");
                ScanConfidence::Error
            }
        }
    }

    /// Archives (when enabled) and deletes one matching message. Archive
    /// failures are logged; the deletion still proceeds.
    async fn remediate(
        &self,
        guild: GuildId,
        source: MessageSource,
        channel_name: &str,
        message: &ChatMessage,
    ) {
        if let Some(archive) = &self.archive {
            match archive.archive(guild, source, channel_name, message).await {
                Ok(()) => {
                    tracing::debug!(message = %message.permalink, "archived message")
                }
                Err(e) => {
                    tracing::error!(message = %message.permalink, error = %e, "failed to archive message")
                }
            }
        }
        match retry(
            self.config.network_retry_attempts,
            &self.shutdown,
            GatewayError::is_retryable,
            || self.gateway.delete_message(source, message.id),
        )
        .await
        {
            Ok(()) => tracing::debug!(message = %message.permalink, "deleted vulnerable message"),
            Err(RetryError::Cancelled) => {}
            Err(RetryError::Inner(e)) => {
                tracing::error!(message = %message.permalink, error = %e, "failed to delete message");
            }
        }
    }

    /// Drains the closing phase: the requester summary exactly once, then
    /// archive uploads and notifications, then state removal. Safe to rerun
    /// after a crash at any point.
    async fn close_guild(&self, guild: GuildId, guild_name: &str, scan: &ScanState) {
        let summary_sent = scan
            .with_closing(|closing| closing.requester_notified)
            .unwrap_or(false);
        if !summary_sent {
            let mut skipped = Vec::new();
            for (channel, missing) in scan.skipped_channels() {
                let label = match self.gateway.channel_name(channel).await {
                    Some(name) => format!("#{name} ({channel})"),
                    None => format!("<#{channel}>"),
                };
                skipped.push((label, missing));
            }
            let text = scan_summary(guild_name, &skipped, scan.threshold(), &scan.tally());
            match retry(0, &self.shutdown, GatewayError::is_rate_limit, || {
                self.gateway.send_dm(scan.requester(), &text)
            })
            .await
            {
                Ok(()) => {}
                Err(RetryError::Cancelled) => return,
                Err(RetryError::Inner(e)) => {
                    tracing::warn!(requester = %scan.requester(), error = %e, "failed to message requester");
                }
            }
            scan.with_closing(|closing| closing.requester_notified = true);
        }

        if scan.deletes() {
            if let Some(archive) = &self.archive {
                if let Err(e) = archive.close_guild(guild, guild_name, scan).await {
                    tracing::error!(%guild, error = %e, "archive drain failed; will retry on resume");
                    return;
                }
            }
        }

        if self.shutdown.is_triggered() || !self.state.scan_active(guild) {
            return;
        }
        tracing::info!(%guild, "finished scanning guild");
        self.state.finish_scan(guild, scan.threshold());
    }
}
