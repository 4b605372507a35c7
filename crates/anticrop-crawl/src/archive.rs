//! Evidence archiving
//!
//! Preserves deleted images for their owners: per-(guild, user) ZIP
//! containers spooled locally during the scan, uploaded to durable storage
//! and announced by DM when the guild closes. Containers hold one text
//! record per message plus stripped attachment copies; the still-vulnerable
//! original bytes are never stored.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use anticrop_scan::strip;
use anticrop_state::{BotState, GuildId, OptOutFlag, ScanState, UserId};

use crate::config::CrawlConfig;
use crate::fetch::ImageFetcher;
use crate::gateway::{ChatGateway, ChatMessage, GatewayError, MessageSource};
use crate::retry::{retry, RetryError, Shutdown};
use crate::storage::{archive_key, guild_archive_prefix, ObjectStore, StorageError};
use crate::summary::{archive_notice, NoticeKind};

/// Archive error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Local spool I/O failed.
    #[error("archive io failed: {0}")]
    Io(#[from] std::io::Error),

    /// The ZIP container rejected an operation.
    #[error("archive container failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Durable storage failed.
    #[error("archive upload failed: {0}")]
    Storage(#[from] StorageError),

    /// The blocking writer task died.
    #[error("archive task failed: {0}")]
    Task(String),
}

/// Builds, uploads, and announces per-user evidence archives.
pub struct ArchiveManager {
    state: Arc<BotState>,
    store: Arc<dyn ObjectStore>,
    gateway: Arc<dyn ChatGateway>,
    fetcher: Arc<dyn ImageFetcher>,
    config: CrawlConfig,
    shutdown: Shutdown,
    // The container format does not tolerate concurrent writers; every
    // append holds the (guild, user) lock.
    locks: DashMap<(GuildId, UserId), Arc<Mutex<()>>>,
}

impl ArchiveManager {
    /// Creates an archive manager over the given collaborators.
    #[must_use]
    pub fn new(
        state: Arc<BotState>,
        store: Arc<dyn ObjectStore>,
        gateway: Arc<dyn ChatGateway>,
        fetcher: Arc<dyn ImageFetcher>,
        config: CrawlConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            state,
            store,
            gateway,
            fetcher,
            config,
            shutdown,
            locks: DashMap::new(),
        }
    }

    fn guild_spool(&self, guild: GuildId) -> PathBuf {
        self.config.spool_dir.join(guild.to_string())
    }

    fn container_path(&self, guild: GuildId, user: UserId) -> PathBuf {
        self.guild_spool(guild).join(format!("{user}.zip"))
    }

    /// Downloads any previously uploaded archives for `guild` into the
    /// spool, so new evidence appends to prior containers. Runs once per
    /// guild: a spool directory that already exists is left untouched.
    pub async fn prepare_guild(&self, guild: GuildId) -> Result<(), ArchiveError> {
        let spool = self.guild_spool(guild);
        if spool.exists() {
            return Ok(());
        }
        let prefix = guild_archive_prefix(guild);
        let keys = retry(
            self.config.network_retry_attempts,
            &self.shutdown,
            StorageError::is_retryable,
            || self.store.list(&prefix),
        )
        .await
        .map_err(flatten_retry)?;
        std::fs::create_dir_all(&spool)?;
        for key in keys {
            let Some(name) = key.rsplit('/').next() else {
                continue;
            };
            let bytes = retry(
                self.config.network_retry_attempts,
                &self.shutdown,
                StorageError::is_retryable,
                || self.store.get(&key),
            )
            .await
            .map_err(flatten_retry)?;
            tracing::debug!(%key, "downloaded existing archive into spool");
            tokio::fs::write(spool.join(name), bytes).await?;
        }
        Ok(())
    }

    /// Appends one deleted message to its author's container: a text record
    /// plus a stripped copy of every image attachment.
    ///
    /// # Errors
    /// Local spool failures; individual attachment failures are logged and
    /// skipped instead.
    pub async fn archive(
        &self,
        guild: GuildId,
        source: MessageSource,
        channel_name: &str,
        message: &ChatMessage,
    ) -> Result<(), ArchiveError> {
        if self.state.is_opted_out(message.author, OptOutFlag::Archiving) {
            tracing::debug!(user = %message.author, "author opted out of archiving");
            return Ok(());
        }

        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        entries.push((
            format!("{}.txt", message.id),
            message_record(source, channel_name, message).into_bytes(),
        ));
        for attachment in message.attachments.iter().filter(|a| a.is_image) {
            let bytes = match self.fetcher.fetch(&attachment.url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(url = %attachment.url, error = %e, "failed to fetch attachment for archive");
                    continue;
                }
            };
            match strip(&bytes) {
                Ok(stripped) => entries.push((
                    format!("{}-{}", message.id, attachment.filename),
                    stripped,
                )),
                Err(e) => {
                    tracing::warn!(url = %attachment.url, error = %e, "failed to strip attachment, not archiving it");
                }
            }
        }

        let lock = self
            .locks
            .entry((guild, message.author))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let path = self.container_path(guild, message.author);
        tokio::task::spawn_blocking(move || append_to_container(&path, entries))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))?
    }

    /// Drains a finished guild: uploads each user's container, notifies the
    /// user, and finally deletes the local spool. Idempotent across
    /// restarts through the scan's closing ledger; a shutdown mid-drain
    /// leaves the remaining users for the next resume.
    pub async fn close_guild(
        &self,
        guild: GuildId,
        guild_name: &str,
        scan: &ScanState,
    ) -> Result<(), ArchiveError> {
        let spool = self.guild_spool(guild);
        if !spool.exists() {
            return Ok(());
        }

        let mut fully_drained = true;
        for entry in std::fs::read_dir(&spool)? {
            if self.shutdown.is_triggered() || !self.state.scan_active(guild) {
                return Ok(());
            }
            let path = entry?.path();
            let Some(user) = container_owner(&path) else {
                tracing::warn!(path = %path.display(), "unrecognized file in archive spool");
                continue;
            };
            if scan
                .with_closing(|closing| closing.notification_attempted(user))
                .unwrap_or(false)
            {
                continue;
            }
            if self.state.is_opted_out(user, OptOutFlag::Archiving) {
                continue;
            }

            if !self.upload_container(guild, user, &path, scan).await? {
                fully_drained = false;
                continue;
            }
            if !self.notify_user(guild, guild_name, user, scan).await {
                fully_drained = false;
            }
        }

        // Keep the spool while anything is outstanding; the next resume
        // picks those users up again.
        if !fully_drained {
            return Ok(());
        }
        if let Err(e) = std::fs::remove_dir_all(&spool) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Uploads one container unless the ledger already records it. Returns
    /// whether the user's notification should proceed.
    async fn upload_container(
        &self,
        guild: GuildId,
        user: UserId,
        path: &Path,
        scan: &ScanState,
    ) -> Result<bool, ArchiveError> {
        let already = scan
            .with_closing(|closing| closing.uploaded.contains(&user))
            .unwrap_or(false);
        if already {
            return Ok(true);
        }
        let bytes = tokio::fs::read(path).await?;
        let key = archive_key(guild, user);
        match retry(
            self.config.network_retry_attempts,
            &self.shutdown,
            StorageError::is_retryable,
            || self.store.put(&key, bytes.clone()),
        )
        .await
        {
            Ok(()) => {
                scan.with_closing(|closing| closing.uploaded.insert(user));
                tracing::debug!(%key, "uploaded archive");
                Ok(true)
            }
            Err(RetryError::Cancelled) => Ok(false),
            Err(RetryError::Inner(e)) => {
                // Left out of the ledger; the next resume retries.
                tracing::warn!(%key, error = %e, "archive upload failed");
                Ok(false)
            }
        }
    }

    /// A time-limited download link for one user's uploaded archive, or
    /// `None` when nothing was ever uploaded for them in this guild.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn download_url(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<Option<String>, StorageError> {
        let key = archive_key(guild, user);
        if !self.store.exists(&key).await? {
            return Ok(None);
        }
        let url = self
            .store
            .presigned_download_url(&key, self.config.presign_ttl)
            .await?;
        Ok(Some(url))
    }

    /// Sends the archive notice, recording delivery or the soft failure.
    /// Only the rate-limit error class is retried, without bound. Returns
    /// false when shutdown interrupted the attempt before it was recorded.
    async fn notify_user(
        &self,
        guild: GuildId,
        guild_name: &str,
        user: UserId,
        scan: &ScanState,
    ) -> bool {
        if !self.gateway.user_exists(user).await {
            tracing::warn!(%user, %guild, "archive owner no longer exists");
            scan.with_closing(|closing| closing.notify_failed.insert(user));
            return true;
        }
        let kind = if !self.gateway.has_prior_dm(user).await {
            NoticeKind::FirstContact
        } else if user == scan.requester() {
            NoticeKind::Requester
        } else {
            NoticeKind::Repeat
        };
        let text = archive_notice(kind, guild_name);
        match retry(0, &self.shutdown, GatewayError::is_rate_limit, || {
            self.gateway.send_dm(user, &text)
        })
        .await
        {
            Ok(()) => {
                scan.with_closing(|closing| closing.notified.insert(user));
                true
            }
            Err(RetryError::Cancelled) => false,
            Err(RetryError::Inner(e)) => {
                // Usually just disabled DMs; recorded and never retried.
                tracing::debug!(%user, error = %e, "archive notice undeliverable");
                scan.with_closing(|closing| closing.notify_failed.insert(user));
                true
            }
        }
    }
}

fn flatten_retry(e: RetryError<StorageError>) -> ArchiveError {
    match e {
        RetryError::Cancelled => {
            ArchiveError::Storage(StorageError::Transport("cancelled by shutdown".into()))
        }
        RetryError::Inner(inner) => ArchiveError::Storage(inner),
    }
}

/// The user owning a spooled `{user}.zip` container.
fn container_owner(path: &Path) -> Option<UserId> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".zip")?;
    stem.parse().ok().map(UserId)
}

/// One text record describing an archived message.
fn message_record(source: MessageSource, channel_name: &str, message: &ChatMessage) -> String {
    let mut record = String::new();
    record.push_str(&format!("Channel: #{channel_name} ({source})\n"));
    record.push_str(&format!(
        "Timestamp: {} UTC\n",
        message.created_at.format("%Y-%m-%d %H:%M:%S")
    ));
    record.push_str(&format!("URL: {}\n", message.permalink));
    if message.content.is_empty() {
        record.push_str("(no message content)");
    } else {
        record.push_str(&format!("Message: {}", message.content));
    }
    record
}

/// Appends entries to a container, creating it if absent. Entry names
/// already present are skipped; they are leftovers of a delete that failed
/// in an earlier purge.
fn append_to_container(
    path: &Path,
    entries: Vec<(String, Vec<u8>)>,
) -> Result<(), ArchiveError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let exists = path.exists();
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let mut existing: HashSet<String> = HashSet::new();
    let mut writer = if exists {
        {
            let archive = ZipArchive::new(&mut file)?;
            existing.extend(archive.file_names().map(str::to_owned));
        }
        ZipWriter::new_append(file)?
    } else {
        ZipWriter::new(file)
    };

    for (name, bytes) in entries {
        if existing.contains(&name) {
            tracing::debug!(%name, "archive entry already present");
            continue;
        }
        writer.start_file(name, SimpleFileOptions::default())?;
        writer.write_all(&bytes)?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_owner_parses_user_ids() {
        assert_eq!(
            container_owner(Path::new("/spool/1/42.zip")),
            Some(UserId(42))
        );
        assert_eq!(container_owner(Path::new("/spool/1/readme.txt")), None);
        assert_eq!(container_owner(Path::new("/spool/1/nope.zip")), None);
    }

    #[test]
    fn append_creates_and_extends_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7.zip");

        append_to_container(&path, vec![("1.txt".into(), b"first".to_vec())]).unwrap();
        append_to_container(
            &path,
            vec![
                ("1.txt".into(), b"duplicate ignored".to_vec()),
                ("2.txt".into(), b"second".to_vec()),
            ],
        )
        .unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        let names: HashSet<String> = archive.file_names().map(str::to_owned).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains("1.txt"));
        assert!(names.contains("2.txt"));

        use std::io::Read;
        let mut body = String::new();
        archive
            .by_name("1.txt")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "first");
    }

    #[test]
    fn message_record_layout() {
        let message = ChatMessage {
            id: anticrop_state::MessageId(9),
            author: UserId(1),
            content: "look at this".into(),
            attachments: Vec::new(),
            created_at: chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2023, 1, 5, 12, 30, 0)
                .single()
                .unwrap(),
            permalink: "https://chat.example/m/9".into(),
        };
        let record = message_record(
            MessageSource::Channel(anticrop_state::ChannelId(3)),
            "general",
            &message,
        );
        assert!(record.contains("Channel: #general (channel 3)"));
        assert!(record.contains("Timestamp: 2023-01-05 12:30:00 UTC"));
        assert!(record.contains("URL: https://chat.example/m/9"));
        assert!(record.contains("Message: look at this"));
    }
}
