//! Crawl configuration

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Configuration for the crawl orchestrator and archive manager.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Messages fetched per history page.
    pub page_size: u16,
    /// Attempts for history-page fetches and other bounded network retries.
    pub network_retry_attempts: u32,
    /// Local directory where per-(guild, user) archives are spooled before
    /// upload.
    pub spool_dir: PathBuf,
    /// Messages created at or after this instant are skipped; the platform
    /// began fixing vulnerable uploads itself around this time.
    pub cutoff: Option<DateTime<Utc>>,
    /// Lifetime of presigned archive download links.
    pub presign_ttl: Duration,
    /// How long in-flight network calls get to finish after shutdown.
    pub shutdown_grace: Duration,
    /// Whole-call timeout for image downloads.
    pub download_timeout: Duration,
}

impl CrawlConfig {
    /// Create the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a different spool directory.
    #[inline]
    #[must_use]
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = dir.into();
        self
    }

    /// With a different cutoff, or none.
    #[inline]
    #[must_use]
    pub fn with_cutoff(mut self, cutoff: Option<DateTime<Utc>>) -> Self {
        self.cutoff = cutoff;
        self
    }

    /// With a different page size.
    #[inline]
    #[must_use]
    pub fn with_page_size(mut self, page_size: u16) -> Self {
        self.page_size = page_size;
        self
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            network_retry_attempts: 7,
            spool_dir: PathBuf::from("data/archive"),
            cutoff: Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).single(),
            presign_ttl: Duration::from_secs(60 * 60),
            shutdown_grace: Duration::from_secs(10),
            download_timeout: Duration::from_secs(60),
        }
    }
}
