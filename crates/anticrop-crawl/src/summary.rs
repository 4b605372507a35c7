//! Human-readable messages for requesters and affected users
//!
//! Pure text assembly; delivery and idempotency guards live with the
//! orchestrator and archive manager.

use std::collections::BTreeSet;

use anticrop_scan::ScanConfidence;
use anticrop_state::{Permission, Tally};

/// Which notification wording an affected user receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// The bot has never messaged this user before.
    FirstContact,
    /// The user is the one who requested the scan.
    Requester,
    /// The user has been notified by the bot before.
    Repeat,
}

/// Builds the one-shot scan summary DM for the requester.
#[must_use]
pub fn scan_summary(
    guild_name: &str,
    skipped: &[(String, BTreeSet<Permission>)],
    threshold: Option<ScanConfidence>,
    tally: &Tally,
) -> String {
    let mut text = String::new();
    text.push_str("I have finished scanning ");
    text.push_str(guild_name);
    text.push_str(" for vulnerable screenshots. ");

    if !skipped.is_empty() {
        text.push_str(
            "During my scan, I had to skip the following channels (and their threads) \
             for lack of permissions:\n",
        );
        for (label, missing) in skipped {
            text.push_str(" - ");
            text.push_str(label);
            text.push_str(" - Missing: ");
            let names: Vec<_> = missing.iter().map(|p| p.display_name()).collect();
            text.push_str(&names.join(", "));
            text.push('\n');
        }
    }

    if let Some(threshold) = threshold {
        let deleted = tally.at_or_above(threshold);
        text.push_str(&format!("In my scan, I deleted {deleted}"));
        if threshold != ScanConfidence::Certain {
            text.push_str(" potentially");
        }
        text.push_str(" vulnerable screenshots.\n");
    } else {
        text.push_str("Per your request, I did not delete any screenshots.\n");
    }

    text.push_str(
        "The full results, where the first column corresponds to the likelihood of \
         an image being vulnerable, are as follows:\n",
    );
    for (level, count) in tally.levels() {
        if threshold.is_some_and(|t| level > t) {
            break;
        }
        text.push_str(level.display_name());
        if threshold == Some(level) {
            text.push_str(" or higher");
        }
        text.push_str(&format!(": {count}\n"));
    }
    if tally.opted_out() > 0 {
        text.push_str(&format!("Opted out: {}\n", tally.opted_out()));
    }
    if threshold.is_some_and(|t| t < ScanConfidence::Certain) {
        text.push_str(
            "To reduce server load, statistics were not collected for confidence \
             levels above the threshold you selected.",
        );
    }
    text
}

/// Builds the archive notification DM for one affected user.
#[must_use]
pub fn archive_notice(kind: NoticeKind, guild_name: &str) -> String {
    match kind {
        NoticeKind::FirstContact => format!(
            "Hi there! A server you are or were in, {guild_name}, requested that I scan \
             their server for and delete certain old screenshots. Specifically, I have \
             deleted screenshots that I found to be vulnerable to a recently discovered \
             exploit which could allow bad actors to extract the original image from an \
             edited screenshot taken on certain devices. During this scan I found and \
             deleted several screenshots of yours that were susceptible to this \
             vulnerability. If at any time you would like to download these screenshots, \
             please run the `/download` command to receive a temporary download link. \
             Otherwise, you may run `/forget-me` to remove all of your archived \
             screenshots and `/opt-out` to opt out of having your messages deleted \
             and/or archived in the future."
        ),
        NoticeKind::Requester => format!(
            "Ah, I see why you needed my help! It seems I found and deleted several \
             screenshots of yours in {guild_name}. Like everyone else, you can run \
             `/download` to receive a temporary download link, `/forget-me` to remove \
             all of your archived screenshots, and/or `/opt-out` to opt out of having \
             your messages deleted and/or archived in the future."
        ),
        NoticeKind::Repeat => format!(
            "Hi again! A server you are or were in, {guild_name}, has new archived \
             screenshots available for you. Per usual, you can run `/download` to \
             download them, `/forget-me` to delete them, and/or `/opt-out` to not have \
             your images archived or deleted anymore."
        ),
    }
}
