//! Confidence model for scan results
//!
//! Defines the ordered verdict vocabulary of the detector:
//! - `ScanConfidence` - how likely an image is to leak recoverable data
//! - `ScanVerdict` - a confidence or the out-of-band opted-out marker

use serde::{Deserialize, Serialize};

/// How confident the detector is that an image is vulnerable.
///
/// The ordering is load-bearing: deletion policy compares a scan result
/// against a configured threshold, and the detector itself early-exits as
/// soon as the requested threshold is reached.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ScanConfidence {
    /// The image could not be scanned, likely a failure to download it.
    Error,
    /// No vulnerability was detected.
    None,
    /// Trailing data was detected, although it may be unrelated to the
    /// vulnerability.
    Low,
    /// Data resembling leftover image chunks was detected, but could not be
    /// parsed back into a chunk stream.
    Medium,
    /// Valid leftover image chunks were recovered, but no independently
    /// decompressible payload was found.
    High,
    /// The image undoubtedly contains a recoverable second image.
    Certain,
}

impl ScanConfidence {
    /// The default confidence level required before deleting an image.
    pub const DEFAULT: Self = Self::High;

    /// Human-readable label used in summaries.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Error => "Failed to download",
            Self::None => "None",
            Self::Low => "Possible",
            Self::Medium => "Likely",
            Self::High => "Very Likely",
            Self::Certain => "Certain",
        }
    }

    /// Description of the deletion policy this level implies, if it is a
    /// configurable threshold.
    #[must_use]
    pub fn policy_description(self) -> Option<&'static str> {
        match self {
            Self::Low => Some("Deletes all PNGs with excess data at the end of the file"),
            Self::Medium => {
                Some("Deletes PNGs with excess data loosely resembling another image")
            }
            Self::High => {
                Some("Deletes PNGs with excess data highly resembling another image")
            }
            Self::Certain => {
                Some("Deletes PNGs with excess data that undoubtedly contains another image")
            }
            _ => None,
        }
    }

    /// All levels in ascending order.
    #[must_use]
    pub fn all() -> [Self; 6] {
        [
            Self::Error,
            Self::None,
            Self::Low,
            Self::Medium,
            Self::High,
            Self::Certain,
        ]
    }
}

/// Outcome of scanning a message.
///
/// Opted-out authors are tracked separately from the confidence ladder so the
/// sentinel can never be compared numerically against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanVerdict {
    /// The message was scanned and produced a confidence level.
    Confidence(ScanConfidence),
    /// The author opted out of scanning entirely; nothing was inspected.
    OptedOut,
}

impl ScanVerdict {
    /// The confidence level, if the message was actually scanned.
    #[inline]
    #[must_use]
    pub fn confidence(self) -> Option<ScanConfidence> {
        match self {
            Self::Confidence(c) => Some(c),
            Self::OptedOut => None,
        }
    }

    /// Whether this verdict meets a deletion threshold. Opted-out messages
    /// never do.
    #[inline]
    #[must_use]
    pub fn meets(self, threshold: ScanConfidence) -> bool {
        matches!(self, Self::Confidence(c) if c >= threshold)
    }
}

impl From<ScanConfidence> for ScanVerdict {
    fn from(value: ScanConfidence) -> Self {
        Self::Confidence(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_ordering() {
        use ScanConfidence::*;
        assert!(Error < None);
        assert!(None < Low);
        assert!(Low < Medium);
        assert!(Medium < High);
        assert!(High < Certain);
    }

    #[test]
    fn verdict_meets_threshold() {
        let verdict = ScanVerdict::Confidence(ScanConfidence::High);
        assert!(verdict.meets(ScanConfidence::Medium));
        assert!(verdict.meets(ScanConfidence::High));
        assert!(!verdict.meets(ScanConfidence::Certain));
        assert!(!ScanVerdict::OptedOut.meets(ScanConfidence::Error));
    }

    #[test]
    fn default_threshold_is_high() {
        assert_eq!(ScanConfidence::DEFAULT, ScanConfidence::High);
    }
}
