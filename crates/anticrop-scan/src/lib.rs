//! Anticrop Scan - forensic PNG classifier
//!
//! Detects the Acropalypse data leak (CVE-2023-21036): in-place-edited PNGs
//! that retain trailing bytes of the pre-edit original. Provides:
//! - Chunk-level parsing of the PNG container format
//! - A confidence-graded detector with threshold-driven early exit
//! - Stripping of exploitable trailing bytes for safe archival
//!
//! # Example
//!
//! ```rust
//! use anticrop_scan::{ScanConfidence, Scanner};
//!
//! let scanner = Scanner::new();
//! let verdict = scanner.scan(b"not a png", ScanConfidence::Certain);
//! assert_eq!(verdict, ScanConfidence::None);
//! ```

#![warn(unreachable_pub)]

pub mod chunk;
pub mod confidence;
pub mod detect;
pub mod strip;

pub use chunk::{read_chunk, Chunk, ChunkError, IDAT, IEND, PNG_SIGNATURE};
pub use confidence::{ScanConfidence, ScanVerdict};
pub use detect::Scanner;
pub use strip::{strip, StripError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
