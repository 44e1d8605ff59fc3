// SPDX-License-Identifier: GPL-3.0-or-later

//! Acoustic fingerprint extraction through an external Chromaprint tool.
//!
//! This crate provides functionality for:
//! - Running `fpcalc` (or a compatible tool) over audio files with bounded parallelism
//! - Parsing the tool's key/value and tab-delimited output formats
//! - Comparing fingerprint payloads exactly or by bit error rate

pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod parser;

pub use error::{FingerprintError, Result};
pub use extractor::{ExtractionStream, ExtractionSummary, ExtractorConfig, FingerprintExtractor};
pub use fingerprint::{FingerprintPayload, TrackFingerprint};
pub use parser::{parse_tool_output, ToolRecord};
