// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{FingerprintError, Result};

/// Fingerprint data as emitted by the external tool.
///
/// `fpcalc -raw` prints the uncompressed Chromaprint sub-fingerprints as a
/// comma-separated list of 32-bit integers; without `-raw` it prints the
/// compressed, base64-encoded form. Only the raw form supports bitwise
/// comparison; the encoded form can only be compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum FingerprintPayload {
    Raw(Vec<u32>),
    Encoded(String),
}

impl FingerprintPayload {
    /// Parse the fingerprint token string from the tool output.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(FingerprintError::InvalidFingerprint(
                "fingerprint is empty".to_string(),
            ));
        }

        if value
            .chars()
            .all(|c| c.is_ascii_digit() || c == ',' || c == '-')
        {
            return parse_raw(value).map(Self::Raw);
        }

        validate_encoded(value)?;
        Ok(Self::Encoded(value.to_string()))
    }

    /// Number of comparable tokens (sub-fingerprints or encoded bytes).
    pub fn len(&self) -> usize {
        match self {
            Self::Raw(tokens) => tokens.len(),
            Self::Encoded(hash) => hash.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Similarity in `0.0..=1.0`.
    ///
    /// Raw payloads are aligned at their start and compared over the common
    /// prefix; the result is `1 - bit_error_rate`. If the common prefix covers
    /// less than `min_overlap_ratio` of the longer payload the similarity is 0.
    /// Any other combination is 1.0 when equal and 0.0 otherwise.
    pub fn similarity(&self, other: &Self, min_overlap_ratio: f64) -> f64 {
        match (self, other) {
            (Self::Raw(a), Self::Raw(b)) => {
                let longer = a.len().max(b.len());
                let overlap = a.len().min(b.len());
                if overlap == 0 {
                    return 0.0;
                }
                if (overlap as f64) / (longer as f64) < min_overlap_ratio {
                    return 0.0;
                }
                1.0 - bit_error_rate(&a[..overlap], &b[..overlap])
            }
            (a, b) if a == b => 1.0,
            _ => 0.0,
        }
    }

    /// Canonical textual form, the inverse of [`FingerprintPayload::parse`].
    pub fn to_token_string(&self) -> String {
        match self {
            Self::Raw(tokens) => tokens
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(","),
            Self::Encoded(hash) => hash.clone(),
        }
    }
}

impl fmt::Display for FingerprintPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(tokens) => write!(f, "raw[{}]", tokens.len()),
            Self::Encoded(hash) => write!(f, "encoded[{}]", hash.len()),
        }
    }
}

/// Fraction of differing bits between two equally long raw payloads.
pub fn bit_error_rate(a: &[u32], b: &[u32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 1.0;
    }
    let differing: u64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| u64::from((x ^ y).count_ones()))
        .sum();
    differing as f64 / (a.len() as f64 * 32.0)
}

fn parse_raw(value: &str) -> Result<Vec<u32>> {
    value
        .split(',')
        .map(|token| {
            let token = token.trim();
            // `fpcalc -signed` prints the same bits as i32.
            let parsed = if let Some(stripped) = token.strip_prefix('-') {
                stripped
                    .parse::<u32>()
                    .ok()
                    .and_then(|magnitude| i32::try_from(-(i64::from(magnitude))).ok())
                    .map(|signed| signed as u32)
            } else {
                token.parse::<u32>().ok()
            };
            parsed.ok_or_else(|| {
                FingerprintError::InvalidFingerprint(format!("invalid raw token '{}'", token))
            })
        })
        .collect()
}

fn validate_encoded(hash: &str) -> Result<()> {
    // Chromaprint hashes are base64-encoded: alphanumeric, +, /, -, _ with = only as padding at the end
    let trimmed = hash.trim_end_matches('=');

    let padding_len = hash.len() - trimmed.len();
    if padding_len > 2 {
        return Err(FingerprintError::InvalidFingerprint(
            "invalid base64 padding: too many '=' characters".to_string(),
        ));
    }

    if trimmed.contains('=') {
        return Err(FingerprintError::InvalidFingerprint(
            "padding character '=' must only appear at the end".to_string(),
        ));
    }

    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '-' | '_'))
    {
        return Err(FingerprintError::InvalidFingerprint(
            "fingerprint contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

/// Fingerprint of a single audio file, or the reason it could not be produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackFingerprint {
    pub file_path: PathBuf,
    pub duration_seconds: f64,
    pub payload: Option<FingerprintPayload>,
    pub extraction_error: Option<String>,
}

impl TrackFingerprint {
    pub fn new(file_path: impl Into<PathBuf>, duration_seconds: f64, payload: FingerprintPayload) -> Self {
        Self {
            file_path: file_path.into(),
            duration_seconds,
            payload: Some(payload),
            extraction_error: None,
        }
    }

    pub fn failed(file_path: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            duration_seconds: 0.0,
            payload: None,
            extraction_error: Some(error.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn is_ok(&self) -> bool {
        self.extraction_error.is_none() && self.payload.is_some()
    }
}
