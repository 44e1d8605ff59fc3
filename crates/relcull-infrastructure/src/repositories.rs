// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use relcull_domain::TrackFingerprint;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

// ============================================================================
// Cache Keys
// ============================================================================

/// Identity of an audio file as seen by a particular tool invocation.
///
/// A cached fingerprint is only reused while the file size, modification time
/// and tool signature are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub modified_ns: i64,
    pub tool_signature: String,
}

impl CacheKey {
    pub fn new(
        file_path: impl Into<PathBuf>,
        file_size: u64,
        modified_ns: i64,
        tool_signature: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            file_size,
            modified_ns,
            tool_signature: tool_signature.into(),
        }
    }

    pub fn from_metadata(path: &Path, metadata: &Metadata, tool_signature: &str) -> Self {
        let modified_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_nanos()).ok())
            .unwrap_or(0);
        Self::new(path, metadata.len(), modified_ns, tool_signature)
    }

    /// Stat `path` and build its key.
    pub fn for_file(path: &Path, tool_signature: &str) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(path, &metadata, tool_signature))
    }
}

// ============================================================================
// Repository Traits
// ============================================================================

/// Persistent store of successfully extracted fingerprints.
#[async_trait::async_trait]
pub trait FingerprintCache: Send + Sync {
    /// Cached fingerprint for `key`, if the stored file identity still matches.
    async fn get(&self, key: &CacheKey) -> Result<Option<TrackFingerprint>>;

    /// Store or replace the fingerprint for `key`. Failed extractions are ignored.
    async fn put(&self, key: &CacheKey, track: &TrackFingerprint) -> Result<()>;

    async fn entry_count(&self) -> Result<u64>;

    /// Drop every entry produced by a signature other than `keep_signature`.
    async fn purge_other_signatures(&self, keep_signature: &str) -> Result<u64>;
}
