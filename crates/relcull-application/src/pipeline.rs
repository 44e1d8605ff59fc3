// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end dedupe run: cache lookup, extraction, matching, resolution and
//! plan construction.

use relcull_domain::{PairRelation, Plan, PlanMode, RedundancyGroup, ReleaseScan, TrackFingerprint};
use relcull_fingerprint::{FingerprintError, FingerprintExtractor};
use relcull_infrastructure::{CacheKey, FingerprintCache};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::index::FingerprintIndex;
use crate::matcher::{find_relations, MatchSettings};
use crate::plan::{input_fingerprint, PlanBuilder};
use crate::resolver::{post_check, resolve};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fingerprinting could not start at all
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    /// Interrupted before all fingerprints were available
    #[error("Cancelled after {completed} of {total} fingerprints")]
    Cancelled { completed: usize, total: usize },

    /// Fingerprint cache could not be read
    #[error("Fingerprint cache failed: {0}")]
    Cache(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub files: usize,
    pub cached: usize,
    pub extracted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub index: FingerprintIndex,
    pub relations: Vec<PairRelation>,
    pub groups: Vec<RedundancyGroup>,
    /// Related pairs left among kept releases.
    pub post_check: Vec<PairRelation>,
    pub input_fingerprint: String,
    pub extraction: ExtractionStats,
    pub compared_pairs: usize,
    pub pruned_pairs: usize,
    /// Present when a plan mode was requested.
    pub plan: Option<Plan>,
}

pub struct DedupePipeline {
    extractor: FingerprintExtractor,
    settings: MatchSettings,
    cache: Option<Arc<dyn FingerprintCache>>,
}

impl DedupePipeline {
    pub fn new(extractor: FingerprintExtractor, settings: MatchSettings) -> Self {
        Self {
            extractor,
            settings,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn FingerprintCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run every stage over `scans`.
    ///
    /// Fails before any extraction when the tool is unavailable. A cancelled
    /// run returns [`PipelineError::Cancelled`] and never matches partial
    /// data.
    pub async fn run(
        &self,
        scans: &[ReleaseScan],
        mode: Option<PlanMode>,
        cancel: CancellationToken,
    ) -> PipelineResult<PipelineOutcome> {
        self.extractor.ensure_tool_available().await?;

        let files: BTreeSet<PathBuf> = scans
            .iter()
            .flat_map(|scan| scan.audio_files.iter().cloned())
            .collect();
        let mut stats = ExtractionStats {
            files: files.len(),
            ..ExtractionStats::default()
        };

        let signature = self.extractor.signature();
        let mut fingerprints: Vec<TrackFingerprint> = Vec::with_capacity(files.len());
        let mut keys: HashMap<PathBuf, CacheKey> = HashMap::new();
        let mut misses: Vec<PathBuf> = Vec::new();

        if let Some(cache) = &self.cache {
            match cache.purge_other_signatures(&signature).await {
                Ok(0) => {}
                Ok(purged) => {
                    info!(target: "pipeline", purged, %signature, "dropped fingerprints from other tool versions")
                }
                Err(e) => warn!(target: "pipeline", error = %e, "failed to purge stale cache entries"),
            }
        }

        for file in files {
            let Some(cache) = &self.cache else {
                misses.push(file);
                continue;
            };
            let key = match CacheKey::for_file(&file, &signature) {
                Ok(key) => key,
                Err(e) => {
                    debug!(target: "pipeline", file = %file.display(), error = %e, "cannot stat file");
                    misses.push(file);
                    continue;
                }
            };
            match cache.get(&key).await {
                Ok(Some(track)) => {
                    stats.cached += 1;
                    fingerprints.push(track);
                }
                Ok(None) => {
                    keys.insert(file.clone(), key);
                    misses.push(file);
                }
                Err(e) => return Err(PipelineError::Cache(e.to_string())),
            }
        }

        info!(
            target: "pipeline",
            files = stats.files,
            cached = stats.cached,
            to_extract = misses.len(),
            "fingerprint lookup finished"
        );

        let mut stream = self.extractor.extract(misses, cancel.clone());
        while let Some(track) = stream.next().await {
            if stream.was_cancelled() {
                break;
            }
            if track.is_ok() {
                stats.extracted += 1;
                if let (Some(cache), Some(key)) = (&self.cache, keys.get(&track.file_path)) {
                    if let Err(e) = cache.put(key, &track).await {
                        warn!(target: "pipeline", file = %track.file_path.display(), error = %e, "failed to cache fingerprint");
                    }
                }
            } else {
                stats.failed += 1;
            }
            fingerprints.push(track);
        }
        let summary = stream.finish().await;

        if summary.cancelled || cancel.is_cancelled() {
            warn!(
                target: "pipeline",
                completed = summary.completed,
                total = summary.total,
                "extraction cancelled, discarding partial fingerprints"
            );
            return Err(PipelineError::Cancelled {
                completed: stats.cached + summary.completed,
                total: stats.files,
            });
        }

        let index = FingerprintIndex::build(scans, fingerprints);
        let matched = find_relations(&index, &self.settings);
        let groups = resolve(&index, &matched.relations);
        let remaining = post_check(&groups, &matched.relations);
        let input_fingerprint = input_fingerprint(scans);

        let plan = mode.map(|mode| {
            PlanBuilder::new(mode)
                .with_scans(scans)
                .build(&groups, input_fingerprint.clone())
        });

        if !remaining.is_empty() {
            warn!(target: "pipeline", remaining = remaining.len(), "containment remains among kept releases");
        }

        Ok(PipelineOutcome {
            index,
            relations: matched.relations,
            groups,
            post_check: remaining,
            input_fingerprint,
            extraction: stats,
            compared_pairs: matched.compared,
            pruned_pairs: matched.pruned,
            plan,
        })
    }
}
