// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub use relcull_fingerprint::{FingerprintPayload, TrackFingerprint};

// ============================================================================
// Scanner Input
// ============================================================================

/// A release folder as reported by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseScan {
    pub release_path: PathBuf,
    /// Top-level category such as "Albums" or "Singles".
    pub group: String,
    /// Scan root the release was found under.
    pub root: PathBuf,
    /// Audio files in path order.
    pub audio_files: Vec<PathBuf>,
}

impl ReleaseScan {
    pub fn new(
        release_path: impl Into<PathBuf>,
        group: impl Into<String>,
        root: impl Into<PathBuf>,
        mut audio_files: Vec<PathBuf>,
    ) -> Self {
        audio_files.sort();
        Self {
            release_path: release_path.into(),
            group: group.into(),
            root: root.into(),
            audio_files,
        }
    }
}

// ============================================================================
// Fingerprint Index Entities
// ============================================================================

/// Fingerprinted tracks of one release, ordered by file path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseFingerprint {
    pub release_path: PathBuf,
    pub group: String,
    pub tracks: Vec<TrackFingerprint>,
    pub track_count: usize,
    /// Files of this release whose extraction failed.
    pub failed_tracks: usize,
}

impl ReleaseFingerprint {
    pub fn new(
        release_path: impl Into<PathBuf>,
        group: impl Into<String>,
        mut tracks: Vec<TrackFingerprint>,
    ) -> Self {
        tracks.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        let track_count = tracks.len();
        Self {
            release_path: release_path.into(),
            group: group.into(),
            tracks,
            track_count,
            failed_tracks: 0,
        }
    }

    pub fn total_duration(&self) -> f64 {
        self.tracks.iter().map(|t| t.duration_seconds).sum()
    }

    pub fn average_duration(&self) -> f64 {
        if self.track_count == 0 {
            0.0
        } else {
            self.total_duration() / self.track_count as f64
        }
    }
}

// ============================================================================
// Pair Relations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Duplicate,
    ASubsetOfB,
    BSubsetOfA,
    Unrelated,
}

impl RelationKind {
    /// The same relation seen with the two releases swapped.
    pub fn reversed(self) -> Self {
        match self {
            RelationKind::ASubsetOfB => RelationKind::BSubsetOfA,
            RelationKind::BSubsetOfA => RelationKind::ASubsetOfB,
            other => other,
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelationKind::Duplicate => write!(f, "duplicate"),
            RelationKind::ASubsetOfB => write!(f, "a_subset_of_b"),
            RelationKind::BSubsetOfA => write!(f, "b_subset_of_a"),
            RelationKind::Unrelated => write!(f, "unrelated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRelation {
    pub release_a: PathBuf,
    pub release_b: PathBuf,
    pub kind: RelationKind,
    pub matched_track_count: usize,
    /// Mean similarity of the matched track pairs (0.0-1.0).
    pub similarity_score: f64,
}

impl PairRelation {
    pub fn reversed(&self) -> Self {
        Self {
            release_a: self.release_b.clone(),
            release_b: self.release_a.clone(),
            kind: self.kind.reversed(),
            matched_track_count: self.matched_track_count,
            similarity_score: self.similarity_score,
        }
    }

    /// `(subset, superset)` for strict containment relations.
    pub fn strict_containment(&self) -> Option<(&Path, &Path)> {
        match self.kind {
            RelationKind::ASubsetOfB => Some((&self.release_a, &self.release_b)),
            RelationKind::BSubsetOfA => Some((&self.release_b, &self.release_a)),
            _ => None,
        }
    }

    /// Directed "is contained in" edges implied by the relation.
    pub fn containment_edges(&self) -> Vec<(&Path, &Path)> {
        match self.kind {
            RelationKind::Duplicate => vec![
                (&self.release_a, &self.release_b),
                (&self.release_b, &self.release_a),
            ],
            RelationKind::Unrelated => Vec::new(),
            _ => self.strict_containment().into_iter().collect(),
        }
    }
}

// ============================================================================
// Redundancy Groups
// ============================================================================

/// Releases linked by duplicate/subset relations with the one kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyGroup {
    pub members: BTreeSet<PathBuf>,
    pub canonical: PathBuf,
    /// `members` without `canonical`.
    pub redundant: BTreeSet<PathBuf>,
    /// Redundant members with no containment chain to `canonical`; they
    /// hold audio the canonical release lacks.
    pub uncovered: BTreeSet<PathBuf>,
}

impl RedundancyGroup {
    /// Redundant members that are safe to act upon.
    pub fn removable(&self) -> impl Iterator<Item = &PathBuf> {
        self.redundant
            .iter()
            .filter(move |path| !self.uncovered.contains(*path))
    }
}

// ============================================================================
// Plan
// ============================================================================

pub const PLAN_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanActionKind {
    Move,
    Delete,
}

impl std::fmt::Display for PlanActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanActionKind::Move => write!(f, "move"),
            PlanActionKind::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PlanMode {
    Delete,
    Move { target_dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanAction {
    pub release_path: PathBuf,
    pub action: PlanActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
}

impl PlanAction {
    pub fn delete(release_path: impl Into<PathBuf>) -> Self {
        Self {
            release_path: release_path.into(),
            action: PlanActionKind::Delete,
            destination: None,
        }
    }

    pub fn move_to(release_path: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            release_path: release_path.into(),
            action: PlanActionKind::Move,
            destination: Some(destination.into()),
        }
    }
}

/// A redundant release left out of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithheldRelease {
    pub release_path: PathBuf,
    pub canonical: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub schema_version: u32,
    pub mode: PlanMode,
    /// Hash of the scanned release paths and their track counts.
    pub input_fingerprint: String,
    pub actions: Vec<PlanAction>,
    #[serde(default)]
    pub withheld: Vec<WithheldRelease>,
    /// Releases the plan must leave in place: canonicals and withheld members.
    #[serde(default)]
    pub kept: Vec<PathBuf>,
}

impl Plan {
    /// A kept release lying at or below `path`, if any.
    ///
    /// Removing or moving such a path would take the kept release with it.
    pub fn kept_within(&self, path: &Path) -> Option<&Path> {
        self.kept
            .iter()
            .chain(self.withheld.iter().map(|w| &w.release_path))
            .find(|kept| kept.starts_with(path))
            .map(PathBuf::as_path)
    }
}

// ============================================================================
// Execution Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ActionState {
    Pending,
    Applied,
    Failed { reason: String },
    Skipped { reason: String },
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionState::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: PlanAction,
    #[serde(flatten)]
    pub state: ActionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub dry_run: bool,
    pub stale: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<ActionOutcome>,
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ApplySummary {
    pub fn new(dry_run: bool, stale: bool, started_at: DateTime<Utc>, outcomes: Vec<ActionOutcome>) -> Self {
        let mut summary = Self {
            dry_run,
            stale,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            applied: 0,
            failed: 0,
            skipped: 0,
        };
        for outcome in &summary.outcomes {
            match outcome.state {
                ActionState::Applied => summary.applied += 1,
                ActionState::Failed { .. } => summary.failed += 1,
                ActionState::Skipped { .. } => summary.skipped += 1,
                ActionState::Pending => {}
            }
        }
        summary
    }

    /// The actions in the order they were attempted.
    pub fn actions(&self) -> Vec<&PlanAction> {
        self.outcomes.iter().map(|o| &o.action).collect()
    }
}
