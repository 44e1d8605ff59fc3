// SPDX-License-Identifier: GPL-3.0-or-later
use relcull_domain::{
    Plan, PlanAction, PlanMode, RedundancyGroup, ReleaseScan, WithheldRelease, PLAN_SCHEMA_VERSION,
};
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while building, storing or validating a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Plan file could not be read or written
    #[error("Plan file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Plan file is not valid JSON for a plan
    #[error("Plan file is malformed: {0}")]
    Json(#[from] serde_json::Error),

    /// Plan document lacks a required field
    #[error("Plan file is invalid: {0}")]
    Invalid(String),

    /// Plan was written by an incompatible version
    #[error("Unsupported plan schema version {found} (supported: {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },

    /// Library changed since the plan was built and strict mode is on
    #[error("Plan is stale: built for input {expected}, current input is {actual}")]
    Stale { expected: String, actual: String },

    /// Apply-time options contradict each other
    #[error("Invalid options: {0}")]
    InvalidFlags(String),

    /// Plan mode differs from the requested mode
    #[error("Plan was built for '{plan}' but '{requested}' was requested")]
    ModeMismatch { plan: String, requested: String },
}

pub type PlanResult<T> = Result<T, PlanError>;

/// Hash of the scanned release paths and their audio file counts.
///
/// Used to detect library changes between building and applying a plan.
pub fn input_fingerprint(scans: &[ReleaseScan]) -> String {
    let mut lines: Vec<String> = scans
        .iter()
        .map(|scan| format!("{}\t{}\n", scan.release_path.display(), scan.audio_files.len()))
        .collect();
    lines.sort();

    let mut hasher = blake3::Hasher::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Compare a loaded plan against the current library.
///
/// Returns whether the plan is stale. A stale plan is an error only when
/// `strict` is set.
pub fn check_staleness(plan: &Plan, current_fingerprint: &str, strict: bool) -> PlanResult<bool> {
    if plan.input_fingerprint == current_fingerprint {
        return Ok(false);
    }
    if strict {
        return Err(PlanError::Stale {
            expected: plan.input_fingerprint.clone(),
            actual: current_fingerprint.to_string(),
        });
    }
    warn!(
        target: "plan",
        expected = %plan.input_fingerprint,
        actual = %current_fingerprint,
        "library changed since the plan was built"
    );
    Ok(true)
}

/// Reject a plan whose mode differs from the requested one.
pub fn ensure_mode(plan: &Plan, requested: &PlanMode) -> PlanResult<()> {
    let matches = match (&plan.mode, requested) {
        (PlanMode::Delete, PlanMode::Delete) => true,
        (PlanMode::Move { target_dir: a }, PlanMode::Move { target_dir: b }) => a == b,
        _ => false,
    };
    if matches {
        Ok(())
    } else {
        Err(PlanError::ModeMismatch {
            plan: describe_mode(&plan.mode),
            requested: describe_mode(requested),
        })
    }
}

pub fn describe_mode(mode: &PlanMode) -> String {
    match mode {
        PlanMode::Delete => "delete".to_string(),
        PlanMode::Move { target_dir } => format!("move to {}", target_dir.display()),
    }
}

/// Where a release was found, for computing move destinations.
#[derive(Debug, Clone)]
struct Origin {
    root: PathBuf,
    group: String,
}

/// Turns redundancy groups into plan actions. Never touches the filesystem.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    mode: PlanMode,
    origins: HashMap<PathBuf, Origin>,
}

impl PlanBuilder {
    pub fn new(mode: PlanMode) -> Self {
        Self {
            mode,
            origins: HashMap::new(),
        }
    }

    /// Record scan roots so move destinations keep the library layout.
    pub fn with_scans(mut self, scans: &[ReleaseScan]) -> Self {
        for scan in scans {
            self.origins.insert(
                scan.release_path.clone(),
                Origin {
                    root: scan.root.clone(),
                    group: scan.group.clone(),
                },
            );
        }
        self
    }

    pub fn build(&self, groups: &[RedundancyGroup], input_fingerprint: impl Into<String>) -> Plan {
        let mut candidates: Vec<(&PathBuf, &PathBuf)> = Vec::new();
        let mut withheld = Vec::new();
        let mut kept: BTreeSet<PathBuf> = groups.iter().map(|g| g.canonical.clone()).collect();

        for group in groups {
            for release in &group.redundant {
                if group.uncovered.contains(release) {
                    kept.insert(release.clone());
                    withheld.push(WithheldRelease {
                        release_path: release.clone(),
                        canonical: group.canonical.clone(),
                        reason: "holds tracks not present in the canonical release".to_string(),
                    });
                    continue;
                }
                candidates.push((release, &group.canonical));
            }
        }

        // Scanned releases outside every group stay too.
        let acted: BTreeSet<&PathBuf> = candidates.iter().map(|(release, _)| *release).collect();
        kept.extend(self.origins.keys().filter(|path| !acted.contains(path)).cloned());

        // Withholding a release keeps it, which can in turn block an enclosing folder.
        loop {
            let (blocked, rest): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|(release, _)| enclosed_kept(&kept, release).is_some());
            candidates = rest;
            if blocked.is_empty() {
                break;
            }
            for (release, canonical) in blocked {
                let inner = enclosed_kept(&kept, release).map(Path::to_path_buf);
                if let Some(inner) = inner {
                    warn!(
                        target: "plan",
                        release = %release.display(),
                        kept = %inner.display(),
                        "release folder contains a kept release, withholding it"
                    );
                    withheld.push(WithheldRelease {
                        release_path: release.clone(),
                        canonical: canonical.clone(),
                        reason: format!("contains kept release {}", inner.display()),
                    });
                }
                kept.insert(release.clone());
            }
        }

        let mut actions: Vec<PlanAction> = candidates
            .into_iter()
            .map(|(release, _)| match &self.mode {
                PlanMode::Delete => PlanAction::delete(release),
                PlanMode::Move { target_dir } => {
                    PlanAction::move_to(release, target_dir.join(self.relative_path(release)))
                }
            })
            .collect();

        actions.sort_by(|a, b| a.release_path.cmp(&b.release_path));
        withheld.sort_by(|a, b| a.release_path.cmp(&b.release_path));

        info!(
            target: "plan",
            mode = %describe_mode(&self.mode),
            actions = actions.len(),
            withheld = withheld.len(),
            "plan built"
        );

        Plan {
            schema_version: PLAN_SCHEMA_VERSION,
            mode: self.mode.clone(),
            input_fingerprint: input_fingerprint.into(),
            actions,
            withheld,
            kept: kept.into_iter().collect(),
        }
    }

    /// Release path below its scan root, keeping the group folder.
    fn relative_path(&self, release: &Path) -> PathBuf {
        let fallback = || {
            release
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| release.to_path_buf())
        };
        let Some(origin) = self.origins.get(release) else {
            return fallback();
        };

        // A root that is itself the group folder stays part of the path.
        let root_is_group = origin
            .root
            .file_name()
            .map(|name| name.to_string_lossy().eq_ignore_ascii_case(&origin.group))
            .unwrap_or(false);
        let base = match origin.root.parent() {
            Some(parent) if root_is_group => parent,
            _ => origin.root.as_path(),
        };

        match release.strip_prefix(base) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
            _ => fallback(),
        }
    }
}

/// A kept release at or below `release`, other than `release` itself.
fn enclosed_kept<'a>(kept: &'a BTreeSet<PathBuf>, release: &Path) -> Option<&'a Path> {
    kept.range::<Path, _>((Bound::Excluded(release), Bound::Unbounded))
        .next()
        .filter(|path| path.starts_with(release))
        .map(PathBuf::as_path)
}
