// SPDX-License-Identifier: GPL-3.0-or-later

//! Release discovery.
//!
//! A release is the first folder below a group folder (`Albums`, `Singles`,
//! matched case-insensitively). Audio files that sit under no group folder
//! belong to their parent folder. Audio files directly inside a group folder
//! or a scan root belong to no release and are skipped, as is any folder that
//! itself contains another release.

use relcull_config::AppConfig;
use relcull_domain::ReleaseScan;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    /// None of the requested roots exists
    #[error("No scan root exists: {0}")]
    NoRoots(String),
}

pub type ScanResult<T> = Result<T, ScanError>;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub group_folders: Vec<String>,
    /// Lower-case extensions without the leading dot.
    pub extensions: BTreeSet<String>,
}

impl ScanOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            group_folders: config.scan.group_folders.clone(),
            extensions: config
                .fingerprint
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_audio(&self, path: &Path) -> bool {
        path.extension()
            .and_then(OsStr::to_str)
            .map(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    fn group_name(&self, component: &OsStr) -> Option<&str> {
        let name = component.to_str()?;
        self.group_folders
            .iter()
            .find(|group| group.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

struct PendingRelease {
    group: String,
    root: PathBuf,
    files: BTreeSet<PathBuf>,
}

/// Walk `roots` and return the releases found, ordered by release path.
///
/// Missing roots are skipped with a warning; it is an error only when none
/// of them exists.
pub fn scan_roots(roots: &[PathBuf], options: &ScanOptions) -> ScanResult<Vec<ReleaseScan>> {
    let mut releases: BTreeMap<PathBuf, PendingRelease> = BTreeMap::new();
    let mut existing_roots = 0usize;

    for root in roots {
        if !root.is_dir() {
            warn!(target: "scanner", root = %root.display(), "scan root does not exist, skipping");
            continue;
        }
        existing_roots += 1;

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(target: "scanner", error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !options.is_audio(entry.path()) {
                continue;
            }

            let file = entry.into_path();
            let Some((release_path, group)) = release_for_file(root, &file, options) else {
                continue;
            };

            releases
                .entry(release_path)
                .or_insert_with(|| PendingRelease {
                    group,
                    root: root.clone(),
                    files: BTreeSet::new(),
                })
                .files
                .insert(file);
        }
    }

    if existing_roots == 0 && !roots.is_empty() {
        let names: Vec<String> = roots.iter().map(|r| r.display().to_string()).collect();
        return Err(ScanError::NoRoots(names.join(", ")));
    }

    drop_enclosing_releases(&mut releases);

    let scans: Vec<ReleaseScan> = releases
        .into_iter()
        .map(|(path, pending)| {
            ReleaseScan::new(path, pending.group, pending.root, pending.files.into_iter().collect())
        })
        .collect();

    info!(
        target: "scanner",
        releases = scans.len(),
        files = scans.iter().map(|s| s.audio_files.len()).sum::<usize>(),
        "scan finished"
    );
    Ok(scans)
}

/// Remove releases whose folder contains another release.
///
/// Acting on such a folder would also act on every release below it.
fn drop_enclosing_releases(releases: &mut BTreeMap<PathBuf, PendingRelease>) {
    // Paths order component-wise, so a folder's descendants directly follow it.
    let paths: Vec<&PathBuf> = releases.keys().collect();
    let enclosing: Vec<PathBuf> = paths
        .windows(2)
        .filter(|pair| pair[1].starts_with(pair[0]))
        .map(|pair| pair[0].clone())
        .collect();

    for path in enclosing {
        if let Some(pending) = releases.remove(&path) {
            warn!(
                target: "scanner",
                release = %path.display(),
                files = pending.files.len(),
                "folder contains other releases, skipping its own audio files"
            );
        }
    }
}

/// Release folder and group for one audio file below `root`.
fn release_for_file(root: &Path, file: &Path, options: &ScanOptions) -> Option<(PathBuf, String)> {
    let components: Vec<Component<'_>> = file.components().collect();
    // The root's own name may be a group folder ("Albums" passed as root).
    let first_candidate = root.components().count().saturating_sub(1);
    // The last component is the file name and cannot be a release.
    let folder_count = components.len().saturating_sub(1);

    for idx in first_candidate..folder_count {
        let Component::Normal(name) = components[idx] else {
            continue;
        };
        let Some(group) = options.group_name(name) else {
            continue;
        };
        if idx + 1 < folder_count {
            let release: PathBuf = components[..=idx + 1].iter().collect();
            return Some((release, group.to_string()));
        }
        // The group folder holds releases; it is never one itself.
        warn!(target: "scanner", file = %file.display(), "audio file directly inside group folder, skipping");
        return None;
    }

    let parent = file.parent()?.to_path_buf();
    if parent == root {
        warn!(target: "scanner", file = %file.display(), "audio file directly inside scan root, skipping");
        return None;
    }
    let group = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string());
    Some((parent, group))
}
