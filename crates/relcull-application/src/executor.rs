// SPDX-License-Identifier: GPL-3.0-or-later

//! Sequential plan application.
//!
//! Every action passes through the same checks in dry-run and real mode; only
//! the final filesystem mutation is skipped in dry-run, so both modes report
//! identical outcomes. A failed action never stops the run.

use chrono::Utc;
use relcull_domain::{ActionOutcome, ActionState, ApplySummary, Plan, PlanAction, PlanActionKind};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

const ALREADY_APPLIED: &str = "already applied";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    /// Replace an existing move destination.
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PlanExecutor {
    options: ExecuteOptions,
}

impl PlanExecutor {
    pub fn new(options: ExecuteOptions) -> Self {
        Self { options }
    }

    /// Apply every action of `plan` in order.
    pub fn apply(&self, plan: &Plan, stale: bool) -> ApplySummary {
        let started_at = Utc::now();
        info!(
            target: "executor",
            actions = plan.actions.len(),
            dry_run = self.options.dry_run,
            force = self.options.force,
            stale,
            "applying plan"
        );

        let outcomes: Vec<ActionOutcome> = plan
            .actions
            .iter()
            .map(|action| {
                let state = match plan.kept_within(&action.release_path) {
                    Some(kept) => ActionState::Failed {
                        reason: format!("release contains kept release {}", kept.display()),
                    },
                    None => self.apply_action(action),
                };
                log_outcome(action, &state, self.options.dry_run);
                ActionOutcome {
                    action: action.clone(),
                    state,
                }
            })
            .collect();

        let summary = ApplySummary::new(self.options.dry_run, stale, started_at, outcomes);
        info!(
            target: "executor",
            applied = summary.applied,
            failed = summary.failed,
            skipped = summary.skipped,
            dry_run = summary.dry_run,
            "plan applied"
        );
        summary
    }

    fn apply_action(&self, action: &PlanAction) -> ActionState {
        match action.action {
            PlanActionKind::Delete => self.delete(&action.release_path),
            PlanActionKind::Move => match action.destination.as_deref() {
                Some(destination) => self.relocate(&action.release_path, destination),
                None => ActionState::Failed {
                    reason: "move action has no destination".to_string(),
                },
            },
        }
    }

    fn delete(&self, source: &Path) -> ActionState {
        if !exists(source) {
            return ActionState::Skipped {
                reason: ALREADY_APPLIED.to_string(),
            };
        }
        if self.options.dry_run {
            return ActionState::Applied;
        }
        match remove_path(source) {
            Ok(()) => ActionState::Applied,
            Err(e) => failed("delete failed", &e),
        }
    }

    fn relocate(&self, source: &Path, destination: &Path) -> ActionState {
        let source_exists = exists(source);
        let destination_exists = exists(destination);

        if !source_exists {
            return if destination_exists {
                ActionState::Skipped {
                    reason: ALREADY_APPLIED.to_string(),
                }
            } else {
                ActionState::Failed {
                    reason: "path vanished since planning".to_string(),
                }
            };
        }
        if destination_exists && !self.options.force {
            return ActionState::Failed {
                reason: format!("destination exists: {}", destination.display()),
            };
        }
        if destination.starts_with(source) {
            return ActionState::Failed {
                reason: "destination is inside the release".to_string(),
            };
        }
        if self.options.dry_run {
            return ActionState::Applied;
        }

        match move_path(source, destination, destination_exists) {
            Ok(()) => ActionState::Applied,
            Err(e) => failed("move failed", &e),
        }
    }
}

fn failed(context: &str, error: &io::Error) -> ActionState {
    ActionState::Failed {
        reason: format!("{}: {}", context, error),
    }
}

fn log_outcome(action: &PlanAction, state: &ActionState, dry_run: bool) {
    let release = action.release_path.display();
    let destination = action
        .destination
        .as_ref()
        .map(|d| d.display().to_string())
        .unwrap_or_default();
    match state {
        ActionState::Applied => {
            info!(target: "executor", %release, %destination, action = %action.action, dry_run, "action applied")
        }
        ActionState::Skipped { reason } => {
            info!(target: "executor", %release, action = %action.action, %reason, dry_run, "action skipped")
        }
        ActionState::Failed { reason } => {
            warn!(target: "executor", %release, action = %action.action, %reason, dry_run, "action failed")
        }
        ActionState::Pending => {}
    }
}

/// Existence check that does not follow a dangling symlink to "missing".
fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.symlink_metadata()?.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn move_path(source: &Path, destination: &Path, replace: bool) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if replace {
        replace_path(destination, || move_into(source, destination))
    } else {
        move_into(source, destination)
    }
}

/// Run `install` with the current `destination` renamed aside.
///
/// The old destination is removed once `install` succeeds and renamed back
/// when it fails.
fn replace_path(destination: &Path, install: impl FnOnce() -> io::Result<()>) -> io::Result<()> {
    let aside = aside_path(destination);
    std::fs::rename(destination, &aside)?;

    match install() {
        Ok(()) => {
            if let Err(e) = remove_path(&aside) {
                warn!(target: "executor", path = %aside.display(), error = %e, "could not remove replaced destination");
            }
            Ok(())
        }
        Err(e) => {
            if exists(destination) {
                if let Err(partial) = remove_path(destination) {
                    warn!(target: "executor", path = %destination.display(), error = %partial, "could not remove partial move");
                }
            }
            if let Err(restore) = std::fs::rename(&aside, destination) {
                warn!(
                    target: "executor",
                    path = %destination.display(),
                    kept_at = %aside.display(),
                    error = %restore,
                    "could not restore replaced destination"
                );
            }
            Err(e)
        }
    }
}

/// Unused sibling of `destination` to park it at while it is replaced.
fn aside_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut candidate = destination.with_file_name(format!("{}.relcull-old", name));
    let mut n = 1u32;
    while exists(&candidate) {
        candidate = destination.with_file_name(format!("{}.relcull-old.{}", name, n));
        n += 1;
    }
    candidate
}

fn move_into(source: &Path, destination: &Path) -> io::Result<()> {
    match std::fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            copy_tree(source, destination)?;
            remove_path(source)
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn is_cross_device(error: &io::Error) -> bool {
    // EXDEV
    error.raw_os_error() == Some(18)
}

#[cfg(windows)]
fn is_cross_device(error: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    error.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_error: &io::Error) -> bool {
    false
}

fn copy_tree(source: &Path, destination: &Path) -> io::Result<()> {
    if !source.is_dir() {
        std::fs::copy(source, destination)?;
        return Ok(());
    }
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
