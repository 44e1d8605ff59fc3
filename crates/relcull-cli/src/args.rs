// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use relcull_application::{PlanError, ReportFormat};
use relcull_config::{AppConfig, MatchMode};
use relcull_domain::PlanMode;

#[derive(Parser, Debug)]
#[command(name = "relcull")]
#[command(about = "Find and remove redundant music releases by audio fingerprint")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Detect duplicate and contained releases, then report, move or delete them
    Dedupe(DedupeArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Report,
    Move,
    Delete,
}

#[derive(Args, Debug)]
pub struct DedupeArgs {
    /// Root folders to scan
    #[arg(long, num_args = 1.., default_values = ["Albums", "Singles"])]
    pub roots: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = ModeArg::Report)]
    pub mode: ModeArg,

    /// Target folder for --mode move
    #[arg(long)]
    pub move_to: Option<PathBuf>,

    /// Validate and log every action without touching the filesystem
    #[arg(long)]
    pub dry_run: bool,

    /// Write the plan to this file
    #[arg(long)]
    pub plan_out: Option<PathBuf>,

    /// Apply a previously written plan instead of fingerprinting
    #[arg(long)]
    pub plan_in: Option<PathBuf>,

    #[arg(long, default_value = "text")]
    pub report_format: ReportFormat,

    /// Write the report here instead of stdout
    #[arg(long)]
    pub report_out: Option<PathBuf>,

    /// Refuse to apply a plan built for a different library state
    #[arg(long)]
    pub strict: bool,

    /// Replace existing move destinations
    #[arg(long)]
    pub force: bool,

    /// Parallel fingerprint jobs
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Tolerate small fingerprint differences (default)
    #[arg(long, conflicts_with = "strict_match")]
    pub fuzzy: bool,

    /// Require identical fingerprints
    #[arg(long)]
    pub strict_match: bool,

    /// Audio extensions to scan
    #[arg(long, num_args = 1..)]
    pub ext: Option<Vec<String>>,

    #[arg(long, env = "RELCULL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip the fingerprint cache
    #[arg(long)]
    pub no_cache: bool,

    /// Only log warnings and do not print the report to stdout
    #[arg(long)]
    pub quiet: bool,
}

/// What a validated invocation will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Fingerprint the library, resolve it and optionally carry out a plan.
    Build {
        mode: Option<PlanMode>,
        plan_out: Option<PathBuf>,
    },
    /// Carry out a stored plan.
    Apply { plan_in: PathBuf, mode: PlanMode },
}

impl DedupeArgs {
    /// Check flag combinations before any work starts.
    pub fn request(&self) -> Result<Request, PlanError> {
        let mode = match (self.mode, &self.move_to) {
            (ModeArg::Report, Some(_)) => {
                return Err(invalid("--move-to requires --mode move"));
            }
            (ModeArg::Report, None) => None,
            (ModeArg::Move, Some(target_dir)) => Some(PlanMode::Move {
                target_dir: target_dir.clone(),
            }),
            (ModeArg::Move, None) => return Err(invalid("--mode move requires --move-to <dir>")),
            (ModeArg::Delete, Some(_)) => {
                return Err(invalid("--move-to cannot be combined with --mode delete"));
            }
            (ModeArg::Delete, None) => Some(PlanMode::Delete),
        };

        match (&self.plan_in, mode) {
            (Some(_), None) => Err(invalid("--plan-in requires --mode move or --mode delete")),
            (Some(_), Some(_)) if self.plan_out.is_some() => {
                Err(invalid("--plan-out cannot be combined with --plan-in"))
            }
            (Some(plan_in), Some(mode)) => Ok(Request::Apply {
                plan_in: plan_in.clone(),
                mode,
            }),
            (None, None) if self.plan_out.is_some() => {
                Err(invalid("--plan-out requires --mode move or --mode delete"))
            }
            (None, mode) => Ok(Request::Build {
                mode,
                plan_out: self.plan_out.clone(),
            }),
        }
    }

    /// Fold command-line overrides into the loaded configuration.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(jobs) = self.jobs {
            config.fingerprint.jobs = jobs;
        }
        if self.fuzzy {
            config.matching.mode = MatchMode::Fuzzy;
        }
        if self.strict_match {
            config.matching.mode = MatchMode::Strict;
        }
        if let Some(ext) = &self.ext {
            config.fingerprint.extensions = ext.clone();
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
    }
}

fn invalid(message: &str) -> PlanError {
    PlanError::InvalidFlags(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedupe(argv: &[&str]) -> DedupeArgs {
        let mut full = vec!["relcull", "dedupe"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Dedupe(args) => args,
        }
    }

    #[test]
    fn defaults_build_a_report() {
        let args = dedupe(&[]);
        assert_eq!(args.roots, vec![PathBuf::from("Albums"), PathBuf::from("Singles")]);
        assert_eq!(args.report_format, ReportFormat::Text);
        assert_eq!(
            args.request().unwrap(),
            Request::Build {
                mode: None,
                plan_out: None
            }
        );
    }

    #[test]
    fn move_mode_carries_target() {
        let args = dedupe(&["--mode", "move", "--move-to", "/dupes", "--plan-out", "plan.json"]);
        assert_eq!(
            args.request().unwrap(),
            Request::Build {
                mode: Some(PlanMode::Move {
                    target_dir: PathBuf::from("/dupes")
                }),
                plan_out: Some(PathBuf::from("plan.json")),
            }
        );
    }

    #[test]
    fn plan_in_applies_stored_plan() {
        let args = dedupe(&["--mode", "delete", "--plan-in", "plan.json", "--strict"]);
        assert_eq!(
            args.request().unwrap(),
            Request::Apply {
                plan_in: PathBuf::from("plan.json"),
                mode: PlanMode::Delete,
            }
        );
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        let cases: &[&[&str]] = &[
            &["--plan-in", "plan.json"],
            &["--mode", "move"],
            &["--mode", "delete", "--move-to", "/dupes"],
            &["--move-to", "/dupes"],
            &["--plan-out", "plan.json"],
            &["--mode", "delete", "--plan-in", "a.json", "--plan-out", "b.json"],
        ];
        for argv in cases {
            let err = dedupe(argv).request().unwrap_err();
            assert!(matches!(err, PlanError::InvalidFlags(_)), "{:?} accepted", argv);
        }
    }

    #[test]
    fn fuzzy_and_strict_match_conflict() {
        let result = Cli::try_parse_from(["relcull", "dedupe", "--fuzzy", "--strict-match"]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_report_format_is_a_parse_error() {
        let result = Cli::try_parse_from(["relcull", "dedupe", "--report-format", "yaml"]);
        assert!(result.is_err());
        assert_eq!(dedupe(&["--report-format", "jsonl"]).report_format, ReportFormat::JsonLines);
    }

    #[test]
    fn overrides_reach_configuration() {
        let args = dedupe(&["--jobs", "3", "--strict-match", "--ext", "flac", "--no-cache"]);
        let mut config = AppConfig::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.fingerprint.jobs, 3);
        assert_eq!(config.matching.mode, MatchMode::Strict);
        assert_eq!(config.fingerprint.extensions, vec!["flac".to_string()]);
        assert!(!config.cache.enabled);
    }
}
