// SPDX-License-Identifier: GPL-3.0-or-later
mod args;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use relcull_application::plan::ensure_mode;
use relcull_application::{
    check_staleness, input_fingerprint, plan_file, render, scan_roots, DedupePipeline, DedupeReport,
    ExecuteOptions, FingerprintIndex, MatchSettings, PipelineError, PlanExecutor, ScanOptions,
};
use relcull_config::{load as load_config, AppConfig, TelemetryConfig};
use relcull_domain::{ApplySummary, Plan, PlanMode};
use relcull_fingerprint::{ExtractorConfig, FingerprintExtractor};
use relcull_infrastructure::{open_cache, FingerprintCache};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::args::{Cli, Command, DedupeArgs, Request};

const EXIT_FATAL: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Dedupe(args) = cli.command;

    let config = match prepare_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relcull: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    init_tracing(&config.telemetry, args.quiet);

    let result = run(&args, &config).await;
    match &result {
        Err(e) if is_cancelled(e) => warn!(target: "cli", "{:#}", e),
        Err(e) => error!(target: "cli", "{:#}", e),
        Ok(()) => {}
    }
    ExitCode::from(exit_code(&result))
}

/// Failed actions are reported, not fatal.
fn exit_code(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) if is_cancelled(e) => EXIT_CANCELLED,
        Err(_) => EXIT_FATAL,
    }
}

fn prepare_config(args: &DedupeArgs) -> Result<AppConfig> {
    let mut config = load_config(args.config.as_deref()).context("failed to load configuration")?;
    args.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn init_tracing(telemetry: &TelemetryConfig, quiet: bool) {
    let default_level = if quiet { "warn" } else { telemetry.log_level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    // Logs go to stderr so reports can be piped from stdout.
    if telemetry.json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
            .init();
    }
}

fn is_cancelled(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<PipelineError>(),
        Some(PipelineError::Cancelled { .. })
    )
}

async fn run(args: &DedupeArgs, config: &AppConfig) -> Result<()> {
    let request = args.request()?;
    let roots = args
        .roots
        .iter()
        .map(|root| absolute(root))
        .collect::<Result<Vec<_>>>()?;
    let scan_options = ScanOptions::from_config(config);

    let report = match request {
        Request::Build { mode, plan_out } => {
            let mode = mode.map(absolute_mode).transpose()?;
            let cancel = CancellationToken::new();
            spawn_interrupt_handler(cancel.clone());

            let scans = scan_roots(&roots, &scan_options)?;
            let pipeline = build_pipeline(config).await?;
            let outcome = pipeline.run(&scans, mode, cancel).await?;

            let summary = match outcome.plan.as_ref() {
                Some(plan) => {
                    if let Some(path) = &plan_out {
                        plan_file::save(plan, path)
                            .with_context(|| format!("failed to write plan {}", path.display()))?;
                    }
                    Some(apply(plan.clone(), args, false).await?)
                }
                None => None,
            };

            let report = DedupeReport::new(
                &outcome.index,
                &outcome.groups,
                &outcome.relations,
                outcome.plan.as_ref(),
                outcome.post_check.clone(),
            );
            info!(
                target: "cli",
                releases = outcome.index.len(),
                groups = outcome.groups.len(),
                compared = outcome.compared_pairs,
                pruned = outcome.pruned_pairs,
                cached = outcome.extraction.cached,
                extracted = outcome.extraction.extracted,
                failed = outcome.extraction.failed,
                "dedupe finished"
            );
            match summary {
                Some(summary) => report.with_apply(summary),
                None => report,
            }
        }
        Request::Apply { plan_in, mode } => {
            let mode = absolute_mode(mode)?;
            let plan = plan_file::load(&plan_in)
                .with_context(|| format!("failed to read plan {}", plan_in.display()))?;
            ensure_mode(&plan, &mode)?;

            let scans = scan_roots(&roots, &scan_options)?;
            let stale = check_staleness(&plan, &input_fingerprint(&scans), args.strict)?;
            let summary = apply(plan.clone(), args, stale).await?;

            DedupeReport::new(&FingerprintIndex::default(), &[], &[], Some(&plan), Vec::new())
                .with_apply(summary)
        }
    };

    write_report(&report, args)
}

async fn build_pipeline(config: &AppConfig) -> Result<DedupePipeline> {
    let extractor = FingerprintExtractor::new(ExtractorConfig {
        tool: config.fingerprint.tool.clone(),
        tool_args: config.fingerprint.tool_args.clone(),
        jobs: config.fingerprint.jobs,
        timeout: Duration::from_secs(config.fingerprint.timeout_secs),
    });
    let pipeline = DedupePipeline::new(extractor, MatchSettings::from(&config.matching));
    if !config.cache.enabled {
        info!(target: "cli", "fingerprint cache disabled");
        return Ok(pipeline);
    }

    let cache = open_cache(&config.cache)
        .await
        .with_context(|| format!("failed to open cache {}", config.cache.path.display()))?;
    let cache: Arc<dyn FingerprintCache> = Arc::new(cache);
    Ok(pipeline.with_cache(cache))
}

async fn apply(plan: Plan, args: &DedupeArgs, stale: bool) -> Result<ApplySummary> {
    let executor = PlanExecutor::new(ExecuteOptions {
        dry_run: args.dry_run,
        force: args.force,
    });
    let summary = tokio::task::spawn_blocking(move || executor.apply(&plan, stale))
        .await
        .context("plan executor panicked")?;
    if summary.failed > 0 {
        warn!(target: "cli", failed = summary.failed, "some actions failed");
    }
    Ok(summary)
}

fn write_report(report: &DedupeReport, args: &DedupeArgs) -> Result<()> {
    let rendered = render(report, args.report_format).context("failed to render report")?;
    match &args.report_out {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("failed to write report {}", path.display()))?;
            info!(target: "cli", path = %path.display(), "report written");
        }
        None if !args.quiet => print!("{}", rendered),
        None => {}
    }
    Ok(())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "cli", "interrupt received, stopping fingerprint extraction");
            cancel.cancel();
        }
    });
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("cannot resolve current directory")?
            .join(path))
    }
}

/// Plans store absolute targets so they can be applied from any directory.
fn absolute_mode(mode: PlanMode) -> Result<PlanMode> {
    Ok(match mode {
        PlanMode::Move { target_dir } => PlanMode::Move {
            target_dir: absolute(&target_dir)?,
        },
        PlanMode::Delete => PlanMode::Delete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relcull_domain::PlanAction;

    #[test]
    fn relative_move_target_becomes_absolute() {
        let mode = absolute_mode(PlanMode::Move {
            target_dir: PathBuf::from("dupes"),
        })
        .unwrap();
        let PlanMode::Move { target_dir } = mode else {
            panic!("mode changed kind");
        };
        assert!(target_dir.is_absolute());
        assert!(target_dir.ends_with("dupes"));
    }

    #[test]
    fn only_pipeline_cancellation_maps_to_interrupt_exit() {
        let cancelled = anyhow::Error::new(PipelineError::Cancelled {
            completed: 1,
            total: 4,
        });
        assert!(is_cancelled(&cancelled));
        assert!(!is_cancelled(&anyhow::anyhow!("tool missing")));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code(&Err(anyhow::anyhow!("tool missing"))), EXIT_FATAL);
        let cancelled = Err(anyhow::Error::new(PipelineError::Cancelled {
            completed: 0,
            total: 2,
        }));
        assert_eq!(exit_code(&cancelled), EXIT_CANCELLED);
    }

    /// A library with one duplicated album and a delete plan for it.
    struct StoredPlan {
        dir: tempfile::TempDir,
        root: PathBuf,
        plan: Plan,
    }

    impl StoredPlan {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("library");
            for name in ["A-FLAC", "A-MP3"] {
                let release = root.join("Albums").join(name);
                std::fs::create_dir_all(&release).unwrap();
                std::fs::write(release.join("01.flac"), b"audio").unwrap();
            }
            let scans = scan_roots(&[root.clone()], &ScanOptions::default()).unwrap();
            let plan = Plan {
                schema_version: relcull_domain::PLAN_SCHEMA_VERSION,
                mode: PlanMode::Delete,
                input_fingerprint: input_fingerprint(&scans),
                actions: vec![PlanAction::delete(root.join("Albums/A-MP3"))],
                withheld: Vec::new(),
                kept: vec![root.join("Albums/A-FLAC")],
            };
            Self { dir, root, plan }
        }

        fn save(&self) -> PathBuf {
            let path = self.dir.path().join("plan.json");
            plan_file::save(&self.plan, &path).unwrap();
            path
        }

        fn report_path(&self) -> PathBuf {
            self.dir.path().join("report.json")
        }

        async fn apply(&self, plan_path: &Path, extra: &[&str]) -> u8 {
            let root = self.root.display().to_string();
            let plan = plan_path.display().to_string();
            let report = self.report_path().display().to_string();
            let mut argv = vec![
                "relcull",
                "dedupe",
                "--roots",
                root.as_str(),
                "--plan-in",
                plan.as_str(),
                "--report-out",
                report.as_str(),
                "--report-format",
                "json",
                "--quiet",
            ];
            argv.extend_from_slice(extra);
            let Command::Dedupe(args) = Cli::try_parse_from(argv).unwrap().command;
            exit_code(&run(&args, &AppConfig::default()).await)
        }

        fn report(&self) -> serde_json::Value {
            serde_json::from_str(&std::fs::read_to_string(self.report_path()).unwrap()).unwrap()
        }
    }

    #[tokio::test]
    async fn stored_plan_is_applied() {
        let stored = StoredPlan::new();
        let plan = stored.save();

        assert_eq!(stored.apply(&plan, &["--mode", "delete"]).await, 0);

        assert!(!stored.root.join("Albums/A-MP3").exists());
        assert!(stored.root.join("Albums/A-FLAC/01.flac").exists());
        let report = stored.report();
        assert_eq!(report["apply"]["applied"], 1);
        assert_eq!(report["counts"]["actions"], 1);
        assert_eq!(report["actions"][0]["action"], "delete");
    }

    #[tokio::test]
    async fn stale_plan_is_fatal_only_when_strict() {
        let stored = StoredPlan::new();
        let plan = stored.save();
        let extra = stored.root.join("Albums/B");
        std::fs::create_dir_all(&extra).unwrap();
        std::fs::write(extra.join("01.flac"), b"audio").unwrap();

        assert_eq!(stored.apply(&plan, &["--mode", "delete", "--strict"]).await, EXIT_FATAL);
        assert!(stored.root.join("Albums/A-MP3").exists());

        assert_eq!(stored.apply(&plan, &["--mode", "delete"]).await, 0);
        assert!(!stored.root.join("Albums/A-MP3").exists());
        assert_eq!(stored.report()["apply"]["stale"], true);
    }

    #[tokio::test]
    async fn mode_mismatch_is_fatal() {
        let stored = StoredPlan::new();
        let plan = stored.save();
        let target = stored.dir.path().join("dupes").display().to_string();

        let code = stored
            .apply(&plan, &["--mode", "move", "--move-to", target.as_str()])
            .await;

        assert_eq!(code, EXIT_FATAL);
        assert!(stored.root.join("Albums/A-MP3").exists());
    }

    #[tokio::test]
    async fn unsupported_schema_is_fatal() {
        let stored = StoredPlan::new();
        let plan = stored.save();
        let text = std::fs::read_to_string(&plan)
            .unwrap()
            .replace("\"schema_version\": 1", "\"schema_version\": 9");
        std::fs::write(&plan, text).unwrap();

        assert_eq!(stored.apply(&plan, &["--mode", "delete"]).await, EXIT_FATAL);
        assert!(stored.root.join("Albums/A-MP3").exists());
    }

    #[tokio::test]
    async fn failed_actions_still_exit_cleanly() {
        let mut stored = StoredPlan::new();
        // Deleting the group folder would take the kept release with it.
        stored.plan.actions.push(PlanAction::delete(stored.root.join("Albums")));
        let plan = stored.save();

        assert_eq!(stored.apply(&plan, &["--mode", "delete"]).await, 0);

        let report = stored.report();
        assert_eq!(report["apply"]["applied"], 1);
        assert_eq!(report["apply"]["failed"], 1);
        assert!(stored.root.join("Albums/A-FLAC/01.flac").exists());
    }
}
