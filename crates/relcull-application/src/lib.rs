// SPDX-License-Identifier: GPL-3.0-or-later
pub mod executor;
pub mod index;
pub mod matcher;
pub mod pipeline;
pub mod plan;
pub mod plan_file;
pub mod report;
pub mod resolver;
pub mod scanner;

pub use executor::{ExecuteOptions, PlanExecutor};
pub use index::FingerprintIndex;
pub use matcher::{compare_releases, find_relations, MatchOutcome, MatchSettings};
pub use pipeline::{DedupePipeline, ExtractionStats, PipelineError, PipelineOutcome};
pub use plan::{check_staleness, input_fingerprint, PlanBuilder, PlanError};
pub use report::{render, DedupeReport, ReportFormat};
pub use resolver::{post_check, resolve};
pub use scanner::{scan_roots, ScanError, ScanOptions};
