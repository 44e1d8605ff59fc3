// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_AUDIO_EXTENSIONS: &[&str] = &[
    "flac", "mp3", "m4a", "aac", "ogg", "opus", "wav", "wma", "aiff", "aif", "alac",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Executable of the external fingerprinting tool.
    pub tool: String,
    /// Arguments placed before the audio file path.
    pub tool_args: Vec<String>,
    /// Size of the extraction worker pool.
    pub jobs: usize,
    /// Per-file subprocess timeout.
    pub timeout_secs: u64,
    pub extensions: Vec<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            tool: "fpcalc".to_string(),
            tool_args: vec!["-raw".to_string()],
            jobs: default_jobs(),
            timeout_secs: 120,
            extensions: DEFAULT_AUDIO_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Fingerprint payloads must be identical.
    Strict,
    /// Payloads may differ by a bounded bit error rate.
    Fuzzy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub mode: MatchMode,
    pub max_bit_error_rate: f64,
    pub min_overlap_ratio: f64,
    pub duration_tolerance_secs: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            mode: MatchMode::Fuzzy,
            max_bit_error_rate: 0.15,
            min_overlap_ratio: 0.8,
            duration_tolerance_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Folder names (case-insensitive) whose immediate children are releases.
    pub group_folders: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            group_folders: vec!["Albums".to_string(), "Singles".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".relcull/fingerprints.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub fingerprint: FingerprintConfig,
    pub matching: MatchingConfig,
    pub scan: ScanConfig,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.fingerprint.tool.trim().is_empty() {
            bail!("fingerprint.tool must not be empty");
        }
        if self.fingerprint.jobs == 0 {
            bail!("fingerprint.jobs must be at least 1");
        }
        if self.fingerprint.timeout_secs == 0 {
            bail!("fingerprint.timeout_secs must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.matching.max_bit_error_rate) {
            bail!(
                "matching.max_bit_error_rate must be within 0.0..=1.0, got {}",
                self.matching.max_bit_error_rate
            );
        }
        if !(0.0..=1.0).contains(&self.matching.min_overlap_ratio) {
            bail!(
                "matching.min_overlap_ratio must be within 0.0..=1.0, got {}",
                self.matching.min_overlap_ratio
            );
        }
        if self.matching.duration_tolerance_secs < 0.0 {
            bail!("matching.duration_tolerance_secs must not be negative");
        }
        Ok(())
    }
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: RELCULL_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("RELCULL_").split("__"));

    let config: AppConfig = figment.extract()?;
    config.validate()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}
