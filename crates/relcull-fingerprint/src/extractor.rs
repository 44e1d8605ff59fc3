// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded-parallel fingerprint extraction.
//!
//! Each audio file is handed to one invocation of the external tool. A
//! semaphore caps the number of concurrent subprocesses and finished
//! fingerprints are pushed into a channel as soon as they are available, so
//! callers can start consuming before the whole batch is done.
//!
//! # Example
//!
//! ```no_run
//! use relcull_fingerprint::{ExtractorConfig, FingerprintExtractor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> relcull_fingerprint::Result<()> {
//! let extractor = FingerprintExtractor::new(ExtractorConfig::default());
//! extractor.ensure_tool_available().await?;
//!
//! let mut stream = extractor.extract(vec!["song.flac".into()], CancellationToken::new());
//! while let Some(track) = stream.next().await {
//!     println!("{} -> {:?}", track.file_path.display(), track.extraction_error);
//! }
//! # Ok(())
//! # }
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::parser::parse_tool_output;
use crate::{FingerprintError, Result, TrackFingerprint};

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub tool: String,
    pub tool_args: Vec<String>,
    pub jobs: usize,
    pub timeout: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            tool: "fpcalc".to_string(),
            tool_args: vec!["-raw".to_string()],
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Runs the external fingerprinting tool over audio files.
#[derive(Debug, Clone)]
pub struct FingerprintExtractor {
    config: Arc<ExtractorConfig>,
}

impl FingerprintExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Identifies the tool invocation; fingerprints from different
    /// signatures are not interchangeable.
    pub fn signature(&self) -> String {
        let mut signature = self.config.tool.clone();
        for arg in &self.config.tool_args {
            signature.push(' ');
            signature.push_str(arg);
        }
        signature
    }

    /// Probe the tool binary once before any work is dispatched.
    ///
    /// Returns the first line the tool printed for `-version`. The configured
    /// arguments are passed along so wrapper scripts see them too.
    pub async fn ensure_tool_available(&self) -> Result<String> {
        let output = Command::new(&self.config.tool)
            .args(&self.config.tool_args)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FingerprintError::ToolUnavailable {
                tool: self.config.tool.clone(),
                reason: match e.kind() {
                    ErrorKind::NotFound => "not found in PATH".to_string(),
                    ErrorKind::PermissionDenied => "permission denied".to_string(),
                    _ => e.to_string(),
                },
            })?;

        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        info!(target: "extractor", tool = %self.config.tool, %version, "fingerprint tool available");
        Ok(version)
    }

    /// Start extracting `files` and return a stream of results.
    ///
    /// Completion order is not preserved. Once `cancel` fires no further
    /// subprocesses are started and running ones are killed; results that
    /// already completed are still delivered.
    pub fn extract(&self, files: Vec<PathBuf>, cancel: CancellationToken) -> ExtractionStream {
        let total = files.len();
        let jobs = self.config.jobs.max(1);
        let (tx, rx) = mpsc::channel(jobs * 2);
        let semaphore = Arc::new(Semaphore::new(jobs));
        let extractor = self.clone();
        let dispatch_cancel = cancel.clone();

        info!(target: "extractor", total, jobs, tool = %self.config.tool, "starting fingerprint extraction");

        let dispatcher = tokio::spawn(async move {
            let mut dispatched = 0usize;
            for path in files {
                let permit = tokio::select! {
                    biased;
                    _ = dispatch_cancel.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                if dispatch_cancel.is_cancelled() {
                    break;
                }

                dispatched += 1;
                let tx = tx.clone();
                let extractor = extractor.clone();
                let worker_cancel = dispatch_cancel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let track = tokio::select! {
                        biased;
                        _ = worker_cancel.cancelled() => {
                            debug!(target: "extractor", file = %path.display(), "extraction aborted");
                            return;
                        }
                        track = extractor.extract_one(&path) => track,
                    };
                    // The receiver may already be gone; nothing left to deliver to.
                    let _ = tx.send(track).await;
                });
            }
            dispatched
        });

        ExtractionStream {
            rx,
            dispatcher: Some(dispatcher),
            cancel,
            total,
            received: 0,
            failed: 0,
        }
    }

    /// Fingerprint a single file. Failures are recorded on the result.
    #[instrument(skip(self), fields(file = %path.display()))]
    pub async fn extract_one(&self, path: &Path) -> TrackFingerprint {
        match self.run_tool(path).await {
            Ok(track) => track,
            Err(e) => {
                warn!(target: "extractor", file = %path.display(), error = %e, "fingerprint extraction failed");
                TrackFingerprint::failed(path, e.to_string())
            }
        }
    }

    async fn run_tool(&self, path: &Path) -> Result<TrackFingerprint> {
        let mut command = Command::new(&self.config.tool);
        command
            .args(&self.config.tool_args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, command.output())
            .await
            .map_err(|_| FingerprintError::Timeout(self.config.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FingerprintError::ToolFailed {
                status: output.status.to_string(),
                stderr: stderr.lines().next().unwrap_or_default().trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let record = parse_tool_output(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| FingerprintError::Parse("tool produced no output".to_string()))?;

        debug!(
            target: "extractor",
            duration = record.duration_seconds,
            payload = %record.payload,
            "fingerprint extracted"
        );
        Ok(TrackFingerprint::new(path, record.duration_seconds, record.payload))
    }
}

/// Results of a running extraction, in completion order.
pub struct ExtractionStream {
    rx: mpsc::Receiver<TrackFingerprint>,
    dispatcher: Option<JoinHandle<usize>>,
    cancel: CancellationToken,
    total: usize,
    received: usize,
    failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub total: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl ExtractionStream {
    pub async fn next(&mut self) -> Option<TrackFingerprint> {
        let track = self.rx.recv().await?;
        self.received += 1;
        if !track.is_ok() {
            self.failed += 1;
        }
        Some(track)
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drain remaining results and wait for the dispatcher.
    pub async fn finish(mut self) -> ExtractionSummary {
        while self.next().await.is_some() {}
        let dispatched = match self.dispatcher.take() {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        };
        let summary = ExtractionSummary {
            total: self.total,
            dispatched,
            completed: self.received,
            failed: self.failed,
            cancelled: self.cancel.is_cancelled() && self.received < self.total,
        };
        info!(
            target: "extractor",
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "fingerprint extraction finished"
        );
        summary
    }
}

impl Drop for ExtractionStream {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
    }
}
