// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FingerprintError>;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("fingerprint tool '{tool}' is unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("fingerprint tool exited with {status}: {stderr}")]
    ToolFailed { status: String, stderr: String },

    #[error("fingerprint tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unparsable tool output: {0}")]
    Parse(String),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
