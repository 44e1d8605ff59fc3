// SPDX-License-Identifier: GPL-3.0-or-later

//! Parsing of fingerprint tool output.
//!
//! Two record layouts are understood:
//!
//! - the `fpcalc` key/value layout, one block per input file:
//!
//!   ```text
//!   FILE=/music/Albums/X/01.flac
//!   DURATION=215
//!   FINGERPRINT=1,2,3
//!   ```
//!
//!   Blocks are separated by blank lines or by a new `FILE=` line.
//!
//! - a tab-delimited layout, one record per line:
//!   `duration<TAB>fingerprint<TAB>path`.

use std::path::PathBuf;

use crate::{FingerprintError, FingerprintPayload, Result};

/// One record parsed from the tool's stdout.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRecord {
    pub file: Option<PathBuf>,
    pub duration_seconds: f64,
    pub payload: FingerprintPayload,
}

#[derive(Default)]
struct PendingBlock {
    file: Option<PathBuf>,
    duration: Option<String>,
    fingerprint: Option<String>,
}

impl PendingBlock {
    fn is_empty(&self) -> bool {
        self.file.is_none() && self.duration.is_none() && self.fingerprint.is_none()
    }

    fn finish(self) -> Result<ToolRecord> {
        let context = self
            .file
            .as_ref()
            .map(|f| format!(" for {}", f.display()))
            .unwrap_or_default();
        let duration = self
            .duration
            .ok_or_else(|| FingerprintError::Parse(format!("missing DURATION{}", context)))?;
        let fingerprint = self
            .fingerprint
            .ok_or_else(|| FingerprintError::Parse(format!("missing FINGERPRINT{}", context)))?;

        Ok(ToolRecord {
            file: self.file,
            duration_seconds: parse_duration(&duration)?,
            payload: FingerprintPayload::parse(&fingerprint)?,
        })
    }
}

/// Parse every record in `stdout`.
///
/// Returns an error for lines that fit neither layout and for blocks lacking
/// a duration or fingerprint.
pub fn parse_tool_output(stdout: &str) -> Result<Vec<ToolRecord>> {
    let mut records = Vec::new();
    let mut block = PendingBlock::default();

    for line in stdout.lines() {
        let line = line.trim_end_matches('\r');

        if line.trim().is_empty() {
            if !block.is_empty() {
                records.push(std::mem::take(&mut block).finish()?);
            }
            continue;
        }

        if line.contains('\t') {
            if !block.is_empty() {
                records.push(std::mem::take(&mut block).finish()?);
            }
            records.push(parse_tabular_line(line)?);
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| FingerprintError::Parse(format!("unrecognised line '{}'", line)))?;

        match key.trim() {
            "FILE" => {
                if !block.is_empty() {
                    records.push(std::mem::take(&mut block).finish()?);
                }
                block.file = Some(PathBuf::from(value.trim()));
            }
            "DURATION" => block.duration = Some(value.trim().to_string()),
            "FINGERPRINT" => block.fingerprint = Some(value.trim().to_string()),
            _ => {}
        }
    }

    if !block.is_empty() {
        records.push(block.finish()?);
    }

    Ok(records)
}

fn parse_tabular_line(line: &str) -> Result<ToolRecord> {
    let mut fields = line.splitn(3, '\t');
    let (Some(duration), Some(fingerprint), Some(path)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(FingerprintError::Parse(format!(
            "expected duration, fingerprint and path in '{}'",
            line
        )));
    };

    let path = path.trim();
    Ok(ToolRecord {
        file: (!path.is_empty()).then(|| PathBuf::from(path)),
        duration_seconds: parse_duration(duration)?,
        payload: FingerprintPayload::parse(fingerprint)?,
    })
}

fn parse_duration(value: &str) -> Result<f64> {
    let duration: f64 = value
        .trim()
        .parse()
        .map_err(|_| FingerprintError::Parse(format!("invalid duration '{}'", value.trim())))?;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(FingerprintError::Parse(format!(
            "duration must be > 0, got {}",
            duration
        )));
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_fpcalc_block() {
        let out = "DURATION=215\nFINGERPRINT=1,2,3\n";
        let records = parse_tool_output(out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file, None);
        assert_eq!(records[0].duration_seconds, 215.0);
        assert_eq!(records[0].payload, FingerprintPayload::Raw(vec![1, 2, 3]));
    }

    #[test]
    fn parses_batched_blocks() {
        let out = "FILE=/m/a.flac\nDURATION=200\nFINGERPRINT=1,2\n\nFILE=/m/b.flac\nDURATION=180\nFINGERPRINT=3,4\n";
        let records = parse_tool_output(out).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file, Some(PathBuf::from("/m/a.flac")));
        assert_eq!(records[1].file, Some(PathBuf::from("/m/b.flac")));
        assert_eq!(records[1].duration_seconds, 180.0);
    }

    #[test]
    fn new_file_key_starts_new_block() {
        let out = "FILE=/m/a.flac\nDURATION=200\nFINGERPRINT=1\nFILE=/m/b.flac\nDURATION=100\nFINGERPRINT=2\n";
        let records = parse_tool_output(out).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn parses_tabular_lines() {
        let out = "200\t1,2,3\t/m/Albums/X/01.flac\n180.5\tAQADvEWZ\t/m/Albums/X/02 - tab\tname.flac\n";
        let records = parse_tool_output(out).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file, Some(PathBuf::from("/m/Albums/X/01.flac")));
        assert_eq!(records[1].duration_seconds, 180.5);
        assert_eq!(
            records[1].file,
            Some(PathBuf::from("/m/Albums/X/02 - tab\tname.flac"))
        );
    }

    #[test]
    fn missing_fingerprint_is_an_error() {
        let err = parse_tool_output("FILE=/m/a.flac\nDURATION=200\n").unwrap_err();
        assert!(err.to_string().contains("missing FINGERPRINT"));
    }

    #[test]
    fn garbage_line_is_an_error() {
        assert!(parse_tool_output("this is not fpcalc output").is_err());
    }

    #[test]
    fn zero_duration_is_an_error() {
        assert!(parse_tool_output("DURATION=0\nFINGERPRINT=1\n").is_err());
    }

    #[test]
    fn empty_output_has_no_records() {
        assert!(parse_tool_output("").unwrap().is_empty());
    }
}
