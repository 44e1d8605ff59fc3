// SPDX-License-Identifier: GPL-3.0-or-later

//! Plan persistence as pretty-printed JSON.

use relcull_domain::{Plan, PLAN_SCHEMA_VERSION};
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::plan::{PlanError, PlanResult};

/// Serialize `plan` exactly as [`save`] writes it.
pub fn to_json(plan: &Plan) -> PlanResult<String> {
    let mut json = serde_json::to_string_pretty(plan)?;
    json.push('\n');
    Ok(json)
}

/// Write `plan` to `path`, replacing any existing file atomically.
pub fn save(plan: &Plan, path: &Path) -> PlanResult<()> {
    let json = to_json(plan)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PlanError::Io(e.error))?;

    info!(target: "plan", path = %path.display(), actions = plan.actions.len(), "plan written");
    Ok(())
}

/// Read and validate a plan written by [`save`].
pub fn load(path: &Path) -> PlanResult<Plan> {
    let text = std::fs::read_to_string(path)?;
    let plan = from_json(&text)?;
    info!(target: "plan", path = %path.display(), actions = plan.actions.len(), "plan loaded");
    Ok(plan)
}

pub fn from_json(text: &str) -> PlanResult<Plan> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let version = value
        .get("schema_version")
        .ok_or_else(|| PlanError::Invalid("missing schema_version".to_string()))?
        .as_u64()
        .ok_or_else(|| PlanError::Invalid("schema_version must be an integer".to_string()))?;
    if version != u64::from(PLAN_SCHEMA_VERSION) {
        return Err(PlanError::UnsupportedVersion {
            found: version,
            supported: PLAN_SCHEMA_VERSION,
        });
    }
    Ok(serde_json::from_value(value)?)
}
