// SPDX-License-Identifier: GPL-3.0-or-later

//! Human and machine readable dedupe reports.

use relcull_domain::{
    ActionOutcome, ActionState, ApplySummary, PairRelation, Plan, PlanAction, PlanActionKind,
    RedundancyGroup, RelationKind, WithheldRelease,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::index::FingerprintIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
    Csv,
    JsonLines,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "jsonl" | "ndjson" => Ok(Self::JsonLines),
            other => Err(format!("unknown report format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Canonical,
    Redundant,
    Uncovered,
}

impl MemberRole {
    fn as_str(self) -> &'static str {
        match self {
            MemberRole::Canonical => "canonical",
            MemberRole::Redundant => "redundant",
            MemberRole::Uncovered => "uncovered",
        }
    }
}

/// One release of a redundancy group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberRow {
    pub group: usize,
    pub role: MemberRole,
    pub release_path: PathBuf,
    pub canonical: PathBuf,
    pub track_count: usize,
    pub failed_tracks: usize,
    /// Relation of this release to the canonical one, when directly related.
    pub relation: Option<RelationKind>,
    pub similarity: Option<f64>,
    pub action: Option<PlanActionKind>,
    pub destination: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportCounts {
    pub releases: usize,
    pub skipped_releases: usize,
    pub groups: usize,
    pub redundant: usize,
    pub withheld: usize,
    pub actions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupeReport {
    pub counts: ReportCounts,
    pub members: Vec<MemberRow>,
    /// Planned actions, also present when the plan was loaded from a file.
    pub actions: Vec<PlanAction>,
    pub withheld: Vec<WithheldRelease>,
    /// Related pairs that survive the plan.
    pub post_check: Vec<PairRelation>,
    pub skipped_releases: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplySummary>,
}

impl DedupeReport {
    pub fn new(
        index: &FingerprintIndex,
        groups: &[RedundancyGroup],
        relations: &[PairRelation],
        plan: Option<&Plan>,
        post_check: Vec<PairRelation>,
    ) -> Self {
        let mut by_pair: HashMap<(&Path, &Path), &PairRelation> = HashMap::new();
        for relation in relations {
            by_pair.insert((relation.release_a.as_path(), relation.release_b.as_path()), relation);
        }
        let planned: HashMap<&Path, (PlanActionKind, Option<PathBuf>)> = plan
            .map(|p| {
                p.actions
                    .iter()
                    .map(|a| (a.release_path.as_path(), (a.action, a.destination.clone())))
                    .collect()
            })
            .unwrap_or_default();

        let mut members = Vec::new();
        for (n, group) in groups.iter().enumerate() {
            for path in &group.members {
                let role = if *path == group.canonical {
                    MemberRole::Canonical
                } else if group.uncovered.contains(path) {
                    MemberRole::Uncovered
                } else {
                    MemberRole::Redundant
                };
                // Relation oriented with this release as `a`.
                let relation = by_pair
                    .get(&(path.as_path(), group.canonical.as_path()))
                    .map(|r| (r.kind, r.similarity_score))
                    .or_else(|| {
                        by_pair
                            .get(&(group.canonical.as_path(), path.as_path()))
                            .map(|r| (r.kind.reversed(), r.similarity_score))
                    });
                let release = index.get(path);
                let (action, destination) = planned
                    .get(path.as_path())
                    .cloned()
                    .map(|(a, d)| (Some(a), d))
                    .unwrap_or((None, None));

                members.push(MemberRow {
                    group: n + 1,
                    role,
                    release_path: path.clone(),
                    canonical: group.canonical.clone(),
                    track_count: release.map(|r| r.track_count).unwrap_or(0),
                    failed_tracks: release.map(|r| r.failed_tracks).unwrap_or(0),
                    relation: relation.map(|(kind, _)| kind),
                    similarity: relation.map(|(_, score)| score),
                    action,
                    destination,
                });
            }
        }

        let withheld = plan.map(|p| p.withheld.clone()).unwrap_or_default();
        let counts = ReportCounts {
            releases: index.len(),
            skipped_releases: index.skipped().len(),
            groups: groups.len(),
            redundant: groups.iter().map(|g| g.redundant.len()).sum(),
            withheld: match plan {
                Some(plan) => plan.withheld.len(),
                None => groups.iter().map(|g| g.uncovered.len()).sum(),
            },
            actions: plan.map(|p| p.actions.len()).unwrap_or(0),
        };

        Self {
            counts,
            members,
            actions: plan.map(|p| p.actions.clone()).unwrap_or_default(),
            withheld,
            post_check,
            skipped_releases: index.skipped().to_vec(),
            apply: None,
        }
    }

    pub fn with_apply(mut self, summary: ApplySummary) -> Self {
        self.apply = Some(summary);
        self
    }
}

pub fn render(report: &DedupeReport, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Text => Ok(render_text(report)),
        ReportFormat::Json => render_json(report),
        ReportFormat::Csv => Ok(render_csv(report)),
        ReportFormat::JsonLines => render_json_lines(report),
    }
}

fn state_label(state: &ActionState) -> (&'static str, Option<&str>) {
    match state {
        ActionState::Pending => ("pending", None),
        ActionState::Applied => ("applied", None),
        ActionState::Failed { reason } => ("failed", Some(reason.as_str())),
        ActionState::Skipped { reason } => ("skipped", Some(reason.as_str())),
    }
}

fn relation_label(kind: Option<RelationKind>) -> &'static str {
    match kind {
        Some(RelationKind::Duplicate) => "duplicate",
        Some(RelationKind::ASubsetOfB) => "contained",
        Some(RelationKind::BSubsetOfA) => "contains",
        Some(RelationKind::Unrelated) => "unrelated",
        None => "indirect",
    }
}

fn render_text(report: &DedupeReport) -> String {
    let mut out = String::new();
    let counts = &report.counts;
    // Writing into a String cannot fail.
    let _ = writeln!(out, "== Redundant releases ==");
    let _ = writeln!(
        out,
        "Releases: {}  Groups: {}  Redundant: {}  Withheld: {}  Planned actions: {}",
        counts.releases, counts.groups, counts.redundant, counts.withheld, counts.actions
    );

    let mut current_group = 0;
    for row in &report.members {
        if row.group != current_group {
            current_group = row.group;
            let _ = writeln!(out);
            let _ = writeln!(out, "Group {}: keep {}", row.group, row.canonical.display());
        }
        if row.role == MemberRole::Canonical {
            continue;
        }
        let similarity = row
            .similarity
            .map(|s| format!(", similarity {:.3}", s))
            .unwrap_or_default();
        let planned = match (&row.action, &row.destination) {
            (Some(_), Some(destination)) => format!(" -> move to {}", destination.display()),
            (Some(action), None) => format!(" -> {}", action),
            (None, _) if row.role == MemberRole::Uncovered => " -> withheld".to_string(),
            (None, _) => String::new(),
        };
        let _ = writeln!(
            out,
            "  {:<10} {} ({} tracks{}){}",
            relation_label(row.relation),
            row.release_path.display(),
            row.track_count,
            similarity,
            planned
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "== Safety check ==");
    // Without a plan only the uncovered members are known.
    let held: Vec<(&Path, &str, &Path)> = if report.withheld.is_empty() {
        report
            .members
            .iter()
            .filter(|row| row.role == MemberRole::Uncovered)
            .map(|row| {
                (
                    row.release_path.as_path(),
                    "holds tracks not present in the canonical release",
                    row.canonical.as_path(),
                )
            })
            .collect()
    } else {
        report
            .withheld
            .iter()
            .map(|w| (w.release_path.as_path(), w.reason.as_str(), w.canonical.as_path()))
            .collect()
    };
    if held.is_empty() {
        let _ = writeln!(out, "OK: every redundant release is covered by its canonical release.");
    } else {
        for (release, reason, canonical) in held {
            let _ = writeln!(
                out,
                "  {} ({}; canonical {})",
                release.display(),
                reason,
                canonical.display()
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "== Post-check ==");
    if report.post_check.is_empty() {
        let _ = writeln!(out, "OK: no containment remains among kept releases.");
    } else {
        for relation in &report.post_check {
            let _ = writeln!(
                out,
                "  {}\t{}\t{}",
                relation.release_a.display(),
                relation.kind,
                relation.release_b.display()
            );
        }
    }

    if !report.skipped_releases.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "== Skipped (no fingerprints) ==");
        for path in &report.skipped_releases {
            let _ = writeln!(out, "  {}", path.display());
        }
    }

    if let Some(apply) = &report.apply {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "== {} ==",
            if apply.dry_run { "Dry run" } else { "Applied" }
        );
        if apply.stale {
            let _ = writeln!(out, "WARNING: the library changed since the plan was built.");
        }
        let _ = writeln!(
            out,
            "Applied: {}  Failed: {}  Skipped: {}",
            apply.applied, apply.failed, apply.skipped
        );
        for outcome in &apply.outcomes {
            let state = match &outcome.state {
                ActionState::Applied => "applied".to_string(),
                ActionState::Failed { reason } => format!("FAILED ({})", reason),
                ActionState::Skipped { reason } => format!("skipped ({})", reason),
                ActionState::Pending => "pending".to_string(),
            };
            let _ = writeln!(
                out,
                "  {} {} {}",
                outcome.action.action,
                outcome.action.release_path.display(),
                state
            );
        }
    }

    out
}

fn render_json(report: &DedupeReport) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string_pretty(report)?;
    json.push('\n');
    Ok(json)
}

/// One line of a JSON Lines report.
#[derive(Debug, Serialize)]
#[serde(tag = "record_type", rename_all = "lowercase")]
enum Record<'a> {
    Member(&'a MemberRow),
    Action(&'a PlanAction),
    Outcome(OutcomeRecord<'a>),
}

#[derive(Debug, Serialize)]
struct OutcomeRecord<'a> {
    release_path: &'a Path,
    action: PlanActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<&'a Path>,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    dry_run: bool,
}

impl<'a> OutcomeRecord<'a> {
    fn new(outcome: &'a ActionOutcome, dry_run: bool) -> Self {
        let (state, reason) = state_label(&outcome.state);
        Self {
            release_path: &outcome.action.release_path,
            action: outcome.action.action,
            destination: outcome.action.destination.as_deref(),
            state,
            reason,
            dry_run,
        }
    }
}

fn records(report: &DedupeReport) -> Vec<Record<'_>> {
    let members = report.members.iter().map(Record::Member);
    let actions = report.actions.iter().map(Record::Action);
    let outcomes = report.apply.iter().flat_map(|apply| {
        apply
            .outcomes
            .iter()
            .map(move |outcome| Record::Outcome(OutcomeRecord::new(outcome, apply.dry_run)))
    });
    members.chain(actions).chain(outcomes).collect()
}

fn render_json_lines(report: &DedupeReport) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for record in records(report) {
        out.push_str(&serde_json::to_string(&record)?);
        out.push('\n');
    }
    Ok(out)
}

const CSV_HEADER: &str = "record_type,group,role,release_path,canonical,track_count,failed_tracks,\
relation,similarity,action,destination,state,reason";

fn render_csv(report: &DedupeReport) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for record in records(report) {
        let fields = match record {
            Record::Member(row) => member_fields(row),
            Record::Action(action) => action_fields(
                "action",
                &action.release_path,
                action.action,
                action.destination.as_deref(),
            ),
            Record::Outcome(outcome) => {
                let mut fields =
                    action_fields("outcome", outcome.release_path, outcome.action, outcome.destination);
                fields[11] = outcome.state.to_string();
                fields[12] = outcome.reason.unwrap_or_default().to_string();
                fields
            }
        };
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn action_fields(
    record_type: &str,
    release_path: &Path,
    action: PlanActionKind,
    destination: Option<&Path>,
) -> [String; 13] {
    let mut fields: [String; 13] = Default::default();
    fields[0] = record_type.to_string();
    fields[3] = release_path.display().to_string();
    fields[9] = action.to_string();
    fields[10] = destination.map(|d| d.display().to_string()).unwrap_or_default();
    fields
}

fn member_fields(row: &MemberRow) -> [String; 13] {
    [
        "member".to_string(),
        row.group.to_string(),
        row.role.as_str().to_string(),
        row.release_path.display().to_string(),
        row.canonical.display().to_string(),
        row.track_count.to_string(),
        row.failed_tracks.to_string(),
        row.relation.map(|k| k.to_string()).unwrap_or_default(),
        row.similarity.map(|s| format!("{:.4}", s)).unwrap_or_default(),
        row.action.map(|a| a.to_string()).unwrap_or_default(),
        row.destination.as_ref().map(|d| d.display().to_string()).unwrap_or_default(),
        String::new(),
        String::new(),
    ]
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relcull_domain::{FingerprintPayload, PlanAction, PlanMode, ReleaseScan, TrackFingerprint};
    use std::collections::BTreeSet;

    fn fixture() -> DedupeReport {
        let scans = vec![
            ReleaseScan::new("/m/A, Deluxe", "Albums", "/m", vec![PathBuf::from("/m/A, Deluxe/01.flac")]),
            ReleaseScan::new("/m/B", "Albums", "/m", vec![PathBuf::from("/m/B/01.flac")]),
        ];
        let fingerprints = vec![
            TrackFingerprint::new("/m/A, Deluxe/01.flac", 200.0, FingerprintPayload::Raw(vec![1])),
            TrackFingerprint::new("/m/B/01.flac", 200.0, FingerprintPayload::Raw(vec![1])),
        ];
        let index = FingerprintIndex::build(&scans, fingerprints);
        let relation = PairRelation {
            release_a: PathBuf::from("/m/A, Deluxe"),
            release_b: PathBuf::from("/m/B"),
            kind: RelationKind::Duplicate,
            matched_track_count: 1,
            similarity_score: 1.0,
        };
        let group = RedundancyGroup {
            members: BTreeSet::from([PathBuf::from("/m/A, Deluxe"), PathBuf::from("/m/B")]),
            canonical: PathBuf::from("/m/A, Deluxe"),
            redundant: BTreeSet::from([PathBuf::from("/m/B")]),
            uncovered: BTreeSet::new(),
        };
        let plan = Plan {
            schema_version: 1,
            mode: PlanMode::Delete,
            input_fingerprint: "x".to_string(),
            actions: vec![PlanAction::delete("/m/B")],
            withheld: Vec::new(),
            kept: vec![PathBuf::from("/m/A, Deluxe")],
        };
        DedupeReport::new(&index, &[group], &[relation], Some(&plan), Vec::new())
    }

    #[test]
    fn members_carry_roles_and_actions() {
        let report = fixture();
        assert_eq!(report.members.len(), 2);
        assert_eq!(report.members[0].role, MemberRole::Canonical);
        assert_eq!(report.members[1].role, MemberRole::Redundant);
        assert_eq!(report.members[1].relation, Some(RelationKind::Duplicate));
        assert_eq!(report.members[1].action, Some(PlanActionKind::Delete));
        assert_eq!(report.counts.actions, 1);
    }

    #[test]
    fn text_report_lists_groups_and_checks() {
        let text = render(&fixture(), ReportFormat::Text).unwrap();
        assert!(text.contains("Group 1: keep /m/A, Deluxe"));
        assert!(text.contains("duplicate  /m/B (1 tracks, similarity 1.000) -> delete"));
        assert!(text.contains("== Post-check ==\nOK"));
    }

    #[test]
    fn csv_quotes_fields_with_commas() {
        let csv = render(&fixture(), ReportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("member,1,canonical,\"/m/A, Deluxe\",\"/m/A, Deluxe\",1,0,"));
        assert!(lines[2].starts_with("member,1,redundant,/m/B,"));
        assert!(lines[2].ends_with(",duplicate,1.0000,delete,,,"));
        assert_eq!(lines[3], "action,,,/m/B,,,,,,delete,,,");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn json_lines_tags_each_record() {
        let jsonl = render(&fixture(), ReportFormat::JsonLines).unwrap();
        let records: Vec<serde_json::Value> = jsonl
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1]["record_type"], "member");
        assert_eq!(records[1]["role"], "redundant");
        assert_eq!(records[1]["action"], "delete");
        assert_eq!(records[2]["record_type"], "action");
        assert_eq!(records[2]["release_path"], "/m/B");
    }

    fn stored_plan_report() -> DedupeReport {
        let plan = Plan {
            schema_version: 1,
            mode: PlanMode::Move {
                target_dir: PathBuf::from("/dupes"),
            },
            input_fingerprint: "x".to_string(),
            actions: vec![
                PlanAction::move_to("/m/Albums/B", "/dupes/Albums/B"),
                PlanAction::move_to("/m/Albums/C", "/dupes/Albums/C"),
            ],
            withheld: vec![WithheldRelease {
                release_path: PathBuf::from("/m/Albums/D"),
                canonical: PathBuf::from("/m/Albums/A"),
                reason: "holds tracks not present in the canonical release".to_string(),
            }],
            kept: vec![PathBuf::from("/m/Albums/A"), PathBuf::from("/m/Albums/D")],
        };
        let outcomes = vec![
            ActionOutcome {
                action: plan.actions[0].clone(),
                state: ActionState::Applied,
            },
            ActionOutcome {
                action: plan.actions[1].clone(),
                state: ActionState::Failed {
                    reason: "destination exists: /dupes/Albums/C".to_string(),
                },
            },
        ];
        let summary = ApplySummary::new(false, true, chrono::Utc::now(), outcomes);
        DedupeReport::new(&FingerprintIndex::default(), &[], &[], Some(&plan), Vec::new()).with_apply(summary)
    }

    #[test]
    fn stored_plan_report_counts_withheld_from_plan() {
        let report = stored_plan_report();
        assert!(report.members.is_empty());
        assert_eq!(report.counts.withheld, 1);
        assert_eq!(report.counts.actions, 2);

        let text = render(&report, ReportFormat::Text).unwrap();
        assert!(text.contains("Withheld: 1"));
        assert!(text.contains("/m/Albums/D (holds tracks not present in the canonical release; canonical /m/Albums/A)"));
    }

    #[test]
    fn stored_plan_csv_lists_actions_and_outcomes() {
        let csv = render(&stored_plan_report(), ReportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(
            lines[1..].to_vec(),
            vec![
                "action,,,/m/Albums/B,,,,,,move,/dupes/Albums/B,,",
                "action,,,/m/Albums/C,,,,,,move,/dupes/Albums/C,,",
                "outcome,,,/m/Albums/B,,,,,,move,/dupes/Albums/B,applied,",
                "outcome,,,/m/Albums/C,,,,,,move,/dupes/Albums/C,failed,destination exists: /dupes/Albums/C",
            ]
        );
    }

    #[test]
    fn stored_plan_json_lines_lists_outcomes() {
        let jsonl = render(&stored_plan_report(), ReportFormat::JsonLines).unwrap();
        let records: Vec<serde_json::Value> = jsonl
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(records.len(), 4);
        let outcomes: Vec<&serde_json::Value> =
            records.iter().filter(|r| r["record_type"] == "outcome").collect();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0]["state"], "applied");
        assert!(outcomes[0].get("reason").is_none());
        assert_eq!(outcomes[1]["state"], "failed");
        assert_eq!(outcomes[1]["destination"], "/dupes/Albums/C");
        assert_eq!(outcomes[1]["dry_run"], false);
    }

    #[test]
    fn json_report_includes_counts() {
        let json = render(&fixture(), ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["counts"]["groups"], 1);
        assert!(value.get("apply").is_none());
    }

    #[test]
    fn format_parsing() {
        assert_eq!("JSONL".parse::<ReportFormat>().unwrap(), ReportFormat::JsonLines);
        assert!("xml".parse::<ReportFormat>().is_err());
    }
}
