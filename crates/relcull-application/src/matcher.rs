// SPDX-License-Identifier: GPL-3.0-or-later

//! Release-level duplicate and subset detection.
//!
//! Two tracks match when their durations are within the configured tolerance
//! and their payloads are equal (strict) or within the bit error threshold
//! (fuzzy). Tracks of two releases are paired one-to-one: candidate pairs are
//! taken greedily by descending similarity, then by position, and the
//! assignment is completed with augmenting paths so the shared count is the
//! largest possible.
//!
//! Comparing every pair of releases is quadratic in both releases and
//! tracks. Pairs are therefore only compared when they share a duration
//! bucket, pass a total-duration bound, and every track of the smaller
//! release has at least one compatible partner.

use relcull_config::{MatchMode, MatchingConfig};
use relcull_domain::{PairRelation, RelationKind, ReleaseFingerprint, TrackFingerprint};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::index::FingerprintIndex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchSettings {
    pub mode: MatchMode,
    pub max_bit_error_rate: f64,
    pub min_overlap_ratio: f64,
    pub duration_tolerance_secs: f64,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self::from(&MatchingConfig::default())
    }
}

impl From<&MatchingConfig> for MatchSettings {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            mode: config.mode,
            max_bit_error_rate: config.max_bit_error_rate,
            min_overlap_ratio: config.min_overlap_ratio,
            duration_tolerance_secs: config.duration_tolerance_secs,
        }
    }
}

impl MatchSettings {
    pub fn strict() -> Self {
        Self {
            mode: MatchMode::Strict,
            ..Self::default()
        }
    }
}

/// Similarity of two tracks, or `None` when they do not match.
pub fn track_similarity(a: &TrackFingerprint, b: &TrackFingerprint, settings: &MatchSettings) -> Option<f64> {
    let (Some(pa), Some(pb)) = (a.payload.as_ref(), b.payload.as_ref()) else {
        return None;
    };
    if (a.duration_seconds - b.duration_seconds).abs() > settings.duration_tolerance_secs {
        return None;
    }

    match settings.mode {
        MatchMode::Strict => (pa == pb).then_some(1.0),
        MatchMode::Fuzzy => {
            let similarity = pa.similarity(pb, settings.min_overlap_ratio);
            // similarity is 1 - BER, and 0 when the overlap is too short
            (similarity > 0.0 && 1.0 - similarity <= settings.max_bit_error_rate).then_some(similarity)
        }
    }
}

/// Classify the relation between two releases.
///
/// The result does not depend on argument order beyond swapping
/// `ASubsetOfB` and `BSubsetOfA`.
pub fn compare_releases(a: &ReleaseFingerprint, b: &ReleaseFingerprint, settings: &MatchSettings) -> PairRelation {
    // Evaluate in a fixed orientation so tie-breaks are the same both ways.
    if a.release_path > b.release_path {
        return compare_releases(b, a, settings).reversed();
    }

    let unrelated = || PairRelation {
        release_a: a.release_path.clone(),
        release_b: b.release_path.clone(),
        kind: RelationKind::Unrelated,
        matched_track_count: 0,
        similarity_score: 0.0,
    };

    if a.tracks.is_empty() || b.tracks.is_empty() {
        return unrelated();
    }

    // (similarity, position in a, position in b)
    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    let mut a_has_partner = vec![false; a.tracks.len()];
    let mut b_has_partner = vec![false; b.tracks.len()];
    for (i, ta) in a.tracks.iter().enumerate() {
        for (j, tb) in b.tracks.iter().enumerate() {
            if let Some(similarity) = track_similarity(ta, tb, settings) {
                candidates.push((similarity, i, j));
                a_has_partner[i] = true;
                b_has_partner[j] = true;
            }
        }
    }

    // Every track of the smaller release must find a partner for any
    // relation other than Unrelated.
    let a_complete = a_has_partner.iter().all(|&p| p);
    let b_complete = b_has_partner.iter().all(|&p| p);
    let possible = match a.tracks.len().cmp(&b.tracks.len()) {
        std::cmp::Ordering::Less => a_complete,
        std::cmp::Ordering::Greater => b_complete,
        std::cmp::Ordering::Equal => a_complete && b_complete,
    };
    if !possible {
        return unrelated();
    }

    candidates.sort_by(|x, y| {
        y.0.total_cmp(&x.0)
            .then_with(|| x.1.cmp(&y.1))
            .then_with(|| x.2.cmp(&y.2))
    });
    let assignment = assign(&candidates, a.tracks.len(), b.tracks.len());

    let shared = assignment.len();
    let similarity_score = if shared == 0 {
        0.0
    } else {
        assignment.iter().map(|(s, _, _)| s).sum::<f64>() / shared as f64
    };

    let kind = if shared == a.tracks.len() && shared == b.tracks.len() {
        RelationKind::Duplicate
    } else if shared == a.tracks.len() {
        RelationKind::ASubsetOfB
    } else if shared == b.tracks.len() {
        RelationKind::BSubsetOfA
    } else {
        RelationKind::Unrelated
    };

    PairRelation {
        release_a: a.release_path.clone(),
        release_b: b.release_path.clone(),
        kind,
        matched_track_count: shared,
        similarity_score,
    }
}

/// One-to-one assignment over sorted candidate pairs.
///
/// Pairs are taken greedily in candidate order; tracks of `a` left unmatched
/// are then offered augmenting paths, trying partners in the same order.
fn assign(candidates: &[(f64, usize, usize)], a_len: usize, b_len: usize) -> Vec<(f64, usize, usize)> {
    let mut a_match: Vec<Option<usize>> = vec![None; a_len];
    let mut b_match: Vec<Option<usize>> = vec![None; b_len];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); a_len];
    let mut similarity: HashMap<(usize, usize), f64> = HashMap::new();

    for &(s, i, j) in candidates {
        adjacency[i].push(j);
        similarity.insert((i, j), s);
        if a_match[i].is_none() && b_match[j].is_none() {
            a_match[i] = Some(j);
            b_match[j] = Some(i);
        }
    }

    for i in 0..a_len {
        if a_match[i].is_some() || adjacency[i].is_empty() {
            continue;
        }
        let mut visited = vec![false; b_len];
        augment(i, &adjacency, &mut a_match, &mut b_match, &mut visited);
    }

    a_match
        .iter()
        .enumerate()
        .filter_map(|(i, j)| j.map(|j| (similarity.get(&(i, j)).copied().unwrap_or(0.0), i, j)))
        .collect()
}

fn augment(
    i: usize,
    adjacency: &[Vec<usize>],
    a_match: &mut [Option<usize>],
    b_match: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for &j in &adjacency[i] {
        if visited[j] {
            continue;
        }
        visited[j] = true;
        let free = match b_match[j] {
            None => true,
            Some(owner) => augment(owner, adjacency, a_match, b_match, visited),
        };
        if free {
            a_match[i] = Some(j);
            b_match[j] = Some(i);
            return true;
        }
    }
    false
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    /// Related pairs only, ordered by `(release_a, release_b)`.
    pub relations: Vec<PairRelation>,
    /// Release pairs that went through a full comparison.
    pub compared: usize,
    /// Release pairs ruled out before comparison.
    pub pruned: usize,
}

/// Compare every plausible pair of releases in `index`.
pub fn find_relations(index: &FingerprintIndex, settings: &MatchSettings) -> MatchOutcome {
    let releases: Vec<&ReleaseFingerprint> = index.releases().collect();
    let n = releases.len();
    let total_pairs = n * n.saturating_sub(1) / 2;
    let tolerance = settings.duration_tolerance_secs;
    // Matching durations differ by at most one bucket.
    let width = tolerance.max(1.0);

    let bucket = |duration: f64| (duration / width).floor() as i64;
    let mut buckets: HashMap<i64, BTreeSet<usize>> = HashMap::new();
    for (id, release) in releases.iter().enumerate() {
        for track in &release.tracks {
            buckets.entry(bucket(track.duration_seconds)).or_default().insert(id);
        }
    }

    let mut outcome = MatchOutcome::default();
    for (i, a) in releases.iter().enumerate() {
        let mut partners: BTreeSet<usize> = BTreeSet::new();
        for track in &a.tracks {
            let key = bucket(track.duration_seconds);
            for neighbour in [key - 1, key, key + 1] {
                if let Some(ids) = buckets.get(&neighbour) {
                    partners.extend(ids.range(i + 1..));
                }
            }
        }

        for j in partners {
            let b = releases[j];
            if !totals_compatible(a, b, tolerance) {
                continue;
            }
            outcome.compared += 1;
            let relation = compare_releases(a, b, settings);
            if relation.kind != RelationKind::Unrelated {
                debug!(
                    target: "matcher",
                    a = %relation.release_a.display(),
                    b = %relation.release_b.display(),
                    kind = %relation.kind,
                    shared = relation.matched_track_count,
                    "related releases"
                );
                outcome.relations.push(relation);
            }
        }
    }

    outcome.pruned = total_pairs - outcome.compared;
    info!(
        target: "matcher",
        releases = n,
        compared = outcome.compared,
        pruned = outcome.pruned,
        relations = outcome.relations.len(),
        "release matching finished"
    );
    outcome
}

/// Total-duration bound: the smaller release can only be contained in the
/// larger one if its total stays within the per-track tolerance.
fn totals_compatible(a: &ReleaseFingerprint, b: &ReleaseFingerprint, tolerance: f64) -> bool {
    let (small, large) = if a.track_count <= b.track_count { (a, b) } else { (b, a) };
    let slack = small.track_count as f64 * tolerance;
    let (small_total, large_total) = (small.total_duration(), large.total_duration());
    if small.track_count == large.track_count {
        (small_total - large_total).abs() <= slack
    } else {
        small_total <= large_total + slack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relcull_domain::{FingerprintPayload, ReleaseScan};
    use std::path::PathBuf;

    fn raw(seed: u32, len: usize) -> FingerprintPayload {
        FingerprintPayload::Raw(
            (0..len as u32)
                .map(|k| seed.wrapping_mul(2_654_435_761).wrapping_add(k * 7919))
                .collect(),
        )
    }

    fn release(path: &str, tracks: &[(f64, FingerprintPayload)]) -> ReleaseFingerprint {
        let tracks = tracks
            .iter()
            .enumerate()
            .map(|(n, (d, p))| TrackFingerprint::new(format!("{}/{:02}.flac", path, n + 1), *d, p.clone()))
            .collect();
        ReleaseFingerprint::new(path, "Albums", tracks)
    }

    fn flip_bits(payload: &FingerprintPayload, mask: u32) -> FingerprintPayload {
        match payload {
            FingerprintPayload::Raw(tokens) => FingerprintPayload::Raw(tokens.iter().map(|t| t ^ mask).collect()),
            other => other.clone(),
        }
    }

    #[test]
    fn track_match_requires_duration_gate() {
        let settings = MatchSettings::default();
        let a = TrackFingerprint::new("a", 200.0, raw(1, 100));
        let near = TrackFingerprint::new("b", 201.5, raw(1, 100));
        let far = TrackFingerprint::new("c", 203.0, raw(1, 100));
        assert_eq!(track_similarity(&a, &near, &settings), Some(1.0));
        assert_eq!(track_similarity(&a, &far, &settings), None);
    }

    #[test]
    fn fuzzy_tolerates_bit_errors_strict_does_not() {
        let a = TrackFingerprint::new("a", 200.0, raw(1, 100));
        // 2 of 32 bits per token, BER 0.0625
        let b = TrackFingerprint::new("b", 200.0, flip_bits(&raw(1, 100), 0b11));
        let fuzzy = track_similarity(&a, &b, &MatchSettings::default()).unwrap();
        assert!((fuzzy - (1.0 - 2.0 / 32.0)).abs() < 1e-9);
        assert_eq!(track_similarity(&a, &b, &MatchSettings::strict()), None);

        // 8 of 32 bits per token, BER 0.25
        let c = TrackFingerprint::new("c", 200.0, flip_bits(&raw(1, 100), 0xff));
        assert_eq!(track_similarity(&a, &c, &MatchSettings::default()), None);
    }

    #[test]
    fn identical_releases_are_duplicates_both_ways() {
        let tracks = [(200.0, raw(1, 50)), (180.0, raw(2, 50)), (220.0, raw(3, 50))];
        let a = release("/m/Albums/X-FLAC", &tracks);
        let b = release("/m/Albums/X-MP3", &tracks);
        let settings = MatchSettings::default();

        let ab = compare_releases(&a, &b, &settings);
        let ba = compare_releases(&b, &a, &settings);
        assert_eq!(ab.kind, RelationKind::Duplicate);
        assert_eq!(ba.kind, RelationKind::Duplicate);
        assert_eq!(ab.matched_track_count, 3);
        assert_eq!(ba.release_a, PathBuf::from("/m/Albums/X-MP3"));
    }

    #[test]
    fn strict_subset_is_never_duplicate() {
        let small = release("/m/Albums/Best Of", &[(200.0, raw(1, 50)), (180.0, raw(2, 50))]);
        let large = release(
            "/m/Albums/Box",
            &[(170.0, raw(9, 50)), (180.0, raw(2, 50)), (200.0, raw(1, 50))],
        );
        let settings = MatchSettings::default();

        assert_eq!(compare_releases(&small, &large, &settings).kind, RelationKind::ASubsetOfB);
        assert_eq!(compare_releases(&large, &small, &settings).kind, RelationKind::BSubsetOfA);
    }

    #[test]
    fn partial_overlap_is_unrelated() {
        let a = release("/m/a", &[(200.0, raw(1, 50)), (180.0, raw(2, 50))]);
        let b = release("/m/b", &[(200.0, raw(1, 50)), (240.0, raw(5, 50))]);
        let relation = compare_releases(&a, &b, &MatchSettings::default());
        assert_eq!(relation.kind, RelationKind::Unrelated);
    }

    #[test]
    fn assignment_is_one_to_one() {
        // Both tracks of `a` are the same recording; `b` holds it once.
        let a = release("/m/a", &[(200.0, raw(1, 50)), (200.0, raw(1, 50))]);
        let b = release(
            "/m/b",
            &[(200.0, raw(1, 50)), (300.0, raw(4, 50)), (320.0, raw(5, 50))],
        );
        let relation = compare_releases(&a, &b, &MatchSettings::default());
        assert_eq!(relation.matched_track_count, 1);
        assert_eq!(relation.kind, RelationKind::Unrelated);
    }

    #[test]
    fn augmenting_path_recovers_full_assignment() {
        // Greedy takes (a0,b0) first; a1 only matches b0, so a0 must move to b1.
        let base = raw(1, 64);
        let a = release("/m/a", &[(200.0, base.clone()), (201.5, flip_bits(&base, 0b1))]);
        let b = release("/m/b", &[(200.0, base.clone()), (198.5, flip_bits(&base, 0b111))]);
        let a1_to_b1 = track_similarity(&a.tracks[1], &b.tracks[1], &MatchSettings::default());
        assert!(a1_to_b1.is_none());

        let relation = compare_releases(&a, &b, &MatchSettings::default());
        assert_eq!(relation.kind, RelationKind::Duplicate);
        assert_eq!(relation.matched_track_count, 2);
    }

    #[test]
    fn find_relations_prunes_incompatible_pairs() {
        let scans_and_tracks = [
            ("/m/Albums/A", vec![(200.0, raw(1, 50)), (180.0, raw(2, 50))]),
            ("/m/Albums/B", vec![(200.0, raw(1, 50)), (180.0, raw(2, 50))]),
            ("/m/Albums/C", vec![(600.0, raw(7, 50))]),
        ];
        let mut scans = Vec::new();
        let mut fingerprints = Vec::new();
        for (path, tracks) in &scans_and_tracks {
            let fingerprinted = release(path, tracks);
            scans.push(ReleaseScan::new(
                *path,
                "Albums",
                "/m",
                fingerprinted.tracks.iter().map(|t| t.file_path.clone()).collect(),
            ));
            fingerprints.extend(fingerprinted.tracks);
        }
        let index = FingerprintIndex::build(&scans, fingerprints);

        let outcome = find_relations(&index, &MatchSettings::default());

        assert_eq!(outcome.relations.len(), 1);
        assert_eq!(outcome.relations[0].kind, RelationKind::Duplicate);
        assert_eq!(outcome.relations[0].release_a, PathBuf::from("/m/Albums/A"));
        assert_eq!(outcome.compared, 1);
        assert_eq!(outcome.pruned, 2);
    }

    #[test]
    fn total_duration_gate() {
        let small = release("/m/a", &[(200.0, raw(1, 10)), (200.0, raw(2, 10))]);
        let large = release("/m/b", &[(100.0, raw(1, 10)), (100.0, raw(2, 10)), (100.0, raw(3, 10))]);
        assert!(!totals_compatible(&small, &large, 2.0));
        assert!(totals_compatible(&small, &small.clone(), 2.0));
    }
}
