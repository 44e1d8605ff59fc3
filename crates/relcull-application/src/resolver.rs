// SPDX-License-Identifier: GPL-3.0-or-later
use relcull_domain::{PairRelation, RedundancyGroup, RelationKind};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::index::FingerprintIndex;

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Attributes used to rank group members.
struct Standing<'a> {
    path: &'a Path,
    strict_subset: bool,
    track_count: usize,
    average_duration: f64,
}

/// Canonical preference: not a strict subset, more tracks, longer average
/// duration, then the smaller path.
fn precedence(a: &Standing<'_>, b: &Standing<'_>) -> Ordering {
    a.strict_subset
        .cmp(&b.strict_subset)
        .then_with(|| b.track_count.cmp(&a.track_count))
        .then_with(|| b.average_duration.total_cmp(&a.average_duration))
        .then_with(|| a.path.cmp(b.path))
}

/// Group related releases and pick one canonical release per group.
///
/// Groups are returned ordered by canonical path.
pub fn resolve(index: &FingerprintIndex, relations: &[PairRelation]) -> Vec<RedundancyGroup> {
    let related: Vec<&PairRelation> = relations
        .iter()
        .filter(|r| r.kind != RelationKind::Unrelated)
        .collect();

    let mut ids: BTreeMap<&Path, usize> = BTreeMap::new();
    for relation in &related {
        for path in [relation.release_a.as_path(), relation.release_b.as_path()] {
            let next = ids.len();
            ids.entry(path).or_insert(next);
        }
    }
    let paths: Vec<&Path> = {
        let mut paths = vec![Path::new(""); ids.len()];
        for (path, &id) in &ids {
            paths[id] = path;
        }
        paths
    };

    let mut sets = DisjointSet::new(paths.len());
    let mut strict_subsets: BTreeSet<&Path> = BTreeSet::new();
    // superset -> releases contained in it (duplicates count both ways)
    let mut contained_in: HashMap<&Path, Vec<&Path>> = HashMap::new();
    for relation in &related {
        sets.union(ids[relation.release_a.as_path()], ids[relation.release_b.as_path()]);
        if let Some((subset, _)) = relation.strict_containment() {
            strict_subsets.insert(subset);
        }
        for (subset, superset) in relation.containment_edges() {
            contained_in.entry(superset).or_default().push(subset);
        }
    }

    let mut components: BTreeMap<usize, Vec<&Path>> = BTreeMap::new();
    for (id, path) in paths.iter().enumerate() {
        components.entry(sets.find(id)).or_default().push(*path);
    }

    let mut groups: Vec<RedundancyGroup> = components
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|members| build_group(index, &members, &strict_subsets, &contained_in))
        .collect();
    groups.sort_by(|a, b| a.canonical.cmp(&b.canonical));

    info!(
        target: "resolver",
        groups = groups.len(),
        redundant = groups.iter().map(|g| g.redundant.len()).sum::<usize>(),
        uncovered = groups.iter().map(|g| g.uncovered.len()).sum::<usize>(),
        "redundancy groups resolved"
    );
    groups
}

fn build_group(
    index: &FingerprintIndex,
    members: &[&Path],
    strict_subsets: &BTreeSet<&Path>,
    contained_in: &HashMap<&Path, Vec<&Path>>,
) -> RedundancyGroup {
    let mut standings: Vec<Standing<'_>> = members
        .iter()
        .map(|&path| {
            let release = index.get(path);
            if release.is_none() {
                warn!(target: "resolver", release = %path.display(), "related release missing from index");
            }
            Standing {
                path,
                strict_subset: strict_subsets.contains(path),
                track_count: release.map(|r| r.track_count).unwrap_or(0),
                average_duration: release.map(|r| r.average_duration()).unwrap_or(0.0),
            }
        })
        .collect();
    standings.sort_by(precedence);
    let canonical = standings[0].path;

    // Walk containment edges backwards from the canonical release; every
    // member reached is covered by it.
    let mut covered: BTreeSet<&Path> = BTreeSet::from([canonical]);
    let mut queue: VecDeque<&Path> = VecDeque::from([canonical]);
    while let Some(superset) = queue.pop_front() {
        for &subset in contained_in.get(superset).map(Vec::as_slice).unwrap_or_default() {
            if covered.insert(subset) {
                queue.push_back(subset);
            }
        }
    }

    let members_set: BTreeSet<PathBuf> = members.iter().map(|p| p.to_path_buf()).collect();
    let redundant: BTreeSet<PathBuf> = members_set
        .iter()
        .filter(|p| p.as_path() != canonical)
        .cloned()
        .collect();
    let uncovered: BTreeSet<PathBuf> = redundant
        .iter()
        .filter(|p| !covered.contains(p.as_path()))
        .cloned()
        .collect();

    for path in &uncovered {
        warn!(
            target: "resolver",
            release = %path.display(),
            canonical = %canonical.display(),
            "release holds tracks the canonical release lacks"
        );
    }

    RedundancyGroup {
        members: members_set,
        canonical: canonical.to_path_buf(),
        redundant,
        uncovered,
    }
}

/// Related pairs that remain among the releases that are kept: canonical
/// releases, uncovered releases and anything outside every group.
pub fn post_check(groups: &[RedundancyGroup], relations: &[PairRelation]) -> Vec<PairRelation> {
    let removed: BTreeSet<&Path> = groups
        .iter()
        .flat_map(|g| g.removable())
        .map(PathBuf::as_path)
        .collect();

    relations
        .iter()
        .filter(|r| r.kind != RelationKind::Unrelated)
        .filter(|r| !removed.contains(r.release_a.as_path()) && !removed.contains(r.release_b.as_path()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relcull_domain::{FingerprintPayload, ReleaseScan, TrackFingerprint};

    fn index_of(releases: &[(&str, Vec<f64>)]) -> FingerprintIndex {
        let mut scans = Vec::new();
        let mut fingerprints = Vec::new();
        for (path, durations) in releases {
            let files: Vec<PathBuf> = (0..durations.len())
                .map(|n| PathBuf::from(format!("{}/{:02}.flac", path, n + 1)))
                .collect();
            for (file, duration) in files.iter().zip(durations.iter()) {
                fingerprints.push(TrackFingerprint::new(file.clone(), *duration, FingerprintPayload::Raw(vec![1])));
            }
            scans.push(ReleaseScan::new(*path, "Albums", "/m", files));
        }
        FingerprintIndex::build(&scans, fingerprints)
    }

    fn relation(a: &str, b: &str, kind: RelationKind) -> PairRelation {
        PairRelation {
            release_a: PathBuf::from(a),
            release_b: PathBuf::from(b),
            kind,
            matched_track_count: 1,
            similarity_score: 1.0,
        }
    }

    #[test]
    fn duplicate_pair_uses_path_tie_break() {
        let index = index_of(&[("/m/X-FLAC", vec![200.0, 180.0, 220.0]), ("/m/X-MP3", vec![200.0, 180.0, 220.0])]);
        let groups = resolve(&index, &[relation("/m/X-FLAC", "/m/X-MP3", RelationKind::Duplicate)]);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].canonical, PathBuf::from("/m/X-FLAC"));
        assert_eq!(groups[0].redundant, BTreeSet::from([PathBuf::from("/m/X-MP3")]));
        assert!(groups[0].uncovered.is_empty());
    }

    #[test]
    fn average_duration_breaks_track_count_ties() {
        let index = index_of(&[("/m/a", vec![200.0, 180.0]), ("/m/b", vec![201.0, 181.0])]);
        let groups = resolve(&index, &[relation("/m/a", "/m/b", RelationKind::Duplicate)]);
        assert_eq!(groups[0].canonical, PathBuf::from("/m/b"));
    }

    #[test]
    fn superset_is_canonical() {
        let index = index_of(&[("/m/Best Of", vec![200.0; 5]), ("/m/Box", vec![200.0; 40])]);
        let groups = resolve(&index, &[relation("/m/Best Of", "/m/Box", RelationKind::ASubsetOfB)]);

        assert_eq!(groups[0].canonical, PathBuf::from("/m/Box"));
        assert!(groups[0].redundant.contains(Path::new("/m/Best Of")));
        assert!(groups[0].uncovered.is_empty());
    }

    #[test]
    fn one_canonical_per_component() {
        let index = index_of(&[
            ("/m/a", vec![200.0, 200.0]),
            ("/m/b", vec![200.0, 200.0]),
            ("/m/c", vec![200.0, 200.0, 200.0]),
            ("/m/x", vec![100.0]),
            ("/m/y", vec![100.0]),
        ]);
        let relations = vec![
            relation("/m/a", "/m/b", RelationKind::Duplicate),
            relation("/m/b", "/m/c", RelationKind::ASubsetOfB),
            relation("/m/x", "/m/y", RelationKind::Duplicate),
        ];
        let groups = resolve(&index, &relations);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].canonical, PathBuf::from("/m/c"));
        assert_eq!(groups[0].members.len(), 3);
        assert_eq!(groups[0].redundant.len(), 2);
        assert_eq!(groups[1].canonical, PathBuf::from("/m/x"));
        for group in &groups {
            assert!(group.members.contains(&group.canonical));
            assert!(!group.redundant.contains(&group.canonical));
        }
    }

    #[test]
    fn member_without_containment_chain_is_uncovered() {
        // a and b are each contained in c; d contains a but has extra tracks
        // and is not contained in c.
        let index = index_of(&[
            ("/m/a", vec![200.0]),
            ("/m/c", vec![200.0, 210.0, 220.0]),
            ("/m/d", vec![200.0, 300.0]),
        ]);
        let relations = vec![
            relation("/m/a", "/m/c", RelationKind::ASubsetOfB),
            relation("/m/a", "/m/d", RelationKind::ASubsetOfB),
        ];
        let groups = resolve(&index, &relations);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].canonical, PathBuf::from("/m/c"));
        assert_eq!(groups[0].uncovered, BTreeSet::from([PathBuf::from("/m/d")]));
        let removable: Vec<_> = groups[0].removable().cloned().collect();
        assert_eq!(removable, vec![PathBuf::from("/m/a")]);

        let remaining = post_check(&groups, &relations);
        assert!(remaining.is_empty());
    }

    #[test]
    fn post_check_reports_containment_between_kept_releases() {
        let groups = vec![RedundancyGroup {
            members: BTreeSet::from([PathBuf::from("/m/a"), PathBuf::from("/m/b")]),
            canonical: PathBuf::from("/m/b"),
            redundant: BTreeSet::from([PathBuf::from("/m/a")]),
            uncovered: BTreeSet::from([PathBuf::from("/m/a")]),
        }];
        let relations = vec![relation("/m/a", "/m/b", RelationKind::ASubsetOfB)];
        assert_eq!(post_check(&groups, &relations).len(), 1);
    }
}
