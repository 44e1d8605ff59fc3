// SPDX-License-Identifier: GPL-3.0-or-later
use relcull_domain::{ReleaseFingerprint, ReleaseScan, TrackFingerprint};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Successfully fingerprinted releases keyed by release path.
#[derive(Debug, Clone, Default)]
pub struct FingerprintIndex {
    releases: BTreeMap<PathBuf, ReleaseFingerprint>,
    skipped: Vec<PathBuf>,
    unassigned: usize,
}

impl FingerprintIndex {
    /// Group `fingerprints` into the releases described by `scans`.
    ///
    /// Arrival order of the fingerprints does not matter. Releases without a
    /// single successful fingerprint are left out and listed in
    /// [`FingerprintIndex::skipped`].
    pub fn build(
        scans: &[ReleaseScan],
        fingerprints: impl IntoIterator<Item = TrackFingerprint>,
    ) -> Self {
        let mut owner: HashMap<&Path, &ReleaseScan> = HashMap::new();
        for scan in scans {
            for file in &scan.audio_files {
                owner.insert(file.as_path(), scan);
            }
        }

        let mut ok: BTreeMap<&Path, Vec<TrackFingerprint>> = BTreeMap::new();
        let mut failed: HashMap<&Path, usize> = HashMap::new();
        let mut unassigned = 0usize;

        for track in fingerprints {
            let Some(scan) = owner.get(track.path()) else {
                debug!(target: "index", file = %track.file_path.display(), "fingerprint for unknown file ignored");
                unassigned += 1;
                continue;
            };
            if track.is_ok() {
                ok.entry(scan.release_path.as_path()).or_default().push(track);
            } else {
                *failed.entry(scan.release_path.as_path()).or_default() += 1;
            }
        }

        let mut releases = BTreeMap::new();
        let mut skipped = Vec::new();
        for scan in scans {
            let failed_tracks = failed.get(scan.release_path.as_path()).copied().unwrap_or(0);
            match ok.remove(scan.release_path.as_path()) {
                Some(tracks) => {
                    let mut release = ReleaseFingerprint::new(&scan.release_path, &scan.group, tracks);
                    release.failed_tracks = failed_tracks;
                    if failed_tracks > 0 {
                        warn!(
                            target: "index",
                            release = %scan.release_path.display(),
                            failed_tracks,
                            "release matched on its remaining tracks"
                        );
                    }
                    releases.insert(scan.release_path.clone(), release);
                }
                None => {
                    warn!(
                        target: "index",
                        release = %scan.release_path.display(),
                        failed_tracks,
                        "release has no fingerprinted tracks, skipping"
                    );
                    skipped.push(scan.release_path.clone());
                }
            }
        }

        info!(target: "index", releases = releases.len(), skipped = skipped.len(), "fingerprint index built");
        Self {
            releases,
            skipped,
            unassigned,
        }
    }

    pub fn get(&self, release_path: &Path) -> Option<&ReleaseFingerprint> {
        self.releases.get(release_path)
    }

    /// Releases in path order.
    pub fn releases(&self) -> impl Iterator<Item = &ReleaseFingerprint> {
        self.releases.values()
    }

    pub fn len(&self) -> usize {
        self.releases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    pub fn unassigned(&self) -> usize {
        self.unassigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relcull_domain::FingerprintPayload;

    fn scan(release: &str, files: &[&str]) -> ReleaseScan {
        ReleaseScan::new(
            release,
            "Albums",
            "/m/Albums",
            files.iter().map(|f| PathBuf::from(format!("{}/{}", release, f))).collect(),
        )
    }

    fn ok(path: &str) -> TrackFingerprint {
        TrackFingerprint::new(path, 200.0, FingerprintPayload::Raw(vec![1, 2]))
    }

    #[test]
    fn groups_tracks_regardless_of_arrival_order() {
        let scans = vec![
            scan("/m/Albums/A", &["01.flac", "02.flac"]),
            scan("/m/Albums/B", &["01.flac"]),
        ];
        let fingerprints = vec![
            ok("/m/Albums/A/02.flac"),
            ok("/m/Albums/B/01.flac"),
            ok("/m/Albums/A/01.flac"),
        ];

        let index = FingerprintIndex::build(&scans, fingerprints);

        assert_eq!(index.len(), 2);
        let a = index.get(Path::new("/m/Albums/A")).unwrap();
        assert_eq!(a.track_count, 2);
        assert_eq!(a.tracks[0].file_path, PathBuf::from("/m/Albums/A/01.flac"));
        let paths: Vec<_> = index.releases().map(|r| r.release_path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/m/Albums/A"), PathBuf::from("/m/Albums/B")]);
    }

    #[test]
    fn failed_tracks_are_counted_not_held() {
        let scans = vec![scan("/m/Albums/A", &["01.flac", "02.flac"])];
        let fingerprints = vec![
            ok("/m/Albums/A/01.flac"),
            TrackFingerprint::failed("/m/Albums/A/02.flac", "corrupt"),
        ];

        let index = FingerprintIndex::build(&scans, fingerprints);

        let a = index.get(Path::new("/m/Albums/A")).unwrap();
        assert_eq!(a.track_count, 1);
        assert_eq!(a.failed_tracks, 1);
    }

    #[test]
    fn release_without_fingerprints_is_skipped() {
        let scans = vec![
            scan("/m/Albums/A", &["01.flac"]),
            scan("/m/Albums/B", &["01.flac"]),
        ];
        let fingerprints = vec![
            ok("/m/Albums/A/01.flac"),
            TrackFingerprint::failed("/m/Albums/B/01.flac", "corrupt"),
            ok("/elsewhere/01.flac"),
        ];

        let index = FingerprintIndex::build(&scans, fingerprints);

        assert_eq!(index.len(), 1);
        assert_eq!(index.skipped(), &[PathBuf::from("/m/Albums/B")]);
        assert_eq!(index.unassigned(), 1);
    }
}
