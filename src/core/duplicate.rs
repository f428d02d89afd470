// Near-duplicate grouping over fingerprints:
// - Hamming distance between equal-length fingerprints
// - Greedy seed-order clustering (not transitive closure)
// - Representative selection by quality score

use crate::core::models::{Cluster, Fingerprint, ImageRecord};
use thiserror::Error;

/// Default maximum Hamming distance from a cluster's seed.
pub const DEFAULT_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("Fingerprint length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
}

/// Number of character positions at which two fingerprints differ.
pub fn hamming_distance(a: &Fingerprint, b: &Fingerprint) -> Result<u32, ClusterError> {
    if a.len() != b.len() {
        return Err(ClusterError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(a.as_str()
        .chars()
        .zip(b.as_str().chars())
        .filter(|(x, y)| x != y)
        .count() as u32)
}

pub struct DuplicateDetector {
    pub threshold: u32,
}

impl DuplicateDetector {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Group records in a single greedy pass.
    ///
    /// Each record not yet placed seeds a new cluster and pulls in every later
    /// unplaced record within `threshold` of the seed. A record close to a
    /// member but far from the seed starts its own cluster, so the result
    /// depends on input order.
    pub fn cluster(&self, records: Vec<ImageRecord>) -> Result<Vec<Cluster>, ClusterError> {
        let mut visited = vec![false; records.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();

        for i in 0..records.len() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            let mut group = vec![i];

            for j in (i + 1)..records.len() {
                if visited[j] {
                    continue;
                }
                let distance = hamming_distance(&records[i].fingerprint, &records[j].fingerprint)?;
                if distance <= self.threshold {
                    visited[j] = true;
                    group.push(j);
                }
            }
            groups.push(group);
        }

        let mut slots: Vec<Option<ImageRecord>> = records.into_iter().map(Some).collect();
        let clusters = groups
            .into_iter()
            .map(|group| {
                let members: Vec<ImageRecord> = group
                    .into_iter()
                    .filter_map(|index| slots[index].take())
                    .collect();
                let representative = select_representative(&members);
                Cluster {
                    members,
                    representative,
                }
            })
            .collect();

        Ok(clusters)
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

/// Index of the member with the highest quality score; ties keep the earliest.
pub fn select_representative(members: &[ImageRecord]) -> usize {
    let mut best = 0;
    for (index, member) in members.iter().enumerate().skip(1) {
        if member.quality_score > members[best].quality_score {
            best = index;
        }
    }
    best
}
