//! Agglomerative clustering in correlation-distance space.
//!
//! Each asset starts as a singleton cluster whose centroid is its row of the
//! distance matrix. Clusters are merged pairwise by a size-weighted squared
//! Euclidean distance between centroids (Ward-like linkage), the full merge
//! log is recorded, and the dendrogram is cut inside the largest gap between
//! successive merge distances.
//!
//! # Example
//!
//! ```
//! use cardinal::clustering::HierarchicalClustering;
//!
//! let distance = vec![
//!     vec![0.0, 0.1, 1.0, 1.0],
//!     vec![0.1, 0.0, 1.0, 1.0],
//!     vec![1.0, 1.0, 0.0, 0.1],
//!     vec![1.0, 1.0, 0.1, 0.0],
//! ];
//! let dendrogram = HierarchicalClustering::default().cluster(&distance).unwrap();
//! assert_eq!(dendrogram.labels.cluster_count(), 2);
//! ```

use crate::error::{AllocationError, Result};
use crate::types::{Cluster, ClusterLabels, MergeLogEntry};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Clustering engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Active-cluster count above which the pair scan runs on the rayon pool.
    pub parallel_threshold: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 64,
        }
    }
}

/// Where the dendrogram was cut.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CutPoint {
    /// Index into the merge-distance sequence that opens the largest gap.
    /// `None` when fewer than two merges exist.
    pub index: Option<usize>,
    /// Merges with a distance strictly below this value are applied.
    pub threshold: f64,
}

impl CutPoint {
    /// Whether a merge at `distance` is applied to the final partition.
    pub fn applies(&self, distance: f64) -> bool {
        distance < self.threshold
    }
}

/// Full output of a clustering run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dendrogram {
    /// Merges in the order they were performed.
    pub merges: Vec<MergeLogEntry>,
    /// Linkage distance of each merge; N−1 entries.
    pub distances: Vec<f64>,
    pub cut: CutPoint,
    pub labels: ClusterLabels,
}

/// Arena slot for one cluster. Merged clusters are tombstoned, never removed.
#[derive(Debug, Clone)]
struct ClusterRecord {
    cluster: Cluster,
    centroid: Vec<f64>,
    active: bool,
}

/// Candidate pair found by the scan: (distance, position of a, position of b).
type PairCandidate = (f64, usize, usize);

/// Lower distance wins; exact ties go to the lowest (i, j) pair.
fn better(a: PairCandidate, b: PairCandidate) -> PairCandidate {
    if a.0 < b.0 || (a.0 == b.0 && (a.1, a.2) < (b.1, b.2)) {
        a
    } else {
        b
    }
}

/// Size-weighted squared Euclidean distance between two centroids.
pub fn linkage_distance(size_a: usize, centroid_a: &[f64], size_b: usize, centroid_b: &[f64]) -> f64 {
    let na = size_a as f64;
    let nb = size_b as f64;
    let squared: f64 = centroid_a
        .iter()
        .zip(centroid_b)
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    na * nb / (na + nb) * squared
}

/// Choose the cut inside the largest gap of the merge-distance sequence.
///
/// With gaps `g[k] = d[k] − d[k−1]` for `k = 1..len`, the cut index is the
/// first `k` with maximal gap and the threshold is `d[k]`. Sequences with
/// fewer than two merges have no gap; every merge is then applied.
pub fn select_cut(distances: &[f64]) -> CutPoint {
    if distances.len() < 2 {
        return CutPoint {
            index: None,
            threshold: f64::INFINITY,
        };
    }

    let mut best_k = 1;
    let mut best_gap = distances[1] - distances[0];
    for k in 2..distances.len() {
        let gap = distances[k] - distances[k - 1];
        if gap > best_gap {
            best_gap = gap;
            best_k = k;
        }
    }

    CutPoint {
        index: Some(best_k),
        threshold: distances[best_k],
    }
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Replay the merge log and fuse every merge the cut applies.
///
/// The partition is the transitive closure of the applied merges over the
/// singleton clusters. Cluster ids are numbered by each cluster's smallest
/// asset index.
pub fn assign_labels(assets: usize, merges: &[MergeLogEntry], cut: &CutPoint) -> Result<ClusterLabels> {
    let mut parent: Vec<usize> = (0..assets).collect();

    for merge in merges.iter().filter(|m| cut.applies(m.distance)) {
        let members = merge.merged.members();
        let Some(&anchor) = members.first() else {
            continue;
        };
        let root = find(&mut parent, anchor);
        for &m in &members[1..] {
            let r = find(&mut parent, m);
            if r != root {
                parent[r] = root;
            }
        }
    }

    let mut root_label = vec![usize::MAX; assets];
    let mut labels = Vec::with_capacity(assets);
    let mut next = 0;
    for asset in 0..assets {
        let r = find(&mut parent, asset);
        if root_label[r] == usize::MAX {
            root_label[r] = next;
            next += 1;
        }
        labels.push(root_label[r]);
    }

    ClusterLabels::new(labels)
}

/// Agglomerative clustering engine over a correlation-distance matrix.
#[derive(Debug, Clone, Default)]
pub struct HierarchicalClustering {
    config: ClusteringConfig,
}

impl HierarchicalClustering {
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }

    /// Run the merge loop, cut the dendrogram and label every asset.
    pub fn cluster(&self, distance: &[Vec<f64>]) -> Result<Dendrogram> {
        let n = distance.len();
        let merges = self.merge_loop(distance)?;
        let distances: Vec<f64> = merges.iter().map(|m| m.distance).collect();
        let cut = select_cut(&distances);
        let labels = assign_labels(n, &merges, &cut)?;

        info!(
            "Clustered {} assets into {} clusters (threshold {:.6})",
            n,
            labels.cluster_count(),
            cut.threshold
        );

        Ok(Dendrogram {
            merges,
            distances,
            cut,
            labels,
        })
    }

    /// Merge clusters until one remains, returning the N−1 merge log entries.
    pub fn merge_loop(&self, distance: &[Vec<f64>]) -> Result<Vec<MergeLogEntry>> {
        let n = distance.len();
        if n < 2 {
            return Err(AllocationError::DegenerateClustering { assets: n });
        }
        if distance.iter().any(|row| row.len() != n) {
            return Err(AllocationError::InvalidInput(format!(
                "Distance matrix must be {}x{}",
                n, n
            )));
        }

        let mut arena: Vec<ClusterRecord> = distance
            .iter()
            .enumerate()
            .map(|(i, row)| ClusterRecord {
                cluster: Cluster::singleton(i),
                centroid: row.clone(),
                active: true,
            })
            .collect();
        let mut merges = Vec::with_capacity(n - 1);

        for _ in 0..n - 1 {
            let active: Vec<usize> = arena
                .iter()
                .enumerate()
                .filter(|(_, r)| r.active)
                .map(|(id, _)| id)
                .collect();

            let (dist, pa, pb) = self.closest_pair(&arena, &active).ok_or_else(|| {
                AllocationError::InvalidInput("Linkage distance is not finite".to_string())
            })?;
            let (a, b) = (active[pa], active[pb]);

            let left = arena[a].cluster.clone();
            let right = arena[b].cluster.clone();
            let merged = left.union(&right);

            let (na, nb) = (left.len() as f64, right.len() as f64);
            let centroid: Vec<f64> = arena[a]
                .centroid
                .iter()
                .zip(&arena[b].centroid)
                .map(|(ca, cb)| (na * ca + nb * cb) / (na + nb))
                .collect();

            debug!("Merge {} + {} -> {} at {:.6}", left, right, merged, dist);

            arena[a].active = false;
            arena[b].active = false;
            arena.push(ClusterRecord {
                cluster: merged.clone(),
                centroid,
                active: true,
            });
            merges.push(MergeLogEntry {
                left,
                right,
                merged,
                distance: dist,
            });
        }

        Ok(merges)
    }

    /// Closest pair among the active clusters, as positions in `active`.
    fn closest_pair(&self, arena: &[ClusterRecord], active: &[usize]) -> Option<PairCandidate> {
        let row_best = |i: usize| -> Option<PairCandidate> {
            let a = &arena[active[i]];
            let mut best: Option<PairCandidate> = None;
            for (j, &id) in active.iter().enumerate().skip(i + 1) {
                let b = &arena[id];
                let d = linkage_distance(a.cluster.len(), &a.centroid, b.cluster.len(), &b.centroid);
                if !d.is_finite() {
                    continue;
                }
                if best.map_or(true, |(bd, _, _)| d < bd) {
                    best = Some((d, i, j));
                }
            }
            best
        };

        if active.len() > self.config.parallel_threshold {
            (0..active.len())
                .into_par_iter()
                .filter_map(row_best)
                .reduce_with(better)
        } else {
            (0..active.len()).filter_map(row_best).reduce(better)
        }
    }
}
