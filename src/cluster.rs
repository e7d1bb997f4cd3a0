//! # Cluster Module
//!
//! Partitions the library with k-means (k-means++ seeding, several restarts, lowest
//! inertia wins) and freezes the result into an immutable [`ClusterSnapshot`].
//!
//! Snapshots are shared as `Arc<ClusterSnapshot>`. A [`SnapshotHandle`] lets a new fit
//! be swapped in while sessions keep reading the one they already hold.

use crate::algorithm::{euclidean_distance, mean_vector, squared_distance};
use crate::library::{Library, TrackId};
use log::{debug, info};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

pub type ClusterId = usize;

/// k-means and outlier parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Requested cluster count, capped by the library size.
    pub k: usize,
    pub seed: u64,
    pub max_iterations: usize,
    pub restarts: usize,
    /// Stop iterating once no centroid moves further than this.
    pub tolerance: f64,
    /// Members further than `mean + outlier_sigma·std` from the centroid are outliers.
    pub outlier_sigma: f64,
    /// Clusters smaller than this are entirely outliers.
    pub min_cluster_size: usize,
    pub density_epsilon: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            k: 20,
            seed: 42,
            max_iterations: 100,
            restarts: 10,
            tolerance: 1e-6,
            outlier_sigma: 2.0,
            min_cluster_size: 3,
            density_epsilon: 0.01,
        }
    }
}

/// One fitted cluster.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    pub centroid: Vec<f64>,
    /// Member ids, closest to the centroid first.
    pub members: Vec<TrackId>,
    /// Centroid distance of each entry in `members`.
    pub distances: Vec<f64>,
    pub outliers: HashSet<TrackId>,
    pub density: f64,
}

impl Cluster {
    #[must_use]
    pub fn is_all_outliers(&self) -> bool {
        !self.members.is_empty() && self.outliers.len() == self.members.len()
    }

    #[must_use]
    pub fn mean_distance(&self) -> f64 {
        if self.distances.is_empty() {
            return 0.0;
        }
        self.distances.iter().sum::<f64>() / self.distances.len() as f64
    }
}

struct KMeansRun {
    labels: Vec<usize>,
    inertia: f64,
}

fn nearest_centroid(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best_distance {
            best = i;
            best_distance = d;
        }
    }
    best
}

fn assign(points: &[&[f64]], centroids: &[Vec<f64>]) -> Vec<usize> {
    points.par_iter().map(|p| nearest_centroid(p, centroids)).collect()
}

fn kmeans_plus_plus(points: &[&[f64]], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = points.len();
    let mut centroids = vec![points[rng.gen_range(0..n)].to_vec()];
    let mut nearest: Vec<f64> = points.iter().map(|p| squared_distance(p, &centroids[0])).collect();

    while centroids.len() < k {
        let next = match WeightedIndex::new(&nearest) {
            Ok(dist) => dist.sample(rng),
            // every point already coincides with a centroid
            Err(_) => rng.gen_range(0..n),
        };
        let chosen = points[next].to_vec();
        for (d, p) in nearest.iter_mut().zip(points) {
            *d = d.min(squared_distance(p, &chosen));
        }
        centroids.push(chosen);
    }
    centroids
}

fn kmeans_once(points: &[&[f64]], k: usize, config: &ClusterConfig, rng: &mut StdRng) -> KMeansRun {
    let dim = points[0].len();
    let mut centroids = kmeans_plus_plus(points, k, rng);
    let mut labels = assign(points, &centroids);

    for iteration in 0..config.max_iterations {
        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (p, &label) in points.iter().zip(&labels) {
            counts[label] += 1;
            for (acc, x) in sums[label].iter_mut().zip(p.iter()) {
                *acc += x;
            }
        }

        let mut shift: f64 = 0.0;
        for c in 0..k {
            let updated = if counts[c] == 0 {
                // Reseed an empty cluster at the point worst served by its centroid.
                let far = points
                    .iter()
                    .zip(&labels)
                    .map(|(p, &l)| squared_distance(p, &centroids[l]))
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .map_or(0, |(i, _)| i);
                points[far].to_vec()
            } else {
                let count = counts[c] as f64;
                sums[c].iter().map(|x| x / count).collect()
            };
            shift = shift.max(euclidean_distance(&updated, &centroids[c]));
            centroids[c] = updated;
        }

        let next_labels = assign(points, &centroids);
        let stable = next_labels == labels;
        labels = next_labels;
        if stable || shift <= config.tolerance {
            debug!("k-means converged after {} iterations", iteration + 1);
            break;
        }
    }

    let inertia = points
        .iter()
        .zip(&labels)
        .map(|(p, &l)| squared_distance(p, &centroids[l]))
        .sum();
    KMeansRun { labels, inertia }
}

/// Immutable clustering of one library.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    library: Arc<Library>,
    clusters: Vec<Cluster>,
    assignment: HashMap<TrackId, ClusterId>,
}

impl ClusterSnapshot {
    /// Fit `k = min(config.k, |library|)` clusters. Deterministic for a fixed seed.
    ///
    /// An empty library yields one empty cluster with id 0.
    #[must_use]
    pub fn fit(library: Arc<Library>, config: &ClusterConfig) -> Self {
        if library.is_empty() {
            info!("Empty library, using a single empty cluster");
            let empty = Cluster {
                id: 0,
                centroid: vec![0.0; library.dimension()],
                members: Vec::new(),
                distances: Vec::new(),
                outliers: HashSet::new(),
                density: 0.0,
            };
            return Self { library, clusters: vec![empty], assignment: HashMap::new() };
        }

        let points: Vec<&[f64]> = library.tracks().iter().map(|t| t.embedding.as_slice()).collect();
        let k = config.k.clamp(1, points.len());
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut best = kmeans_once(&points, k, config, &mut rng);
        for _ in 1..config.restarts {
            let run = kmeans_once(&points, k, config, &mut rng);
            if run.inertia < best.inertia {
                best = run;
            }
        }

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); k];
        for (idx, &label) in best.labels.iter().enumerate() {
            groups[label].push(idx);
        }

        let mut clusters = Vec::with_capacity(k);
        let mut assignment = HashMap::with_capacity(points.len());
        for group in groups.into_iter().filter(|g| !g.is_empty()) {
            let id = clusters.len();
            let vectors: Vec<&[f64]> = group.iter().map(|&i| points[i]).collect();
            let centroid = mean_vector(&vectors).unwrap_or_default();
            clusters.push(Self::build_cluster(id, centroid, &group, &library, config));
            for &i in &group {
                assignment.insert(library.tracks()[i].id.clone(), id);
            }
        }

        info!(
            "Fitted {} clusters over {} tracks (inertia {:.4})",
            clusters.len(),
            points.len(),
            best.inertia
        );
        Self { library, clusters, assignment }
    }

    fn build_cluster(
        id: ClusterId,
        centroid: Vec<f64>,
        member_indices: &[usize],
        library: &Library,
        config: &ClusterConfig,
    ) -> Cluster {
        let mut ranked: Vec<(usize, f64)> = member_indices
            .iter()
            .map(|&i| (i, euclidean_distance(&library.tracks()[i].embedding, &centroid)))
            .collect();
        ranked.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let members: Vec<TrackId> = ranked.iter().map(|&(i, _)| library.tracks()[i].id.clone()).collect();
        let distances: Vec<f64> = ranked.iter().map(|&(_, d)| d).collect();

        let count = distances.len() as f64;
        let mean = distances.iter().sum::<f64>() / count;
        let std = (distances.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / count).sqrt();

        let outliers: HashSet<TrackId> = if members.len() < config.min_cluster_size {
            members.iter().cloned().collect()
        } else {
            let threshold = mean + config.outlier_sigma * std;
            members
                .iter()
                .zip(&distances)
                .filter(|(_, &d)| d > threshold)
                .map(|(m, _)| m.clone())
                .collect()
        };

        Cluster {
            id,
            centroid,
            members,
            distances,
            outliers,
            density: 1.0 / (mean + config.density_epsilon),
        }
    }

    #[must_use]
    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    #[must_use]
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn cluster_ids(&self) -> impl Iterator<Item = ClusterId> + '_ {
        self.clusters.iter().map(|c| c.id)
    }

    #[must_use]
    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(id)
    }

    #[must_use]
    pub fn cluster_of(&self, track_id: &str) -> Option<ClusterId> {
        self.assignment.get(track_id).copied()
    }

    #[must_use]
    pub fn is_outlier(&self, track_id: &str) -> bool {
        self.cluster_of(track_id)
            .and_then(|c| self.cluster(c))
            .is_some_and(|c| c.outliers.contains(track_id))
    }

    /// Up to `n` members, closest to the centroid first.
    #[must_use]
    pub fn representatives(&self, id: ClusterId, n: usize) -> Vec<&TrackId> {
        self.cluster(id)
            .map(|c| c.members.iter().take(n).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn tracks_in(&self, id: ClusterId) -> &[TrackId] {
        self.cluster(id).map_or(&[], |c| c.members.as_slice())
    }

    /// Non-empty cluster whose centroid is closest to `vector`.
    #[must_use]
    pub fn nearest_cluster(&self, vector: &[f64], skip: &HashSet<ClusterId>) -> Option<ClusterId> {
        self.clusters
            .iter()
            .filter(|c| !c.members.is_empty() && !skip.contains(&c.id))
            .map(|c| (c.id, squared_distance(vector, &c.centroid)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)
    }

    /// Every other non-empty cluster, nearest centroid first.
    #[must_use]
    pub fn clusters_by_distance_from(&self, id: ClusterId) -> Vec<ClusterId> {
        let Some(origin) = self.cluster(id) else {
            return self.cluster_ids().collect();
        };
        let mut others: Vec<(ClusterId, f64)> = self
            .clusters
            .iter()
            .filter(|c| c.id != id && !c.members.is_empty())
            .map(|c| (c.id, squared_distance(&origin.centroid, &c.centroid)))
            .collect();
        others.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        others.into_iter().map(|(c, _)| c).collect()
    }

    /// Clusters dense enough for a cold start that are not made only of outliers.
    #[must_use]
    pub fn dense_clusters(&self, min_density: f64) -> Vec<ClusterId> {
        self.clusters
            .iter()
            .filter(|c| c.density >= min_density && !c.members.is_empty() && !c.is_all_outliers())
            .map(|c| c.id)
            .collect()
    }

    /// A uniformly random member of `id` accepted by `keep`.
    pub fn random_member<F>(&self, id: ClusterId, rng: &mut StdRng, keep: F) -> Option<&TrackId>
    where
        F: Fn(&TrackId) -> bool,
    {
        let eligible: Vec<&TrackId> = self.tracks_in(id).iter().filter(|m| keep(m)).collect();
        eligible.choose(rng).copied()
    }
}

/// Shared pointer to the current snapshot, swapped atomically after a refit.
#[derive(Debug)]
pub struct SnapshotHandle {
    current: RwLock<Arc<ClusterSnapshot>>,
}

impl SnapshotHandle {
    #[must_use]
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self { current: RwLock::new(Arc::new(snapshot)) }
    }

    /// The snapshot readers should use right now.
    #[must_use]
    pub fn load(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Install `snapshot`, returning the one it replaces.
    pub fn swap(&self, snapshot: ClusterSnapshot) -> Arc<ClusterSnapshot> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(snapshot))
    }

    /// Fit `library` and swap the result in. The fit runs before the lock is taken.
    pub fn refit(&self, library: Arc<Library>, config: &ClusterConfig) -> Arc<ClusterSnapshot> {
        let fitted = ClusterSnapshot::fit(library, config);
        self.swap(fitted);
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::Track;

    fn two_blob_library() -> Arc<Library> {
        let mut tracks = Vec::new();
        for i in 0..5 {
            let offset = f64::from(i) * 0.01;
            tracks.push(Track::new(format!("a{i}"), format!("A {i}"), vec![1.0 + offset, 0.0, offset]));
            tracks.push(Track::new(format!("b{i}"), format!("B {i}"), vec![0.0, 1.0 + offset, offset]));
        }
        Arc::new(Library::new(tracks))
    }

    fn config(k: usize) -> ClusterConfig {
        ClusterConfig { k, ..ClusterConfig::default() }
    }

    #[test]
    fn test_fit_separates_blobs() {
        let snapshot = ClusterSnapshot::fit(two_blob_library(), &config(2));
        assert_eq!(snapshot.len(), 2);

        let a = snapshot.cluster_of("a0").expect("a0 is assigned");
        let b = snapshot.cluster_of("b0").expect("b0 is assigned");
        assert_ne!(a, b, "Blobs should land in different clusters");
        for i in 0..5 {
            assert_eq!(snapshot.cluster_of(&format!("a{i}")), Some(a));
            assert_eq!(snapshot.cluster_of(&format!("b{i}")), Some(b));
        }
    }

    #[test]
    fn test_every_track_in_exactly_one_cluster() {
        let library = two_blob_library();
        let snapshot = ClusterSnapshot::fit(Arc::clone(&library), &config(3));
        let total: usize = snapshot.clusters().iter().map(|c| c.members.len()).sum();
        assert_eq!(total, library.len());
        for track in library.tracks() {
            let owners = snapshot
                .clusters()
                .iter()
                .filter(|c| c.members.contains(&track.id))
                .count();
            assert_eq!(owners, 1, "Track {} should have one owner", track.id);
        }
    }

    #[test]
    fn test_fit_is_deterministic() {
        let first = ClusterSnapshot::fit(two_blob_library(), &config(2));
        let second = ClusterSnapshot::fit(two_blob_library(), &config(2));
        for c in first.clusters() {
            assert_eq!(Some(&c.members), second.cluster(c.id).map(|o| &o.members));
        }
    }

    #[test]
    fn test_k_capped_by_library_size() {
        let library = Arc::new(Library::new(vec![
            Track::new("x", "X", vec![1.0, 0.0]),
            Track::new("y", "Y", vec![0.0, 1.0]),
        ]));
        let snapshot = ClusterSnapshot::fit(library, &config(20));
        assert!(snapshot.len() <= 2);
    }

    #[test]
    fn test_small_clusters_are_all_outliers() {
        let library = Arc::new(Library::new(vec![
            Track::new("x", "X", vec![1.0, 0.0]),
            Track::new("y", "Y", vec![0.0, 1.0]),
        ]));
        let snapshot = ClusterSnapshot::fit(library, &config(1));
        assert!(snapshot.is_outlier("x"));
        assert!(snapshot.is_outlier("y"));
        assert!(snapshot.dense_clusters(0.0).is_empty(), "All-outlier clusters are not dense");
    }

    #[test]
    fn test_outlier_rule_flags_far_member() {
        let mut tracks: Vec<Track> = (0..10)
            .map(|i| Track::new(format!("t{i}"), "T", vec![1.0, f64::from(i) * 0.001]))
            .collect();
        tracks.push(Track::new("far", "Far", vec![1.0, 1.0]));
        let snapshot = ClusterSnapshot::fit(Arc::new(Library::new(tracks)), &config(1));
        assert!(snapshot.is_outlier("far"), "Distant member should be flagged");
        assert!(!snapshot.is_outlier("t0"));
    }

    #[test]
    fn test_representatives_sorted_by_distance() {
        let snapshot = ClusterSnapshot::fit(two_blob_library(), &config(2));
        for cluster in snapshot.clusters() {
            assert!(cluster.distances.windows(2).all(|w| w[0] <= w[1]));
            let reps = snapshot.representatives(cluster.id, 3);
            assert_eq!(reps.len(), 3);
            assert_eq!(reps[0], &cluster.members[0]);
        }
    }

    #[test]
    fn test_empty_library_single_cluster() {
        let snapshot = ClusterSnapshot::fit(Arc::new(Library::empty()), &ClusterConfig::default());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.clusters()[0].id, 0);
        assert!(snapshot.tracks_in(0).is_empty());
    }

    #[test]
    fn test_nearest_cluster_and_distance_order() {
        let snapshot = ClusterSnapshot::fit(two_blob_library(), &config(2));
        let a = snapshot.cluster_of("a0").expect("assigned");
        let b = snapshot.cluster_of("b0").expect("assigned");
        assert_eq!(snapshot.nearest_cluster(&[1.0, 0.0, 0.0], &HashSet::new()), Some(a));
        assert_eq!(snapshot.nearest_cluster(&[1.0, 0.0, 0.0], &HashSet::from([a])), Some(b));
        assert_eq!(snapshot.clusters_by_distance_from(a), vec![b]);
    }

    #[test]
    fn test_snapshot_handle_swap_keeps_old_readers() {
        let handle = SnapshotHandle::new(ClusterSnapshot::fit(two_blob_library(), &config(2)));
        let held = handle.load();
        let refreshed = handle.refit(two_blob_library(), &config(1));
        assert_eq!(held.len(), 2, "Existing readers keep their snapshot");
        assert_eq!(refreshed.len(), 1);
        assert_eq!(handle.load().len(), 1);
    }
}
