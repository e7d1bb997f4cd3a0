//! Cluster selection as a Beta-Bernoulli bandit.
//!
//! Each cluster keeps a Beta(α, β) posterior over "the user enjoys this cluster".
//! Selection draws one sample per cluster and takes the largest (Thompson sampling).

use crate::cluster::ClusterId;
use crate::db::AffinityRecord;
use log::{debug, warn};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand_distr::Beta;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Bandit priors and history seeding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    pub prior_alpha: f64,
    pub prior_beta: f64,
    /// How many historical clusters get an α boost at session start.
    pub history_top_n: usize,
    pub history_boost_per_second: f64,
    pub history_boost_cap: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            prior_alpha: 1.0,
            prior_beta: 1.0,
            history_top_n: 5,
            history_boost_per_second: 5.0,
            history_boost_cap: 25.0,
        }
    }
}

/// Beta posterior of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaArm {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaArm {
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        match Beta::new(self.alpha, self.beta) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.mean(),
        }
    }
}

/// Per-session bandit over the clusters of one snapshot.
#[derive(Debug, Clone)]
pub struct BanditSelector {
    arms: BTreeMap<ClusterId, BetaArm>,
    prior_alpha: f64,
    preferred_start_cluster: Option<ClusterId>,
}

impl BanditSelector {
    #[must_use]
    pub fn new(clusters: impl IntoIterator<Item = ClusterId>, config: &BanditConfig) -> Self {
        let prior = BetaArm { alpha: config.prior_alpha, beta: config.prior_beta };
        Self {
            arms: clusters.into_iter().map(|c| (c, prior)).collect(),
            prior_alpha: config.prior_alpha,
            preferred_start_cluster: None,
        }
    }

    /// Boost α of the most-listened historical clusters.
    ///
    /// Takes the top `history_top_n` records by listen seconds, adds
    /// `min(seconds·per_second, cap)` to each, and remembers the best one as the
    /// preferred start cluster. Records for clusters this bandit does not know are ignored.
    pub fn seed_from_history(&mut self, records: &[AffinityRecord], config: &BanditConfig) {
        let mut ranked: Vec<&AffinityRecord> = records
            .iter()
            .filter(|r| self.arms.contains_key(&r.cluster_id))
            .collect();
        ranked.sort_by(|a, b| {
            b.total_listen_seconds
                .partial_cmp(&a.total_listen_seconds)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cluster_id.cmp(&b.cluster_id))
        });

        for record in ranked.iter().take(config.history_top_n) {
            let boost = (record.total_listen_seconds * config.history_boost_per_second)
                .min(config.history_boost_cap)
                .max(0.0);
            if let Some(arm) = self.arms.get_mut(&record.cluster_id) {
                arm.alpha += boost;
            }
        }

        self.preferred_start_cluster = ranked.first().map(|r| r.cluster_id);
        if let Some(best) = self.preferred_start_cluster {
            debug!("Seeded bandit from {} history records, preferred cluster {best}", ranked.len());
        }
    }

    /// Thompson-sample every cluster and return the argmax. Ties go to the lower id.
    pub fn select(&self, rng: &mut StdRng) -> Option<ClusterId> {
        self.select_excluding(rng, &HashSet::new())
    }

    pub fn select_excluding(&self, rng: &mut StdRng, skip: &HashSet<ClusterId>) -> Option<ClusterId> {
        let mut best: Option<(ClusterId, f64)> = None;
        for (&id, arm) in self.arms.iter().filter(|(id, _)| !skip.contains(id)) {
            let theta = arm.sample(rng);
            if best.map_or(true, |(_, top)| theta > top) {
                best = Some((id, theta));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Add non-negative evidence to a cluster. Negative deltas are clamped to zero.
    pub fn update(&mut self, cluster: ClusterId, delta_alpha: f64, delta_beta: f64) {
        if delta_alpha < 0.0 || delta_beta < 0.0 {
            warn!("Clamping negative bandit update ({delta_alpha}, {delta_beta}) for cluster {cluster}");
        }
        match self.arms.get_mut(&cluster) {
            Some(arm) => {
                arm.alpha += delta_alpha.max(0.0);
                arm.beta += delta_beta.max(0.0);
            }
            None => debug!("Ignoring bandit update for unknown cluster {cluster}"),
        }
    }

    #[must_use]
    pub fn arm(&self, cluster: ClusterId) -> Option<BetaArm> {
        self.arms.get(&cluster).copied()
    }

    pub fn arms(&self) -> impl Iterator<Item = (ClusterId, BetaArm)> + '_ {
        self.arms.iter().map(|(&id, &arm)| (id, arm))
    }

    /// The `n` clusters with the largest α, ties by id.
    #[must_use]
    pub fn top_by_alpha(&self, n: usize) -> Vec<(ClusterId, f64)> {
        let mut ranked: Vec<(ClusterId, f64)> = self.arms.iter().map(|(&id, arm)| (id, arm.alpha)).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(n);
        ranked
    }

    /// Like [`top_by_alpha`](Self::top_by_alpha), restricted to clusters whose α grew
    /// past the prior.
    #[must_use]
    pub fn top_above_prior(&self, n: usize) -> Vec<(ClusterId, f64)> {
        let mut ranked = self.top_by_alpha(self.arms.len());
        ranked.retain(|&(_, alpha)| alpha > self.prior_alpha);
        ranked.truncate(n);
        ranked
    }

    #[must_use]
    pub fn preferred_start_cluster(&self) -> Option<ClusterId> {
        self.preferred_start_cluster
    }

    #[must_use]
    pub fn has_history(&self) -> bool {
        self.preferred_start_cluster.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn record(cluster_id: ClusterId, seconds: f64) -> AffinityRecord {
        AffinityRecord {
            user_id: "u".to_string(),
            cluster_id,
            collection: "c".to_string(),
            positive_count: 1,
            total_listen_seconds: seconds,
            track_count: 1,
            last_positive_ts: None,
        }
    }

    #[test]
    fn test_new_uses_priors() {
        let bandit = BanditSelector::new(0..3, &BanditConfig::default());
        for id in 0..3 {
            assert_eq!(bandit.arm(id), Some(BetaArm { alpha: 1.0, beta: 1.0 }));
        }
        assert!(!bandit.has_history());
    }

    #[test]
    fn test_seed_from_history_boosts_and_caps() {
        let config = BanditConfig::default();
        let mut bandit = BanditSelector::new(0..8, &config);
        let records = vec![
            record(0, 1.0),
            record(1, 100.0),
            record(2, 3.0),
            record(3, 2.0),
            record(4, 4.0),
            record(5, 0.5),
            record(99, 1000.0),
        ];
        bandit.seed_from_history(&records, &config);

        assert_eq!(bandit.arm(1).map(|a| a.alpha), Some(26.0), "Boost is capped at 25");
        assert_eq!(bandit.arm(2).map(|a| a.alpha), Some(16.0));
        assert_eq!(bandit.arm(0).map(|a| a.alpha), Some(6.0));
        assert_eq!(bandit.arm(5).map(|a| a.alpha), Some(1.0), "Only the top five are boosted");
        assert_eq!(bandit.preferred_start_cluster(), Some(1), "Unknown clusters are ignored");
    }

    #[test]
    fn test_update_clamps_negative_deltas() {
        let mut bandit = BanditSelector::new(0..1, &BanditConfig::default());
        bandit.update(0, -3.0, 0.5);
        assert_eq!(bandit.arm(0), Some(BetaArm { alpha: 1.0, beta: 1.5 }));
        bandit.update(7, 1.0, 0.0);
        assert!(bandit.arm(7).is_none());
    }

    #[test]
    fn test_select_is_reproducible() {
        let mut bandit = BanditSelector::new(0..5, &BanditConfig::default());
        bandit.update(3, 10.0, 0.0);
        let picks = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..10).map(|_| bandit.select(&mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(picks(7), picks(7));
    }

    #[test]
    fn test_select_prefers_strong_arm() {
        let mut bandit = BanditSelector::new(0..3, &BanditConfig::default());
        bandit.update(2, 200.0, 0.0);
        bandit.update(0, 0.0, 200.0);
        bandit.update(1, 0.0, 200.0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            assert_eq!(bandit.select(&mut rng), Some(2));
        }
    }

    #[test]
    fn test_select_excluding_skips_cluster() {
        let mut bandit = BanditSelector::new(0..2, &BanditConfig::default());
        bandit.update(0, 500.0, 0.0);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(bandit.select_excluding(&mut rng, &HashSet::from([0])), Some(1));
        assert_eq!(bandit.select_excluding(&mut rng, &HashSet::from([0, 1])), None);
    }

    #[test]
    fn test_top_by_alpha_orders_and_breaks_ties() {
        let mut bandit = BanditSelector::new(0..4, &BanditConfig::default());
        bandit.update(2, 4.0, 0.0);
        assert_eq!(bandit.top_by_alpha(3), vec![(2, 5.0), (0, 1.0), (1, 1.0)]);
    }

    #[test]
    fn test_top_above_prior_skips_untouched_clusters() {
        let mut bandit = BanditSelector::new(0..5, &BanditConfig::default());
        bandit.update(3, 2.0, 0.0);
        bandit.update(1, 0.5, 0.0);
        assert_eq!(
            bandit.top_above_prior(3),
            vec![(3, 3.0), (1, 1.5)],
            "Clusters still at the prior carry no history"
        );
        assert_eq!(bandit.top_above_prior(1), vec![(3, 3.0)]);
        assert!(BanditSelector::new(0..2, &BanditConfig::default()).top_above_prior(3).is_empty());
    }
}
