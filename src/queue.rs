//! # Candidate Selection
//!
//! Picks the next track for a session:
//!
//! 1. the [`PhasePolicy`] chooses PROBE, EXPLOIT or EXPLORE
//! 2. a [`TargetStrategy`] turns phase and session state into a scoring [`Target`]
//! 3. every track passing the filters is scored by the [`Kernel`]
//! 4. near-duplicates of recent picks are dropped and the best survivor wins
//!
//! When nothing survives, selection falls back to the nearest other cluster and then
//! to any track that passes the hard filters. Only a fully exhausted library yields
//! `None`.

use crate::algorithm::{self, cosine_similarity, Kernel, ScoringContext};
use crate::bandit::BanditSelector;
use crate::cluster::{ClusterId, ClusterSnapshot};
use crate::library::{AvailabilityMode, Track};
use crate::session::{Phase, PhasePolicy, SessionState};
use log::{debug, trace};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Target and candidate-pool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default size of `next_batch`.
    pub batch_size: usize,
    /// Ranked candidates considered before falling back.
    pub candidate_pool: usize,
    pub recent_likes: usize,
    pub lock_variance: f64,
    /// Lock variance once the current cluster has failed at least once.
    pub relaxed_lock_variance: f64,
    pub explore_variance: f64,
    pub cold_variance: f64,
    pub history_variance: f64,
    pub breakout_variance: f64,
    pub taste_only_variance: f64,
    pub single_like_variance: f64,
    pub min_variance: f64,
    /// Share of the taste vector in a blended target.
    pub taste_blend: f64,
    pub history_top_clusters: usize,
    pub min_density: f64,
    pub probe_chance: f64,
    pub probe_variance: f64,
    pub max_probes: usize,
    pub duplicate_threshold: f64,
    pub search_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            candidate_pool: 20,
            recent_likes: 5,
            lock_variance: 0.05,
            relaxed_lock_variance: 0.2,
            explore_variance: 1.5,
            cold_variance: 1.0,
            history_variance: 0.8,
            breakout_variance: 1.0,
            taste_only_variance: 1.0,
            single_like_variance: 0.15,
            min_variance: 0.01,
            taste_blend: 0.2,
            history_top_clusters: 3,
            min_density: 0.5,
            probe_chance: 0.3,
            probe_variance: 0.25,
            max_probes: 2,
            duplicate_threshold: 0.95,
            search_limit: 20,
        }
    }
}

/// What candidates are scored against.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub center: Vec<f64>,
    pub variance: f64,
    /// Single-exemplar mode: no feature weights, no overlap boost.
    pub forced: bool,
    pub overlap_targets: Vec<Vec<f64>>,
    pub feature_weights: Option<Vec<f64>>,
    pub justification: String,
}

impl Target {
    fn single(center: &[f64], variance: f64, justification: String) -> Self {
        Self {
            center: center.to_vec(),
            variance,
            forced: false,
            overlap_targets: Vec::new(),
            feature_weights: None,
            justification,
        }
    }

    fn forced(center: &[f64], variance: f64, justification: String) -> Self {
        Self { forced: true, ..Self::single(center, variance, justification) }
    }
}

/// Everything selection may read about one session.
pub struct SelectionContext<'a> {
    pub snapshot: &'a ClusterSnapshot,
    pub state: &'a SessionState,
    pub bandit: &'a BanditSelector,
    pub mode: AvailabilityMode,
    pub config: &'a QueueConfig,
    pub scoring: &'a ScoringContext,
}

impl SelectionContext<'_> {
    /// Never played, never rejected, available in this session.
    #[must_use]
    pub fn passes_hard_filters(&self, track: &Track) -> bool {
        !self.state.has_played(track)
            && !self.state.global_dislikes.contains(&track.id)
            && self.mode.admits(track)
    }

    #[must_use]
    pub fn passes_soft_filters(&self, track: &Track) -> bool {
        self.passes_hard_filters(track) && !self.snapshot.is_outlier(&track.id)
    }

    /// Too similar to something in the recent-history window.
    #[must_use]
    pub fn is_duplicate(&self, track: &Track) -> bool {
        self.state
            .recent_history
            .iter()
            .any(|seen| cosine_similarity(seen, &track.embedding) > self.config.duplicate_threshold)
    }

    fn is_selectable(&self, track: &Track) -> bool {
        self.passes_soft_filters(track) && !self.is_duplicate(track)
    }

    fn random_valid_member(&self, cluster: ClusterId, rng: &mut StdRng) -> Option<&Track> {
        let library = self.snapshot.library();
        self.snapshot
            .random_member(cluster, rng, |id| library.get(id).is_some_and(|t| self.is_selectable(t)))
            .and_then(|id| library.get(id))
    }

    /// Center on a random valid member of `cluster`, or its centroid if none is left.
    fn anchored(&self, cluster: ClusterId, variance: f64, why: &str, rng: &mut StdRng) -> Option<Target> {
        if let Some(anchor) = self.random_valid_member(cluster, rng) {
            return Some(Target::single(
                &anchor.embedding,
                variance,
                format!("{why}: cluster {cluster}, anchored on {}", anchor.label),
            ));
        }
        let centroid = &self.snapshot.cluster(cluster)?.centroid;
        Some(Target::single(centroid, self.config.cold_variance, format!("{why}: cluster {cluster} centroid")))
    }

    fn blend_with_taste(&self, mean: Vec<f64>) -> Vec<f64> {
        match self.state.taste.get() {
            Some(taste) => algorithm::blend(&mean, taste, 1.0 - self.config.taste_blend),
            None => mean,
        }
    }
}

/// Turns the chosen phase into a scoring target.
pub trait TargetStrategy: Send + Sync + fmt::Debug {
    fn select_target(&self, ctx: &SelectionContext<'_>, phase: Phase, rng: &mut StdRng) -> Option<Target>;
}

/// Lock onto recent likes, explore around their mean, cold-start from history.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTargetStrategy;

impl DefaultTargetStrategy {
    fn cold_start(ctx: &SelectionContext<'_>, rng: &mut StdRng) -> Option<Target> {
        if ctx.bandit.has_history() {
            let top: Vec<(ClusterId, f64)> = ctx
                .bandit
                .top_above_prior(ctx.config.history_top_clusters)
                .into_iter()
                .filter(|(c, _)| !ctx.snapshot.tracks_in(*c).is_empty())
                .collect();
            let weights: Vec<f64> = top.iter().map(|(_, alpha)| *alpha).collect();
            if let Ok(dist) = WeightedIndex::new(&weights) {
                let cluster = top[dist.sample(rng)].0;
                let mut target = ctx.anchored(cluster, ctx.config.history_variance, "Cold start from history", rng)?;
                if let Some(centroid) = ctx.state.history_centroids.get(&cluster) {
                    if centroid.len() == target.center.len() {
                        target.center = algorithm::blend(&target.center, centroid, 1.0 - ctx.config.taste_blend);
                        target.justification.push_str(", leaning to your past taste");
                    }
                }
                return Some(target);
            }
        }

        let mut pool = ctx.snapshot.dense_clusters(ctx.config.min_density);
        if pool.is_empty() {
            pool = ctx
                .snapshot
                .cluster_ids()
                .filter(|&c| !ctx.snapshot.tracks_in(c).is_empty())
                .collect();
        }
        let cluster = *pool.choose(rng)?;
        ctx.anchored(cluster, ctx.config.cold_variance, "Cold start", rng)
    }

    fn breakout(ctx: &SelectionContext<'_>, from: ClusterId, rng: &mut StdRng) -> Option<Target> {
        let skip = HashSet::from([from]);
        let cluster = ctx
            .bandit
            .select_excluding(rng, &skip)
            .filter(|&c| !ctx.snapshot.tracks_in(c).is_empty())
            .or_else(|| ctx.snapshot.clusters_by_distance_from(from).first().copied());
        match cluster {
            Some(cluster) => ctx.anchored(cluster, ctx.config.breakout_variance, "Breakout", rng),
            None => Self::cold_start(ctx, rng),
        }
    }

    fn exploit(ctx: &SelectionContext<'_>, rng: &mut StdRng) -> Option<Target> {
        let state = ctx.state;
        let likes = state.recent_likes(ctx.config.recent_likes);

        if state.is_locked() {
            let variance = if state.cluster_fail_count > 0 {
                ctx.config.relaxed_lock_variance
            } else {
                ctx.config.lock_variance
            };
            if let Some(like) = likes.choose(rng) {
                return Some(Target::forced(like, variance, format!("Vibe lock (streak {})", state.streak)));
            }
            let anchor = state
                .anchor_track_id
                .as_deref()
                .and_then(|id| ctx.snapshot.library().get(id));
            if let Some(anchor) = anchor {
                return Some(Target::forced(
                    &anchor.embedding,
                    variance,
                    format!("Vibe lock on {}", anchor.label),
                ));
            }
        }

        // Centre on one recent like. Averaging distinct likes lands between them.
        if let Some(like) = likes.choose(rng) {
            let variance = if likes.len() == 1 {
                ctx.config.single_like_variance
            } else {
                algorithm::spread_variance(likes, like).max(ctx.config.min_variance)
            };
            return Some(Target {
                center: like.clone(),
                variance,
                forced: false,
                overlap_targets: likes.to_vec(),
                feature_weights: algorithm::feature_weights(likes),
                justification: format!("Similar to one of your last {} likes", likes.len()),
            });
        }

        if let Some(taste) = state.taste.get() {
            return Some(Target::single(
                taste,
                ctx.config.taste_only_variance,
                "Close to your taste".to_string(),
            ));
        }
        Self::cold_start(ctx, rng)
    }

    fn explore(ctx: &SelectionContext<'_>, rng: &mut StdRng) -> Option<Target> {
        match algorithm::mean_vector(&ctx.state.session_likes) {
            Some(mean) => Some(Target::single(
                &ctx.blend_with_taste(mean),
                ctx.config.explore_variance,
                format!("Exploring around your taste (drift {:.2})", ctx.state.exploration_drift),
            )),
            None => Self::cold_start(ctx, rng),
        }
    }
}

impl TargetStrategy for DefaultTargetStrategy {
    fn select_target(&self, ctx: &SelectionContext<'_>, phase: Phase, rng: &mut StdRng) -> Option<Target> {
        if let Some(from) = ctx.state.breakout_from {
            return Self::breakout(ctx, from, rng);
        }
        match phase {
            Phase::Probe => Self::cold_start(ctx, rng),
            Phase::Exploit => Self::exploit(ctx, rng),
            Phase::Explore => Self::explore(ctx, rng),
        }
    }
}

/// One selected track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    pub track_id: String,
    pub label: String,
    pub cluster_id: Option<ClusterId>,
    pub phase: Phase,
    pub score: f64,
    pub justification: String,
}

impl Pick {
    fn new(track: &Track, ctx: &SelectionContext<'_>, phase: Phase, score: f64, justification: String) -> Self {
        Self {
            track_id: track.id.clone(),
            label: track.label.clone(),
            cluster_id: ctx.snapshot.cluster_of(&track.id),
            phase,
            score,
            justification,
        }
    }
}

/// Choose the next track. `negatives` are the persisted exemplars of the current cluster.
pub fn select_next(
    ctx: &SelectionContext<'_>,
    strategy: &dyn TargetStrategy,
    policy: &dyn PhasePolicy,
    negatives: &[Vec<f64>],
    rng: &mut StdRng,
) -> Option<Pick> {
    let phase = policy.decide(ctx.state, rng);
    let library = ctx.snapshot.library();

    if let Some(target) = strategy.select_target(ctx, phase, rng) {
        debug!("{phase} target: {} (variance {:.3})", target.justification, target.variance);

        let candidates: Vec<(usize, &[f64])> = library
            .tracks()
            .iter()
            .enumerate()
            .filter(|(_, t)| ctx.passes_soft_filters(t))
            .map(|(i, t)| (i, t.embedding.as_slice()))
            .collect();

        let repulsors: Vec<Vec<f64>> = ctx
            .state
            .session_dislikes
            .iter()
            .chain(negatives)
            .cloned()
            .collect();
        let no_overlap: &[Vec<f64>] = &[];
        let (weights, overlap) = if target.forced {
            (None, no_overlap)
        } else {
            (target.feature_weights.clone(), target.overlap_targets.as_slice())
        };
        let kernel = Kernel::new(&target.center, target.variance, *ctx.scoring)
            .with_weights(weights)
            .with_negatives(&repulsors)
            .with_overlap_targets(overlap);

        let mut ordered: Vec<(usize, f64, String)> = Vec::new();
        let last_like = ctx.state.session_likes.last();
        if let (Phase::Exploit, Some(last_like)) = (phase, last_like) {
            if rng.gen::<f64>() < ctx.config.probe_chance {
                let count = rng.gen_range(1..=ctx.config.max_probes.max(1));
                let neighbors =
                    Kernel::new(last_like, ctx.config.probe_variance, *ctx.scoring).with_negatives(&repulsors);
                for (idx, breakdown) in neighbors.rank(&candidates).into_iter().take(count) {
                    ordered.push((idx, breakdown.score, "Neighbor of your last like".to_string()));
                }
                trace!("Injected {} neighbors of the last like", ordered.len());
            }
        }
        for (idx, breakdown) in kernel.rank(&candidates).into_iter().take(ctx.config.candidate_pool) {
            ordered.push((idx, breakdown.score, target.justification.clone()));
        }

        for (idx, score, why) in ordered {
            let track = &library.tracks()[idx];
            if ctx.is_duplicate(track) {
                trace!("Dropping near-duplicate {}", track.id);
                continue;
            }
            return Some(Pick::new(track, ctx, phase, score, why));
        }
        debug!("No candidate survived filtering, falling back");
    }

    nearest_cluster_fallback(ctx, phase).or_else(|| random_fallback(ctx, phase, rng))
}

/// Closest-to-centroid member of the nearest other cluster that passes every filter.
fn nearest_cluster_fallback(ctx: &SelectionContext<'_>, phase: Phase) -> Option<Pick> {
    let library = ctx.snapshot.library();
    let order: Vec<ClusterId> = match ctx.state.current_cluster_id.or(ctx.state.breakout_from) {
        Some(origin) => ctx.snapshot.clusters_by_distance_from(origin),
        None => ctx.snapshot.cluster_ids().collect(),
    };
    for cluster in order {
        let found = ctx
            .snapshot
            .tracks_in(cluster)
            .iter()
            .filter_map(|id| library.get(id))
            .find(|t| ctx.is_selectable(t));
        if let Some(track) = found {
            return Some(Pick::new(track, ctx, phase, 0.0, format!("Nearest alternative cluster {cluster}")));
        }
    }
    None
}

fn random_fallback(ctx: &SelectionContext<'_>, phase: Phase, rng: &mut StdRng) -> Option<Pick> {
    let remaining: Vec<&Track> = ctx
        .snapshot
        .library()
        .tracks()
        .iter()
        .filter(|t| ctx.passes_hard_filters(t))
        .collect();
    let track = remaining.choose(rng)?;
    Some(Pick::new(track, ctx, phase, 0.0, "Random pick from what is left".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::BanditConfig;
    use crate::cluster::ClusterConfig;
    use crate::library::Library;
    use crate::session::{DefaultPhasePolicy, SessionTuning};
    use rand::SeedableRng;
    use std::sync::Arc;

    /// Two clusters of five: A on dimensions 0..6, B on 6..12.
    fn snapshot() -> ClusterSnapshot {
        let mut tracks = Vec::new();
        for (prefix, base) in [("a", 0), ("b", 6)] {
            for i in 0..5 {
                let mut v = vec![0.0; 12];
                v[base] = 1.0;
                v[base + 1 + i] = 0.4 + 0.05 * i as f64;
                tracks.push(Track::new(format!("{prefix}{i}"), format!("{prefix} song {i}"), v));
            }
        }
        ClusterSnapshot::fit(
            Arc::new(Library::new(tracks)),
            &ClusterConfig { k: 2, ..ClusterConfig::default() },
        )
    }

    struct Fixture {
        snapshot: ClusterSnapshot,
        state: SessionState,
        bandit: BanditSelector,
        config: QueueConfig,
        scoring: ScoringContext,
        policy: DefaultPhasePolicy,
    }

    impl Fixture {
        fn new() -> Self {
            let snapshot = snapshot();
            let bandit = BanditSelector::new(snapshot.cluster_ids(), &BanditConfig::default());
            Self {
                snapshot,
                state: SessionState::new(&SessionTuning::default(), HashSet::new()),
                bandit,
                config: QueueConfig::default(),
                scoring: ScoringContext::default(),
                policy: DefaultPhasePolicy::new(SessionTuning::default()),
            }
        }

        fn ctx(&self, mode: AvailabilityMode) -> SelectionContext<'_> {
            SelectionContext {
                snapshot: &self.snapshot,
                state: &self.state,
                bandit: &self.bandit,
                mode,
                config: &self.config,
                scoring: &self.scoring,
            }
        }

        fn next(&mut self, rng: &mut StdRng) -> Option<Pick> {
            let pick = select_next(&self.ctx(AvailabilityMode::Any), &DefaultTargetStrategy, &self.policy, &[], rng)?;
            let track = self.snapshot.library().get(&pick.track_id).cloned()?;
            self.state.record_pick(&track, pick.cluster_id);
            Some(pick)
        }

        fn track(&self, id: &str) -> Track {
            self.snapshot.library().get(id).cloned().expect("fixture track exists")
        }
    }

    #[test]
    fn test_cold_start_picks_something() {
        let mut fixture = Fixture::new();
        let mut rng = StdRng::seed_from_u64(11);
        let pick = fixture.next(&mut rng).expect("library is not empty");
        assert_eq!(pick.phase, Phase::Probe);
        assert!(pick.justification.starts_with("Cold start"));
    }

    #[test]
    fn test_locked_session_stays_in_cluster() {
        let mut fixture = Fixture::new();
        let tuning = SessionTuning::default();
        let a0 = fixture.track("a0");
        let a_cluster = fixture.snapshot.cluster_of("a0");
        fixture.state.seed(&a0, a_cluster, &tuning);

        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..4 {
            let pick = fixture.next(&mut rng).expect("cluster A still has tracks");
            assert_eq!(pick.cluster_id, a_cluster, "Locked picks stay in the locked cluster");
            assert_eq!(pick.phase, Phase::Exploit);
        }
    }

    #[test]
    fn test_never_repeats_and_exhausts_cleanly() {
        let mut fixture = Fixture::new();
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = HashSet::new();
        while let Some(pick) = fixture.next(&mut rng) {
            assert!(seen.insert(pick.track_id.clone()), "Track {} returned twice", pick.track_id);
        }
        assert_eq!(seen.len(), 10, "Fallbacks should reach every track before giving up");
    }

    #[test]
    fn test_duplicate_filter_excludes_near_copies() {
        let fixture = Fixture::new();
        let mut state = fixture.state.clone();
        let a0 = fixture.track("a0");
        state.record_pick(&a0, None);
        let ctx = SelectionContext { state: &state, ..fixture.ctx(AvailabilityMode::Any) };

        let mut twin = a0.clone();
        twin.id = "twin".to_string();
        twin.embedding[0] = 1.001;
        assert!(ctx.is_duplicate(&twin), "Near copy of a recent pick is a duplicate");
        assert!(!ctx.is_duplicate(&fixture.track("a1")), "Cluster mates are not duplicates");
    }

    #[test]
    fn test_hard_filters() {
        let fixture = Fixture::new();
        let mut state = fixture.state.clone();
        state.global_dislikes.insert("a1".to_string());
        state.played_labels.insert("a song 2".to_string());
        let ctx = SelectionContext { state: &state, ..fixture.ctx(AvailabilityMode::StreamOnly) };
        assert!(!ctx.passes_hard_filters(&fixture.track("a0")), "No stream id in stream-only mode");

        let ctx = SelectionContext { state: &state, ..fixture.ctx(AvailabilityMode::Any) };
        assert!(ctx.passes_hard_filters(&fixture.track("a0")));
        assert!(!ctx.passes_hard_filters(&fixture.track("a1")), "Globally disliked");
        assert!(!ctx.passes_hard_filters(&fixture.track("a2")), "Label already played");
    }

    #[test]
    fn test_breakout_leaves_exhausted_cluster() {
        let mut fixture = Fixture::new();
        let a_cluster = fixture.snapshot.cluster_of("a0").expect("assigned");
        fixture.state.breakout_from = Some(a_cluster);
        fixture.state.exploration_drift = 1.0;
        fixture.state.session_likes.push(fixture.track("a0").embedding);

        let mut rng = StdRng::seed_from_u64(21);
        let pick = fixture.next(&mut rng).expect("cluster B is untouched");
        assert_eq!(pick.phase, Phase::Explore);
        assert_ne!(pick.cluster_id, Some(a_cluster));
        assert!(fixture.state.breakout_from.is_none(), "Breakout is consumed by the pick");
    }

    #[test]
    fn test_stream_only_mode_returns_none_without_streams() {
        let fixture = Fixture::new();
        let mut rng = StdRng::seed_from_u64(1);
        let pick = select_next(
            &fixture.ctx(AvailabilityMode::StreamOnly),
            &DefaultTargetStrategy,
            &fixture.policy,
            &[],
            &mut rng,
        );
        assert!(pick.is_none(), "No track is streamable");
    }

    #[test]
    fn test_unlocked_exploit_targets_a_single_like() {
        let mut fixture = Fixture::new();
        let a0 = fixture.track("a0").embedding;
        let b0 = fixture.track("b0").embedding;
        fixture.state.session_likes.push(a0.clone());
        fixture.state.session_likes.push(b0.clone());
        let midpoint: Vec<f64> = a0.iter().zip(&b0).map(|(a, b)| (a + b) / 2.0).collect();

        for seed in 0..8 {
            let mut rng = StdRng::seed_from_u64(seed);
            let target = DefaultTargetStrategy
                .select_target(&fixture.ctx(AvailabilityMode::Any), Phase::Exploit, &mut rng)
                .expect("likes give a target");
            assert!(
                target.center == a0 || target.center == b0,
                "Target should be one of the likes, got {:?}",
                target.center
            );
            assert_ne!(target.center, midpoint, "Distinct likes must not be averaged");
            assert!(!target.forced);
            assert_eq!(target.overlap_targets.len(), 2);
            assert!(target.feature_weights.is_some());
            assert!(target.variance >= fixture.config.min_variance);
        }
    }

    /// Fixture whose user has listening history with cluster B only.
    fn fixture_with_b_history() -> (Fixture, ClusterId) {
        let mut fixture = Fixture::new();
        let b_cluster = fixture.snapshot.cluster_of("b0").expect("assigned");
        let history = vec![crate::db::AffinityRecord {
            user_id: "u".to_string(),
            cluster_id: b_cluster,
            collection: "c".to_string(),
            positive_count: 3,
            total_listen_seconds: 600.0,
            track_count: 3,
            last_positive_ts: None,
        }];
        fixture.bandit.seed_from_history(&history, &BanditConfig::default());
        (fixture, b_cluster)
    }

    #[test]
    fn test_cold_start_only_draws_clusters_with_history() {
        let (fixture, b_cluster) = fixture_with_b_history();

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let target = DefaultTargetStrategy
                .select_target(&fixture.ctx(AvailabilityMode::Any), Phase::Probe, &mut rng)
                .expect("history gives a target");
            assert!(
                target.justification.contains(&format!("cluster {b_cluster}")),
                "Cold start should come from the only historical cluster: {}",
                target.justification
            );
        }
    }

    #[test]
    fn test_neighbor_picks_avoid_negative_exemplars() {
        let mut fixture = Fixture::new();
        fixture.config.probe_chance = 1.0;
        fixture.config.max_probes = 1;
        let a0 = fixture.track("a0");
        fixture.state.record_pick(&a0, fixture.snapshot.cluster_of("a0"));
        fixture.state.session_likes.push(a0.embedding.clone());
        fixture.state.streak = 1;
        let negatives = vec![fixture.track("a1").embedding];

        let mut rng = StdRng::seed_from_u64(4);
        let pick = select_next(
            &fixture.ctx(AvailabilityMode::Any),
            &DefaultTargetStrategy,
            &fixture.policy,
            &negatives,
            &mut rng,
        )
        .expect("cluster A still has tracks");
        assert_eq!(pick.phase, Phase::Exploit);
        assert_eq!(pick.justification, "Neighbor of your last like");
        assert_ne!(pick.track_id, "a1", "The closest neighbour sits on a negative exemplar");
    }

    #[test]
    fn test_history_cold_start_leans_to_persisted_centroid() {
        let (mut fixture, b_cluster) = fixture_with_b_history();
        let mut centroid = vec![0.0; 12];
        centroid[5] = 1.0;
        fixture.state.history_centroids.insert(b_cluster, centroid);

        let mut rng = StdRng::seed_from_u64(9);
        let target = DefaultTargetStrategy
            .select_target(&fixture.ctx(AvailabilityMode::Any), Phase::Probe, &mut rng)
            .expect("history gives a target");
        assert!(
            (target.center[5] - fixture.config.taste_blend).abs() < 1e-12,
            "The stored centroid should pull the anchor by the taste blend weight"
        );
        assert!((target.center[6] - (1.0 - fixture.config.taste_blend)).abs() < 1e-12, "The anchor still dominates");
        assert!(target.justification.ends_with("leaning to your past taste"));
    }
}
