//! # Session Module
//!
//! Per-session learning state and the PROBE / EXPLOIT / EXPLORE state machine.
//!
//! A session is "vibe-locked" while `streak > 0`. Positives deepen the lock, negatives
//! count toward exhausting it. Once `cluster_fail_count` reaches the exhaustion
//! threshold the lock breaks: streak and counters reset, drift jumps to 1.0 and the
//! next request explores away from the exhausted cluster.

use crate::cluster::{ClusterId, ClusterSnapshot};
use crate::feedback::Reinforcement;
use crate::library::{Track, TrackId};
use crate::taste::{LearningRates, TasteVector};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// No signal yet.
    Probe,
    /// Stay close to what the user liked.
    Exploit,
    /// Wander away from the current lock.
    Explore,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Probe => "PROBE",
            Self::Exploit => "EXPLOIT",
            Self::Explore => "EXPLORE",
        })
    }
}

/// State-machine constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    /// Consecutive negatives that break a lock.
    pub exhaustion_threshold: u32,
    /// Streak and success count installed by a manual seed.
    pub deep_lock: u32,
    pub seed_like_copies: usize,
    pub seed_alpha_boost: f64,
    /// Session dislikes kept as negative exemplars.
    pub dislike_memory: usize,
    /// Recent picks checked for near-duplicates.
    pub duplicate_window: usize,
    pub exploit_probability: f64,
    pub bored_exploit_probability: f64,
    /// Drift above which an unlocked, failing session counts as bored.
    pub boredom_drift: f64,
    pub boredom_fail_count: u32,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            exhaustion_threshold: 5,
            deep_lock: 5,
            seed_like_copies: 5,
            seed_alpha_boost: 5.0,
            dislike_memory: 50,
            duplicate_window: 50,
            exploit_probability: 0.8,
            bored_exploit_probability: 0.4,
            boredom_drift: 0.7,
            boredom_fail_count: 1,
        }
    }
}

/// How one feedback event moved the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Positive signal; the lock deepened (or formed).
    Reinforced,
    /// Negative below the exhaustion threshold while locked.
    Held,
    /// Negative while unlocked.
    Drifting,
    /// The lock broke; `cluster` is where it broke.
    Exhausted { cluster: Option<ClusterId> },
}

/// Mutable learning state of one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub taste: TasteVector,
    pub streak: u32,
    pub cluster_consecutive_success: u32,
    pub cluster_fail_count: u32,
    /// Always within `[0, 1]`.
    pub exploration_drift: f64,
    pub current_cluster_id: Option<ClusterId>,
    pub anchor_track_id: Option<TrackId>,
    pub session_likes: Vec<Vec<f64>>,
    /// Most recent dislikes, oldest first, capped at `dislike_memory`.
    pub session_dislikes: VecDeque<Vec<f64>>,
    pub played_ids: HashSet<TrackId>,
    pub played_labels: HashSet<String>,
    /// Embeddings of recent picks, oldest first.
    pub recent_history: VecDeque<Vec<f64>>,
    pub global_dislikes: HashSet<TrackId>,
    /// Set when a lock is exhausted; the next pick explores away from it.
    pub breakout_from: Option<ClusterId>,
    /// Persisted taste centroids of the user's historical clusters.
    pub history_centroids: HashMap<ClusterId, Vec<f64>>,
    history_window: usize,
    dislike_memory: usize,
}

impl SessionState {
    #[must_use]
    pub fn new(tuning: &SessionTuning, global_dislikes: HashSet<TrackId>) -> Self {
        Self {
            taste: TasteVector::new(),
            streak: 0,
            cluster_consecutive_success: 0,
            cluster_fail_count: 0,
            exploration_drift: 0.0,
            current_cluster_id: None,
            anchor_track_id: None,
            session_likes: Vec::new(),
            session_dislikes: VecDeque::new(),
            played_ids: HashSet::new(),
            played_labels: HashSet::new(),
            recent_history: VecDeque::new(),
            global_dislikes,
            breakout_from: None,
            history_centroids: HashMap::new(),
            history_window: tuning.duplicate_window,
            dislike_memory: tuning.dislike_memory,
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.streak > 0
    }

    /// No taste, no likes and no anchor: nothing to exploit yet.
    #[must_use]
    pub fn is_cold(&self) -> bool {
        !self.taste.is_set() && self.session_likes.is_empty() && self.anchor_track_id.is_none()
    }

    #[must_use]
    pub fn feedback_events(&self) -> usize {
        self.session_likes.len() + self.session_dislikes.len()
    }

    /// The last `n` likes, oldest first.
    #[must_use]
    pub fn recent_likes(&self, n: usize) -> &[Vec<f64>] {
        let start = self.session_likes.len().saturating_sub(n);
        &self.session_likes[start..]
    }

    #[must_use]
    pub fn has_played(&self, track: &Track) -> bool {
        self.played_ids.contains(&track.id) || self.played_labels.contains(&track.label)
    }

    /// Record `track` as played and remember its embedding for duplicate checks.
    pub fn mark_played(&mut self, track: &Track) {
        self.played_ids.insert(track.id.clone());
        self.played_labels.insert(track.label.clone());
        self.recent_history.push_back(track.embedding.clone());
        while self.recent_history.len() > self.history_window {
            self.recent_history.pop_front();
        }
    }

    /// Bookkeeping after a track is handed to the caller.
    pub fn record_pick(&mut self, track: &Track, cluster: Option<ClusterId>) {
        self.mark_played(track);
        if cluster.is_some() {
            self.current_cluster_id = cluster;
        }
        self.breakout_from = None;
    }

    fn remember_dislike(&mut self, track: &Track) {
        self.session_dislikes.push_back(track.embedding.clone());
        while self.session_dislikes.len() > self.dislike_memory {
            self.session_dislikes.pop_front();
        }
        self.global_dislikes.insert(track.id.clone());
    }

    fn shift_drift(&mut self, delta: f64) {
        self.exploration_drift = (self.exploration_drift + delta).clamp(0.0, 1.0);
    }

    /// Apply one classified feedback event.
    pub fn record_feedback(
        &mut self,
        track: &Track,
        reinforcement: &Reinforcement,
        tuning: &SessionTuning,
        rates: &LearningRates,
    ) -> Transition {
        let was_locked = self.is_locked();
        self.mark_played(track);

        if reinforcement.signal.is_positive() {
            self.streak += 1;
            if reinforcement.signal.is_strong_positive() {
                self.cluster_consecutive_success += 1;
            }
            self.cluster_fail_count = 0;
            self.anchor_track_id = Some(track.id.clone());
            self.session_likes.push(track.embedding.clone());
            self.breakout_from = None;
            self.shift_drift(reinforcement.drift_locked);
            let early = rates.is_early(self.feedback_events());
            self.taste.update(&track.embedding, reinforcement.taste_direction, early, rates);
            if !was_locked {
                info!("Vibe lock formed on track {}", track.id);
            }
            return Transition::Reinforced;
        }

        self.cluster_fail_count += 1;
        self.remember_dislike(track);
        let early = rates.is_early(self.feedback_events());

        if self.cluster_fail_count >= tuning.exhaustion_threshold {
            self.streak = 0;
            self.cluster_consecutive_success = 0;
            self.cluster_fail_count = 0;
            self.exploration_drift = 1.0;
            self.breakout_from = self.current_cluster_id;
            self.taste.update(&track.embedding, reinforcement.exhaustion_direction, early, rates);
            info!("Vibe lock exhausted on cluster {:?}", self.current_cluster_id);
            return Transition::Exhausted { cluster: self.current_cluster_id };
        }

        let delta = if was_locked { reinforcement.drift_locked } else { reinforcement.drift_unlocked };
        self.shift_drift(delta);
        self.taste.update(&track.embedding, reinforcement.taste_direction, early, rates);
        debug!(
            "Negative on {} (fail {}/{}), drift {:.2}",
            track.id, self.cluster_fail_count, tuning.exhaustion_threshold, self.exploration_drift
        );
        if was_locked {
            Transition::Held
        } else {
            Transition::Drifting
        }
    }

    /// Manual seed: lock hard onto `track`.
    pub fn seed(&mut self, track: &Track, cluster: Option<ClusterId>, tuning: &SessionTuning) {
        self.taste.set(&track.embedding);
        self.streak = tuning.deep_lock;
        self.cluster_consecutive_success = tuning.deep_lock;
        self.cluster_fail_count = 0;
        self.exploration_drift = 0.0;
        self.anchor_track_id = Some(track.id.clone());
        self.mark_played(track);
        self.session_likes = vec![track.embedding.clone(); tuning.seed_like_copies];
        if cluster.is_some() {
            self.current_cluster_id = cluster;
        }
        self.breakout_from = None;
        info!("Session seeded with track {}", track.id);
    }

    /// Share of session likes whose nearest centroid is each cluster.
    #[must_use]
    pub fn like_ratios(&self, snapshot: &ClusterSnapshot) -> HashMap<ClusterId, f64> {
        let mut counts: HashMap<ClusterId, usize> = HashMap::new();
        let no_skip = HashSet::new();
        for like in &self.session_likes {
            if let Some(cluster) = snapshot.nearest_cluster(like, &no_skip) {
                *counts.entry(cluster).or_default() += 1;
            }
        }
        let total = self.session_likes.len().max(1) as f64;
        counts.into_iter().map(|(c, n)| (c, n as f64 / total)).collect()
    }
}

/// Decides which phase serves the next request.
pub trait PhasePolicy: Send + Sync + fmt::Debug {
    /// Probability of exploiting when neither PROBE nor a breakout applies.
    fn exploit_probability(&self, state: &SessionState) -> f64;

    fn decide(&self, state: &SessionState, rng: &mut StdRng) -> Phase {
        if state.breakout_from.is_some() {
            return Phase::Explore;
        }
        if !state.taste.is_set() && state.session_likes.is_empty() {
            return Phase::Probe;
        }
        if rng.gen::<f64>() < self.exploit_probability(state) {
            Phase::Exploit
        } else {
            Phase::Explore
        }
    }
}

/// Exploit 80 % of the time, always while locked, 40 % when bored.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPhasePolicy {
    tuning: SessionTuning,
}

impl DefaultPhasePolicy {
    #[must_use]
    pub fn new(tuning: SessionTuning) -> Self {
        Self { tuning }
    }
}

impl PhasePolicy for DefaultPhasePolicy {
    fn exploit_probability(&self, state: &SessionState) -> f64 {
        if state.streak >= 1 || state.cluster_consecutive_success >= 1 {
            1.0
        } else if state.exploration_drift > self.tuning.boredom_drift
            && state.cluster_fail_count > self.tuning.boredom_fail_count
        {
            self.tuning.bored_exploit_probability
        } else {
            self.tuning.exploit_probability
        }
    }
}

/// Persisted negative exemplars of one cluster, loaded on demand.
#[derive(Debug, Clone, Default)]
pub struct NegativeCache {
    cluster: Option<ClusterId>,
    vectors: Vec<Vec<f64>>,
}

impl NegativeCache {
    /// Exemplars for `cluster`, reloading through `load` when the cluster changed.
    pub fn ensure<F>(&mut self, cluster: ClusterId, load: F) -> &[Vec<f64>]
    where
        F: FnOnce(ClusterId) -> Vec<Vec<f64>>,
    {
        if self.cluster != Some(cluster) {
            self.vectors = load(cluster);
            self.cluster = Some(cluster);
        }
        &self.vectors
    }

    /// Record a fresh exemplar without a reload. Ignored for other clusters.
    pub fn push(&mut self, cluster: ClusterId, vector: Vec<f64>) {
        if self.cluster == Some(cluster) {
            self.vectors.push(vector);
        }
    }

    pub fn invalidate(&mut self) {
        self.cluster = None;
        self.vectors.clear();
    }

    #[must_use]
    pub fn cluster(&self) -> Option<ClusterId> {
        self.cluster
    }
}
