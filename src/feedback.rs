//! # Feedback Module
//!
//! Turns raw engagement (listen seconds plus optional like/dislike/finished flags)
//! into one [`Signal`], applies its [`Reinforcement`] to the session and bandit, then
//! runs the registered [`FeedbackHook`]s in order.
//!
//! ## Classification
//!
//! First match wins:
//!
//! | Signal         | Condition                                           |
//! |----------------|-----------------------------------------------------|
//! | StrongNegative | explicit dislike, or under 5 s                      |
//! | Finished       | ≥ 90 % played, ≥ 120 s, or the finished flag        |
//! | Liked          | explicit like, ≥ 45 s, or ≥ 40 % played             |
//! | WeakPositive   | ≥ 15 s or ≥ 10 % played                             |
//! | SoftNegative   | anything else                                       |
//!
//! When no total length is known the track is assumed to last 180 seconds.

use crate::bandit::BanditSelector;
use crate::cluster::{ClusterId, ClusterSnapshot};
use crate::library::{Track, TrackId};
use crate::session::{SessionState, SessionTuning, Transition};
use crate::taste::LearningRates;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// One engagement report from the caller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Feedback {
    pub track_id: TrackId,
    /// Seconds the user actually listened.
    pub listened_seconds: f64,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub disliked: bool,
    #[serde(default)]
    pub finished: bool,
    /// Known total length, overriding the library's duration.
    #[serde(default)]
    pub total_duration: Option<f64>,
}

impl Feedback {
    #[must_use]
    pub fn listened(track_id: impl Into<TrackId>, seconds: f64) -> Self {
        Self {
            track_id: track_id.into(),
            listened_seconds: seconds,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn like(mut self) -> Self {
        self.liked = true;
        self
    }

    #[must_use]
    pub fn dislike(mut self) -> Self {
        self.disliked = true;
        self
    }

    #[must_use]
    pub fn finish(mut self) -> Self {
        self.finished = true;
        self
    }

    #[must_use]
    pub fn with_total(mut self, seconds: f64) -> Self {
        self.total_duration = Some(seconds);
        self
    }
}

/// Classification thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub instant_skip_secs: f64,
    pub finished_ratio: f64,
    pub finished_secs: f64,
    pub liked_secs: f64,
    pub liked_ratio: f64,
    pub weak_secs: f64,
    pub weak_ratio: f64,
    pub default_track_secs: f64,
    /// β added to a cluster when its lock is exhausted.
    pub exhaustion_beta: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            instant_skip_secs: 5.0,
            finished_ratio: 0.90,
            finished_secs: 120.0,
            liked_secs: 45.0,
            liked_ratio: 0.40,
            weak_secs: 15.0,
            weak_ratio: 0.10,
            default_track_secs: 180.0,
            exhaustion_beta: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    StrongNegative,
    Finished,
    Liked,
    WeakPositive,
    SoftNegative,
}

impl Signal {
    #[must_use]
    pub fn is_positive(self) -> bool {
        matches!(self, Self::Finished | Self::Liked | Self::WeakPositive)
    }

    #[must_use]
    pub fn is_negative(self) -> bool {
        !self.is_positive()
    }

    /// Counts toward cluster success and persisted positive affinity.
    #[must_use]
    pub fn is_strong_positive(self) -> bool {
        matches!(self, Self::Finished | Self::Liked)
    }

    #[must_use]
    pub fn reinforcement(self) -> Reinforcement {
        let (alpha_delta, taste_direction, drift_locked, drift_unlocked, exhaustion_direction) = match self {
            Self::StrongNegative => (0.0, -1.0, -0.10, 0.10, -1.0),
            Self::Finished | Self::Liked => (1.0, 1.0, -0.50, -0.50, 0.0),
            Self::WeakPositive => (0.2, 0.3, -0.05, -0.05, 0.0),
            Self::SoftNegative => (0.0, -1.0, 0.15, 0.15, -0.8),
        };
        Reinforcement {
            signal: self,
            alpha_delta,
            beta_delta: 0.0,
            taste_direction,
            drift_locked,
            drift_unlocked,
            exhaustion_direction,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StrongNegative => "strong negative",
            Self::Finished => "finished",
            Self::Liked => "liked",
            Self::WeakPositive => "weak positive",
            Self::SoftNegative => "soft negative",
        };
        f.write_str(name)
    }
}

/// What one signal does to the learning state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reinforcement {
    pub signal: Signal,
    pub alpha_delta: f64,
    pub beta_delta: f64,
    pub taste_direction: f64,
    /// Drift change while the session is vibe-locked.
    pub drift_locked: f64,
    pub drift_unlocked: f64,
    /// Taste direction used instead of `taste_direction` when the lock breaks.
    pub exhaustion_direction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub signal: Signal,
    /// Share of the track that was played, in `[0, ∞)`.
    pub percent: f64,
    pub total_seconds: f64,
}

#[must_use]
pub fn classify(feedback: &Feedback, track_duration: Option<f64>, config: &FeedbackConfig) -> Classification {
    let total_seconds = feedback
        .total_duration
        .or(track_duration)
        .filter(|d| *d > 0.0)
        .unwrap_or(config.default_track_secs);
    let seconds = feedback.listened_seconds.max(0.0);
    let percent = seconds / total_seconds;

    let signal = if feedback.disliked || seconds < config.instant_skip_secs {
        Signal::StrongNegative
    } else if percent >= config.finished_ratio || seconds >= config.finished_secs || feedback.finished {
        Signal::Finished
    } else if feedback.liked || seconds >= config.liked_secs || percent >= config.liked_ratio {
        Signal::Liked
    } else if seconds >= config.weak_secs || percent >= config.weak_ratio {
        Signal::WeakPositive
    } else {
        Signal::SoftNegative
    };

    Classification { signal, percent, total_seconds }
}

/// Result of interpreting one feedback event.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackOutcome {
    pub classification: Classification,
    pub cluster_id: Option<ClusterId>,
    /// The session was vibe-locked before this event.
    pub was_locked: bool,
    pub transition: Transition,
}

impl FeedbackOutcome {
    #[must_use]
    pub fn signal(&self) -> Signal {
        self.classification.signal
    }
}

/// Read-only view handed to hooks alongside the mutable learning state.
pub struct FeedbackEvent<'a> {
    pub feedback: &'a Feedback,
    pub track: &'a Track,
    pub outcome: &'a FeedbackOutcome,
    pub snapshot: &'a ClusterSnapshot,
    pub config: &'a FeedbackConfig,
}

/// Behaviour that runs after the built-in feedback update.
pub trait FeedbackHook: Send + Sync {
    fn name(&self) -> &str;

    fn after_feedback(&self, event: &FeedbackEvent<'_>, state: &mut SessionState, bandit: &mut BanditSelector);
}

/// Reacts to an instant skip by leaning back toward the last liked cluster.
///
/// Appends 1 to 3 copies of the most recent like from a different cluster to the
/// session likes and adds β to the skipped cluster.
#[derive(Debug, Clone, Copy)]
pub struct SkipRebalanceHook {
    pub beta_penalty: f64,
    pub max_copies: usize,
}

impl Default for SkipRebalanceHook {
    fn default() -> Self {
        Self { beta_penalty: 0.5, max_copies: 3 }
    }
}

impl FeedbackHook for SkipRebalanceHook {
    fn name(&self) -> &str {
        "skip-rebalance"
    }

    fn after_feedback(&self, event: &FeedbackEvent<'_>, state: &mut SessionState, bandit: &mut BanditSelector) {
        if event.feedback.disliked || event.feedback.listened_seconds >= event.config.instant_skip_secs {
            return;
        }
        let Some(skipped) = event.outcome.cluster_id else {
            return;
        };

        let no_skip = HashSet::new();
        let alternative = state.session_likes.iter().rev().find_map(|like| {
            event
                .snapshot
                .nearest_cluster(like, &no_skip)
                .filter(|&c| c != skipped)
                .map(|c| (c, like.clone()))
        });

        if let Some((cluster, like)) = alternative {
            let ratios = state.like_ratios(event.snapshot);
            let skipped_share = ratios.get(&skipped).copied().unwrap_or(0.0);
            let alternative_share = ratios.get(&cluster).copied().unwrap_or(0.0);

            let mut copies = if skipped_share > 0.6 { 2 } else { 1 };
            if state.streak > 2 {
                copies += 1;
            }
            if skipped_share - alternative_share > 0.3 {
                copies += 1;
            }
            let copies = copies.min(self.max_copies);
            state.session_likes.extend(std::iter::repeat(like).take(copies));
            debug!("Instant skip on cluster {skipped}: rebalanced toward cluster {cluster} with {copies} copies");
        }

        bandit.update(skipped, 0.0, self.beta_penalty);
    }
}

/// Classifies feedback and applies it to a session.
pub struct FeedbackInterpreter {
    config: FeedbackConfig,
    hooks: Vec<Box<dyn FeedbackHook>>,
}

impl fmt::Debug for FeedbackInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackInterpreter")
            .field("config", &self.config)
            .field("hooks", &self.hook_names())
            .finish()
    }
}

impl FeedbackInterpreter {
    #[must_use]
    pub fn new(config: FeedbackConfig) -> Self {
        Self { config, hooks: Vec::new() }
    }

    /// Append a hook. Hooks run in registration order.
    pub fn register(&mut self, hook: Box<dyn FeedbackHook>) {
        self.hooks.push(hook);
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Box<dyn FeedbackHook>) -> Self {
        self.register(hook);
        self
    }

    #[must_use]
    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    #[must_use]
    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    #[must_use]
    pub fn classify(&self, feedback: &Feedback, track: &Track) -> Classification {
        classify(feedback, track.duration, &self.config)
    }

    /// Apply `feedback` on `track` to the session and bandit, then run the hooks.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &self,
        feedback: &Feedback,
        track: &Track,
        snapshot: &ClusterSnapshot,
        state: &mut SessionState,
        bandit: &mut BanditSelector,
        tuning: &SessionTuning,
        rates: &LearningRates,
    ) -> FeedbackOutcome {
        let classification = self.classify(feedback, track);
        let reinforcement = classification.signal.reinforcement();
        let cluster_id = snapshot.cluster_of(&track.id);
        if cluster_id.is_some() {
            state.current_cluster_id = cluster_id;
        }

        let was_locked = state.is_locked();
        let transition = state.record_feedback(track, &reinforcement, tuning, rates);

        if let Some(cluster) = cluster_id {
            bandit.update(cluster, reinforcement.alpha_delta, reinforcement.beta_delta);
        }
        if let Transition::Exhausted { cluster: Some(exhausted) } = transition {
            bandit.update(exhausted, 0.0, self.config.exhaustion_beta);
            info!("Cluster {exhausted} exhausted, breaking out");
        }
        debug!(
            "Feedback on {} ({:.0}s, {:.0}%): {} -> {transition:?}",
            track.id,
            feedback.listened_seconds,
            classification.percent * 100.0,
            classification.signal
        );

        let outcome = FeedbackOutcome { classification, cluster_id, was_locked, transition };
        let event = FeedbackEvent {
            feedback,
            track,
            outcome: &outcome,
            snapshot,
            config: &self.config,
        };
        for hook in &self.hooks {
            hook.after_feedback(&event, state, bandit);
        }
        outcome
    }
}
