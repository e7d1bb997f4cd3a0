//! # Engine Module
//!
//! The caller-facing contract. An [`Engine`] owns the cluster snapshots (one per
//! collection), the affinity store and the live sessions.
//!
//! ## Sessions
//!
//! Every session sits behind its own `Mutex` and handles one request at a time.
//! Sessions share nothing mutable: each has its own state, bandit, RNG and negative
//! exemplar cache. Snapshots are shared read-only through `Arc`.
//!
//! ## Persistence
//!
//! Store writes are best effort. A failing store logs a warning and the in-memory
//! session state stands. The `guest` user never touches the store.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vibelock::config::EngineConfig;
//! use vibelock::db::MemoryAffinityStore;
//! use vibelock::engine::Engine;
//! use vibelock::feedback::Feedback;
//! use vibelock::library::{AvailabilityMode, JsonLibrarySource};
//!
//! let engine = Engine::builder(
//!     Arc::new(JsonLibrarySource::new("library.json")),
//!     Arc::new(MemoryAffinityStore::new()),
//! )
//! .with_config(EngineConfig::default().with_seed(7))
//! .build();
//!
//! let session = engine.create_session("alice", "default", AvailabilityMode::Any)?;
//! if let Some(pick) = engine.next(session)? {
//!     engine.feedback(session, Feedback::listened(pick.track_id, 130.0))?;
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::bandit::BanditSelector;
use crate::cluster::{ClusterId, ClusterSnapshot, SnapshotHandle};
use crate::config::EngineConfig;
use crate::db::{AffinityRecord, AffinityStore, Interaction, InteractionAction, NEGATIVE_READ_LIMIT};
use crate::feedback::{Feedback, FeedbackHook, FeedbackInterpreter, FeedbackOutcome, SkipRebalanceHook};
use crate::library::{load_library, AvailabilityMode, LibrarySource, Track, TrackId};
use crate::queue::{select_next, DefaultTargetStrategy, Pick, SelectionContext, TargetStrategy};
use crate::session::{DefaultPhasePolicy, NegativeCache, Phase, PhasePolicy, SessionState};
use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

pub type SessionId = u64;

/// The one user whose sessions never read or write persistence.
pub const GUEST_USER: &str = "guest";

/// Weight of a taste sample in the persisted centroid average (floored by the store).
const CENTROID_SAMPLE_WEIGHT: f64 = 0.1;

/// Search result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub id: TrackId,
    pub label: String,
    pub stream_id: Option<String>,
    pub cluster_id: Option<ClusterId>,
}

/// One listening session.
pub struct Session {
    id: SessionId,
    user: String,
    collection: String,
    mode: AvailabilityMode,
    snapshot: Arc<ClusterSnapshot>,
    state: SessionState,
    bandit: BanditSelector,
    rng: StdRng,
    negatives: NegativeCache,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[must_use]
    pub fn mode(&self) -> AvailabilityMode {
        self.mode
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn bandit(&self) -> &BanditSelector {
        &self.bandit
    }

    #[must_use]
    pub fn snapshot(&self) -> &ClusterSnapshot {
        &self.snapshot
    }

    fn is_persistent(&self) -> bool {
        self.user != GUEST_USER
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("collection", &self.collection)
            .field("mode", &self.mode)
            .field("streak", &self.state.streak)
            .field("drift", &self.state.exploration_drift)
            .finish_non_exhaustive()
    }
}

pub struct EngineBuilder {
    source: Arc<dyn LibrarySource>,
    store: Arc<dyn AffinityStore>,
    config: EngineConfig,
    policy: Option<Arc<dyn PhasePolicy>>,
    strategy: Option<Arc<dyn TargetStrategy>>,
    hooks: Vec<Box<dyn FeedbackHook>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn PhasePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn TargetStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Append a hook. Hooks run in registration order, after the built-in ones.
    #[must_use]
    pub fn with_hook(mut self, hook: Box<dyn FeedbackHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let mut interpreter = FeedbackInterpreter::new(self.config.feedback);
        if self.config.skip_rebalance {
            interpreter.register(Box::new(SkipRebalanceHook::default()));
        }
        for hook in self.hooks {
            interpreter.register(hook);
        }

        Engine {
            policy: self
                .policy
                .unwrap_or_else(|| Arc::new(DefaultPhasePolicy::new(self.config.tuning))),
            strategy: self.strategy.unwrap_or_else(|| Arc::new(DefaultTargetStrategy)),
            source: self.source,
            store: self.store,
            config: self.config,
            interpreter,
            snapshots: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

pub struct Engine {
    source: Arc<dyn LibrarySource>,
    store: Arc<dyn AffinityStore>,
    config: EngineConfig,
    policy: Arc<dyn PhasePolicy>,
    strategy: Arc<dyn TargetStrategy>,
    interpreter: FeedbackInterpreter,
    snapshots: RwLock<HashMap<String, Arc<SnapshotHandle>>>,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("policy", &self.policy)
            .field("strategy", &self.strategy)
            .field("interpreter", &self.interpreter)
            .finish_non_exhaustive()
    }
}

/// Log and swallow a store failure.
fn best_effort(what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("Failed to {what}: {e:#}");
    }
}

fn lock_session(session: &Mutex<Session>) -> Result<MutexGuard<'_, Session>> {
    session.lock().map_err(|_| anyhow!("Session lock poisoned"))
}

impl Engine {
    #[must_use]
    pub fn builder(source: Arc<dyn LibrarySource>, store: Arc<dyn AffinityStore>) -> EngineBuilder {
        EngineBuilder {
            source,
            store,
            config: EngineConfig::default(),
            policy: None,
            strategy: None,
            hooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The current snapshot of `collection`, loading and fitting it on first use.
    pub fn snapshot(&self, collection: &str) -> Result<Arc<ClusterSnapshot>> {
        if let Some(handle) = self.read_snapshots()?.get(collection) {
            return Ok(handle.load());
        }

        let library = Arc::new(load_library(self.source.as_ref(), collection));
        let fitted = ClusterSnapshot::fit(library, &self.config.cluster);
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| anyhow!("Snapshot table lock poisoned"))?;
        let handle = snapshots
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(SnapshotHandle::new(fitted)));
        Ok(handle.load())
    }

    /// Reload `collection` from the source and swap in a fresh fit.
    ///
    /// Live sessions keep the snapshot they started with.
    pub fn refit(&self, collection: &str) -> Result<Arc<ClusterSnapshot>> {
        let existing = self.read_snapshots()?.get(collection).cloned();
        match existing {
            Some(handle) => {
                let library = Arc::new(load_library(self.source.as_ref(), collection));
                let fitted = handle.refit(library, &self.config.cluster);
                info!("Refitted {collection}: {} clusters", fitted.len());
                Ok(fitted)
            }
            None => self.snapshot(collection),
        }
    }

    fn read_snapshots(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SnapshotHandle>>>> {
        self.snapshots
            .read()
            .map_err(|_| anyhow!("Snapshot table lock poisoned"))
    }

    fn session(&self, id: SessionId) -> Result<Arc<Mutex<Session>>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| anyhow!("Session table lock poisoned"))?;
        match sessions.get(&id) {
            Some(session) => Ok(Arc::clone(session)),
            None => bail!("Unknown session {id}"),
        }
    }

    /// Fresh state and bandit seeded from persisted history.
    fn fresh_state(
        &self,
        user: &str,
        collection: &str,
        snapshot: &ClusterSnapshot,
        mut dislikes: HashSet<TrackId>,
    ) -> (SessionState, BanditSelector) {
        let mut bandit = BanditSelector::new(snapshot.cluster_ids(), &self.config.bandit);
        if user != GUEST_USER {
            match self.store.read_profile(user, collection) {
                Ok(history) => bandit.seed_from_history(&history, &self.config.bandit),
                Err(e) => warn!("Failed to read history for {user}, starting cold: {e:#}"),
            }
            match self.store.read_disliked_tracks(user) {
                Ok(stored) => dislikes.extend(stored),
                Err(e) => warn!("Failed to read dislikes for {user}: {e:#}"),
            }
        }
        let mut state = SessionState::new(&self.config.tuning, dislikes);
        if user != GUEST_USER {
            state.history_centroids = self.history_centroids(user, collection, &bandit);
        }
        (state, bandit)
    }

    /// Persisted centroids of the clusters a history cold start can draw from.
    fn history_centroids(&self, user: &str, collection: &str, bandit: &BanditSelector) -> HashMap<ClusterId, Vec<f64>> {
        let mut centroids = HashMap::new();
        for (cluster, _) in bandit.top_above_prior(self.config.queue.history_top_clusters) {
            match self.store.read_centroid(user, cluster, collection) {
                Ok(Some(centroid)) => {
                    centroids.insert(cluster, centroid.vector);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to read centroid of cluster {cluster} for {user}: {e:#}"),
            }
        }
        centroids
    }

    pub fn create_session(&self, user: &str, collection: &str, mode: AvailabilityMode) -> Result<SessionId> {
        let snapshot = self.snapshot(collection)?;
        let (state, bandit) = self.fresh_state(user, collection, &snapshot, HashSet::new());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rng = match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
            None => StdRng::from_entropy(),
        };

        let session = Session {
            id,
            user: user.to_string(),
            collection: collection.to_string(),
            mode,
            snapshot,
            state,
            bandit,
            rng,
            negatives: NegativeCache::default(),
        };
        info!(
            "Session {id} started for {user} on {collection} ({} clusters{})",
            session.snapshot.len(),
            if session.bandit.has_history() { ", with history" } else { "" }
        );
        self.sessions
            .write()
            .map_err(|_| anyhow!("Session table lock poisoned"))?
            .insert(id, Arc::new(Mutex::new(session)));
        Ok(id)
    }

    /// Drop the session. Persistence is written through, so nothing is left to flush.
    pub fn end_session(&self, id: SessionId) -> Result<()> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| anyhow!("Session table lock poisoned"))?
            .remove(&id);
        match removed {
            Some(_) => {
                info!("Session {id} ended");
                Ok(())
            }
            None => bail!("Unknown session {id}"),
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Run `f` against the locked session.
    pub fn inspect<R>(&self, id: SessionId, f: impl FnOnce(&Session) -> R) -> Result<R> {
        let handle = self.session(id)?;
        let session = lock_session(&handle)?;
        Ok(f(&session))
    }

    /// The next track, or `None` once nothing selectable is left.
    pub fn next(&self, id: SessionId) -> Result<Option<Pick>> {
        let handle = self.session(id)?;
        let mut guard = lock_session(&handle)?;
        Ok(self.pick(&mut guard))
    }

    /// Up to `n` picks, each marked played before the next is chosen.
    pub fn next_batch(&self, id: SessionId, n: usize) -> Result<Vec<Pick>> {
        let handle = self.session(id)?;
        let mut guard = lock_session(&handle)?;
        let mut picks = Vec::with_capacity(n);
        for _ in 0..n {
            match self.pick(&mut guard) {
                Some(pick) => picks.push(pick),
                None => break,
            }
        }
        Ok(picks)
    }

    fn pick(&self, session: &mut Session) -> Option<Pick> {
        let exemplars: &[Vec<f64>] = match session.state.current_cluster_id {
            Some(cluster) if session.is_persistent() => {
                let (user, collection, store) = (&session.user, &session.collection, &self.store);
                session.negatives.ensure(cluster, |c| {
                    match store.read_negative_exemplars(user, c, collection, NEGATIVE_READ_LIMIT) {
                        Ok(rows) => rows.into_iter().map(|n| n.vector).collect(),
                        Err(e) => {
                            warn!("Failed to read negative exemplars for cluster {c}: {e:#}");
                            Vec::new()
                        }
                    }
                })
            }
            _ => &[],
        };

        let ctx = SelectionContext {
            snapshot: &session.snapshot,
            state: &session.state,
            bandit: &session.bandit,
            mode: session.mode,
            config: &self.config.queue,
            scoring: &self.config.scoring,
        };
        let pick = select_next(&ctx, self.strategy.as_ref(), self.policy.as_ref(), exemplars, &mut session.rng);

        let Some(pick) = pick else {
            info!("Session {}: nothing left to pick", session.id);
            return None;
        };
        if let Some(track) = session.snapshot.library().get(&pick.track_id) {
            session.state.record_pick(track, pick.cluster_id);
        }
        debug!(
            "Session {} picked {} [{}] from cluster {:?}: {}",
            session.id, pick.track_id, pick.phase, pick.cluster_id, pick.justification
        );
        Some(pick)
    }

    /// Apply listening feedback. Unknown tracks are a no-op and return `None`.
    pub fn feedback(&self, id: SessionId, feedback: Feedback) -> Result<Option<FeedbackOutcome>> {
        let handle = self.session(id)?;
        let mut guard = lock_session(&handle)?;
        let session = &mut *guard;

        let Some(track) = session.snapshot.library().get(&feedback.track_id).cloned() else {
            warn!("Session {id}: feedback for unknown track {}", feedback.track_id);
            return Ok(None);
        };

        let outcome = self.interpreter.apply(
            &feedback,
            &track,
            &session.snapshot,
            &mut session.state,
            &mut session.bandit,
            &self.config.tuning,
            &self.config.rates,
        );
        if session.is_persistent() {
            self.persist_feedback(session, &feedback, &track, &outcome);
        }
        Ok(Some(outcome))
    }

    fn persist_feedback(&self, session: &mut Session, feedback: &Feedback, track: &Track, outcome: &FeedbackOutcome) {
        let signal = outcome.signal();
        let (user, collection) = (session.user.as_str(), session.collection.as_str());

        if let Some(cluster) = outcome.cluster_id {
            best_effort(
                "update affinity",
                self.store.upsert_affinity(
                    user,
                    cluster,
                    feedback.listened_seconds,
                    signal.is_strong_positive(),
                    collection,
                ),
            );
            if signal.is_positive() {
                if let Some(taste) = session.state.taste.get() {
                    best_effort(
                        "update centroid",
                        self.store.write_centroid(user, cluster, collection, taste, CENTROID_SAMPLE_WEIGHT),
                    );
                }
            }
            if signal.is_negative() && outcome.was_locked {
                best_effort(
                    "record negative exemplar",
                    self.store
                        .append_negative_exemplar(user, cluster, collection, &track.embedding, &track.id),
                );
                session.negatives.push(cluster, track.embedding.clone());
            }
        }

        let action = if feedback.disliked {
            InteractionAction::Dislike
        } else if signal.is_negative() {
            InteractionAction::Skip
        } else if feedback.liked {
            InteractionAction::Like
        } else {
            InteractionAction::Play
        };
        best_effort(
            "log interaction",
            self.store.log_interaction(&Interaction {
                session_id: session.id,
                user_id: user.to_string(),
                track_id: track.id.clone(),
                label: track.label.clone(),
                action,
                duration: feedback.listened_seconds,
                justification: signal.to_string(),
            }),
        );
    }

    /// Rebuild the session from persisted history. Dislikes survive the reset.
    pub fn reset(&self, id: SessionId) -> Result<()> {
        let handle = self.session(id)?;
        let mut guard = lock_session(&handle)?;
        let session = &mut *guard;

        let carried = std::mem::take(&mut session.state.global_dislikes);
        let (state, bandit) = self.fresh_state(&session.user, &session.collection, &session.snapshot, carried);
        session.state = state;
        session.bandit = bandit;
        session.negatives.invalidate();
        info!("Session {id} reset");
        Ok(())
    }

    /// Lock the session onto `track_id`. Unknown tracks return `None`.
    pub fn seed(&self, id: SessionId, track_id: &str) -> Result<Option<Pick>> {
        let handle = self.session(id)?;
        let mut guard = lock_session(&handle)?;
        let session = &mut *guard;

        let Some(track) = session.snapshot.library().get(track_id).cloned() else {
            warn!("Session {id}: cannot seed unknown track {track_id}");
            return Ok(None);
        };
        let cluster = session.snapshot.cluster_of(&track.id);
        session.state.seed(&track, cluster, &self.config.tuning);
        if let Some(cluster) = cluster {
            session.bandit.update(cluster, self.config.tuning.seed_alpha_boost, 0.0);
        }

        let justification = "Seeded by you".to_string();
        if session.is_persistent() {
            best_effort(
                "log seed",
                self.store.log_interaction(&Interaction {
                    session_id: id,
                    user_id: session.user.clone(),
                    track_id: track.id.clone(),
                    label: track.label.clone(),
                    action: InteractionAction::Seed,
                    duration: 0.0,
                    justification: justification.clone(),
                }),
            );
        }
        Ok(Some(Pick {
            track_id: track.id,
            label: track.label,
            cluster_id: cluster,
            phase: Phase::Exploit,
            score: 1.0,
            justification,
        }))
    }

    /// Case-insensitive label search within the session's availability mode.
    pub fn search(&self, id: SessionId, query: &str) -> Result<Vec<TrackSummary>> {
        self.inspect(id, |session| {
            session
                .snapshot
                .library()
                .search(query, session.mode, self.config.queue.search_limit)
                .into_iter()
                .map(|t| TrackSummary {
                    id: t.id.clone(),
                    label: t.label.clone(),
                    stream_id: t.stream_id.clone(),
                    cluster_id: session.snapshot.cluster_of(&t.id),
                })
                .collect()
        })
    }

    /// Persisted affinity of `user`, most listened first.
    pub fn profile(&self, user: &str, collection: &str) -> Result<Vec<AffinityRecord>> {
        if user == GUEST_USER {
            return Ok(Vec::new());
        }
        self.store.read_profile(user, collection)
    }

    pub fn clear_history(&self, user: &str) -> Result<()> {
        if user == GUEST_USER {
            return Ok(());
        }
        self.store.clear_history(user)?;
        info!("Cleared history for {user}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryAffinityStore;
    use crate::library::MemoryLibrarySource;

    fn tracks() -> Vec<Track> {
        (0..8)
            .map(|i| {
                let mut v = vec![0.1; 4];
                v[i % 4] = 1.0 + i as f64 * 0.05;
                Track::new(format!("t{i}"), format!("Song {i}"), v)
            })
            .collect()
    }

    fn engine(store: Arc<MemoryAffinityStore>) -> Engine {
        let source = MemoryLibrarySource::new().with_collection("default", tracks());
        let mut config = EngineConfig::default().with_seed(9);
        config.cluster.k = 2;
        Engine::builder(Arc::new(source), store).with_config(config).build()
    }

    #[test]
    fn test_unknown_session_is_an_error() {
        let engine = engine(Arc::new(MemoryAffinityStore::new()));
        assert!(engine.next(42).is_err(), "Unknown session ids are errors");
        assert!(engine.end_session(42).is_err());
    }

    #[test]
    fn test_session_lifecycle() -> Result<()> {
        let engine = engine(Arc::new(MemoryAffinityStore::new()));
        let id = engine.create_session("alice", "default", AvailabilityMode::Any)?;
        assert_eq!(engine.session_count(), 1);

        let batch = engine.next_batch(id, 3)?;
        assert_eq!(batch.len(), 3);
        let played = engine.inspect(id, |s| s.state().played_ids.len())?;
        assert_eq!(played, 3, "Batch picks are marked played");

        engine.end_session(id)?;
        assert_eq!(engine.session_count(), 0);
        Ok(())
    }

    #[test]
    fn test_feedback_writes_store() -> Result<()> {
        let store = Arc::new(MemoryAffinityStore::new());
        let engine = engine(Arc::clone(&store));
        let id = engine.create_session("alice", "default", AvailabilityMode::Any)?;

        let outcome = engine.feedback(id, Feedback::listened("t1", 150.0))?;
        assert!(outcome.is_some());
        let profile = engine.profile("alice", "default")?;
        assert_eq!(profile.len(), 1, "One cluster touched");
        assert_eq!(profile[0].positive_count, 1);
        assert_eq!(store.interactions()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_guest_never_persists() -> Result<()> {
        let store = Arc::new(MemoryAffinityStore::new());
        let engine = engine(Arc::clone(&store));
        let id = engine.create_session(GUEST_USER, "default", AvailabilityMode::Any)?;
        engine.feedback(id, Feedback::listened("t1", 150.0))?;
        engine.feedback(id, Feedback::listened("t2", 1.0).dislike())?;
        engine.seed(id, "t3")?;

        assert!(store.interactions()?.is_empty(), "Guest sessions leave no log");
        assert!(store.read_profile(GUEST_USER, "default")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_track_feedback_is_noop() -> Result<()> {
        let engine = engine(Arc::new(MemoryAffinityStore::new()));
        let id = engine.create_session("alice", "default", AvailabilityMode::Any)?;
        assert!(engine.feedback(id, Feedback::listened("missing", 100.0))?.is_none());
        assert!(engine.seed(id, "missing")?.is_none());
        let streak = engine.inspect(id, |s| s.state().streak)?;
        assert_eq!(streak, 0);
        Ok(())
    }

    #[test]
    fn test_reset_keeps_dislikes() -> Result<()> {
        let engine = engine(Arc::new(MemoryAffinityStore::new()));
        let id = engine.create_session(GUEST_USER, "default", AvailabilityMode::Any)?;
        engine.feedback(id, Feedback::listened("t0", 150.0))?;
        engine.feedback(id, Feedback::listened("t5", 1.0).dislike())?;
        engine.reset(id)?;

        engine.inspect(id, |s| {
            assert_eq!(s.state().streak, 0, "Reset drops the lock");
            assert!(s.state().session_likes.is_empty());
            assert!(s.state().played_ids.is_empty());
            assert!(s.state().global_dislikes.contains("t5"), "Dislikes survive a reset");
        })
    }

    #[test]
    fn test_seed_locks_deep() -> Result<()> {
        let engine = engine(Arc::new(MemoryAffinityStore::new()));
        let id = engine.create_session("alice", "default", AvailabilityMode::Any)?;
        let pick = engine.seed(id, "t2")?.expect("t2 exists");
        assert_eq!(pick.phase, Phase::Exploit);
        engine.inspect(id, |s| {
            assert!(s.state().streak >= 5);
            assert_eq!(s.state().anchor_track_id.as_deref(), Some("t2"));
        })
    }

    #[test]
    fn test_search_respects_mode() -> Result<()> {
        let engine = engine(Arc::new(MemoryAffinityStore::new()));
        let any = engine.create_session(GUEST_USER, "default", AvailabilityMode::Any)?;
        let stream = engine.create_session(GUEST_USER, "default", AvailabilityMode::StreamOnly)?;
        assert_eq!(engine.search(any, "song")?.len(), 8);
        assert!(engine.search(stream, "song")?.is_empty(), "No track has a stream id");
        Ok(())
    }
}
