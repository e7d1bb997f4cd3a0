//! # Affinity Persistence
//!
//! Long-lived per-user learning data behind the [`AffinityStore`] trait:
//!
//! - `cluster_affinity`: merge-accumulated listen statistics per cluster
//! - `cluster_centroids`: an exponential moving average of the user's taste per cluster
//! - `cluster_negatives`: append-only negative exemplars per cluster
//! - `user_logs`: every interaction, the source of the global dislike set
//!
//! [`SqliteAffinityStore`] is the reference adapter; [`MemoryAffinityStore`] keeps the
//! same tables in memory. Both serialise access through one `Mutex`.

use crate::cluster::ClusterId;
use crate::library::TrackId;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

/// Smallest weight a new taste sample gets in the centroid average.
pub const MIN_CENTROID_WEIGHT: f64 = 0.3;

/// How many persisted negatives a session reads per cluster.
pub const NEGATIVE_READ_LIMIT: usize = 50;

/// Accumulated history of one user with one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityRecord {
    pub user_id: String,
    pub cluster_id: ClusterId,
    pub collection: String,
    pub positive_count: u32,
    pub total_listen_seconds: f64,
    pub track_count: u32,
    pub last_positive_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedCentroid {
    pub vector: Vec<f64>,
    pub sample_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NegativeExemplar {
    pub cluster_id: ClusterId,
    pub vector: Vec<f64>,
    pub track_id: TrackId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionAction {
    Play,
    Like,
    Skip,
    Dislike,
    Seed,
}

impl InteractionAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Like => "like",
            Self::Skip => "skip",
            Self::Dislike => "dislike",
            Self::Seed => "seed",
        }
    }

    /// Logged interactions of this kind put the track on the global dislike list.
    #[must_use]
    pub fn is_rejection(self) -> bool {
        matches!(self, Self::Skip | Self::Dislike)
    }
}

impl fmt::Display for InteractionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the interaction log.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub session_id: u64,
    pub user_id: String,
    pub track_id: TrackId,
    pub label: String,
    pub action: InteractionAction,
    pub duration: f64,
    pub justification: String,
}

/// Persistent per-user affinity.
pub trait AffinityStore: Send + Sync {
    /// Every cluster the user has history with in `collection`, most listened first.
    fn read_profile(&self, user: &str, collection: &str) -> Result<Vec<AffinityRecord>>;

    /// Merge one listen into the cluster's record.
    fn upsert_affinity(
        &self,
        user: &str,
        cluster: ClusterId,
        listen_seconds: f64,
        is_positive: bool,
        collection: &str,
    ) -> Result<()>;

    fn read_centroid(&self, user: &str, cluster: ClusterId, collection: &str) -> Result<Option<PersistedCentroid>>;

    /// Blend `vector` into the stored centroid (see [`blend_centroid`]).
    fn write_centroid(&self, user: &str, cluster: ClusterId, collection: &str, vector: &[f64], weight: f64) -> Result<()>;

    fn append_negative_exemplar(
        &self,
        user: &str,
        cluster: ClusterId,
        collection: &str,
        vector: &[f64],
        track_id: &str,
    ) -> Result<()>;

    /// The `limit` most recent exemplars, oldest first.
    fn read_negative_exemplars(
        &self,
        user: &str,
        cluster: ClusterId,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<NegativeExemplar>>;

    fn log_interaction(&self, interaction: &Interaction) -> Result<()>;

    /// Tracks the user ever skipped or disliked.
    fn read_disliked_tracks(&self, user: &str) -> Result<HashSet<TrackId>>;

    /// Forget everything stored for `user`.
    fn clear_history(&self, user: &str) -> Result<()>;
}

/// `(1-a)·old + a·new` with `a = max(0.3, weight)`. No usable old vector means `new`.
#[must_use]
pub fn blend_centroid(old: Option<&[f64]>, new: &[f64], weight: f64) -> Vec<f64> {
    let a = weight.max(MIN_CENTROID_WEIGHT);
    match old {
        Some(old) if old.len() == new.len() => old.iter().zip(new).map(|(o, n)| (1.0 - a) * o + a * n).collect(),
        _ => new.to_vec(),
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cluster_affinity (
    user_id              TEXT    NOT NULL,
    cluster_id           INTEGER NOT NULL,
    collection           TEXT    NOT NULL,
    positive_count       INTEGER NOT NULL DEFAULT 0,
    total_listen_seconds REAL    NOT NULL DEFAULT 0,
    track_count          INTEGER NOT NULL DEFAULT 0,
    last_positive_ts     TEXT,
    PRIMARY KEY (user_id, cluster_id, collection)
);
CREATE TABLE IF NOT EXISTS cluster_centroids (
    user_id      TEXT    NOT NULL,
    cluster_id   INTEGER NOT NULL,
    collection   TEXT    NOT NULL,
    vector       TEXT    NOT NULL,
    sample_count INTEGER NOT NULL DEFAULT 0,
    updated_at   TEXT    NOT NULL,
    PRIMARY KEY (user_id, cluster_id, collection)
);
CREATE TABLE IF NOT EXISTS cluster_negatives (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT    NOT NULL,
    cluster_id INTEGER NOT NULL,
    collection TEXT    NOT NULL,
    vector     TEXT    NOT NULL,
    track_id   TEXT    NOT NULL,
    created_at TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cluster_negatives_lookup
    ON cluster_negatives (user_id, cluster_id, collection);
CREATE TABLE IF NOT EXISTS user_logs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    INTEGER NOT NULL,
    user_id       TEXT    NOT NULL,
    track_id      TEXT    NOT NULL,
    label         TEXT    NOT NULL,
    action        TEXT    NOT NULL,
    duration      REAL    NOT NULL,
    justification TEXT    NOT NULL,
    created_at    TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_logs_user ON user_logs (user_id, action);
";

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| match DateTime::parse_from_rfc3339(&s) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!("Malformed timestamp in affinity db: {s}: {e}");
            None
        }
    })
}

fn parse_vector(raw: &str) -> Option<Vec<f64>> {
    serde_json::from_str(raw)
        .map_err(|e| warn!("Malformed vector in affinity db: {e}"))
        .ok()
}

/// SQLite-backed affinity store.
pub struct SqliteAffinityStore {
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteAffinityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteAffinityStore").finish_non_exhaustive()
    }
}

impl SqliteAffinityStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open affinity database at {}", path.display()))?;
        let store = Self::with_connection(conn)?;
        info!("Affinity store ready at {}", path.display());
        Ok(store)
    }

    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory affinity database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create affinity schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Affinity database lock poisoned"))
    }
}

impl AffinityStore for SqliteAffinityStore {
    fn read_profile(&self, user: &str, collection: &str) -> Result<Vec<AffinityRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT cluster_id, positive_count, total_listen_seconds, track_count, last_positive_ts
             FROM cluster_affinity
             WHERE user_id = ?1 AND collection = ?2
             ORDER BY total_listen_seconds DESC, cluster_id ASC",
        )?;
        let rows = stmt
            .query_map(params![user, collection], |row| {
                Ok((
                    row.get::<_, usize>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query cluster affinity")?;

        let mut records = Vec::new();
        for row in rows {
            let (cluster_id, positive_count, total_listen_seconds, track_count, ts) =
                row.context("Failed to read cluster affinity row")?;
            records.push(AffinityRecord {
                user_id: user.to_string(),
                cluster_id,
                collection: collection.to_string(),
                positive_count,
                total_listen_seconds,
                track_count,
                last_positive_ts: parse_timestamp(ts),
            });
        }
        Ok(records)
    }

    fn upsert_affinity(
        &self,
        user: &str,
        cluster: ClusterId,
        listen_seconds: f64,
        is_positive: bool,
        collection: &str,
    ) -> Result<()> {
        let positive = u32::from(is_positive);
        let ts = is_positive.then(|| Utc::now().to_rfc3339());
        let conn = self.lock()?;
        conn.prepare_cached(
            "INSERT INTO cluster_affinity
                 (user_id, cluster_id, collection, positive_count, total_listen_seconds, track_count, last_positive_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT (user_id, cluster_id, collection) DO UPDATE SET
                 positive_count = positive_count + excluded.positive_count,
                 total_listen_seconds = total_listen_seconds + excluded.total_listen_seconds,
                 track_count = track_count + 1,
                 last_positive_ts = COALESCE(excluded.last_positive_ts, last_positive_ts)",
        )?
        .execute(params![user, cluster, collection, positive, listen_seconds.max(0.0), ts])
        .with_context(|| format!("Failed to upsert affinity for {user} on cluster {cluster}"))?;
        Ok(())
    }

    fn read_centroid(&self, user: &str, cluster: ClusterId, collection: &str) -> Result<Option<PersistedCentroid>> {
        let conn = self.lock()?;
        let row = conn
            .prepare_cached(
                "SELECT vector, sample_count FROM cluster_centroids
                 WHERE user_id = ?1 AND cluster_id = ?2 AND collection = ?3",
            )?
            .query_row(params![user, cluster, collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })
            .optional()
            .context("Failed to query centroid")?;

        Ok(row.and_then(|(raw, sample_count)| {
            parse_vector(&raw).map(|vector| PersistedCentroid { vector, sample_count })
        }))
    }

    fn write_centroid(&self, user: &str, cluster: ClusterId, collection: &str, vector: &[f64], weight: f64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT vector FROM cluster_centroids
                 WHERE user_id = ?1 AND cluster_id = ?2 AND collection = ?3",
                params![user, cluster, collection],
                |row| row.get(0),
            )
            .optional()?;
        let old = existing.as_deref().and_then(parse_vector);
        let blended = blend_centroid(old.as_deref(), vector, weight);
        let encoded = serde_json::to_string(&blended)?;

        tx.execute(
            "INSERT INTO cluster_centroids (user_id, cluster_id, collection, vector, sample_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT (user_id, cluster_id, collection) DO UPDATE SET
                 vector = excluded.vector,
                 sample_count = sample_count + 1,
                 updated_at = excluded.updated_at",
            params![user, cluster, collection, encoded, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to write centroid for {user} on cluster {cluster}"))?;
        tx.commit().context("Failed to commit centroid update")?;
        Ok(())
    }

    fn append_negative_exemplar(
        &self,
        user: &str,
        cluster: ClusterId,
        collection: &str,
        vector: &[f64],
        track_id: &str,
    ) -> Result<()> {
        let encoded = serde_json::to_string(vector)?;
        let conn = self.lock()?;
        conn.prepare_cached(
            "INSERT INTO cluster_negatives (user_id, cluster_id, collection, vector, track_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?
        .execute(params![user, cluster, collection, encoded, track_id, Utc::now().to_rfc3339()])
        .context("Failed to append negative exemplar")?;
        Ok(())
    }

    fn read_negative_exemplars(
        &self,
        user: &str,
        cluster: ClusterId,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<NegativeExemplar>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT vector, track_id, created_at FROM cluster_negatives
             WHERE user_id = ?1 AND cluster_id = ?2 AND collection = ?3
             ORDER BY id DESC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![user, cluster, collection, limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .context("Failed to query negative exemplars")?;

        let mut exemplars = Vec::new();
        for row in rows {
            let (raw, track_id, created_at) = row.context("Failed to read negative exemplar row")?;
            let (Some(vector), Some(created_at)) = (parse_vector(&raw), parse_timestamp(Some(created_at))) else {
                continue;
            };
            exemplars.push(NegativeExemplar { cluster_id: cluster, vector, track_id, created_at });
        }
        exemplars.reverse();
        Ok(exemplars)
    }

    fn log_interaction(&self, interaction: &Interaction) -> Result<()> {
        let conn = self.lock()?;
        conn.prepare_cached(
            "INSERT INTO user_logs (session_id, user_id, track_id, label, action, duration, justification, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?
        .execute(params![
            interaction.session_id,
            interaction.user_id,
            interaction.track_id,
            interaction.label,
            interaction.action.as_str(),
            interaction.duration,
            interaction.justification,
            Utc::now().to_rfc3339(),
        ])
        .context("Failed to log interaction")?;
        Ok(())
    }

    fn read_disliked_tracks(&self, user: &str) -> Result<HashSet<TrackId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT track_id FROM user_logs WHERE user_id = ?1 AND action IN ('skip', 'dislike')",
        )?;
        let rows = stmt
            .query_map(params![user], |row| row.get::<_, String>(0))
            .context("Failed to query disliked tracks")?;
        let mut disliked = HashSet::new();
        for row in rows {
            disliked.insert(row.context("Failed to read disliked track row")?);
        }
        Ok(disliked)
    }

    fn clear_history(&self, user: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for table in ["cluster_affinity", "cluster_centroids", "cluster_negatives", "user_logs"] {
            let removed = tx
                .execute(&format!("DELETE FROM {table} WHERE user_id = ?1"), params![user])
                .with_context(|| format!("Failed to clear {table} for {user}"))?;
            debug!("Cleared {removed} rows from {table} for {user}");
        }
        tx.commit().context("Failed to commit history reset")?;
        Ok(())
    }
}

type ClusterKey = (String, ClusterId, String);

fn key(user: &str, cluster: ClusterId, collection: &str) -> ClusterKey {
    (user.to_string(), cluster, collection.to_string())
}

#[derive(Debug, Default)]
struct MemoryTables {
    affinity: BTreeMap<ClusterKey, AffinityRecord>,
    centroids: BTreeMap<ClusterKey, PersistedCentroid>,
    negatives: Vec<(ClusterKey, NegativeExemplar)>,
    logs: Vec<Interaction>,
}

/// Affinity tables kept in memory.
#[derive(Debug, Default)]
pub struct MemoryAffinityStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryAffinityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("Memory affinity store lock poisoned"))
    }

    /// Every logged interaction, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn interactions(&self) -> Result<Vec<Interaction>> {
        Ok(self.lock()?.logs.clone())
    }
}

impl AffinityStore for MemoryAffinityStore {
    fn read_profile(&self, user: &str, collection: &str) -> Result<Vec<AffinityRecord>> {
        let tables = self.lock()?;
        let mut records: Vec<AffinityRecord> = tables
            .affinity
            .values()
            .filter(|r| r.user_id == user && r.collection == collection)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.total_listen_seconds
                .partial_cmp(&a.total_listen_seconds)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cluster_id.cmp(&b.cluster_id))
        });
        Ok(records)
    }

    fn upsert_affinity(
        &self,
        user: &str,
        cluster: ClusterId,
        listen_seconds: f64,
        is_positive: bool,
        collection: &str,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        let record = tables
            .affinity
            .entry(key(user, cluster, collection))
            .or_insert_with(|| AffinityRecord {
                user_id: user.to_string(),
                cluster_id: cluster,
                collection: collection.to_string(),
                positive_count: 0,
                total_listen_seconds: 0.0,
                track_count: 0,
                last_positive_ts: None,
            });
        record.total_listen_seconds += listen_seconds.max(0.0);
        record.track_count += 1;
        if is_positive {
            record.positive_count += 1;
            record.last_positive_ts = Some(Utc::now());
        }
        Ok(())
    }

    fn read_centroid(&self, user: &str, cluster: ClusterId, collection: &str) -> Result<Option<PersistedCentroid>> {
        Ok(self.lock()?.centroids.get(&key(user, cluster, collection)).cloned())
    }

    fn write_centroid(&self, user: &str, cluster: ClusterId, collection: &str, vector: &[f64], weight: f64) -> Result<()> {
        let mut tables = self.lock()?;
        let slot = tables.centroids.entry(key(user, cluster, collection));
        match slot {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                current.vector = blend_centroid(Some(current.vector.as_slice()), vector, weight);
                current.sample_count += 1;
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(PersistedCentroid { vector: vector.to_vec(), sample_count: 1 });
            }
        }
        Ok(())
    }

    fn append_negative_exemplar(
        &self,
        user: &str,
        cluster: ClusterId,
        collection: &str,
        vector: &[f64],
        track_id: &str,
    ) -> Result<()> {
        let exemplar = NegativeExemplar {
            cluster_id: cluster,
            vector: vector.to_vec(),
            track_id: track_id.to_string(),
            created_at: Utc::now(),
        };
        self.lock()?.negatives.push((key(user, cluster, collection), exemplar));
        Ok(())
    }

    fn read_negative_exemplars(
        &self,
        user: &str,
        cluster: ClusterId,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<NegativeExemplar>> {
        let wanted = key(user, cluster, collection);
        let tables = self.lock()?;
        let mut exemplars: Vec<NegativeExemplar> = tables
            .negatives
            .iter()
            .rev()
            .filter(|(k, _)| *k == wanted)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect();
        exemplars.reverse();
        Ok(exemplars)
    }

    fn log_interaction(&self, interaction: &Interaction) -> Result<()> {
        self.lock()?.logs.push(interaction.clone());
        Ok(())
    }

    fn read_disliked_tracks(&self, user: &str) -> Result<HashSet<TrackId>> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .filter(|i| i.user_id == user && i.action.is_rejection())
            .map(|i| i.track_id.clone())
            .collect())
    }

    fn clear_history(&self, user: &str) -> Result<()> {
        let mut tables = self.lock()?;
        tables.affinity.retain(|(u, _, _), _| u != user);
        tables.centroids.retain(|(u, _, _), _| u != user);
        tables.negatives.retain(|((u, _, _), _)| u != user);
        tables.logs.retain(|i| i.user_id != user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<(&'static str, Box<dyn AffinityStore>)> {
        vec![
            ("memory", Box::new(MemoryAffinityStore::new())),
            (
                "sqlite",
                Box::new(SqliteAffinityStore::open_in_memory().expect("in-memory sqlite opens")),
            ),
        ]
    }

    fn interaction(user: &str, track: &str, action: InteractionAction) -> Interaction {
        Interaction {
            session_id: 1,
            user_id: user.to_string(),
            track_id: track.to_string(),
            label: format!("Label {track}"),
            action,
            duration: 3.0,
            justification: "test".to_string(),
        }
    }

    #[test]
    fn test_blend_centroid() {
        assert_eq!(blend_centroid(None, &[1.0, 0.0], 0.1), vec![1.0, 0.0]);
        let blended = blend_centroid(Some(&[0.0, 0.0][..]), &[1.0, 1.0], 0.1);
        assert!((blended[0] - 0.3).abs() < 1e-12, "Weight is floored at 0.3");
        let heavy = blend_centroid(Some(&[0.0][..]), &[1.0], 0.5);
        assert!((heavy[0] - 0.5).abs() < 1e-12);
        assert_eq!(blend_centroid(Some(&[0.0][..]), &[1.0, 2.0], 0.1), vec![1.0, 2.0], "Dimension change resets");
    }

    #[test]
    fn test_affinity_merge_accumulates() -> Result<()> {
        for (name, store) in stores() {
            store.upsert_affinity("u", 3, 100.0, true, "c")?;
            store.upsert_affinity("u", 3, 2.0, false, "c")?;
            store.upsert_affinity("u", 1, 500.0, false, "c")?;
            store.upsert_affinity("u", 3, 10.0, true, "other")?;

            let profile = store.read_profile("u", "c")?;
            assert_eq!(profile.len(), 2, "{name}: one record per cluster");
            assert_eq!(profile[0].cluster_id, 1, "{name}: most listened first");
            let three = &profile[1];
            assert_eq!(three.positive_count, 1, "{name}");
            assert_eq!(three.track_count, 2, "{name}");
            assert!((three.total_listen_seconds - 102.0).abs() < 1e-9, "{name}");
            assert!(three.last_positive_ts.is_some(), "{name}");
            assert!(profile[0].last_positive_ts.is_none(), "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_centroid_ema() -> Result<()> {
        for (name, store) in stores() {
            assert!(store.read_centroid("u", 0, "c")?.is_none(), "{name}");
            store.write_centroid("u", 0, "c", &[1.0, 0.0], 0.1)?;
            store.write_centroid("u", 0, "c", &[0.0, 1.0], 0.1)?;
            let centroid = store.read_centroid("u", 0, "c")?.expect("centroid stored");
            assert_eq!(centroid.sample_count, 2, "{name}");
            assert!((centroid.vector[0] - 0.7).abs() < 1e-9, "{name}");
            assert!((centroid.vector[1] - 0.3).abs() < 1e-9, "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_negative_exemplars_limit_and_order() -> Result<()> {
        for (name, store) in stores() {
            for i in 0..5 {
                store.append_negative_exemplar("u", 2, "c", &[f64::from(i)], &format!("t{i}"))?;
            }
            store.append_negative_exemplar("u", 9, "c", &[9.0], "elsewhere")?;

            let recent = store.read_negative_exemplars("u", 2, "c", 3)?;
            let ids: Vec<&str> = recent.iter().map(|e| e.track_id.as_str()).collect();
            assert_eq!(ids, vec!["t2", "t3", "t4"], "{name}: newest three, oldest first");
            assert!(store.read_negative_exemplars("other", 2, "c", 50)?.is_empty(), "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_disliked_tracks_from_log() -> Result<()> {
        for (name, store) in stores() {
            store.log_interaction(&interaction("u", "a", InteractionAction::Play))?;
            store.log_interaction(&interaction("u", "b", InteractionAction::Skip))?;
            store.log_interaction(&interaction("u", "c", InteractionAction::Dislike))?;
            store.log_interaction(&interaction("v", "d", InteractionAction::Skip))?;

            let disliked = store.read_disliked_tracks("u")?;
            assert_eq!(disliked, HashSet::from(["b".to_string(), "c".to_string()]), "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_clear_history_only_touches_user() -> Result<()> {
        for (name, store) in stores() {
            store.upsert_affinity("u", 0, 10.0, true, "c")?;
            store.upsert_affinity("v", 0, 10.0, true, "c")?;
            store.log_interaction(&interaction("u", "a", InteractionAction::Skip))?;
            store.append_negative_exemplar("u", 0, "c", &[1.0], "a")?;
            store.write_centroid("u", 0, "c", &[1.0], 0.1)?;

            store.clear_history("u")?;
            assert!(store.read_profile("u", "c")?.is_empty(), "{name}");
            assert!(store.read_disliked_tracks("u")?.is_empty(), "{name}");
            assert!(store.read_negative_exemplars("u", 0, "c", 50)?.is_empty(), "{name}");
            assert!(store.read_centroid("u", 0, "c")?.is_none(), "{name}");
            assert_eq!(store.read_profile("v", "c")?.len(), 1, "{name}: other users keep history");
        }
        Ok(())
    }
}
