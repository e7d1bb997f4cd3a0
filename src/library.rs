//! # Library Module
//!
//! In-memory embedding library. A [`LibrarySource`] is read once per collection and
//! materialised into a [`Library`]; nothing downstream goes back to the source.
//!
//! ## Sources
//!
//! - [`JsonLibrarySource`]: a JSON file, either a bare array of tracks or an object
//!   mapping collection names to track arrays
//! - [`MemoryLibrarySource`]: collections held in memory (tests, embedding callers)
//!
//! The pseudo-collection [`MERGED_COLLECTION`] loads every collection a source knows.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Stable identifier of a track within a library.
pub type TrackId = String;

/// Collection name used when a JSON file holds a bare array of tracks.
pub const DEFAULT_COLLECTION: &str = "default";

/// Loads the union of every collection a source knows.
pub const MERGED_COLLECTION: &str = "merged";

fn default_local() -> bool {
    true
}

/// One playable item with its audio embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub label: String,
    pub embedding: Vec<f64>,
    /// Total length in seconds, when known.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Remote playable id, if the track can be streamed.
    #[serde(default)]
    pub stream_id: Option<String>,
    /// A local file exists for this track.
    #[serde(default = "default_local")]
    pub local: bool,
    #[serde(default)]
    pub collection: String,
}

impl Track {
    #[must_use]
    pub fn new(id: impl Into<String>, label: impl Into<String>, embedding: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            embedding,
            duration: None,
            stream_id: None,
            local: true,
            collection: String::new(),
        }
    }

    #[must_use]
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    #[must_use]
    pub fn remote_only(mut self) -> Self {
        self.local = false;
        self
    }
}

/// Which tracks a session may be offered. Chosen once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityMode {
    #[default]
    Any,
    LocalOnly,
    StreamOnly,
}

impl AvailabilityMode {
    #[must_use]
    pub fn admits(self, track: &Track) -> bool {
        match self {
            Self::Any => true,
            Self::LocalOnly => track.local,
            Self::StreamOnly => track.stream_id.is_some(),
        }
    }
}

/// Immutable, fixed-dimension set of tracks.
#[derive(Debug, Clone, Default)]
pub struct Library {
    tracks: Vec<Track>,
    index: HashMap<TrackId, usize>,
    dimension: usize,
}

impl Library {
    /// Build a library, dropping tracks that would break its invariants.
    ///
    /// The first non-empty embedding fixes the dimension. Later tracks with a different
    /// dimension, an empty embedding or a repeated id are skipped with a warning.
    #[must_use]
    pub fn new(tracks: Vec<Track>) -> Self {
        let dimension = tracks
            .iter()
            .map(|t| t.embedding.len())
            .find(|&len| len > 0)
            .unwrap_or(0);

        let mut kept = Vec::with_capacity(tracks.len());
        let mut index = HashMap::with_capacity(tracks.len());
        for track in tracks {
            if track.embedding.len() != dimension || dimension == 0 {
                warn!(
                    "Skipping track {} with embedding dimension {} (library uses {dimension})",
                    track.id,
                    track.embedding.len()
                );
                continue;
            }
            if track.embedding.iter().any(|x| !x.is_finite()) {
                warn!("Skipping track {} with non-finite embedding values", track.id);
                continue;
            }
            if index.contains_key(&track.id) {
                warn!("Skipping duplicate track id {}", track.id);
                continue;
            }
            index.insert(track.id.clone(), kept.len());
            kept.push(track);
        }

        debug!("Library built with {} tracks, dimension {dimension}", kept.len());
        Self { tracks: kept, index, dimension }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Track> {
        self.index.get(id).map(|&i| &self.tracks[i])
    }

    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Case-insensitive substring match on labels, in library order.
    #[must_use]
    pub fn search(&self, query: &str, mode: AvailabilityMode, limit: usize) -> Vec<&Track> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.tracks
            .iter()
            .filter(|t| mode.admits(t))
            .filter(|t| t.label.to_lowercase().contains(&needle))
            .take(limit)
            .collect()
    }
}

/// Bulk read access to embedding collections.
pub trait LibrarySource: Send + Sync {
    /// Names of the collections this source can load.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn collections(&self) -> Result<Vec<String>>;

    /// Read every track of one collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or cannot be read.
    fn load_collection(&self, collection: &str) -> Result<Vec<Track>>;
}

/// Materialise `collection` (or every collection for [`MERGED_COLLECTION`]).
///
/// A collection that fails to load is logged and skipped, so a broken or missing
/// source degrades to an empty library instead of failing the caller.
pub fn load_library(source: &dyn LibrarySource, collection: &str) -> Library {
    let names = if collection == MERGED_COLLECTION {
        match source.collections() {
            Ok(names) => names,
            Err(e) => {
                warn!("Could not list library collections: {e:#}");
                Vec::new()
            }
        }
    } else {
        vec![collection.to_string()]
    };

    let mut tracks = Vec::new();
    for name in &names {
        match source.load_collection(name) {
            Ok(mut loaded) => {
                for track in &mut loaded {
                    if track.collection.is_empty() {
                        track.collection.clone_from(name);
                    }
                }
                debug!("Loaded {} tracks from collection {name}", loaded.len());
                tracks.extend(loaded);
            }
            Err(e) => warn!("Failed to load collection {name}: {e:#}"),
        }
    }

    let library = Library::new(tracks);
    info!("Library '{collection}' ready: {} tracks", library.len());
    library
}

/// On-disk layout accepted by [`JsonLibrarySource`].
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LibraryFile {
    Flat(Vec<Track>),
    Collections(BTreeMap<String, Vec<Track>>),
}

/// Tracks read from a JSON file.
#[derive(Debug, Clone)]
pub struct JsonLibrarySource {
    path: PathBuf,
}

impl JsonLibrarySource {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    fn read(&self) -> Result<BTreeMap<String, Vec<Track>>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read library file {}", self.path.display()))?;
        let parsed: LibraryFile = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid library JSON in {}", self.path.display()))?;
        Ok(match parsed {
            LibraryFile::Flat(tracks) => BTreeMap::from([(DEFAULT_COLLECTION.to_string(), tracks)]),
            LibraryFile::Collections(map) => map,
        })
    }
}

impl LibrarySource for JsonLibrarySource {
    fn collections(&self) -> Result<Vec<String>> {
        Ok(self.read()?.into_keys().collect())
    }

    fn load_collection(&self, collection: &str) -> Result<Vec<Track>> {
        self.read()?
            .remove(collection)
            .with_context(|| format!("Collection '{collection}' not found in {}", self.path.display()))
    }
}

/// Collections held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLibrarySource {
    collections: BTreeMap<String, Vec<Track>>,
}

impl MemoryLibrarySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_collection(mut self, name: impl Into<String>, tracks: Vec<Track>) -> Self {
        self.collections.insert(name.into(), tracks);
        self
    }
}

impl LibrarySource for MemoryLibrarySource {
    fn collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.keys().cloned().collect())
    }

    fn load_collection(&self, collection: &str) -> Result<Vec<Track>> {
        self.collections
            .get(collection)
            .cloned()
            .with_context(|| format!("Collection '{collection}' not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn track(id: &str, label: &str, embedding: Vec<f64>) -> Track {
        Track::new(id, label, embedding)
    }

    #[test]
    fn test_library_drops_mismatched_dimensions() {
        let library = Library::new(vec![
            track("a", "Alpha", vec![1.0, 0.0]),
            track("b", "Beta", vec![1.0, 0.0, 0.0]),
            track("c", "Gamma", vec![0.0, 1.0]),
        ]);

        assert_eq!(library.len(), 2, "Track with wrong dimension should be skipped");
        assert_eq!(library.dimension(), 2);
        assert!(library.get("b").is_none());
        assert_eq!(library.index_of("c"), Some(1));
    }

    #[test]
    fn test_library_drops_duplicate_ids() {
        let library = Library::new(vec![
            track("a", "First", vec![1.0]),
            track("a", "Second", vec![2.0]),
        ]);

        assert_eq!(library.len(), 1);
        assert_eq!(library.get("a").map(|t| t.label.as_str()), Some("First"));
    }

    #[test]
    fn test_empty_library() {
        let library = Library::new(Vec::new());
        assert!(library.is_empty());
        assert_eq!(library.dimension(), 0);
    }

    #[test]
    fn test_availability_modes() {
        let local = track("l", "Local", vec![1.0]);
        let streamed = track("s", "Stream", vec![1.0]).with_stream_id("sp:1").remote_only();

        assert!(AvailabilityMode::Any.admits(&local));
        assert!(AvailabilityMode::Any.admits(&streamed));
        assert!(AvailabilityMode::LocalOnly.admits(&local));
        assert!(!AvailabilityMode::LocalOnly.admits(&streamed));
        assert!(!AvailabilityMode::StreamOnly.admits(&local));
        assert!(AvailabilityMode::StreamOnly.admits(&streamed));
    }

    #[test]
    fn test_search_is_case_insensitive_and_limited() {
        let library = Library::new(
            (0..30)
                .map(|i| track(&format!("t{i}"), &format!("Night Drive {i}"), vec![f64::from(i)]))
                .collect(),
        );

        let hits = library.search("night DRIVE", AvailabilityMode::Any, 20);
        assert_eq!(hits.len(), 20, "Search should cap results");
        assert_eq!(hits[0].id, "t0");

        assert!(library.search("   ", AvailabilityMode::Any, 20).is_empty());
        assert!(library.search("night", AvailabilityMode::StreamOnly, 20).is_empty());
    }

    #[test]
    fn test_merged_collection_loads_everything() {
        let source = MemoryLibrarySource::new()
            .with_collection("one", vec![track("a", "A", vec![1.0, 0.0])])
            .with_collection("two", vec![track("b", "B", vec![0.0, 1.0])]);

        let library = load_library(&source, MERGED_COLLECTION);
        assert_eq!(library.len(), 2);
        assert_eq!(library.get("b").map(|t| t.collection.as_str()), Some("two"));
    }

    #[test]
    fn test_missing_collection_degrades_to_empty() {
        let source = MemoryLibrarySource::new();
        let library = load_library(&source, "nope");
        assert!(library.is_empty(), "Unknown collection should yield an empty library");
    }

    #[test]
    fn test_json_source_flat_and_nested() -> Result<()> {
        let dir = tempfile::TempDir::new()?;

        let flat = dir.path().join("flat.json");
        let mut file = fs::File::create(&flat)?;
        write!(file, r#"[{{"id":"a","label":"A","embedding":[1.0,0.0],"duration":200.0}}]"#)?;
        let source = JsonLibrarySource::new(&flat);
        assert_eq!(source.collections()?, vec![DEFAULT_COLLECTION.to_string()]);
        let tracks = source.load_collection(DEFAULT_COLLECTION)?;
        assert_eq!(tracks[0].duration, Some(200.0));
        assert!(tracks[0].local, "Tracks default to locally available");

        let nested = dir.path().join("nested.json");
        fs::write(
            &nested,
            r#"{"jazz":[{"id":"j","label":"J","embedding":[0.5],"stream_id":"x","local":false}]}"#,
        )?;
        let library = load_library(&JsonLibrarySource::new(&nested), "jazz");
        assert_eq!(library.len(), 1);
        assert_eq!(library.get("j").and_then(|t| t.stream_id.clone()), Some("x".to_string()));
        Ok(())
    }
}
