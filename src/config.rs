//! # Configuration Module
//!
//! Data directory setup and engine tuning for vibelock.
//!
//! ## Data Storage
//!
//! The affinity database lives in the platform-standard data directory:
//! - Linux: `~/.local/share/vibelock/`
//! - macOS: `~/Library/Application Support/vibelock/`
//! - Windows: `%APPDATA%\vibelock\`
//!
//! ## Tuning
//!
//! [`EngineConfig`] gathers every constant the engine uses. Each section defaults
//! field by field, so a JSON file only needs the values it changes:
//!
//! ```json
//! { "cluster": { "k": 8 }, "queue": { "batch_size": 10 }, "rng_seed": 7 }
//! ```

use crate::algorithm::ScoringContext;
use crate::bandit::BanditConfig;
use crate::cluster::ClusterConfig;
use crate::feedback::FeedbackConfig;
use crate::queue::QueueConfig;
use crate::session::SessionTuning;
use crate::taste::LearningRates;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "vibelock";
const DB_FILE: &str = "affinity.db";

/// Returns the platform-appropriate database file path.
///
/// Creates the `vibelock` data directory when it is missing.
///
/// # Errors
///
/// This function will return an error if:
/// - The system data directory cannot be determined
/// - The vibelock subdirectory cannot be created due to permissions
///
/// # Examples
///
/// ```no_run
/// use vibelock::config::get_db_path;
///
/// let db_path = get_db_path()?;
/// println!("Affinity database: {}", db_path.display());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(DB_FILE))
}

/// Returns the vibelock data directory, creating it if needed.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system data directory. Please ensure your platform supports standard data directories."
        )
    })?;

    let app_dir = data_dir.join(APP_DIR);
    fs::create_dir_all(&app_dir).with_context(|| {
        format!(
            "Failed to create vibelock data directory at {}. Please check file permissions.",
            app_dir.display()
        )
    })?;

    Ok(app_dir)
}

/// Every tuning constant of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cluster: ClusterConfig,
    pub bandit: BanditConfig,
    pub rates: LearningRates,
    pub tuning: SessionTuning,
    pub feedback: FeedbackConfig,
    pub queue: QueueConfig,
    pub scoring: ScoringContext,
    /// Base seed for per-session RNGs. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
    /// Register the built-in instant-skip rebalancing hook.
    pub skip_rebalance: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            bandit: BanditConfig::default(),
            rates: LearningRates::default(),
            tuning: SessionTuning::default(),
            feedback: FeedbackConfig::default(),
            queue: QueueConfig::default(),
            scoring: ScoringContext::default(),
            rng_seed: None,
            skip_rebalance: true,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("Failed to parse engine config")?;
        Ok(config)
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

/// Configuration for runtime behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path to the affinity database
    pub db_path: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: get_db_path().unwrap_or_else(|_| PathBuf::from(DB_FILE)),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Result<Self> {
        Ok(Self { db_path: get_db_path()? })
    }

    /// Create configuration with explicit database path
    pub fn with_db_path(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_get_db_path_structure() {
        let path = get_db_path().expect("Should get valid path");
        assert!(path.is_absolute(), "Database path should be absolute");
        assert!(path.to_string_lossy().ends_with("affinity.db"));

        let parent = path.parent().expect("Should have parent directory");
        assert_eq!(parent.file_name().and_then(|n| n.to_str()), Some("vibelock"));
        assert!(parent.is_dir(), "Data directory should exist after the call");
    }

    #[test]
    fn test_get_db_path_consistent_results() {
        let first = get_db_path().expect("First call should succeed");
        let second = get_db_path().expect("Second call should succeed");
        assert_eq!(first, second);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "cluster": { "k": 8 }, "rng_seed": 7 }"#)
            .expect("Partial config should parse");
        assert_eq!(config.cluster.k, 8);
        assert_eq!(config.cluster.restarts, ClusterConfig::default().restarts);
        assert_eq!(config.rng_seed, Some(7));
        assert!(config.skip_rebalance, "Hook stays on unless disabled");
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("vibelock.json");
        fs::write(&path, r#"{ "tuning": { "exhaustion_threshold": 3 }, "skip_rebalance": false }"#)
            .expect("Failed to write config");

        let config = EngineConfig::load(&path).expect("Config should load");
        assert_eq!(config.tuning.exhaustion_threshold, 3);
        assert!(!config.skip_rebalance);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(EngineConfig::from_json_str("{ not json").is_err());
        assert!(EngineConfig::load("/nonexistent/vibelock.json").is_err());
    }

    #[test]
    fn test_runtime_config_with_db_path() {
        let config = RuntimeConfig::with_db_path(PathBuf::from("/tmp/test.db"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/test.db"));
    }
}
