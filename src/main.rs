//! # vibelock
//!
//! Command-line front end for the recommendation engine.
//!
//! ## Usage
//!
//! ```bash
//! # Inspect how a library clusters
//! vibelock cluster library.json --k 12
//!
//! # Interactive session with persisted history
//! vibelock recommend library.json --user alice
//!
//! # What the engine remembers about a user
//! vibelock profile --user alice
//! ```

use anyhow::Result;
use clap::{CommandFactory, Parser};
use log::{debug, info};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vibelock::cli::{self, Command};
use vibelock::cluster::ClusterSnapshot;
use vibelock::completion;
use vibelock::config::{EngineConfig, RuntimeConfig};
use vibelock::console;
use vibelock::db::{AffinityStore, SqliteAffinityStore};
use vibelock::engine::Engine;
use vibelock::library::{load_library, JsonLibrarySource};

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            info!("Loading engine config from {}", path.display());
            EngineConfig::load(path)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn runtime_config(db: Option<PathBuf>) -> Result<RuntimeConfig> {
    match db {
        Some(path) => Ok(RuntimeConfig::with_db_path(path)),
        None => RuntimeConfig::new(),
    }
}

fn print_clusters(snapshot: &ClusterSnapshot, representatives: usize) {
    let library = snapshot.library();
    println!("{} tracks in {} clusters", library.len(), snapshot.len());
    for cluster in snapshot.clusters() {
        println!(
            "\nCluster {:>3}: {} tracks, density {:.2}, {} outliers",
            cluster.id,
            cluster.members.len(),
            cluster.density,
            cluster.outliers.len()
        );
        for id in snapshot.representatives(cluster.id, representatives) {
            let label = library.get(id).map_or("", |t| t.label.as_str());
            println!("    {id:<24} {label}");
        }
    }
}

/// Main entry point.
///
/// Logging is controlled through `RUST_LOG`:
/// - `RUST_LOG=debug vibelock recommend lib.json` - Everything
/// - `RUST_LOG=vibelock::queue=debug vibelock recommend lib.json` - Selection decisions only
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();

    match args.command {
        Command::Cluster { library, collection, k, representatives, config } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(k) = k {
                config.cluster.k = k;
            }
            let source = JsonLibrarySource::new(&library);
            let library = Arc::new(load_library(&source, &collection));
            info!("Fitting {} tracks from {collection}", library.len());
            let snapshot = ClusterSnapshot::fit(library, &config.cluster);
            print_clusters(&snapshot, representatives);
        }
        Command::Recommend { library, user, collection, mode, seed, config, db } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(seed) = seed {
                config.rng_seed = Some(seed);
            }
            let runtime = runtime_config(db)?;
            debug!("Affinity database: {}", runtime.db_path.display());
            let store = SqliteAffinityStore::open(&runtime.db_path)?;

            let engine = Engine::builder(Arc::new(JsonLibrarySource::new(&library)), Arc::new(store))
                .with_config(config)
                .build();
            let session = engine.create_session(&user, &collection, mode.into())?;

            let stdin = io::stdin();
            let mut stdout = io::stdout();
            console::run(&engine, session, stdin.lock(), &mut stdout)?;
            engine.end_session(session)?;
        }
        Command::Profile { user, collection, db } => {
            let runtime = runtime_config(db)?;
            let store = SqliteAffinityStore::open(&runtime.db_path)?;
            let profile = store.read_profile(&user, &collection)?;
            if profile.is_empty() {
                println!("No history for {user} in {collection}");
            }
            for record in profile {
                let last = record
                    .last_positive_ts
                    .map_or_else(|| "never".to_string(), |ts| ts.format("%Y-%m-%d %H:%M").to_string());
                println!(
                    "cluster {:>3}  {:>8.0}s listened  {:>4} positives  {:>4} tracks  last positive {last}",
                    record.cluster_id, record.total_listen_seconds, record.positive_count, record.track_count
                );
            }
        }
        Command::ClearHistory { user, db } => {
            let runtime = runtime_config(db)?;
            let store = SqliteAffinityStore::open(&runtime.db_path)?;
            store.clear_history(&user)?;
            println!("Cleared history for {user}");
        }
        Command::Completion { shell } => {
            let mut cmd = cli::Args::command();
            completion::generate_completions(
                completion::shell_to_completion_shell(shell),
                &mut cmd,
                &mut io::stdout(),
            );
        }
    }

    Ok(())
}
