//! Adaptive next-track recommendations over a library of audio embeddings.
//!
//! Core modules:
//! - [`library`] - Tracks, availability modes and library sources
//! - [`algorithm`] - Vector math and the similarity scoring kernel
//! - [`cluster`] - k-means snapshots with outliers, density and representatives
//! - [`bandit`] - Thompson-sampled cluster choice over Beta posteriors
//! - [`taste`] - The evolving session taste vector
//! - [`session`] - Vibe-lock state machine and phase policy
//! - [`queue`] - Target selection, candidate filtering and the fallback chain
//! - [`feedback`] - Engagement classification and post-feedback hooks
//! - [`db`] - Persistent per-user affinity (SQLite and in-memory)
//! - [`engine`] - The caller-facing session API
//!
//! ### Supporting Modules
//!
//! - [`config`] - Data directory and tuning constants
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`console`] - Interactive session loop used by `vibelock recommend`
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vibelock::db::SqliteAffinityStore;
//! use vibelock::engine::Engine;
//! use vibelock::feedback::Feedback;
//! use vibelock::library::{AvailabilityMode, JsonLibrarySource};
//!
//! let store = SqliteAffinityStore::open(vibelock::config::get_db_path()?)?;
//! let engine = Engine::builder(Arc::new(JsonLibrarySource::new("library.json")), Arc::new(store)).build();
//!
//! let session = engine.create_session("alice", "default", AvailabilityMode::Any)?;
//! for pick in engine.next_batch(session, 5)? {
//!     println!("[{}] {} ({})", pick.phase, pick.label, pick.justification);
//! }
//! engine.feedback(session, Feedback::listened("track-17", 3.0))?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## How a Session Learns
//!
//! ### Phases
//! - **PROBE**: no signal yet. Start from the user's strongest historical clusters, or
//!   a random dense cluster for new users.
//! - **EXPLOIT**: stay near recent likes. While vibe-locked (streak > 0) every pick is
//!   scored against a single recent like with a tight kernel.
//! - **EXPLORE**: score around the mean of the likes with a wide kernel.
//!
//! ### Feedback
//! - Listen time is classified into strong/soft negatives, weak positives, likes and
//!   finished listens
//! - Positives deepen the lock and pull the taste vector closer
//! - Five consecutive negatives exhaust the lock and force a breakout into another cluster
//!
//! ## Error Handling
//!
//! Public functions return `anyhow::Result`. Unknown session ids are errors. Unknown
//! tracks and empty libraries are not: they degrade to no-ops and empty results.
//! Store failures during a session are logged and the session carries on.

pub mod algorithm;
pub mod bandit;
pub mod cli;
pub mod cluster;
pub mod completion;
pub mod config;
pub mod console;
pub mod db;
pub mod engine;
pub mod feedback;
pub mod library;
pub mod queue;
pub mod session;
pub mod taste;
