//! # Command-Line Interface Module
//!
//! Clap derive definitions for the `vibelock` binary.
//!
//! ## Commands
//!
//! - `cluster`: Fit the library and print every cluster with its representatives
//! - `recommend`: Run an interactive recommendation session on stdin
//! - `profile`: Print a user's persisted cluster affinity
//! - `clear-history`: Forget everything stored for a user
//! - `completion`: Generate shell completions
//!
//! ## Examples
//!
//! ```bash
//! vibelock cluster library.json --k 12
//! vibelock recommend library.json --user alice --mode stream --seed 7
//! vibelock profile --user alice
//! ```

use crate::library::{AvailabilityMode, DEFAULT_COLLECTION};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Which tracks a session may recommend.
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug, Default)]
pub enum Mode {
    /// Everything in the library
    #[default]
    Any,
    /// Only tracks with a local file
    Local,
    /// Only tracks with a stream id
    Stream,
}

impl From<Mode> for AvailabilityMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Any => Self::Any,
            Mode::Local => Self::LocalOnly,
            Mode::Stream => Self::StreamOnly,
        }
    }
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "vibelock")]
#[command(about = "vibelock: adaptive next-track recommendations from audio embeddings")]
#[command(version)]
pub struct Args {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fit clusters over a library and print them
    ///
    /// Runs k-means over the embeddings of one collection and prints each
    /// cluster's size, density, outlier count and the tracks closest to its
    /// centroid.
    Cluster {
        /// JSON library file (a list of tracks, or a map of collection name to tracks)
        #[arg(value_hint = clap::ValueHint::FilePath)]
        library: PathBuf,

        /// Collection to load (`merged` loads all of them)
        #[arg(long, default_value = DEFAULT_COLLECTION)]
        collection: String,

        /// Number of clusters (overrides the config file)
        #[arg(long)]
        k: Option<usize>,

        /// Representatives printed per cluster
        #[arg(long, default_value = "5")]
        representatives: usize,

        /// JSON engine config
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        config: Option<PathBuf>,
    },

    /// Start an interactive recommendation session
    ///
    /// Reads commands from stdin, one per line:
    /// `next`, `batch [n]`, `play <id> <secs>`, `like <id>`, `dislike <id>`,
    /// `seed <id>`, `search <query>`, `reset`, `state`, `quit`.
    ///
    /// Listening history is stored per user, so later sessions start from what
    /// earlier ones learned. The user `guest` is never stored.
    Recommend {
        /// JSON library file
        #[arg(value_hint = clap::ValueHint::FilePath)]
        library: PathBuf,

        /// User whose history is read and written
        #[arg(long, default_value = "guest")]
        user: String,

        /// Collection to recommend from
        #[arg(long, default_value = DEFAULT_COLLECTION)]
        collection: String,

        /// Availability filter for the whole session
        #[arg(long, value_enum, default_value_t = Mode::Any)]
        mode: Mode,

        /// Seed for reproducible sessions
        #[arg(long)]
        seed: Option<u64>,

        /// JSON engine config
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        config: Option<PathBuf>,

        /// Affinity database (defaults to the platform data directory)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        db: Option<PathBuf>,
    },

    /// Print a user's cluster affinity, most listened first
    Profile {
        #[arg(long)]
        user: String,

        #[arg(long, default_value = DEFAULT_COLLECTION)]
        collection: String,

        /// Affinity database (defaults to the platform data directory)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        db: Option<PathBuf>,
    },

    /// Delete every stored affinity, centroid, exemplar and log row of a user
    ClearHistory {
        #[arg(long)]
        user: String,

        /// Affinity database (defaults to the platform data directory)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        db: Option<PathBuf>,
    },

    /// Generate shell completions
    ///
    /// Usage: vibelock completion bash > ~/.local/share/bash-completion/completions/vibelock
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}
