//! # Command-Line Interface Module
//!
//! Clap derive definitions for the `cadence` binary. Each subcommand maps to
//! one operation of [`IntelligenceService`](crate::service::IntelligenceService)
//! and prints its result as JSON.
//!
//! ## Commands
//!
//! - `start`: Open a new listening session
//! - `record`: Record a play, pause or skip
//! - `session`: Show a session's events and aggregates
//! - `context`: Show the scoring context a session resolves to
//! - `recommend`: Rank candidate tracks
//! - `manifest`: Build an offline cache manifest
//! - `health`: Check the session store
//! - `completion`: Print shell completions
//!
//! ## Examples
//!
//! ```bash
//! SID=$(cadence start --device phone | jq -r .session_id)
//! cadence record "$SID" play track-42 --position 180 --duration 200 --artist "Nils Frahm"
//! cadence recommend --session "$SID" --catalog catalog.json --query piano --limit 5
//! cadence manifest --session "$SID" --candidates tracks.json --budget-bytes 104857600
//! ```

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Cadence: session-aware music recommendations and offline cache prediction")]
#[command(version)]
pub struct Args {
    /// Path to a JSON configuration file
    ///
    /// Defaults to `config.json` in the platform data directory when present.
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the SQLite session database (overrides the config file)
    #[arg(long, global = true, env = "CADENCE_DB")]
    pub db: Option<PathBuf>,

    /// Keep sessions in memory only (they end with the process)
    #[arg(long, global = true)]
    pub memory: bool,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Where candidate tracks come from.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct CandidateArgs {
    /// JSON file with an array of candidate tracks
    #[arg(long, conflicts_with = "query")]
    pub candidates: Option<PathBuf>,

    /// Search the catalog for candidates instead
    #[arg(long, requires = "catalog")]
    pub query: Option<String>,

    /// JSON catalog file (`{ "tracks": [...], "popular": [...] }`)
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Maximum number of tracks a catalog query returns
    #[arg(long, default_value = "100")]
    pub search_limit: usize,
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a new listening session and print its id
    Start {
        /// Device hint stored with the session
        #[arg(long)]
        device: Option<String>,

        /// Mark the listener as anonymous (generic manifests)
        #[arg(long)]
        anonymous: bool,

        /// Listener id; carries recent activity across sessions
        #[arg(long, conflicts_with = "anonymous")]
        user: Option<String>,
    },

    /// Record a playback event and print the updated aggregates
    ///
    /// Fails with a "not found" error once the session has expired; start a
    /// new one in that case.
    Record {
        /// Session id returned by `start`
        session: String,

        /// Event kind: play, pause or skip
        kind: String,

        /// Track identifier
        track: String,

        /// Playback position in seconds
        #[arg(long)]
        position: Option<f64>,

        /// Track duration in seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Artist of the track, used for affinity scoring
        #[arg(long)]
        artist: Option<String>,

        /// Genre/mood tag of the track (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Event time in unix milliseconds (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Show a session's retained events and aggregates
    Session {
        session: String,
    },

    /// Show the scoring context for a session (or the generic one)
    Context {
        #[arg(long)]
        session: Option<String>,

        /// Track currently playing, overriding the session's
        #[arg(long)]
        current: Option<String>,
    },

    /// Rank candidate tracks for a listener
    Recommend {
        #[arg(long)]
        session: Option<String>,

        #[command(flatten)]
        candidates: CandidateArgs,

        /// Number of results
        #[arg(long, default_value = "10", allow_negative_numbers = true)]
        limit: i64,

        /// Track currently playing; excluded from the results
        #[arg(long)]
        current: Option<String>,
    },

    /// Build an offline cache manifest
    Manifest {
        #[arg(long)]
        session: Option<String>,

        #[command(flatten)]
        candidates: CandidateArgs,

        /// Budget as a number of tracks
        #[arg(long, conflicts_with = "budget_bytes")]
        budget_count: Option<usize>,

        /// Budget in bytes
        #[arg(long)]
        budget_bytes: Option<u64>,

        /// Track currently playing; always pinned in must-cache
        #[arg(long)]
        current: Option<String>,

        /// Popularity order for anonymous listeners (repeatable)
        #[arg(long = "popular")]
        popular: Vec<String>,
    },

    /// Check that the session store answers
    Health,

    /// Generate shell completions
    ///
    /// Install with e.g. `cadence completion bash > ~/.local/share/bash-completion/completions/cadence`
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}
