//! # Configuration Module
//!
//! This module handles configuration management and data directory setup for
//! Cadence. It provides platform-appropriate storage locations, the tunables
//! for session tracking, scoring and cache prediction, and loading of an
//! optional JSON configuration file.
//!
//! ## Data Storage
//!
//! Cadence stores its session database in the platform-standard data directory:
//! - Linux: `~/.local/share/cadence/`
//! - macOS: `~/Library/Application Support/cadence/`
//! - Windows: `%APPDATA%\cadence\`
//!
//! ## Configuration File
//!
//! `config.json` in the same directory (or any path given with `--config`)
//! may override any subset of [`RuntimeConfig`]; missing fields keep their
//! defaults.
//!
//! ```json
//! {
//!   "store_backend": "sqlite",
//!   "session": { "ttl_secs": 3600, "max_events": 100 },
//!   "engine": { "recency": 1.5, "max_consecutive_artist": 1 },
//!   "predictor": { "must_cache_top_k": 4 }
//! }
//! ```

use crate::engine::EngineWeights;
use crate::error::ConfigError;
use crate::predictor::PredictorConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns the platform-appropriate data directory for Cadence.
///
/// The `cadence` subdirectory is created if it does not exist yet.
///
/// # Errors
///
/// Fails if the system data directory cannot be determined or the
/// subdirectory cannot be created (permissions, read-only filesystem).
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!(
            "Could not determine system data directory. Please ensure your platform supports standard data directories."
        ))?;

    let cadence_dir = data_dir.join("cadence");
    fs::create_dir_all(&cadence_dir)
        .with_context(|| format!(
            "Failed to create Cadence data directory at {}. Please check file permissions.",
            cadence_dir.display()
        ))?;

    Ok(cadence_dir)
}

/// Returns the platform-appropriate session database path (`sessions.db`).
///
/// # Examples
///
/// ```no_run
/// use cadence::config::get_db_path;
///
/// let db_path = get_db_path()?;
/// println!("Session store location: {}", db_path.display());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("sessions.db"))
}

/// Default location of the optional configuration file.
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.json"))
}

/// Which [`SessionStore`](crate::store::SessionStore) adapter to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Durable SQLite file shared by every process using the same path.
    #[default]
    Sqlite,
    /// Process-local map. Sessions die with the process.
    Memory,
}

/// Session lifetime, retention and aggregate tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sliding TTL, refreshed on every recorded event.
    pub ttl_secs: u64,
    /// Count bound on retained events; the oldest is evicted first.
    pub max_events: usize,
    /// Optional age bound on retained events.
    pub max_event_age_secs: Option<u64>,
    /// Trailing number of events the skip rate is computed over.
    pub skip_window: usize,
    /// Smoothing factor of the dwell-time moving average.
    pub dwell_alpha: f64,
    /// Position/duration ratio at which a play counts as completed.
    pub completion_threshold: f64,
    /// How many distinct recent tracks a context carries.
    pub recent_tracks: usize,
    /// Count bound on the per-user activity log.
    pub user_activity_max: usize,
    /// TTL of the per-user activity log, refreshed on every mirrored event.
    pub user_activity_ttl_secs: u64,
    /// Minimum gap between two expired-key purges run from `start_session`.
    pub purge_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_events: 200,
            max_event_age_secs: None,
            skip_window: 20,
            dwell_alpha: 0.3,
            completion_threshold: 0.8,
            recent_tracks: 10,
            user_activity_max: 100,
            user_activity_ttl_secs: 7 * 24 * 60 * 60,
            purge_interval_secs: 10 * 60,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn user_activity_ttl(&self) -> Duration {
        Duration::from_secs(self.user_activity_ttl_secs)
    }

    #[must_use]
    pub fn max_event_age(&self) -> Option<Duration> {
        self.max_event_age_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::invalid("session.ttl_secs", "must be positive"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::invalid("session.max_events", "must be positive"));
        }
        if self.user_activity_max == 0 || self.user_activity_ttl_secs == 0 {
            return Err(ConfigError::invalid(
                "session.user_activity_max",
                "user activity bounds must be positive",
            ));
        }
        if self.skip_window == 0 {
            return Err(ConfigError::invalid("session.skip_window", "must be positive"));
        }
        if !(self.dwell_alpha > 0.0 && self.dwell_alpha <= 1.0) {
            return Err(ConfigError::invalid("session.dwell_alpha", "must be in (0, 1]"));
        }
        if !(self.completion_threshold > 0.0 && self.completion_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "session.completion_threshold",
                "must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

/// Configuration for runtime behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the SQLite session database
    pub db_path: PathBuf,
    pub store_backend: StoreBackend,
    /// Upper bound on any single store call.
    pub store_timeout_ms: u64,
    /// Listener timezone used for time-of-day buckets, in minutes east of UTC.
    pub utc_offset_minutes: i32,
    pub session: SessionConfig,
    pub engine: EngineWeights,
    pub predictor: PredictorConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: get_db_path().unwrap_or_else(|_| PathBuf::from("sessions.db")),
            store_backend: StoreBackend::default(),
            store_timeout_ms: 2_000,
            utc_offset_minutes: 0,
            session: SessionConfig::default(),
            engine: EngineWeights::default(),
            predictor: PredictorConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from the default config path if present, otherwise defaults.
    pub fn new() -> Result<Self> {
        let path = get_config_path()?;
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Create configuration with explicit database path
    pub fn with_db_path(db_path: PathBuf) -> Self {
        Self {
            db_path,
            ..Self::default()
        }
    }

    /// Read and validate a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::invalid("store_timeout_ms", "must be positive"));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::invalid(
                "utc_offset_minutes",
                "must be within one day of UTC",
            ));
        }
        self.session.validate()?;
        self.engine.validate()?;
        self.predictor.validate()?;
        Ok(())
    }
}
