//! Session-aware music recommendations and offline cache prediction.
//!
//! Core modules:
//! - [`tracker`] - Session creation and playback event recording
//! - [`context`] - Scoring context from a session (or none)
//! - [`engine`] - Candidate scoring and ranking
//! - [`predictor`] - Must-cache / likely-next manifests
//! - [`store`] - TTL-bounded session storage (SQLite, in-memory)
//!
//! ### Supporting Modules
//!
//! - [`service`] - Request-level API with graceful degradation
//! - [`session`] - Events, aggregates and session records
//! - [`catalog`] - Track metadata and the search provider seam
//! - [`config`] - Configuration and data directory management
//! - [`clock`] - Injectable time source
//! - [`error`] - Typed errors
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```
//! use cadence::catalog::{CandidateInput, Track};
//! use cadence::clock::{Clock, SystemClock};
//! use cadence::config::RuntimeConfig;
//! use cadence::service::{IntelligenceService, ManifestRequest, RecommendRequest};
//! use cadence::session::{EventInput, SessionSeed};
//! use cadence::store::MemoryStore;
//! use std::sync::Arc;
//!
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let store = MemoryStore::new(Arc::clone(&clock));
//! let service = IntelligenceService::new(store, clock, &RuntimeConfig::default());
//!
//! // Track a listening session
//! let session = service.start_session(SessionSeed::default())?;
//! service.record_event(&session, EventInput::new("play", "a").progress(190.0, 200.0))?;
//! service.record_event(&session, EventInput::new("skip", "b").progress(4.0, 180.0))?;
//!
//! let candidates = CandidateInput::Tracks(vec![
//!     Track::new("a").by("Nils Frahm"),
//!     Track::new("b").by("Justice"),
//!     Track::new("c").by("Nils Frahm"),
//! ]);
//!
//! // Ranked recommendations
//! let recs = service.recommend(&RecommendRequest {
//!     session_id: Some(session.clone()),
//!     candidates: candidates.clone(),
//!     limit: 3,
//!     current_track: None,
//! });
//! assert_eq!(recs.tracks.last().map(|t| t.track.id.as_str()), Some("b"));
//!
//! // Offline cache manifest
//! let manifest = service.predict_manifest(&ManifestRequest {
//!     session_id: Some(session),
//!     candidates,
//!     ..ManifestRequest::default()
//! });
//! assert!(!manifest.must_cache.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Algorithm Details
//!
//! ### Sessions
//! - Events (`play`, `pause`, `skip`) are appended to a bounded, TTL-refreshed list
//! - Aggregates are recomputed from the retained events on every read and write
//! - Skip rate covers a trailing window; dwell time is an exponentially weighted average
//!
//! ### Scoring
//! - Recency affinity: shared artist or tag with recent tracks, decaying with age
//! - Time-of-day affinity: static mood table per bucket
//! - Skip penalty applied uniformly and flattening the affinity terms
//! - Flat bonus for completed tracks, flat penalty for skipped ones
//! - Greedy diversity pass limiting same-artist runs
//!
//! ### Cache Prediction
//! - Current track pinned, then the top-ranked candidates
//! - Likely-next tail bounded by a count or byte budget
//! - Anonymous listeners ranked by an external popularity order instead
//!
//! ## Error Handling
//!
//! Library operations return typed errors ([`error::SessionError`],
//! [`error::StoreError`], [`error::ConfigError`]); the binary and the
//! file-loading helpers use `anyhow::Result` with context. Read paths never
//! fail on a missing session or a store outage; they return a generic answer.
//!
//! ## Testing
//!
//! ```bash
//! cargo test
//! cargo bench
//! ```

pub mod catalog;
pub mod cli;
pub mod clock;
pub mod completion;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod predictor;
pub mod service;
pub mod session;
pub mod store;
pub mod tracker;
