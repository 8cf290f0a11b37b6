//! # Cadence
//!
//! Command-line front end for the session-aware recommendation engine. Every
//! subcommand prints JSON on stdout; logs go to stderr and are controlled with
//! `RUST_LOG`.
//!
//! ## Usage
//!
//! ```bash
//! # Open a session and feed it events
//! cadence start --device laptop
//! cadence record <session> play track-1 --position 200 --duration 210
//! cadence record <session> skip track-2 --position 3 --duration 180
//!
//! # Ask for recommendations and a cache manifest
//! cadence recommend --session <session> --candidates tracks.json --limit 5
//! cadence manifest --session <session> --catalog catalog.json --budget-count 10
//! ```

use anyhow::{bail, Result};
use cadence::catalog::{load_tracks, CandidateInput, FileCatalog};
use cadence::cli::{self, CandidateArgs};
use cadence::clock::{Clock, SystemClock};
use cadence::completion;
use cadence::config::{RuntimeConfig, StoreBackend};
use cadence::predictor::Budget;
use cadence::service::{IntelligenceService, ManifestRequest, RecommendRequest};
use cadence::session::{EventInput, SessionSeed};
use cadence::store::{open_store, SessionStore};
use clap::Parser;
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolve configuration: explicit file, then the default file, then
/// command-line overrides.
fn load_config(args: &cli::Args) -> Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::new()?,
    };
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    if args.memory {
        config.store_backend = StoreBackend::Memory;
    }
    debug!("Effective configuration: {config:?}");
    Ok(config)
}

/// Candidate input and optional catalog for one request.
fn candidate_source(args: &CandidateArgs) -> Result<(CandidateInput, Option<FileCatalog>)> {
    let catalog = args.catalog.as_deref().map(FileCatalog::load).transpose()?;
    let input = match (&args.candidates, &args.query) {
        (Some(path), _) => CandidateInput::Tracks(load_tracks(path)?),
        (None, Some(query)) => CandidateInput::Query {
            query: query.clone(),
            limit: args.search_limit,
        },
        (None, None) if catalog.is_some() => CandidateInput::Query {
            query: String::new(),
            limit: args.search_limit,
        },
        (None, None) => CandidateInput::default(),
    };
    Ok((input, catalog))
}

fn with_catalog<S: SessionStore>(
    service: IntelligenceService<S>,
    catalog: Option<FileCatalog>,
) -> IntelligenceService<S> {
    match catalog {
        Some(catalog) => service.with_catalog(Box::new(catalog)),
        None => service,
    }
}

/// Main entry point for the Cadence CLI.
///
/// # Logging
///
/// - `RUST_LOG=debug cadence recommend ...` - Enable debug logging
/// - `RUST_LOG=cadence::engine=trace cadence recommend ...` - Per-candidate scores
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();

    if let cli::Command::Completion { shell } = args.command {
        completion::print_completions(shell);
        return Ok(());
    }

    let config = load_config(&args)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&config, Arc::clone(&clock));
    let service = IntelligenceService::new(store, clock, &config);

    match args.command {
        cli::Command::Start {
            device,
            anonymous,
            user,
        } => {
            let session_id = service.start_session(SessionSeed {
                device,
                anonymous,
                user_id: user,
            })?;
            print_json(&serde_json::json!({ "session_id": session_id }))?;
        }
        cli::Command::Record {
            session,
            kind,
            track,
            position,
            duration,
            artist,
            tags,
            timestamp,
        } => {
            let input = EventInput {
                kind,
                track_id: track,
                timestamp,
                position,
                duration,
                artist,
                tags,
            };
            let aggregates = service.record_event(&session, input)?;
            print_json(&aggregates)?;
        }
        cli::Command::Session { session } => {
            print_json(&service.session(&session)?)?;
        }
        cli::Command::Context { session, current } => {
            print_json(&service.resolve_context(session.as_deref(), current))?;
        }
        cli::Command::Recommend {
            session,
            candidates,
            limit,
            current,
        } => {
            let (input, catalog) = candidate_source(&candidates)?;
            let service = with_catalog(service, catalog);
            let recs = service.recommend(&RecommendRequest {
                session_id: session,
                candidates: input,
                limit,
                current_track: current,
            });
            info!("Returning {} recommendations", recs.tracks.len());
            print_json(&recs)?;
        }
        cli::Command::Manifest {
            session,
            candidates,
            budget_count,
            budget_bytes,
            current,
            popular,
        } => {
            let (input, catalog) = candidate_source(&candidates)?;
            let service = with_catalog(service, catalog);
            let budget = budget_bytes
                .map(Budget::Bytes)
                .or(budget_count.map(Budget::Count));
            let manifest = service.predict_manifest(&ManifestRequest {
                session_id: session,
                candidates: input,
                budget,
                current_track: current,
                popular,
            });
            print_json(&manifest)?;
        }
        cli::Command::Health => {
            let report = service.health();
            print_json(&report)?;
            if !report.store_ok {
                bail!("session store is not responding");
            }
        }
        // Printed before the store was opened.
        cli::Command::Completion { .. } => {}
    }

    Ok(())
}
