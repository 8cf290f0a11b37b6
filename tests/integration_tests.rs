//! # Integration Tests for Cadence
//!
//! End-to-end tests through the public API (SQLite store on a temporary
//! file, manual clock) and through the `cadence` binary.

use anyhow::Result;
use cadence::catalog::{CandidateInput, Track};
use cadence::clock::ManualClock;
use cadence::config::RuntimeConfig;
use cadence::service::{IntelligenceService, ManifestRequest, RecommendRequest};
use cadence::session::{EventInput, SessionSeed};
use cadence::store::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// 2024-06-01T19:00:00Z
const EVENING: i64 = 1_717_268_400_000;

/// Test helper opening a service over a fresh SQLite file
fn create_test_service() -> Result<(TempDir, PathBuf, IntelligenceService<SqliteStore>, Arc<ManualClock>)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("sessions.db");
    let clock = Arc::new(ManualClock::new(EVENING));
    let store = SqliteStore::open(&db_path, Duration::from_secs(2), clock.clone())?;
    let service = IntelligenceService::new(store, clock.clone(), &RuntimeConfig::with_db_path(db_path.clone()));
    Ok((temp_dir, db_path, service, clock))
}

fn candidates(ids: &[&str]) -> CandidateInput {
    CandidateInput::Tracks(ids.iter().map(|id| Track::new(*id)).collect())
}

fn write_json(dir: &Path, name: &str, value: &serde_json::Value) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec(value)?)?;
    Ok(path)
}

#[cfg(test)]
mod session_flow_tests {
    use super::*;
    use cadence::context::TimeOfDay;
    use cadence::error::SessionError;
    use cadence::predictor::RankingKind;

    #[test]
    fn test_play_skip_complete_flow() -> Result<()> {
        let (_dir, _db, service, clock) = create_test_service()?;
        let id = service.start_session(SessionSeed::default())?;

        service.record_event(&id, EventInput::new("play", "A").progress(40.0, 200.0))?;
        clock.advance(Duration::from_secs(2));
        service.record_event(&id, EventInput::new("skip", "B").progress(2.0, 180.0))?;
        clock.advance(Duration::from_secs(1));
        let agg = service.record_event(&id, EventInput::new("play", "C").progress(230.0, 230.0))?;
        assert_eq!(agg.event_count, 3);
        assert!(agg.completed.contains("C"));
        assert!(agg.skipped.contains("B"));

        let recs = service.recommend(&RecommendRequest {
            session_id: Some(id.clone()),
            candidates: candidates(&["A", "B", "C", "D"]),
            limit: 4,
            current_track: None,
        });
        assert_eq!(recs.context.time_of_day, TimeOfDay::Evening);
        let pos = |t: &str| recs.tracks.iter().position(|r| r.track.id == t);
        assert!(pos("C") < pos("B"));

        let manifest = service.predict_manifest(&ManifestRequest {
            session_id: Some(id),
            candidates: candidates(&["A", "B", "C", "D"]),
            current_track: Some("D".into()),
            ..ManifestRequest::default()
        });
        let must = manifest.must_cache_ids();
        assert_eq!(must[0], "D");
        assert!(must.contains(&"C"));
        assert_eq!(manifest.source, RankingKind::Personalized);
        Ok(())
    }

    #[test]
    fn test_ttl_expiry_makes_session_unresolvable() -> Result<()> {
        let (_dir, _db, service, clock) = create_test_service()?;
        let id = service.start_session(SessionSeed::default())?;
        service.record_event(&id, EventInput::new("play", "A"))?;

        clock.advance(Duration::from_secs(24 * 60 * 60 + 1));

        assert!(matches!(
            service.record_event(&id, EventInput::new("play", "B")),
            Err(SessionError::SessionNotFound(_))
        ));
        let ctx = service.resolve_context(Some(&id), None);
        assert!(ctx.anonymous);
        assert!(ctx.recent.is_empty());
        assert_eq!(ctx.current_track, None);
        Ok(())
    }

    #[test]
    fn test_two_handles_on_one_file_lose_no_events() -> Result<()> {
        let (_dir, db_path, service, clock) = create_test_service()?;
        let id = service.start_session(SessionSeed::default())?;

        let other_store = SqliteStore::open(&db_path, Duration::from_secs(5), clock.clone())?;
        let other = Arc::new(IntelligenceService::new(
            other_store,
            clock.clone(),
            &RuntimeConfig::with_db_path(db_path.clone()),
        ));
        let service = Arc::new(service);

        let handles: Vec<_> = [Arc::clone(&service), other]
            .into_iter()
            .enumerate()
            .map(|(n, svc)| {
                let id = id.clone();
                std::thread::spawn(move || {
                    for i in 0..15 {
                        svc.record_event(&id, EventInput::new("play", format!("h{n}-{i}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let session = service.session(&id)?;
        assert_eq!(session.events.len(), 30);
        assert_eq!(session.aggregates.play_count, 30);
        Ok(())
    }

    #[test]
    fn test_user_activity_seeds_next_session() -> Result<()> {
        let (_dir, _db, service, clock) = create_test_service()?;
        let seed = SessionSeed {
            user_id: Some("listener-7".into()),
            ..SessionSeed::default()
        };
        let first = service.start_session(seed.clone())?;
        service.record_event(&first, EventInput::new("play", "A").tag("ambient"))?;

        clock.advance(Duration::from_secs(2 * 24 * 60 * 60));
        assert!(matches!(service.session(&first), Err(SessionError::SessionNotFound(_))));

        let second = service.start_session(seed)?;
        let ctx = service.resolve_context(Some(&second), None);
        assert!(!ctx.anonymous);
        assert_eq!(ctx.recent.len(), 1);
        assert_eq!(ctx.recent[0].tags, vec!["ambient".to_string()]);
        Ok(())
    }

    #[test]
    fn test_sessions_survive_reopening() -> Result<()> {
        let (_dir, db_path, service, clock) = create_test_service()?;
        let id = service.start_session(SessionSeed {
            device: Some("phone".into()),
            ..SessionSeed::default()
        })?;
        service.record_event(&id, EventInput::new("play", "A"))?;
        drop(service);

        let store = SqliteStore::open(&db_path, Duration::from_secs(2), clock.clone())?;
        let reopened = IntelligenceService::new(store, clock, &RuntimeConfig::with_db_path(db_path));
        let session = reopened.session(&id)?;
        assert_eq!(session.seed.device.as_deref(), Some("phone"));
        assert_eq!(session.events.len(), 1);
        Ok(())
    }
}

#[cfg(test)]
mod manifest_tests {
    use super::*;
    use cadence::predictor::{Budget, RankingKind};
    use std::collections::HashSet;

    #[test]
    fn test_anonymous_manifest_uses_generic_order() -> Result<()> {
        let (_dir, _db, service, _) = create_test_service()?;
        let ids: Vec<String> = (0..50).map(|i| format!("g{i}")).collect();
        let popular: Vec<String> = ids.iter().rev().cloned().collect();

        let manifest = service.predict_manifest(&ManifestRequest {
            session_id: None,
            candidates: CandidateInput::Tracks(ids.iter().map(Track::new).collect()),
            budget: Some(Budget::Count(10)),
            current_track: None,
            popular,
        });

        assert_eq!(manifest.source, RankingKind::Generic);
        assert!(manifest.likely_next.len() <= 10);
        assert!(manifest.must_cache.len() <= 3);
        assert_eq!(manifest.must_cache_ids(), vec!["g49", "g48", "g47"]);

        let must: HashSet<_> = manifest.must_cache_ids().into_iter().collect();
        assert!(manifest.likely_next_ids().iter().all(|id| !must.contains(id)));
        Ok(())
    }

    #[test]
    fn test_anonymous_session_seed_gets_generic_manifest() -> Result<()> {
        let (_dir, _db, service, _) = create_test_service()?;
        let id = service.start_session(SessionSeed {
            anonymous: true,
            ..SessionSeed::default()
        })?;
        let manifest = service.predict_manifest(&ManifestRequest {
            session_id: Some(id),
            candidates: candidates(&["x", "y"]),
            popular: vec!["y".into()],
            ..ManifestRequest::default()
        });
        assert_eq!(manifest.source, RankingKind::Generic);
        assert_eq!(manifest.must_cache_ids(), vec!["y", "x"]);
        Ok(())
    }

    #[test]
    fn test_empty_candidates_are_not_an_error() -> Result<()> {
        let (_dir, _db, service, _) = create_test_service()?;
        let manifest = service.predict_manifest(&ManifestRequest::default());
        assert!(manifest.is_empty());
        let recs = service.recommend(&RecommendRequest {
            limit: 10,
            ..RecommendRequest::default()
        });
        assert!(recs.tracks.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use std::process::{Command, Output};

    fn cadence(db: &Path, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_cadence"))
            .arg("--db")
            .arg(db)
            .args(args)
            .output()
            .expect("Failed to run cadence")
    }

    fn stdout_json(output: &Output) -> serde_json::Value {
        assert!(
            output.status.success(),
            "command failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("stdout is JSON")
    }

    #[test]
    fn test_cli_help_displays_correctly() {
        let output = Command::new(env!("CARGO_BIN_EXE_cadence"))
            .arg("--help")
            .output()
            .expect("Failed to run help command");
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("cadence"));
        assert!(stdout.contains("recommend"));
        assert!(stdout.contains("manifest"));
    }

    #[test]
    fn test_completion_generation() {
        let output = Command::new(env!("CARGO_BIN_EXE_cadence"))
            .args(["completion", "bash"])
            .output()
            .expect("Failed to run completion command");
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("cadence"));
    }

    #[test]
    fn test_session_lifecycle_across_invocations() -> Result<()> {
        let dir = TempDir::new()?;
        let db = dir.path().join("cli.db");

        let started = stdout_json(&cadence(&db, &["start", "--device", "laptop"]));
        let id = started["session_id"].as_str().expect("session id").to_string();

        let agg = stdout_json(&cadence(
            &db,
            &["record", &id, "play", "t1", "--position", "190", "--duration", "200", "--artist", "X"],
        ));
        assert_eq!(agg["play_count"], 1);
        let agg = stdout_json(&cadence(&db, &["record", &id, "skip", "t2"]));
        assert_eq!(agg["skip_count"], 1);
        assert_eq!(agg["event_count"], 2);

        let session = stdout_json(&cadence(&db, &["session", &id]));
        assert_eq!(session["events"].as_array().map(Vec::len), Some(2));

        let tracks = write_json(
            dir.path(),
            "tracks.json",
            &serde_json::json!([
                { "id": "t1", "artist": "X" },
                { "id": "t2" },
                { "id": "t3", "artist": "X" }
            ]),
        )?;
        let recs = stdout_json(&cadence(
            &db,
            &["recommend", "--session", &id, "--candidates", tracks.to_str().unwrap()],
        ));
        assert_eq!(recs["context"]["source"], "personalized");
        assert_eq!(recs["tracks"][0]["track"]["id"], "t1");
        assert_eq!(recs["tracks"][0]["label"], "top_pick");

        let manifest = stdout_json(&cadence(
            &db,
            &["manifest", "--session", &id, "--candidates", tracks.to_str().unwrap(), "--current", "t3"],
        ));
        assert_eq!(manifest["must_cache"][0]["track_id"], "t3");
        assert_eq!(manifest["must_cache"][0]["reason"], "current_track");
        Ok(())
    }

    #[test]
    fn test_invalid_event_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let db = dir.path().join("cli.db");
        let started = stdout_json(&cadence(&db, &["start"]));
        let id = started["session_id"].as_str().expect("session id").to_string();

        let output = cadence(&db, &["record", &id, "rewind", "t1"]);
        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("invalid event"));

        let output = cadence(&db, &["record", "no-such-session", "play", "t1"]);
        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
        Ok(())
    }

    #[test]
    fn test_catalog_query_and_health() -> Result<()> {
        let dir = TempDir::new()?;
        let db = dir.path().join("cli.db");
        let catalog = write_json(
            dir.path(),
            "catalog.json",
            &serde_json::json!({
                "tracks": [
                    { "id": "a", "title": "Night Swim", "tags": ["ambient"] },
                    { "id": "b", "title": "Morning Run", "tags": ["energetic"] },
                    { "id": "c", "title": "Night Drive", "tags": ["synthwave"] }
                ],
                "popular": ["c", "a"]
            }),
        )?;
        let catalog = catalog.to_str().unwrap();

        let recs = stdout_json(&cadence(
            &db,
            &["recommend", "--catalog", catalog, "--query", "night", "--limit", "5"],
        ));
        assert_eq!(recs["context"]["source"], "generic");
        assert_eq!(recs["tracks"].as_array().map(Vec::len), Some(2));

        let manifest = stdout_json(&cadence(&db, &["manifest", "--catalog", catalog, "--budget-count", "1"]));
        assert_eq!(manifest["source"], "generic");
        assert_eq!(manifest["must_cache"][0]["track_id"], "c");

        let health = stdout_json(&cadence(&db, &["health"]));
        assert_eq!(health["store_ok"], true);
        Ok(())
    }

    #[test]
    fn test_config_file_is_applied() -> Result<()> {
        let dir = TempDir::new()?;
        let db = dir.path().join("cli.db");
        let config = write_json(
            dir.path(),
            "config.json",
            &serde_json::json!({ "session": { "max_events": 2 } }),
        )?;
        let config = config.to_str().unwrap();

        let started = stdout_json(&cadence(&db, &["--config", config, "start"]));
        let id = started["session_id"].as_str().expect("session id").to_string();
        for track in ["a", "b", "c"] {
            stdout_json(&cadence(&db, &["--config", config, "record", &id, "play", track]));
        }
        let session = stdout_json(&cadence(&db, &["--config", config, "session", &id]));
        assert_eq!(session["aggregates"]["event_count"], 2);

        let output = Command::new(env!("CARGO_BIN_EXE_cadence"))
            .args(["--config", dir.path().join("missing.json").to_str().unwrap(), "health"])
            .output()?;
        assert!(!output.status.success());
        Ok(())
    }
}
