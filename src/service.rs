//! # Inbound API
//!
//! [`IntelligenceService`] wires the tracker, context builder, engine and
//! predictor together behind the four request shapes clients use. Every read
//! path degrades instead of failing: an unknown or expired session, a store
//! that times out or a catalog that errors all produce a generic response.

use crate::catalog::{CandidateInput, Track, TrackCatalog};
use crate::clock::Clock;
use crate::config::{RuntimeConfig, SessionConfig};
use crate::context::{build_context, Context, ListeningMood, TimeOfDay};
use crate::engine::{RankLabel, RecommendationEngine, ScoreBreakdown};
use crate::error::SessionError;
use crate::predictor::{select_source, Budget, CachePredictor, Manifest, RankingKind};
use crate::session::{Aggregates, EventInput, Session, SessionSeed};
use crate::store::SessionStore;
use crate::tracker::SessionTracker;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub candidates: CandidateInput,
    /// Values below one yield an empty result.
    pub limit: i64,
    /// Track the client reports as playing; overrides the session's.
    #[serde(default)]
    pub current_track: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub candidates: CandidateInput,
    /// Defaults to the configured count budget.
    #[serde(default)]
    pub budget: Option<Budget>,
    #[serde(default)]
    pub current_track: Option<String>,
    /// Popularity order for anonymous listeners. Falls back to the
    /// catalog's own when empty.
    #[serde(default)]
    pub popular: Vec<String>,
}

/// What the response was personalized with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub source: RankingKind,
    pub has_history: bool,
    pub has_current: bool,
    pub mood: ListeningMood,
    pub time_of_day: TimeOfDay,
    pub skip_rate: f64,
}

impl From<&Context> for ContextSummary {
    fn from(ctx: &Context) -> Self {
        Self {
            source: if ctx.anonymous {
                RankingKind::Generic
            } else {
                RankingKind::Personalized
            },
            has_history: ctx.has_history(),
            has_current: ctx.current_track.is_some(),
            mood: ctx.mood,
            time_of_day: ctx.time_of_day,
            skip_rate: ctx.skip_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTrack {
    /// 1-based.
    pub rank: usize,
    pub label: RankLabel,
    pub track: Track,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub tracks: Vec<RankedTrack>,
    pub context: ContextSummary,
    pub generated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub store_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub catalog_configured: bool,
}

/// Session-aware recommendation and cache prediction over an injected store,
/// clock and (optional) catalog.
pub struct IntelligenceService<S> {
    tracker: SessionTracker<S>,
    engine: RecommendationEngine,
    predictor: CachePredictor,
    catalog: Option<Box<dyn TrackCatalog>>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl<S: SessionStore> IntelligenceService<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: &RuntimeConfig) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix());
        Self {
            tracker: SessionTracker::new(store, Arc::clone(&clock), config.session.clone()),
            engine: RecommendationEngine::new(config.engine.clone()),
            predictor: CachePredictor::new(config.predictor.clone()),
            catalog: None,
            clock,
            offset,
        }
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: Box<dyn TrackCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    fn session_config(&self) -> &SessionConfig {
        self.tracker.config()
    }

    /// # Errors
    ///
    /// [`SessionError::StoreUnavailable`] when no session can be created;
    /// callers surface it so the client can retry.
    pub fn start_session(&self, seed: SessionSeed) -> Result<String, SessionError> {
        self.tracker.start_session(seed)
    }

    /// # Errors
    ///
    /// See [`SessionTracker::record_event`].
    pub fn record_event(&self, session_id: &str, input: EventInput) -> Result<Aggregates, SessionError> {
        self.tracker.record_event(session_id, input)
    }

    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] or [`SessionError::StoreUnavailable`].
    pub fn session(&self, session_id: &str) -> Result<Session, SessionError> {
        self.tracker.load_session(session_id)
    }

    /// Request time in the listener's configured timezone.
    #[must_use]
    pub fn local_now(&self) -> DateTime<FixedOffset> {
        DateTime::<Utc>::from_timestamp_millis(self.clock.now_millis())
            .unwrap_or_default()
            .with_timezone(&self.offset)
    }

    /// Build the scoring context for an optional session. Never fails.
    #[must_use]
    pub fn resolve_context(&self, session_id: Option<&str>, current_track: Option<String>) -> Context {
        let session = session_id.and_then(|id| match self.tracker.load_session(id) {
            Ok(session) => Some(session),
            Err(SessionError::SessionNotFound(_)) => {
                debug!("Session {id} not resolvable, using generic context");
                None
            }
            Err(e) => {
                warn!("Failed to load session {id}: {e}; using generic context");
                None
            }
        });
        let cfg = self.session_config();
        build_context(
            session.as_ref(),
            &self.local_now(),
            cfg.recent_tracks,
            cfg.completion_threshold,
        )
        .with_current_track(current_track)
    }

    /// Explicit tracks are used as given; queries go to the catalog. Catalog
    /// failures give an empty candidate set.
    #[must_use]
    pub fn resolve_candidates(&self, input: &CandidateInput) -> Vec<Track> {
        match input {
            CandidateInput::Tracks(tracks) => tracks.clone(),
            CandidateInput::Query { query, limit } => match &self.catalog {
                None => {
                    warn!("Candidate query '{query}' without a configured catalog");
                    Vec::new()
                }
                Some(catalog) => catalog.search(query, *limit).unwrap_or_else(|e| {
                    warn!("Catalog search for '{query}' failed: {e:#}");
                    Vec::new()
                }),
            },
        }
    }

    /// Ranked tracks for a listener, personalized when the session resolves.
    #[must_use]
    pub fn recommend(&self, request: &RecommendRequest) -> Recommendations {
        let candidates = self.resolve_candidates(&request.candidates);
        let ctx = self
            .resolve_context(request.session_id.as_deref(), request.current_track.clone())
            .with_catalog_hints(&candidates);
        let limit = usize::try_from(request.limit).unwrap_or(0);

        let tracks = self
            .engine
            .recommend(&ctx, &candidates, limit)
            .into_iter()
            .enumerate()
            .map(|(i, c)| RankedTrack {
                rank: i + 1,
                label: RankLabel::for_rank(i + 1),
                track: c.track,
                score: c.score,
                breakdown: c.breakdown,
            })
            .collect();

        Recommendations {
            tracks,
            context: ContextSummary::from(&ctx),
            generated_at: self.clock.now_millis(),
        }
    }

    /// Cache manifest for a listener. Anonymous listeners get the generic
    /// popularity ordering instead of personalized scores.
    ///
    /// A non-empty candidate set that leaves out the current track gets it
    /// added, so the playing track is always pinned. An empty one yields an
    /// empty manifest.
    #[must_use]
    pub fn predict_manifest(&self, request: &ManifestRequest) -> Manifest {
        let mut candidates = self.resolve_candidates(&request.candidates);
        let ctx = self
            .resolve_context(request.session_id.as_deref(), request.current_track.clone())
            .with_catalog_hints(&candidates);
        if let Some(current) = &ctx.current_track {
            if !candidates.is_empty() && !candidates.iter().any(|t| &t.id == current) {
                candidates.insert(0, Track::new(current.clone()));
            }
        }

        let popular = if ctx.anonymous && request.popular.is_empty() {
            self.catalog_popular()
        } else {
            request.popular.clone()
        };
        let budget = request
            .budget
            .unwrap_or(Budget::Count(self.predictor.config().default_count_budget));
        let source = select_source(&ctx, &self.engine, popular);
        self.predictor
            .predict(&ctx, &candidates, budget, source.as_ref(), self.clock.now_millis())
    }

    fn catalog_popular(&self) -> Vec<String> {
        let Some(catalog) = &self.catalog else {
            return Vec::new();
        };
        let cfg = self.predictor.config();
        let wanted = cfg.must_cache_max + cfg.likely_next_max;
        catalog.popular(wanted).unwrap_or_else(|e| {
            warn!("Catalog popularity lookup failed: {e:#}");
            Vec::new()
        })
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        let ping = self.tracker.store().ping();
        HealthReport {
            store_ok: ping.is_ok(),
            store_error: ping.err().map(|e| e.to_string()),
            catalog_configured: self.catalog.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FileCatalog;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::predictor::CacheReason;
    use crate::store::MemoryStore;
    use std::time::Duration;

    // 2024-06-01T19:00:00Z
    const EVENING: i64 = 1_717_268_400_000;

    fn service() -> (IntelligenceService<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(EVENING));
        let store = MemoryStore::new(clock.clone());
        (IntelligenceService::new(store, clock.clone(), &RuntimeConfig::default()), clock)
    }

    fn tracks(ids: &[&str]) -> CandidateInput {
        CandidateInput::Tracks(ids.iter().map(|id| Track::new(*id)).collect())
    }

    /// Store whose every call times out.
    #[derive(Debug)]
    struct DownStore;

    impl SessionStore for DownStore {
        fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
        fn set_with_ttl(&self, _: &str, _: &[u8], _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
        fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
        fn append_to_list(&self, _: &str, _: &[u8], _: usize, _: Duration) -> Result<Vec<Vec<u8>>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
        fn append_guarded(
            &self,
            _: &str,
            _: &[u8],
            _: &str,
            _: &[u8],
            _: usize,
            _: Duration,
        ) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
        fn get_list(&self, _: &str) -> Result<Vec<Vec<u8>>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
        fn purge_expired(&self) -> Result<usize, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
        fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
    }

    #[test]
    fn test_play_skip_complete_example() {
        let (svc, clock) = service();
        let id = svc.start_session(SessionSeed::default()).unwrap();
        svc.record_event(&id, EventInput::new("play", "A").progress(30.0, 200.0)).unwrap();
        clock.advance(Duration::from_secs(2));
        svc.record_event(&id, EventInput::new("skip", "B").progress(2.0, 180.0)).unwrap();
        clock.advance(Duration::from_secs(1));
        svc.record_event(&id, EventInput::new("play", "C").progress(240.0, 240.0)).unwrap();

        let recs = svc.recommend(&RecommendRequest {
            session_id: Some(id.clone()),
            candidates: tracks(&["A", "B", "C", "D"]),
            limit: 4,
            current_track: None,
        });
        assert_eq!(recs.context.source, RankingKind::Personalized);
        assert_eq!(recs.context.time_of_day, TimeOfDay::Evening);
        let pos = |t: &str| recs.tracks.iter().position(|r| r.track.id == t).unwrap();
        assert!(pos("C") < pos("B"));
        assert_eq!(recs.tracks[0].label, RankLabel::TopPick);

        let manifest = svc.predict_manifest(&ManifestRequest {
            session_id: Some(id),
            candidates: tracks(&["A", "B", "C", "D"]),
            current_track: Some("A".into()),
            ..ManifestRequest::default()
        });
        let must = manifest.must_cache_ids();
        assert_eq!(must[0], "A");
        assert!(must.contains(&"C"));
        assert_eq!(manifest.source, RankingKind::Personalized);
    }

    #[test]
    fn test_manifest_current_track_joins_candidates() {
        let (svc, _) = service();
        let id = svc.start_session(SessionSeed::default()).unwrap();

        let manifest = svc.predict_manifest(&ManifestRequest {
            session_id: Some(id.clone()),
            candidates: tracks(&["A", "B"]),
            current_track: Some("Z".into()),
            ..ManifestRequest::default()
        });
        assert_eq!(manifest.must_cache_ids(), vec!["Z", "A", "B"]);
        assert_eq!(manifest.must_cache[0].reason, CacheReason::CurrentTrack);

        let empty = svc.predict_manifest(&ManifestRequest {
            session_id: Some(id),
            candidates: tracks(&[]),
            current_track: Some("Z".into()),
            ..ManifestRequest::default()
        });
        assert!(empty.is_empty());
    }

    #[test]
    fn test_returning_listener_starts_with_history() {
        let (svc, _) = service();
        let seed = SessionSeed {
            user_id: Some("listener".into()),
            ..SessionSeed::default()
        };
        let first = svc.start_session(seed.clone()).unwrap();
        svc.record_event(&first, EventInput::new("play", "A").artist("Nils Frahm")).unwrap();

        let second = svc.start_session(seed).unwrap();
        let recs = svc.recommend(&RecommendRequest {
            session_id: Some(second),
            candidates: CandidateInput::Tracks(vec![
                Track::new("B").by("Justice"),
                Track::new("C").by("Nils Frahm"),
            ]),
            limit: 2,
            current_track: None,
        });
        assert!(recs.context.has_history);
        assert_eq!(recs.context.source, RankingKind::Personalized);
        assert_eq!(recs.tracks[0].track.id, "C");
    }

    #[test]
    fn test_expired_session_degrades_to_generic() {
        let (svc, clock) = service();
        let id = svc.start_session(SessionSeed::default()).unwrap();
        svc.record_event(&id, EventInput::new("play", "A")).unwrap();

        clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
        assert!(matches!(
            svc.record_event(&id, EventInput::new("play", "B")),
            Err(SessionError::SessionNotFound(_))
        ));
        let ctx = svc.resolve_context(Some(&id), None);
        assert!(ctx.anonymous);
        assert!(!ctx.has_history());
    }

    #[test]
    fn test_negative_limit_is_empty() {
        let (svc, _) = service();
        let recs = svc.recommend(&RecommendRequest {
            candidates: tracks(&["A", "B"]),
            limit: -3,
            ..RecommendRequest::default()
        });
        assert!(recs.tracks.is_empty());
        assert_eq!(recs.context.source, RankingKind::Generic);
    }

    #[test]
    fn test_query_candidates_and_generic_popularity_from_catalog() {
        let (svc, _) = service();
        let catalog = FileCatalog::new(
            (0..50).map(|i| Track::new(format!("t{i}")).titled(format!("Song {i}"))).collect(),
            vec!["t7".into(), "t3".into()],
        );
        let svc = svc.with_catalog(Box::new(catalog));

        let manifest = svc.predict_manifest(&ManifestRequest {
            candidates: CandidateInput::Query {
                query: "song".into(),
                limit: 50,
            },
            budget: Some(Budget::Count(10)),
            ..ManifestRequest::default()
        });
        assert_eq!(manifest.source, RankingKind::Generic);
        assert_eq!(&manifest.must_cache_ids()[..2], &["t7", "t3"]);
        assert!(manifest.must_cache.len() <= 3);
        assert_eq!(manifest.likely_next.len(), 10);
        assert!(svc.health().catalog_configured);
    }

    #[test]
    fn test_query_without_catalog_gives_empty_manifest() {
        let (svc, _) = service();
        let manifest = svc.predict_manifest(&ManifestRequest {
            candidates: CandidateInput::Query {
                query: "anything".into(),
                limit: 10,
            },
            ..ManifestRequest::default()
        });
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_store_outage_degrades_reads_and_fails_start() {
        let clock = Arc::new(ManualClock::new(EVENING));
        let svc = IntelligenceService::new(DownStore, clock, &RuntimeConfig::default());

        assert!(matches!(
            svc.start_session(SessionSeed::default()),
            Err(SessionError::StoreUnavailable(_))
        ));
        let recs = svc.recommend(&RecommendRequest {
            session_id: Some("whatever".into()),
            candidates: tracks(&["A", "B"]),
            limit: 5,
            current_track: None,
        });
        assert_eq!(recs.tracks.len(), 2);
        assert_eq!(recs.context.source, RankingKind::Generic);

        let health = svc.health();
        assert!(!health.store_ok);
        assert!(health.store_error.is_some());
    }

    #[test]
    fn test_timezone_offset_moves_bucket() {
        let clock = Arc::new(ManualClock::new(EVENING));
        let config = RuntimeConfig {
            utc_offset_minutes: -10 * 60,
            ..RuntimeConfig::default()
        };
        let svc = IntelligenceService::new(MemoryStore::new(clock.clone()), clock, &config);
        assert_eq!(svc.resolve_context(None, None).time_of_day, TimeOfDay::Morning);
    }
}
