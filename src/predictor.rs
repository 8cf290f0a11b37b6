//! # Cache Predictor
//!
//! Splits a ranked candidate set into a small `must_cache` core and a
//! budgeted `likely_next` tail for offline pre-caching.
//!
//! Where the ranking comes from is a [`RankingSource`]: listeners with a
//! session get [`PersonalizedRanking`] (the recommendation engine), anonymous
//! listeners get [`GenericRanking`] (an externally supplied popularity order).
//! [`select_source`] picks one from the context; everything after that is the
//! same code for both.

use crate::catalog::Track;
use crate::context::Context;
use crate::engine::{RecommendationEngine, ScoreBreakdown, ScoredCandidate};
use crate::error::ConfigError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

const MIB: u64 = 1024 * 1024;

/// Manifest sizing. All fields default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Ranked candidates pinned after the current track. Default `3`.
    pub must_cache_top_k: usize,
    /// Hard cap on `must_cache`, current track included. Default `5`.
    pub must_cache_max: usize,
    /// Hard cap on `likely_next`. Default `20`.
    pub likely_next_max: usize,
    /// Count budget used when a request names none. Default `10`.
    pub default_count_budget: usize,
    /// Per-track size assumed when a byte budget meets unsized tracks.
    /// Default 4 MiB (a few minutes of compressed audio).
    pub assumed_track_bytes: u64,
    /// Lifetime of a personalized manifest. Default 24h.
    pub manifest_ttl_secs: u64,
    /// Lifetime of a generic manifest. Default 1h.
    pub generic_manifest_ttl_secs: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            must_cache_top_k: 3,
            must_cache_max: 5,
            likely_next_max: 20,
            default_count_budget: 10,
            assumed_track_bytes: 4 * MIB,
            manifest_ttl_secs: 24 * 60 * 60,
            generic_manifest_ttl_secs: 60 * 60,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.must_cache_max == 0 {
            return Err(ConfigError::invalid("predictor.must_cache_max", "must be positive"));
        }
        if self.must_cache_top_k > self.must_cache_max {
            return Err(ConfigError::invalid(
                "predictor.must_cache_top_k",
                "must not exceed predictor.must_cache_max",
            ));
        }
        if self.assumed_track_bytes == 0 {
            return Err(ConfigError::invalid(
                "predictor.assumed_track_bytes",
                "must be positive",
            ));
        }
        if self.manifest_ttl_secs == 0 || self.generic_manifest_ttl_secs == 0 {
            return Err(ConfigError::invalid(
                "predictor.manifest_ttl_secs",
                "manifest lifetimes must be positive",
            ));
        }
        Ok(())
    }

    /// Convert a budget into a number of `likely_next` slots for tracks
    /// without size estimates.
    #[must_use]
    pub fn budget_to_count(&self, budget: Budget) -> usize {
        match budget {
            Budget::Count(n) => n,
            Budget::Bytes(bytes) => {
                usize::try_from(bytes / self.assumed_track_bytes).unwrap_or(usize::MAX)
            }
        }
    }
}

/// How much the client is willing to cache beyond `must_cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Count(usize),
    Bytes(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheReason {
    /// Playing right now; never evicted.
    CurrentTrack,
    TopRanked,
    LikelyNext,
}

/// Where a manifest's ordering came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingKind {
    Personalized,
    Generic,
}

impl fmt::Display for RankingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RankingKind::Personalized => "personalized",
            RankingKind::Generic => "generic",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub track_id: String,
    /// 1-based position across `must_cache` then `likely_next`.
    pub rank: usize,
    pub reason: CacheReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub must_cache: Vec<ManifestEntry>,
    pub likely_next: Vec<ManifestEntry>,
    pub source: RankingKind,
    /// Unix millis after which the client should ask again.
    pub expires_at: i64,
}

impl Manifest {
    #[must_use]
    pub fn must_cache_ids(&self) -> Vec<&str> {
        self.must_cache.iter().map(|e| e.track_id.as_str()).collect()
    }

    #[must_use]
    pub fn likely_next_ids(&self) -> Vec<&str> {
        self.likely_next.iter().map(|e| e.track_id.as_str()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must_cache.is_empty() && self.likely_next.is_empty()
    }
}

/// Produces the ranking a manifest is cut from.
///
/// Implementations must exclude the context's current track and return each
/// candidate id at most once.
pub trait RankingSource: Send + Sync {
    fn kind(&self) -> RankingKind;

    fn rank(&self, ctx: &Context, candidates: &[Track]) -> Vec<ScoredCandidate>;
}

/// Ranking by the recommendation engine's personalized scores.
#[derive(Debug, Clone, Copy)]
pub struct PersonalizedRanking<'a> {
    engine: &'a RecommendationEngine,
}

impl<'a> PersonalizedRanking<'a> {
    #[must_use]
    pub fn new(engine: &'a RecommendationEngine) -> Self {
        Self { engine }
    }
}

impl RankingSource for PersonalizedRanking<'_> {
    fn kind(&self) -> RankingKind {
        RankingKind::Personalized
    }

    fn rank(&self, ctx: &Context, candidates: &[Track]) -> Vec<ScoredCandidate> {
        self.engine.rank_all(ctx, candidates)
    }
}

/// Ranking by a fixed popularity order supplied from outside.
///
/// Candidates named in the order come first, in that order; the rest follow
/// in input order. Scores are positional, `1.0` for the first entry down to
/// `1/n` for the last.
#[derive(Debug, Clone, Default)]
pub struct GenericRanking {
    order: Vec<String>,
}

impl GenericRanking {
    #[must_use]
    pub fn new(order: Vec<String>) -> Self {
        Self { order }
    }
}

impl RankingSource for GenericRanking {
    fn kind(&self) -> RankingKind {
        RankingKind::Generic
    }

    fn rank(&self, ctx: &Context, candidates: &[Track]) -> Vec<ScoredCandidate> {
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .rev()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut seen = HashSet::new();
        let mut eligible: Vec<(usize, &Track)> = candidates
            .iter()
            .filter(|t| ctx.current_track.as_deref() != Some(t.id.as_str()))
            .filter(|t| seen.insert(t.id.as_str()))
            .enumerate()
            .collect();
        // Stable sort: popular ids by popularity, then everything else by input index.
        eligible.sort_by_key(|(input_idx, t)| match position.get(t.id.as_str()) {
            Some(&p) => (0, p),
            None => (1, *input_idx),
        });

        let n = eligible.len();
        eligible
            .into_iter()
            .enumerate()
            .map(|(i, (_, track))| ScoredCandidate {
                track: track.clone(),
                score: (n - i) as f64 / n as f64,
                breakdown: ScoreBreakdown::default(),
            })
            .collect()
    }
}

/// Personalized ranking for listeners with a session, generic otherwise.
#[must_use]
pub fn select_source<'a>(
    ctx: &Context,
    engine: &'a RecommendationEngine,
    popular: Vec<String>,
) -> Box<dyn RankingSource + 'a> {
    if ctx.anonymous {
        Box::new(GenericRanking::new(popular))
    } else {
        Box::new(PersonalizedRanking::new(engine))
    }
}

/// Builds manifests from a ranking source.
#[derive(Debug, Clone, Default)]
pub struct CachePredictor {
    config: PredictorConfig,
}

impl CachePredictor {
    #[must_use]
    pub fn new(config: PredictorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Build a manifest for `ctx` out of `candidates`.
    ///
    /// The context's current track is pinned first in `must_cache` when it is
    /// one of `candidates`. Every id in the manifest is drawn from
    /// `candidates`, so an empty candidate set gives an empty manifest.
    ///
    /// # Examples
    ///
    /// ```
    /// use cadence::catalog::Track;
    /// use cadence::context::{Context, TimeOfDay};
    /// use cadence::predictor::{Budget, CachePredictor, GenericRanking};
    ///
    /// let ctx = Context::generic(TimeOfDay::Morning);
    /// let candidates: Vec<Track> = (0..50).map(|i| Track::new(format!("t{i}"))).collect();
    /// let source = GenericRanking::new(vec!["t42".into()]);
    ///
    /// let manifest = CachePredictor::default().predict(&ctx, &candidates, Budget::Count(10), &source, 0);
    /// assert_eq!(manifest.must_cache[0].track_id, "t42");
    /// assert!(manifest.likely_next.len() <= 10);
    /// ```
    #[must_use]
    pub fn predict(
        &self,
        ctx: &Context,
        candidates: &[Track],
        budget: Budget,
        source: &dyn RankingSource,
        now_millis: i64,
    ) -> Manifest {
        let cfg = &self.config;
        let kind = source.kind();
        let ttl_secs = match kind {
            RankingKind::Personalized => cfg.manifest_ttl_secs,
            RankingKind::Generic => cfg.generic_manifest_ttl_secs,
        };
        let expires_at = now_millis
            .saturating_add(i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX));

        if candidates.is_empty() {
            debug!("Built empty {kind} manifest: no candidates");
            return Manifest {
                must_cache: Vec::new(),
                likely_next: Vec::new(),
                source: kind,
                expires_at,
            };
        }

        let mut must_cache = Vec::new();
        let current = ctx
            .current_track
            .as_deref()
            .filter(|id| candidates.iter().any(|t| t.id == *id));
        if let Some(current) = current {
            must_cache.push(ManifestEntry {
                track_id: current.to_string(),
                rank: 1,
                reason: CacheReason::CurrentTrack,
                score: None,
            });
        }

        let mut ranked = source.rank(ctx, candidates).into_iter();

        let top_k = cfg
            .must_cache_top_k
            .min(cfg.must_cache_max.saturating_sub(must_cache.len()));
        for candidate in ranked.by_ref().take(top_k) {
            must_cache.push(ManifestEntry {
                track_id: candidate.track.id,
                rank: must_cache.len() + 1,
                reason: CacheReason::TopRanked,
                score: Some(candidate.score),
            });
        }

        let rest: Vec<ScoredCandidate> = ranked.take(cfg.likely_next_max).collect();
        let slots = self.likely_next_slots(&rest, budget);
        let likely_next: Vec<ManifestEntry> = rest
            .into_iter()
            .take(slots)
            .enumerate()
            .map(|(i, candidate)| ManifestEntry {
                track_id: candidate.track.id,
                rank: must_cache.len() + i + 1,
                reason: CacheReason::LikelyNext,
                score: Some(candidate.score),
            })
            .collect();

        debug!(
            "Built {kind} manifest: {} must-cache, {} likely-next from {} candidates ({budget:?})",
            must_cache.len(),
            likely_next.len(),
            candidates.len()
        );
        Manifest {
            must_cache,
            likely_next,
            source: kind,
            expires_at,
        }
    }

    /// How many of `rest` fit the budget.
    ///
    /// A byte budget is spent on actual sizes in rank order, stopping at the
    /// first track that does not fit. If any track lacks a size the byte
    /// budget is converted into a count instead.
    fn likely_next_slots(&self, rest: &[ScoredCandidate], budget: Budget) -> usize {
        match budget {
            Budget::Bytes(mut remaining) if rest.iter().all(|c| c.track.size_bytes.is_some()) => rest
                .iter()
                .take_while(|c| {
                    let size = c.track.size_bytes.unwrap_or(self.config.assumed_track_bytes);
                    match remaining.checked_sub(size) {
                        Some(left) => {
                            remaining = left;
                            true
                        }
                        None => false,
                    }
                })
                .count(),
            _ => self.config.budget_to_count(budget),
        }
    }
}
