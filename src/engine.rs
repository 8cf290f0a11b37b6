//! # Recommendation Engine
//!
//! Scores candidate tracks against a [`Context`] and ranks them.
//!
//! ## Scoring Model
//!
//! Each candidate gets a linear combination of weighted terms:
//!
//! ```text
//! damping = 1 - skip_dampening * skip_rate
//! score   = recency     * affinity(recent) * damping
//!         + time_of_day * mood_match(bucket) * damping
//!         - skip_penalty * skip_rate
//!         + completion_bonus       (if completed in this session)
//!         - skipped_track_penalty  (if skipped in this session)
//! ```
//!
//! `affinity(recent)` is `(n - i) / n` for the most recent of the `n` recent
//! tracks (position `i`, 0 = newest) that shares the candidate's artist or
//! one of its tags, so the newest track counts fully and the oldest barely.
//! A high skip rate lowers every score and flattens the affinity terms, which
//! leaves the flat completion bonus as the strongest differentiator: the
//! engine falls back to tracks the listener already played through.
//!
//! ## Ordering
//!
//! Candidates are sorted by score descending with ties broken by track id,
//! then a greedy diversity pass keeps at most
//! [`EngineWeights::max_consecutive_artist`] entries by the same artist in a
//! row. That pass can lift a lower-scored track over a higher one; setting the
//! cap to `0` disables it and yields pure score order.

use crate::catalog::Track;
use crate::context::{Context, TimeOfDay};
use crate::error::ConfigError;
use log::{debug, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Engine weights. Every field has a documented default so a partial config
/// file only changes what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineWeights {
    /// Artist/tag affinity with recent history. Default `1.0`.
    pub recency: f64,
    /// Tag match with the time-of-day mood table. Default `0.5`.
    pub time_of_day: f64,
    /// Uniform penalty per unit of recent skip rate. Default `0.75`.
    pub skip_penalty: f64,
    /// How strongly the skip rate flattens the affinity terms, in `[0, 1]`.
    /// Default `0.5`.
    pub skip_dampening: f64,
    /// Flat bonus for tracks played to completion this session. Default `0.6`.
    pub completion_bonus: f64,
    /// Flat penalty for tracks skipped this session. Default `0.6`.
    pub skipped_track_penalty: f64,
    /// Longest allowed run of one artist; `0` disables the diversity pass.
    /// Default `2`.
    pub max_consecutive_artist: usize,
}

impl Default for EngineWeights {
    fn default() -> Self {
        Self {
            recency: 1.0,
            time_of_day: 0.5,
            skip_penalty: 0.75,
            skip_dampening: 0.5,
            completion_bonus: 0.6,
            skipped_track_penalty: 0.6,
            max_consecutive_artist: 2,
        }
    }
}

impl EngineWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [
            ("engine.recency", self.recency),
            ("engine.time_of_day", self.time_of_day),
            ("engine.skip_penalty", self.skip_penalty),
            ("engine.completion_bonus", self.completion_bonus),
            ("engine.skipped_track_penalty", self.skipped_track_penalty),
        ];
        for (field, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(field, "must be a finite, non-negative number"));
            }
        }
        if !(0.0..=1.0).contains(&self.skip_dampening) {
            return Err(ConfigError::invalid("engine.skip_dampening", "must be in [0, 1]"));
        }
        Ok(())
    }
}

lazy_static::lazy_static! {
    /// Tags that fit each part of the day.
    static ref MOOD_TABLE: HashMap<TimeOfDay, HashSet<&'static str>> = {
        let mut table = HashMap::new();
        table.insert(
            TimeOfDay::Morning,
            ["energetic", "upbeat", "happy", "pop", "acoustic", "workout", "bright"].into_iter().collect(),
        );
        table.insert(
            TimeOfDay::Afternoon,
            ["energetic", "upbeat", "dance", "pop", "rock", "workout", "party"].into_iter().collect(),
        );
        table.insert(
            TimeOfDay::Evening,
            ["chill", "mellow", "jazz", "soul", "rnb", "acoustic", "lounge"].into_iter().collect(),
        );
        table.insert(
            TimeOfDay::Night,
            ["ambient", "chill", "lofi", "calm", "sleep", "piano", "downtempo"].into_iter().collect(),
        );
        table
    };
}

/// Whether any of `tags` fits `bucket`. Tags compare case-insensitively.
#[must_use]
pub fn matches_time_of_day(tags: &[String], bucket: TimeOfDay) -> bool {
    MOOD_TABLE.get(&bucket).is_some_and(|moods| {
        tags.iter()
            .any(|tag| moods.contains(tag.trim().to_lowercase().as_str()))
    })
}

/// Per-term contributions to a candidate's score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub recency: f64,
    pub time_of_day: f64,
    pub skip_penalty: f64,
    pub completion_bonus: f64,
    pub skipped_penalty: f64,
}

impl ScoreBreakdown {
    #[must_use]
    pub fn total(&self) -> f64 {
        let total = self.recency
            + self.time_of_day
            + self.skip_penalty
            + self.completion_bonus
            + self.skipped_penalty;
        if total.is_finite() {
            total
        } else {
            0.0
        }
    }
}

/// A track with its score for one ranking pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub track: Track,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Display label attached to ranked results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankLabel {
    TopPick,
    Trending,
    Recommended,
}

impl RankLabel {
    /// Label for a 1-based rank.
    #[must_use]
    pub const fn for_rank(rank: usize) -> Self {
        match rank {
            1 => RankLabel::TopPick,
            2 | 3 => RankLabel::Trending,
            _ => RankLabel::Recommended,
        }
    }
}

/// Score descending, then track id ascending.
#[must_use]
pub fn compare_scored(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.track.id.cmp(&b.track.id))
}

/// Stateless scorer over a fixed set of weights.
#[derive(Debug, Clone, Default)]
pub struct RecommendationEngine {
    weights: EngineWeights,
}

impl RecommendationEngine {
    #[must_use]
    pub fn new(weights: EngineWeights) -> Self {
        Self { weights }
    }

    #[must_use]
    pub fn weights(&self) -> &EngineWeights {
        &self.weights
    }

    /// Score a single track against `ctx`.
    #[must_use]
    pub fn score(&self, ctx: &Context, track: &Track) -> ScoreBreakdown {
        let w = &self.weights;
        let skip_rate = ctx.skip_rate.clamp(0.0, 1.0);
        let damping = (1.0 - w.skip_dampening * skip_rate).clamp(0.0, 1.0);

        let tod = if matches_time_of_day(&track.tags, ctx.time_of_day) {
            1.0
        } else {
            0.0
        };

        ScoreBreakdown {
            recency: w.recency * recency_affinity(ctx, track) * damping,
            time_of_day: w.time_of_day * tod * damping,
            skip_penalty: -w.skip_penalty * skip_rate,
            completion_bonus: if ctx.completed.contains(&track.id) {
                w.completion_bonus
            } else {
                0.0
            },
            skipped_penalty: if ctx.skipped.contains(&track.id) {
                -w.skipped_track_penalty
            } else {
                0.0
            },
        }
    }

    /// Score and order every eligible candidate.
    ///
    /// The current track and repeated ids (after the first occurrence) are
    /// dropped before scoring.
    #[must_use]
    pub fn rank_all(&self, ctx: &Context, candidates: &[Track]) -> Vec<ScoredCandidate> {
        let mut seen = HashSet::new();
        let eligible: Vec<&Track> = candidates
            .iter()
            .filter(|t| ctx.current_track.as_deref() != Some(t.id.as_str()))
            .filter(|t| seen.insert(t.id.as_str()))
            .collect();

        let mut scored: Vec<ScoredCandidate> = eligible
            .par_iter()
            .map(|track| {
                let breakdown = self.score(ctx, track);
                trace!("Scored '{}': {:?}", track.id, breakdown);
                ScoredCandidate {
                    track: (*track).clone(),
                    score: breakdown.total(),
                    breakdown,
                }
            })
            .collect();
        scored.sort_by(compare_scored);

        apply_diversity(scored, self.weights.max_consecutive_artist)
    }

    /// Top `limit` candidates for `ctx`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cadence::catalog::Track;
    /// use cadence::context::{Context, TimeOfDay};
    /// use cadence::engine::RecommendationEngine;
    ///
    /// let engine = RecommendationEngine::default();
    /// let ctx = Context::generic(TimeOfDay::Night);
    /// let candidates = vec![
    ///     Track::new("a").tagged(&["rock"]),
    ///     Track::new("b").tagged(&["ambient"]),
    /// ];
    ///
    /// let ranked = engine.recommend(&ctx, &candidates, 10);
    /// assert_eq!(ranked[0].track.id, "b");
    /// assert!(engine.recommend(&ctx, &[], 10).is_empty());
    /// ```
    #[must_use]
    pub fn recommend(&self, ctx: &Context, candidates: &[Track], limit: usize) -> Vec<ScoredCandidate> {
        if limit == 0 || candidates.is_empty() {
            return Vec::new();
        }
        let mut ranked = self.rank_all(ctx, candidates);
        ranked.truncate(limit);
        debug!(
            "Ranked {} of {} candidates ({}, skip rate {:.2})",
            ranked.len(),
            candidates.len(),
            ctx.time_of_day,
            ctx.skip_rate
        );
        ranked
    }
}

fn recency_affinity(ctx: &Context, track: &Track) -> f64 {
    let n = ctx.recent.len();
    if n == 0 {
        return 0.0;
    }
    let artist = track.artist_key();
    let tags: HashSet<String> = track.tags.iter().map(|t| t.trim().to_lowercase()).collect();

    ctx.recent
        .iter()
        .position(|recent| {
            let same_artist = artist.is_some()
                && recent.artist.as_deref().map(|a| a.trim().to_lowercase()) == artist;
            same_artist || recent.tags.iter().any(|t| tags.contains(&t.to_lowercase()))
        })
        .map_or(0.0, |i| (n - i) as f64 / n as f64)
}

/// Greedy re-rank so no more than `cap` consecutive entries share an artist.
///
/// At each step the highest-ranked remaining entry that does not extend a
/// full run is taken. When every remaining entry would, the order is kept.
/// Tracks without an artist never count towards a run.
#[must_use]
pub fn apply_diversity(ranked: Vec<ScoredCandidate>, cap: usize) -> Vec<ScoredCandidate> {
    if cap == 0 || ranked.len() <= cap {
        return ranked;
    }
    let mut remaining = ranked;
    let mut out: Vec<ScoredCandidate> = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let run_artist = full_run_artist(&out, cap);
        let pick = run_artist
            .and_then(|artist| {
                remaining
                    .iter()
                    .position(|c| c.track.artist_key().as_deref() != Some(artist.as_str()))
            })
            .unwrap_or(0);
        if pick != 0 {
            trace!(
                "Diversity: lifting '{}' over '{}'",
                remaining[pick].track.id,
                remaining[0].track.id
            );
        }
        out.push(remaining.remove(pick));
    }
    out
}

/// Artist of the last `cap` entries if they all share one.
fn full_run_artist(out: &[ScoredCandidate], cap: usize) -> Option<String> {
    if out.len() < cap {
        return None;
    }
    let tail = &out[out.len() - cap..];
    let first = tail[0].track.artist_key()?;
    tail.iter()
        .all(|c| c.track.artist_key().as_deref() == Some(first.as_str()))
        .then_some(first)
}
