//! # Context Builder
//!
//! Turns a session (or the lack of one) plus the request time into the
//! scoring [`Context`]. Building never fails: an expired, unknown or
//! anonymous session yields a generic context, so personalization can only
//! ever improve a response, never block it.

use crate::catalog::Track;
use crate::session::{EventKind, Session};
use chrono::{DateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Coarse time-of-day bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    /// 05–12 morning, 12–17 afternoon, 17–22 evening, otherwise night.
    #[must_use]
    pub const fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeOfDay::Morning,
            12..=16 => TimeOfDay::Afternoon,
            17..=21 => TimeOfDay::Evening,
            _ => TimeOfDay::Night,
        }
    }

    #[must_use]
    pub fn at<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        Self::from_hour(now.hour())
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TimeOfDay::Morning => "morning",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Night => "night",
        }
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rough read on how the listener is engaging with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListeningMood {
    /// More skips than plays.
    Restless,
    /// Plays outnumber skips more than two to one.
    Engaged,
    #[default]
    Neutral,
}

impl ListeningMood {
    #[must_use]
    pub fn from_counts(plays: u32, skips: u32) -> Self {
        if plays == 0 && skips == 0 {
            ListeningMood::Neutral
        } else if skips > plays {
            ListeningMood::Restless
        } else if plays > skips.saturating_mul(2) {
            ListeningMood::Engaged
        } else {
            ListeningMood::Neutral
        }
    }
}

/// A recently heard track with whatever metadata the client sent along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentTrack {
    pub id: String,
    pub artist: Option<String>,
    pub tags: Vec<String>,
}

/// Request-scoped scoring input. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub current_track: Option<String>,
    /// Distinct recent tracks, most recent first.
    pub recent: Vec<RecentTrack>,
    pub time_of_day: TimeOfDay,
    pub skip_rate: f64,
    pub completed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    pub mood: ListeningMood,
    pub anonymous: bool,
}

impl Context {
    /// Unpersonalized context for a listener without a session.
    #[must_use]
    pub fn generic(time_of_day: TimeOfDay) -> Self {
        Self {
            current_track: None,
            recent: Vec::new(),
            time_of_day,
            skip_rate: 0.0,
            completed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            mood: ListeningMood::Neutral,
            anonymous: true,
        }
    }

    /// Override the current track with what the request says is playing.
    #[must_use]
    pub fn with_current_track(mut self, track_id: Option<String>) -> Self {
        if let Some(id) = track_id.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
            self.current_track = Some(id);
        }
        self
    }

    /// Fill in artist/tags of recent tracks that arrived without metadata,
    /// using the candidate tracks of the current request.
    #[must_use]
    pub fn with_catalog_hints(mut self, tracks: &[Track]) -> Self {
        for recent in &mut self.recent {
            if recent.artist.is_some() && !recent.tags.is_empty() {
                continue;
            }
            if let Some(track) = tracks.iter().find(|t| t.id == recent.id) {
                if recent.artist.is_none() {
                    recent.artist = track.artist.clone();
                }
                if recent.tags.is_empty() {
                    recent.tags = track.tags.iter().map(|t| t.to_lowercase()).collect();
                }
            }
        }
        self
    }

    #[must_use]
    pub fn has_history(&self) -> bool {
        !self.recent.is_empty()
    }
}

/// Build the scoring context for `session` at `now`.
///
/// The current track is the track of the latest event when that event is a
/// pause or a play that has not been played through; a skip or a completed
/// play leaves it unset. Requests can still name one explicitly through
/// [`Context::with_current_track`].
///
/// Recent tracks come from the session's own events, or from the user's
/// earlier activity while the session has none.
#[must_use]
pub fn build_context<Tz: TimeZone>(
    session: Option<&Session>,
    now: &DateTime<Tz>,
    recent_limit: usize,
    completion_threshold: f64,
) -> Context {
    let time_of_day = TimeOfDay::at(now);
    let Some(session) = session else {
        return Context::generic(time_of_day);
    };

    let current_track = session.events.last().and_then(|e| match e.kind {
        EventKind::Skip => None,
        _ if e.is_completion(completion_threshold) => None,
        _ => Some(e.track_id.clone()),
    });

    let mut seen = HashSet::new();
    let mut recent: Vec<RecentTrack> = Vec::new();
    let history = if session.events.is_empty() {
        &session.user_activity
    } else {
        &session.events
    };
    for event in history.iter().rev() {
        if seen.insert(event.track_id.as_str()) {
            if recent.len() == recent_limit {
                break;
            }
            recent.push(RecentTrack {
                id: event.track_id.clone(),
                artist: event.artist.clone(),
                tags: event.tags.clone(),
            });
        } else if let Some(entry) = recent.iter_mut().find(|r| r.id == event.track_id) {
            // Older events of a track may carry hints the newest one lacked.
            if entry.artist.is_none() {
                entry.artist = event.artist.clone();
            }
            if entry.tags.is_empty() {
                entry.tags = event.tags.clone();
            }
        }
    }

    let agg = &session.aggregates;
    Context {
        current_track,
        recent,
        time_of_day,
        skip_rate: agg.skip_rate,
        completed: agg.completed.clone(),
        skipped: agg.skipped.clone(),
        mood: ListeningMood::from_counts(agg.play_count, agg.skip_count),
        anonymous: session.seed.anonymous,
    }
}
