//! Session data model: playback events and the aggregates derived from them.
//!
//! Events are validated once on the way in and are immutable afterwards.
//! Aggregates are never stored on their own; they are recomputed from the
//! retained event sequence every time a session is read or written, so a
//! reader can never observe aggregates that disagree with the events.

use crate::config::SessionConfig;
use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Kind of a playback event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Play,
    Pause,
    Skip,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Play => "play",
            EventKind::Pause => "pause",
            EventKind::Skip => "skip",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "play" => Ok(EventKind::Play),
            "pause" => Ok(EventKind::Pause),
            "skip" => Ok(EventKind::Skip),
            other => Err(SessionError::InvalidEvent(format!(
                "unrecognized event kind '{other}' (expected play, pause or skip)"
            ))),
        }
    }
}

/// Unvalidated event as it arrives from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventInput {
    pub kind: String,
    pub track_id: String,
    /// Unix millis. Defaults to the time of recording.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Playback position in seconds.
    #[serde(default)]
    pub position: Option<f64>,
    /// Track duration in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Metadata hints copied from the client's view of the track.
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EventInput {
    #[must_use]
    pub fn new(kind: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            track_id: track_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn progress(mut self, position: f64, duration: f64) -> Self {
        self.position = Some(position);
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A validated, append-only playback event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub track_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Event {
    /// Validate raw input. `now_millis` fills a missing timestamp.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidEvent`] for an unknown kind, an empty track id
    /// or a negative / non-finite position or duration.
    pub fn validate(input: EventInput, now_millis: i64) -> Result<Self, SessionError> {
        let kind: EventKind = input.kind.parse()?;

        let track_id = input.track_id.trim();
        if track_id.is_empty() {
            return Err(SessionError::InvalidEvent("track_id must not be empty".into()));
        }

        for (name, value) in [("position", input.position), ("duration", input.duration)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(SessionError::InvalidEvent(format!(
                        "{name} must be a finite, non-negative number of seconds (got {v})"
                    )));
                }
            }
        }

        let artist = input
            .artist
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        let tags = input
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        Ok(Self {
            kind,
            track_id: track_id.to_string(),
            timestamp: input.timestamp.unwrap_or(now_millis),
            position: input.position,
            duration: input.duration,
            artist,
            tags,
        })
    }

    /// Position/duration ratio clamped to `[0, 1]`, if both are known.
    #[must_use]
    pub fn progress(&self) -> Option<f64> {
        match (self.position, self.duration) {
            (Some(pos), Some(dur)) if dur > 0.0 => Some((pos / dur).clamp(0.0, 1.0)),
            _ => None,
        }
    }

    /// Whether this event marks its track as played through.
    #[must_use]
    pub fn is_completion(&self, threshold: f64) -> bool {
        self.kind != EventKind::Skip && self.progress().is_some_and(|p| p >= threshold)
    }
}

/// Hints supplied when a session is started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSeed {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
    /// Listener identity. Events of identified sessions are mirrored into a
    /// per-user activity log that outlives the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl SessionSeed {
    /// Trimmed, non-empty user id.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user_id.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// Session record stored under `session:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub created_at: i64,
    pub last_activity: i64,
    #[serde(default)]
    pub seed: SessionSeed,
}

/// Rolling features derived from the retained events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    pub event_count: usize,
    pub play_count: u32,
    pub skip_count: u32,
    pub pause_count: u32,
    /// skips / (plays + skips) over the trailing skip window.
    pub skip_rate: f64,
    /// Exponentially weighted average of position/duration ratios.
    pub avg_dwell: f64,
    /// Tracks whose latest signal was a play-through.
    pub completed: BTreeSet<String>,
    /// Tracks whose latest signal was a skip.
    pub skipped: BTreeSet<String>,
}

impl Aggregates {
    /// Recompute every aggregate from `events` (oldest first).
    #[must_use]
    pub fn from_events(events: &[Event], config: &SessionConfig) -> Self {
        let mut agg = Aggregates {
            event_count: events.len(),
            ..Aggregates::default()
        };

        let mut dwell: Option<f64> = None;
        for event in events {
            match event.kind {
                EventKind::Play => agg.play_count += 1,
                EventKind::Pause => agg.pause_count += 1,
                EventKind::Skip => agg.skip_count += 1,
            }

            if let Some(ratio) = event.progress() {
                dwell = Some(match dwell {
                    None => ratio,
                    Some(prev) => config.dwell_alpha * ratio + (1.0 - config.dwell_alpha) * prev,
                });
            }

            // Latest signal for a track wins.
            if event.kind == EventKind::Skip {
                agg.completed.remove(&event.track_id);
                agg.skipped.insert(event.track_id.clone());
            } else if event.is_completion(config.completion_threshold) {
                agg.skipped.remove(&event.track_id);
                agg.completed.insert(event.track_id.clone());
            }
        }
        agg.avg_dwell = dwell.unwrap_or(0.0);
        agg.skip_rate = trailing_skip_rate(events, config.skip_window);
        agg
    }
}

fn trailing_skip_rate(events: &[Event], window: usize) -> f64 {
    let start = events.len().saturating_sub(window);
    let (plays, skips) = events[start..]
        .iter()
        .fold((0u32, 0u32), |(p, s), e| match e.kind {
            EventKind::Play => (p + 1, s),
            EventKind::Skip => (p, s + 1),
            EventKind::Pause => (p, s),
        });
    match plays + skips {
        0 => 0.0,
        attempts => f64::from(skips) / f64::from(attempts),
    }
}

/// A resolved session: metadata, retained events and aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub last_activity: i64,
    pub seed: SessionSeed,
    /// Oldest first.
    pub events: Vec<Event>,
    pub aggregates: Aggregates,
    /// The user's activity from earlier sessions, oldest first. Only loaded
    /// while this session has no events of its own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_activity: Vec<Event>,
}

impl Session {
    #[must_use]
    pub fn from_parts(meta: SessionMeta, events: Vec<Event>, config: &SessionConfig) -> Self {
        let aggregates = Aggregates::from_events(&events, config);
        Self {
            id: meta.id,
            created_at: meta.created_at,
            last_activity: meta.last_activity,
            seed: meta.seed,
            events,
            aggregates,
            user_activity: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_user_activity(mut self, activity: Vec<Event>) -> Self {
        self.user_activity = activity;
        self
    }
}
