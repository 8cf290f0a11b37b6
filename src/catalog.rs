//! Track metadata and the catalog provider seam.
//!
//! The upstream search provider is a black box: the engine only reads a
//! track's id, artist, tags, duration and (when known) size. [`FileCatalog`]
//! is a JSON-file stand-in used by the CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Track metadata as far as scoring and cache prediction care.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub duration_secs: Option<u32>,
    /// Estimated download size, when the provider knows it.
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl Track {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            artist: None,
            tags: Vec::new(),
            duration_secs: None,
            size_bytes: None,
        }
    }

    #[must_use]
    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn by(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    #[must_use]
    pub fn tagged(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|t| (*t).to_string()));
        self
    }

    #[must_use]
    pub fn sized(mut self, bytes: u64) -> Self {
        self.size_bytes = Some(bytes);
        self
    }

    /// Lowercased artist, used for affinity and diversity comparisons.
    #[must_use]
    pub fn artist_key(&self) -> Option<String> {
        self.artist
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_lowercase)
    }
}

/// Read-only search provider.
pub trait TrackCatalog: Send + Sync {
    /// Tracks matching `query`, in the provider's own order.
    fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>>;

    /// Generic popularity ordering (most popular first) used for listeners
    /// without a resolvable session. Providers without one return nothing.
    fn popular(&self, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Candidates for one request: given explicitly, or looked up by query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateInput {
    Tracks(Vec<Track>),
    Query { query: String, limit: usize },
}

impl Default for CandidateInput {
    fn default() -> Self {
        CandidateInput::Tracks(Vec::new())
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    tracks: Vec<Track>,
    #[serde(default)]
    popular: Vec<String>,
}

/// Catalog loaded from a JSON file of the form
/// `{ "tracks": [...], "popular": ["id", ...] }`.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    tracks: Vec<Track>,
    popular: Vec<String>,
}

impl FileCatalog {
    #[must_use]
    pub fn new(tracks: Vec<Track>, popular: Vec<String>) -> Self {
        Self { tracks, popular }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file {}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse catalog file {}", path.display()))?;
        log::debug!(
            "Loaded catalog with {} tracks ({} ranked popular)",
            file.tracks.len(),
            file.popular.len()
        );
        Ok(Self::new(file.tracks, file.popular))
    }

    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }
}

impl TrackCatalog for FileCatalog {
    /// Case-insensitive substring match on title, artist and tags.
    fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>> {
        let needle = query.trim().to_lowercase();
        Ok(self
            .tracks
            .iter()
            .filter(|t| {
                needle.is_empty()
                    || t.title.to_lowercase().contains(&needle)
                    || t.artist_key().is_some_and(|a| a.contains(&needle))
                    || t.tags.iter().any(|tag| tag.to_lowercase().contains(&needle))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn popular(&self, limit: usize) -> Result<Vec<String>> {
        Ok(self.popular.iter().take(limit).cloned().collect())
    }
}

/// Load candidate tracks from a JSON array file.
pub fn load_tracks(path: &Path) -> Result<Vec<Track>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read candidates file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse candidates file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn catalog() -> FileCatalog {
        FileCatalog::new(
            vec![
                Track::new("1").titled("Morning Light").by("Aurora").tagged(&["Upbeat"]),
                Track::new("2").titled("Night Drive").by("Kavinsky").tagged(&["synthwave"]),
                Track::new("3").titled("Slow Dawn").by("aurora"),
            ],
            vec!["2".into(), "1".into()],
        )
    }

    #[test]
    fn test_search_matches_title_artist_and_tags() {
        let c = catalog();
        let ids = |q: &str| -> Vec<String> {
            c.search(q, 10).unwrap().into_iter().map(|t| t.id).collect()
        };
        assert_eq!(ids("night"), vec!["2"]);
        assert_eq!(ids("AURORA"), vec!["1", "3"]);
        assert_eq!(ids("upbeat"), vec!["1"]);
        assert_eq!(ids(""), vec!["1", "2", "3"]);
        assert_eq!(c.search("", 2).unwrap().len(), 2);
    }

    #[test]
    fn test_popular_respects_limit() {
        assert_eq!(catalog().popular(1).unwrap(), vec!["2".to_string()]);
    }

    #[test]
    fn test_artist_key_normalizes() {
        assert_eq!(Track::new("x").by("  Daft Punk ").artist_key(), Some("daft punk".into()));
        assert_eq!(Track::new("x").by("   ").artist_key(), None);
        assert_eq!(Track::new("x").artist_key(), None);
    }

    #[test]
    fn test_load_catalog_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "tracks": [{{ "id": "a", "title": "A", "artist": "X", "tags": ["chill"], "size_bytes": 1024 }}], "popular": ["a"] }}"#
        )
        .unwrap();
        let catalog = FileCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.tracks().len(), 1);
        assert_eq!(catalog.tracks()[0].size_bytes, Some(1024));
        assert_eq!(catalog.popular(10).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_load_tracks_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_tracks(file.path()).is_err());
    }
}
