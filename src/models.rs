//! Core data types that flow through the maintenance pipeline.
//!
//! Chart files become [`ChartRecord`]s, artists are annotated through the
//! two genre maps, and the merged record set is the canonical dataset the
//! dashboard reads.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Label assigned to artists for which the catalog returned no genre tags.
pub const UNKNOWN_GENRE: &str = "Unknown";

/// One row of a weekly country chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRecord {
    pub position: u16,
    pub track_name: String,
    pub artist: String,
    pub streams: u64,
    /// Track URL; the catalog track id is its last path segment.
    pub url: String,
    /// Starting Friday of the reporting week.
    pub date: NaiveDate,
    /// Upper-cased country code taken from the chart file name.
    pub country: String,
    /// Primary genre, once resolved.
    #[serde(default)]
    pub genre: Option<String>,
}

/// Identity used when deduplicating merged datasets. Rank and genre are
/// not part of it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub country: String,
    pub date: NaiveDate,
    pub track_name: String,
    pub artist: String,
    pub streams: u64,
    pub url: String,
}

impl ChartRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            country: self.country.clone(),
            date: self.date,
            track_name: self.track_name.clone(),
            artist: self.artist.clone(),
            streams: self.streams,
            url: self.url.clone(),
        }
    }

    /// Catalog id of the track, if the URL carries one.
    pub fn track_id(&self) -> Option<&str> {
        track_id_from_url(&self.url)
    }

    pub fn genre_or_unknown(&self) -> &str {
        self.genre.as_deref().unwrap_or(UNKNOWN_GENRE)
    }
}

/// Extract the trailing path segment of a track URL, ignoring any query
/// string. Returns `None` for empty URLs.
pub fn track_id_from_url(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or("");
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.trim().is_empty())
}

/// Artist name → every genre tag the catalog returned for it.
pub type GenreMapMany = BTreeMap<String, Vec<String>>;

/// Artist name → chosen primary genre label.
pub type GenreMapPrimary = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_id_from_url() {
        assert_eq!(
            track_id_from_url("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC"),
            Some("4uLU6hMCjMI75M1A2tKUQC")
        );
        assert_eq!(
            track_id_from_url("https://open.spotify.com/track/abc123?si=xyz"),
            Some("abc123")
        );
        assert_eq!(track_id_from_url(""), None);
    }

    #[test]
    fn test_key_ignores_position_and_genre() {
        let a = ChartRecord {
            position: 1,
            track_name: "Song".to_string(),
            artist: "Band".to_string(),
            streams: 10,
            url: "https://open.spotify.com/track/x".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            country: "GB".to_string(),
            genre: None,
        };
        let mut b = a.clone();
        b.position = 3;
        b.genre = Some("Pop".to_string());
        assert_eq!(a.key(), b.key());
    }
}
