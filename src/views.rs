//! Read-side aggregations the dashboard renders.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::models::ChartRecord;
use crate::parser::MAX_CHART_ROWS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtistRank {
    pub position: usize,
    pub artist: String,
    pub genre: String,
    pub streams: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountrySummary {
    pub country: String,
    pub total_streams: u64,
    pub top_artist: String,
    pub top_genre: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenreShare {
    pub genre: String,
    pub streams: u64,
}

/// Highest total first, then by name.
fn ranked<K: Ord + Clone>(totals: HashMap<K, u64>) -> Vec<(K, u64)> {
    let mut rows: Vec<(K, u64)> = totals.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows
}

/// Top artists of one country, summed over every week in the dataset.
pub fn country_view(records: &[ChartRecord], country: &str) -> Vec<ArtistRank> {
    let country = country.to_uppercase();
    let mut totals: HashMap<(String, String), u64> = HashMap::new();
    for r in records.iter().filter(|r| r.country == country) {
        *totals
            .entry((r.artist.clone(), r.genre_or_unknown().to_string()))
            .or_insert(0) += r.streams;
    }

    ranked(totals)
        .into_iter()
        .take(MAX_CHART_ROWS)
        .enumerate()
        .map(|(i, ((artist, genre), streams))| ArtistRank {
            position: i + 1,
            artist,
            genre,
            streams,
        })
        .collect()
}

pub fn world_view(records: &[ChartRecord]) -> Vec<CountrySummary> {
    #[derive(Default)]
    struct Acc {
        total: u64,
        artists: HashMap<String, u64>,
        genres: HashMap<String, u64>,
    }

    let mut by_country: BTreeMap<String, Acc> = BTreeMap::new();
    for r in records {
        let acc = by_country.entry(r.country.clone()).or_default();
        acc.total += r.streams;
        *acc.artists.entry(r.artist.clone()).or_insert(0) += r.streams;
        *acc.genres
            .entry(r.genre_or_unknown().to_string())
            .or_insert(0) += r.streams;
    }

    by_country
        .into_iter()
        .map(|(country, acc)| CountrySummary {
            country,
            total_streams: acc.total,
            top_artist: ranked(acc.artists)
                .into_iter()
                .next()
                .map(|(a, _)| a)
                .unwrap_or_default(),
            top_genre: ranked(acc.genres)
                .into_iter()
                .next()
                .map(|(g, _)| g)
                .unwrap_or_default(),
        })
        .collect()
}

pub fn genre_breakdown(records: &[ChartRecord], country: &str) -> Vec<GenreShare> {
    let country = country.to_uppercase();
    let mut totals: HashMap<String, u64> = HashMap::new();
    for r in records.iter().filter(|r| r.country == country) {
        *totals.entry(r.genre_or_unknown().to_string()).or_insert(0) += r.streams;
    }
    ranked(totals)
        .into_iter()
        .map(|(genre, streams)| GenreShare { genre, streams })
        .collect()
}
