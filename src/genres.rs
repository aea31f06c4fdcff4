//! Genre Resolver.
//!
//! Every artist in the working set should end up with a primary genre.
//! Artists missing from the primary map are looked up through a
//! [`GenreCatalog`] using one representative track each. All tags ever
//! seen accumulate in the many-map; an artist's primary genre is its tag
//! with the highest frequency across the whole many-map, ties broken by
//! tag name, title-cased. Artists the catalog knows but has no tags for
//! are labelled `Unknown`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::catalog::GenreCatalog;
use crate::models::{ChartRecord, GenreMapMany, GenreMapPrimary, UNKNOWN_GENRE};

/// The two persisted artist → genre maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenreMaps {
    pub many: GenreMapMany,
    pub primary: GenreMapPrimary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    /// Artists that had no primary genre before the pass.
    pub unresolved: usize,
    /// Artists returned by the catalog during this pass.
    pub catalogued: usize,
    /// Records that still lack a genre afterwards.
    pub pending_records: usize,
}

/// Set `genre` on every record whose artist is in `primary`.
pub fn annotate(records: &mut [ChartRecord], primary: &GenreMapPrimary) {
    for record in records.iter_mut() {
        if let Some(genre) = primary.get(&record.artist) {
            record.genre = Some(genre.clone());
        }
    }
}

/// Artists without a primary genre, each with the catalog id of the first
/// track they appear on. Artists without a usable track URL are left out.
pub fn unresolved_tracks(
    records: &[ChartRecord],
    primary: &GenreMapPrimary,
) -> BTreeMap<String, String> {
    let mut tracks = BTreeMap::new();
    for record in records {
        if record.artist.is_empty() || primary.contains_key(&record.artist) {
            continue;
        }
        if tracks.contains_key(&record.artist) {
            continue;
        }
        if let Some(id) = record.track_id() {
            tracks.insert(record.artist.clone(), id.to_string());
        }
    }
    tracks
}

/// Number of occurrences of each tag across every artist in the many-map.
pub fn genre_frequencies(many: &GenreMapMany) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for tags in many.values() {
        for tag in tags {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Pick the primary label for one artist's tags.
pub fn choose_primary(tags: &[String], frequencies: &HashMap<String, usize>) -> String {
    tags.iter()
        .max_by(|a, b| {
            let fa = frequencies.get(*a).copied().unwrap_or(0);
            let fb = frequencies.get(*b).copied().unwrap_or(0);
            // Higher frequency wins; on a tie the alphabetically first tag wins.
            fa.cmp(&fb).then_with(|| b.cmp(a))
        })
        .map(|tag| title_case(tag))
        .unwrap_or_else(|| UNKNOWN_GENRE.to_string())
}

/// Primary labels for `artists`, using frequencies from the full many-map.
pub fn primary_genres<'a>(
    many: &GenreMapMany,
    artists: impl IntoIterator<Item = &'a String>,
) -> GenreMapPrimary {
    let frequencies = genre_frequencies(many);
    artists
        .into_iter()
        .map(|artist| {
            let tags = many.get(artist).map(Vec::as_slice).unwrap_or(&[]);
            (artist.clone(), choose_primary(tags, &frequencies))
        })
        .collect()
}

/// Upper-case the first letter of every alphabetic run and lower-case the
/// rest (`"k-pop"` → `"K-Pop"`, `"r&b"` → `"R&B"`).
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_word = false;
    for ch in s.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}

pub struct GenreResolver {
    catalog: Arc<dyn GenreCatalog>,
}

impl GenreResolver {
    pub fn new(catalog: Arc<dyn GenreCatalog>) -> Self {
        Self { catalog }
    }

    /// Annotate `records`, resolving unknown artists through the catalog and
    /// growing both maps. Every artist the catalog returns in this pass gets
    /// its primary genre recomputed, including ones already in the map.
    pub async fn resolve(
        &self,
        records: &mut [ChartRecord],
        maps: &mut GenreMaps,
    ) -> Result<ResolveSummary> {
        annotate(records, &maps.primary);

        let pending = unresolved_tracks(records, &maps.primary);
        let mut summary = ResolveSummary {
            unresolved: pending.len(),
            ..ResolveSummary::default()
        };

        if !pending.is_empty() {
            info!(artists = pending.len(), "cataloguing new artists");

            let mut track_ids: Vec<String> = pending.into_values().collect();
            track_ids.sort();
            track_ids.dedup();

            let artist_ids = self.catalog.artists_for_tracks(&track_ids).await?;
            let mut ids: Vec<String> = artist_ids.into_values().collect();
            ids.sort();
            ids.dedup();

            let new_artists = self.catalog.genres_for_artists(&ids).await?;
            summary.catalogued = new_artists.len();

            maps.many
                .extend(new_artists.iter().map(|(k, v)| (k.clone(), v.clone())));
            let assigned = primary_genres(&maps.many, new_artists.keys());
            maps.primary.extend(assigned);

            annotate(records, &maps.primary);
        }

        summary.pending_records = records.iter().filter(|r| r.genre.is_none()).count();
        info!(
            unresolved = summary.unresolved,
            catalogued = summary.catalogued,
            pending_records = summary.pending_records,
            "genre resolution complete"
        );
        Ok(summary)
    }
}
