//! Asset Builder and persisted artifact formats.
//!
//! Merges freshly parsed records into the historical dataset, removes
//! duplicate observations, backfills genres and keeps a rolling window
//! measured back from the newest week present.
//!
//! # Formats
//!
//! The canonical dataset is a Deflate zip with two entries:
//!
//! | Entry | Content |
//! |-------|---------|
//! | `manifest.json` | `schema_version`, `last_data_date`, `rows` |
//! | `charts.csv` | `position,track_name,artist,streams,url,date,country,genre` |
//!
//! The genre maps are plain JSON objects.

use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::genres::{annotate, GenreMaps};
use crate::models::{ChartRecord, GenreMapPrimary};
use crate::parser::MAX_CHART_ROWS;

pub const SCHEMA_VERSION: u32 = 1;

const MANIFEST_ENTRY: &str = "manifest.json";
const CHARTS_ENTRY: &str = "charts.csv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub schema_version: u32,
    pub last_data_date: Option<NaiveDate>,
    pub rows: usize,
}

/// Newest week present in `records`.
pub fn max_date(records: &[ChartRecord]) -> Option<NaiveDate> {
    records.iter().map(|r| r.date).max()
}

/// Union of `historical` and `incoming` with duplicate observations
/// removed. The first copy of an observation is kept, historical rows
/// first.
pub fn merge(historical: Vec<ChartRecord>, incoming: Vec<ChartRecord>) -> Vec<ChartRecord> {
    let mut seen = HashSet::with_capacity(historical.len() + incoming.len());
    historical
        .into_iter()
        .chain(incoming)
        .filter(|r| seen.insert(r.key()))
        .collect()
}

/// Keep rows within `window_days` of the newest date (inclusive).
pub fn retain_window(records: &mut Vec<ChartRecord>, window_days: i64) {
    let Some(newest) = max_date(records) else {
        return;
    };
    let oldest = newest - Duration::days(window_days);
    records.retain(|r| r.date >= oldest);
}

/// Drop rows that no longer satisfy the record invariants and normalise
/// country codes. Returns the number of rows dropped.
pub fn normalize(records: &mut Vec<ChartRecord>) -> usize {
    let before = records.len();
    records.retain(|r| (1..=MAX_CHART_ROWS as u16).contains(&r.position));
    for record in records.iter_mut() {
        let country = record.country.trim().to_uppercase();
        record.country = country;
        if record.genre.as_deref().is_some_and(|g| g.trim().is_empty()) {
            record.genre = None;
        }
    }
    before - records.len()
}

fn sort_records(records: &mut [ChartRecord]) {
    records.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.country.cmp(&b.country))
            .then_with(|| a.position.cmp(&b.position))
    });
}

/// Build the canonical dataset from history plus the newly parsed rows.
pub fn build_dataset(
    historical: Vec<ChartRecord>,
    incoming: Vec<ChartRecord>,
    primary: &GenreMapPrimary,
    retention_days: i64,
) -> Vec<ChartRecord> {
    let incoming_rows = incoming.len();
    let mut records = merge(historical, incoming);
    annotate(&mut records, primary);
    retain_window(&mut records, retention_days);
    sort_records(&mut records);

    info!(
        incoming = incoming_rows,
        rows = records.len(),
        last_data_date = ?max_date(&records),
        "built chart dataset"
    );
    records
}

/// Re-apply invariants and retention to an existing dataset.
pub fn refresh_dataset(mut records: Vec<ChartRecord>, retention_days: i64) -> Vec<ChartRecord> {
    let dropped = normalize(&mut records);
    if dropped > 0 {
        warn!(dropped, "dropped invalid dataset rows");
    }
    records = merge(records, Vec::new());
    retain_window(&mut records, retention_days);
    sort_records(&mut records);
    records
}

pub fn encode_dataset(records: &[ChartRecord]) -> Result<Vec<u8>> {
    let manifest = DatasetManifest {
        schema_version: SCHEMA_VERSION,
        last_data_date: max_date(records),
        rows: records.len(),
    };

    let mut csv_writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        csv_writer.serialize(record)?;
    }
    let csv_bytes = csv_writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush dataset CSV: {}", e))?;

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(MANIFEST_ENTRY, options)?;
    zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
    zip.start_file(CHARTS_ENTRY, options)?;
    zip.write_all(&csv_bytes)?;
    Ok(zip.finish()?.into_inner())
}

pub fn decode_dataset(bytes: &[u8]) -> Result<(DatasetManifest, Vec<ChartRecord>)> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Dataset is not a valid archive")?;

    let manifest: DatasetManifest = {
        let mut entry = archive
            .by_name(MANIFEST_ENTRY)
            .context("Dataset archive has no manifest")?;
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        serde_json::from_str(&text).context("Dataset manifest is malformed")?
    };
    if manifest.schema_version != SCHEMA_VERSION {
        bail!(
            "Unsupported dataset schema version {} (expected {})",
            manifest.schema_version,
            SCHEMA_VERSION
        );
    }

    let entry = archive
        .by_name(CHARTS_ENTRY)
        .context("Dataset archive has no chart table")?;
    let mut reader = csv::Reader::from_reader(entry);
    let mut records = Vec::with_capacity(manifest.rows);
    let mut rejected = 0usize;
    for row in reader.deserialize::<ChartRecord>() {
        match row {
            Ok(record) => records.push(record),
            Err(_) => rejected += 1,
        }
    }
    if rejected > 0 {
        warn!(rejected, "skipped undecodable dataset rows");
    }
    Ok((manifest, records))
}

pub fn write_dataset(path: &Path, records: &[ChartRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = encode_dataset(records)?;
    std::fs::write(path, bytes)
        .with_context(|| format!("Failed to write dataset: {}", path.display()))
}

pub fn read_dataset(path: &Path) -> Result<Vec<ChartRecord>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read dataset: {}", path.display()))?;
    let (_, records) = decode_dataset(&bytes)?;
    Ok(records)
}

/// Load both genre maps. A missing file is an empty map.
pub fn load_genre_maps(many_path: &Path, primary_path: &Path) -> Result<GenreMaps> {
    Ok(GenreMaps {
        many: load_json_map(many_path)?,
        primary: load_json_map(primary_path)?,
    })
}

pub fn save_genre_maps(maps: &GenreMaps, many_path: &Path, primary_path: &Path) -> Result<()> {
    save_json_map(&maps.many, many_path)?;
    save_json_map(&maps.primary, primary_path)
}

fn load_json_map<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        info!(path = %path.display(), "no genre map found, starting empty");
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read genre map: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Malformed genre map: {}", path.display()))
}

fn save_json_map<T: Serialize>(map: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(map)?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write genre map: {}", path.display()))
}
