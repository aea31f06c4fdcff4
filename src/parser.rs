//! Chart Parser.
//!
//! A chart file starts with a free-text note line, followed by the column
//! header and up to 200 ranked rows. Country and week come from the file
//! name, not the content.
//!
//! Files whose header does not match are skipped with a warning (the
//! upstream site serves HTML error pages with a 200 from time to time).
//! Rows that fail to parse are dropped individually.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::charts::FILE_INFIX;
use crate::dates::parse_iso_date;
use crate::models::ChartRecord;

/// Column header expected on the second line of every chart file.
pub const EXPECTED_HEADER: &str = r#"Position,"Track Name",Artist,Streams,URL"#;

/// Only the top of each chart is kept.
pub const MAX_CHART_ROWS: usize = 100;

/// Derive `(COUNTRY, week start)` from `{country}-streams-{YYYY-MM-DD}.csv`.
pub fn parse_file_name(path: &Path) -> Option<(String, NaiveDate)> {
    let stem = path.file_stem()?.to_str()?;
    let (country, date) = stem.rsplit_once(FILE_INFIX)?;
    if country.is_empty() {
        return None;
    }
    let date = parse_iso_date(date).ok()?;
    Some((country.to_uppercase(), date))
}

/// Parse the text of one chart file.
///
/// Returns an empty vector when the header line does not match.
pub fn parse_chart_text(text: &str, country: &str, date: NaiveDate) -> Vec<ChartRecord> {
    let text = text.trim_start_matches('\u{feff}');
    let mut lines = text.splitn(3, '\n');
    let _note = lines.next();
    let header = lines.next().unwrap_or("").trim_end();
    if header != EXPECTED_HEADER {
        return Vec::new();
    }
    let body = lines.next().unwrap_or("");

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut records = Vec::new();
    for (row_index, row) in reader.records().take(MAX_CHART_ROWS).enumerate() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                debug!(country, %date, row = row_index, error = %e, "unreadable chart row");
                continue;
            }
        };
        match parse_row(&row, country, date) {
            Some(record) => records.push(record),
            None => {
                debug!(country, %date, row = row_index, "invalid chart row dropped");
            }
        }
    }
    records
}

fn parse_row(row: &csv::StringRecord, country: &str, date: NaiveDate) -> Option<ChartRecord> {
    if row.len() < 5 {
        return None;
    }
    let position: u16 = row.get(0)?.trim().parse().ok()?;
    if !(1..=MAX_CHART_ROWS as u16).contains(&position) {
        return None;
    }
    let streams: u64 = row.get(3)?.trim().parse().ok()?;

    Some(ChartRecord {
        position,
        track_name: row.get(1)?.to_string(),
        artist: row.get(2)?.to_string(),
        streams,
        url: row.get(4)?.trim().to_string(),
        date,
        country: country.to_string(),
        genre: None,
    })
}

/// Parse a single downloaded chart file.
pub fn parse_chart_file(path: &Path) -> Result<Vec<ChartRecord>> {
    let Some((country, date)) = parse_file_name(path) else {
        warn!(path = %path.display(), "unrecognised chart file name, skipping");
        return Ok(Vec::new());
    };

    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read chart file: {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);

    let records = parse_chart_text(&text, &country, date);
    if records.is_empty() {
        warn!(path = %path.display(), "unexpected file format, skipping");
    }
    Ok(records)
}

/// Parse every chart file in `dir`, optionally only weeks on or after
/// `since`. Files are visited in name order so the output is stable.
pub fn parse_chart_dir(dir: &Path, since: Option<NaiveDate>) -> Result<Vec<ChartRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let matcher = chart_file_globset()?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !matcher.is_match(name.as_ref()) {
            continue;
        }
        if let Some(since) = since {
            match parse_file_name(entry.path()) {
                Some((_, date)) if date < since => continue,
                _ => {}
            }
        }
        paths.push(entry.path().to_path_buf());
    }
    paths.sort();

    let mut records = Vec::new();
    for path in &paths {
        records.extend(parse_chart_file(path)?);
    }

    info!(
        files = paths.len(),
        records = records.len(),
        dir = %dir.display(),
        "parsed chart files"
    );
    Ok(records)
}

fn chart_file_globset() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new(&format!("*{}*.csv", FILE_INFIX))?);
    Ok(builder.build()?)
}
