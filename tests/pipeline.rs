//! End-to-end maintenance runs against a local chart source, an in-memory
//! bucket and a canned genre catalog.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use tempfile::TempDir;

use soundboard::asset::decode_dataset;
use soundboard::catalog::GenreCatalog;
use soundboard::charts::{ChartFetcher, FetchOutcome, FetchSummary};
use soundboard::config::{parse_config, Config};
use soundboard::dates::{most_recent_friday, parse_iso_date, reporting_weeks};
use soundboard::error::StoreError;
use soundboard::maintain::{MaintenanceOutcome, Maintainer, Mode};
use soundboard::parser::EXPECTED_HEADER;
use soundboard::store::{
    BucketObject, MemoryStore, ObjectHead, ObjectMetadata, ObjectStore, LAST_DATA_DATE_META,
};

const ROWS_PER_CHART: usize = 5;

fn d(s: &str) -> NaiveDate {
    parse_iso_date(s).unwrap()
}

// ─── Chart source stub ──────────────────────────────────────────────

#[derive(Clone, Default)]
struct ChartSource {
    /// (country, week start) pairs answered with 404.
    missing: Arc<HashSet<(String, String)>>,
    /// (country, week start) pairs answered only after a long stall.
    slow: Arc<HashSet<(String, String)>>,
    hits: Arc<AtomicUsize>,
}

fn chart_csv(country: &str) -> String {
    let mut text = format!(",,\"Note: weekly chart for {}\",,\n", country);
    text.push_str(EXPECTED_HEADER);
    text.push('\n');
    for i in 1..=ROWS_PER_CHART {
        writeln!(
            text,
            "{},\"Song {}\",Artist {},{},https://open.spotify.com/track/t{}",
            i,
            i,
            i,
            10_000 - i,
            i
        )
        .unwrap();
    }
    text
}

async fn serve_chart(
    State(source): State<ChartSource>,
    Path((country, range)): Path<(String, String)>,
) -> Response {
    source.hits.fetch_add(1, Ordering::SeqCst);
    let start = range.split("--").next().unwrap_or_default().to_string();
    let week = (country.clone(), start);
    if source.missing.contains(&week) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if source.slow.contains(&week) {
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    }
    chart_csv(&country).into_response()
}

async fn spawn_chart_source(source: ChartSource) -> String {
    let app = Router::new()
        .route("/{country}/weekly/{range}/download", get(serve_chart))
        .with_state(source);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

// ─── Catalog stub ───────────────────────────────────────────────────

/// Track `tN` is by `Artist N` (id `aN`). Artist 4 has no genre tags.
#[derive(Default)]
struct CannedCatalog {
    calls: AtomicUsize,
}

#[async_trait]
impl GenreCatalog for CannedCatalog {
    async fn artists_for_tracks(&self, track_ids: &[String]) -> Result<BTreeMap<String, String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(track_ids
            .iter()
            .filter_map(|t| t.strip_prefix('t'))
            .map(|n| (format!("Artist {}", n), format!("a{}", n)))
            .collect())
    }

    async fn genres_for_artists(
        &self,
        artist_ids: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(artist_ids
            .iter()
            .filter_map(|a| a.strip_prefix('a'))
            .map(|n| {
                let tags = match n {
                    "1" | "2" => vec!["pop".to_string(), "dance pop".to_string()],
                    "3" => vec!["uk drill".to_string()],
                    "4" => Vec::new(),
                    _ => vec!["pop".to_string(), "indie".to_string()],
                };
                (format!("Artist {}", n), tags)
            })
            .collect())
    }
}

// ─── Bucket with a failing HEAD ─────────────────────────────────────

/// In-memory bucket whose HEAD on `fail_key` returns a 503 once armed.
struct FlakyHead {
    inner: Arc<MemoryStore>,
    fail_key: String,
    armed: AtomicBool,
}

#[async_trait]
impl ObjectStore for FlakyHead {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError> {
        if key == self.fail_key && self.armed.load(Ordering::SeqCst) {
            return Err(StoreError::Http {
                status: 503,
                message: "slow down".to_string(),
            });
        }
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), StoreError> {
        self.inner.put(key, body, metadata).await
    }
}

fn test_config(tmp: &TempDir, base_url: &str, countries: &[&str]) -> Config {
    let countries = countries
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ");
    let text = format!(
        r#"
[paths]
work_dir = "{}"

[charts]
base_url = "{}"
countries = [{}]
probe_country = "global"
probe_attempts = 2
probe_backoff_ms = 10
max_concurrent_requests = 4

[storage]
bucket = "assets"

[maintenance]
deploy_weeks = 3
"#,
        tmp.path().join("work").display(),
        base_url,
        countries
    );
    parse_config(&text).unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

/// Only weeks the source actually serves end up on disk.
#[tokio::test]
async fn test_fetch_writes_only_available_weeks() {
    let tmp = TempDir::new().unwrap();
    let mut missing = HashSet::new();
    missing.insert(("testland".to_string(), "2024-01-12".to_string()));
    let base = spawn_chart_source(ChartSource {
        missing: Arc::new(missing),
        ..ChartSource::default()
    })
    .await;
    let cfg = test_config(&tmp, &base, &["testland"]);

    let dir = tmp.path().join("charts");
    let fetcher = ChartFetcher::new(&cfg.charts, &dir).unwrap();
    let outcome = fetcher.download(d("2024-01-05"), d("2024-01-19")).await.unwrap();

    assert_eq!(
        outcome,
        FetchOutcome::Completed(FetchSummary {
            written: 1,
            existing: 0,
            failed: 1,
        })
    );
    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["testland-streams-2024-01-05.csv".to_string()]);

    // A second run keeps the file it already has.
    let again = fetcher.download(d("2024-01-05"), d("2024-01-19")).await.unwrap();
    assert_eq!(
        again,
        FetchOutcome::Completed(FetchSummary {
            written: 0,
            existing: 1,
            failed: 1,
        })
    );
}

#[tokio::test]
async fn test_fetch_reports_unavailable_when_probe_fails() {
    let tmp = TempDir::new().unwrap();
    let mut missing = HashSet::new();
    missing.insert(("global".to_string(), "2024-01-05".to_string()));
    let source = ChartSource {
        missing: Arc::new(missing),
        ..ChartSource::default()
    };
    let hits = source.hits.clone();
    let base = spawn_chart_source(source).await;
    let cfg = test_config(&tmp, &base, &["gb"]);

    let dir = tmp.path().join("charts");
    let fetcher = ChartFetcher::new(&cfg.charts, &dir).unwrap();
    let outcome = fetcher.download(d("2024-01-05"), d("2024-01-19")).await.unwrap();

    assert_eq!(outcome, FetchOutcome::Unavailable);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(!dir.exists());
}

/// Inside the cadence the run stops after reading the marker.
#[tokio::test]
async fn test_update_within_cadence_stops_early() {
    let tmp = TempDir::new().unwrap();
    let source = ChartSource::default();
    let hits = source.hits.clone();
    let base = spawn_chart_source(source).await;
    let cfg = test_config(&tmp, &base, &["gb"]);

    let store = Arc::new(MemoryStore::new());
    let mut meta = ObjectMetadata::new();
    meta.insert(LAST_DATA_DATE_META.to_string(), "2024-01-05".to_string());
    store.insert(&cfg.storage.dataset_key, b"stale".to_vec(), meta);
    let catalog = Arc::new(CannedCatalog::default());

    let maintainer = Maintainer::new(cfg, store.clone() as Arc<dyn ObjectStore>)
        .with_catalog(catalog.clone());
    let outcome = maintainer.run(Mode::Update, d("2024-01-08")).await;

    assert_eq!(
        outcome,
        MaintenanceOutcome::NoUpdateNeeded {
            last_data_date: d("2024-01-05")
        }
    );
    assert_eq!(store.request_count(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);
}

/// A cold deploy builds the dataset from scratch, then a later update
/// appends the next week.
#[tokio::test]
async fn test_deploy_then_update() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_chart_source(ChartSource::default()).await;
    let cfg = test_config(&tmp, &base, &["gb", "global"]);
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(CannedCatalog::default());
    let maintainer = Maintainer::new(cfg.clone(), store.clone() as Arc<dyn ObjectStore>)
        .with_catalog(catalog.clone());

    // Deploy.
    let today = d("2024-01-22");
    let outcome = maintainer.run(Mode::Deploy, today).await;
    let end = most_recent_friday(today);
    let expected_weeks: Vec<NaiveDate> = reporting_weeks(end - chrono::Duration::weeks(3), end)
        .map(|w| w.start)
        .collect();
    assert_eq!(
        expected_weeks,
        vec![d("2023-12-29"), d("2024-01-05"), d("2024-01-12")]
    );
    assert_eq!(
        outcome,
        MaintenanceOutcome::Deployed {
            last_data_date: d("2024-01-12"),
            rows: expected_weeks.len() * 2 * ROWS_PER_CHART,
        }
    );

    assert_eq!(
        store.keys(),
        vec![
            cfg.storage.dataset_key.clone(),
            cfg.storage.genre_many_key.clone(),
            cfg.storage.genre_primary_key.clone(),
        ]
        .into_iter()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
    );

    let (manifest, records) =
        decode_dataset(&store.body(&cfg.storage.dataset_key).unwrap()).unwrap();
    assert_eq!(manifest.last_data_date, Some(d("2024-01-12")));
    let dates: std::collections::BTreeSet<NaiveDate> = records.iter().map(|r| r.date).collect();
    assert_eq!(dates.into_iter().collect::<Vec<_>>(), expected_weeks);
    assert!(records.iter().all(|r| r.genre.is_some()));
    let genre_of = |artist: &str| {
        records
            .iter()
            .find(|r| r.artist == artist)
            .and_then(|r| r.genre.clone())
            .unwrap()
    };
    assert_eq!(genre_of("Artist 1"), "Pop");
    assert_eq!(genre_of("Artist 3"), "Uk Drill");
    assert_eq!(genre_of("Artist 4"), "Unknown");

    let marker = BucketObject::new(store.clone() as Arc<dyn ObjectStore>, &cfg.storage.dataset_key)
        .last_data_date()
        .await;
    assert_eq!(marker, Some(d("2024-01-12")));
    assert!(!cfg.paths.charts_dir().exists());
    assert!(!cfg.paths.dataset_path().exists());

    let primary: BTreeMap<String, String> =
        serde_json::from_slice(&store.body(&cfg.storage.genre_primary_key).unwrap()).unwrap();
    assert_eq!(primary.len(), ROWS_PER_CHART);
    let catalog_calls = catalog.calls.load(Ordering::SeqCst);
    assert_eq!(catalog_calls, 2);

    // Update a week later: one new week, every artist already known.
    let outcome = maintainer.run(Mode::Update, d("2024-01-29")).await;
    assert_eq!(
        outcome,
        MaintenanceOutcome::Updated {
            last_data_date: d("2024-01-19"),
            rows: (expected_weeks.len() + 1) * 2 * ROWS_PER_CHART,
        }
    );
    assert_eq!(catalog.calls.load(Ordering::SeqCst), catalog_calls);
    let (_, records) = decode_dataset(&store.body(&cfg.storage.dataset_key).unwrap()).unwrap();
    assert!(records.iter().any(|r| r.date == d("2024-01-19")));
    assert!(records.iter().all(|r| r.genre.is_some()));
    assert!(!cfg.paths.charts_dir().exists());
}

#[tokio::test]
async fn test_deploy_reports_unavailable_source() {
    let tmp = TempDir::new().unwrap();
    let mut missing = HashSet::new();
    missing.insert(("global".to_string(), "2023-12-29".to_string()));
    let base = spawn_chart_source(ChartSource {
        missing: Arc::new(missing),
        ..ChartSource::default()
    })
    .await;
    let cfg = test_config(&tmp, &base, &["gb"]);
    let store = Arc::new(MemoryStore::new());
    let maintainer = Maintainer::new(cfg, store.clone() as Arc<dyn ObjectStore>)
        .with_catalog(Arc::new(CannedCatalog::default()));

    let outcome = maintainer.run(Mode::Deploy, d("2024-01-22")).await;
    assert_eq!(outcome, MaintenanceOutcome::Unavailable);
    assert!(store.keys().is_empty());
}

/// A stalled week is abandoned on its own; the rest of the batch lands.
#[tokio::test]
async fn test_fetch_abandons_week_that_times_out() {
    let tmp = TempDir::new().unwrap();
    let mut slow = HashSet::new();
    slow.insert(("testland".to_string(), "2024-01-12".to_string()));
    let base = spawn_chart_source(ChartSource {
        slow: Arc::new(slow),
        ..ChartSource::default()
    })
    .await;
    let mut cfg = test_config(&tmp, &base, &["testland"]);
    cfg.charts.request_timeout_secs = 1;

    let dir = tmp.path().join("charts");
    let fetcher = ChartFetcher::new(&cfg.charts, &dir).unwrap();
    let outcome = fetcher.download(d("2024-01-05"), d("2024-01-26")).await.unwrap();

    assert_eq!(
        outcome,
        FetchOutcome::Completed(FetchSummary {
            written: 2,
            existing: 0,
            failed: 1,
        })
    );
    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "testland-streams-2024-01-05.csv".to_string(),
            "testland-streams-2024-01-19.csv".to_string(),
        ]
    );
}

/// A genre map that cannot be checked is not treated as missing: the run
/// fails and the remote maps and dataset stay as they were.
#[tokio::test]
async fn test_update_fails_when_genre_map_head_errors() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_chart_source(ChartSource::default()).await;
    let cfg = test_config(&tmp, &base, &["gb"]);
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(FlakyHead {
        inner: memory.clone(),
        fail_key: cfg.storage.genre_many_key.clone(),
        armed: AtomicBool::new(false),
    });
    let maintainer = Maintainer::new(cfg.clone(), store.clone() as Arc<dyn ObjectStore>)
        .with_catalog(Arc::new(CannedCatalog::default()));

    let outcome = maintainer.run(Mode::Deploy, d("2024-01-22")).await;
    assert!(outcome.published());

    let many_key = &cfg.storage.genre_many_key;
    let mut many: BTreeMap<String, Vec<String>> =
        serde_json::from_slice(&memory.body(many_key).unwrap()).unwrap();
    many.insert("Old Artist".to_string(), vec!["polka".to_string()]);
    let seeded = serde_json::to_vec_pretty(&many).unwrap();
    memory.insert(many_key, seeded.clone(), ObjectMetadata::new());
    let primary_before = memory.body(&cfg.storage.genre_primary_key).unwrap();
    let dataset_before = memory.body(&cfg.storage.dataset_key).unwrap();

    store.armed.store(true, Ordering::SeqCst);
    let outcome = maintainer.run(Mode::Update, d("2024-01-29")).await;

    match outcome {
        MaintenanceOutcome::Failed { reason } => assert!(reason.contains(many_key.as_str())),
        other => panic!("expected a failed run, got {:?}", other),
    }
    assert_eq!(memory.body(many_key).unwrap(), seeded);
    assert_eq!(
        memory.body(&cfg.storage.genre_primary_key).unwrap(),
        primary_before
    );
    assert_eq!(memory.body(&cfg.storage.dataset_key).unwrap(), dataset_before);
    let marker = BucketObject::new(memory.clone() as Arc<dyn ObjectStore>, &cfg.storage.dataset_key)
        .last_data_date()
        .await;
    assert_eq!(marker, Some(d("2024-01-12")));
}
