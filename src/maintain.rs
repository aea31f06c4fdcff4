//! Maintenance Orchestrator.
//!
//! Sequences fetch → parse → resolve → build → upload under one of three
//! modes:
//!
//! - **update**: read the remote freshness marker, stop early when the
//!   cadence has not elapsed, otherwise fetch the missing weeks and merge
//!   them into the downloaded history.
//! - **deploy**: cold start. Fetch the last `deploy_weeks` weeks and build
//!   everything from empty maps.
//! - **refresh**: download the dataset, re-apply invariants and retention,
//!   re-upload. No chart data is fetched.
//!
//! Expected negative results are [`MaintenanceOutcome`] values. Anything
//! unexpected inside a run becomes [`MaintenanceOutcome::Failed`] with the
//! error chain as its reason.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::asset::{self, build_dataset, max_date, refresh_dataset};
use crate::catalog::{GenreCatalog, SpotifyCatalog};
use crate::charts::{ChartFetcher, FetchOutcome};
use crate::config::Config;
use crate::dates::{most_recent_friday, reporting_weeks};
use crate::genres::{GenreMaps, GenreResolver};
use crate::models::ChartRecord;
use crate::parser::parse_chart_dir;
use crate::store::{BucketObject, ObjectStore};
use crate::store_s3::S3Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Update,
    Deploy,
    Refresh,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "update" => Ok(Mode::Update),
            "deploy" => Ok(Mode::Deploy),
            "refresh" => Ok(Mode::Refresh),
            other => bail!(
                "Unknown maintenance mode '{}'. Expected one of: update, deploy, refresh",
                other
            ),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Update => "update",
            Mode::Deploy => "deploy",
            Mode::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MaintenanceOutcome {
    Updated {
        last_data_date: NaiveDate,
        rows: usize,
    },
    Deployed {
        last_data_date: NaiveDate,
        rows: usize,
    },
    Refreshed {
        last_data_date: Option<NaiveDate>,
        rows: usize,
    },
    /// The cadence has not elapsed since the remote marker.
    NoUpdateNeeded { last_data_date: NaiveDate },
    /// The chart source has nothing for the requested range.
    Unavailable,
    Failed { reason: String },
}

impl MaintenanceOutcome {
    /// True when new artifacts were uploaded.
    pub fn published(&self) -> bool {
        matches!(
            self,
            MaintenanceOutcome::Updated { .. }
                | MaintenanceOutcome::Deployed { .. }
                | MaintenanceOutcome::Refreshed { .. }
        )
    }

    fn failed(reason: impl Into<String>) -> Self {
        MaintenanceOutcome::Failed {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MaintenanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceOutcome::Updated {
                last_data_date,
                rows,
            } => write!(f, "updated: {} rows through {}", rows, last_data_date),
            MaintenanceOutcome::Deployed {
                last_data_date,
                rows,
            } => write!(f, "deployed: {} rows through {}", rows, last_data_date),
            MaintenanceOutcome::Refreshed {
                last_data_date,
                rows,
            } => match last_data_date {
                Some(date) => write!(f, "refreshed: {} rows through {}", rows, date),
                None => write!(f, "refreshed: {} rows", rows),
            },
            MaintenanceOutcome::NoUpdateNeeded { last_data_date } => {
                write!(f, "no update needed (last data {})", last_data_date)
            }
            MaintenanceOutcome::Unavailable => f.write_str("chart data unavailable"),
            MaintenanceOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Remote freshness as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Freshness {
    pub last_data_date: Option<NaiveDate>,
    pub update_due: bool,
}

pub struct Maintainer {
    config: Config,
    store: Arc<dyn ObjectStore>,
    catalog: Option<Arc<dyn GenreCatalog>>,
}

impl Maintainer {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn GenreCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// S3 store plus the Spotify catalog when its credentials are present.
    pub fn from_config(config: Config) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(&config.storage));
        let catalog = match SpotifyCatalog::new(&config.catalog) {
            Ok(c) => Some(Arc::new(c) as Arc<dyn GenreCatalog>),
            Err(e) => {
                warn!(error = %e, "genre catalog disabled");
                None
            }
        };
        Self {
            config,
            store,
            catalog,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn dataset_object(&self) -> BucketObject {
        BucketObject::new(self.store.clone(), &self.config.storage.dataset_key)
    }

    fn genre_many_object(&self) -> BucketObject {
        BucketObject::new(self.store.clone(), &self.config.storage.genre_many_key)
    }

    fn genre_primary_object(&self) -> BucketObject {
        BucketObject::new(self.store.clone(), &self.config.storage.genre_primary_key)
    }

    /// Execute one maintenance run. `today` is injected so runs are
    /// reproducible.
    pub async fn run(&self, mode: Mode, today: NaiveDate) -> MaintenanceOutcome {
        info!(%mode, %today, "maintenance run started");
        let result = match mode {
            Mode::Update => self.update(today).await,
            Mode::Deploy => self.deploy(today).await,
            Mode::Refresh => self.refresh().await,
        };
        let outcome = result.unwrap_or_else(|e| MaintenanceOutcome::failed(format!("{:#}", e)));
        match &outcome {
            MaintenanceOutcome::Failed { reason } => {
                error!(%mode, %reason, "maintenance run failed")
            }
            other => info!(%mode, outcome = %other, "maintenance run finished"),
        }
        outcome
    }

    pub async fn freshness(&self, today: NaiveDate) -> Freshness {
        let last_data_date = self.dataset_object().last_data_date().await;
        let update_due = match last_data_date {
            Some(date) => (today - date).num_days() >= self.config.maintenance.cadence_days,
            None => true,
        };
        Freshness {
            last_data_date,
            update_due,
        }
    }

    /// Download a chart range into the scratch directory without building
    /// anything.
    pub async fn fetch(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        countries: Option<&[String]>,
    ) -> Result<FetchOutcome> {
        let fetcher = ChartFetcher::new(&self.config.charts, self.config.paths.charts_dir())?;
        match countries {
            Some(list) => fetcher.download_countries(list, start, end).await,
            None => fetcher.download(start, end).await,
        }
    }

    async fn update(&self, today: NaiveDate) -> Result<MaintenanceOutcome> {
        let dataset = self.dataset_object();
        let Some(last_data_date) = dataset.last_data_date().await else {
            return Ok(MaintenanceOutcome::failed(
                "remote dataset or its last-data-date marker is missing; run deploy first",
            ));
        };

        let elapsed = (today - last_data_date).num_days();
        if elapsed < self.config.maintenance.cadence_days {
            info!(%last_data_date, elapsed, "no update needed");
            return Ok(MaintenanceOutcome::NoUpdateNeeded { last_data_date });
        }

        let start = last_data_date + Duration::days(7);
        let end = most_recent_friday(today);
        if reporting_weeks(start, end).next().is_none() {
            info!(%last_data_date, %start, %end, "no complete reporting week since last data");
            return Ok(MaintenanceOutcome::NoUpdateNeeded { last_data_date });
        }

        if let FetchOutcome::Unavailable = self.fetch(start, end, None).await? {
            return Ok(MaintenanceOutcome::Unavailable);
        }

        let paths = &self.config.paths;
        if !dataset.download(&paths.dataset_path()).await {
            return Ok(MaintenanceOutcome::failed(
                "could not download the existing dataset",
            ));
        }
        for (object, path) in [
            (self.genre_many_object(), paths.genre_many_path()),
            (self.genre_primary_object(), paths.genre_primary_path()),
        ] {
            match object.head_status().await {
                Ok(true) => {
                    if !object.download(&path).await {
                        return Ok(MaintenanceOutcome::failed(format!(
                            "could not download {}",
                            object.key()
                        )));
                    }
                }
                Ok(false) => {
                    warn!(key = object.key(), "genre map missing remotely, starting empty");
                    remove_file(&path);
                }
                Err(e) => {
                    return Ok(MaintenanceOutcome::failed(format!(
                        "could not check {}: {}",
                        object.key(),
                        e
                    )));
                }
            }
        }

        let history = asset::read_dataset(&paths.dataset_path())?;
        let maps = asset::load_genre_maps(&paths.genre_many_path(), &paths.genre_primary_path())?;

        let (last_data_date, rows) = match self.build_and_publish(history, maps, start).await? {
            Ok(published) => published,
            Err(outcome) => return Ok(outcome),
        };
        self.clean_scratch();
        Ok(MaintenanceOutcome::Updated {
            last_data_date,
            rows,
        })
    }

    async fn deploy(&self, today: NaiveDate) -> Result<MaintenanceOutcome> {
        let end = most_recent_friday(today);
        let start = end - Duration::weeks(self.config.maintenance.deploy_weeks);

        if let FetchOutcome::Unavailable = self.fetch(start, end, None).await? {
            return Ok(MaintenanceOutcome::Unavailable);
        }

        let (last_data_date, rows) = match self
            .build_and_publish(Vec::new(), GenreMaps::default(), start)
            .await?
        {
            Ok(published) => published,
            Err(outcome) => return Ok(outcome),
        };
        self.clean_scratch();
        Ok(MaintenanceOutcome::Deployed {
            last_data_date,
            rows,
        })
    }

    /// Parse the scratch charts from `since`, resolve genres, merge with
    /// `history` and upload all three artifacts.
    ///
    /// The inner `Err` carries an expected failure outcome.
    async fn build_and_publish(
        &self,
        history: Vec<ChartRecord>,
        mut maps: GenreMaps,
        since: NaiveDate,
    ) -> Result<std::result::Result<(NaiveDate, usize), MaintenanceOutcome>> {
        let paths = &self.config.paths;
        let mut incoming = parse_chart_dir(&paths.charts_dir(), Some(since))?;
        if incoming.is_empty() {
            return Ok(Err(MaintenanceOutcome::failed(
                "no chart rows could be parsed from the downloaded files",
            )));
        }

        let catalog = self
            .catalog
            .clone()
            .ok_or_else(|| anyhow!("genre catalog credentials are not configured"))?;
        GenreResolver::new(catalog)
            .resolve(&mut incoming, &mut maps)
            .await?;

        let records = build_dataset(
            history,
            incoming,
            &maps.primary,
            self.config.maintenance.retention_days,
        );
        let Some(last_data_date) = max_date(&records) else {
            return Ok(Err(MaintenanceOutcome::failed("built dataset is empty")));
        };

        asset::write_dataset(&paths.dataset_path(), &records)?;
        asset::save_genre_maps(&maps, &paths.genre_many_path(), &paths.genre_primary_path())?;

        let uploads = [
            (self.dataset_object(), paths.dataset_path(), Some(last_data_date)),
            (self.genre_many_object(), paths.genre_many_path(), None),
            (self.genre_primary_object(), paths.genre_primary_path(), None),
        ];
        for (object, path, marker) in uploads {
            if !object.upload(&path, marker).await {
                return Ok(Err(MaintenanceOutcome::failed(format!(
                    "could not upload {}",
                    object.key()
                ))));
            }
        }

        Ok(Ok((last_data_date, records.len())))
    }

    async fn refresh(&self) -> Result<MaintenanceOutcome> {
        let dataset = self.dataset_object();
        let local = self.config.paths.dataset_path();
        if !dataset.download(&local).await {
            return Ok(MaintenanceOutcome::failed(
                "could not download the existing dataset",
            ));
        }

        let records = refresh_dataset(
            asset::read_dataset(&local)?,
            self.config.maintenance.retention_days,
        );
        let last_data_date = max_date(&records);
        asset::write_dataset(&local, &records)?;

        if !dataset.upload(&local, last_data_date).await {
            return Ok(MaintenanceOutcome::failed(
                "could not upload the refreshed dataset",
            ));
        }
        remove_file(&local);

        Ok(MaintenanceOutcome::Refreshed {
            last_data_date,
            rows: records.len(),
        })
    }

    fn clean_scratch(&self) {
        let paths = &self.config.paths;
        let charts = paths.charts_dir();
        if charts.exists() {
            if let Err(e) = std::fs::remove_dir_all(&charts) {
                warn!(path = %charts.display(), error = %e, "failed to remove chart scratch directory");
            }
        }
        for path in [
            paths.dataset_path(),
            paths.genre_many_path(),
            paths.genre_primary_path(),
        ] {
            remove_file(&path);
        }
    }
}

fn remove_file(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove scratch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::store::{MemoryStore, ObjectMetadata, LAST_DATA_DATE_META};
    use tempfile::TempDir;

    fn d(s: &str) -> NaiveDate {
        crate::dates::parse_iso_date(s).unwrap()
    }

    fn config(tmp: &TempDir) -> Config {
        let mut cfg = parse_config("[storage]\nbucket = \"assets\"\n").unwrap();
        cfg.paths.work_dir = tmp.path().to_path_buf();
        cfg
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("update".parse::<Mode>().unwrap(), Mode::Update);
        assert_eq!(" Deploy ".parse::<Mode>().unwrap(), Mode::Deploy);
        assert_eq!("refresh".parse::<Mode>().unwrap(), Mode::Refresh);
        let err = "rebuild".parse::<Mode>().unwrap_err();
        assert!(err.to_string().contains("rebuild"));
        assert_eq!(Mode::Refresh.to_string(), "refresh");
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(MaintenanceOutcome::NoUpdateNeeded {
            last_data_date: d("2024-01-05"),
        })
        .unwrap();
        assert_eq!(json["result"], "no_update_needed");
        assert_eq!(json["last_data_date"], "2024-01-05");
    }

    #[tokio::test]
    async fn test_update_without_remote_dataset_fails() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let maintainer = Maintainer::new(config(&tmp), store.clone());
        let outcome = maintainer.run(Mode::Update, d("2024-01-08")).await;
        assert!(matches!(outcome, MaintenanceOutcome::Failed { .. }));
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_reapplies_retention() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let record = |date: &str| ChartRecord {
            position: 1,
            track_name: "t".into(),
            artist: "a".into(),
            streams: 5,
            url: "https://open.spotify.com/track/t".into(),
            date: d(date),
            country: "gb".into(),
            genre: None,
        };
        let bytes = asset::encode_dataset(&[record("2022-01-07"), record("2024-01-05")]).unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert(&cfg.storage.dataset_key, bytes, ObjectMetadata::new());

        let maintainer = Maintainer::new(cfg.clone(), store.clone());
        let outcome = maintainer.run(Mode::Refresh, d("2024-01-08")).await;
        assert_eq!(
            outcome,
            MaintenanceOutcome::Refreshed {
                last_data_date: Some(d("2024-01-05")),
                rows: 1
            }
        );

        let freshness = maintainer.freshness(d("2024-01-08")).await;
        assert_eq!(freshness.last_data_date, Some(d("2024-01-05")));
        assert!(!freshness.update_due);

        let (_, rows) =
            asset::decode_dataset(&store.body(&cfg.storage.dataset_key).unwrap()).unwrap();
        assert_eq!(rows[0].country, "GB");
        assert!(!cfg.paths.dataset_path().exists());
    }

    #[tokio::test]
    async fn test_freshness_due_after_cadence() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let store = Arc::new(MemoryStore::new());
        let mut meta = ObjectMetadata::new();
        meta.insert(LAST_DATA_DATE_META.into(), "2024-01-05".into());
        store.insert(&cfg.storage.dataset_key, Vec::new(), meta);

        let maintainer = Maintainer::new(cfg, store);
        assert!(maintainer.freshness(d("2024-01-12")).await.update_due);
        assert!(!maintainer.freshness(d("2024-01-11")).await.update_due);
    }
}
