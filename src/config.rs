//! TOML configuration for the soundboard maintenance job and trigger server.
//!
//! Every component receives the pieces of [`Config`] it needs at
//! construction time. Credentials that are not written in the file are
//! resolved from the environment once, inside [`load_config`], so nothing
//! downstream performs its own environment lookups.
//!
//! ```toml
//! [paths]
//! work_dir = "./data"
//!
//! [charts]
//! max_concurrent_requests = 16
//!
//! [catalog]
//! # client_id / client_secret fall back to SPOTIFY_CLIENT_ID / SPOTIFY_CLIENT_SECRET
//!
//! [storage]
//! bucket = "spotify-soundboard-assets"
//! region = "eu-west-2"
//!
//! [server]
//! bind = "0.0.0.0:8080"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::charts::COUNTRY_CODES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub charts: ChartsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl PathsConfig {
    /// Directory holding the raw `{country}-streams-{date}.csv` downloads.
    pub fn charts_dir(&self) -> PathBuf {
        self.work_dir.join("charts")
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.work_dir.join("chart-dataset.zip")
    }

    pub fn genre_many_path(&self) -> PathBuf {
        self.work_dir.join("artist-genre-many.json")
    }

    pub fn genre_primary_path(&self) -> PathBuf {
        self.work_dir.join("artist-genre-primary.json")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChartsConfig {
    #[serde(default = "default_charts_base_url")]
    pub base_url: String,
    #[serde(default = "default_countries")]
    pub countries: Vec<String>,
    #[serde(default = "default_probe_country")]
    pub probe_country: String,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_backoff_ms")]
    pub probe_backoff_ms: u64,
    #[serde(default = "default_min_body_bytes")]
    pub min_body_bytes: u64,
}

impl Default for ChartsConfig {
    fn default() -> Self {
        Self {
            base_url: default_charts_base_url(),
            countries: default_countries(),
            probe_country: default_probe_country(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_secs: default_request_timeout_secs(),
            probe_attempts: default_probe_attempts(),
            probe_backoff_ms: default_probe_backoff_ms(),
            min_body_bytes: default_min_body_bytes(),
        }
    }
}

fn default_charts_base_url() -> String {
    "https://spotifycharts.com/regional".to_string()
}
fn default_countries() -> Vec<String> {
    COUNTRY_CODES.iter().map(|c| c.to_string()).collect()
}
fn default_probe_country() -> String {
    "global".to_string()
}
fn default_max_concurrent_requests() -> usize {
    16
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_probe_attempts() -> u32 {
    5
}
fn default_probe_backoff_ms() -> u64 {
    200
}
fn default_min_body_bytes() -> u64 {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_catalog_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_catalog_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_catalog_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            api_base: default_api_base(),
            client_id: None,
            client_secret: None,
            batch_size: default_catalog_batch_size(),
            max_retries: default_catalog_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_catalog_timeout_secs(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
        }
    }
}

fn default_auth_url() -> String {
    "https://accounts.spotify.com/api/token".to_string()
}
fn default_api_base() -> String {
    "https://api.spotify.com/v1".to_string()
}
fn default_catalog_batch_size() -> usize {
    50
}
fn default_catalog_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_catalog_timeout_secs() -> u64 {
    30
}
fn default_token_refresh_margin_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    /// Requests against it are path-style.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_dataset_key")]
    pub dataset_key: String,
    #[serde(default = "default_genre_many_key")]
    pub genre_many_key: String,
    #[serde(default = "default_genre_primary_key")]
    pub genre_primary_key: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_dataset_key() -> String {
    "chart-dataset.zip".to_string()
}
fn default_genre_many_key() -> String {
    "artist-genre-many.json".to_string()
}
fn default_genre_primary_key() -> String {
    "artist-genre-primary.json".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    #[serde(default = "default_cadence_days")]
    pub cadence_days: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_deploy_weeks")]
    pub deploy_weeks: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cadence_days: default_cadence_days(),
            retention_days: default_retention_days(),
            deploy_weeks: default_deploy_weeks(),
        }
    }
}

fn default_cadence_days() -> i64 {
    7
}
fn default_retention_days() -> i64 {
    364
}
fn default_deploy_weeks() -> i64 {
    53
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_view_cache_ttl_secs")]
    pub view_cache_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            view_cache_ttl_secs: default_view_cache_ttl_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_view_cache_ttl_secs() -> u64 {
    1800
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.resolve_credentials_from_env();
    Ok(config)
}

/// Parse and validate configuration text without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Ten years; also keeps date arithmetic far from chrono's range limits.
const MAX_RETENTION_DAYS: i64 = 3660;
const MAX_DEPLOY_WEEKS: i64 = 520;

fn validate(config: &Config) -> Result<()> {
    if config.storage.bucket.trim().is_empty() {
        bail!("storage.bucket must not be empty");
    }

    let charts = &config.charts;
    if charts.countries.is_empty() {
        bail!("charts.countries must list at least one country code");
    }
    if !(1..=256).contains(&charts.max_concurrent_requests) {
        bail!("charts.max_concurrent_requests must be in [1, 256]");
    }
    if charts.probe_attempts == 0 {
        bail!("charts.probe_attempts must be >= 1");
    }
    if charts.request_timeout_secs == 0 {
        bail!("charts.request_timeout_secs must be > 0");
    }

    // The catalog API rejects more than 50 ids per call.
    if !(1..=50).contains(&config.catalog.batch_size) {
        bail!("catalog.batch_size must be in [1, 50]");
    }
    if config.catalog.max_retries == 0 {
        bail!("catalog.max_retries must be >= 1");
    }

    let maintenance = &config.maintenance;
    if maintenance.cadence_days < 1 {
        bail!("maintenance.cadence_days must be >= 1");
    }
    if !(0..=MAX_RETENTION_DAYS).contains(&maintenance.retention_days) {
        bail!(
            "maintenance.retention_days must be in [0, {}]",
            MAX_RETENTION_DAYS
        );
    }
    if !(1..=MAX_DEPLOY_WEEKS).contains(&maintenance.deploy_weeks) {
        bail!("maintenance.deploy_weeks must be in [1, {}]", MAX_DEPLOY_WEEKS);
    }

    Ok(())
}

impl Config {
    /// Fill credentials that were left out of the file from the process
    /// environment. Values present in the file always win.
    pub fn resolve_credentials_from_env(&mut self) {
        fn env(names: &[&str]) -> Option<String> {
            names
                .iter()
                .find_map(|n| std::env::var(n).ok().filter(|v| !v.is_empty()))
        }

        let storage = &mut self.storage;
        if storage.access_key_id.is_none() {
            storage.access_key_id = env(&["AWS_ACCESS_KEY_ID", "AWS_ACCESS_KEY"]);
        }
        if storage.secret_access_key.is_none() {
            storage.secret_access_key = env(&["AWS_SECRET_ACCESS_KEY"]);
        }
        if storage.session_token.is_none() {
            storage.session_token = env(&["AWS_SESSION_TOKEN"]);
        }

        let catalog = &mut self.catalog;
        if catalog.client_id.is_none() {
            catalog.client_id = env(&["SPOTIFY_CLIENT_ID"]);
        }
        if catalog.client_secret.is_none() {
            catalog.client_secret = env(&["SPOTIFY_CLIENT_SECRET"]);
        }
    }
}
