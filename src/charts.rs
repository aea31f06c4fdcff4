//! Chart Fetcher.
//!
//! Downloads weekly top-100 chart files for a set of countries over a date
//! range. The whole range is first probed with a single request for the
//! aggregate country; if the probe never succeeds the range is reported
//! unavailable and nothing is fetched.
//!
//! Files land in the target directory as `{country}-streams-{start}.csv`.
//! A failed download leaves no file behind, which is the only retry signal
//! for the next run.
//!
//! # Concurrency
//!
//! Requests run as tokio tasks gated by a [`Semaphore`]. Each request has
//! its own timeout; a timeout or error only affects that one week.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ChartsConfig;
use crate::dates::{format_iso_date, most_recent_friday, reporting_weeks, ReportingWeek};

/// Countries the public charts site publishes weekly charts for.
/// `global` is the aggregate across all of them.
pub const COUNTRY_CODES: &[&str] = &[
    "global", "us", "gb", "ar", "at", "au", "bg", "bo", "br", "ca", "ch", "cl", "co", "cr", "cy",
    "cz", "de", "dk", "do", "ec", "ee", "es", "fi", "fr", "gr", "gt", "hk", "hn", "hu", "id",
    "ie", "il", "in", "is", "it", "jp", "lt", "lu", "lv", "mx", "my", "ni", "nl", "no", "nz",
    "pa", "pe", "ph", "pl", "pt", "py", "ro", "ru", "se", "sg", "sk", "sv", "th", "tr", "tw",
    "ua", "uy", "vn", "za", "be",
];

/// Marker between country and date in chart file names.
pub const FILE_INFIX: &str = "-streams-";

pub fn chart_file_name(country: &str, week_start: NaiveDate) -> String {
    format!("{}{}{}.csv", country, FILE_INFIX, format_iso_date(week_start))
}

/// Result of a bulk download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The probe request never succeeded; nothing was fetched.
    Unavailable,
    Completed(FetchSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Files written by this call.
    pub written: usize,
    /// Files already present from an earlier run.
    pub existing: usize,
    /// Weeks with no usable response.
    pub failed: usize,
}

enum FetchResult {
    Written,
    Existing,
    Failed,
}

pub struct ChartFetcher {
    client: reqwest::Client,
    config: ChartsConfig,
    target_dir: PathBuf,
}

impl ChartFetcher {
    pub fn new(config: &ChartsConfig, target_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build chart HTTP client")?;

        Ok(Self {
            client,
            config: config.clone(),
            target_dir: target_dir.into(),
        })
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Download URL for one country and week.
    pub fn chart_url(&self, country: &str, week: ReportingWeek) -> String {
        format!(
            "{}/{}/weekly/{}--{}/download",
            self.config.base_url.trim_end_matches('/'),
            country,
            format_iso_date(week.start),
            format_iso_date(week.end)
        )
    }

    /// Probe the aggregate chart for the week starting at `start`.
    ///
    /// Retries with a fixed short backoff and returns `false` once the
    /// attempts are used up.
    pub async fn is_available(&self, start: NaiveDate) -> bool {
        let week = ReportingWeek::starting(most_recent_friday(start));
        let url = self.chart_url(&self.config.probe_country, week);
        let backoff = Duration::from_millis(self.config.probe_backoff_ms);

        for attempt in 1..=self.config.probe_attempts {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => {
                    debug!(%url, status = %resp.status(), attempt, "chart probe rejected");
                }
                Err(e) => {
                    debug!(%url, error = %e, attempt, "chart probe failed");
                }
            }
            if attempt < self.config.probe_attempts {
                tokio::time::sleep(backoff).await;
            }
        }
        false
    }

    /// Download every configured country for every week in `[start, end]`.
    pub async fn download(&self, start: NaiveDate, end: NaiveDate) -> Result<FetchOutcome> {
        self.download_countries(&self.config.countries, start, end)
            .await
    }

    pub async fn download_countries(
        &self,
        countries: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchOutcome> {
        if !self.is_available(start).await {
            warn!(
                base_url = %self.config.base_url,
                start = %start,
                "chart data unavailable"
            );
            return Ok(FetchOutcome::Unavailable);
        }

        tokio::fs::create_dir_all(&self.target_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create chart directory: {}",
                    self.target_dir.display()
                )
            })?;

        let weeks: Vec<ReportingWeek> = reporting_weeks(start, end).collect();
        info!(
            base_url = %self.config.base_url,
            start = %start,
            end = %end,
            weeks = weeks.len(),
            countries = countries.len(),
            "downloading chart data"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_requests));
        let mut tasks = JoinSet::new();

        for country in countries {
            for week in &weeks {
                let permit = semaphore.clone().acquire_owned().await?;
                let client = self.client.clone();
                let url = self.chart_url(country, *week);
                let path = self.target_dir.join(chart_file_name(country, week.start));
                let min_bytes = self.config.min_body_bytes;

                tasks.spawn(async move {
                    let result = fetch_one(&client, &url, &path, min_bytes).await;
                    drop(permit);
                    result
                });
            }
        }

        let mut summary = FetchSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(FetchResult::Written) => summary.written += 1,
                Ok(FetchResult::Existing) => summary.existing += 1,
                Ok(FetchResult::Failed) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "chart download task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            written = summary.written,
            existing = summary.existing,
            failed = summary.failed,
            "chart download complete"
        );
        Ok(FetchOutcome::Completed(summary))
    }
}

async fn fetch_one(client: &reqwest::Client, url: &str, path: &Path, min_bytes: u64) -> FetchResult {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.len() > min_bytes {
            return FetchResult::Existing;
        }
    }

    let resp = match client.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            debug!(%url, error = %e, "chart request failed");
            return FetchResult::Failed;
        }
    };

    if resp.status() != reqwest::StatusCode::OK {
        debug!(%url, status = %resp.status(), "no chart for week");
        return FetchResult::Failed;
    }

    let body = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            debug!(%url, error = %e, "chart body read failed");
            return FetchResult::Failed;
        }
    };

    if (body.len() as u64) <= min_bytes {
        debug!(%url, bytes = body.len(), "chart body too small");
        return FetchResult::Failed;
    }

    match tokio::fs::write(path, &body).await {
        Ok(()) => FetchResult::Written,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to write chart file");
            FetchResult::Failed
        }
    }
}
