//! Music-catalog API client used for genre enrichment.
//!
//! Two lookups are needed: track ids → the artists on those tracks, and
//! artist ids → their genre tags. Both endpoints accept at most 50
//! comma-joined ids per call, so ids are sent in sequential batches.
//!
//! # Authentication
//!
//! A bearer token is obtained with the OAuth2 client-credentials grant.
//! The token's lifetime is tracked and it is refreshed before a batch when
//! it is within `token_refresh_margin_secs` of expiring. A token response
//! that cannot be understood is an error that aborts the caller.
//!
//! # Retries
//!
//! Each batch is attempted up to `max_retries` times with a fixed delay.
//! A batch that never succeeds is dropped with a warning; the remaining
//! batches still run.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;

/// Lookups the genre resolver needs from a music catalog.
#[async_trait]
pub trait GenreCatalog: Send + Sync {
    /// Map each track id to the artists performing on it.
    ///
    /// Returns artist name → artist id.
    async fn artists_for_tracks(&self, track_ids: &[String]) -> Result<BTreeMap<String, String>>;

    /// Map artist ids to their genre tags.
    ///
    /// Returns artist name → genre tags (possibly empty).
    async fn genres_for_artists(
        &self,
        artist_ids: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct BearerToken {
    value: String,
    expires_at: Instant,
}

impl BearerToken {
    fn is_fresh(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TracksResponse {
    tracks: Vec<Option<TrackObject>>,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    #[serde(default)]
    artists: Vec<ArtistRef>,
}

#[derive(Debug, Deserialize)]
struct ArtistRef {
    name: String,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArtistsResponse {
    artists: Vec<Option<ArtistObject>>,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    name: String,
    #[serde(default)]
    genres: Vec<String>,
}

/// Catalog client for the Spotify Web API.
pub struct SpotifyCatalog {
    client: reqwest::Client,
    config: CatalogConfig,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<BearerToken>>,
}

impl SpotifyCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .ok_or_else(|| anyhow!("catalog.client_id is not configured"))?;
        let client_secret = config
            .client_secret
            .clone()
            .ok_or_else(|| anyhow!("catalog.client_secret is not configured"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build catalog HTTP client")?;

        Ok(Self {
            client,
            config: config.clone(),
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    /// Return a usable bearer token, exchanging credentials if the cached
    /// one is missing or about to expire.
    async fn bearer(&self) -> Result<String> {
        let margin = Duration::from_secs(self.config.token_refresh_margin_secs);
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.is_fresh(margin) {
                return Ok(token.value.clone());
            }
            debug!("catalog token near expiry, refreshing");
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn request_token(&self) -> Result<BearerToken> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let resp = self
            .client
            .post(&self.config.auth_url)
            .form(&form)
            .send()
            .await
            .context("Catalog token request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "Catalog token request rejected (HTTP {}): {}",
                status,
                body.chars().take(200).collect::<String>()
            );
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .context("Malformed catalog token response")?;
        if parsed.access_token.is_empty() {
            bail!("Malformed catalog token response: empty access_token");
        }

        info!(expires_in = parsed.expires_in, "obtained catalog access token");
        Ok(BearerToken {
            value: parsed.access_token,
            expires_at: Instant::now() + Duration::from_secs(parsed.expires_in),
        })
    }

    /// GET `{api_base}/{endpoint}?ids=..` for every batch of ids, yielding
    /// the decoded bodies of the batches that succeeded.
    async fn get_batched<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        ids: &[String],
    ) -> Result<Vec<T>> {
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), endpoint);
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let batches: Vec<&[String]> = ids.chunks(self.config.batch_size).collect();
        let mut results = Vec::with_capacity(batches.len());

        for (index, batch) in batches.iter().enumerate() {
            let joined = batch.join(",");
            let mut decoded: Option<T> = None;

            for attempt in 1..=self.config.max_retries {
                let token = self.bearer().await?;
                let resp = self
                    .client
                    .get(&url)
                    .bearer_auth(&token)
                    .query(&[("ids", joined.as_str())])
                    .send()
                    .await;

                match resp {
                    Ok(r) if r.status().is_success() => match r.json::<T>().await {
                        Ok(body) => {
                            decoded = Some(body);
                            break;
                        }
                        Err(e) => {
                            warn!(endpoint, batch = index, attempt, error = %e, "undecodable catalog response");
                        }
                    },
                    Ok(r) => {
                        warn!(endpoint, batch = index, attempt, status = %r.status(), "catalog request failed");
                    }
                    Err(e) => {
                        warn!(endpoint, batch = index, attempt, error = %e, "catalog request failed");
                    }
                }

                if attempt < self.config.max_retries {
                    tokio::time::sleep(delay).await;
                }
            }

            match decoded {
                Some(body) => results.push(body),
                None => warn!(
                    endpoint,
                    batch = index,
                    ids = batch.len(),
                    "dropping catalog batch after retries"
                ),
            }
        }

        Ok(results)
    }
}

#[async_trait]
impl GenreCatalog for SpotifyCatalog {
    async fn artists_for_tracks(&self, track_ids: &[String]) -> Result<BTreeMap<String, String>> {
        let mut artists = BTreeMap::new();
        for page in self.get_batched::<TracksResponse>("tracks", track_ids).await? {
            for track in page.tracks.into_iter().flatten() {
                for artist in track.artists {
                    if let Some(id) = artist.id {
                        artists.insert(artist.name, id);
                    }
                }
            }
        }
        Ok(artists)
    }

    async fn genres_for_artists(
        &self,
        artist_ids: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let mut genres = BTreeMap::new();
        for page in self
            .get_batched::<ArtistsResponse>("artists", artist_ids)
            .await?
        {
            for artist in page.artists.into_iter().flatten() {
                genres.insert(artist.name, artist.genres);
            }
        }
        Ok(genres)
    }
}
