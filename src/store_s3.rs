//! S3 implementation of [`ObjectStore`].
//!
//! Talks to the S3 REST API directly with AWS Signature V4 signing over
//! `hmac` + `sha2`. A custom `endpoint_url` (MinIO, LocalStack) is
//! addressed path-style and keeps its own scheme; otherwise requests go to
//! `https://<bucket>.s3.<region>.amazonaws.com`.
//!
//! Credentials come from [`StorageConfig`], which [`crate::config::load_config`]
//! fills from `AWS_ACCESS_KEY_ID` (or `AWS_ACCESS_KEY`),
//! `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`. Missing credentials
//! surface as [`StoreError::Credentials`] on the first request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::Method;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::store::{ObjectHead, ObjectMetadata, ObjectStore};

type HmacSha256 = Hmac<Sha256>;

const META_PREFIX: &str = "x-amz-meta-";

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

pub struct S3Store {
    config: StorageConfig,
    client: reqwest::Client,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            config: config.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn credentials(&self) -> Result<AwsCredentials, StoreError> {
        let access_key_id = self
            .config
            .access_key_id
            .clone()
            .ok_or_else(|| StoreError::Credentials("AWS access key id is not set".to_string()))?;
        let secret_access_key = self.config.secret_access_key.clone().ok_or_else(|| {
            StoreError::Credentials("AWS secret access key is not set".to_string())
        })?;
        Ok(AwsCredentials {
            access_key_id,
            secret_access_key,
            session_token: self.config.session_token.clone(),
        })
    }

    /// Sign and send one object request.
    async fn send(
        &self,
        method: Method,
        key: &str,
        body: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<reqwest::Response, StoreError> {
        let creds = self.credentials()?;
        let target = object_target(&self.config, key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (name, value) in metadata {
            headers.push((
                format!("{}{}", META_PREFIX, name.to_lowercase()),
                value.trim().to_string(),
            ));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let authorization = authorization_header(
            &creds,
            &self.config.region,
            method.as_str(),
            &target.canonical_uri,
            &headers,
            &payload_hash,
            &date_stamp,
            &amz_date,
        );

        let mut req = self
            .client
            .request(method.clone(), &target.url)
            .header("Authorization", authorization);
        for (name, value) in &headers {
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        if method == Method::PUT {
            req = req.body(body);
        }

        debug!(method = %method, url = %target.url, "s3 request");
        let resp = req.send().await?;

        let status = resp.status().as_u16();
        match status {
            200..=299 => Ok(resp),
            404 => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            401 | 403 => Err(StoreError::Credentials(format!(
                "request for s3://{}/{} was rejected (HTTP {})",
                self.config.bucket, key, status
            ))),
            _ => {
                let text = resp.text().await.unwrap_or_default();
                Err(StoreError::Http {
                    status,
                    message: text.chars().take(500).collect(),
                })
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError> {
        let resp = self
            .send(Method::HEAD, key, Vec::new(), &ObjectMetadata::new())
            .await?;
        Ok(head_from_headers(resp.headers()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self
            .send(Method::GET, key, Vec::new(), &ObjectMetadata::new())
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), StoreError> {
        self.send(Method::PUT, key, body, &metadata).await?;
        Ok(())
    }
}

fn head_from_headers(headers: &HeaderMap) -> ObjectHead {
    let mut metadata = ObjectMetadata::new();
    for (name, value) in headers {
        if let Some(meta) = name.as_str().strip_prefix(META_PREFIX) {
            if let Ok(v) = value.to_str() {
                metadata.insert(meta.to_string(), v.to_string());
            }
        }
    }
    let last_modified = headers
        .get("last-modified")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let size = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    ObjectHead {
        metadata,
        last_modified,
        size,
    }
}

// ============ Addressing ============

#[derive(Debug, PartialEq, Eq)]
struct ObjectTarget {
    url: String,
    host: String,
    canonical_uri: String,
}

fn object_target(config: &StorageConfig, key: &str) -> ObjectTarget {
    let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
    match config.endpoint_url {
        Some(ref endpoint) => {
            let (scheme, rest) = match endpoint.split_once("://") {
                Some((scheme, rest)) => (scheme, rest),
                None => ("https", endpoint.as_str()),
            };
            let host = rest.trim_end_matches('/').to_string();
            let canonical_uri = format!("/{}/{}", uri_encode(&config.bucket), encoded_key);
            ObjectTarget {
                url: format!("{}://{}{}", scheme, host, canonical_uri),
                host,
                canonical_uri,
            }
        }
        None => {
            let host = format!("{}.s3.{}.amazonaws.com", config.bucket, config.region);
            let canonical_uri = format!("/{}", encoded_key);
            ObjectTarget {
                url: format!("https://{}{}", host, canonical_uri),
                host,
                canonical_uri,
            }
        }
    }
}

// ============ AWS SigV4 Helpers ============

#[allow(clippy::too_many_arguments)]
fn authorization_header(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    canonical_uri: &str,
    sorted_headers: &[(String, String)],
    payload_hash: &str,
    date_stamp: &str,
    amz_date: &str,
) -> String {
    let signed_headers: String = sorted_headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = sorted_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
