//! Object Store Gateway.
//!
//! [`ObjectStore`] is the raw bucket interface (implemented over S3 in
//! [`crate::store_s3`] and in memory by [`MemoryStore`]). [`BucketObject`]
//! wraps one key and turns every failure into a logged boolean so the
//! maintenance job can decide what to do without matching on transport
//! errors.
//!
//! The dataset's freshness marker travels as object metadata under
//! [`LAST_DATA_DATE_META`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{error, info, warn};

use crate::dates::{format_iso_date, parse_iso_date};
use crate::error::StoreError;

/// Metadata key (without the `x-amz-meta-` prefix) carrying the newest
/// week present in an uploaded dataset.
pub const LAST_DATA_DATE_META: &str = "last-data-date";

pub type ObjectMetadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    pub metadata: ObjectMetadata,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket name, for log lines.
    fn bucket(&self) -> &str;

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn put(&self, key: &str, body: Vec<u8>, metadata: ObjectMetadata)
        -> Result<(), StoreError>;
}

/// One named object in the bucket.
#[derive(Clone)]
pub struct BucketObject {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl BucketObject {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn log_failure(&self, action: &str, err: &StoreError) {
        let bucket = self.store.bucket();
        match err {
            StoreError::NotFound { .. } => {
                warn!(bucket, key = %self.key, action, "object does not exist")
            }
            StoreError::LocalFileMissing(path) => {
                error!(bucket, key = %self.key, path = %path.display(), action, "local file not found")
            }
            StoreError::Credentials(msg) => {
                error!(bucket, key = %self.key, action, reason = %msg, "storage credentials unavailable")
            }
            other => error!(bucket, key = %self.key, action, error = %other, "storage request failed"),
        }
    }

    pub async fn exists(&self) -> bool {
        self.head_status().await.unwrap_or(false)
    }

    /// `Ok(false)` only when the bucket reports the key as absent; any
    /// other failure is logged and returned so callers can tell "missing"
    /// apart from "could not ask".
    pub async fn head_status(&self) -> Result<bool, StoreError> {
        match self.store.head(&self.key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => {
                self.log_failure("head", &e);
                Err(e)
            }
        }
    }

    /// Upload the file at `path`, tagging it with `last_data_date` when
    /// given.
    pub async fn upload(&self, path: &Path, last_data_date: Option<NaiveDate>) -> bool {
        match self.try_upload(path, last_data_date).await {
            Ok(bytes) => {
                info!(bucket = self.store.bucket(), key = %self.key, bytes, "uploaded object");
                true
            }
            Err(e) => {
                self.log_failure("upload", &e);
                false
            }
        }
    }

    async fn try_upload(
        &self,
        path: &Path,
        last_data_date: Option<NaiveDate>,
    ) -> Result<usize, StoreError> {
        if !path.is_file() {
            return Err(StoreError::LocalFileMissing(path.to_path_buf()));
        }
        let body = tokio::fs::read(path).await?;
        let len = body.len();
        let mut metadata = ObjectMetadata::new();
        if let Some(date) = last_data_date {
            metadata.insert(LAST_DATA_DATE_META.to_string(), format_iso_date(date));
        }
        self.store.put(&self.key, body, metadata).await?;
        Ok(len)
    }

    /// Download the object into `path`, creating parent directories.
    pub async fn download(&self, path: &Path) -> bool {
        match self.try_download(path).await {
            Ok(bytes) => {
                info!(bucket = self.store.bucket(), key = %self.key, bytes, "downloaded object");
                true
            }
            Err(e) => {
                self.log_failure("download", &e);
                false
            }
        }
    }

    async fn try_download(&self, path: &Path) -> Result<usize, StoreError> {
        let body = self.store.get(&self.key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &body).await?;
        Ok(body.len())
    }

    /// The freshness marker stored with the object, if both the object and
    /// a well-formed marker exist.
    pub async fn last_data_date(&self) -> Option<NaiveDate> {
        let head = match self.store.head(&self.key).await {
            Ok(head) => head,
            Err(e) => {
                self.log_failure("read marker", &e);
                return None;
            }
        };
        let raw = head.metadata.get(LAST_DATA_DATE_META)?;
        match parse_iso_date(raw) {
            Ok(date) => Some(date),
            Err(_) => {
                warn!(key = %self.key, value = %raw, "malformed last-data-date marker");
                None
            }
        }
    }
}

struct StoredObject {
    body: Vec<u8>,
    metadata: ObjectMetadata,
    last_modified: DateTime<Utc>,
}

/// In-memory bucket for tests and dry runs. Counts every request it
/// serves.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    requests: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, body: Vec<u8>, metadata: ObjectMetadata) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(
                key.to_string(),
                StoredObject {
                    body,
                    metadata,
                    last_modified: Utc::now(),
                },
            );
        }
    }

    /// Number of head/get/put calls served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn body(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().ok()?.get(key).map(|o| o.body.clone())
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    fn poisoned() -> StoreError {
        StoreError::Http {
            status: 500,
            message: "memory store lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        "memory"
    }

    async fn head(&self, key: &str) -> Result<ObjectHead, StoreError> {
        self.count();
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        let obj = objects.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok(ObjectHead {
            metadata: obj.metadata.clone(),
            last_modified: Some(obj.last_modified),
            size: obj.body.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.count();
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), StoreError> {
        self.count();
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                metadata,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn object(store: &Arc<MemoryStore>, key: &str) -> BucketObject {
        BucketObject::new(store.clone() as Arc<dyn ObjectStore>, key)
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.bin");
        std::fs::write(&src, b"payload").unwrap();

        let store = Arc::new(MemoryStore::new());
        let obj = object(&store, "dataset.zip");
        assert!(!obj.exists().await);

        let date = parse_iso_date("2024-01-05").unwrap();
        assert!(obj.upload(&src, Some(date)).await);
        assert!(obj.exists().await);
        assert_eq!(obj.last_data_date().await, Some(date));

        let dst = tmp.path().join("nested/b.bin");
        assert!(obj.download(&dst).await);
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_head_status_distinguishes_missing() {
        let store = Arc::new(MemoryStore::new());
        let obj = object(&store, "genres.json");
        assert!(!obj.head_status().await.unwrap());
        store.insert("genres.json", b"{}".to_vec(), ObjectMetadata::new());
        assert!(obj.head_status().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_upload() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let obj = object(&store, "k");
        assert!(!obj.upload(&tmp.path().join("absent"), None).await);
        assert_eq!(store.request_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_object_fails_download() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let obj = object(&store, "k");
        assert!(!obj.download(&tmp.path().join("out")).await);
        assert!(!tmp.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_marker_absent_or_malformed() {
        let store = Arc::new(MemoryStore::new());
        store.insert("plain", b"x".to_vec(), ObjectMetadata::new());
        let mut bad = ObjectMetadata::new();
        bad.insert(LAST_DATA_DATE_META.to_string(), "last friday".to_string());
        store.insert("bad", b"x".to_vec(), bad);

        assert_eq!(object(&store, "plain").last_data_date().await, None);
        assert_eq!(object(&store, "bad").last_data_date().await, None);
        assert_eq!(object(&store, "missing").last_data_date().await, None);
    }
}
