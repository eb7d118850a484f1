//! Blob storage for order attachments and chat media.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// Errors from the blob storage provider.
#[derive(Debug, Error)]
pub enum BlobError {
    /// No object is stored at the path.
    #[error("no object at {0}")]
    NotFound(String),

    /// Path or content rejected by the provider.
    #[error("upload rejected: {0}")]
    Rejected(String),

    /// The provider could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// The hosted file store.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` at `path`, replacing any existing object.
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobError>;

    /// A download URL for the object at `path`.
    async fn download_url(&self, path: &str) -> Result<Url, BlobError>;
}

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-process blob storage serving URLs under a fixed base.
pub struct MemoryBlobStorage {
    base: Url,
    objects: Mutex<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStorage {
    /// Storage whose download URLs are `{bucket_url}/{path}`.
    #[must_use]
    pub fn new(base: Url) -> Self {
        Self {
            base,
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Storage for a named bucket, served from `https://storage.invalid/{bucket}/`.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if the bucket name is not a valid URL segment.
    pub fn for_bucket(bucket: &str) -> Result<Self, BlobError> {
        let base = Url::parse("https://storage.invalid/")
            .and_then(|root| root.join(&format!("{bucket}/")))
            .map_err(|e| BlobError::Rejected(format!("bucket {bucket}: {e}")))?;
        Ok(Self::new(base))
    }

    /// The object stored at `path`, if any.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<StoredBlob> {
        self.objects.lock().ok()?.get(path).cloned()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().map_or(0, |objects| objects.len())
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobError> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|segment| segment == "..") {
            return Err(BlobError::Rejected(format!("invalid path {path:?}")));
        }
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| BlobError::Unavailable("object table poisoned".to_string()))?;
        objects.insert(
            path.to_string(),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn download_url(&self, path: &str) -> Result<Url, BlobError> {
        let exists = self
            .objects
            .lock()
            .map_err(|_| BlobError::Unavailable("object table poisoned".to_string()))?
            .contains_key(path);
        if !exists {
            return Err(BlobError::NotFound(path.to_string()));
        }
        self.base
            .join(path)
            .map_err(|e| BlobError::Rejected(format!("{path}: {e}")))
    }
}
