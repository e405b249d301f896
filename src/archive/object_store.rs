//! Object Store Abstraction
//!
//! Boxed-future trait over the blob backend holding uploaded partitions,
//! media and export reports.
//!
//! Implementations:
//! - `InMemoryObjectStore`: for unit tests
//! - `LocalFsObjectStore`: for development and single-host deployments
//! - `S3ObjectStore`: for production (feature-gated, see `s3_store`)
//! - `SimulatedObjectStore`: latency/fault injection wrapper (see `simulated_store`)

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub content_type: Option<String>,
}

/// One page of a list operation
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<ObjectMeta>,
    /// Pass back to `list` to fetch the next page
    pub continuation_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    #[error("object store error: {0}")]
    Backend(String),
}

impl ObjectStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound(_))
    }
}

impl From<std::io::Error> for ObjectStoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => ObjectStoreError::NotFound(e.to_string()),
            ErrorKind::PermissionDenied => ObjectStoreError::PermissionDenied(e.to_string()),
            _ => ObjectStoreError::Io(e),
        }
    }
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ObjectStoreError>> + Send + 'a>>;

/// Object store abstraction trait
///
/// Dropping a returned future cancels the request.
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: Bytes, content_type: Option<&'a str>) -> StoreFuture<'a, ()>;

    /// Get an object's contents
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Bytes>;

    /// Check if an object exists
    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Delete an object; deleting a missing object succeeds
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// List objects with a prefix, one page at a time
    fn list<'a>(&'a self, prefix: &'a str, continuation_token: Option<&'a str>) -> StoreFuture<'a, ListResult>;

    /// Get object metadata without downloading content
    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta>;

    /// Base used to build fallback URLs, e.g. `s3://bucket`
    fn base_url(&self) -> String;
}

/// Reject keys that could escape a filesystem root or that no backend accepts.
pub fn validate_key(key: &str) -> Result<(), ObjectStoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(ObjectStoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

// ============================================================================
// InMemoryObjectStore - For tests
// ============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size_bytes: self.data.len() as u64,
            last_modified: self.last_modified,
            content_type: self.content_type.clone(),
        }
    }
}

/// In-memory object store. Clones share contents.
#[derive(Debug, Clone)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    page_size: usize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        InMemoryObjectStore {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            page_size: 1000,
        }
    }

    /// Limit list pages to `page_size` objects (to exercise pagination)
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: Bytes, content_type: Option<&'a str>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_key(key)?;
            let obj = StoredObject {
                data,
                content_type: content_type.map(str::to_string),
                last_modified: Utc::now(),
            };
            self.data.write().insert(key.to_string(), obj);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str, continuation_token: Option<&'a str>) -> StoreFuture<'a, ListResult> {
        Box::pin(async move {
            let data = self.data.read();
            let mut matching = data
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .filter(|(k, _)| continuation_token.map_or(true, |token| k.as_str() > token));

            let objects: Vec<ObjectMeta> = matching
                .by_ref()
                .take(self.page_size)
                .map(|(k, v)| v.meta(k))
                .collect();
            let continuation_token = match matching.next() {
                Some(_) => objects.last().map(|o| o.key.clone()),
                None => None,
            };
            Ok(ListResult {
                objects,
                continuation_token,
            })
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.meta(key))
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
        })
    }

    fn base_url(&self) -> String {
        "memory://archive".to_string()
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Suffix of in-progress writes; never listed
const PART_SUFFIX: &str = ".part";

/// Local filesystem object store
///
/// Objects are written to `<key>.part` and renamed into place, so an
/// interrupted put never leaves a partial object under its key.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectStore {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }

    fn meta_from(key: String, metadata: &std::fs::Metadata) -> ObjectMeta {
        ObjectMeta {
            key,
            size_bytes: metadata.len(),
            last_modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            content_type: None,
        }
    }
}

fn walk_dir(dir: &Path, base: &Path, prefix: &str, objects: &mut Vec<ObjectMeta>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(&path, base, prefix, objects)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let key = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        if key.ends_with(PART_SUFFIX) || !key.starts_with(prefix) {
            continue;
        }
        let metadata = entry.metadata()?;
        objects.push(LocalFsObjectStore::meta_from(key, &metadata));
    }
    Ok(())
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: Bytes, _content_type: Option<&'a str>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut part = path.as_os_str().to_owned();
            part.push(PART_SUFFIX);
            let part = PathBuf::from(part);
            tokio::fs::write(&part, &data).await?;
            tokio::fs::rename(&part, &path).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(ObjectStoreError::NotFound(key.to_string())),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str, _continuation_token: Option<&'a str>) -> StoreFuture<'a, ListResult> {
        Box::pin(async move {
            // Start from the deepest directory fully named by the prefix
            let dir_part = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            let search_dir = if dir_part.is_empty() {
                self.base_path.clone()
            } else {
                self.full_path(dir_part)?
            };

            let base = self.base_path.clone();
            let prefix = prefix.to_string();
            let mut objects = tokio::task::spawn_blocking(move || {
                let mut objects = Vec::new();
                walk_dir(&search_dir, &base, &prefix, &mut objects).map(|_| objects)
            })
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("list task failed: {}", e)))??;

            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(ListResult {
                objects,
                continuation_token: None,
            })
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(Self::meta_from(key.to_string(), &meta)),
                Ok(_) => Err(ObjectStoreError::NotFound(key.to_string())),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(ObjectStoreError::NotFound(key.to_string())),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn base_url(&self) -> String {
        format!("file://{}", self.base_path.display())
    }
}
