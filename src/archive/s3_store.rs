//! S3 Object Store Implementation
//!
//! Production backend built on the `object_store` crate. Works against AWS
//! S3 and S3-compatible services (MinIO, LocalStack) through a custom
//! endpoint.
//!
//! Credentials come from the standard `AWS_*` environment variables.

use crate::archive::config::StoreConfig;
use crate::archive::object_store::{validate_key, ListResult, ObjectMeta, ObjectStore, ObjectStoreError, StoreFuture};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore as ObjectStoreTrait, PutOptions, PutPayload};
use std::sync::Arc;

const PAGE_SIZE: usize = 1000;

/// Connection settings for [`S3ObjectStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Key prefix inside the bucket, without trailing slash
    pub prefix: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
}

impl S3Config {
    /// Extract S3 settings from a store config; `None` for other backends
    pub fn from_store_config(store: &StoreConfig) -> Option<Self> {
        match store {
            StoreConfig::S3 {
                bucket,
                prefix,
                region,
                endpoint,
            } => Some(S3Config {
                bucket: bucket.clone(),
                region: region.clone(),
                prefix: prefix.trim_matches('/').to_string(),
                endpoint: endpoint.clone(),
            }),
            StoreConfig::InMemory | StoreConfig::LocalFs { .. } => None,
        }
    }
}

/// S3 object store for production deployments
#[derive(Clone)]
pub struct S3ObjectStore {
    store: Arc<dyn ObjectStoreTrait>,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self, ObjectStoreError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|e| ObjectStoreError::Backend(format!("failed to create S3 store: {}", e)))?;

        Ok(S3ObjectStore {
            store: Arc::new(store),
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    /// Wrap an existing `object_store` backend (for tests)
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, bucket: &str, prefix: &str) -> Self {
        S3ObjectStore {
            store,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        ObjectPath::from(self.full_key(key))
    }

    fn strip_prefix(&self, path: &ObjectPath) -> String {
        let path_str = path.to_string();
        if self.prefix.is_empty() {
            return path_str;
        }
        let prefix_with_slash = format!("{}/", self.prefix);
        path_str
            .strip_prefix(&prefix_with_slash)
            .unwrap_or(&path_str)
            .to_string()
    }

    fn to_meta(&self, meta: object_store::ObjectMeta) -> ObjectMeta {
        ObjectMeta {
            key: self.strip_prefix(&meta.location),
            size_bytes: meta.size as u64,
            last_modified: meta.last_modified,
            content_type: None,
        }
    }

    fn map_error(err: object_store::Error) -> ObjectStoreError {
        match err {
            object_store::Error::NotFound { path, .. } => ObjectStoreError::NotFound(path),
            other => ObjectStoreError::Backend(other.to_string()),
        }
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStore for S3ObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: Bytes, content_type: Option<&'a str>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_key(key)?;
            let mut attributes = Attributes::new();
            if let Some(content_type) = content_type {
                attributes.insert(Attribute::ContentType, content_type.to_string().into());
            }
            let options = PutOptions {
                attributes,
                ..Default::default()
            };
            self.store
                .put_opts(&self.full_path(key), PutPayload::from(data), options)
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            let result = self.store.get(&self.full_path(key)).await.map_err(Self::map_error)?;
            result.bytes().await.map_err(Self::map_error)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            match self.store.head(&self.full_path(key)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match self.store.delete(&self.full_path(key)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str, continuation_token: Option<&'a str>) -> StoreFuture<'a, ListResult> {
        Box::pin(async move {
            // object_store lists by whole path segments; narrow to the string
            // prefix afterwards
            let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            let dir_path = if dir.is_empty() && self.prefix.is_empty() {
                None
            } else {
                Some(ObjectPath::from(self.full_key(dir).trim_end_matches('/').to_string()))
            };

            let stream = match continuation_token {
                Some(token) => self
                    .store
                    .list_with_offset(dir_path.as_ref(), &self.full_path(token)),
                None => self.store.list(dir_path.as_ref()),
            };
            let metas: Vec<object_store::ObjectMeta> = stream
                .try_filter(|meta| {
                    let key = self.strip_prefix(&meta.location);
                    futures::future::ready(key.starts_with(prefix))
                })
                .take(PAGE_SIZE + 1)
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut objects: Vec<ObjectMeta> = metas.into_iter().map(|m| self.to_meta(m)).collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            let continuation_token = if objects.len() > PAGE_SIZE {
                objects.truncate(PAGE_SIZE);
                objects.last().map(|o| o.key.clone())
            } else {
                None
            };
            Ok(ListResult {
                objects,
                continuation_token,
            })
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let meta = self.store.head(&self.full_path(key)).await.map_err(Self::map_error)?;
            Ok(self.to_meta(meta))
        })
    }

    fn base_url(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }
}
