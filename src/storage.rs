use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> StorageResult<()>;

    async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Succeeds when the object is already gone.
    async fn delete_object(&self, key: &str) -> StorageResult<()>;

    async fn list_objects(&self) -> StorageResult<Vec<StoredObject>>;

    /// Removes empty key prefixes left behind by deletes. Returns how many
    /// were removed; flat object stores have nothing to prune.
    async fn prune_empty_prefixes(&self) -> StorageResult<usize> {
        Ok(0)
    }
}

/// Owns storage path generation on top of a raw object backend.
#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn ObjectStorage>,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn ObjectStorage>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStorage> {
        &self.backend
    }

    pub async fn write(
        &self,
        owner_id: Uuid,
        original_filename: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> StorageResult<String> {
        let storage_path = storage_path_for(owner_id, original_filename);
        self.backend
            .put_object(&storage_path, bytes, content_type.map(str::to_string))
            .await?;
        Ok(storage_path)
    }

    pub async fn read(&self, storage_path: &str) -> StorageResult<Vec<u8>> {
        self.backend.get_object(storage_path).await
    }

    pub async fn delete(&self, storage_path: &str) -> StorageResult<()> {
        self.backend.delete_object(storage_path).await
    }
}

/// `{owner_id}/{random}{.ext}`; only the extension of the original name survives.
pub fn storage_path_for(owner_id: Uuid, original_filename: &str) -> String {
    let suffix = file_extension(original_filename)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    format!("{owner_id}/{}{suffix}", Uuid::new_v4().simple())
}

/// Lowercased text after the final dot of the last path segment.
pub fn file_extension(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.trim();
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if escapes || key.is_empty() {
            return Err(StorageError::Backend(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: Option<String>,
    ) -> StorageResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let size = bytes.len();
        fs::write(&path, bytes).await?;
        debug!(key, bytes = size, "wrote blob");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_objects(&self) -> StorageResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        if !fs::try_exists(&self.root).await? {
            return Ok(objects);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                let path = entry.path();
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                objects.push(StoredObject {
                    key,
                    last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
        Ok(objects)
    }

    async fn prune_empty_prefixes(&self) -> StorageResult<usize> {
        if !fs::try_exists(&self.root).await? {
            return Ok(0);
        }

        // Children are visited before their parents so nested empty
        // directories collapse in one pass. The root itself is kept.
        let mut directories = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    let path = entry.path();
                    directories.push(path.clone());
                    pending.push(path);
                }
            }
        }

        let mut removed = 0;
        for dir in directories.iter().rev() {
            let mut entries = fs::read_dir(dir).await?;
            if entries.next_entry().await?.is_some() {
                continue;
            }
            match fs::remove_dir(dir).await {
                Ok(()) => {
                    debug!(path = %dir.display(), "removed empty directory");
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn backend_error<E: std::error::Error>(action: &str, err: E) -> StorageError {
    StorageError::Backend(format!("{action}: {}", DisplayErrorContext(err)))
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        request
            .send()
            .await
            .map_err(|err| backend_error("failed to upload object to S3", err))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                return Err(backend_error("failed to download object from S3", err));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| backend_error("failed to read object stream", err))?
            .into_bytes()
            .to_vec();
        Ok(bytes)
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| backend_error("failed to delete object from S3", err))?;
        Ok(())
    }

    async fn list_objects(&self) -> StorageResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|err| backend_error("failed to list S3 objects", err))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let last_modified = object
                    .last_modified()
                    .and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()));
                objects.push(StoredObject {
                    key: key.to_string(),
                    last_modified,
                });
            }

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            continuation = response.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }
        Ok(objects)
    }
}
