//! Object storage receiving frozen query results.

use crate::config::StorageConfig;
use async_trait::async_trait;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::object_access_controls::PredefinedObjectAcl;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("failed to write local artifact {path:?}: {source}")]
    LocalWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("object {0} already exists")]
    AlreadyExists(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("gcs error: {0}")]
    Gcs(#[from] google_cloud_storage::http::Error),
    #[error("gcs authentication failed: {0}")]
    Auth(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Destination of frozen artifacts.
///
/// Implementations are shared by all in-flight freeze operations and must be
/// safe to use concurrently.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Uploads the file at `local_path` as `key` and makes it publicly readable.
    /// Fails instead of replacing an object that already exists.
    async fn upload_public(&self, local_path: &Path, key: &str) -> Result<(), StorageError>;

    /// The URL under which `key` can be fetched without credentials.
    fn public_url(&self, key: &str) -> Result<Url, StorageError>;
}

pub async fn build_storage(config: &StorageConfig) -> Result<Arc<dyn ObjectStorage>, StorageError> {
    match config {
        StorageConfig::Gcs {
            bucket,
            public_base_url,
            endpoint,
        } => Ok(Arc::new(
            GcsStorage::new(bucket, public_base_url.clone(), endpoint.as_ref()).await?,
        )),
        StorageConfig::Filesystem {
            base_dir,
            public_base_url,
        } => Ok(Arc::new(FilesystemStorage::new(
            base_dir.clone(),
            public_base_url.clone(),
        ))),
    }
}

fn key_segments(key: &str) -> Result<Vec<&str>, StorageError> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments
        .iter()
        .any(|s| s.is_empty() || *s == "." || *s == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(segments)
}

fn join_url(base: &Url, segments: &[&str]) -> Result<Url, StorageError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| StorageError::InvalidKey(format!("cannot append to {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Google Cloud Storage bucket. Objects are created with the `publicRead`
/// predefined ACL and an `ifGenerationMatch=0` precondition.
pub struct GcsStorage {
    client: Client,
    bucket: String,
    public_base_url: Url,
}

impl GcsStorage {
    /// Credentials are discovered from the environment. When `endpoint` is set
    /// (e.g. an emulator) requests are sent there anonymously.
    pub async fn new(
        bucket: &str,
        public_base_url: Url,
        endpoint: Option<&Url>,
    ) -> Result<Self, StorageError> {
        let config = match endpoint {
            Some(endpoint) => ClientConfig {
                storage_endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
                ..Default::default()
            }
            .anonymous(),
            None => ClientConfig::default()
                .with_auth()
                .await
                .map_err(|e| StorageError::Auth(e.to_string()))?,
        };

        Ok(GcsStorage {
            client: Client::new(config),
            bucket: bucket.to_string(),
            public_base_url,
        })
    }
}

#[async_trait]
impl ObjectStorage for GcsStorage {
    async fn upload_public(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        key_segments(key)?;
        let data = fs::read(local_path).await?;

        let mut media = Media::new(key.to_string());
        media.content_type = "application/json".into();
        media.content_length = Some(data.len() as u64);

        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            if_generation_match: Some(0),
            predefined_acl: Some(PredefinedObjectAcl::PublicRead),
            ..Default::default()
        };

        match self
            .client
            .upload_object(&request, data, &UploadType::Simple(media))
            .await
        {
            Ok(object) => {
                tracing::debug!(bucket = %self.bucket, key, size = object.size, "Uploaded object");
                Ok(())
            }
            Err(google_cloud_storage::http::Error::Response(response)) if response.code == 412 => {
                Err(StorageError::AlreadyExists(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn public_url(&self, key: &str) -> Result<Url, StorageError> {
        let mut segments = vec![self.bucket.as_str()];
        segments.extend(key_segments(key)?);
        join_url(&self.public_base_url, &segments)
    }
}

/// Directory-backed storage, for development setups where another process
/// serves `base_dir` under `public_base_url`.
pub struct FilesystemStorage {
    base_dir: PathBuf,
    public_base_url: Url,
}

impl FilesystemStorage {
    pub fn new(base_dir: PathBuf, public_base_url: Url) -> Self {
        FilesystemStorage {
            base_dir,
            public_base_url,
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(key_segments(key)?
            .into_iter()
            .fold(self.base_dir.clone(), |path, segment| path.join(segment)))
    }
}

#[async_trait]
impl ObjectStorage for FilesystemStorage {
    async fn upload_public(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        let destination = self.object_path(key)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut source = fs::File::open(local_path).await?;
        let mut target = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let size = tokio::io::copy(&mut source, &mut target).await?;
        target.sync_all().await?;
        tracing::debug!(path = ?destination, size, "Stored object");
        Ok(())
    }

    fn public_url(&self, key: &str) -> Result<Url, StorageError> {
        join_url(&self.public_base_url, &key_segments(key)?)
    }
}
