//! Freeze: run a query to completion and publish its result as a static object.

use crate::config::FreezeConfig;
use crate::errors::QueryRouterError;
use crate::http::{UpstreamClient, fetch_from_upstream};
use crate::metrics_defs::{FREEZE_CLEANUP_FAILED, FREEZE_DURATION};
use crate::storage::{ObjectStorage, StorageError};
use crate::target::QueryTarget;
use hyper::body::Bytes;
use shared::{counter, histogram};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::fs;
use url::Url;
use uuid::Uuid;

pub struct FreezePipeline {
    client: UpstreamClient,
    storage: Arc<dyn ObjectStorage>,
    tmp_dir: PathBuf,
    key_prefix: String,
    timeout_secs: u64,
}

impl FreezePipeline {
    pub fn new(client: UpstreamClient, storage: Arc<dyn ObjectStorage>, config: &FreezeConfig) -> Self {
        FreezePipeline {
            client,
            storage,
            tmp_dir: config.tmp_dir.clone(),
            key_prefix: config.key_prefix.clone(),
            timeout_secs: config.timeout_secs,
        }
    }

    /// Fetches the complete result of `target`, uploads it under a fresh key
    /// and returns the public URL of the uploaded object.
    ///
    /// The temporary file is removed on every path, including cancellation.
    pub async fn freeze(&self, target: &QueryTarget) -> Result<Url, QueryRouterError> {
        let start = Instant::now();
        let result = self.run(target).await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        histogram!(FREEZE_DURATION, "outcome" => outcome).record(start.elapsed().as_secs_f64());

        result
    }

    async fn run(&self, target: &QueryTarget) -> Result<Url, QueryRouterError> {
        let response = fetch_from_upstream(&self.client, target, self.timeout_secs).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(QueryRouterError::UpstreamStatus {
                status,
                message: String::from_utf8_lossy(response.body()).into_owned(),
            });
        }

        let artifact = FreezeArtifact::new(&self.tmp_dir);
        let key = format!("{}/{}", self.key_prefix, artifact.name);
        let result = self.publish(&artifact, response.body(), &key).await;
        artifact.remove().await;

        if let Ok(url) = &result {
            tracing::info!(dataset_id = %target.dataset_id, key, %url, "Froze query result");
        }
        result
    }

    async fn publish(
        &self,
        artifact: &FreezeArtifact,
        data: &Bytes,
        key: &str,
    ) -> Result<Url, QueryRouterError> {
        fs::write(&artifact.path, data)
            .await
            .map_err(|source| StorageError::LocalWrite {
                path: artifact.path.clone(),
                source,
            })?;

        self.storage.upload_public(&artifact.path, key).await?;
        Ok(self.storage.public_url(key)?)
    }
}

/// A temporary result file owned by one freeze operation.
///
/// `remove` is the normal way out. If the owning future is dropped before
/// that, `Drop` deletes the file synchronously.
struct FreezeArtifact {
    name: String,
    path: PathBuf,
    removed: bool,
}

impl FreezeArtifact {
    fn new(tmp_dir: &Path) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let name = format!("{millis}-{}.json", Uuid::new_v4().simple());

        FreezeArtifact {
            path: tmp_dir.join(&name),
            name,
            removed: false,
        }
    }

    async fn remove(mut self) {
        self.removed = true;
        let result = fs::remove_file(&self.path).await;
        report_cleanup(&self.path, result);
    }
}

impl Drop for FreezeArtifact {
    fn drop(&mut self) {
        if !self.removed {
            report_cleanup(&self.path, std::fs::remove_file(&self.path));
        }
    }
}

fn report_cleanup(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => {}
        // Nothing was written
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Failed to remove freeze artifact");
            counter!(FREEZE_CLEANUP_FAILED).increment(1);
        }
    }
}
