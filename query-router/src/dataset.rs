//! Client for the dataset-metadata service.

use crate::config::DatasetServiceConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("dataset {0} not found")]
    NotFound(String),
    #[error("dataset service responded with {0}")]
    UnexpectedStatus(StatusCode),
    #[error("dataset service request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid dataset id: {0}")]
    InvalidId(String),
}

/// The fields of a dataset record this service makes decisions on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetRecord {
    pub id: String,
    pub sandbox: bool,
}

/// Source of dataset records. Records are looked up on every request and never cached.
#[async_trait]
pub trait DatasetClient: Send + Sync {
    async fn fetch(&self, dataset_id: &str) -> Result<DatasetRecord, DatasetError>;
}

// JSON:API document as returned by `GET /dataset/{id}`
#[derive(Deserialize)]
struct DatasetDocument {
    data: DatasetResource,
}

#[derive(Deserialize)]
struct DatasetResource {
    id: String,
    #[serde(default)]
    attributes: DatasetAttributes,
}

#[derive(Deserialize, Default)]
struct DatasetAttributes {
    #[serde(default)]
    sandbox: bool,
}

impl From<DatasetDocument> for DatasetRecord {
    fn from(document: DatasetDocument) -> Self {
        DatasetRecord {
            id: document.data.id,
            sandbox: document.data.attributes.sandbox,
        }
    }
}

/// Looks dataset records up over HTTP.
#[derive(Clone)]
pub struct HttpDatasetClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpDatasetClient {
    pub fn new(config: &DatasetServiceConfig) -> Result<Self, DatasetError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(HttpDatasetClient {
            client,
            base_url: config.url.clone(),
            token: config.token.clone(),
        })
    }

    fn record_url(&self, dataset_id: &str) -> Result<Url, DatasetError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DatasetError::InvalidId(dataset_id.to_string()))?
            .pop_if_empty()
            .extend(["dataset", dataset_id]);
        Ok(url)
    }
}

#[async_trait]
impl DatasetClient for HttpDatasetClient {
    async fn fetch(&self, dataset_id: &str) -> Result<DatasetRecord, DatasetError> {
        let url = self.record_url(dataset_id)?;

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => Ok(response.json::<DatasetDocument>().await?.into()),
            StatusCode::NOT_FOUND => Err(DatasetError::NotFound(dataset_id.to_string())),
            status => Err(DatasetError::UnexpectedStatus(status)),
        }
    }
}
