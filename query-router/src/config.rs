use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Listener and admin listener must not share an address")]
    ListenerConflict,

    #[error("Path prefix must be empty or start with '/' and not end with '/': {0}")]
    InvalidPathPrefix(String),

    #[error("Empty bucket name")]
    EmptyBucket,

    #[error("Key prefix must not be empty or start or end with '/': {0}")]
    InvalidKeyPrefix(String),

    #[error("Timeout for {0} cannot be 0")]
    InvalidTimeout(&'static str),
}

/// Query router configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for incoming query requests
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// Prefix in front of the `/query` and `/download` paths, e.g. `/api/v1`
    #[serde(default)]
    pub path_prefix: String,
    /// The query adapter that executes the SQL
    pub adapter: AdapterConfig,
    /// The service owning dataset records
    pub dataset_service: DatasetServiceConfig,
    pub freeze: FreezeConfig,
}

impl Config {
    /// Validates the query router configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.listener == self.admin_listener {
            return Err(ValidationError::ListenerConflict);
        }

        if !self.path_prefix.is_empty()
            && (!self.path_prefix.starts_with('/') || self.path_prefix.ends_with('/'))
        {
            return Err(ValidationError::InvalidPathPrefix(self.path_prefix.clone()));
        }

        if self.dataset_service.timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout("dataset_service"));
        }

        self.freeze.validate()
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AdapterConfig {
    /// Base URL of the query adapter
    pub url: Url,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DatasetServiceConfig {
    /// Base URL; records are fetched from `{url}/dataset/{id}`
    pub url: Url,
    /// Bearer token sent with every lookup
    pub token: Option<String>,
    #[serde(default = "default_dataset_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_dataset_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FreezeConfig {
    /// Where artifacts are written before upload
    #[serde(default = "std::env::temp_dir")]
    pub tmp_dir: PathBuf,
    /// Namespace of the uploaded objects inside the bucket
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Bound on fetching the full result from the adapter
    #[serde(default = "default_freeze_timeout_secs")]
    pub timeout_secs: u64,
    pub storage: StorageConfig,
}

fn default_key_prefix() -> String {
    "freeze".into()
}

fn default_freeze_timeout_secs() -> u64 {
    60
}

impl FreezeConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key_prefix.is_empty()
            || self.key_prefix.starts_with('/')
            || self.key_prefix.ends_with('/')
        {
            return Err(ValidationError::InvalidKeyPrefix(self.key_prefix.clone()));
        }

        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout("freeze"));
        }

        if let StorageConfig::Gcs { bucket, .. } = &self.storage
            && bucket.is_empty()
        {
            return Err(ValidationError::EmptyBucket);
        }

        Ok(())
    }
}

/// Object storage receiving frozen artifacts
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StorageConfig {
    Gcs {
        bucket: String,
        #[serde(default = "default_gcs_public_base_url")]
        public_base_url: Url,
        /// Overrides the storage API endpoint, e.g. for an emulator
        endpoint: Option<Url>,
    },
    Filesystem {
        base_dir: PathBuf,
        public_base_url: Url,
    },
}

fn default_gcs_public_base_url() -> Url {
    Url::parse("https://storage.googleapis.com").expect("static URL is valid")
}
