use crate::dataset::{DatasetClient, DatasetRecord};
use crate::errors::QueryRouterError;
use crate::identity::LoggedUser;
use std::sync::Arc;

/// Decides whether a caller may query a dataset.
///
/// The dataset record is fetched fresh for every check. Any failure to
/// obtain it denies access; there is no default-allow path.
#[derive(Clone)]
pub struct AuthorizationGate {
    datasets: Arc<dyn DatasetClient>,
}

impl AuthorizationGate {
    pub fn new(datasets: Arc<dyn DatasetClient>) -> Self {
        Self { datasets }
    }

    pub async fn authorize(
        &self,
        dataset_id: &str,
        user: Option<&LoggedUser>,
    ) -> Result<(), QueryRouterError> {
        let dataset = self.datasets.fetch(dataset_id).await.map_err(|e| {
            tracing::warn!(dataset_id, error = %e, "Failed to resolve dataset");
            QueryRouterError::DatasetUnresolved(e.to_string())
        })?;
        tracing::debug!(dataset_id, sandbox = dataset.sandbox, "Dataset resolved");

        decide(&dataset, user)
    }
}

/// The access policy over a resolved dataset:
///
/// | sandbox | identity | role     | outcome                        |
/// |---------|----------|----------|--------------------------------|
/// | true    | any      | any      | allow                          |
/// | false   | absent   |          | 403 authentication required    |
/// | false   | present  | USER     | 403 forbidden                  |
/// | false   | present  | not USER | allow                          |
pub fn decide(dataset: &DatasetRecord, user: Option<&LoggedUser>) -> Result<(), QueryRouterError> {
    if dataset.sandbox {
        return Ok(());
    }

    match user {
        None => Err(QueryRouterError::AuthenticationRequired),
        Some(user) if user.is_plain_user() => Err(QueryRouterError::Forbidden),
        Some(_) => Ok(()),
    }
}
