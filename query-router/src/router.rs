use crate::auth::AuthorizationGate;
use crate::config::Config;
use crate::dataset::DatasetClient;
use crate::errors::QueryRouterError;
use crate::freeze::FreezePipeline;
use crate::http::build_upstream_client;
use crate::metrics_defs::{AUTHORIZATION_DENIED, REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::relay::{HandlerBody, Relay};
use crate::request::{Operation, QueryRequest};
use crate::storage::ObjectStorage;
use crate::target::QueryTarget;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::make_text_response;
use shared::{counter, gauge, histogram};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// Routes `POST {prefix}/query` and `POST {prefix}/download` through the
/// authorization gate to either the streaming relay or the freeze pipeline.
pub struct Router {
    path_prefix: String,
    adapter_url: Url,
    gate: AuthorizationGate,
    relay: Relay,
    freeze: FreezePipeline,
}

impl Router {
    pub fn new(
        config: &Config,
        datasets: Arc<dyn DatasetClient>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        let client = build_upstream_client();
        Self {
            path_prefix: config.path_prefix.clone(),
            adapter_url: config.adapter.url.clone(),
            gate: AuthorizationGate::new(datasets),
            relay: Relay::new(client.clone()),
            freeze: FreezePipeline::new(client, storage, &config.freeze),
        }
    }

    /// Handles one inbound request. Failures are turned into responses here,
    /// so the returned response is always the one sent to the caller.
    pub async fn route<B>(&self, req: Request<B>) -> Response<HandlerBody>
    where
        B: Body + Send + 'static,
        B::Error: Display,
    {
        let operation = match Operation::from_path(req.uri().path(), &self.path_prefix) {
            Some(operation) if *req.method() == Method::POST => operation,
            _ => {
                tracing::warn!(
                    method = %req.method(),
                    path = %req.uri().path(),
                    "No route matched"
                );
                return error_response(QueryRouterError::NoRouteMatched);
            }
        };

        let start = Instant::now();
        let inflight = InflightGuard::new();
        let response = match self.handle(operation, req).await {
            Ok(response) => response,
            Err(e) => {
                log_failure(operation, &e);
                error_response(e)
            }
        };
        drop(inflight);

        // Relayed bodies are still streaming at this point
        histogram!(
            REQUEST_DURATION,
            "operation" => operation.as_str(),
            "status" => response.status().as_str().to_string()
        )
        .record(start.elapsed().as_secs_f64());

        response
    }

    async fn handle<B>(
        &self,
        operation: Operation,
        req: Request<B>,
    ) -> Result<Response<HandlerBody>, QueryRouterError>
    where
        B: Body + Send + 'static,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| QueryRouterError::RequestBodyError(e.to_string()))?
            .to_bytes();

        let request = QueryRequest::parse(operation, parts, body)?;
        let user = request.logged_user()?;
        let freeze = request.freeze();

        // Freezing publishes data under this service's name; it is never
        // done for anonymous callers, whatever the dataset.
        if freeze && user.is_none() {
            return Err(QueryRouterError::NotAuthenticated);
        }

        let target = QueryTarget::derive(&request, &self.adapter_url)?;
        self.gate.authorize(&target.dataset_id, user.as_ref()).await?;

        tracing::debug!(
            %operation,
            dataset_id = %target.dataset_id,
            freeze,
            "Request authorized"
        );

        if freeze {
            let url = self.freeze.freeze(&target).await?;
            return url_response(&url);
        }

        self.relay.relay(&target).await
    }
}

/// Counts a request as in flight until dropped, so a request whose future is
/// cancelled by a disconnecting caller is released too.
struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        InflightGuard
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
    }
}

fn log_failure(operation: Operation, error: &QueryRouterError) {
    if error.is_authorization_denied() {
        counter!(AUTHORIZATION_DENIED, "reason" => error.denial_reason()).increment(1);
        tracing::info!(%operation, error = %error, "Request denied");
    } else if error.status_code().is_server_error() {
        tracing::error!(%operation, error = %error, "Request failed");
    } else {
        tracing::warn!(%operation, error = %error, "Request rejected");
    }
}

fn error_response(error: QueryRouterError) -> Response<HandlerBody> {
    make_text_response(error.status_code(), error.public_message())
}

fn url_response(url: &Url) -> Result<Response<HandlerBody>, QueryRouterError> {
    let body = serde_json::json!({ "url": url.as_str() }).to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .map_err(|e| QueryRouterError::InternalError(format!("Failed to build response: {e}")))
}
