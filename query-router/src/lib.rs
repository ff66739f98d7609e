pub mod auth;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod freeze;
pub mod http;
pub mod identity;
pub mod metrics_defs;
pub mod relay;
pub mod request;
pub mod router;
pub mod storage;
pub mod target;

#[cfg(test)]
mod testutils;

use crate::config::Config;
use crate::dataset::HttpDatasetClient;
use crate::errors::QueryRouterError;
use crate::relay::HandlerBody;
use crate::router::Router;
use crate::storage::build_storage;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Serves the query and download routes and the admin probes until one of
/// the listeners fails.
pub async fn run(config: Config) -> Result<(), QueryRouterError> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.freeze.tmp_dir).await?;

    let ready = Arc::new(AtomicBool::new(false));
    let ready_probe = ready.clone();
    let admin_service = AdminService::<_, QueryRouterError>::new(move || {
        ready_probe.load(Ordering::Relaxed)
    });
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    let datasets = HttpDatasetClient::new(&config.dataset_service)
        .map_err(|e| QueryRouterError::InternalError(format!("dataset client: {e}")))?;
    let storage = build_storage(&config.freeze.storage).await?;

    let router_service = QueryRouterService {
        router: Arc::new(Router::new(&config, Arc::new(datasets), storage)),
    };
    let router_task = run_http_service(&config.listener.host, config.listener.port, router_service);

    ready.store(true, Ordering::Relaxed);
    tracing::info!(adapter = %config.adapter.url, "Query router ready");

    tokio::try_join!(router_task, admin_task)?;
    Ok(())
}

struct QueryRouterService {
    router: Arc<Router>,
}

impl Service<Request<Incoming>> for QueryRouterService {
    type Response = Response<HandlerBody>;
    type Error = QueryRouterError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let router = self.router.clone();
        Box::pin(async move { Ok(router.route(req).await) })
    }
}
