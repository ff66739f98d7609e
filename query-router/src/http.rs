use crate::errors::QueryRouterError;
use crate::target::QueryTarget;
use http_body_util::{BodyExt, Full};
use hyper::Response;
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::http::filter_hop_by_hop;
use std::time::Duration;
use tokio::time::timeout;

/// Client used for every request to the query adapter
pub type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

pub fn build_upstream_client() -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Issues `target` and returns the response as soon as its head arrives.
///
/// Connection failures are reported as `UpstreamRequestFailed`; the body is
/// left untouched for the caller to consume.
pub async fn open_upstream(
    client: &UpstreamClient,
    target: &QueryTarget,
) -> Result<Response<Incoming>, QueryRouterError> {
    client.request(target.to_request()?).await.map_err(|e| {
        QueryRouterError::UpstreamRequestFailed(
            target.upstream_identifier().to_string(),
            e.to_string(),
        )
    })
}

/// Issues `target` and collects the complete response body.
///
/// The timeout covers the whole cycle: connecting, sending, receiving the
/// head and collecting the body. Not suitable for results of unbounded size.
pub async fn fetch_from_upstream(
    client: &UpstreamClient,
    target: &QueryTarget,
    timeout_secs: u64,
) -> Result<Response<Bytes>, QueryRouterError> {
    let upstream_identifier = target.upstream_identifier();

    let exchange = async {
        let response = open_upstream(client, target).await?;
        let (mut parts, body) = response.into_parts();
        filter_hop_by_hop(&mut parts.headers, parts.version);

        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| QueryRouterError::ResponseBodyError(e.to_string()))?;

        Ok::<_, QueryRouterError>(Response::from_parts(parts, body_bytes))
    };

    timeout(Duration::from_secs(timeout_secs), exchange)
        .await
        // tokio::time::timeout returns Err if duration elapsed
        .map_err(|_| QueryRouterError::UpstreamTimeout(upstream_identifier.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Operation, QueryRequest};
    use crate::testutils::{MockResponse, start_mock_server};
    use hyper::Request;
    use url::Url;

    fn target_for(adapter: &Url) -> QueryTarget {
        let (parts, _) = Request::post("/query?sql=SELECT+*+FROM+42")
            .header("x-custom", "test-value")
            .body(())
            .unwrap()
            .into_parts();
        let request =
            QueryRequest::parse(Operation::Query, parts, Bytes::from_static(b"{\"a\": 1}")).unwrap();
        QueryTarget::derive(&request, adapter).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_from_upstream_success() {
        let server = start_mock_server(|req| {
            assert_eq!(req.uri.path(), "/query/42");
            assert_eq!(req.headers.get("x-custom").unwrap(), "test-value");
            assert!(req.headers.contains_key("via"));
            assert_eq!(req.body.as_ref(), b"{\"a\": 1}");
            MockResponse::chunked(200, &["[{\"a\":", "1}]"]).with_header("connection", "keep-alive")
        })
        .await;

        let client = build_upstream_client();
        let response = fetch_from_upstream(&client, &target_for(&server.url()), 5)
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_ref(), b"[{\"a\":1}]");
        // Hop-by-hop headers should be filtered out
        assert!(!response.headers().contains_key("connection"));
        assert!(!response.headers().contains_key("transfer-encoding"));
    }

    #[tokio::test]
    async fn test_fetch_from_upstream_timeout() {
        let server = start_mock_server(|_| {
            MockResponse::json(200, "[]").delayed(Duration::from_secs(3))
        })
        .await;

        let client = build_upstream_client();
        let result = fetch_from_upstream(&client, &target_for(&server.url()), 1).await;

        assert!(matches!(
            result.unwrap_err(),
            QueryRouterError::UpstreamTimeout(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_from_upstream_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = build_upstream_client();
        let adapter = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let result = fetch_from_upstream(&client, &target_for(&adapter), 5).await;

        assert!(matches!(
            result.unwrap_err(),
            QueryRouterError::UpstreamRequestFailed(..)
        ));
    }
}
