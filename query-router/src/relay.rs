use crate::errors::QueryRouterError;
use crate::http::{UpstreamClient, open_upstream};
use crate::target::QueryTarget;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Response, Version};
use shared::http::filter_hop_by_hop;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Frames buffered between the upstream reader and the caller
const RELAY_CHANNEL_CAPACITY: usize = 16;

pub type HandlerBody = BoxBody<Bytes, QueryRouterError>;

/// Streams adapter responses back to the caller without buffering them.
#[derive(Clone)]
pub struct Relay {
    client: UpstreamClient,
}

impl Relay {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }

    /// Sends `target` upstream and returns its status, headers and a body that
    /// is fed from the upstream connection as the caller consumes it.
    pub async fn relay(&self, target: &QueryTarget) -> Result<Response<HandlerBody>, QueryRouterError> {
        let response = open_upstream(&self.client, target).await?;
        tracing::debug!(
            dataset_id = %target.dataset_id,
            status = %response.status(),
            "Relaying upstream response"
        );

        let (mut parts, body) = response.into_parts();
        filter_hop_by_hop(&mut parts.headers, parts.version);
        parts.version = Version::default();

        Ok(Response::from_parts(parts, RelayBody::spawn(body).boxed()))
    }
}

/// Outbound body backed by a bounded channel.
///
/// A pump task reads upstream frames and waits for channel capacity before
/// reading more, so the caller's read rate bounds the upstream read rate.
/// Dropping this body closes the channel, which stops the pump and drops the
/// upstream body along with its connection.
pub struct RelayBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, QueryRouterError>>,
    size_hint: SizeHint,
}

impl RelayBody {
    pub fn spawn<B>(upstream: B) -> Self
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Display + Send,
    {
        let size_hint = upstream.size_hint();
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        tokio::spawn(pump(upstream, tx));
        Self { rx, size_hint }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = QueryRouterError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        self.rx.poll_recv(cx)
    }

    fn size_hint(&self) -> SizeHint {
        self.size_hint.clone()
    }
}

async fn pump<B>(mut upstream: B, tx: mpsc::Sender<Result<Frame<Bytes>, QueryRouterError>>)
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    loop {
        let frame = tokio::select! {
            frame = upstream.frame() => frame,
            _ = tx.closed() => {
                tracing::debug!("Caller went away, aborting upstream body");
                return;
            }
        };

        match frame {
            None => return,
            Some(Ok(frame)) => {
                if tx.send(Ok(frame)).await.is_err() {
                    tracing::debug!("Caller went away, aborting upstream body");
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Upstream body failed mid-stream");
                // The head is already on the wire; erroring the body makes
                // the server abort the caller's connection.
                let _ = tx
                    .send(Err(QueryRouterError::ResponseBodyError(e.to_string())))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::build_upstream_client;
    use crate::request::{Operation, QueryRequest};
    use crate::testutils::{MockResponse, start_mock_server};
    use hyper::Request;
    use hyper::header::{CONTENT_RANGE, CONTENT_TYPE};
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    fn target_for(adapter: &Url) -> QueryTarget {
        let (parts, _) = Request::post("/query?sql=SELECT+*+FROM+42")
            .body(())
            .unwrap()
            .into_parts();
        let request = QueryRequest::parse(Operation::Query, parts, Bytes::new()).unwrap();
        QueryTarget::derive(&request, adapter).unwrap()
    }

    #[tokio::test]
    async fn test_relay_preserves_status_headers_and_body() {
        let server = start_mock_server(|_| {
            MockResponse::chunked(206, &["first,", "second,", "third"])
                .with_header("content-range", "bytes 0-18/100")
                .with_header("content-type", "text/csv")
                .with_header("x-adapter", "cartodb")
        })
        .await;

        let relay = Relay::new(build_upstream_client());
        let response = relay.relay(&target_for(&server.url())).await.unwrap();

        assert_eq!(response.status(), 206);
        assert_eq!(response.headers().get(CONTENT_RANGE).unwrap(), "bytes 0-18/100");
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/csv");
        assert_eq!(response.headers().get("x-adapter").unwrap(), "cartodb");
        assert!(!response.headers().contains_key("transfer-encoding"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"first,second,third");
    }

    #[tokio::test]
    async fn test_relay_errors_on_mid_stream_failure() {
        let server =
            start_mock_server(|_| MockResponse::chunked(200, &["partial"]).failing()).await;

        let relay = Relay::new(build_upstream_client());
        let response = relay.relay(&target_for(&server.url())).await.unwrap();
        assert_eq!(response.status(), 200);

        let result = response.into_body().collect().await;
        assert!(matches!(
            result,
            Err(QueryRouterError::ResponseBodyError(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_unreachable_upstream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let adapter = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        drop(listener);

        let relay = Relay::new(build_upstream_client());
        let Err(error) = relay.relay(&target_for(&adapter)).await else {
            panic!("expected the relay to fail");
        };
        assert!(matches!(error, QueryRouterError::UpstreamRequestFailed(..)));
        assert_eq!(error.status_code().as_u16(), 500);
    }

    /// Endless upstream body counting how many frames were pulled from it.
    struct EndlessBody {
        polled: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    impl Body for EndlessBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            self.polled.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"row\n")))))
        }
    }

    impl Drop for EndlessBody {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_backpressure_and_cancellation() {
        let polled = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let mut body = RelayBody::spawn(EndlessBody {
            polled: polled.clone(),
            dropped: dropped.clone(),
        });

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap().as_ref(), b"row\n");

        // A slow caller bounds how far ahead the upstream is read
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(polled.load(Ordering::SeqCst) <= RELAY_CHANNEL_CAPACITY + 2);
        assert!(!dropped.load(Ordering::SeqCst));

        // The caller disconnecting releases the upstream body
        drop(body);
        for _ in 0..20 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }
}
