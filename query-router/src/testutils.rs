use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::net::TcpListener;

/// A request as seen by a mock upstream.
pub struct MockRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub chunks: Vec<Bytes>,
    /// Abort the connection after the chunks have been written
    pub fail_after_chunks: bool,
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("content-type", "application/json".into())],
            chunks: vec![Bytes::from(body.to_string())],
            fail_after_chunks: false,
            delay: None,
        }
    }

    pub fn chunked(status: u16, chunks: &[&'static str]) -> Self {
        Self {
            status,
            headers: Vec::new(),
            chunks: chunks.iter().map(|c| Bytes::from_static(c.as_bytes())).collect(),
            fail_after_chunks: false,
            delay: None,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_after_chunks = true;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub struct MockServer {
    pub port: u16,
    hits: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("http://127.0.0.1:{}", self.port)).unwrap()
    }

    /// Number of requests received so far
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Body that yields its chunks one frame at a time, optionally ending in an error.
struct ChunkBody {
    frames: VecDeque<Result<Bytes, io::Error>>,
    /// Holds the error frame back until the preceding bytes are flushed
    error_delay: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl Body for ChunkBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        if matches!(self.frames.front(), Some(Err(_)))
            && let Some(delay) = self.error_delay.as_mut()
        {
            ready!(delay.as_mut().poll(cx));
            self.error_delay = None;
        }
        Poll::Ready(self.frames.pop_front().map(|r| r.map(Frame::data)))
    }
}

/// Starts an HTTP server on an ephemeral port answering every request with `handler`.
pub async fn start_mock_server<F>(handler: F) -> MockServer
where
    F: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    let server_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let handler = handler.clone();
            let hits = server_hits.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let (parts, body) = req.into_parts();
                        let body = body
                            .collect()
                            .await
                            .map(|c| c.to_bytes())
                            .unwrap_or_default();
                        let mock_request = MockRequest {
                            method: parts.method,
                            uri: parts.uri,
                            headers: parts.headers,
                            body,
                        };
                        let mock = handler(&mock_request);
                        if let Some(delay) = mock.delay {
                            tokio::time::sleep(delay).await;
                        }
                        Ok::<_, Infallible>(into_response(mock))
                    }
                });

                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    MockServer { port, hits }
}

fn into_response(mock: MockResponse) -> Response<ChunkBody> {
    let mut frames: VecDeque<_> = mock.chunks.into_iter().map(Ok).collect();
    let mut error_delay = None;
    if mock.fail_after_chunks {
        frames.push_back(Err(io::Error::other("upstream aborted")));
        error_delay = Some(Box::pin(tokio::time::sleep(Duration::from_millis(100))));
    }

    let mut response = Response::new(ChunkBody {
        frames,
        error_delay,
    });
    *response.status_mut() = StatusCode::from_u16(mock.status).unwrap();
    for (name, value) in mock.headers {
        response
            .headers_mut()
            .append(name, value.parse().unwrap());
    }
    response
}
