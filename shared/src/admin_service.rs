use crate::http::{make_boxed_error_response, make_text_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Serves the liveness and readiness probes on the admin listener.
///
/// `/health` answers as long as the process accepts connections, `/ready`
/// consults the `is_ready` callback of the service it sits next to.
pub struct AdminService<F, E> {
    is_ready: F,
    _error: PhantomData<fn() -> E>,
}

impl<F, E> AdminService<F, E>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self {
            is_ready,
            _error: PhantomData,
        }
    }
}

impl<F, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> bool + Send + Sync + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let response = probe_response(req.method(), req.uri().path(), (self.is_ready)());
        Box::pin(async move { Ok(response) })
    }
}

fn probe_response<E>(method: &Method, path: &str, is_ready: bool) -> Response<BoxBody<Bytes, E>> {
    if method != Method::GET && method != Method::HEAD {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    match (path, is_ready) {
        ("/health", _) | ("/ready", true) => make_text_response(StatusCode::OK, "ok\n"),
        ("/ready", false) => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_probes() {
        let status = |method: Method, path: &str, ready: bool| {
            probe_response::<Infallible>(&method, path, ready).status()
        };

        assert_eq!(status(Method::GET, "/health", false), StatusCode::OK);
        assert_eq!(status(Method::GET, "/ready", true), StatusCode::OK);
        assert_eq!(
            status(Method::GET, "/ready", false),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(Method::HEAD, "/health", true), StatusCode::OK);
        assert_eq!(status(Method::GET, "/other", true), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Method::POST, "/health", true),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
