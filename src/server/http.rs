use crate::CRATE_NAME;
use crate::manager::Manager;
use crate::manager::challenge::ACME_CHALLENGE_PREFIX;
use async_trait::async_trait;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub type Body = Full<Bytes>;

const HTTPS_DEFAULT_PORT: u16 = 443;

/// Application request handler, implemented for async functions and closures.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request<Incoming>) -> Response<Body>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    async fn handle(&self, request: Request<Incoming>) -> Response<Body> {
        self(request).await
    }
}

pub(crate) fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(http::header::SERVER, HeaderValue::from_static(CRATE_NAME));
    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn plain_text(status: StatusCode, body: &'static str) -> Response<Body> {
    response(status, "text/plain; charset=utf-8", body)
}

pub(crate) struct PlainRoutes {
    pub manager: Arc<Manager>,
    pub redirect_port: Option<u16>,
    pub fallback: Arc<dyn Handler>,
}

impl PlainRoutes {
    pub async fn handle(&self, request: Request<Incoming>) -> Response<Body> {
        let path = request.uri().path();
        if path.starts_with(ACME_CHALLENGE_PREFIX) {
            return self.challenge(request.method(), path).await;
        }
        match self.redirect_port {
            Some(port) => redirect(&request, port),
            None => self.fallback.handle(request).await,
        }
    }

    async fn challenge(&self, method: &Method, path: &str) -> Response<Body> {
        if method != Method::GET && method != Method::HEAD {
            let mut response = plain_text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n");
            response
                .headers_mut()
                .insert(http::header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }
        match self.manager.http_challenge_response(path).await {
            Some(key_authorization) => {
                debug!("Answering HTTP-01 challenge {path}");
                response(StatusCode::OK, "application/octet-stream", key_authorization)
            }
            None => plain_text(StatusCode::NOT_FOUND, "Not found\n"),
        }
    }
}

fn redirect<B>(request: &Request<B>, https_port: u16) -> Response<Body> {
    match redirect_location(request, https_port) {
        Some(location) => match HeaderValue::try_from(location) {
            Ok(location) => {
                let mut response = plain_text(StatusCode::MOVED_PERMANENTLY, "Moved permanently\n");
                response.headers_mut().insert(http::header::LOCATION, location);
                response
            }
            Err(_) => plain_text(StatusCode::BAD_REQUEST, "Invalid host\n"),
        },
        None => plain_text(StatusCode::BAD_REQUEST, "Missing host\n"),
    }
}

pub(crate) fn redirect_location<B>(request: &Request<B>, https_port: u16) -> Option<String> {
    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|host| host.to_str().ok())
        .or_else(|| request.uri().host())?;
    let host = strip_port(host);
    if host.is_empty() {
        return None;
    }
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    if https_port == HTTPS_DEFAULT_PORT {
        Some(format!("https://{host}{path_and_query}"))
    } else {
        Some(format!("https://{host}:{https_port}{path_and_query}"))
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal: keep everything up to the closing bracket
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.rsplit_once(':').map_or(host, |(name, _port)| name)
}
