//! HTTP request/response transport.
//!
//! One frame per POST request, no length prefix — the HTTP message itself
//! delimits the frame. The request and response bodies are
//! `application/octet-stream` and bounded by the configured maximum message
//! size. The listen side serves HTTP/1.1 connections with hyper; the send
//! side reuses pooled connections through a shared reqwest client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body as _, Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Code, Error, Result};
use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transport::{FrameHandler, Transport};

/// Default end-to-end timeout for one HTTP exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default URL path frames are POSTed to.
pub const DEFAULT_BASE_PATH: &str = "/rpc";

/// One-POST-per-frame HTTP transport.
pub struct HttpTransport {
    client: reqwest::Client,
    base_path: String,
    request_timeout: Duration,
    max_message_size: usize,
    bound: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new() -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            bound: Mutex::new(None),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the URL path frames are POSTed to.
    pub fn with_base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = path.into();
        self
    }

    /// Sets the end-to-end timeout for one exchange.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum accepted body size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// The address the listener actually bound, once `listen` has bound it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, ctx: &Context, addr: &str, frame: Vec<u8>) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::server_closed());
        }
        if frame.len() > self.max_message_size {
            return Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "message of {} bytes exceeds maximum message size {}",
                    frame.len(),
                    self.max_message_size
                ),
            ));
        }

        let url = format!("http://{addr}{}", self.base_path);
        let timeout = ctx.remaining().unwrap_or(self.request_timeout);
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .timeout(timeout)
            .body(frame);

        let response = tokio::select! {
            _ = ctx.done() => return Err(ctx.err().unwrap_or_else(Error::cancelled)),
            r = request.send() => r.map_err(|e| {
                if e.is_timeout() {
                    Error::new(Code::Timeout, format!("http request to {url} timed out"))
                } else {
                    Error::wrap(Code::Unknown, e, format!("http request to {url} failed"))
                }
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::new(
                Code::Unknown,
                format!("unexpected status {status} from {url}"),
            ));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::wrap(Code::Unknown, e, "failed to read http response body"))?;
        if body.len() > self.max_message_size {
            return Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "response of {} bytes exceeds maximum message size {}",
                    body.len(),
                    self.max_message_size
                ),
            ));
        }
        Ok(body.to_vec())
    }

    async fn listen(&self, addr: &str, handler: FrameHandler) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::server_closed());
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::wrap(Code::Unknown, e, format!("failed to listen on {addr}")))?;
        let local = listener.local_addr().ok();
        *self.bound.lock() = local;
        tracing::info!(addr = ?local, "http transport listening");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::server_closed()),
                a = listener.accept() => a,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Err(Error::server_closed());
                    }
                    return Err(Error::wrap(Code::Unknown, e, "failed to accept"));
                }
            };
            tracing::debug!(%peer, "http connection accepted");

            let handler = handler.clone();
            let base_path = self.base_path.clone();
            let max = self.max_message_size;
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let base_path = base_path.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            route(req, handler, &base_path, max).await,
                        )
                    }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(%peer, error = %e, "http connection error");
                }
            });
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

async fn route(
    req: Request<Incoming>,
    handler: FrameHandler,
    base_path: &str,
    max_message_size: usize,
) -> Response<Full<Bytes>> {
    if req.method() != Method::POST {
        return status_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    if req.uri().path() != base_path {
        return status_response(StatusCode::NOT_FOUND, "not found");
    }
    // Refuse on the declared length before buffering the body.
    if let Some(declared) = req.body().size_hint().exact() {
        if declared as usize > max_message_size {
            return status_response(StatusCode::PAYLOAD_TOO_LARGE, "request too large");
        }
    }
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return status_response(StatusCode::BAD_REQUEST, &format!("bad body: {e}")),
    };
    if body.len() > max_message_size {
        return status_response(StatusCode::PAYLOAD_TOO_LARGE, "request too large");
    }

    match handler(Context::background(), body.to_vec()).await {
        Ok(response) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(Bytes::from(response)))
            .unwrap_or_default(),
        Err(e) => status_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_default()
}
