//! Minimal HTTP/1 client shared by the datasource and the remote actions.
//!
//! One connection per request, driven in the background the same way the
//! health probes are. Only plain `http://` URLs are supported.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = "warden/0.1";

/// Errors from a single HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("{url} answered {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
}

/// A request to send with [`send`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            bearer_token: None,
            timeout,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }
}

/// Send `request` and return the body of a 2xx response.
///
/// Non-2xx responses become [`HttpError::Status`] carrying the response body.
pub async fn send(request: &HttpRequest) -> Result<Bytes, HttpError> {
    let url = request.url.clone();
    tokio::time::timeout(request.timeout, exchange(request))
        .await
        .map_err(|_| HttpError::Timeout {
            url,
            timeout: request.timeout,
        })?
}

async fn exchange(request: &HttpRequest) -> Result<Bytes, HttpError> {
    let url = request.url.as_str();
    let invalid = |reason: &str| HttpError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    if uri.scheme_str() != Some("http") {
        return Err(invalid("only http:// urls are supported"));
    }
    let host = uri.host().ok_or_else(|| invalid("missing host"))?;
    let port = uri.port_u16().unwrap_or(80);
    let addr = format!("{host}:{port}");
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let stream = tokio::net::TcpStream::connect(&addr)
        .await
        .map_err(|e| HttpError::Connect {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| request_failed(url, e))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "http connection closed with error");
        }
    });

    let mut builder = Request::builder()
        .method(request.method.clone())
        .uri(path)
        .header(http::header::HOST, &addr)
        .header(http::header::USER_AGENT, USER_AGENT);
    if let Some(token) = &request.bearer_token {
        builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match &request.body {
        Some(body) => {
            builder = builder.header(http::header::CONTENT_TYPE, "application/json");
            Bytes::from(body.clone())
        }
        None => Bytes::new(),
    };
    let req = builder
        .body(Full::new(body))
        .map_err(|e| request_failed(url, e))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| request_failed(url, e))?;
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| request_failed(url, e))?
        .to_bytes();

    debug!(%url, %status, len = bytes.len(), "http exchange finished");

    if !status.is_success() {
        return Err(HttpError::Status {
            url: url.to_string(),
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(bytes)
}

fn request_failed(url: &str, e: impl std::fmt::Display) -> HttpError {
    HttpError::Request {
        url: url.to_string(),
        reason: e.to_string(),
    }
}
