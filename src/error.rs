//! Error types and plain-text error responses for the fallback proxy

use crate::middleware::{full_body, ProxyBody};
use hyper::{Response, StatusCode};
use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration errors raised while setting up the proxy.
///
/// Every variant ends the dev server: a misconfigured proxy must not
/// silently serve nothing.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The manifest `proxy` field is present but is not a string
    #[error("\"proxy\" in {manifest} must be a string")]
    ProxyNotString { manifest: String },

    /// The manifest could not be read
    #[error("failed to read {}: {source}", path.display())]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid JSON
    #[error("failed to parse {}: {source}", path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The proxy value is not a usable URL
    #[error("invalid proxy target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// TLS client configuration for the target could not be built
    #[error("failed to configure TLS for the proxy target: {0}")]
    Tls(#[from] rustls::Error),
}

impl SetupError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Per-request failures while talking to the backend target
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connect error: {0}")]
    Connect(std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),

    #[error("invalid server name {0:?}")]
    ServerName(String),

    #[error("{}", describe_chain(.0))]
    Client(hyper_util::client::legacy::Error),

    #[error("failed to build upstream request: {0}")]
    RequestBuild(hyper::http::Error),

    #[error("upstream I/O error: {0}")]
    Io(std::io::Error),

    #[error("invalid upgrade response from backend")]
    InvalidResponse,
}

impl ForwardError {
    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ForwardError::Connect(_) | ForwardError::Client(_) => "CONNECTION_FAILED",
            ForwardError::Tls(_) | ForwardError::ServerName(_) => "TLS_FAILED",
            ForwardError::RequestBuild(_) => "INTERNAL_ERROR",
            ForwardError::Io(_) | ForwardError::InvalidResponse => "UPSTREAM_ERROR",
        }
    }
}

/// Renders an error and all of its sources as `outer: inner: root`
fn describe_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// The human-readable message reported for a failed forward
pub fn proxy_error_message(url: &str, target: &str, cause: &str) -> String {
    format!("Proxy error: Could not proxy {} to {} ({})", url, target, cause)
}

/// Create a plain-text 503 response carrying the proxy error message
pub fn text_error_response(code: &'static str, message: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code)
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}
