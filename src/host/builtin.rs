//! Built-in handlers every dev server host installs

use crate::middleware::{full_body, text_response, Flow, HostRequest, HostResponse, Middleware, RequestContext};
use futures::future::BoxFuture;
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const STATIC_MIDDLEWARE: &str = "static";
pub const HTML_FALLBACK_MIDDLEWARE: &str = "html_fallback";
pub const NOT_FOUND_MIDDLEWARE: &str = "not_found";

/// Serves files from the dev server root
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a URL path onto the root, refusing anything that escapes it
    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let relative = url_path.trim_start_matches('/');
        let relative = if relative.is_empty() || relative.ends_with('/') {
            format!("{}index.html", relative)
        } else {
            relative.to_string()
        };

        let mut path = self.root.clone();
        for component in Path::new(&relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }
}

impl Middleware for StaticFiles {
    fn name(&self) -> &str {
        STATIC_MIDDLEWARE
    }

    fn handle(&self, req: HostRequest, _ctx: RequestContext) -> BoxFuture<'_, Flow> {
        Box::pin(async move {
            if req.method() != Method::GET && req.method() != Method::HEAD {
                return Flow::Next(req);
            }
            let Some(path) = self.resolve(req.uri().path()) else {
                return Flow::Next(req);
            };

            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {}
                _ => return Flow::Next(req),
            }

            match file_response(&path, req.method() == Method::HEAD).await {
                Some(response) => {
                    debug!(path = %path.display(), "Served static file");
                    Flow::Respond(response)
                }
                None => Flow::Next(req),
            }
        })
    }
}

/// Answers HTML navigations with the root `index.html`
#[derive(Debug, Clone)]
pub struct HtmlFallback {
    index: PathBuf,
}

impl HtmlFallback {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            index: root.as_ref().join("index.html"),
        }
    }
}

impl Middleware for HtmlFallback {
    fn name(&self) -> &str {
        HTML_FALLBACK_MIDDLEWARE
    }

    fn handle(&self, req: HostRequest, _ctx: RequestContext) -> BoxFuture<'_, Flow> {
        Box::pin(async move {
            let wants_html = req
                .headers()
                .get(ACCEPT)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.contains("text/html"))
                .unwrap_or(false);

            if req.method() != Method::GET || !wants_html {
                return Flow::Next(req);
            }

            match file_response(&self.index, false).await {
                Some(response) => Flow::Respond(response),
                None => Flow::Next(req),
            }
        })
    }
}

/// Final 404 of the chain
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

impl Middleware for NotFound {
    fn name(&self) -> &str {
        NOT_FOUND_MIDDLEWARE
    }

    fn handle(&self, _req: HostRequest, _ctx: RequestContext) -> BoxFuture<'_, Flow> {
        Box::pin(async move { Flow::Respond(text_response(StatusCode::NOT_FOUND, "Not Found")) })
    }
}

async fn file_response(path: &Path, head_only: bool) -> Option<HostResponse> {
    let contents = tokio::fs::read(path).await.ok()?;
    let length = contents.len();
    let body = if head_only { Vec::new() } else { contents };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type(path))
        .header(hyper::header::CONTENT_LENGTH, length)
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .body(full_body(body))
        .ok()
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
