//! The fallback proxy handler
//!
//! [`ProxyHandler`] forwards every admitted request to the backend target.
//! It plugs into a host in two ways: as a [`Middleware`] at the end of the
//! request chain, and as an [`UpgradeListener`] for hosts that hand out raw
//! sockets for protocol upgrades.

use crate::client::{create_http_client, tls_client_config, HttpClient};
use crate::config::ProxyOptions;
use crate::error::{proxy_error_message, text_error_response, ForwardError, SetupError};
use crate::filter::{is_websocket_request, PathFilter};
use crate::host::{HostLogger, UpgradeListener};
use crate::middleware::{empty_body, full_body, Flow, HostRequest, HostResponse, Middleware, ProxyBody, RequestContext};
use crate::resolver::BackendTarget;
use crate::upgrade::{
    build_request_head, connect_backend, forward_bidirectional, parse_response_head, read_body, read_head,
    RawRequestHead,
};
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, ORIGIN, TRANSFER_ENCODING};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name under which the proxy appears in a middleware stack
pub const PROXY_MIDDLEWARE_NAME: &str = "cra_proxy";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PORT: &str = "x-forwarded-port";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Forwards requests the dev server did not handle to the backend target
pub struct ProxyHandler {
    target: BackendTarget,
    filter: PathFilter,
    options: ProxyOptions,
    client: HttpClient,
    tls: Arc<ClientConfig>,
    logger: Arc<dyn HostLogger>,
}

impl ProxyHandler {
    pub fn new(
        target: BackendTarget,
        filter: PathFilter,
        options: &ProxyOptions,
        logger: Arc<dyn HostLogger>,
    ) -> Result<Self, SetupError> {
        let tls = tls_client_config(options.secure)?;
        let client = create_http_client(&tls);
        Ok(Self {
            target,
            filter,
            options: options.clone(),
            client,
            tls,
            logger,
        })
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    pub fn forwards_websockets(&self) -> bool {
        self.options.ws
    }

    /// Whether a request should be forwarded at all
    pub fn admits(&self, path: &str, is_upgrade: bool) -> bool {
        if is_upgrade && !self.options.ws {
            return false;
        }
        self.filter.admits(path, is_upgrade)
    }

    /// Log a forwarding failure and return its message
    fn report(&self, url: &str, err: &ForwardError) -> String {
        let message = proxy_error_message(url, self.target.as_str(), &err.to_string());
        self.logger.error(&message);
        message
    }

    /// Rewrite headers of a request about to be sent to the target
    fn prepare_headers(&self, headers: &mut HeaderMap, ctx: &RequestContext, upgrade: bool) {
        if self.options.xfwd {
            apply_forwarded_headers(headers, ctx, upgrade);
        }

        if self.options.change_origin {
            if let Ok(value) = HeaderValue::from_str(&self.target.authority()) {
                headers.insert(HOST, value);
            }
        }

        // Legacy backends expect Origin to match the proxy target
        if headers.contains_key(ORIGIN) {
            if let Ok(value) = HeaderValue::from_str(&self.target.origin()) {
                headers.insert(ORIGIN, value);
            }
        }
    }

    fn upstream_path(&self, path_and_query: &str) -> String {
        format!("{}{}", self.target.base_path(), path_and_query)
    }

    /// Forward a plain HTTP request through the pooled client
    async fn forward_http(&self, req: HostRequest, ctx: RequestContext) -> HostResponse {
        let url = request_url(req.uri());
        let (mut parts, body) = req.into_parts();
        self.prepare_headers(&mut parts.headers, &ctx, false);

        let uri = format!(
            "{}://{}{}",
            http_scheme(&self.target),
            self.target.authority(),
            self.upstream_path(&url)
        );

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = match builder.body(body) {
            Ok(req) => req,
            Err(e) => {
                let err = ForwardError::RequestBuild(e);
                let message = self.report(&url, &err);
                return text_error_response(err.as_header_value(), message);
            }
        };

        debug!(url, upstream = uri, "Forwarding request");

        match self.client.request(upstream_req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                let err = ForwardError::Client(e);
                let message = self.report(&url, &err);
                text_error_response(err.as_header_value(), message)
            }
        }
    }

    /// Open the backend side of an upgrade and send it the rewritten head
    async fn open_upgrade(
        &self,
        method: &str,
        url: &str,
        headers: &mut HeaderMap,
        ctx: &RequestContext,
        early_data: &[u8],
    ) -> Result<crate::upgrade::BackendStream, ForwardError> {
        self.prepare_headers(headers, ctx, true);
        let head = build_request_head(method, &self.upstream_path(url), headers);

        let mut backend = connect_backend(&self.target, &self.tls).await?;
        backend.write_all(&head).await.map_err(ForwardError::Io)?;
        if !early_data.is_empty() {
            backend.write_all(early_data).await.map_err(ForwardError::Io)?;
        }
        Ok(backend)
    }

    /// Forward an upgrade that arrived through the middleware chain.
    ///
    /// The backend's answer is relayed as the response; on `101` the client
    /// connection is taken over and spliced to the backend.
    async fn forward_upgrade(&self, mut req: HostRequest, ctx: RequestContext) -> HostResponse {
        let url = request_url(req.uri());
        let request_id = Uuid::new_v4().to_string();
        let method = req.method().as_str().to_string();

        let mut headers = req.headers().clone();
        let mut backend = match self.open_upgrade(&method, &url, &mut headers, &ctx, &[]).await {
            Ok(backend) => backend,
            Err(err) => {
                let message = self.report(&url, &err);
                return text_error_response(err.as_header_value(), message);
            }
        };

        let (head, early) = match read_head(&mut backend).await {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                let err = ForwardError::InvalidResponse;
                let message = self.report(&url, &err);
                return text_error_response(err.as_header_value(), message);
            }
            Err(e) => {
                let err = ForwardError::Io(e);
                let message = self.report(&url, &err);
                return text_error_response(err.as_header_value(), message);
            }
        };

        let (status, response_headers) = match parse_response_head(&head) {
            Some(parsed) => parsed,
            None => {
                let err = ForwardError::InvalidResponse;
                let message = self.report(&url, &err);
                return text_error_response(err.as_header_value(), message);
            }
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(url, status = %status, "Backend rejected upgrade request");
            let body = match read_body(&mut backend, early, &response_headers).await {
                Ok(body) => body,
                Err(e) => {
                    debug!(url, error = %e, "Failed to read refusal body");
                    Vec::new()
                }
            };
            return relayed_response(status, &response_headers, full_body(body));
        }

        let response = relayed_response(status, &response_headers, empty_body());
        info!(url, request_id, "WebSocket upgrade forwarded to backend");

        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    if !early.is_empty() {
                        if let Err(e) = client.write_all(&early).await {
                            debug!(request_id, error = %e, "Failed to relay early backend bytes");
                            return;
                        }
                    }
                    forward_bidirectional(&mut client, &mut backend, &request_id).await;
                }
                Err(e) => {
                    error!(request_id, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("target", &self.target)
            .field("filter", &self.filter)
            .field("options", &self.options)
            .finish()
    }
}

impl Middleware for ProxyHandler {
    fn name(&self) -> &str {
        PROXY_MIDDLEWARE_NAME
    }

    fn handle(&self, req: HostRequest, ctx: RequestContext) -> BoxFuture<'_, Flow> {
        Box::pin(async move {
            let is_upgrade = is_websocket_request(req.headers());
            if !self.admits(req.uri().path(), is_upgrade) {
                return Flow::Next(req);
            }

            if is_upgrade {
                Flow::Respond(self.forward_upgrade(req, ctx).await)
            } else {
                Flow::Respond(self.forward_http(req, ctx).await)
            }
        })
    }
}

impl UpgradeListener for ProxyHandler {
    fn wants(&self, head: &RawRequestHead) -> bool {
        self.admits(head.path(), is_websocket_request(&head.headers))
    }

    /// Tunnel a raw upgrade socket; failures are written to the socket before closing it
    fn upgrade(
        self: Arc<Self>,
        head: RawRequestHead,
        mut socket: TcpStream,
        early_data: Vec<u8>,
        ctx: RequestContext,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let request_id = Uuid::new_v4().to_string();
            let mut headers = head.headers.clone();

            match self
                .open_upgrade(&head.method, &head.target, &mut headers, &ctx, &early_data)
                .await
            {
                Ok(mut backend) => {
                    debug!(url = head.target, request_id, "Tunneling upgrade to backend");
                    forward_bidirectional(&mut socket, &mut backend, &request_id).await;
                }
                Err(err) => {
                    let message = self.report(&head.target, &err);
                    let _ = socket.write_all(message.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            }
        })
    }
}

/// Rebuild a backend response head; framing headers are left to hyper
fn relayed_response(status: StatusCode, headers: &HeaderMap, body: ProxyBody) -> HostResponse {
    let mut response = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        response = response.header(name, value);
    }
    response.body(body).expect("valid response builder")
}

/// Add X-Forwarded-For/Port/Proto/Host for the client connection
fn apply_forwarded_headers(headers: &mut HeaderMap, ctx: &RequestContext, upgrade: bool) {
    let client_ip = ctx.client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let host = headers.get(HOST).cloned();
    let port = host
        .as_ref()
        .and_then(|h| h.to_str().ok())
        .and_then(host_port)
        .unwrap_or_else(|| ctx.local_addr.port());
    headers.insert(X_FORWARDED_PORT, HeaderValue::from(port));

    let proto = match (upgrade, ctx.is_tls) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }
}

fn host_port(host: &str) -> Option<u16> {
    let (_, port) = host.rsplit_once(':')?;
    port.parse().ok()
}

fn http_scheme(target: &BackendTarget) -> &'static str {
    if target.is_tls() {
        "https"
    } else {
        "http"
    }
}

/// The URL as the client sent it, for messages and forwarding
fn request_url(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::{context, request};
    use crate::resolver::resolve_target;
    use crate::resolver::testing::FixedProbe;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorded {
        errors: Mutex<Vec<String>>,
    }

    impl HostLogger for Recorded {
        fn start(&self, _message: &str) {}
        fn warn(&self, _message: &str) {}
        fn error(&self, message: &str) {
            self.errors.lock().push(message.to_string());
        }
    }

    fn handler(target: &str, options: ProxyOptions, logger: Arc<Recorded>) -> ProxyHandler {
        let target = resolve_target(target, &FixedProbe(None)).unwrap();
        ProxyHandler::new(target, PathFilter::new(Some("/__hmr".to_string())), &options, logger).unwrap()
    }

    #[test]
    fn test_origin_rewritten_only_when_present() {
        let proxy = handler("http://127.0.0.1:5000", ProxyOptions::default(), Arc::default());

        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("localhost:3000"));
        headers.insert(ORIGIN, HeaderValue::from_static("http://localhost:3000"));
        proxy.prepare_headers(&mut headers, &context(), false);
        assert_eq!(headers.get(ORIGIN).unwrap(), "http://127.0.0.1:5000");
        assert_eq!(headers.get(HOST).unwrap(), "127.0.0.1:5000");

        let mut headers = HeaderMap::new();
        proxy.prepare_headers(&mut headers, &context(), false);
        assert!(headers.get(ORIGIN).is_none());
    }

    #[test]
    fn test_forwarded_headers() {
        let proxy = handler("http://127.0.0.1:5000", ProxyOptions::default(), Arc::default());

        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("localhost:3000"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        proxy.prepare_headers(&mut headers, &context(), true);

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.1, 127.0.0.1");
        assert_eq!(headers.get(X_FORWARDED_PORT).unwrap(), "3000");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "ws");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "localhost:3000");
    }

    #[test]
    fn test_xfwd_and_change_origin_can_be_disabled() {
        let options = ProxyOptions {
            xfwd: false,
            change_origin: false,
            ..ProxyOptions::default()
        };
        let proxy = handler("http://127.0.0.1:5000", options, Arc::default());

        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("localhost:3000"));
        proxy.prepare_headers(&mut headers, &context(), false);
        assert_eq!(headers.get(HOST).unwrap(), "localhost:3000");
        assert!(headers.get(X_FORWARDED_FOR).is_none());
    }

    #[test]
    fn test_admission_respects_ws_option() {
        let proxy = handler("http://127.0.0.1:5000", ProxyOptions::default(), Arc::default());
        assert!(proxy.admits("/socket", true));
        assert!(!proxy.admits("/__hmr", true));
        assert!(proxy.admits("/__hmr", false));

        let options = ProxyOptions {
            ws: false,
            ..ProxyOptions::default()
        };
        let proxy = handler("http://127.0.0.1:5000", options, Arc::default());
        assert!(!proxy.admits("/socket", true));
        assert!(proxy.admits("/socket", false));
    }

    #[test]
    fn test_upstream_path_keeps_target_base() {
        let proxy = handler("http://127.0.0.1:5000/backend/", ProxyOptions::default(), Arc::default());
        assert_eq!(proxy.upstream_path("/api?q=1"), "/backend/api?q=1");
    }

    #[tokio::test]
    async fn test_rejected_requests_pass_through() {
        let proxy = handler("http://127.0.0.1:5000", ProxyOptions::default(), Arc::default());
        let req = request("GET", "/.well-known/appspecific/com.chrome.devtools.json");
        assert!(matches!(proxy.handle(req, context()).await, Flow::Next(_)));
    }

    #[tokio::test]
    async fn test_backend_failure_is_503_with_message() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let logger = Arc::new(Recorded::default());
        let target = format!("http://127.0.0.1:{}", port);
        let proxy = handler(&target, ProxyOptions::default(), Arc::clone(&logger));

        let response = match proxy.handle(request("GET", "/api/users?id=7"), context()).await {
            Flow::Respond(response) => response,
            Flow::Next(_) => panic!("request should have been forwarded"),
        };
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "CONNECTION_FAILED");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.starts_with("Proxy error: Could not proxy /api/users?id=7 to "));
        assert!(body.contains(&target));
        assert!(body.to_lowercase().contains("connect"));

        let errors = logger.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0], body);
    }

    #[tokio::test]
    async fn test_refused_upgrade_relays_backend_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_head(&mut socket).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nforb")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            socket.write_all(b"idden").await.unwrap();
        });

        let proxy = handler(&format!("http://127.0.0.1:{}", port), ProxyOptions::default(), Arc::default());
        let mut req = request("GET", "/socket");
        req.headers_mut().insert(hyper::header::UPGRADE, HeaderValue::from_static("websocket"));
        req.headers_mut().insert(hyper::header::CONNECTION, HeaderValue::from_static("Upgrade"));
        req.headers_mut()
            .insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        req.headers_mut().insert("sec-websocket-version", HeaderValue::from_static("13"));

        let response = match proxy.handle(req, context()).await {
            Flow::Respond(response) => response,
            Flow::Next(_) => panic!("upgrade should have been forwarded"),
        };
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"forbidden");
    }
}
