//! The host's own hot-reload socket
//!
//! Browsers connect a WebSocket to the hot-reload path and receive a
//! `connected` message; the socket then stays open, answering pings, until
//! the browser goes away. It only exists so the proxy has a live channel it
//! must leave alone.

use crate::filter::is_websocket_request;
use crate::host::UpgradeListener;
use crate::middleware::{empty_body, text_response, Flow, HostRequest, Middleware, RequestContext};
use crate::upgrade::RawRequestHead;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use hyper::header::{HeaderMap, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

pub const HMR_MIDDLEWARE: &str = "hmr";

/// First message sent on every hot-reload socket
pub const CONNECTED_MESSAGE: &str = r#"{"type":"connected"}"#;

/// Hot-reload socket endpoint, usable as middleware or as upgrade listener
#[derive(Debug, Clone)]
pub struct HotReload {
    path: String,
}

impl HotReload {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn matches(&self, path: &str, headers: &HeaderMap) -> bool {
        path == self.path && is_websocket_request(headers)
    }
}

fn accept_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
}

async fn serve_socket<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    if ws.send(Message::text(CONNECTED_MESSAGE)).await.is_err() {
        return;
    }

    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Ping(payload)) => {
                if ws.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    debug!("Hot-reload socket closed");
}

impl Middleware for HotReload {
    fn name(&self) -> &str {
        HMR_MIDDLEWARE
    }

    fn handle(&self, mut req: HostRequest, _ctx: RequestContext) -> BoxFuture<'_, Flow> {
        Box::pin(async move {
            if !self.matches(req.uri().path(), req.headers()) {
                return Flow::Next(req);
            }
            let Some(accept) = accept_key(req.headers()) else {
                return Flow::Respond(text_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key"));
            };

            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => serve_socket(TokioIo::new(upgraded)).await,
                    Err(e) => debug!(error = %e, "Hot-reload upgrade failed"),
                }
            });

            let response = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(UPGRADE, "websocket")
                .header(CONNECTION, "Upgrade")
                .header(SEC_WEBSOCKET_ACCEPT, accept)
                .body(empty_body())
                .expect("valid response builder");
            Flow::Respond(response)
        })
    }
}

impl UpgradeListener for HotReload {
    fn wants(&self, head: &RawRequestHead) -> bool {
        self.matches(head.path(), &head.headers)
    }

    fn upgrade(
        self: Arc<Self>,
        head: RawRequestHead,
        mut socket: TcpStream,
        _early_data: Vec<u8>,
        _ctx: RequestContext,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(accept) = accept_key(&head.headers) else {
                let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n").await;
                let _ = socket.shutdown().await;
                return;
            };

            let handshake = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept
            );
            if socket.write_all(handshake.as_bytes()).await.is_err() {
                return;
            }
            serve_socket(socket).await;
        })
    }
}
