//! Raw HTTP/1.1 plumbing for protocol upgrades
//!
//! Upgrades are tunneled at the byte level: the request head is rewritten
//! and sent to the backend over a fresh connection, then both sockets are
//! spliced together until one side closes.

use crate::error::ForwardError;
use crate::resolver::BackendTarget;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::StatusCode;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Largest request or response head accepted on a raw socket
pub const MAX_HEAD_LEN: usize = 16 * 1024;

/// Largest body relayed from a backend that refused an upgrade
pub const MAX_REFUSAL_BODY: usize = 64 * 1024;

/// A byte stream to the backend, plain or TLS
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

pub type BackendStream = Box<dyn BackendIo>;

/// Parsed request line and headers of a raw HTTP/1.1 request
#[derive(Debug, Clone)]
pub struct RawRequestHead {
    pub method: String,
    /// Origin-form request target (path and query)
    pub target: String,
    pub headers: HeaderMap,
}

impl RawRequestHead {
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("/")
    }
}

/// Read from `reader` until the end of an HTTP head.
///
/// Returns the head (including the blank line) and whatever bytes arrived
/// after it, or `None` if the peer closed before sending anything.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside HTTP head"));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok(Some((buf, rest)));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "HTTP head too large"));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = HeaderName::from_bytes(name.trim().as_bytes());
            let value = HeaderValue::from_str(value.trim());
            if let (Ok(name), Ok(value)) = (name, value) {
                headers.append(name, value);
            }
        }
    }
    headers
}

/// Parse a request head such as `GET /ws HTTP/1.1`
pub fn parse_request_head(data: &[u8]) -> Option<RawRequestHead> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let version = parts.next()?;
    if method.is_empty() || !version.starts_with("HTTP/1.") {
        return None;
    }

    Some(RawRequestHead {
        method,
        target,
        headers: parse_header_lines(lines),
    })
}

/// Parse a response head such as `HTTP/1.1 101 Switching Protocols`
pub fn parse_response_head(data: &[u8]) -> Option<(StatusCode, HeaderMap)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    Some((status, parse_header_lines(lines)))
}

/// Serialize a request head for the backend
pub fn build_request_head(method: &str, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", method, target).into_bytes();
    for (name, value) in headers {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    request
}

/// Read the body of a response that did not switch protocols.
///
/// `early` holds the bytes that arrived with the head. Reads up to
/// `Content-Length`, or until the backend closes when none is declared,
/// never more than [`MAX_REFUSAL_BODY`]. Chunked bodies are not relayed.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    early: Vec<u8>,
    headers: &HeaderMap,
) -> io::Result<Vec<u8>> {
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return Ok(Vec::new());
    }

    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    let limit = declared.unwrap_or(MAX_REFUSAL_BODY).min(MAX_REFUSAL_BODY);

    let mut body = early;
    if body.len() < limit {
        let missing = (limit - body.len()) as u64;
        (&mut *reader).take(missing).read_to_end(&mut body).await?;
    }
    body.truncate(limit);
    Ok(body)
}

/// Open a byte stream to the target, with TLS for https/wss targets
pub async fn connect_backend(target: &BackendTarget, tls: &Arc<ClientConfig>) -> Result<BackendStream, ForwardError> {
    let host = target.host().trim_start_matches('[').trim_end_matches(']');
    let stream = TcpStream::connect((host, target.port()))
        .await
        .map_err(ForwardError::Connect)?;
    stream.set_nodelay(true).map_err(ForwardError::Connect)?;

    if !target.is_tls() {
        return Ok(Box::new(stream));
    }

    let server_name =
        ServerName::try_from(host.to_string()).map_err(|_| ForwardError::ServerName(host.to_string()))?;
    let tls_stream = TlsConnector::from(Arc::clone(tls))
        .connect(server_name, stream)
        .await
        .map_err(ForwardError::Tls)?;
    debug!(host, "TLS connection to backend established");
    Ok(Box::new(tls_stream))
}

/// A stream that first replays bytes already read from it
pub struct PrefixedIo<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedIo<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedIo<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Copy bytes both ways until either side closes
pub async fn forward_bidirectional<A, B>(client: &mut A, backend: &mut B, request_id: &str)
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy_bidirectional(client, backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                request_id,
                client_to_backend, backend_to_client, "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
