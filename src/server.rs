//! Accept loop shared by the dev server hosts

use crate::middleware::{dispatch, Pipeline, RequestContext};
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Takes ownership of every accepted connection
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(self: Arc<Self>, stream: TcpStream, ctx: RequestContext) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// A host bound to its listening socket, ready to run
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    host: &'static str,
    handler: Arc<dyn ConnectionHandler>,
}

impl BoundServer {
    pub async fn bind(addr: SocketAddr, host: &'static str, handler: Arc<dyn ConnectionHandler>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            host,
            handler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the shutdown channel flips to `true`
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, host = self.host, "Dev server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let ctx = RequestContext {
                                client_addr: addr,
                                local_addr: self.local_addr,
                                is_tls: false,
                            };
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = handler.handle(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(host = self.host, "Dev server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Serve HTTP on `stream`, running every request through `pipeline`
pub async fn serve_connection<S>(stream: S, pipeline: Arc<dyn Pipeline>, ctx: RequestContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pipeline = Arc::clone(&pipeline);
        async move {
            let req = req.map(|body| body.boxed());
            let chain = pipeline.snapshot();
            Ok::<_, Infallible>(dispatch(&chain, req, ctx).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
