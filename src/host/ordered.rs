//! Dev server host built on an ordered middleware list
//!
//! The chain is assembled once at bind time: built-in handlers first, then
//! whatever `dev.setup_middlewares` adds, then the HTML fallback (unless
//! disabled) and the final 404.

use super::builtin::{HtmlFallback, NotFound, StaticFiles};
use super::hmr::HotReload;
use super::{DevHost, DevServerHandle, HookConfig, HostLogger, TracingLogger};
use crate::inserter::merge_setup_middlewares;
use crate::middleware::{Middleware, Pipeline, RequestContext};
use crate::proxy::ProxyHandler;
use crate::server::{serve_connection, BoundServer, ConnectionHandler};
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

pub const ORDERED_HOST_NAME: &str = "ordered";

pub struct OrderedHost {
    config: HookConfig,
    root: PathBuf,
    logger: Arc<dyn HostLogger>,
}

impl OrderedHost {
    pub fn new(root: impl Into<PathBuf>, hmr_path: Option<String>) -> Self {
        Self {
            config: HookConfig::with_hmr_path(hmr_path),
            root: root.into(),
            logger: Arc::new(TracingLogger::new(ORDERED_HOST_NAME)),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn HostLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    /// Build the full chain for the current configuration
    pub fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        let handle = DevServerHandle {
            root: self.root.clone(),
            hmr_path: self.config.dev.client.path.clone(),
        };

        let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::new();
        if let Some(path) = &handle.hmr_path {
            middlewares.push(Arc::new(HotReload::new(path.clone())));
        }
        middlewares.push(Arc::new(StaticFiles::new(self.root.clone())));

        if let Some(setup) = &self.config.dev.setup_middlewares {
            setup.apply(&mut middlewares, &handle);
        }

        if self.config.server.html_fallback {
            middlewares.push(Arc::new(HtmlFallback::new(&self.root)));
        }
        middlewares.push(Arc::new(NotFound));
        middlewares
    }

    pub async fn bind(&self, addr: SocketAddr) -> anyhow::Result<BoundServer> {
        let chain = self.middlewares();
        debug!(
            chain = ?chain.iter().map(|m| m.name().to_string()).collect::<Vec<_>>(),
            "Middleware chain assembled"
        );
        let handler = Arc::new(OrderedConnections {
            pipeline: Arc::new(chain),
        });
        BoundServer::bind(addr, ORDERED_HOST_NAME, handler).await
    }
}

impl DevHost for OrderedHost {
    fn name(&self) -> &'static str {
        ORDERED_HOST_NAME
    }

    fn hmr_path(&self) -> Option<String> {
        self.config.dev.client.path.clone()
    }

    fn modify_config<F>(&mut self, patch: F)
    where
        F: FnOnce(HookConfig) -> HookConfig,
    {
        let current = std::mem::take(&mut self.config);
        self.config = patch(current);
    }

    fn register_fallback(&mut self, handler: Arc<ProxyHandler>) {
        self.modify_config(|config| merge_setup_middlewares(config, handler));
    }

    fn logger(&self) -> Arc<dyn HostLogger> {
        Arc::clone(&self.logger)
    }
}

struct OrderedConnections {
    pipeline: Arc<Vec<Arc<dyn Middleware>>>,
}

impl ConnectionHandler for OrderedConnections {
    fn handle(self: Arc<Self>, stream: TcpStream, ctx: RequestContext) -> BoxFuture<'static, anyhow::Result<()>> {
        let pipeline: Arc<dyn Pipeline> = Arc::clone(&self.pipeline) as Arc<dyn Pipeline>;
        Box::pin(serve_connection(stream, pipeline, ctx))
    }
}
