//! Dev server host built on a live, named middleware stack
//!
//! Built-in handlers are installed when the server starts listening, after
//! which "listening" hooks run and may patch the stack in place. Upgrade
//! requests are offered to the registered upgrade listeners as raw sockets
//! before HTTP parsing takes over.

use super::builtin::{HtmlFallback, NotFound, StaticFiles, NOT_FOUND_MIDDLEWARE};
use super::hmr::HotReload;
use super::{DevHost, DevServerHandle, HookConfig, HostLogger, TracingLogger, UpgradeListener};
use crate::filter::is_websocket_request;
use crate::inserter::{splice_before, SpliceOutcome};
use crate::middleware::{Layer, Middleware, Pipeline, RequestContext};
use crate::proxy::ProxyHandler;
use crate::server::{serve_connection, BoundServer, ConnectionHandler};
use crate::upgrade::{parse_request_head, read_head, PrefixedIo, RawRequestHead};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const STACK_HOST_NAME: &str = "stack";

/// Whether unmatched HTML navigations get `index.html`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Spa,
    Mpa,
}

/// Runs once the server is listening
pub type ListeningHook = Box<dyn FnOnce(&StackHandle) + Send>;

/// Shared view of a running stack host
#[derive(Clone)]
pub struct StackHandle {
    stack: Arc<RwLock<Vec<Layer>>>,
    upgrade_listeners: Arc<RwLock<Vec<Arc<dyn UpgradeListener>>>>,
    logger: Arc<dyn HostLogger>,
}

impl StackHandle {
    fn new(logger: Arc<dyn HostLogger>) -> Self {
        Self {
            stack: Arc::new(RwLock::new(Vec::new())),
            upgrade_listeners: Arc::new(RwLock::new(Vec::new())),
            logger,
        }
    }

    /// Names of the layers, in order
    pub fn layer_names(&self) -> Vec<String> {
        self.stack.read().iter().map(|layer| layer.name.clone()).collect()
    }

    /// Edit the live stack under its write lock
    pub fn with_stack<R>(&self, edit: impl FnOnce(&mut Vec<Layer>) -> R) -> R {
        edit(&mut self.stack.write())
    }

    /// Subscribe to the upgrade event
    pub fn on_upgrade(&self, listener: Arc<dyn UpgradeListener>) {
        self.upgrade_listeners.write().push(listener);
    }

    /// First listener that takes this upgrade request
    fn upgrade_listener_for(&self, head: &RawRequestHead) -> Option<Arc<dyn UpgradeListener>> {
        self.upgrade_listeners
            .read()
            .iter()
            .find(|listener| listener.wants(head))
            .cloned()
    }

    pub fn logger(&self) -> Arc<dyn HostLogger> {
        Arc::clone(&self.logger)
    }
}

impl Pipeline for StackHandle {
    fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.stack.read().iter().map(|layer| Arc::clone(&layer.handle)).collect()
    }
}

pub struct StackHost {
    config: HookConfig,
    root: PathBuf,
    handle: StackHandle,
    listening_hooks: Vec<ListeningHook>,
    listening: bool,
}

impl StackHost {
    pub fn new(root: impl Into<PathBuf>, hmr_path: Option<String>) -> Self {
        Self {
            config: HookConfig::with_hmr_path(hmr_path),
            root: root.into(),
            handle: StackHandle::new(Arc::new(TracingLogger::new(STACK_HOST_NAME))),
            listening_hooks: Vec::new(),
            listening: false,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn HostLogger>) -> Self {
        self.handle.logger = logger;
        self
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn app_type(&self) -> AppType {
        if self.config.server.html_fallback {
            AppType::Spa
        } else {
            AppType::Mpa
        }
    }

    pub fn handle(&self) -> &StackHandle {
        &self.handle
    }

    /// Run `hook` on the "listening" event, or right away if already listening
    pub fn on_listening(&mut self, hook: ListeningHook) {
        if self.listening {
            hook(&self.handle);
        } else {
            self.listening_hooks.push(hook);
        }
    }

    fn install_builtins(&self) {
        let hmr_path = self.config.dev.client.path.clone();
        let server = DevServerHandle {
            root: self.root.clone(),
            hmr_path: hmr_path.clone(),
        };

        let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::new();
        if let Some(path) = &hmr_path {
            let hmr = Arc::new(HotReload::new(path.clone()));
            self.handle.on_upgrade(Arc::clone(&hmr) as Arc<dyn UpgradeListener>);
            middlewares.push(hmr);
        }
        middlewares.push(Arc::new(StaticFiles::new(self.root.clone())));
        if let Some(setup) = &self.config.dev.setup_middlewares {
            setup.apply(&mut middlewares, &server);
        }
        if self.app_type() == AppType::Spa {
            middlewares.push(Arc::new(HtmlFallback::new(&self.root)));
        }
        middlewares.push(Arc::new(NotFound));

        self.handle
            .with_stack(|stack| stack.extend(middlewares.into_iter().map(Layer::new)));
    }

    /// Install the built-ins and fire the "listening" hooks
    fn start_listening(&mut self) {
        if self.listening {
            return;
        }
        self.install_builtins();
        self.listening = true;
        for hook in std::mem::take(&mut self.listening_hooks) {
            hook(&self.handle);
        }
        debug!(stack = ?self.handle.layer_names(), "Middleware stack ready");
    }

    pub async fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<BoundServer> {
        let handler = Arc::new(StackConnections {
            handle: self.handle.clone(),
        });
        let server = BoundServer::bind(addr, STACK_HOST_NAME, handler).await?;
        self.start_listening();
        Ok(server)
    }
}

impl DevHost for StackHost {
    fn name(&self) -> &'static str {
        STACK_HOST_NAME
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
        self.on_listening(Box::new(move |server: &StackHandle| {
            let layer = Layer::new(Arc::clone(&handler) as Arc<dyn Middleware>);
            match server.with_stack(|stack| splice_before(stack, NOT_FOUND_MIDDLEWARE, layer)) {
                SpliceOutcome::Before(index) => {
                    debug!(index, "Proxy inserted before the 404 handler");
                }
                SpliceOutcome::Appended => {
                    server
                        .logger()
                        .warn("No not_found handler in the middleware stack; proxy appended to the end");
                }
            }

            if handler.forwards_websockets() {
                server.on_upgrade(handler as Arc<dyn UpgradeListener>);
            }
        }));
    }

    fn logger(&self) -> Arc<dyn HostLogger> {
        self.handle.logger()
    }
}

struct StackConnections {
    handle: StackHandle,
}

impl ConnectionHandler for StackConnections {
    fn handle(self: Arc<Self>, mut stream: TcpStream, ctx: RequestContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            let Some((head, rest)) = read_head(&mut stream).await? else {
                return Ok(());
            };

            if let Some(request) = parse_request_head(&head) {
                if is_websocket_request(&request.headers) {
                    if let Some(listener) = self.handle.upgrade_listener_for(&request) {
                        info!(path = request.path(), "Upgrade request handed to listener");
                        listener.upgrade(request, stream, rest, ctx).await;
                        return Ok(());
                    }
                }
            }

            let mut prefix = head;
            prefix.extend_from_slice(&rest);
            let pipeline: Arc<dyn Pipeline> = Arc::new(self.handle.clone());
            serve_connection(PrefixedIo::new(prefix, stream), pipeline, ctx).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyOptions;
    use crate::filter::PathFilter;
    use crate::resolver::resolve_target;
    use crate::resolver::testing::FixedProbe;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorded {
        warnings: Mutex<Vec<String>>,
    }

    impl HostLogger for Recorded {
        fn start(&self, _message: &str) {}
        fn warn(&self, message: &str) {
            self.warnings.lock().push(message.to_string());
        }
        fn error(&self, _message: &str) {}
    }

    fn proxy(ws: bool) -> Arc<ProxyHandler> {
        let target = resolve_target("http://127.0.0.1:5000", &FixedProbe(None)).unwrap();
        let options = ProxyOptions {
            ws,
            ..ProxyOptions::default()
        };
        Arc::new(
            ProxyHandler::new(
                target,
                PathFilter::new(Some("/__hmr".to_string())),
                &options,
                Arc::new(TracingLogger::new("test")),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_fallback_spliced_before_not_found_on_listening() {
        let mut host = StackHost::new("public", Some("/__hmr".to_string()));
        host.modify_config(|mut config| {
            config.server.html_fallback = false;
            config
        });
        host.register_fallback(proxy(true));
        assert!(host.handle().layer_names().is_empty());

        host.start_listening();
        assert_eq!(host.app_type(), AppType::Mpa);
        assert_eq!(
            host.handle().layer_names(),
            vec!["hmr", "static", "cra_proxy", "not_found"]
        );
        assert_eq!(host.handle().upgrade_listeners.read().len(), 2);
    }

    #[test]
    fn test_websocket_listener_skipped_when_ws_disabled() {
        let mut host = StackHost::new("public", None);
        host.register_fallback(proxy(false));
        host.start_listening();

        assert!(host.handle().upgrade_listeners.read().is_empty());
        assert_eq!(
            host.handle().layer_names(),
            vec!["static", "html_fallback", "cra_proxy", "not_found"]
        );
    }

    #[test]
    fn test_missing_not_found_appends_and_warns() {
        let logger = Arc::new(Recorded::default());
        let mut host = StackHost::new("public", None).with_logger(Arc::clone(&logger) as Arc<dyn HostLogger>);
        host.start_listening();
        host.handle()
            .with_stack(|stack| stack.retain(|layer| layer.name != NOT_FOUND_MIDDLEWARE));

        host.register_fallback(proxy(true));
        assert_eq!(
            host.handle().layer_names(),
            vec!["static", "html_fallback", "cra_proxy"]
        );
        assert_eq!(logger.warnings.lock().len(), 1);
    }

    #[test]
    fn test_upgrade_listener_selection() {
        let mut host = StackHost::new("public", Some("/__hmr".to_string()));
        host.register_fallback(proxy(true));
        host.start_listening();

        let hmr = parse_request_head(b"GET /__hmr HTTP/1.1\r\nUpgrade: websocket\r\n\r\n").unwrap();
        let app = parse_request_head(b"GET /socket HTTP/1.1\r\nUpgrade: websocket\r\n\r\n").unwrap();
        let devtools = parse_request_head(
            b"GET /.well-known/appspecific/com.chrome.devtools.json HTTP/1.1\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap();

        let handle = host.handle();
        let chosen = handle.upgrade_listener_for(&hmr).unwrap();
        assert!(!chosen.wants(&app));
        let chosen = handle.upgrade_listener_for(&app).unwrap();
        assert!(chosen.wants(&app));
        assert!(!chosen.wants(&hmr));
        assert!(handle.upgrade_listener_for(&devtools).is_none());
    }
}
