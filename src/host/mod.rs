//! Dev server hosts and the capability interface the proxy plugin uses
//!
//! The plugin only ever talks to a host through [`DevHost`]: it reads the
//! hot-reload path, patches the host configuration, registers the fallback
//! handler and logs. Two hosts implement it:
//!
//! - [`OrderedHost`]: hands an ordered middleware list to `setup_middlewares`
//! - [`StackHost`]: keeps a named middleware stack that can be patched once
//!   the listener is up, plus a raw-socket upgrade event

pub mod builtin;
pub mod hmr;
pub mod ordered;
pub mod stack;

pub use ordered::OrderedHost;
pub use stack::StackHost;

use crate::middleware::{Middleware, RequestContext};
use crate::proxy::ProxyHandler;
use crate::upgrade::RawRequestHead;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

/// Logging facility of a host, as seen by plugins
pub trait HostLogger: Send + Sync {
    /// Startup progress, e.g. the resolved proxy target
    fn start(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Host logger backed by `tracing`
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    host: &'static str,
}

impl TracingLogger {
    pub fn new(host: &'static str) -> Self {
        Self { host }
    }
}

impl HostLogger for TracingLogger {
    fn start(&self, message: &str) {
        info!(host = self.host, "{}", message);
    }

    fn warn(&self, message: &str) {
        warn!(host = self.host, "{}", message);
    }

    fn error(&self, message: &str) {
        error!(host = self.host, "{}", message);
    }
}

/// Second argument of every `setup_middlewares` function
#[derive(Debug, Clone)]
pub struct DevServerHandle {
    pub root: PathBuf,
    pub hmr_path: Option<String>,
}

/// A user or plugin extension of the ordered middleware list
pub type SetupFn = Arc<dyn Fn(&mut Vec<Arc<dyn Middleware>>, &DevServerHandle) + Send + Sync>;

/// `dev.setup_middlewares`: one function or an ordered list of them
#[derive(Clone)]
pub enum SetupMiddlewares {
    One(SetupFn),
    Many(Vec<SetupFn>),
}

impl SetupMiddlewares {
    /// Invoke every function in order with the same arguments
    pub fn apply(&self, middlewares: &mut Vec<Arc<dyn Middleware>>, server: &DevServerHandle) {
        match self {
            SetupMiddlewares::One(setup) => setup(middlewares, server),
            SetupMiddlewares::Many(setups) => {
                for setup in setups {
                    setup(middlewares, server);
                }
            }
        }
    }
}

impl std::fmt::Debug for SetupMiddlewares {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupMiddlewares::One(_) => f.write_str("SetupMiddlewares::One"),
            SetupMiddlewares::Many(setups) => write!(f, "SetupMiddlewares::Many({})", setups.len()),
        }
    }
}

/// `dev.client` section
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Path of the hot-reload socket
    pub path: Option<String>,
}

/// `dev` section
#[derive(Debug, Clone, Default)]
pub struct DevConfig {
    pub client: ClientConfig,
    pub setup_middlewares: Option<SetupMiddlewares>,
}

/// `server` section
#[derive(Debug, Clone)]
pub struct ServerHookConfig {
    /// Serve index.html for unmatched HTML navigations
    pub html_fallback: bool,
}

impl Default for ServerHookConfig {
    fn default() -> Self {
        Self { html_fallback: true }
    }
}

/// The configuration surface plugins may patch
#[derive(Debug, Clone, Default)]
pub struct HookConfig {
    pub dev: DevConfig,
    pub server: ServerHookConfig,
}

impl HookConfig {
    pub fn with_hmr_path(hmr_path: Option<String>) -> Self {
        Self {
            dev: DevConfig {
                client: ClientConfig { path: hmr_path },
                setup_middlewares: None,
            },
            server: ServerHookConfig::default(),
        }
    }
}

/// Receives raw sockets for protocol-upgrade requests
pub trait UpgradeListener: Send + Sync {
    /// Whether this listener takes over the connection
    fn wants(&self, head: &RawRequestHead) -> bool;

    fn upgrade(
        self: Arc<Self>,
        head: RawRequestHead,
        socket: TcpStream,
        early_data: Vec<u8>,
        ctx: RequestContext,
    ) -> BoxFuture<'static, ()>;
}

/// What a host exposes to the fallback proxy plugin
pub trait DevHost {
    fn name(&self) -> &'static str;

    /// Current hot-reload path of the host
    fn hmr_path(&self) -> Option<String>;

    /// Replace the host configuration with `patch(current)`
    fn modify_config<F>(&mut self, patch: F)
    where
        F: FnOnce(HookConfig) -> HookConfig;

    /// Install the proxy behind every built-in handler
    fn register_fallback(&mut self, handler: Arc<ProxyHandler>);

    fn logger(&self) -> Arc<dyn HostLogger>;
}
