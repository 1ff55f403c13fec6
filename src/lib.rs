//! craproxy - a fallback proxy for frontend dev servers
//!
//! Reads the `proxy` field of the project's `package.json` and installs a
//! forwarding handler at the very end of a dev server's middleware chain:
//! - Requests the dev server does not answer itself are sent to the backend
//! - `localhost` targets are pinned to `127.0.0.1` on machines without a
//!   non-loopback address
//! - WebSocket upgrades are tunneled, except the dev server's own
//!   hot-reload socket
//! - Backend failures become a 503 with a readable message
//!
//! Two dev server host models are provided ([`host::OrderedHost`] and
//! [`host::StackHost`]); the plugin reaches both through [`host::DevHost`].

pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod host;
pub mod inserter;
pub mod manifest;
pub mod middleware;
pub mod plugin;
pub mod proxy;
pub mod resolver;
pub mod server;
pub mod upgrade;

pub use plugin::FallbackProxy;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
