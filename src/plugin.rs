//! Setup flow of the fallback proxy
//!
//! Reads the proxy target, resolves it, builds the [`ProxyHandler`] and asks
//! the host to install it behind every built-in handler. The host is only
//! reached through [`DevHost`], so the same flow serves every host.

use crate::config::ProxyOptions;
use crate::error::SetupError;
use crate::filter::PathFilter;
use crate::host::DevHost;
use crate::manifest::{read_proxy_setting, ProxySetting};
use crate::proxy::ProxyHandler;
use crate::resolver::{resolve_target, AddressProbe, SystemAddressProbe};
use std::sync::Arc;
use tracing::debug;

pub struct FallbackProxy {
    options: ProxyOptions,
    probe: Arc<dyn AddressProbe>,
}

impl FallbackProxy {
    pub const NAME: &'static str = "plugin-cra-proxy";

    pub fn new(options: ProxyOptions) -> Self {
        Self {
            options,
            probe: Arc::new(SystemAddressProbe),
        }
    }

    /// Replace the network interface probe used for the loopback fix
    pub fn with_probe(mut self, probe: Arc<dyn AddressProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Install the proxy on `host`.
    ///
    /// Returns `Ok(None)` when no proxy is configured, in which case the host
    /// is left untouched. Every error is also reported through the host
    /// logger before being returned.
    pub fn setup<H: DevHost>(&self, host: &mut H) -> Result<Option<Arc<ProxyHandler>>, SetupError> {
        let logger = host.logger();
        self.install(host).map_err(|e| {
            logger.error(&e.to_string());
            e
        })
    }

    fn proxy_setting(&self) -> Result<ProxySetting, SetupError> {
        match &self.options.target {
            Some(target) if !target.is_empty() => Ok(ProxySetting::Target(target.clone())),
            _ => read_proxy_setting(&self.options.base_dir, &self.options.manifest),
        }
    }

    fn install<H: DevHost>(&self, host: &mut H) -> Result<Option<Arc<ProxyHandler>>, SetupError> {
        let raw = match self.proxy_setting()? {
            ProxySetting::Absent => {
                debug!(host = host.name(), "No proxy configured");
                return Ok(None);
            }
            ProxySetting::Target(raw) => raw,
        };

        let target = resolve_target(&raw, self.probe.as_ref())?;
        let logger = host.logger();
        logger.start(&format!("Proxy target: {}", target));

        let filter = PathFilter::new(host.hmr_path());
        let handler = Arc::new(ProxyHandler::new(target, filter, &self.options, logger)?);

        // The proxy answers unmatched navigations instead of index.html
        host.modify_config(|mut config| {
            config.server.html_fallback = false;
            config
        });
        host.register_fallback(Arc::clone(&handler));

        Ok(Some(handler))
    }
}
