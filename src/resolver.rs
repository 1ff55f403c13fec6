//! Backend target resolution
//!
//! Turns the manifest proxy string into a [`BackendTarget`]. On machines
//! without a non-loopback address, `localhost` may resolve to `::1` first,
//! which many backends do not listen on, so the hostname is pinned to
//! `127.0.0.1` there.

use crate::error::SetupError;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;
use url::Url;

const LOOPBACK_HOSTNAME: &str = "localhost";
const LOOPBACK_V4: &str = "127.0.0.1";

/// The normalized origin all unhandled requests are forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    display: String,
    url: Url,
}

impl BackendTarget {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// `scheme://host[:port]`, the value written to rewritten Origin headers
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// `host[:port]` as it should appear in a Host header
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or(LOOPBACK_V4);
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or(LOOPBACK_V4)
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.url.scheme(), "https" | "wss")
    }

    /// Target path without a trailing slash, prefixed to forwarded paths
    pub fn base_path(&self) -> &str {
        self.url.path().trim_end_matches('/')
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// Finds out whether this machine has a non-loopback address
pub trait AddressProbe: Send + Sync {
    fn non_loopback_ip(&self) -> std::io::Result<Option<IpAddr>>;
}

/// Looks through the machine's network interfaces for an IPv4 address
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAddressProbe;

impl AddressProbe for SystemAddressProbe {
    fn non_loopback_ip(&self) -> std::io::Result<Option<IpAddr>> {
        let interfaces = if_addrs::get_if_addrs()?;
        Ok(first_non_loopback_v4(interfaces.iter().map(|iface| iface.ip())))
    }
}

/// First IPv4 address that is neither loopback nor unspecified
pub fn first_non_loopback_v4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    addrs
        .into_iter()
        .find(|ip| ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified())
}

/// Normalize a proxy string into a backend target
pub fn resolve_target(raw: &str, probe: &dyn AddressProbe) -> Result<BackendTarget, SetupError> {
    let mut url = Url::parse(raw).map_err(|e| SetupError::InvalidTarget {
        target: raw.to_string(),
        reason: e.to_string(),
    })?;

    if url.host_str().is_none() {
        return Err(SetupError::InvalidTarget {
            target: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    if url.host_str() != Some(LOOPBACK_HOSTNAME) {
        return Ok(BackendTarget {
            display: raw.to_string(),
            url,
        });
    }

    let pin_loopback = match probe.non_loopback_ip() {
        Ok(Some(ip)) => {
            debug!(%ip, "Non-loopback address found, keeping localhost");
            false
        }
        Ok(None) => true,
        Err(e) => {
            debug!(error = %e, "Address probe failed");
            true
        }
    };

    if !pin_loopback {
        return Ok(BackendTarget {
            display: raw.to_string(),
            url,
        });
    }

    url.set_host(Some(LOOPBACK_V4)).map_err(|e| SetupError::InvalidTarget {
        target: raw.to_string(),
        reason: e.to_string(),
    })?;
    debug!(from = raw, to = %url, "Pinned localhost target to IPv4 loopback");
    Ok(BackendTarget {
        display: url.to_string(),
        url,
    })
}
