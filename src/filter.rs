//! Per-request admission: which requests go to the backend target

use hyper::header::{HeaderMap, UPGRADE};

/// Prefix of the automatic workspace-folder probe sent by Chrome DevTools
pub const DEVTOOLS_PROBE_PREFIX: &str = "/.well-known/appspecific/com.chrome.devtools";

/// Decide whether a request should be forwarded.
///
/// WebSocket upgrades on the host's own hot-reload path and Chrome DevTools
/// probes stay with the dev server; everything else is admitted.
pub fn admit(path: &str, is_upgrade: bool, hmr_path: Option<&str>) -> bool {
    if let Some(hmr) = hmr_path {
        if is_upgrade && path.contains(hmr) {
            return false;
        }
    }
    !path.starts_with(DEVTOOLS_PROBE_PREFIX)
}

/// True when the request asks to switch to the WebSocket protocol
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// The admission policy bound to a host's hot-reload path
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    hmr_path: Option<String>,
}

impl PathFilter {
    pub fn new(hmr_path: Option<String>) -> Self {
        Self {
            hmr_path: hmr_path.filter(|p| !p.is_empty()),
        }
    }

    pub fn hmr_path(&self) -> Option<&str> {
        self.hmr_path.as_deref()
    }

    pub fn admits(&self, path: &str, is_upgrade: bool) -> bool {
        admit(path, is_upgrade, self.hmr_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_hmr_upgrade_rejected() {
        assert!(!admit("/rsbuild-hmr", true, Some("/rsbuild-hmr")));
        assert!(!admit("/app/rsbuild-hmr?token=1", true, Some("/rsbuild-hmr")));
    }

    #[test]
    fn test_hmr_path_over_plain_http_admitted() {
        assert!(admit("/rsbuild-hmr", false, Some("/rsbuild-hmr")));
    }

    #[test]
    fn test_other_websockets_admitted() {
        assert!(admit("/socket.io/", true, Some("/rsbuild-hmr")));
        assert!(admit("/ws", true, None));
    }

    #[test]
    fn test_devtools_probe_rejected() {
        assert!(!admit("/.well-known/appspecific/com.chrome.devtools/x", false, None));
        assert!(!admit("/.well-known/appspecific/com.chrome.devtools.json", false, Some("/hmr")));
    }

    #[test]
    fn test_everything_else_admitted() {
        assert!(admit("/api/users", false, None));
        assert!(admit("/.well-known/openid-configuration", false, None));
        assert!(admit("/", false, Some("/hmr")));
    }

    #[test]
    fn test_websocket_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_request(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_request(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_request(&headers));
    }

    #[test]
    fn test_path_filter_ignores_empty_hmr_path() {
        let filter = PathFilter::new(Some(String::new()));
        assert!(filter.hmr_path().is_none());
        assert!(filter.admits("/anything", true));

        let filter = PathFilter::new(Some("/__hmr".to_string()));
        assert!(!filter.admits("/__hmr", true));
        assert!(filter.admits("/__hmr", false));
    }
}
