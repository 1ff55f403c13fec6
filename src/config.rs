use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration of the `craproxy` dev server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Dev server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Fallback proxy options
    #[serde(default)]
    pub proxy: ProxyOptions,
}

/// Which dev server host model to run
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    /// Middlewares are handed to a `setup_middlewares` hook as an ordered list
    #[default]
    Ordered,
    /// Middlewares live in a named stack that is patched once listening
    Stack,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Directory served as static files (default: ./public)
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Host model (default: ordered)
    #[serde(default)]
    pub host: HostKind,

    /// URL path of the hot-reload socket; an empty string disables it
    #[serde(default = "default_hmr_path")]
    pub hmr_path: Option<String>,
}

impl ServerConfig {
    /// The hot-reload path, if enabled
    pub fn hmr_path(&self) -> Option<&str> {
        self.hmr_path.as_deref().filter(|p| !p.is_empty())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            root: default_root(),
            host: HostKind::default(),
            hmr_path: default_hmr_path(),
        }
    }
}

/// Options of the fallback proxy itself
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyOptions {
    /// Directory containing the manifest (default: .)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Manifest file name (default: package.json)
    #[serde(default = "default_manifest")]
    pub manifest: String,

    /// Target given directly; when set the manifest is not read
    pub target: Option<String>,

    /// Forward WebSocket upgrades (default: true)
    #[serde(default = "default_true")]
    pub ws: bool,

    /// Verify the target's TLS certificate (default: false)
    #[serde(default)]
    pub secure: bool,

    /// Add X-Forwarded-* headers (default: true)
    #[serde(default = "default_true")]
    pub xfwd: bool,

    /// Send the target authority as Host header (default: true)
    #[serde(default = "default_true")]
    pub change_origin: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            manifest: default_manifest(),
            target: None,
            ws: true,
            secure: false,
            xfwd: true,
            change_origin: true,
        }
    }
}

impl ProxyOptions {
    /// Options reading the manifest from `base_dir`
    pub fn in_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Options with an explicit target, bypassing the manifest
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.base_dir.join(&self.manifest)
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_root() -> PathBuf {
    PathBuf::from("public")
}

fn default_hmr_path() -> Option<String> {
    Some("/__hmr".to_string())
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_manifest() -> String {
    "package.json".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.proxy.manifest.trim().is_empty() {
            errors.push("[proxy] 'manifest' must not be empty".to_string());
        }

        if let Some(path) = self.server.hmr_path() {
            if !path.starts_with('/') {
                errors.push(format!("[server] 'hmr_path' must start with '/', got {:?}", path));
            }
        }

        if let Some(target) = &self.proxy.target {
            if target.trim().is_empty() {
                errors.push("[proxy] 'target' must not be empty when set".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Root directory with relative paths resolved against `base`
    pub fn static_root(&self, base: &Path) -> PathBuf {
        if self.server.root.is_absolute() {
            self.server.root.clone()
        } else {
            base.join(&self.server.root)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, HostKind::Ordered);
        assert_eq!(config.server.hmr_path.as_deref(), Some("/__hmr"));
        assert_eq!(config.proxy.manifest, "package.json");
        assert!(config.proxy.target.is_none());
        assert!(config.proxy.ws);
        assert!(!config.proxy.secure);
        assert!(config.proxy.xfwd);
        assert!(config.proxy.change_origin);
    }

    #[test]
    fn test_full_config_parsing() {
        let toml = r#"
[server]
bind = "0.0.0.0"
port = 8080
root = "dist"
host = "stack"
hmr_path = "/@hmr"

[proxy]
base_dir = "/work/app"
manifest = "manifest.json"
target = "https://api.local:8443"
ws = false
secure = true
xfwd = false
change_origin = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.root, PathBuf::from("dist"));
        assert_eq!(config.server.host, HostKind::Stack);
        assert_eq!(config.server.hmr_path.as_deref(), Some("/@hmr"));
        assert_eq!(config.proxy.manifest_path(), PathBuf::from("/work/app/manifest.json"));
        assert_eq!(config.proxy.target.as_deref(), Some("https://api.local:8443"));
        assert!(!config.proxy.ws);
        assert!(config.proxy.secure);
        assert!(!config.proxy.xfwd);
        assert!(!config.proxy.change_origin);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_all_errors() {
        let toml = r#"
[server]
hmr_path = "hmr"

[proxy]
manifest = " "
target = ""
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'hmr_path' must start with '/'"));
        assert!(err.contains("'manifest' must not be empty"));
        assert!(err.contains("'target' must not be empty"));
    }

    #[test]
    fn test_empty_hmr_path_disables_hot_reload() {
        let config: Config = toml::from_str("[server]\nhmr_path = \"\"\n").unwrap();
        assert!(config.server.hmr_path().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_static_root_resolution() {
        let config = Config::default();
        assert_eq!(config.static_root(Path::new("/srv")), PathBuf::from("/srv/public"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("craproxy.toml");
        std::fs::write(&path, "[server]\nport = 4100\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 4100);
    }
}
