//! Reading the `proxy` field of the project manifest

use crate::error::SetupError;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// What the manifest says about the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySetting {
    /// No proxy configured; the fallback stays uninstalled
    Absent,
    /// The raw, unnormalized target string
    Target(String),
}

impl ProxySetting {
    /// Interpret a parsed manifest.
    ///
    /// A missing key and JSON-falsy values (`null`, `false`, `0`, `""`) mean
    /// no proxy. Any other non-string value is a fatal configuration error.
    pub fn from_manifest(manifest: &Value, manifest_name: &str) -> Result<Self, SetupError> {
        let value = match manifest.get("proxy") {
            Some(value) => value,
            None => return Ok(ProxySetting::Absent),
        };

        if is_falsy(value) {
            return Ok(ProxySetting::Absent);
        }

        match value {
            Value::String(target) => Ok(ProxySetting::Target(target.clone())),
            _ => Err(SetupError::ProxyNotString {
                manifest: manifest_name.to_string(),
            }),
        }
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f == 0.0 || f.is_nan()).unwrap_or(false),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Read the proxy setting from `base_dir/manifest_name`
pub fn read_proxy_setting(base_dir: &Path, manifest_name: &str) -> Result<ProxySetting, SetupError> {
    let path = base_dir.join(manifest_name);
    let content = std::fs::read_to_string(&path).map_err(|source| SetupError::ManifestRead {
        path: path.clone(),
        source,
    })?;
    let manifest: Value = serde_json::from_str(&content).map_err(|source| SetupError::ManifestParse {
        path: path.clone(),
        source,
    })?;

    let setting = ProxySetting::from_manifest(&manifest, manifest_name)?;
    debug!(path = %path.display(), ?setting, "Read proxy setting from manifest");
    Ok(setting)
}
