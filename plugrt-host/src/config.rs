//! Runtime configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while reading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration for the plugin runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root plugin directory (scanned together with its immediate subdirectories)
    pub plugin_root: PathBuf,

    /// Subdirectory of the host application path used as the runtime
    /// directory of plugins that have no backing file
    pub default_plugin_subdir: String,

    /// Fuel limit per call into a plugin (CPU limit)
    pub fuel_limit: u64,

    /// Maximum WASM stack size in bytes
    pub max_stack_size: usize,

    /// Create `plugin_root` if it does not exist
    pub create_root: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_root: PathBuf::from("plugins"),
            default_plugin_subdir: "plugins".to_string(),
            fuel_limit: 10_000_000,
            max_stack_size: 1024 * 1024, // 1MB
            create_root: true,
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted at the platform's local data directory for `app_name`
    pub fn for_app(app_name: &str) -> Self {
        Self {
            plugin_root: default_plugin_root(app_name),
            ..Default::default()
        }
    }

    /// Configuration rooted at `plugin_root`
    pub fn with_root(plugin_root: impl Into<PathBuf>) -> Self {
        Self {
            plugin_root: plugin_root.into(),
            ..Default::default()
        }
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Default plugin root for the current platform
pub fn default_plugin_root(app_name: &str) -> PathBuf {
    match dirs::data_local_dir() {
        Some(data_dir) => data_dir.join(app_name).join("plugins"),
        None => PathBuf::from("plugins"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_plugin_root() {
        let root = default_plugin_root("myapp");
        assert!(root.ends_with("plugins"));
    }

    #[test]
    fn test_from_file_partial() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plugrt.json");
        std::fs::write(&path, r#"{ "plugin_root": "/opt/app/plugins", "fuel_limit": 42 }"#)
            .unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.plugin_root, PathBuf::from("/opt/app/plugins"));
        assert_eq!(config.fuel_limit, 42);
        assert_eq!(config.default_plugin_subdir, "plugins");
        assert!(config.create_root);
    }

    #[test]
    fn test_from_file_errors() {
        let temp = TempDir::new().unwrap();
        let missing = RuntimeConfig::from_file(temp.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let bad = temp.path().join("bad.json");
        std::fs::write(&bad, "not json").unwrap();
        assert!(matches!(
            RuntimeConfig::from_file(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }
}
