//! plugrt-api: Shared types for the plugrt plugin runtime
//!
//! This crate defines the protocol between the host and a guest (wasm plugin).
//! Payloads crossing the boundary use MessagePack serialization.

use serde::{Deserialize, Serialize};

/// API version passed to every plugin in its [`LoadContext`]
pub const API_VERSION: u32 = 1;

/// Names of the functions every plugin module must export
pub mod exports {
    /// Linear memory used for host/guest payloads
    pub const MEMORY: &str = "memory";
    /// `fn(size: i32) -> i32`
    pub const ALLOC: &str = "plugin_alloc";
    /// `fn(ptr: i32, size: i32)`
    pub const DEALLOC: &str = "plugin_dealloc";
    /// `fn() -> i32`, constructs the plugin instance; 0 means success
    pub const CREATE: &str = "plugin_create";
    /// `fn(ptr: i32, len: i32) -> i64`, takes a [`LoadContext`](super::LoadContext)
    /// and returns a packed pointer to a [`LoadResponse`](super::LoadResponse)
    pub const LOAD: &str = "plugin_load";
    /// `fn() -> i32`; 0 means success
    pub const UNLOAD: &str = "plugin_unload";
    /// `fn()`
    pub const SHOW: &str = "plugin_show";
    /// `fn()`
    pub const HIDE: &str = "plugin_hide";
    /// `fn() -> i32`; non-zero means visible
    pub const VISIBLE: &str = "plugin_visible";

    /// Every export the host checks before binding a module
    pub const REQUIRED: &[&str] = &[
        MEMORY, ALLOC, DEALLOC, CREATE, LOAD, UNLOAD, SHOW, HIDE, VISIBLE,
    ];
}

/// Context handed to a plugin's load entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadContext {
    /// API version of the host
    pub api_version: u32,

    /// Catalog name of the plugin being loaded
    pub plugin_name: String,

    /// Install path of the host application
    pub application_path: String,

    /// Directory the plugin should treat as its own
    pub runtime_directory: String,
}

/// Something a plugin asks the host to wire up (a menu entry, a layer, a command...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Host-defined category, e.g. "menu" or "command"
    pub kind: String,

    /// Name of the registered item
    pub name: String,
}

/// Result of a plugin's load entry point
///
/// Registrations are applied by the host even when `error` is set, since a
/// plugin may fail after registering part of its behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResponse {
    /// Registrations to apply, in order
    #[serde(default)]
    pub registrations: Vec<Registration>,

    /// Failure message, if the load did not complete
    #[serde(default)]
    pub error: Option<String>,
}

/// Author-declared plugin metadata
///
/// Source plugins declare these fields in their header comment; precompiled
/// modules may ship them as a `<stem>.plugin.json` sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PluginMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    /// Dependency tokens resolved at build time, in declaration order
    pub references: Vec<String>,
    /// Load this plugin when the host starts
    pub auto_load: bool,
}

impl Registration {
    /// Create a registration
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl LoadResponse {
    /// A successful load with the given registrations
    pub fn loaded(registrations: Vec<Registration>) -> Self {
        Self {
            registrations,
            error: None,
        }
    }

    /// A failed load, keeping whatever was registered before the failure
    pub fn failed(registrations: Vec<Registration>, message: impl Into<String>) -> Self {
        Self {
            registrations,
            error: Some(message.into()),
        }
    }

    /// Returns true if the load completed
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_response_msgpack() {
        let response = LoadResponse::failed(vec![Registration::new("menu", "Tools")], "boom");

        let bytes = rmp_serde::to_vec(&response).unwrap();
        let decoded: LoadResponse = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(decoded, response);
        assert!(!decoded.is_success());
    }

    #[test]
    fn test_metadata_sidecar_defaults() {
        let meta: PluginMetadata =
            serde_json::from_str(r#"{ "name": "Contours", "references": ["geo"] }"#).unwrap();

        assert_eq!(meta.name.as_deref(), Some("Contours"));
        assert_eq!(meta.references, vec!["geo"]);
        assert!(!meta.auto_load);
        assert!(meta.version.is_none());
    }

    #[test]
    fn test_required_exports_include_entry_point() {
        assert!(exports::REQUIRED.contains(&exports::CREATE));
        assert!(exports::REQUIRED.contains(&exports::MEMORY));
    }
}
