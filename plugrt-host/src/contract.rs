//! The plugin contract and the host boundary
//!
//! The runtime never holds a concrete plugin type: every bound instance is a
//! `Box<dyn Plugin>`, whether it came from a wasm module or was linked into
//! the host process.

use plugrt_api::Registration;
use std::path::Path;

/// Capabilities every bound plugin instance exposes
pub trait Plugin: Send {
    /// Register the plugin's behavior with the host
    fn load(&mut self, host: &dyn Host, runtime_dir: &Path) -> anyhow::Result<()>;

    /// Shut the plugin down; the instance may be loaded again later
    fn unload(&mut self) -> anyhow::Result<()>;

    fn show(&mut self) -> anyhow::Result<()>;

    fn hide(&mut self) -> anyhow::Result<()>;

    fn is_visible(&self) -> bool;
}

/// The host application as seen by plugins
pub trait Host {
    /// Install path of the host application
    fn application_path(&self) -> &Path;

    /// Apply a registration requested by `plugin`
    fn register(&self, plugin: &str, registration: Registration) -> anyhow::Result<()>;
}

/// Construction function exported by a host-linked module
pub type PluginFactory = fn() -> anyhow::Result<Box<dyn Plugin>>;

/// A plugin type exported by a host-linked module
#[derive(Clone, Copy)]
pub struct PluginExport {
    /// Identifier of the exported type, used as the catalog name
    pub type_name: &'static str,
    pub factory: PluginFactory,
}

/// A module already resident in the host process that exports plugins
pub trait PluginModule {
    fn module_name(&self) -> &str;

    /// Exported plugin factories, in declaration order
    fn exports(&self) -> Vec<PluginExport>;
}

/// A [`PluginModule`] assembled from factories at startup
#[derive(Clone, Default)]
pub struct StaticModule {
    name: String,
    exports: Vec<PluginExport>,
}

impl StaticModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exports: Vec::new(),
        }
    }

    /// Add an exported plugin type
    pub fn export(mut self, type_name: &'static str, factory: PluginFactory) -> Self {
        self.exports.push(PluginExport { type_name, factory });
        self
    }
}

impl PluginModule for StaticModule {
    fn module_name(&self) -> &str {
        &self.name
    }

    fn exports(&self) -> Vec<PluginExport> {
        self.exports.clone()
    }
}

impl std::fmt::Debug for StaticModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticModule")
            .field("name", &self.name)
            .field(
                "exports",
                &self.exports.iter().map(|e| e.type_name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
