//! Plugin lifecycle management
//!
//! [`LifecycleManager`] owns the catalog and drives each record through
//! `Catalogued -> Loaded <-> Unloaded -> Removed`. Single-record operations
//! propagate their errors; batch operations isolate failures per record and
//! report them through the log sink.

use crate::builder::{Builder, HostLibraries};
use crate::catalog::{DiscoveryResult, PluginCatalog, PluginRecord, RecordId};
use crate::compiler::{is_precompiled_extension, CompilerRegistry};
use crate::config::RuntimeConfig;
use crate::contract::{Host, Plugin, PluginModule};
use crate::loader::{LoaderError, PluginLoader};
use crate::metadata::sidecar_path;
use crate::sink::{LogLevel, LogSink, TracingLogSink, LOG_CATEGORY};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Plugin record not found: {0}")]
    NotFound(RecordId),

    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error("Plugin '{plugin}' failed to unload: {source}")]
    Unload {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to delete {path}: {source}")]
    Uninstall {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin '{plugin}' failed to change visibility: {source}")]
    Visibility {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Outcome of a batch operation
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Records the operation succeeded on
    pub succeeded: Vec<RecordId>,

    /// Records that failed, with their name at the time of failure
    pub failures: Vec<(RecordId, String, LifecycleError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owner of the plugin catalog
pub struct LifecycleManager {
    catalog: PluginCatalog,
    loader: PluginLoader,
    host: Arc<dyn Host>,
    sink: Arc<dyn LogSink>,
    config: RuntimeConfig,
}

impl LifecycleManager {
    /// Create a manager logging through `tracing`
    pub fn new(
        config: RuntimeConfig,
        compilers: CompilerRegistry,
        host: Arc<dyn Host>,
    ) -> Result<Self, LifecycleError> {
        Self::with_sink(config, compilers, host, Arc::new(TracingLogSink))
    }

    /// Create a manager with a custom log sink
    pub fn with_sink(
        config: RuntimeConfig,
        compilers: CompilerRegistry,
        host: Arc<dyn Host>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, LifecycleError> {
        if config.create_root && !config.plugin_root.exists() {
            if let Err(e) = std::fs::create_dir_all(&config.plugin_root) {
                tracing::debug!(
                    root = %config.plugin_root.display(),
                    error = %e,
                    "Could not create plugin root"
                );
            }
        }

        let builder = Builder::new(Arc::new(compilers), sink.clone());
        let loader = PluginLoader::new(builder, &config)?;

        Ok(Self {
            catalog: PluginCatalog::new(),
            loader,
            host,
            sink,
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn plugin_root(&self) -> &Path {
        &self.config.plugin_root
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    pub fn compilers(&self) -> &CompilerRegistry {
        self.loader.builder().compilers()
    }

    /// Libraries offered to every plugin for reference resolution and linking
    pub fn host_libraries(&self) -> &HostLibraries {
        self.loader.builder().libraries()
    }

    pub fn host_libraries_mut(&mut self) -> &mut HostLibraries {
        self.loader.builder_mut().libraries_mut()
    }

    /// Scan the configured plugin root
    pub fn scan(&mut self) -> DiscoveryResult {
        let root = self.config.plugin_root.clone();
        self.scan_directory(root)
    }

    /// Scan `root` and its immediate subdirectories for new plugins
    pub fn scan_directory(&mut self, root: impl AsRef<Path>) -> DiscoveryResult {
        let result = self
            .catalog
            .scan_directory(root, self.loader.builder().compilers());
        self.report_skipped(&result);
        result
    }

    /// Catalog the plugins exported by a host-linked module
    pub fn scan_loaded_module(&mut self, module: &dyn PluginModule) -> DiscoveryResult {
        let result = self.catalog.scan_loaded_module(module);
        self.report_skipped(&result);
        result
    }

    fn report_skipped(&self, result: &DiscoveryResult) {
        for failure in &result.failures {
            self.sink
                .write_message(LogLevel::Warning, LOG_CATEGORY, &failure.to_string());
        }
    }

    /// Add a record directly; `None` if its backing file is already catalogued
    pub fn insert(&mut self, record: PluginRecord) -> Option<RecordId> {
        self.catalog.insert(record)
    }

    pub fn record(&self, id: RecordId) -> Option<&PluginRecord> {
        self.catalog.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PluginRecord> {
        self.catalog.iter()
    }

    /// Id of the first record named `name`
    pub fn find(&self, name: &str) -> Option<RecordId> {
        self.catalog.find_by_name(name).and_then(PluginRecord::id)
    }

    pub fn set_auto_load(&mut self, id: RecordId, auto_load: bool) -> Result<(), LifecycleError> {
        self.record_mut(id)?.auto_load = auto_load;
        Ok(())
    }

    fn record_mut(&mut self, id: RecordId) -> Result<&mut PluginRecord, LifecycleError> {
        self.catalog.get_mut(id).ok_or(LifecycleError::NotFound(id))
    }

    /// Load a plugin, building and binding it on first use
    pub fn load(&mut self, id: RecordId) -> Result<(), LifecycleError> {
        let record = self
            .catalog
            .get_mut(id)
            .ok_or(LifecycleError::NotFound(id))?;
        self.loader.load(record, self.host.as_ref())?;
        Ok(())
    }

    /// Run a loaded plugin's unload entry point; the instance is kept
    pub fn unload(&mut self, id: RecordId) -> Result<(), LifecycleError> {
        let record = self.record_mut(id)?;
        if !record.is_loaded() {
            return Ok(());
        }

        let plugin = record.name.clone();
        if let Some(instance) = record.instance_mut() {
            instance
                .unload()
                .map_err(|source| LifecycleError::Unload {
                    plugin: plugin.clone(),
                    source,
                })?;
        }
        record.set_loaded(false);
        tracing::info!(plugin = %plugin, "Plugin unloaded");
        Ok(())
    }

    /// Unload the plugin and drop its instance so the next load rebuilds it
    pub fn release(&mut self, id: RecordId) -> Result<(), LifecycleError> {
        self.unload(id)?;
        self.record_mut(id)?.release();
        Ok(())
    }

    /// Unload, delete the backing file and forget the record
    ///
    /// A precompiled module's metadata sidecar is deleted with it. This
    /// cannot be undone.
    pub fn uninstall(&mut self, id: RecordId) -> Result<(), LifecycleError> {
        self.unload(id)?;

        let record = self.record_mut(id)?;
        if let Some(path) = record.full_path() {
            remove_if_present(path)?;
            if is_precompiled_extension(&record.extension()) {
                remove_if_present(&sidecar_path(path))?;
            }
        }

        if let Some(record) = self.catalog.remove(id) {
            tracing::info!(plugin = %record.name, "Plugin uninstalled");
        }
        Ok(())
    }

    /// Load every record flagged for startup
    ///
    /// A failing record is logged, loses its startup flag, and does not stop
    /// the batch.
    pub fn load_startup_plugins(&mut self) -> BatchReport {
        let mut report = BatchReport::default();
        let startup: Vec<RecordId> = self
            .catalog
            .iter()
            .filter(|r| r.auto_load)
            .filter_map(PluginRecord::id)
            .collect();

        for id in startup {
            let name = self.name_of(id);
            self.sink
                .write_message(LogLevel::Debug, LOG_CATEGORY, &format!("loading {} ...", name));

            match self.load(id) {
                Ok(()) => report.succeeded.push(id),
                Err(err) => {
                    self.sink.write_error(
                        LOG_CATEGORY,
                        &format!("Plugin {} failed", name),
                        &err,
                    );
                    if let Some(record) = self.catalog.get_mut(id) {
                        record.auto_load = false;
                    }
                    report.failures.push((id, name, err));
                }
            }
        }

        report
    }

    /// Unload every record, logging and skipping failures
    pub fn dispose_all(&mut self) -> BatchReport {
        let mut report = BatchReport::default();

        for id in self.catalog.ids() {
            match self.unload(id) {
                Ok(()) => report.succeeded.push(id),
                Err(err) => {
                    let name = self.name_of(id);
                    self.sink.write_error(
                        LOG_CATEGORY,
                        &format!("Plugin {} unload failed", name),
                        &err,
                    );
                    report.failures.push((id, name, err));
                }
            }
        }

        report
    }

    /// Show or hide the first plugin named `name`
    ///
    /// Unknown names and unbound records are left alone.
    pub fn set_visible(&mut self, name: &str, visible: bool) -> Result<(), LifecycleError> {
        self.with_bound_instance(name, |instance| {
            if visible {
                instance.show()
            } else {
                instance.hide()
            }
        })
    }

    /// Toggle the visibility of the first plugin named `name`
    pub fn switch_visible(&mut self, name: &str) -> Result<(), LifecycleError> {
        self.with_bound_instance(name, |instance| {
            if instance.is_visible() {
                instance.hide()
            } else {
                instance.show()
            }
        })
    }

    fn with_bound_instance(
        &mut self,
        name: &str,
        action: impl FnOnce(&mut dyn Plugin) -> anyhow::Result<()>,
    ) -> Result<(), LifecycleError> {
        let Some(id) = self.find(name) else {
            return Ok(());
        };
        let record = self.record_mut(id)?;
        let Some(instance) = record.instance_mut() else {
            return Ok(());
        };
        action(instance).map_err(|source| LifecycleError::Visibility {
            plugin: name.to_string(),
            source,
        })
    }

    fn name_of(&self, id: RecordId) -> String {
        self.catalog
            .get(id)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

/// Delete `path`; a file that is already gone is not an error
fn remove_if_present(path: &Path) -> Result<(), LifecycleError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LifecycleError::Uninstall {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("plugin_root", &self.config.plugin_root)
            .field("records", &self.catalog.len())
            .finish()
    }
}
