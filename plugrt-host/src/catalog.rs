//! Plugin catalog and directory scanning
//!
//! Scanning produces metadata-only [`PluginRecord`]s. Nothing is compiled or
//! instantiated until the record is loaded.

use crate::compiler::{extension_of, CompilerRegistry};
use crate::contract::{Plugin, PluginModule};
use crate::metadata::{read_metadata, MetadataError};
use plugrt_api::PluginMetadata;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors for plugin candidates that cannot be catalogued
///
/// These never abort a scan; they are collected in [`DiscoveryResult::failures`].
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to read directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unusable plugin candidate {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: MetadataError,
    },

    #[error("Failed to construct {type_name} from module {module}: {source}")]
    Construction {
        module: String,
        type_name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Result of a scan
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    /// Records added by this scan, in catalog order
    pub added: Vec<RecordId>,

    /// Candidates that were skipped
    pub failures: Vec<DiscoveryError>,
}

impl DiscoveryResult {
    /// Returns true if nothing was skipped
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of candidates found
    pub fn total_found(&self) -> usize {
        self.added.len() + self.failures.len()
    }
}

/// Catalog handle of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Catalogued, never bound to an instance
    Catalogued,
    /// Bound and loaded
    Loaded,
    /// Bound, instance retained, not loaded
    Unloaded,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PluginState::Catalogued => "catalogued",
            PluginState::Loaded => "loaded",
            PluginState::Unloaded => "unloaded",
        };
        f.pad(label)
    }
}

/// Identity and binding state of one plugin candidate
pub struct PluginRecord {
    id: Option<RecordId>,
    pub name: String,
    pub description: String,
    pub version: String,
    full_path: Option<PathBuf>,
    pub references: Vec<String>,
    pub auto_load: bool,
    instance: Option<Box<dyn Plugin>>,
    loaded: bool,
}

impl PluginRecord {
    /// A record with no backing file
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            version: String::new(),
            full_path: None,
            references: Vec::new(),
            auto_load: false,
            instance: None,
            loaded: false,
        }
    }

    /// A metadata-only record for the plugin file at `path`
    ///
    /// The name falls back to the file stem.
    pub fn from_file(path: impl Into<PathBuf>, metadata: PluginMetadata) -> Self {
        let path = path.into();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: metadata.name.unwrap_or(stem),
            description: metadata.description.unwrap_or_default(),
            version: metadata.version.unwrap_or_default(),
            references: metadata.references,
            auto_load: metadata.auto_load,
            full_path: Some(path),
            ..Self::new(String::new())
        }
    }

    /// A record already bound to `instance` (not yet loaded)
    pub fn with_instance(name: impl Into<String>, instance: Box<dyn Plugin>) -> Self {
        Self {
            instance: Some(instance),
            ..Self::new(name)
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn auto_load(mut self, auto_load: bool) -> Self {
        self.auto_load = auto_load;
        self
    }

    pub fn references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    /// Catalog id; `None` until the record is inserted
    pub fn id(&self) -> Option<RecordId> {
        self.id
    }

    pub fn full_path(&self) -> Option<&Path> {
        self.full_path.as_deref()
    }

    /// Normalized extension of the backing file
    pub fn extension(&self) -> String {
        self.full_path
            .as_deref()
            .map(extension_of)
            .unwrap_or_default()
    }

    pub fn is_bound(&self) -> bool {
        self.instance.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.instance.is_some() && self.loaded
    }

    pub fn state(&self) -> PluginState {
        match (&self.instance, self.loaded) {
            (None, _) => PluginState::Catalogued,
            (Some(_), true) => PluginState::Loaded,
            (Some(_), false) => PluginState::Unloaded,
        }
    }

    /// Visibility of the bound instance; false when unbound
    pub fn is_visible(&self) -> bool {
        self.instance.as_ref().map(|p| p.is_visible()).unwrap_or(false)
    }

    pub(crate) fn instance_mut(&mut self) -> Option<&mut (dyn Plugin + 'static)> {
        self.instance.as_deref_mut()
    }

    pub(crate) fn bind(&mut self, instance: Box<dyn Plugin>) {
        self.instance = Some(instance);
        self.loaded = true;
    }

    pub(crate) fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded && self.instance.is_some();
    }

    pub(crate) fn release(&mut self) -> Option<Box<dyn Plugin>> {
        self.loaded = false;
        self.instance.take()
    }
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("full_path", &self.full_path)
            .field("references", &self.references)
            .field("auto_load", &self.auto_load)
            .field("state", &self.state())
            .finish()
    }
}

/// In-memory collection of known plugin records, in insertion order
#[derive(Debug, Default)]
pub struct PluginCatalog {
    records: Vec<PluginRecord>,
    next_id: u64,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record
    ///
    /// Returns `None` if a record with the same backing file is already catalogued.
    pub fn insert(&mut self, mut record: PluginRecord) -> Option<RecordId> {
        if let Some(path) = record.full_path() {
            if self.contains_path(path) {
                return None;
            }
        }
        let id = RecordId(self.next_id);
        self.next_id += 1;
        record.id = Some(id);
        self.records.push(record);
        Some(id)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.records.iter().any(|r| r.full_path() == Some(path))
    }

    pub fn get(&self, id: RecordId) -> Option<&PluginRecord> {
        self.records.iter().find(|r| r.id == Some(id))
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut PluginRecord> {
        self.records.iter_mut().find(|r| r.id == Some(id))
    }

    /// First record (in insertion order) named `name`
    pub fn find_by_name(&self, name: &str) -> Option<&PluginRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn remove(&mut self, id: RecordId) -> Option<PluginRecord> {
        let index = self.records.iter().position(|r| r.id == Some(id))?;
        Some(self.records.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginRecord> {
        self.records.iter()
    }

    /// Ids of every record, in insertion order
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().filter_map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Catalog plugin files in `root` and its immediate subdirectories
    ///
    /// A missing root yields an empty result. Files already catalogued are skipped.
    pub fn scan_directory(
        &mut self,
        root: impl AsRef<Path>,
        compilers: &CompilerRegistry,
    ) -> DiscoveryResult {
        let root = root.as_ref();
        let mut result = DiscoveryResult::default();

        if !root.is_dir() {
            tracing::debug!(root = %root.display(), "Plugin root not found, nothing to scan");
            return result;
        }

        let (mut directories, _) = match list_directory(root) {
            Ok(listing) => listing,
            Err(e) => {
                result.failures.push(e);
                return result;
            }
        };

        // Plugins normally live in subdirectories; the root itself comes last
        directories.push(root.to_path_buf());

        for directory in directories {
            let files = match list_directory(&directory) {
                Ok((_, files)) => files,
                Err(e) => {
                    result.failures.push(e);
                    continue;
                }
            };

            for path in files {
                let extension = extension_of(&path);
                if !compilers.is_plugin_extension(&extension) || self.contains_path(&path) {
                    continue;
                }

                match read_metadata(&path, &extension) {
                    Ok(metadata) => {
                        let record = PluginRecord::from_file(&path, metadata);
                        tracing::debug!(plugin = %record.name, path = %path.display(), "Catalogued plugin");
                        if let Some(id) = self.insert(record) {
                            result.added.push(id);
                        }
                    }
                    Err(source) => {
                        tracing::warn!(path = %path.display(), error = %source, "Skipping plugin candidate");
                        result.failures.push(DiscoveryError::Metadata { path, source });
                    }
                }
            }
        }

        result
    }

    /// Catalog the plugins exported by a module already resident in the host
    ///
    /// Each exported factory is invoked once; failures are collected and the
    /// remaining exports are still tried.
    pub fn scan_loaded_module(&mut self, module: &dyn PluginModule) -> DiscoveryResult {
        let mut result = DiscoveryResult::default();

        for export in module.exports() {
            match (export.factory)() {
                Ok(instance) => {
                    let record = PluginRecord::with_instance(export.type_name, instance)
                        .description("internally loaded plugin.");
                    if let Some(id) = self.insert(record) {
                        result.added.push(id);
                    }
                }
                Err(source) => {
                    tracing::debug!(
                        module = module.module_name(),
                        type_name = export.type_name,
                        error = %source,
                        "Skipping plugin export"
                    );
                    result.failures.push(DiscoveryError::Construction {
                        module: module.module_name().to_string(),
                        type_name: export.type_name.to_string(),
                        source,
                    });
                }
            }
        }

        result
    }
}

/// Sorted subdirectories and files of `dir`
fn list_directory(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), DiscoveryError> {
    let read_error = |source| DiscoveryError::ReadDirectory {
        path: dir.to_path_buf(),
        source,
    };

    let mut directories = Vec::new();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();
        if path.is_dir() {
            directories.push(path);
        } else if path.is_file() {
            files.push(path);
        }
    }
    directories.sort();
    files.sort();
    Ok((directories, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Host, StaticModule};
    use std::fs;
    use tempfile::TempDir;

    struct Dummy;

    impl Plugin for Dummy {
        fn load(&mut self, _host: &dyn Host, _runtime_dir: &Path) -> anyhow::Result<()> {
            Ok(())
        }
        fn unload(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn show(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn hide(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_visible(&self) -> bool {
            false
        }
    }

    fn dummy() -> anyhow::Result<Box<dyn Plugin>> {
        Ok(Box::new(Dummy))
    }

    fn broken() -> anyhow::Result<Box<dyn Plugin>> {
        anyhow::bail!("needs a GPU")
    }

    fn plugin_tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("contours")).unwrap();
        fs::create_dir_all(temp.path().join("deep/nested")).unwrap();
        fs::write(
            temp.path().join("contours/contours.wat"),
            ";; Name: Contours\n;; AutoLoad: true\n(module)",
        )
        .unwrap();
        fs::write(temp.path().join("root.wasm"), b"\0asm").unwrap();
        fs::write(temp.path().join("deep/nested/too-deep.wat"), "(module)").unwrap();
        fs::write(temp.path().join("readme.txt"), "Hello").unwrap();
        fs::write(temp.path().join("contours/notes.md"), "# notes").unwrap();
        temp
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp = TempDir::new().unwrap();
        let mut catalog = PluginCatalog::new();

        let result = catalog.scan_directory(temp.path(), &CompilerRegistry::with_defaults());
        assert!(result.added.is_empty());
        assert!(result.is_success());
    }

    #[test]
    fn test_scan_nonexistent_directory() {
        let mut catalog = PluginCatalog::new();
        let result = catalog.scan_directory(
            "/nonexistent/path/to/plugins",
            &CompilerRegistry::with_defaults(),
        );

        assert_eq!(result.total_found(), 0);
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_scan_one_level_deep() {
        let temp = plugin_tree();
        let mut catalog = PluginCatalog::new();

        let result = catalog.scan_directory(temp.path(), &CompilerRegistry::with_defaults());
        assert!(result.is_success());
        assert_eq!(result.added.len(), 2);

        let names: Vec<&str> = catalog.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Contours", "root"]);

        let contours = catalog.find_by_name("Contours").unwrap();
        assert!(contours.auto_load);
        assert_eq!(contours.state(), PluginState::Catalogued);
        assert!(contours.full_path().unwrap().ends_with("contours/contours.wat"));
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let temp = plugin_tree();
        let compilers = CompilerRegistry::with_defaults();
        let mut catalog = PluginCatalog::new();

        catalog.scan_directory(temp.path(), &compilers);
        let second = catalog.scan_directory(temp.path(), &compilers);

        assert!(second.added.is_empty());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_scan_ignores_unregistered_extensions() {
        let temp = TempDir::new().unwrap();
        for ext in ["txt", "json", "dll", "so", "rs", "WAST"] {
            fs::write(temp.path().join(format!("plugin.{}", ext)), "(module)").unwrap();
        }

        let mut catalog = PluginCatalog::new();
        let result = catalog.scan_directory(temp.path(), &CompilerRegistry::with_defaults());
        assert!(result.added.is_empty());
        assert!(catalog.is_empty());

        // Without the default compiler, source files are not candidates either
        fs::write(temp.path().join("plugin.wat"), "(module)").unwrap();
        catalog.scan_directory(temp.path(), &CompilerRegistry::new());
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_scan_reports_bad_sidecar() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("good.wasm"), b"\0asm").unwrap();
        fs::write(temp.path().join("bad.wasm"), b"\0asm").unwrap();
        fs::write(temp.path().join("bad.plugin.json"), "{ nope").unwrap();

        let mut catalog = PluginCatalog::new();
        let result = catalog.scan_directory(temp.path(), &CompilerRegistry::with_defaults());

        assert_eq!(result.added.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert!(matches!(
            &result.failures[0],
            DiscoveryError::Metadata {
                source: MetadataError::Sidecar { .. },
                ..
            }
        ));
        assert_eq!(catalog.iter().next().unwrap().name, "good");
    }

    #[test]
    fn test_find_by_name_returns_first_inserted() {
        let mut catalog = PluginCatalog::new();
        let first = catalog
            .insert(PluginRecord::new("Twin").description("first"))
            .unwrap();
        catalog
            .insert(PluginRecord::new("Twin").description("second"))
            .unwrap();

        let found = catalog.find_by_name("Twin").unwrap();
        assert_eq!(found.id(), Some(first));
        assert_eq!(found.description, "first");
    }

    #[test]
    fn test_insert_rejects_duplicate_path() {
        let mut catalog = PluginCatalog::new();
        let path = PathBuf::from("/plugins/a.wasm");
        assert!(catalog
            .insert(PluginRecord::from_file(&path, PluginMetadata::default()))
            .is_some());
        assert!(catalog
            .insert(PluginRecord::from_file(&path, PluginMetadata::default()))
            .is_none());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut catalog = PluginCatalog::new();
        let id = catalog.insert(PluginRecord::new("Gone")).unwrap();

        assert!(catalog.remove(id).is_some());
        assert!(catalog.get(id).is_none());
        assert!(catalog.remove(id).is_none());
    }

    #[test]
    fn test_scan_loaded_module_skips_failing_factories() {
        let module = StaticModule::new("builtin")
            .export("Legend", dummy)
            .export("Renderer3D", broken)
            .export("ScaleBar", dummy);

        let mut catalog = PluginCatalog::new();
        let result = catalog.scan_loaded_module(&module);

        assert_eq!(result.added.len(), 2);
        assert_eq!(result.failures.len(), 1);

        let legend = catalog.find_by_name("Legend").unwrap();
        assert_eq!(legend.description, "internally loaded plugin.");
        assert_eq!(legend.state(), PluginState::Unloaded);
        assert!(legend.full_path().is_none());
        assert!(catalog.find_by_name("Renderer3D").is_none());
    }
}
