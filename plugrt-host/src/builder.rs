//! Turning catalog records into linkable binaries
//!
//! Source plugins are compiled by the compiler registered for their
//! extension; precompiled modules are read from disk. Either way the
//! plugin's declared references are resolved first, against the host's
//! libraries and then against files in the plugin's own directory.

use crate::catalog::PluginRecord;
use crate::compiler::{
    is_precompiled_extension, CompileRequest, CompilerRegistry, Reference, ReferenceOrigin,
};
use crate::sink::{LogLevel, LogSink, LOG_CATEGORY};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while building a plugin
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Plugin '{plugin}': failed to load reference '{token}'")]
    ReferenceResolution { plugin: String, token: String },

    #[error("Plugin '{plugin}' failed to compile:\n{diagnostics}")]
    Compile { plugin: String, diagnostics: String },

    #[error("Plugin '{plugin}': no compiler registered for '{extension}'")]
    NoCompiler { plugin: String, extension: String },

    #[error("Plugin '{plugin}' has no backing file")]
    MissingSource { plugin: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An in-memory module together with the libraries it links against
#[derive(Debug, Clone)]
pub struct Binary {
    pub bytes: Vec<u8>,

    /// Libraries to link, implicit references first
    pub links: Vec<Reference>,
}

/// Wasm libraries the host has loaded and offers to every plugin
#[derive(Debug, Clone, Default)]
pub struct HostLibraries {
    libraries: Vec<Reference>,
}

impl HostLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a library under `name`, replacing any library with the same name
    pub fn add(&mut self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        let library = Reference::new(name, ReferenceOrigin::Host, bytes);
        self.libraries.retain(|l| l.name != library.name);
        self.libraries.push(library);
    }

    /// Add the library file at `path`, named after its file stem
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<String, BuildError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = file_stem(path);
        self.add(name.clone(), bytes);
        Ok(name)
    }

    /// Look a library up by logical name, then by the token's file stem
    pub fn resolve(&self, token: &str) -> Option<&Reference> {
        self.libraries
            .iter()
            .find(|l| l.name == token)
            .or_else(|| {
                let stem = file_stem(Path::new(token));
                self.libraries.iter().find(|l| l.name == stem)
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reference> {
        self.libraries.iter()
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Builds binaries for catalog records
///
/// The builder holds no per-compile state: every call assembles its own
/// [`CompileRequest`], so builds never see each other's references.
pub struct Builder {
    compilers: Arc<CompilerRegistry>,
    libraries: HostLibraries,
    sink: Arc<dyn LogSink>,
}

impl Builder {
    pub fn new(compilers: Arc<CompilerRegistry>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            compilers,
            libraries: HostLibraries::new(),
            sink,
        }
    }

    pub fn compilers(&self) -> &CompilerRegistry {
        &self.compilers
    }

    pub fn libraries(&self) -> &HostLibraries {
        &self.libraries
    }

    pub fn libraries_mut(&mut self) -> &mut HostLibraries {
        &mut self.libraries
    }

    /// Binary for `record`, compiling it if it is source
    pub fn build(&self, record: &PluginRecord) -> Result<Binary, BuildError> {
        if is_precompiled_extension(&record.extension()) {
            self.link(record)
        } else {
            self.compile(record)
        }
    }

    /// Read a precompiled module and attach its link set
    pub fn link(&self, record: &PluginRecord) -> Result<Binary, BuildError> {
        let path = source_path(record)?;
        let references = self.resolve_references(record, path)?;
        let bytes = std::fs::read(path).map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut links: Vec<Reference> = self.libraries.iter().cloned().collect();
        links.extend(references);
        Ok(Binary { bytes, links })
    }

    /// Compile a source plugin with the compiler registered for its extension
    pub fn compile(&self, record: &PluginRecord) -> Result<Binary, BuildError> {
        let path = source_path(record)?;
        let extension = record.extension();
        let compiler = self
            .compilers
            .lookup(&extension)
            .ok_or_else(|| BuildError::NoCompiler {
                plugin: record.name.clone(),
                extension: extension.clone(),
            })?;

        let references = self.resolve_references(record, path)?;
        let mut implicit_references: Vec<Reference> = self.libraries.iter().cloned().collect();
        implicit_references.extend(compiler.standard_references());

        let request = CompileRequest {
            plugin: record.name.clone(),
            source_path: path.to_path_buf(),
            references,
            implicit_references,
        };

        tracing::debug!(
            plugin = %request.plugin,
            extension = %extension,
            references = request.references.len(),
            "Compiling plugin"
        );
        let output = compiler.compile(&request);

        let diagnostics = output
            .diagnostics
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");

        if output.has_errors() {
            return Err(BuildError::Compile {
                plugin: request.plugin,
                diagnostics,
            });
        }

        if !output.diagnostics.is_empty() {
            self.sink.write_message(
                LogLevel::Warning,
                LOG_CATEGORY,
                &format!("Plugin {} compiled with warnings:\n{}", request.plugin, diagnostics),
            );
        }

        let bytes = output.binary.ok_or_else(|| BuildError::Compile {
            plugin: request.plugin.clone(),
            diagnostics: "Error NOOUT: compiler produced no output".to_string(),
        })?;

        let mut links = request.implicit_references;
        links.extend(request.references);
        Ok(Binary { bytes, links })
    }

    /// Resolve every declared reference, stopping at the first failure
    fn resolve_references(
        &self,
        record: &PluginRecord,
        source_path: &Path,
    ) -> Result<Vec<Reference>, BuildError> {
        let plugin_dir = source_path.parent().unwrap_or_else(|| Path::new("."));
        let mut resolved = Vec::with_capacity(record.references.len());

        for token in record.references.iter().map(|t| t.trim()) {
            if token.is_empty() {
                continue;
            }

            if let Some(library) = self.libraries.resolve(token) {
                resolved.push(library.clone());
                continue;
            }

            let candidate = plugin_dir.join(token);
            match std::fs::read(&candidate) {
                Ok(bytes) if candidate.is_file() => {
                    resolved.push(Reference::new(
                        file_stem(&candidate),
                        ReferenceOrigin::PluginDirectory(candidate),
                        bytes,
                    ));
                }
                _ => {
                    tracing::debug!(plugin = %record.name, token, "Reference not found");
                    return Err(BuildError::ReferenceResolution {
                        plugin: record.name.clone(),
                        token: token.to_string(),
                    });
                }
            }
        }

        Ok(resolved)
    }
}

fn source_path(record: &PluginRecord) -> Result<&Path, BuildError> {
    record.full_path().ok_or_else(|| BuildError::MissingSource {
        plugin: record.name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOutput, Diagnostic, SourceCompiler};
    use crate::sink::MemoryLogSink;
    use plugrt_api::PluginMetadata;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Compiler double that records every request it sees
    #[derive(Clone, Default)]
    struct RecordingCompiler {
        seen: Arc<Mutex<Vec<CompileRequest>>>,
        diagnostics: Vec<Diagnostic>,
        std_lib: bool,
    }

    impl SourceCompiler for RecordingCompiler {
        fn extension(&self) -> &str {
            ".src"
        }

        fn standard_references(&self) -> Vec<Reference> {
            if self.std_lib {
                vec![Reference::new("stdlib", ReferenceOrigin::Compiler, b"std".as_slice())]
            } else {
                Vec::new()
            }
        }

        fn compile(&self, request: &CompileRequest) -> CompileOutput {
            self.seen.lock().unwrap().push(request.clone());
            let mut output = CompileOutput::success(b"\0asm".to_vec());
            output.diagnostics = self.diagnostics.clone();
            output
        }
    }

    fn builder_with(compiler: RecordingCompiler) -> (Builder, Arc<MemoryLogSink>) {
        let mut compilers = CompilerRegistry::new();
        compilers.register(compiler);
        let sink = Arc::new(MemoryLogSink::new());
        (Builder::new(Arc::new(compilers), sink.clone()), sink)
    }

    fn source_record(dir: &Path, references: &[&str]) -> PluginRecord {
        let path = dir.join("plugin.src");
        std::fs::write(&path, "source").unwrap();
        PluginRecord::from_file(
            path,
            PluginMetadata {
                name: Some("Plugin".into()),
                references: references.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_references_resolve_by_name_then_path() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("local.wasm"), b"local").unwrap();

        let compiler = RecordingCompiler {
            std_lib: true,
            ..Default::default()
        };
        let seen = compiler.seen.clone();
        let (mut builder, _) = builder_with(compiler);
        builder.libraries_mut().add("geo", b"geo".as_slice());

        let record = source_record(temp.path(), &["geo.wasm", "local.wasm", " "]);
        let binary = builder.compile(&record).unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        let explicit: Vec<&str> = request.references.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(explicit, vec!["geo", "local"]);
        assert_eq!(request.references[0].origin, ReferenceOrigin::Host);
        assert!(matches!(
            request.references[1].origin,
            ReferenceOrigin::PluginDirectory(_)
        ));

        let implicit: Vec<&str> = request
            .implicit_references
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(implicit, vec!["geo", "stdlib"]);

        assert_eq!(binary.bytes, b"\0asm");
        assert_eq!(binary.links.len(), 4);
    }

    #[test]
    fn test_unresolved_reference_never_reaches_compiler() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("present.wasm"), b"x").unwrap();

        let compiler = RecordingCompiler::default();
        let seen = compiler.seen.clone();
        let (builder, _) = builder_with(compiler);

        let record = source_record(temp.path(), &["present.wasm", "missing.wasm", "also-missing"]);
        let err = builder.compile(&record).unwrap_err();

        match err {
            BuildError::ReferenceResolution { token, plugin } => {
                assert_eq!(token, "missing.wasm");
                assert_eq!(plugin, "Plugin");
            }
            other => panic!("Expected ReferenceResolution, got {:?}", other),
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_directory_is_not_a_reference() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("subdir")).unwrap();

        let (builder, _) = builder_with(RecordingCompiler::default());
        let record = source_record(temp.path(), &["subdir"]);

        assert!(matches!(
            builder.compile(&record),
            Err(BuildError::ReferenceResolution { .. })
        ));
    }

    #[test]
    fn test_errors_fail_with_all_diagnostics() {
        let temp = TempDir::new().unwrap();
        let compiler = RecordingCompiler {
            diagnostics: vec![
                Diagnostic::warning("W1", "unused import").at(1, 1),
                Diagnostic::error("E2", "type mismatch").at(4, 9),
            ],
            ..Default::default()
        };
        let (builder, _) = builder_with(compiler);

        let err = builder.compile(&source_record(temp.path(), &[])).unwrap_err();
        match err {
            BuildError::Compile { diagnostics, .. } => {
                assert_eq!(
                    diagnostics,
                    "Warning W1: Line 1 Column 1: unused import\nError E2: Line 4 Column 9: type mismatch"
                );
            }
            other => panic!("Expected Compile, got {:?}", other),
        }
    }

    #[test]
    fn test_warnings_only_succeeds_and_logs() {
        let temp = TempDir::new().unwrap();
        let compiler = RecordingCompiler {
            diagnostics: vec![Diagnostic::warning("W1", "unused import")],
            ..Default::default()
        };
        let (builder, sink) = builder_with(compiler);

        assert!(builder.compile(&source_record(temp.path(), &[])).is_ok());

        let warnings = sink.find_by_level(LogLevel::Warning);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].text.contains("unused import"));
    }

    #[test]
    fn test_fresh_request_per_compile() {
        let temp = TempDir::new().unwrap();
        let dir_a = temp.path().join("a");
        let dir_b = temp.path().join("b");
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();
        std::fs::write(dir_a.join("only-a.wasm"), b"a").unwrap();

        let compiler = RecordingCompiler::default();
        let seen = compiler.seen.clone();
        let (builder, _) = builder_with(compiler);

        builder.compile(&source_record(&dir_a, &["only-a.wasm"])).unwrap();
        builder.compile(&source_record(&dir_b, &[])).unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests[0].references.len(), 1);
        assert!(requests[1].references.is_empty());
    }

    #[test]
    fn test_no_compiler_and_missing_source() {
        let temp = TempDir::new().unwrap();
        let (builder, _) = builder_with(RecordingCompiler::default());

        let path = temp.path().join("plugin.lua");
        std::fs::write(&path, "print()").unwrap();
        let record = PluginRecord::from_file(path, PluginMetadata::default());
        assert!(matches!(
            builder.build(&record),
            Err(BuildError::NoCompiler { .. })
        ));

        let detached = PluginRecord::new("Detached");
        assert!(matches!(
            builder.build(&detached),
            Err(BuildError::MissingSource { .. })
        ));
    }

    #[test]
    fn test_link_precompiled() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hillshade.wasm");
        std::fs::write(&path, b"\0asm-bytes").unwrap();

        let (mut builder, _) = builder_with(RecordingCompiler::default());
        builder.libraries_mut().add("geo", b"geo".as_slice());

        let record = PluginRecord::from_file(path, PluginMetadata::default());
        let binary = builder.build(&record).unwrap();
        assert_eq!(binary.bytes, b"\0asm-bytes");
        assert_eq!(binary.links.len(), 1);
        assert_eq!(binary.links[0].name, "geo");
    }

    #[test]
    fn test_host_library_add_file_and_replace() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mathlib.wasm");
        std::fs::write(&path, b"v1").unwrap();

        let mut libraries = HostLibraries::new();
        assert_eq!(libraries.add_file(&path).unwrap(), "mathlib");
        libraries.add("mathlib", b"v2".as_slice());

        assert_eq!(libraries.len(), 1);
        assert_eq!(&*libraries.resolve("mathlib.wasm").unwrap().bytes, b"v2");
        assert!(libraries.resolve("other").is_none());
        assert!(libraries.add_file(temp.path().join("missing.wasm")).is_err());
    }
}
