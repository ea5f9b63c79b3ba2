//! Source compilers and the extension registry
//!
//! A [`SourceCompiler`] turns a plugin source file into wasm bytes. The
//! [`CompilerRegistry`] decides which file extensions are compilable; `.wasm`
//! modules are precompiled and never go through a compiler.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extension of modules that are loaded directly, without compilation
pub const PRECOMPILED_EXTENSION: &str = ".wasm";

/// Lower-case, dot-prefixed form of an extension token (`"WAT"` -> `".wat"`)
pub fn normalize_extension(extension: &str) -> String {
    let trimmed = extension.trim().to_lowercase();
    if trimmed.is_empty() || trimmed.starts_with('.') {
        trimmed
    } else {
        format!(".{}", trimmed)
    }
}

/// Normalized extension of `path`, or an empty string if it has none
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| normalize_extension(&e.to_string_lossy()))
        .unwrap_or_default()
}

/// Whether `extension` marks a precompiled module
pub fn is_precompiled_extension(extension: &str) -> bool {
    normalize_extension(extension) == PRECOMPILED_EXTENSION
}

/// Where a resolved reference came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceOrigin {
    /// A library the host loaded
    Host,
    /// A file next to the plugin
    PluginDirectory(PathBuf),
    /// A library supplied by the compiler itself
    Compiler,
}

/// A resolved, linkable wasm library
#[derive(Debug, Clone)]
pub struct Reference {
    /// Logical name; plugin imports from this module name
    pub name: String,
    pub origin: ReferenceOrigin,
    pub bytes: Arc<[u8]>,
}

impl Reference {
    pub fn new(name: impl Into<String>, origin: ReferenceOrigin, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            origin,
            bytes: bytes.into(),
        }
    }
}

/// Everything a compiler needs for one invocation
///
/// Built fresh by the builder for every compile and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Catalog name of the plugin being built
    pub plugin: String,

    pub source_path: PathBuf,

    /// Author-declared references, resolved, in declaration order
    pub references: Vec<Reference>,

    /// Host libraries plus the compiler's standard references
    pub implicit_references: Vec<Reference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A compiler message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.into(),
            line: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message)
        }
    }

    /// Attach a source position
    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.severity {
            Severity::Warning => "Warning",
            Severity::Error => "Error",
        };
        write!(f, "{} {}:", kind, self.code)?;
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, " Line {} Column {}:", line, column)?;
        }
        write!(f, " {}", self.message)
    }
}

/// What a compiler produced
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// Wasm bytes, if compilation produced any
    pub binary: Option<Vec<u8>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn success(binary: Vec<u8>) -> Self {
        Self {
            binary: Some(binary),
            diagnostics: Vec::new(),
        }
    }

    pub fn failed(diagnostic: Diagnostic) -> Self {
        Self {
            binary: None,
            diagnostics: vec![diagnostic],
        }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

/// Capability that compiles plugin source into wasm bytes
pub trait SourceCompiler: Send + Sync {
    /// Extension handled by this compiler, e.g. `".wat"`; the registry key
    fn extension(&self) -> &str;

    /// Extra references this language always needs (its standard library)
    fn standard_references(&self) -> Vec<Reference> {
        Vec::new()
    }

    fn compile(&self, request: &CompileRequest) -> CompileOutput;
}

/// Compiler for the WebAssembly text format
#[derive(Debug, Default, Clone, Copy)]
pub struct WatCompiler;

impl SourceCompiler for WatCompiler {
    fn extension(&self) -> &str {
        ".wat"
    }

    fn compile(&self, request: &CompileRequest) -> CompileOutput {
        let source = match std::fs::read(&request.source_path) {
            Ok(source) => source,
            Err(e) => {
                return CompileOutput::failed(Diagnostic::error(
                    "IO",
                    format!("Failed to read {}: {}", request.source_path.display(), e),
                ))
            }
        };

        match wat::parse_bytes(&source) {
            Ok(bytes) => CompileOutput::success(bytes.into_owned()),
            Err(mut e) => {
                e.set_path(&request.source_path);
                CompileOutput::failed(Diagnostic::error("WAT", e.to_string()))
            }
        }
    }
}

/// Table of source compilers keyed by normalized extension
#[derive(Default)]
pub struct CompilerRegistry {
    compilers: HashMap<String, Arc<dyn SourceCompiler>>,
}

impl CompilerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in WebAssembly text compiler
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(WatCompiler);
        registry
    }

    /// Register `compiler` under the extension it reports
    ///
    /// Returns false, keeping the existing entry, if the extension is already taken.
    pub fn register(&mut self, compiler: impl SourceCompiler + 'static) -> bool {
        let key = normalize_extension(compiler.extension());
        if key.is_empty() || self.compilers.contains_key(&key) {
            return false;
        }
        tracing::debug!(extension = %key, "Registered source compiler");
        self.compilers.insert(key, Arc::new(compiler));
        true
    }

    pub fn lookup(&self, extension: &str) -> Option<Arc<dyn SourceCompiler>> {
        self.compilers.get(&normalize_extension(extension)).cloned()
    }

    pub fn has_compiler(&self, extension: &str) -> bool {
        self.compilers.contains_key(&normalize_extension(extension))
    }

    /// Registered or precompiled
    pub fn is_plugin_extension(&self, extension: &str) -> bool {
        self.has_compiler(extension) || is_precompiled_extension(extension)
    }

    /// Registered extensions, sorted
    pub fn extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self.compilers.keys().cloned().collect();
        extensions.sort();
        extensions
    }
}

impl fmt::Debug for CompilerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerRegistry")
            .field("extensions", &self.extensions())
            .finish()
    }
}
