//! plugrt-host: plugin runtime for host applications
//!
//! Discovers plugin candidates on disk, compiles source plugins on demand,
//! binds them through the module's factory export and drives their lifecycle.
//!
//! ```no_run
//! use plugrt_host::{CompilerRegistry, LifecycleManager, RuntimeConfig};
//! # fn host() -> std::sync::Arc<dyn plugrt_host::Host> { unimplemented!() }
//!
//! let config = RuntimeConfig::for_app("atlas");
//! let mut manager = LifecycleManager::new(config, CompilerRegistry::with_defaults(), host())?;
//! manager.scan();
//! let report = manager.load_startup_plugins();
//! # Ok::<(), plugrt_host::LifecycleError>(())
//! ```

pub mod builder;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod contract;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod sink;

pub use builder::{Binary, BuildError, Builder, HostLibraries};
pub use catalog::{
    DiscoveryError, DiscoveryResult, PluginCatalog, PluginRecord, PluginState, RecordId,
};
pub use compiler::{
    CompileOutput, CompileRequest, CompilerRegistry, Diagnostic, Reference, ReferenceOrigin,
    Severity, SourceCompiler, WatCompiler, PRECOMPILED_EXTENSION,
};
pub use config::{ConfigError, RuntimeConfig};
pub use contract::{Host, Plugin, PluginExport, PluginFactory, PluginModule, StaticModule};
pub use lifecycle::{BatchReport, LifecycleError, LifecycleManager};
pub use loader::{LoaderError, PluginLoader, WasmPlugin};
pub use metadata::MetadataError;
pub use plugrt_api::{LoadContext, LoadResponse, PluginMetadata, Registration, API_VERSION};
pub use sink::{
    LogEntry, LogLevel, LogSink, MemoryLogSink, NullLogSink, TracingLogSink, LOG_CATEGORY,
};
