//! Plugin loader using wasmtime
//!
//! Binds catalog records to live plugin instances. A module is bound through
//! its single factory export (`plugin_create`); the resulting [`WasmPlugin`]
//! implements the [`Plugin`] contract by calling the module's other exports.

use crate::builder::{Binary, BuildError, Builder};
use crate::catalog::PluginRecord;
use crate::config::RuntimeConfig;
use crate::contract::{Host, Plugin};
use plugrt_api::{exports, LoadContext, LoadResponse, API_VERSION};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use wasmtime::*;

/// Errors that can occur while binding or loading a plugin
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Plugin '{plugin}' is not a valid module: {source}")]
    InvalidModule {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Plugin '{plugin}' could not be instantiated: {source}")]
    Instantiation {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Plugin '{plugin}' does not implement the plugin contract: {reason}")]
    ContractViolation { plugin: String, reason: String },

    #[error("Plugin '{plugin}' failed to load: {source}")]
    RuntimeLoad {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },
}

impl LoaderError {
    fn contract(plugin: &str, reason: impl Into<String>) -> Self {
        Self::ContractViolation {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }
}

/// Plugin loader with wasmtime engine
pub struct PluginLoader {
    engine: Engine,
    builder: Builder,
    fuel_limit: u64,
    default_plugin_subdir: String,
}

/// Unpack ptr and len from a packed i64
#[inline]
fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

impl PluginLoader {
    /// Create a new plugin loader
    pub fn new(builder: Builder, config: &RuntimeConfig) -> Result<Self, LoaderError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.max_wasm_stack(config.max_stack_size);
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config).map_err(LoaderError::EngineCreation)?;

        Ok(Self {
            engine,
            builder,
            fuel_limit: config.fuel_limit,
            default_plugin_subdir: config.default_plugin_subdir.clone(),
        })
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut Builder {
        &mut self.builder
    }

    /// Directory handed to a plugin's load entry point
    pub fn runtime_directory(&self, record: &PluginRecord, host: &dyn Host) -> PathBuf {
        match record.full_path().and_then(Path::parent) {
            Some(dir) => dir.to_path_buf(),
            None => host.application_path().join(&self.default_plugin_subdir),
        }
    }

    /// Bind `record` if needed and run its load entry point
    ///
    /// Loading an already loaded record does nothing. A bound but unloaded
    /// record re-runs the entry point on the instance it already has.
    pub fn load(&self, record: &mut PluginRecord, host: &dyn Host) -> Result<(), LoaderError> {
        if record.is_loaded() {
            return Ok(());
        }

        let runtime_dir = self.runtime_directory(record, host);
        let name = record.name.clone();

        if let Some(instance) = record.instance_mut() {
            tracing::debug!(plugin = %name, "Reloading bound plugin");
            instance
                .load(host, &runtime_dir)
                .map_err(|source| LoaderError::RuntimeLoad {
                    plugin: name,
                    source,
                })?;
            record.set_loaded(true);
            return Ok(());
        }

        let binary = self.builder.build(record)?;
        let mut instance = self.instantiate(&name, binary)?;

        instance
            .load(host, &runtime_dir)
            .map_err(|source| LoaderError::RuntimeLoad {
                plugin: name.clone(),
                source,
            })?;

        tracing::info!(plugin = %name, dir = %runtime_dir.display(), "Plugin loaded");
        record.bind(Box::new(instance));
        Ok(())
    }

    /// Instantiate a module and construct its plugin through `plugin_create`
    pub fn instantiate(&self, plugin: &str, binary: Binary) -> Result<WasmPlugin, LoaderError> {
        // 1. Compile module
        let module = Module::new(&self.engine, &binary.bytes).map_err(|source| {
            LoaderError::InvalidModule {
                plugin: plugin.to_string(),
                source,
            }
        })?;

        // 2. Check the contract before running any guest code
        if module.get_export(exports::CREATE).is_none() {
            return Err(LoaderError::contract(
                plugin,
                format!("module exports no `{}` entry point", exports::CREATE),
            ));
        }
        let missing: Vec<&str> = exports::REQUIRED
            .iter()
            .copied()
            .filter(|name| module.get_export(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(LoaderError::contract(
                plugin,
                format!("missing exports: {}", missing.join(", ")),
            ));
        }

        // 3. Create store with fuel limit
        let mut store = Store::new(&self.engine, ());
        store
            .set_fuel(self.fuel_limit)
            .map_err(LoaderError::EngineCreation)?;

        // 4. Link libraries; the first library with a given name wins
        let mut linker = Linker::new(&self.engine);
        let mut linked = HashSet::new();
        for library in &binary.links {
            if !linked.insert(library.name.as_str()) {
                continue;
            }
            let library_module = Module::new(&self.engine, &library.bytes).map_err(|source| {
                LoaderError::InvalidModule {
                    plugin: plugin.to_string(),
                    source: source.context(format!("reference '{}'", library.name)),
                }
            })?;
            linker
                .module(&mut store, &library.name, &library_module)
                .map_err(|source| LoaderError::Instantiation {
                    plugin: plugin.to_string(),
                    source,
                })?;
        }

        // 5. Instantiate
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|source| LoaderError::Instantiation {
                plugin: plugin.to_string(),
                source,
            })?;

        // 6. Get memory and allocator functions
        let memory = instance
            .get_memory(&mut store, exports::MEMORY)
            .ok_or_else(|| LoaderError::contract(plugin, "`memory` is not a memory"))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, exports::ALLOC)
            .map_err(|e| LoaderError::contract(plugin, format!("{}: {}", exports::ALLOC, e)))?;

        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, exports::DEALLOC)
            .map_err(|e| LoaderError::contract(plugin, format!("{}: {}", exports::DEALLOC, e)))?;

        // 7. Construct the plugin
        let create_fn = instance
            .get_typed_func::<(), i32>(&mut store, exports::CREATE)
            .map_err(|e| {
                LoaderError::contract(
                    plugin,
                    format!("`{}` has the wrong signature: {}", exports::CREATE, e),
                )
            })?;

        let status = create_fn.call(&mut store, ()).map_err(|e| {
            LoaderError::contract(plugin, format!("`{}` trapped: {}", exports::CREATE, e))
        })?;
        if status != 0 {
            return Err(LoaderError::contract(
                plugin,
                format!("`{}` returned status {}", exports::CREATE, status),
            ));
        }

        tracing::debug!(plugin, links = linked.len(), "Plugin instantiated");

        Ok(WasmPlugin {
            name: plugin.to_string(),
            store,
            instance,
            memory,
            alloc_fn,
            dealloc_fn,
            fuel_limit: self.fuel_limit,
            visible: false,
        })
    }
}

/// A plugin backed by a wasm instance
pub struct WasmPlugin {
    name: String,
    store: Store<()>,
    instance: Instance,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
    fuel_limit: u64,
    visible: bool,
}

impl WasmPlugin {
    /// Byte range of a guest buffer, checked against the current memory size
    fn guest_range(&self, ptr: i32, len: i32) -> anyhow::Result<Range<usize>> {
        let memory_size = self.memory.data_size(&self.store);
        if ptr < 0 || len < 0 {
            anyhow::bail!("Invalid guest buffer: ptr={}, len={}", ptr, len);
        }
        let start = ptr as usize;
        match start.checked_add(len as usize) {
            Some(end) if end <= memory_size => Ok(start..end),
            _ => anyhow::bail!(
                "Out of bounds: ptr={}, len={}, memory_size={}",
                ptr,
                len,
                memory_size
            ),
        }
    }

    fn read_memory(&self, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
        let range = self.guest_range(ptr, len)?;
        Ok(self.memory.data(&self.store)[range].to_vec())
    }

    /// Release a guest buffer; a failing deallocator only costs guest memory
    fn release_buffer(&mut self, ptr: i32, len: i32) {
        if let Err(e) = self.dealloc_fn.call(&mut self.store, (ptr, len)) {
            tracing::debug!(plugin = %self.name, ptr, len, error = %e, "Guest deallocation failed");
        }
    }

    fn typed<Params, Results>(&mut self, name: &str) -> anyhow::Result<TypedFunc<Params, Results>>
    where
        Params: WasmParams,
        Results: WasmResults,
    {
        // Reset fuel for every call into the guest
        self.store.set_fuel(self.fuel_limit)?;
        self.instance.get_typed_func::<Params, Results>(&mut self.store, name)
    }

    /// Call `name(ptr, len) -> packed` with a MessagePack payload
    fn call_with_payload<T: DeserializeOwned>(
        &mut self,
        name: &str,
        payload: &[u8],
    ) -> anyhow::Result<T> {
        // 1. Allocate memory in guest and write the payload
        let payload_len = payload.len() as i32;
        let func = self.typed::<(i32, i32), i64>(name)?;
        let payload_ptr = self.alloc_fn.call(&mut self.store, payload_len)?;
        let payload_range = self.guest_range(payload_ptr, payload_len)?;
        self.memory
            .write(&mut self.store, payload_range.start, payload)?;

        // 2. Call
        let packed = func.call(&mut self.store, (payload_ptr, payload_len))?;
        let (result_ptr, result_len) = unpack_ptr_len(packed);

        // 3. Read and decode the result
        let result_bytes = self.read_memory(result_ptr, result_len)?;
        let result = rmp_serde::from_slice(&result_bytes)?;

        // 4. Deallocate payload and result memory
        self.release_buffer(payload_ptr, payload_len);
        self.release_buffer(result_ptr, result_len);

        Ok(result)
    }

    fn refresh_visible(&mut self) -> anyhow::Result<()> {
        let visible = self.typed::<(), i32>(exports::VISIBLE)?;
        self.visible = visible.call(&mut self.store, ())? != 0;
        Ok(())
    }
}

impl Plugin for WasmPlugin {
    fn load(&mut self, host: &dyn Host, runtime_dir: &Path) -> anyhow::Result<()> {
        let context = LoadContext {
            api_version: API_VERSION,
            plugin_name: self.name.clone(),
            application_path: host.application_path().display().to_string(),
            runtime_directory: runtime_dir.display().to_string(),
        };
        let payload = rmp_serde::to_vec(&context)?;
        let response: LoadResponse = self.call_with_payload(exports::LOAD, &payload)?;

        // Registrations made before a failure stay applied
        for registration in response.registrations {
            host.register(&self.name, registration)?;
        }
        if let Some(message) = response.error {
            anyhow::bail!(message);
        }

        self.refresh_visible()
    }

    fn unload(&mut self) -> anyhow::Result<()> {
        let unload = self.typed::<(), i32>(exports::UNLOAD)?;
        let status = unload.call(&mut self.store, ())?;
        if status != 0 {
            anyhow::bail!("`{}` returned status {}", exports::UNLOAD, status);
        }
        Ok(())
    }

    fn show(&mut self) -> anyhow::Result<()> {
        let show = self.typed::<(), ()>(exports::SHOW)?;
        show.call(&mut self.store, ())?;
        self.refresh_visible()
    }

    fn hide(&mut self) -> anyhow::Result<()> {
        let hide = self.typed::<(), ()>(exports::HIDE)?;
        hide.call(&mut self.store, ())?;
        self.refresh_visible()
    }

    fn is_visible(&self) -> bool {
        self.visible
    }
}

impl std::fmt::Debug for WasmPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmPlugin")
            .field("name", &self.name)
            .field("visible", &self.visible)
            .finish()
    }
}
