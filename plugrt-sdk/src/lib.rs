//! plugrt-sdk: SDK for writing plugrt guest plugins
//!
//! Implement [`Plugin`] and let [`export_plugin!`] generate the exports the
//! host looks for.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plugrt_sdk::prelude::*;
//!
//! struct Legend {
//!     visible: bool,
//! }
//!
//! impl Plugin for Legend {
//!     fn create() -> Result<Self, String> {
//!         Ok(Legend { visible: false })
//!     }
//!
//!     fn load(&mut self, _ctx: &LoadContext, registrar: &mut Registrar) -> Result<(), String> {
//!         registrar.register("menu", "Legend");
//!         Ok(())
//!     }
//!
//!     fn show(&mut self) {
//!         self.visible = true;
//!     }
//!
//!     fn hide(&mut self) {
//!         self.visible = false;
//!     }
//!
//!     fn visible(&self) -> bool {
//!         self.visible
//!     }
//! }
//!
//! export_plugin!(Legend);
//! ```

use std::alloc::{alloc, dealloc, Layout};

pub use plugrt_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_plugin, memory, Plugin, Registrar};
    pub use plugrt_api::{LoadContext, LoadResponse, Registration, API_VERSION};
}

/// Trait that plugins must implement
///
/// The generated exports hold one instance, created by the host through
/// `plugin_create` and reused across load/unload cycles.
pub trait Plugin: Sized + Send + 'static {
    fn create() -> Result<Self, String>;

    /// Register behavior with the host
    ///
    /// Registrations made before an error is returned are still applied.
    fn load(&mut self, ctx: &LoadContext, registrar: &mut Registrar) -> Result<(), String>;

    fn unload(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn show(&mut self) {}

    fn hide(&mut self) {}

    fn visible(&self) -> bool {
        false
    }
}

/// Collects the registrations a plugin makes while loading
#[derive(Debug, Default)]
pub struct Registrar {
    registrations: Vec<Registration>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.registrations.push(Registration::new(kind, name));
        self
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn into_registrations(self) -> Vec<Registration> {
        self.registrations
    }
}

/// Run `plugin`'s load entry point and package the outcome for the host
pub fn dispatch_load<P: Plugin>(plugin: &mut P, ctx: &LoadContext) -> LoadResponse {
    if ctx.api_version != API_VERSION {
        return LoadResponse::failed(
            Vec::new(),
            format!(
                "host API version {} is not supported (expected {})",
                ctx.api_version, API_VERSION
            ),
        );
    }

    let mut registrar = Registrar::new();
    match plugin.load(ctx, &mut registrar) {
        Ok(()) => LoadResponse::loaded(registrar.into_registrations()),
        Err(message) => LoadResponse::failed(registrar.into_registrations(), message),
    }
}

/// Memory utilities for Wasm plugin development
pub mod memory {
    use super::*;

    /// Allocate memory in the Wasm linear memory
    #[inline]
    pub fn plugin_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        let Ok(layout) = Layout::from_size_align(size as usize, 1) else {
            return 0;
        };
        unsafe { alloc(layout) as i32 }
    }

    /// Deallocate memory in the Wasm linear memory
    ///
    /// The ptr must have been allocated by `plugin_alloc` with the same size.
    #[inline]
    pub fn plugin_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size as usize, 1) {
            unsafe { dealloc(ptr as *mut u8, layout) }
        }
    }

    /// Pack a pointer and length into a single i64 value
    #[inline]
    pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
        ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
    }

    /// Serialize data and return it as an allocated buffer
    ///
    /// Returns a packed i64 containing the pointer and length.
    pub fn serialize_and_return<T: serde::Serialize>(data: &T) -> i64 {
        let bytes = rmp_serde::to_vec(data).unwrap_or_default();
        let len = bytes.len() as i32;
        let ptr = plugin_alloc(len);

        if ptr != 0 && len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
            }
        }

        pack_ptr_len(ptr, len)
    }

    /// Deserialize data from a raw pointer and length
    ///
    /// # Safety
    /// The pointer must be valid and point to `len` bytes of valid MessagePack data.
    pub unsafe fn deserialize_from_ptr<T: serde::de::DeserializeOwned>(
        ptr: i32,
        len: i32,
    ) -> Option<T> {
        if ptr == 0 || len <= 0 {
            return None;
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        rmp_serde::from_slice(slice).ok()
    }
}

/// Macro to export all required plugin functions
///
/// Generates `plugin_create`, `plugin_load`, `plugin_unload`, `plugin_show`,
/// `plugin_hide`, `plugin_visible`, `plugin_alloc` and `plugin_dealloc`.
/// Status-returning exports use 0 for success.
#[macro_export]
macro_rules! export_plugin {
    ($plugin:ty) => {
        static __PLUGRT_INSTANCE: ::std::sync::Mutex<::core::option::Option<$plugin>> =
            ::std::sync::Mutex::new(::core::option::Option::None);

        fn __plugrt_with<R>(f: impl FnOnce(&mut $plugin) -> R) -> ::core::option::Option<R> {
            let mut guard = match __PLUGRT_INSTANCE.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.as_mut().map(f)
        }

        #[no_mangle]
        pub extern "C" fn plugin_create() -> i32 {
            match <$plugin as $crate::Plugin>::create() {
                Ok(plugin) => {
                    let mut guard = match __PLUGRT_INSTANCE.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *guard = Some(plugin);
                    0
                }
                Err(_) => 1,
            }
        }

        #[no_mangle]
        pub extern "C" fn plugin_load(ctx_ptr: i32, ctx_len: i32) -> i64 {
            let ctx: Option<$crate::LoadContext> =
                unsafe { $crate::memory::deserialize_from_ptr(ctx_ptr, ctx_len) };
            let response = match ctx {
                Some(ctx) => __plugrt_with(|plugin| $crate::dispatch_load(plugin, &ctx))
                    .unwrap_or_else(|| {
                        $crate::LoadResponse::failed(Vec::new(), "plugin was not created")
                    }),
                None => $crate::LoadResponse::failed(Vec::new(), "invalid load context"),
            };
            $crate::memory::serialize_and_return(&response)
        }

        #[no_mangle]
        pub extern "C" fn plugin_unload() -> i32 {
            match __plugrt_with(|plugin| <$plugin as $crate::Plugin>::unload(plugin)) {
                Some(Ok(())) => 0,
                _ => 1,
            }
        }

        #[no_mangle]
        pub extern "C" fn plugin_show() {
            __plugrt_with(|plugin| <$plugin as $crate::Plugin>::show(plugin));
        }

        #[no_mangle]
        pub extern "C" fn plugin_hide() {
            __plugrt_with(|plugin| <$plugin as $crate::Plugin>::hide(plugin));
        }

        #[no_mangle]
        pub extern "C" fn plugin_visible() -> i32 {
            __plugrt_with(|plugin| <$plugin as $crate::Plugin>::visible(plugin)).unwrap_or(false)
                as i32
        }

        #[no_mangle]
        pub extern "C" fn plugin_alloc(size: i32) -> i32 {
            $crate::memory::plugin_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn plugin_dealloc(ptr: i32, size: i32) {
            $crate::memory::plugin_dealloc(ptr, size)
        }
    };
}
