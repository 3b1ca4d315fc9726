//! Guest SDK for building modhost wasm plugins.
//!
//! Plugin authors implement [`Plugin`] (or [`TransportPlugin`] for modules
//! that reply on the connection themselves) and call [`modhost_export!`].
//! The macro generates the `mx_*` exports the host looks for; [`host`]
//! wraps the host imports.
//!
//! # Example
//!
//! (Requires the `wasm32` target; the host imports do not exist natively.)
//!
//! ```ignore
//! use modhost_plugin_sdk::prelude::*;
//!
//! #[derive(Default)]
//! struct Notes {
//!     saved: u32,
//! }
//!
//! impl Plugin for Notes {
//!     fn entities(&self) -> Vec<String> {
//!         vec!["note".into()]
//!     }
//!
//!     fn handle(&mut self, request: Request) -> Option<Reply> {
//!         let title = request.str_field("title")?;
//!         if let Some(file) = File::open(&format!("notes/{title}.txt")) {
//!             file.create();
//!         }
//!         Database.execute("INSERT INTO note (title) VALUES (?1)", &[json!(title)])?;
//!         self.saved += 1;
//!         Some(Reply::ok(json!({ "saved": self.saved })))
//!     }
//! }
//!
//! modhost_plugin_sdk::modhost_export!(Notes);
//! ```

pub mod memory;
pub mod prelude;
pub mod types;

#[cfg(target_arch = "wasm32")]
pub mod host;

pub use types::*;

/// A request/response plugin. The type must also implement `Default`; the
/// exported glue creates the instance on first use.
pub trait Plugin {
    /// Called once after instantiation.
    fn init(&mut self) {}

    fn start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// `false` to be left registered but not started at load.
    fn auto_start(&self) -> bool {
        true
    }

    /// Entity names whose schemas ship in the package as `schema/<name>.sql`.
    fn entities(&self) -> Vec<String> {
        Vec::new()
    }

    /// `None` makes the host answer with a generic failure.
    fn handle(&mut self, request: Request) -> Option<Reply>;
}

/// A plugin that receives raw requests together with their connection.
pub trait TransportPlugin: Plugin {
    #[cfg(target_arch = "wasm32")]
    fn dispatch(&mut self, connection: host::Connection, raw: &str);
}

/// Status code of a lifecycle hook result, as the host expects it.
#[doc(hidden)]
pub fn __status(result: Result<(), PluginError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code,
    }
}

/// Handles one request buffer handed over by the host.
#[doc(hidden)]
pub fn __handle<P: Plugin>(plugin: &mut P, input: &[u8]) -> Option<Reply> {
    match Request::parse(input) {
        Ok(request) => plugin.handle(request),
        Err(e) => Some(Reply::failed(format!("Malformed request: {e}"))),
    }
}

// ---- WASM export macro ----

/// Generate the `mx_*` exports for a plugin type.
///
/// ```ignore
/// // Request/response plugin:
/// modhost_plugin_sdk::modhost_export!(MyPlugin);
///
/// // Plugin replying on the connection itself:
/// modhost_plugin_sdk::modhost_export!(MyPlugin, transport);
/// ```
///
/// The plugin type must implement `Default` and `Plugin`.
#[macro_export]
macro_rules! modhost_export {
    (@common $plugin_ty:ty) => {
        #[cfg(target_arch = "wasm32")]
        mod __modhost_exports {
            use super::*;
            use std::sync::{Mutex, PoisonError};

            static PLUGIN: Mutex<Option<$plugin_ty>> = Mutex::new(None);

            pub(crate) fn with_plugin_mut<F, R>(f: F) -> R
            where
                F: FnOnce(&mut $plugin_ty) -> R,
            {
                let mut guard = PLUGIN.lock().unwrap_or_else(PoisonError::into_inner);
                let plugin = guard.get_or_insert_with(<$plugin_ty>::default);
                f(plugin)
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn mx_alloc(len: usize) -> *mut u8 {
                $crate::memory::alloc(len)
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn mx_init() {
                with_plugin_mut(|p| $crate::Plugin::init(p))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn mx_start() -> i32 {
                with_plugin_mut(|p| $crate::__status($crate::Plugin::start(p)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn mx_stop() -> i32 {
                with_plugin_mut(|p| $crate::__status($crate::Plugin::stop(p)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn mx_pause() -> i32 {
                with_plugin_mut(|p| $crate::__status($crate::Plugin::pause(p)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn mx_auto_start() -> i32 {
                with_plugin_mut(|p| i32::from($crate::Plugin::auto_start(p)))
            }

            #[unsafe(no_mangle)]
            pub extern "C" fn mx_entities() -> i64 {
                let entities = with_plugin_mut(|p| $crate::Plugin::entities(p));
                if entities.is_empty() {
                    return 0;
                }
                $crate::memory::write_output(entities.join(",").into_bytes())
            }
        }
    };

    ($plugin_ty:ty) => {
        $crate::modhost_export!(@common $plugin_ty);

        #[cfg(target_arch = "wasm32")]
        #[unsafe(no_mangle)]
        pub extern "C" fn mx_handle(ptr: *mut u8, len: usize) -> i64 {
            // SAFETY: the host passes back a buffer it got from mx_alloc.
            let input = unsafe { $crate::memory::take_input(ptr, len) };
            let reply = __modhost_exports::with_plugin_mut(|p| $crate::__handle(p, &input));
            match reply {
                Some(reply) => $crate::memory::write_output(reply.to_json().into_bytes()),
                None => 0,
            }
        }
    };

    ($plugin_ty:ty, transport) => {
        $crate::modhost_export!(@common $plugin_ty);

        #[cfg(target_arch = "wasm32")]
        #[unsafe(no_mangle)]
        pub extern "C" fn mx_kind() -> i32 {
            1
        }

        #[cfg(target_arch = "wasm32")]
        #[unsafe(no_mangle)]
        pub extern "C" fn mx_dispatch(conn: i32, ptr: *mut u8, len: usize) {
            // SAFETY: the host passes back a buffer it got from mx_alloc.
            let input = unsafe { $crate::memory::take_input(ptr, len) };
            let raw = String::from_utf8_lossy(&input);
            __modhost_exports::with_plugin_mut(|p| {
                $crate::TransportPlugin::dispatch(p, $crate::host::Connection::from_raw(conn), &raw)
            })
        }
    };
}
