//! Wasm execution of plugin modules.
//!
//! Every module runs in its own `Store<UnitState>`. The main unit is
//! instantiated against the host linker; imports from any namespace other
//! than `host` and `sandbox` name another unit of the module's
//! [`LoadContext`] and are bound to lazy trampolines. The first call through
//! a trampoline loads, rewrites and instantiates that unit in the same
//! store; a unit that cannot be found traps with `UnitNotFound` then, not
//! at load time.

mod host_fns;
mod wasm_module;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use wasmtime::{AsContextMut, Caller, Engine, ExternType, Instance, Linker, Module};

use modhost_db::SessionFactory;
use modhost_types::abi::{HOST_NAMESPACE, SANDBOX_NAMESPACE};
use modhost_types::Connection;

use crate::error::{HostError, SandboxFault};
use crate::limits::TrackingLimiter;
use crate::load_context::LoadContext;
use crate::logger::ModuleLogger;
use crate::mediator::{ModuleToken, SandboxFile, SandboxMediator};

pub use host_fns::host_linker;
pub use wasm_module::WasmModule;

/// Creates the engine shared by every module store.
pub fn create_engine() -> Result<Engine, HostError> {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    Engine::new(&config).map_err(|e| HostError::Engine(e.to_string()))
}

/// A file handle held by guest code.
#[derive(Debug, Clone)]
pub(crate) enum FileHandle {
    /// Opened through the unmediated primitive.
    Plain(PathBuf),
    /// Handed out by the mediator.
    Confined(SandboxFile),
}

/// Per-store data visible to host functions.
pub struct UnitState {
    pub(crate) module: String,
    pub(crate) token: ModuleToken,
    pub(crate) context: Arc<LoadContext>,
    pub(crate) mediator: Arc<SandboxMediator>,
    pub(crate) linker: Arc<Linker<UnitState>>,
    pub(crate) main_logger: Arc<ModuleLogger>,
    /// Instantiated units by dotted name.
    pub(crate) instances: HashMap<String, Instance>,
    pub(crate) files: HashMap<i32, FileHandle>,
    pub(crate) loggers: HashMap<i32, Arc<ModuleLogger>>,
    next_handle: i32,
    /// Connection of the request being dispatched, if any.
    pub(crate) connection: Option<(i32, Arc<dyn Connection>)>,
    /// The module's persistence tenant while it is running.
    pub(crate) persistence: Option<Arc<SessionFactory>>,
    pub limiter: TrackingLimiter,
}

impl UnitState {
    pub(crate) fn new(
        context: Arc<LoadContext>,
        mediator: Arc<SandboxMediator>,
        linker: Arc<Linker<UnitState>>,
        main_logger: Arc<ModuleLogger>,
        limiter: TrackingLimiter,
    ) -> Self {
        Self {
            module: context.module_name().to_string(),
            token: context.token(),
            context,
            mediator,
            linker,
            main_logger,
            instances: HashMap::new(),
            files: HashMap::new(),
            loggers: HashMap::new(),
            next_handle: 1,
            connection: None,
            persistence: None,
            limiter,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn token(&self) -> ModuleToken {
        self.token
    }

    fn next_handle(&mut self) -> i32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    pub(crate) fn insert_file(&mut self, file: FileHandle) -> i32 {
        let handle = self.next_handle();
        self.files.insert(handle, file);
        handle
    }

    pub(crate) fn insert_logger(&mut self, logger: Arc<ModuleLogger>) -> i32 {
        let handle = self.next_handle();
        self.loggers.insert(handle, logger);
        handle
    }

    /// Units instantiated so far, including the main unit.
    pub fn loaded_units(&self) -> Vec<String> {
        let mut units: Vec<String> = self.instances.keys().cloned().collect();
        units.sort();
        units
    }
}

fn is_host_namespace(namespace: &str) -> bool {
    namespace == HOST_NAMESPACE || namespace == SANDBOX_NAMESPACE
}

/// Instantiates `module` with its cross-unit imports bound to trampolines.
pub(crate) fn instantiate_unit(
    mut store: impl AsContextMut<Data = UnitState>,
    base: &Linker<UnitState>,
    module: &Module,
) -> wasmtime::Result<Instance> {
    let mut linker = base.clone();
    linker.allow_shadowing(true);

    for import in module.imports() {
        let namespace = import.module();
        if is_host_namespace(namespace) {
            continue;
        }
        let ExternType::Func(ty) = import.ty() else {
            return Err(wasmtime::Error::msg(format!(
                "unit import {namespace}::{} is not a function",
                import.name()
            )));
        };
        let unit = namespace.to_string();
        let field = import.name().to_string();
        linker.func_new(namespace, import.name(), ty, move |mut caller, params, results| {
            let instance = resolve_unit(&mut caller, &unit)?;
            let func = instance.get_func(&mut caller, &field).ok_or_else(|| {
                wasmtime::Error::new(SandboxFault::UnitNotFound {
                    unit: format!("{unit}::{field}"),
                })
            })?;
            func.call(&mut caller, params, results)
        })?;
    }

    linker.instantiate(store.as_context_mut(), module)
}

/// The instance of `unit` in the caller's store, loading it on first use.
fn resolve_unit(caller: &mut Caller<'_, UnitState>, unit: &str) -> wasmtime::Result<Instance> {
    if let Some(instance) = caller.data().instances.get(unit) {
        return Ok(*instance);
    }

    let context = Arc::clone(&caller.data().context);
    let module = context.unit(unit).map_err(|e| match e {
        HostError::UnitNotFound { .. } | HostError::ContextReleased(_) => {
            wasmtime::Error::new(SandboxFault::UnitNotFound {
                unit: unit.to_string(),
            })
        }
        other => wasmtime::Error::msg(other.to_string()),
    })?;
    let linker = Arc::clone(&caller.data().linker);
    let instance = instantiate_unit(&mut *caller, &linker, &module)?;
    tracing::debug!(module = %caller.data().module, unit = %unit, "Unit instantiated on first use");
    caller.data_mut().instances.insert(unit.to_string(), instance);
    Ok(instance)
}
