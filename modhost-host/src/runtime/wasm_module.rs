//! [`Module`] implementation backed by a wasm plugin.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use wasmtime::{Engine, Instance, Linker, Store, WasmParams, WasmResults};

use modhost_db::{EntityDescriptor, SchemaSource, SessionFactory};
use modhost_types::abi::{exports, unpack_ptr_len};
use modhost_types::{Connection, Envelope, ModuleKind, Response};

use super::{instantiate_unit, UnitState};
use crate::error::HostError;
use crate::limits::{ResourceLimits, TrackingLimiter};
use crate::load_context::LoadContext;
use crate::logger::ModuleLogger;
use crate::mediator::SandboxMediator;
use crate::module::Module;

/// Handle passed to `mx_dispatch` for the connection being served.
const DISPATCH_CONNECTION: i32 = 1;

struct Guest {
    store: Store<UnitState>,
    instance: Instance,
}

/// A plugin whose main unit runs in its own wasm store.
pub struct WasmModule {
    name: String,
    main_unit: String,
    kind: ModuleKind,
    auto_start: bool,
    entities: Vec<EntityDescriptor>,
    logger: Arc<ModuleLogger>,
    context: Arc<LoadContext>,
    fuel_per_call: u64,
    guest: Mutex<Guest>,
}

impl WasmModule {
    /// Instantiates `main_unit` of `context` and reads the module's static
    /// exports (`mx_kind`, `mx_auto_start`, `mx_entities`).
    pub fn instantiate(
        engine: &Engine,
        linker: Arc<Linker<UnitState>>,
        context: Arc<LoadContext>,
        mediator: Arc<SandboxMediator>,
        main_unit: &str,
        limits: &ResourceLimits,
    ) -> Result<Self, HostError> {
        let name = context.module_name().to_string();
        let invalid = |message: String| HostError::InvalidGuest {
            module: name.clone(),
            message,
        };

        let unit = context.unit(main_unit)?;
        let logger = ModuleLogger::for_module(&name, mediator.log_dir(&name).as_deref());
        let state = UnitState::new(
            Arc::clone(&context),
            mediator,
            Arc::clone(&linker),
            Arc::clone(&logger),
            TrackingLimiter::new(limits.max_memory_bytes),
        );

        let mut store = Store::new(engine, state);
        store.set_fuel(limits.fuel_per_call).ok();
        store.limiter(|s| &mut s.limiter);

        let instance = instantiate_unit(&mut store, &linker, &unit).map_err(|e| invalid(format!("{e:#}")))?;
        if instance.get_memory(&mut store, exports::MEMORY).is_none() {
            return Err(invalid("main unit does not export memory".into()));
        }
        store.data_mut().instances.insert(main_unit.to_string(), instance);

        let mut guest = Guest { store, instance };
        let kind = guest
            .call_optional::<(), i32>(exports::KIND, (), limits.fuel_per_call)
            .map_err(|e| HostError::crashed(&name, exports::KIND, &e))?
            .map_or(ModuleKind::RequestResponse, ModuleKind::from_abi);
        let auto_start = guest
            .call_optional::<(), i32>(exports::AUTO_START, (), limits.fuel_per_call)
            .map_err(|e| HostError::crashed(&name, exports::AUTO_START, &e))?
            .is_none_or(|flag| flag != 0);
        let entities = match guest
            .call_optional::<(), i64>(exports::ENTITIES, (), limits.fuel_per_call)
            .map_err(|e| HostError::crashed(&name, exports::ENTITIES, &e))?
        {
            Some(packed) if packed != 0 => {
                let list = guest.read_packed(packed).map_err(|e| invalid(format!("{e:#}")))?;
                EntityDescriptor::parse_list(&String::from_utf8_lossy(&list))
            }
            _ => Vec::new(),
        };

        info!(module = %name, unit = %main_unit, kind = ?kind, auto_start, entities = entities.len(), "Wasm module instantiated");
        Ok(Self {
            name,
            main_unit: main_unit.to_string(),
            kind,
            auto_start,
            entities,
            logger,
            context,
            fuel_per_call: limits.fuel_per_call,
            guest: Mutex::new(guest),
        })
    }

    pub fn main_unit(&self) -> &str {
        &self.main_unit
    }

    pub fn context(&self) -> &Arc<LoadContext> {
        &self.context
    }

    /// Units instantiated in this module's store so far.
    pub fn loaded_units(&self) -> Vec<String> {
        self.guest.lock().store.data().loaded_units()
    }

    /// The session factory guest code currently reaches through `host.db_*`.
    pub fn persistence(&self) -> Option<Arc<SessionFactory>> {
        self.guest.lock().store.data().persistence.clone()
    }

    /// Calls a `() -> i32` lifecycle export; missing exports are no-ops and a
    /// non-zero status is an error.
    fn lifecycle(&self, export: &str) -> Result<(), HostError> {
        let status = self
            .guest
            .lock()
            .call_optional::<(), i32>(export, (), self.fuel_per_call)
            .map_err(|e| HostError::crashed(&self.name, export, &e))?;
        match status {
            None | Some(0) => Ok(()),
            Some(code) => Err(HostError::ModuleCrashed {
                module: self.name.clone(),
                message: format!("{export}() returned status {code}"),
            }),
        }
    }
}

impl Guest {
    /// Calls `export` if the unit has it. A present export of the wrong
    /// type is an error.
    fn call_optional<P, R>(&mut self, export: &str, params: P, fuel: u64) -> wasmtime::Result<Option<R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let Some(func) = self.instance.get_func(&mut self.store, export) else {
            return Ok(None);
        };
        let typed = func.typed::<P, R>(&self.store)?;
        self.store.set_fuel(fuel).ok();
        typed.call(&mut self.store, params).map(Some)
    }

    fn call_required<P, R>(&mut self, export: &str, params: P, fuel: u64) -> wasmtime::Result<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        self.call_optional(export, params, fuel)?
            .ok_or_else(|| wasmtime::Error::msg(format!("main unit does not export {export}")))
    }

    /// Copies `bytes` into guest memory through `mx_alloc`.
    fn write_input(&mut self, bytes: &[u8], fuel: u64) -> wasmtime::Result<(i32, i32)> {
        let len = i32::try_from(bytes.len()).map_err(|_| wasmtime::Error::msg("input too large"))?;
        let ptr: i32 = self.call_required(exports::ALLOC, len, fuel)?;
        let memory = self.memory()?;
        memory.write(&mut self.store, ptr as u32 as usize, bytes)?;
        Ok((ptr, len))
    }

    fn read_packed(&mut self, packed: i64) -> wasmtime::Result<Vec<u8>> {
        let (ptr, len) = unpack_ptr_len(packed);
        let memory = self.memory()?;
        let mut buf = vec![0u8; len as usize];
        memory.read(&self.store, ptr as usize, &mut buf)?;
        Ok(buf)
    }

    fn memory(&mut self) -> wasmtime::Result<wasmtime::Memory> {
        self.instance
            .get_memory(&mut self.store, exports::MEMORY)
            .ok_or_else(|| wasmtime::Error::msg("main unit does not export memory"))
    }

    fn memory_bytes(&mut self) -> u64 {
        match self.memory() {
            Ok(memory) => memory.data_size(&self.store) as u64,
            Err(_) => 0,
        }
    }
}

impl Module for WasmModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn init(&self) -> Result<(), HostError> {
        self.guest
            .lock()
            .call_optional::<(), ()>(exports::INIT, (), self.fuel_per_call)
            .map(|_| ())
            .map_err(|e| HostError::InitFailed {
                module: self.name.clone(),
                message: format!("{e:#}"),
            })
    }

    fn start(&self) -> Result<(), HostError> {
        self.lifecycle(exports::START).map_err(|e| HostError::StartFailed {
            module: self.name.clone(),
            message: e.to_string(),
        })
    }

    fn stop(&self) -> Result<(), HostError> {
        self.lifecycle(exports::STOP)
    }

    fn pause(&self) -> Result<(), HostError> {
        self.lifecycle(exports::PAUSE)
    }

    fn handle_request(&self, request: &Envelope) -> Result<Option<Response>, HostError> {
        let input = serde_json::to_vec(request.value())?;
        let mut guest = self.guest.lock();
        let fuel = self.fuel_per_call;
        let crashed = |e: wasmtime::Error| HostError::crashed(&self.name, exports::HANDLE, &e);

        let (ptr, len) = guest.write_input(&input, fuel).map_err(crashed)?;
        let packed: i64 = guest
            .call_required(exports::HANDLE, (ptr, len), fuel)
            .map_err(crashed)?;
        if packed == 0 {
            return Ok(None);
        }
        let output = guest.read_packed(packed).map_err(crashed)?;
        let response = serde_json::from_slice::<Response>(&output).map_err(|e| HostError::InvalidGuest {
            module: self.name.clone(),
            message: format!("response is not a valid envelope: {e}"),
        })?;
        Ok(Some(response))
    }

    fn handle_dispatched(&self, connection: Arc<dyn Connection>, raw: &str) -> Result<(), HostError> {
        let mut guest = self.guest.lock();
        let fuel = self.fuel_per_call;
        let crashed = |e: wasmtime::Error| HostError::crashed(&self.name, exports::DISPATCH, &e);

        let (ptr, len) = guest.write_input(raw.as_bytes(), fuel).map_err(crashed)?;
        guest.store.data_mut().connection = Some((DISPATCH_CONNECTION, connection));
        let result = guest.call_required::<(i32, i32, i32), ()>(exports::DISPATCH, (DISPATCH_CONNECTION, ptr, len), fuel);
        guest.store.data_mut().connection = None;
        result.map_err(crashed)
    }

    fn entities(&self) -> Vec<EntityDescriptor> {
        self.entities.clone()
    }

    fn auto_start(&self) -> bool {
        self.auto_start
    }

    fn attach_persistence(&self, factory: Arc<SessionFactory>) {
        debug!(module = %self.name, "Persistence attached");
        self.guest.lock().store.data_mut().persistence = Some(factory);
    }

    fn detach_persistence(&self) {
        if self.guest.lock().store.data_mut().persistence.take().is_some() {
            debug!(module = %self.name, "Persistence detached");
        }
    }

    fn logger(&self) -> Arc<ModuleLogger> {
        Arc::clone(&self.logger)
    }

    fn schema_source(&self) -> Option<Arc<dyn SchemaSource>> {
        Some(Arc::clone(&self.context) as Arc<dyn SchemaSource>)
    }

    fn memory_footprint(&self) -> u64 {
        self.guest.lock().memory_bytes()
    }
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("name", &self.name)
            .field("main_unit", &self.main_unit)
            .field("kind", &self.kind)
            .finish()
    }
}
