//! Module registry and dispatcher.
//!
//! Owns every registered module, drives lifecycle transitions, keeps
//! per-module metrics and routes addressed requests. The name map is the
//! only shared structure; it is held just long enough to look an entry up,
//! never across a call into module code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use modhost_db::PersistenceProvisioner;
use modhost_types::{
    tenant_key, Connection, Envelope, LifecycleState, MetricsSnapshot, ModuleKind, ModuleMetrics,
    Response, ResponseStatus, UNSPECIFIED_ID,
};

use crate::error::HostError;
use crate::load_context::LoadContext;
use crate::mediator::SandboxMediator;
use crate::module::Module;

struct RegisteredModule {
    module: Arc<dyn Module>,
    state: Mutex<LifecycleState>,
    metrics: Arc<ModuleMetrics>,
    context: Option<Arc<LoadContext>>,
    persistence_attached: AtomicBool,
}

impl RegisteredModule {
    fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn set_state(&self, next: LifecycleState) {
        *self.state.lock() = next;
    }
}

/// Result of a registration that did not fail outright.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// Registered and started.
    Running,
    /// Registered; the module opted out of auto-start.
    Registered,
    /// Registered, but provisioning or start failed; left not running.
    Degraded(HostError),
}

/// What dispatch did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A reply with this status went back on the connection.
    Replied(ResponseStatus),
    /// Handed to a transport-owning module.
    Forwarded,
    /// No `moduleAddress`; nothing was sent.
    Dropped,
}

/// Diagnostics view of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub state: LifecycleState,
    pub kind: ModuleKind,
    pub metrics: MetricsSnapshot,
    /// Units that run without complete sandboxing.
    pub unsandboxed_units: Vec<String>,
}

pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<RegisteredModule>>>,
    mediator: Arc<SandboxMediator>,
    provisioner: Arc<PersistenceProvisioner>,
}

impl ModuleRegistry {
    pub fn new(mediator: Arc<SandboxMediator>, provisioner: Arc<PersistenceProvisioner>) -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            mediator,
            provisioner,
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<RegisteredModule>, HostError> {
        self.modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::ModuleNotFound(name.to_string()))
    }

    // ================================================================
    // Registration
    // ================================================================

    /// Registers `module`, replacing (and retiring) any module of the same
    /// name. `context` is released when the module is unregistered.
    ///
    /// A different name that maps to the same sandbox or database directory
    /// as a registered module is refused with [`HostError::NameCollision`].
    pub fn register(
        &self,
        module: Arc<dyn Module>,
        context: Option<Arc<LoadContext>>,
    ) -> Result<RegisterOutcome, HostError> {
        let name = module.name().to_string();
        let entry = Arc::new(RegisteredModule {
            module,
            state: Mutex::new(LifecycleState::Unregistered),
            metrics: Arc::new(ModuleMetrics::new()),
            context,
            persistence_attached: AtomicBool::new(false),
        });

        let previous = {
            let mut modules = self.modules.write();
            // Equal sandbox keys imply equal tenant keys.
            let key = tenant_key(&name);
            if let Some(existing) = modules.keys().find(|other| **other != name && tenant_key(other) == key) {
                let existing = existing.clone();
                drop(modules);
                if let Some(context) = &entry.context {
                    context.release();
                }
                warn!(module = %name, existing = %existing, "Module name collides with a registered module");
                return Err(HostError::NameCollision { module: name, existing });
            }
            modules.insert(name.clone(), Arc::clone(&entry))
        };
        if let Some(previous) = previous {
            info!(module = %name, "Replacing registered module");
            self.retire(&name, &previous);
        }

        if let Err(e) = entry.module.init() {
            self.remove_if_current(&name, &entry);
            if let Some(context) = &entry.context {
                context.release();
            }
            warn!(module = %name, error = %e, "Module initialization failed");
            return Err(match e {
                e @ HostError::InitFailed { .. } => e,
                other => HostError::InitFailed {
                    module: name,
                    message: other.to_string(),
                },
            });
        }
        entry.set_state(LifecycleState::Registered);
        self.mediator.activate(&name, entry.module.logger());

        let entities = entry.module.entities();
        info!(module = %name, entities = entities.len(), kind = ?entry.module.kind(), "Module registered");

        if !entry.module.auto_start() {
            info!(module = %name, "Auto-start disabled");
            return Ok(RegisterOutcome::Registered);
        }
        match self.start_entry(&name, &entry) {
            Ok(()) => Ok(RegisterOutcome::Running),
            Err(e) => {
                warn!(module = %name, error = %e, "Auto-start failed, module left registered");
                Ok(RegisterOutcome::Degraded(e))
            }
        }
    }

    fn remove_if_current(&self, name: &str, entry: &Arc<RegisteredModule>) {
        let mut modules = self.modules.write();
        if modules.get(name).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            modules.remove(name);
        }
    }

    /// Removes `name`, stopping it first and releasing its load context.
    pub fn unregister(&self, name: &str) -> Result<(), HostError> {
        let entry = self
            .modules
            .write()
            .remove(name)
            .ok_or_else(|| HostError::ModuleNotFound(name.to_string()))?;
        self.retire(name, &entry);
        info!(module = %name, "Module unregistered");
        Ok(())
    }

    /// Tears down an entry already removed from (or replaced in) the map.
    fn retire(&self, name: &str, entry: &RegisteredModule) {
        if matches!(
            entry.state(),
            LifecycleState::Running | LifecycleState::Paused | LifecycleState::Registered
        ) {
            self.stop_entry(name, entry);
        }
        self.mediator.deactivate(name);
        entry.module.detach_persistence();
        self.provisioner.close(name);
        if let Some(context) = &entry.context {
            context.release();
        }
        entry.set_state(LifecycleState::Unregistered);
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    pub fn start(&self, name: &str) -> Result<(), HostError> {
        let entry = self.entry(name)?;
        if entry.state() == LifecycleState::Running {
            debug!(module = %name, "Already running");
            return Ok(());
        }
        self.start_entry(name, &entry)
    }

    fn start_entry(&self, name: &str, entry: &RegisteredModule) -> Result<(), HostError> {
        entry.state().transition(LifecycleState::Running)?;

        if !entry.persistence_attached.load(Ordering::SeqCst) {
            let source = entry.module.schema_source();
            let factory = self.provisioner.session_factory(
                name,
                &entry.module.entities(),
                source.as_deref(),
            )?;
            entry.module.attach_persistence(factory);
            entry.persistence_attached.store(true, Ordering::SeqCst);
        }
        if !self.mediator.is_active(name) {
            self.mediator.activate(name, entry.module.logger());
        }

        entry.module.start()?;
        entry.set_state(LifecycleState::Running);
        info!(module = %name, "Module started");
        Ok(())
    }

    /// Stops `name`. Errors raised by the module's own stop logic are logged
    /// and swallowed.
    pub fn stop(&self, name: &str) -> Result<(), HostError> {
        let entry = self.entry(name)?;
        if entry.state() == LifecycleState::Stopped {
            debug!(module = %name, "Already stopped");
            return Ok(());
        }
        entry.state().transition(LifecycleState::Stopped)?;
        self.stop_entry(name, &entry);
        Ok(())
    }

    fn stop_entry(&self, name: &str, entry: &RegisteredModule) {
        if let Err(e) = entry.module.stop() {
            warn!(module = %name, error = %e, "Module stop failed");
        }
        self.mediator.deactivate(name);
        entry.module.detach_persistence();
        self.provisioner.close(name);
        entry.persistence_attached.store(false, Ordering::SeqCst);
        entry.set_state(LifecycleState::Stopped);
        info!(module = %name, "Module stopped");
    }

    pub fn pause(&self, name: &str) -> Result<(), HostError> {
        let entry = self.entry(name)?;
        entry.state().transition(LifecycleState::Paused)?;
        entry.module.pause()?;
        entry.set_state(LifecycleState::Paused);
        info!(module = %name, "Module paused");
        Ok(())
    }

    /// Unregisters every module and closes all persistence.
    pub fn shutdown(&self) {
        let entries: Vec<(String, Arc<RegisteredModule>)> = self.modules.write().drain().collect();
        for (name, entry) in &entries {
            self.retire(name, entry);
        }
        self.provisioner.shutdown_all();
        info!(modules = entries.len(), "Registry shut down");
    }

    // ================================================================
    // Dispatch
    // ================================================================

    /// Routes one raw inbound message. Never fails: every problem becomes a
    /// `FAILED` reply on `connection`.
    pub fn dispatch(&self, connection: Arc<dyn Connection>, raw: &str) -> DispatchOutcome {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reply = Response::error(format!("Malformed request: {e}")).with_id(UNSPECIFIED_ID);
                return self.reply(connection.as_ref(), None, reply);
            }
        };
        let id = envelope.correlation_id();
        let Some(address) = envelope.module_address() else {
            debug!(connection = %connection.id(), "Message without moduleAddress dropped");
            return DispatchOutcome::Dropped;
        };

        let Ok(entry) = self.entry(address) else {
            warn!(module = %address, "Request for unknown module");
            let reply = Response::error(format!("Unknown module: {address}")).with_id(id);
            return self.reply(connection.as_ref(), None, reply);
        };
        entry.metrics.record_received(raw.len());

        let outcome = match entry.module.kind() {
            ModuleKind::RequestResponse => {
                let reply = match entry.module.handle_request(&envelope) {
                    Ok(Some(response)) => response,
                    Ok(None) => Response::error(format!("Unexpected Module Error occurred: {address}")),
                    Err(e) => {
                        warn!(module = %address, error = %e, "Request handler failed");
                        Response::error(e.to_string())
                    }
                };
                self.reply(connection.as_ref(), Some(&entry.metrics), reply.with_id(id))
            }
            ModuleKind::TransportOwning => {
                if let Err(e) = entry.module.handle_dispatched(Arc::clone(&connection), raw) {
                    warn!(module = %address, error = %e, "Dispatched handler failed");
                }
                DispatchOutcome::Forwarded
            }
        };

        entry.metrics.sample_memory(entry.module.memory_footprint());
        outcome
    }

    fn reply(
        &self,
        connection: &dyn Connection,
        metrics: Option<&ModuleMetrics>,
        response: Response,
    ) -> DispatchOutcome {
        let status = response.status;
        match response.to_json() {
            Ok(text) => {
                if let Some(metrics) = metrics {
                    metrics.record_sent(text.len());
                }
                if let Err(e) = connection.send(&text) {
                    warn!(connection = %connection.id(), error = %e, "Failed to send reply");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode reply"),
        }
        DispatchOutcome::Replied(status)
    }

    // ================================================================
    // Queries
    // ================================================================

    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    pub fn module(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.read().get(name).map(|e| Arc::clone(&e.module))
    }

    pub fn context(&self, name: &str) -> Option<Arc<LoadContext>> {
        self.modules.read().get(name).and_then(|e| e.context.clone())
    }

    pub fn module_state(&self, name: &str) -> Option<LifecycleState> {
        self.modules.read().get(name).map(|e| e.state())
    }

    pub fn metrics_snapshot(&self, name: &str) -> Option<MetricsSnapshot> {
        self.modules.read().get(name).map(|e| e.metrics.snapshot())
    }

    pub fn all_metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        let mut all: Vec<_> = self
            .modules
            .read()
            .iter()
            .map(|(name, e)| (name.clone(), e.metrics.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Every module, sorted by name.
    pub fn list_modules(&self) -> Vec<ModuleInfo> {
        let mut infos: Vec<ModuleInfo> = self
            .modules
            .read()
            .iter()
            .map(|(name, e)| ModuleInfo {
                name: name.clone(),
                state: e.state(),
                kind: e.module.kind(),
                metrics: e.metrics.snapshot(),
                unsandboxed_units: e
                    .context
                    .as_ref()
                    .map(|c| c.unsandboxed_units())
                    .unwrap_or_default(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn mediator(&self) -> &Arc<SandboxMediator> {
        &self.mediator
    }

    pub fn provisioner(&self) -> &Arc<PersistenceProvisioner> {
        &self.provisioner
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
