//! The assembled host: engine, linker, mediator, persistence and registry,
//! built once per process and passed to whoever needs them.

use std::sync::Arc;

use tracing::{error, info, warn};
use wasmtime::{Engine, Linker};

use modhost_db::{PersistenceProvisioner, ProvisionerConfig};

use crate::config::HostConfig;
use crate::error::HostError;
use crate::limits::ResourceLimits;
use crate::load_context::LoadOptions;
use crate::materializer::DependencyMaterializer;
use crate::mediator::SandboxMediator;
use crate::module::Module;
use crate::policy::PolicyEngine;
use crate::registry::{ModuleRegistry, RegisterOutcome};
use crate::runtime::{create_engine, host_linker, UnitState, WasmModule};
use crate::scanner::{ModuleScanner, PreparedModule};

/// Result of [`Host::load_all`].
#[derive(Debug, Default)]
pub struct LoadSummary {
    /// Registered and running.
    pub running: Vec<String>,
    /// Registered but not running (opted out or degraded).
    pub registered: Vec<String>,
    /// Prepared but could not be instantiated or initialised.
    pub failed: Vec<String>,
}

pub struct Host {
    config: HostConfig,
    engine: Engine,
    linker: Arc<Linker<UnitState>>,
    mediator: Arc<SandboxMediator>,
    registry: Arc<ModuleRegistry>,
    materializer: DependencyMaterializer,
    policy: PolicyEngine,
    limits: ResourceLimits,
}

impl Host {
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        let engine = create_engine()?;
        let linker = host_linker(&engine).map_err(|e| HostError::Engine(format!("{e:#}")))?;

        let mediator = Arc::new(SandboxMediator::new(&config.data_root, config.save_logs));
        let provisioner = Arc::new(PersistenceProvisioner::new(ProvisionerConfig {
            database_root: config.database_root.clone(),
            max_size: config.pool_max_size,
            min_idle: config.pool_min_idle,
        }));
        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&mediator), provisioner));
        let materializer = DependencyMaterializer::from_config(&config)?;
        let policy = PolicyEngine::with_config(config.policy.clone());
        let limits = ResourceLimits::from(&config.limits);

        info!(
            modules_dir = %config.modules_dir.display(),
            data_root = %config.data_root.display(),
            "Host initialised"
        );
        Ok(Self {
            config,
            engine,
            linker: Arc::new(linker),
            mediator,
            registry,
            materializer,
            policy,
            limits,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn mediator(&self) -> &Arc<SandboxMediator> {
        &self.mediator
    }

    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            rewrite_failure: self.policy.rewrite_failure(),
            compiled_cache: Some(self.config.compiled_cache_dir()),
        }
    }

    pub fn scanner(&self) -> ModuleScanner<'_> {
        ModuleScanner::new(
            &self.config.modules_dir,
            &self.materializer,
            &self.engine,
            &self.mediator,
            &self.policy,
            self.load_options(),
        )
    }

    /// Scans the modules directory and registers everything that loads.
    pub fn load_all(&self) -> Result<LoadSummary, HostError> {
        let mut summary = LoadSummary::default();
        for prepared in self.scanner().scan()? {
            let name = prepared.name.clone();
            match self.load_prepared(prepared) {
                Ok(RegisterOutcome::Running) => summary.running.push(name),
                Ok(RegisterOutcome::Registered | RegisterOutcome::Degraded(_)) => {
                    summary.registered.push(name)
                }
                Err(e) => {
                    error!(module = %name, error = %e, "Module failed to load");
                    summary.failed.push(name);
                }
            }
        }
        info!(
            running = summary.running.len(),
            registered = summary.registered.len(),
            failed = summary.failed.len(),
            "Modules loaded"
        );
        Ok(summary)
    }

    /// Instantiates a prepared module's entry unit and registers it. The load
    /// context is released if instantiation fails.
    pub fn load_prepared(&self, prepared: PreparedModule) -> Result<RegisterOutcome, HostError> {
        let module = match self.instantiate(&prepared) {
            Ok(module) => module,
            Err(e) => {
                prepared.context.release();
                return Err(e);
            }
        };
        self.registry.register(module, Some(prepared.context))
    }

    pub fn instantiate(&self, prepared: &PreparedModule) -> Result<Arc<WasmModule>, HostError> {
        let module = WasmModule::instantiate(
            &self.engine,
            Arc::clone(&self.linker),
            Arc::clone(&prepared.context),
            Arc::clone(&self.mediator),
            &prepared.descriptor.main,
            &self.limits,
        )?;
        Ok(Arc::new(module))
    }

    /// Registers a module compiled into the host.
    pub fn register_builtin(&self, module: Arc<dyn Module>) -> Result<RegisterOutcome, HostError> {
        if !self.policy.is_module_allowed(module.name()) {
            warn!(module = %module.name(), "Built-in module blocked by policy");
            return Err(HostError::PolicyDenied(module.name().to_string()));
        }
        self.registry.register(module, None)
    }

    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}
