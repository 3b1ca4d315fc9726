#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use modhost_db::{PersistenceProvisioner, ProvisionerConfig};
use modhost_host::{
    HostError, LogCategory, Module, ModuleLogger, ModuleRegistry, SandboxMediator,
};
use modhost_types::{Envelope, Response};

/// Answers every request with `OK` and the request itself as payload.
pub struct EchoModule {
    name: String,
    logger: Arc<ModuleLogger>,
}

impl EchoModule {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            logger: ModuleLogger::standalone(name, LogCategory::Module, "echo"),
        })
    }
}

impl Module for EchoModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), HostError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), HostError> {
        Ok(())
    }

    fn handle_request(&self, request: &Envelope) -> Result<Option<Response>, HostError> {
        Ok(Some(Response::ok(request.value().clone())))
    }

    fn logger(&self) -> Arc<ModuleLogger> {
        Arc::clone(&self.logger)
    }
}

/// A registry rooted in `dir` with the given echo modules registered.
pub fn registry_with(dir: &Path, modules: &[&str]) -> Arc<ModuleRegistry> {
    let mediator = Arc::new(SandboxMediator::new(dir.join("data"), false));
    let provisioner = Arc::new(PersistenceProvisioner::new(ProvisionerConfig::new(dir.join("db"))));
    let registry = Arc::new(ModuleRegistry::new(mediator, provisioner));
    for name in modules {
        registry.register(EchoModule::new(name), None).unwrap();
    }
    registry
}
