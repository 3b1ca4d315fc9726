//! The contract every registered module fulfils.
//!
//! Wasm plugins implement it through [`crate::runtime::WasmModule`]; modules
//! compiled into the host implement it directly.

use std::sync::Arc;

use modhost_db::{EntityDescriptor, SchemaSource, SessionFactory};
use modhost_types::{Connection, Envelope, ModuleKind, Response};

use crate::error::HostError;
use crate::logger::ModuleLogger;

/// A live module instance, owned by the registry for lifecycle purposes.
///
/// Methods take `&self`: the registry calls them from any dispatch thread,
/// and implementations keep their mutable state behind their own locks.
pub trait Module: Send + Sync {
    /// Unique name; the registry key.
    fn name(&self) -> &str;

    fn kind(&self) -> ModuleKind {
        ModuleKind::RequestResponse
    }

    /// Initialisation hook, called once on registration.
    fn init(&self) -> Result<(), HostError> {
        Ok(())
    }

    fn start(&self) -> Result<(), HostError>;

    fn stop(&self) -> Result<(), HostError>;

    fn pause(&self) -> Result<(), HostError> {
        Ok(())
    }

    /// Handles one addressed request. `Ok(None)` means the module produced
    /// no response.
    fn handle_request(&self, request: &Envelope) -> Result<Option<Response>, HostError>;

    /// Receives the raw request when the module owns its transport. The
    /// module replies on `connection` itself.
    fn handle_dispatched(
        &self,
        _connection: Arc<dyn Connection>,
        _raw: &str,
    ) -> Result<(), HostError> {
        Ok(())
    }

    /// Persistence entities to provision for this module.
    fn entities(&self) -> Vec<EntityDescriptor> {
        Vec::new()
    }

    /// `false` opts out of starting at registration.
    fn auto_start(&self) -> bool {
        true
    }

    /// Hands over the module's session factory once it is built.
    fn attach_persistence(&self, _factory: Arc<SessionFactory>) {}

    /// Drops the factory handed over by `attach_persistence`; called on stop.
    fn detach_persistence(&self) {}

    /// The module's bound logger.
    fn logger(&self) -> Arc<ModuleLogger>;

    /// Where entity schemas that live inside the module's own packages are
    /// found.
    fn schema_source(&self) -> Option<Arc<dyn SchemaSource>> {
        None
    }

    /// Current memory footprint in bytes, for metrics.
    fn memory_footprint(&self) -> u64 {
        0
    }
}
