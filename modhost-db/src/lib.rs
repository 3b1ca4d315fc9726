//! Persistence tenants for plugin modules.
//!
//! Every module gets its own SQLite database at
//! `<database_root>/<tenant key>/global.db`, one r2d2 connection pool on it
//! and one [`SessionFactory`] that knows the module's entity schemas. Both
//! are built at most once per tenant, on first use, and cached until the
//! module is stopped.
//!
//! Entity schemas may live inside the plugin package; they are found through
//! the [`SchemaSource`] the caller passes in, never through ambient state.
//! Guest code reaches its tenant through [`Session::execute_json`] and
//! [`Session::query_json`].

mod error;
mod provisioner;
mod rows;
mod schema;
mod session;

pub use error::{PersistenceError, PersistenceResult};
pub use provisioner::{PersistenceProvisioner, ProvisionerConfig, ProvisionerStats, DATABASE_FILE};
pub use schema::{EntityDescriptor, SchemaSource, SCHEMA_DIR};
pub use session::{DbPool, Session, SessionFactory};
