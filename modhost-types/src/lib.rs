//! Core type definitions for the modhost plugin host.
//!
//! This crate defines the small, engine-agnostic types every other crate
//! in the workspace speaks:
//! - Module names and their filesystem/tenant sanitisation
//! - Lifecycle states and module kinds
//! - Per-module metrics counters
//! - Request/response envelopes and the connection seam
//! - Host ABI names shared between the host and the guest SDK
//!
//! Nothing here touches wasm, SQL or the network.

pub mod abi;
mod connection;
mod envelope;
mod lifecycle;
mod metrics;
mod name;

pub use connection::{Connection, ConnectionError, ConnectionId};
pub use envelope::{Envelope, Response, ResponseStatus, UNSPECIFIED_ID};
pub use lifecycle::{LifecycleState, ModuleKind};
pub use metrics::{MetricsSnapshot, ModuleMetrics};
pub use name::{sandbox_key, tenant_key, ModuleName, UNKNOWN_MODULE};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid connection id: {0}")]
    InvalidConnectionId(#[from] uuid::Error),

    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}
