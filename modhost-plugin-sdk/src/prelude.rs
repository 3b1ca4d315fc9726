//! Everything a plugin usually needs.

pub use crate::types::{LogCategory, LogLevel, PluginError, Reply, Request, Status};
pub use crate::{Plugin, TransportPlugin};

#[cfg(target_arch = "wasm32")]
pub use crate::host::{Connection, Database, File, Logger};

pub use serde_json::json;
