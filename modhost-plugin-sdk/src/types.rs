//! SDK types for plugin authors. Mirrors the host's request/response
//! envelopes and ABI values with ergonomic Rust APIs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Correlation id the host reports for requests that carried none.
pub const UNSPECIFIED_ID: &str = "non-specified";

// ---- Requests ----

/// An inbound request, as the host dispatched it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    value: Value,
}

impl Request {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            value: serde_json::from_slice(bytes)?,
        })
    }

    pub fn module_address(&self) -> Option<&str> {
        self.value.get("moduleAddress").and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.value.get("id").and_then(Value::as_str)
    }

    /// A payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.value.get(field)
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Deserializes the whole request into a typed struct.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

// ---- Replies ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Failed,
    Pending,
}

/// A reply; the host stamps the correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    #[serde(default)]
    pub payload: Value,
}

impl Reply {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn pending(payload: Value) -> Self {
        Self {
            status: Status::Pending,
            payload,
        }
    }

    /// `FAILED` with `{"reason": reason}`.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            payload: json!({ "reason": reason.into() }),
        }
    }

    pub fn to_json(&self) -> String {
        // A Value payload always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"status":"FAILED","payload":{}}"#.to_string())
    }
}

// ---- Errors ----

/// Failure a plugin reports from a lifecycle hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
    pub code: i32,
    pub message: String,
}

impl PluginError {
    /// Error with status code 1.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(1, message)
    }

    /// `code` is what the host sees; it must be non-zero.
    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: if code == 0 { 1 } else { code },
            message: message.into(),
        }
    }
}

// ---- Logging ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    System,
    SubSystem,
    Module,
}

impl LogCategory {
    pub const fn abi(self) -> i32 {
        match self {
            Self::System => 0,
            Self::SubSystem => 1,
            Self::Module => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn abi(self) -> i32 {
        match self {
            Self::Error => 0,
            Self::Warn => 1,
            Self::Info => 2,
            Self::Debug => 3,
            Self::Trace => 4,
        }
    }
}
