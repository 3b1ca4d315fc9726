//! Request and response envelopes.
//!
//! Requests are JSON objects carrying a `moduleAddress` that names the target
//! module, an optional `id` correlation field and module-defined payload
//! fields. Responses carry a status, a payload and the echoed `id`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Correlation id used when a request did not carry one.
pub const UNSPECIFIED_ID: &str = "non-specified";

/// An inbound, addressed request.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    value: Value,
}

impl Envelope {
    /// Parses a raw transport message.
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(Self {
            value: serde_json::from_str(text)?,
        })
    }

    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    /// Target module, if the message is addressed at all.
    pub fn module_address(&self) -> Option<&str> {
        self.value.get("moduleAddress").and_then(Value::as_str)
    }

    /// The request's correlation id, or [`UNSPECIFIED_ID`].
    pub fn correlation_id(&self) -> String {
        match self.value.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => UNSPECIFIED_ID.to_string(),
            Some(other) => other.to_string(),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Outcome status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Ok,
    Failed,
    Pending,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::Pending => "PENDING",
        })
    }
}

/// Reply sent back over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Response {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            payload,
            id: None,
        }
    }

    pub fn pending(payload: Value) -> Self {
        Self {
            status: ResponseStatus::Pending,
            payload,
            id: None,
        }
    }

    /// A `FAILED` response whose payload is `{"reason": reason}`.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            payload: json!({ "reason": reason.into() }),
            id: None,
        }
    }

    /// Stamps the correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The `reason` field of a failed response.
    pub fn reason(&self) -> Option<&str> {
        self.payload.get("reason").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
