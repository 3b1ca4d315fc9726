//! Error types for the plugin host.

use modhost_db::PersistenceError;
use modhost_package::PackageError;
use thiserror::Error;

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// The host cannot continue.
    Fatal,
    /// One module is affected; it stays registered but not running, or is
    /// skipped at load.
    Degraded,
    /// Worth a log line, nothing else.
    Informational,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("module '{module}' shares storage keys with registered module '{existing}'")]
    NameCollision { module: String, existing: String },

    #[error("policy denied: module '{0}' blocked by policy")]
    PolicyDenied(String),

    #[error("package error: {0}")]
    Package(#[from] PackageError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wasm error: {0}")]
    Wasm(#[from] wasmtime::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Types(#[from] modhost_types::Error),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("unit '{unit}' refused: {reason}")]
    RewriteRejected { unit: String, reason: String },

    #[error("unit '{unit}' not found in load context of '{module}'")]
    UnitNotFound { module: String, unit: String },

    #[error("load context of '{0}' has been released")]
    ContextReleased(String),

    #[error("module '{module}' is not a valid guest: {message}")]
    InvalidGuest { module: String, message: String },

    #[error("module crashed: {module}: {message}")]
    ModuleCrashed { module: String, message: String },

    #[error("module initialization failed: {module}: {message}")]
    InitFailed { module: String, message: String },

    #[error("module start failed: {module}: {message}")]
    StartFailed { module: String, message: String },

    #[error("fetch of {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HostError {
    /// Classifies the error for propagation decisions.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Engine(_) | Self::Config(_) => Severity::Fatal,
            Self::ModuleNotFound(_) | Self::PolicyDenied(_) | Self::Fetch { .. } => {
                Severity::Informational
            }
            _ => Severity::Degraded,
        }
    }

    /// Builds a `ModuleCrashed` from a trap or host-function error, keeping
    /// the sandbox fault text when there is one.
    pub fn crashed(module: &str, call: &str, err: &wasmtime::Error) -> Self {
        let message = match err.downcast_ref::<SandboxFault>() {
            Some(fault) => format!("{call}() failed: {fault}"),
            None => format!("{call}() failed: {err:#}"),
        };
        Self::ModuleCrashed {
            module: module.to_string(),
            message,
        }
    }
}

/// Failure of a mediated filesystem operation.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox violation: module '{module}' may not access '{path}'")]
    Violation { module: String, path: String },

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Payload of a trap raised by a mediated host function.
///
/// Recover it from a call error with `err.downcast_ref::<SandboxFault>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxFault {
    #[error("SandboxViolation: module '{module}' may not access '{path}'")]
    SandboxViolation { module: String, path: String },

    #[error("UnitNotFound: unit '{unit}' cannot be resolved")]
    UnitNotFound { unit: String },

    #[error("ForgedIdentity: token {token} does not belong to the calling module")]
    ForgedIdentity { token: i32 },

    #[error("BadHandle: {kind} handle {handle} is not open")]
    BadHandle { kind: &'static str, handle: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_classification() {
        assert_eq!(HostError::Engine("x".into()).severity(), Severity::Fatal);
        assert_eq!(
            HostError::ModuleNotFound("ghost".into()).severity(),
            Severity::Informational
        );
        assert_eq!(
            HostError::StartFailed {
                module: "a".into(),
                message: "boom".into()
            }
            .severity(),
            Severity::Degraded
        );
    }

    #[test]
    fn crashed_keeps_fault_text() {
        let err = wasmtime::Error::new(SandboxFault::UnitNotFound {
            unit: "com.example.foo.Bar".into(),
        });
        let crashed = HostError::crashed("alpha", "mx_handle", &err);
        assert!(crashed.to_string().contains("UnitNotFound"));
    }
}
