//! Wasm plugin host for modhost.
//!
//! Loads untrusted plugin packages at runtime, rewrites their units so file
//! and console side effects go through the sandbox mediator, gives each
//! plugin its own SQLite tenant and routes addressed requests to it.
//!
//! Each plugin runs in its own `wasmtime::Store` with a memory ceiling, a
//! fuel budget per call, and a load context that only sees its own archives.

mod config;
mod error;
mod host;
mod limits;
mod load_context;
mod logger;
mod materializer;
pub mod mediator;
mod module;
mod policy;
mod registry;
pub mod rewriter;
pub mod runtime;
mod scanner;

pub use config::{HostConfig, LimitsConfig, CONFIG_FILE, DEFAULT_REPOSITORY_URL};
pub use error::{HostError, SandboxError, SandboxFault, Severity};
pub use host::{Host, LoadSummary};
pub use limits::{ResourceLimits, TrackingLimiter};
pub use load_context::{LoadContext, LoadOptions};
pub use logger::{LogCategory, LogLevel, ModuleLogger, PLUGIN_TARGET};
pub use materializer::DependencyMaterializer;
pub use mediator::{ModuleToken, SandboxFile, SandboxMediator};
pub use module::Module;
pub use policy::{PolicyConfig, PolicyEngine, PolicyMode, RewriteFailurePolicy};
pub use registry::{DispatchOutcome, ModuleInfo, ModuleRegistry, RegisterOutcome};
pub use rewriter::{RewriteError, RewriteOutcome, RewriteReport, SandboxRewriter};
pub use runtime::{create_engine, WasmModule};
pub use scanner::{ModuleScanner, PreparedModule};
