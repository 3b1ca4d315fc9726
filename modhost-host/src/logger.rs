//! Named, categorised loggers handed to module code.
//!
//! Every line goes through `tracing` under the `modhost::plugin` target with
//! `module`, `logger` and `category` fields, and is optionally mirrored to a
//! per-logger file inside the module's sandbox.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use modhost_types::{abi, sandbox_key};

/// Tracing target of plugin-originated output.
pub const PLUGIN_TARGET: &str = "modhost::plugin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    System,
    SubSystem,
    Module,
}

impl LogCategory {
    pub fn from_abi(value: i32) -> Self {
        match value {
            abi::CATEGORY_SYSTEM => Self::System,
            abi::CATEGORY_SUBSYSTEM => Self::SubSystem,
            _ => Self::Module,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::SubSystem => "subsystem",
            Self::Module => "module",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// `0` error, `1` warn, `2` info, `3` debug, anything else trace.
    pub fn from_abi(value: i32) -> Self {
        match value {
            0 => Self::Error,
            1 => Self::Warn,
            2 => Self::Info,
            3 => Self::Debug,
            _ => Self::Trace,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// A logger bound to one module (or to the host for the fallback logger).
pub struct ModuleLogger {
    name: String,
    qualified: String,
    module: String,
    category: LogCategory,
    parent: Option<Arc<ModuleLogger>>,
    log_dir: Option<PathBuf>,
    sink: Option<Mutex<File>>,
}

impl ModuleLogger {
    /// Host-owned logger used when no module logger applies.
    pub fn system(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            qualified: name.to_string(),
            module: "host".to_string(),
            category: LogCategory::System,
            parent: None,
            log_dir: None,
            sink: None,
        })
    }

    /// The main logger of `module`. With `log_dir`, lines are mirrored to
    /// `<log_dir>/<logger>.log`.
    pub fn for_module(module: &str, log_dir: Option<&Path>) -> Arc<Self> {
        let name = format!("{}-MAIN_LOGGER", module.to_uppercase());
        let sink = log_dir.and_then(|dir| open_sink(dir, &name));
        Arc::new(Self {
            qualified: name.clone(),
            name,
            module: module.to_string(),
            category: LogCategory::Module,
            parent: None,
            log_dir: log_dir.map(Path::to_path_buf),
            sink,
        })
    }

    /// A parentless logger a module constructed for itself.
    pub fn standalone(module: &str, category: LogCategory, name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            qualified: name.to_string(),
            module: module.to_string(),
            category,
            parent: None,
            log_dir: None,
            sink: None,
        })
    }

    /// A logger parented to `self`; inherits the module and the log directory.
    pub fn child(self: &Arc<Self>, category: LogCategory, name: &str) -> Arc<Self> {
        let sink = self.log_dir.as_deref().and_then(|dir| open_sink(dir, name));
        Arc::new(Self {
            name: name.to_string(),
            qualified: format!("{}/{}", self.qualified, name),
            module: self.module.clone(),
            category,
            parent: Some(Arc::clone(self)),
            log_dir: self.log_dir.clone(),
            sink,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name including every ancestor, `/`-separated.
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn category(&self) -> LogCategory {
        self.category
    }

    pub fn parent(&self) -> Option<&Arc<ModuleLogger>> {
        self.parent.as_ref()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let module = self.module.as_str();
        let logger = self.qualified.as_str();
        let category = self.category.as_str();
        match level {
            LogLevel::Error => error!(target: PLUGIN_TARGET, module, logger, category, "{message}"),
            LogLevel::Warn => warn!(target: PLUGIN_TARGET, module, logger, category, "{message}"),
            LogLevel::Info => info!(target: PLUGIN_TARGET, module, logger, category, "{message}"),
            LogLevel::Debug => debug!(target: PLUGIN_TARGET, module, logger, category, "{message}"),
            LogLevel::Trace => trace!(target: PLUGIN_TARGET, module, logger, category, "{message}"),
        }

        if let Some(sink) = &self.sink {
            let stamp = chrono::Utc::now().to_rfc3339();
            let mut file = sink.lock();
            // Mirror failures must not affect the module.
            let _ = writeln!(file, "{stamp} {} [{}] {message}", level.as_str(), self.qualified);
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }
}

impl std::fmt::Debug for ModuleLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLogger")
            .field("qualified", &self.qualified)
            .field("module", &self.module)
            .field("category", &self.category)
            .finish()
    }
}

fn open_sink(dir: &Path, logger: &str) -> Option<Mutex<File>> {
    let path = dir.join(format!("{}.log", sandbox_key(logger)));
    let opened = std::fs::create_dir_all(dir)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
    match opened {
        Ok(file) => Some(Mutex::new(file)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open logger file, logging to tracing only");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_qualifies_name_and_keeps_module() {
        let main = ModuleLogger::for_module("alpha", None);
        let child = main.child(LogCategory::SubSystem, "db");
        assert_eq!(main.name(), "ALPHA-MAIN_LOGGER");
        assert_eq!(child.qualified_name(), "ALPHA-MAIN_LOGGER/db");
        assert_eq!(child.module(), "alpha");
        assert!(Arc::ptr_eq(child.parent().unwrap(), &main));
    }

    #[test]
    fn lines_are_mirrored_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let main = ModuleLogger::for_module("alpha", Some(&logs));
        main.info("hello");
        main.child(LogCategory::Module, "worker").error("boom");

        let text = std::fs::read_to_string(logs.join("ALPHA-MAIN_LOGGER.log")).unwrap();
        assert!(text.contains("INFO [ALPHA-MAIN_LOGGER] hello"));
        let child = std::fs::read_to_string(logs.join("worker.log")).unwrap();
        assert!(child.contains("ERROR [ALPHA-MAIN_LOGGER/worker] boom"));
    }

    #[test]
    fn abi_decoding() {
        assert_eq!(LogLevel::from_abi(0), LogLevel::Error);
        assert_eq!(LogLevel::from_abi(9), LogLevel::Trace);
        assert_eq!(LogCategory::from_abi(abi::CATEGORY_SUBSYSTEM), LogCategory::SubSystem);
    }
}
