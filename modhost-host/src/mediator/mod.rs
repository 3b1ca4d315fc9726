//! Sandbox mediation layer.
//!
//! The single authority rewritten module code calls into for file and log
//! side effects. Every file handle it returns resolves strictly below
//! `<data_root>/<sanitised module name>`, and the handle's own directory and
//! file creation re-enter the same check.
//!
//! Module identity reaches the mediator as a [`ModuleToken`] the rewriter
//! baked into the module's code. Tokens are allocated here, one per module
//! name, and the wasm host functions verify that a token matches the store
//! making the call.

mod confine;

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use modhost_types::sandbox_key;

use crate::error::SandboxError;
use crate::logger::ModuleLogger;

pub(crate) use confine::{canonicalize_lenient, is_strict_descendant, normalize_relative};

/// Directory inside a sandbox root that holds mirrored log files.
pub const LOG_DIR: &str = "logs";

/// Identity constant injected into rewritten code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleToken(i32);

impl ModuleToken {
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ModuleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Default)]
struct TokenTable {
    by_name: HashMap<String, ModuleToken>,
    by_token: HashMap<ModuleToken, String>,
    next: i32,
}

/// A confined file handle bound to one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    module: String,
    path: PathBuf,
}

impl SandboxFile {
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Canonical absolute path below the module's sandbox root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Creates this path as a directory, with parents.
    pub fn mkdirs(&self, mediator: &SandboxMediator) -> Result<bool, SandboxError> {
        let path = mediator.reconfirm(&self.module, &self.path)?;
        std::fs::create_dir_all(path)?;
        Ok(true)
    }

    /// Creates the file if absent. `Ok(false)` when it already existed.
    pub fn create(&self, mediator: &SandboxMediator) -> Result<bool, SandboxError> {
        let path = mediator.reconfirm(&self.module, &self.path)?;
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends `bytes`, creating the file if needed.
    pub fn append(&self, mediator: &SandboxMediator, bytes: &[u8]) -> Result<usize, SandboxError> {
        let path = mediator.reconfirm(&self.module, &self.path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(bytes)?;
        Ok(bytes.len())
    }

    pub fn read(&self, mediator: &SandboxMediator) -> Result<Vec<u8>, SandboxError> {
        let path = mediator.reconfirm(&self.module, &self.path)?;
        let mut data = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut data)?;
        Ok(data)
    }
}

/// Confined file access, captured diagnostics and logger lookup for modules.
pub struct SandboxMediator {
    data_root: PathBuf,
    save_logs: bool,
    tokens: RwLock<TokenTable>,
    active: RwLock<HashMap<String, Arc<ModuleLogger>>>,
    fallback: Arc<ModuleLogger>,
}

impl SandboxMediator {
    pub fn new(data_root: impl Into<PathBuf>, save_logs: bool) -> Self {
        Self {
            data_root: data_root.into(),
            save_logs,
            tokens: RwLock::new(TokenTable {
                next: 0x1000,
                ..TokenTable::default()
            }),
            active: RwLock::new(HashMap::new()),
            fallback: ModuleLogger::system("Sandbox"),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    // ================================================================
    // Identity
    // ================================================================

    /// The module's token, allocated on first request and stable afterwards.
    pub fn token_for(&self, module: &str) -> ModuleToken {
        if let Some(token) = self.tokens.read().by_name.get(module) {
            return *token;
        }
        let mut table = self.tokens.write();
        if let Some(token) = table.by_name.get(module) {
            return *token;
        }
        let token = ModuleToken(table.next);
        table.next += 1;
        table.by_name.insert(module.to_string(), token);
        table.by_token.insert(token, module.to_string());
        debug!(module = %module, token = %token, "Allocated module token");
        token
    }

    pub fn module_for_token(&self, token: ModuleToken) -> Option<String> {
        self.tokens.read().by_token.get(&token).cloned()
    }

    // ================================================================
    // Confined files
    // ================================================================

    /// `<data_root>/<sanitised module>`; not created.
    pub fn sandbox_root(&self, module: &str) -> PathBuf {
        self.data_root.join(sandbox_key(module))
    }

    /// Where a module's logger files go, when log mirroring is on.
    pub fn log_dir(&self, module: &str) -> Option<PathBuf> {
        self.save_logs
            .then(|| self.sandbox_root(module).join(LOG_DIR))
    }

    /// Resolves `path` inside the module's sandbox root and ensures its
    /// parent directories exist.
    pub fn create_file(&self, module: &str, path: &str) -> Result<SandboxFile, SandboxError> {
        let violation = || SandboxError::Violation {
            module: module.to_string(),
            path: path.to_string(),
        };

        let relative = normalize_relative(path).ok_or_else(violation)?;
        let root = self.ensure_root(module)?;
        let resolved = canonicalize_lenient(&root.join(&relative)).map_err(|_| violation())?;
        if !is_strict_descendant(&root, &resolved) {
            warn!(module = %module, path = %path, "Sandbox violation");
            return Err(violation());
        }

        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(module = %module, requested = %path, resolved = %resolved.display(), "Confined file");
        Ok(SandboxFile {
            module: module.to_string(),
            path: resolved,
        })
    }

    /// Parent/child form of [`create_file`](Self::create_file).
    pub fn create_file_at(
        &self,
        module: &str,
        parent: &str,
        child: &str,
    ) -> Result<SandboxFile, SandboxError> {
        if parent.is_empty() {
            self.create_file(module, child)
        } else {
            self.create_file(module, &format!("{parent}/{child}"))
        }
    }

    /// Re-checks an already confined path before a derived operation.
    pub fn reconfirm(&self, module: &str, path: &Path) -> Result<PathBuf, SandboxError> {
        let violation = || SandboxError::Violation {
            module: module.to_string(),
            path: path.display().to_string(),
        };
        let root = self.ensure_root(module)?;
        let resolved = canonicalize_lenient(path).map_err(|_| violation())?;
        if is_strict_descendant(&root, &resolved) {
            Ok(resolved)
        } else {
            warn!(module = %module, path = %path.display(), "Sandbox violation on derived operation");
            Err(violation())
        }
    }

    fn ensure_root(&self, module: &str) -> Result<PathBuf, SandboxError> {
        let root = self.sandbox_root(module);
        std::fs::create_dir_all(&root)?;
        Ok(std::fs::canonicalize(root)?)
    }

    // ================================================================
    // Diagnostics and loggers
    // ================================================================

    /// Writes a timestamped, module-tagged trace through the module's logger.
    pub fn log_exception(&self, module: &str, trace: &str) {
        let logger = self.plugin_logger(module);
        logger.error(&format!(
            "---- {} [captured by {module}] ----",
            chrono::Utc::now().to_rfc3339()
        ));
        for line in trace.lines() {
            logger.error(&format!("    {line}"));
        }
    }

    /// Writes a timestamped, module-tagged message through the module's logger.
    pub fn log_message(&self, module: &str, message: &str) {
        self.plugin_logger(module).info(&format!(
            "{} [captured by {module}] {message}",
            chrono::Utc::now().to_rfc3339()
        ));
    }

    /// The active module's logger, or the fallback system logger when the
    /// module is not active (e.g. during teardown).
    pub fn plugin_logger(&self, module: &str) -> Arc<ModuleLogger> {
        self.active
            .read()
            .get(module)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn system_logger(&self) -> &Arc<ModuleLogger> {
        &self.fallback
    }

    pub fn activate(&self, module: &str, logger: Arc<ModuleLogger>) {
        self.active.write().insert(module.to_string(), logger);
    }

    pub fn deactivate(&self, module: &str) {
        self.active.write().remove(module);
    }

    pub fn is_active(&self, module: &str) -> bool {
        self.active.read().contains_key(module)
    }
}

impl fmt::Debug for SandboxMediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxMediator")
            .field("data_root", &self.data_root)
            .field("active", &self.active.read().len())
            .finish()
    }
}
