//! Per-module code-loading boundary.
//!
//! A [`LoadContext`] owns the ordered archive search path of one module:
//! the plugin package, then extracted embedded archives, then fetched
//! remote archives. Units are looked up in that order the first time they
//! are referenced, rewritten for the owning module, compiled and cached.
//! Nothing outside the search path is visible except the host import
//! namespaces every store links.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use wasmtime::{Engine, Module};

use modhost_db::{EntityDescriptor, SchemaSource};
use modhost_package::PluginPackage;
use modhost_types::abi::SANDBOX_UNIT_PREFIX;

use crate::error::HostError;
use crate::mediator::ModuleToken;
use crate::policy::RewriteFailurePolicy;
use crate::rewriter::SandboxRewriter;

/// How units of a context are prepared.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub rewrite_failure: RewriteFailurePolicy,
    /// Directory for serialized compiled units; `None` disables the cache.
    pub compiled_cache: Option<PathBuf>,
}

pub struct LoadContext {
    module: String,
    token: ModuleToken,
    engine: Engine,
    search_path: Vec<PathBuf>,
    /// `None` once released.
    archives: Mutex<Option<Vec<PluginPackage>>>,
    compiled: Mutex<HashMap<String, Module>>,
    unsandboxed: Mutex<Vec<String>>,
    rewriter: SandboxRewriter,
    options: LoadOptions,
}

impl LoadContext {
    /// Opens every archive of `search_path`. Archives that cannot be opened
    /// are logged and left out; their units surface as missing at first use.
    pub fn open(
        module: &str,
        token: ModuleToken,
        engine: &Engine,
        search_path: Vec<PathBuf>,
        options: LoadOptions,
    ) -> Self {
        let archives = search_path
            .iter()
            .filter_map(|path| match PluginPackage::open(path) {
                Ok(package) => Some(package),
                Err(e) => {
                    warn!(module = %module, path = %path.display(), error = %e, "Skipping unreadable archive");
                    None
                }
            })
            .collect::<Vec<_>>();
        info!(module = %module, archives = archives.len(), "Load context opened");

        Self {
            module: module.to_string(),
            token,
            engine: engine.clone(),
            search_path,
            archives: Mutex::new(Some(archives)),
            compiled: Mutex::new(HashMap::new()),
            unsandboxed: Mutex::new(Vec::new()),
            rewriter: SandboxRewriter::new(),
            options,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn token(&self) -> ModuleToken {
        self.token
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Archive handles currently held.
    pub fn held_archives(&self) -> usize {
        self.archives.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_released(&self) -> bool {
        self.archives.lock().is_none()
    }

    /// Units that run without (complete) sandboxing under the fail-open
    /// policy.
    pub fn unsandboxed_units(&self) -> Vec<String> {
        self.unsandboxed.lock().clone()
    }

    /// Whether any archive on the search path contains `unit`.
    pub fn has_unit(&self, unit: &str) -> bool {
        let entry = modhost_package::unit_entry_name(unit);
        self.archives
            .lock()
            .as_ref()
            .is_some_and(|archives| archives.iter().any(|a| a.has_entry(&entry)))
    }

    /// The compiled, rewritten unit. Loaded on first reference.
    pub fn unit(&self, unit: &str) -> Result<Module, HostError> {
        if let Some(module) = self.compiled.lock().get(unit) {
            return Ok(module.clone());
        }

        let raw = self.read_unit(unit)?;
        let prepared = self.prepare(unit, raw)?;
        let module = compile_cached(&self.engine, &prepared, self.options.compiled_cache.as_deref())?;

        let mut compiled = self.compiled.lock();
        // another thread may have won the race; keep the first
        Ok(compiled.entry(unit.to_string()).or_insert(module).clone())
    }

    fn read_unit(&self, unit: &str) -> Result<Vec<u8>, HostError> {
        let mut guard = self.archives.lock();
        let archives = guard
            .as_mut()
            .ok_or_else(|| HostError::ContextReleased(self.module.clone()))?;
        for archive in archives.iter_mut() {
            if let Some(bytes) = archive.read_unit(unit)? {
                debug!(module = %self.module, unit = %unit, archive = %archive.path().display(), "Unit located");
                return Ok(bytes);
            }
        }
        Err(HostError::UnitNotFound {
            module: self.module.clone(),
            unit: unit.to_string(),
        })
    }

    /// Rewrites `raw` for the owning module, applying the failure policy.
    fn prepare(&self, unit: &str, raw: Vec<u8>) -> Result<Vec<u8>, HostError> {
        // mediation lives in host functions; a plugin unit claiming the
        // namespace would otherwise bypass rewriting
        if unit.starts_with(SANDBOX_UNIT_PREFIX) {
            warn!(module = %self.module, unit = %unit, "Plugin unit in reserved mediation namespace");
            return Err(HostError::RewriteRejected {
                unit: unit.to_string(),
                reason: format!("'{SANDBOX_UNIT_PREFIX}' is reserved for the host"),
            });
        }

        let policy = self.options.rewrite_failure;
        match self.rewriter.rewrite(&raw, self.token) {
            Ok(outcome) => {
                let report = &outcome.report;
                for site in &report.skipped {
                    warn!(
                        module = %self.module,
                        unit = %unit,
                        pattern = %site.pattern,
                        offset = site.offset,
                        reason = site.reason,
                        "Call site left unmediated"
                    );
                }
                if !report.is_complete() {
                    if policy == RewriteFailurePolicy::FailClosed {
                        return Err(HostError::RewriteRejected {
                            unit: unit.to_string(),
                            reason: format!("{} call site(s) could not be mediated", report.skipped.len()),
                        });
                    }
                    self.unsandboxed.lock().push(unit.to_string());
                }
                if report.is_modified() {
                    debug!(module = %self.module, unit = %unit, patched = report.patched.len(), "Unit rewritten");
                }
                Ok(outcome.bytes)
            }
            Err(e) => match policy {
                RewriteFailurePolicy::FailOpen => {
                    warn!(module = %self.module, unit = %unit, error = %e, "Rewrite failed, defining unit unmodified");
                    self.unsandboxed.lock().push(unit.to_string());
                    Ok(raw)
                }
                RewriteFailurePolicy::FailClosed => Err(HostError::RewriteRejected {
                    unit: unit.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }

    /// Closes every archive handle and drops compiled units. Returns `false`
    /// if the context was already released.
    pub fn release(&self) -> bool {
        let archives = self.archives.lock().take();
        self.compiled.lock().clear();
        match archives {
            Some(archives) => {
                info!(module = %self.module, archives = archives.len(), "Load context released");
                true
            }
            None => false,
        }
    }
}

impl SchemaSource for LoadContext {
    fn resolve_schema(&self, entity: &EntityDescriptor) -> Option<String> {
        if let Some(ddl) = &entity.ddl {
            return Some(ddl.clone());
        }
        let entry = entity.schema_entry();
        let mut guard = self.archives.lock();
        for archive in guard.as_mut()?.iter_mut() {
            match archive.read_entry(&entry) {
                Ok(Some(bytes)) => return String::from_utf8(bytes).ok(),
                Ok(None) => continue,
                Err(e) => {
                    warn!(module = %self.module, entry = %entry, error = %e, "Failed to read schema");
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadContext")
            .field("module", &self.module)
            .field("token", &self.token)
            .field("search_path", &self.search_path)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Compiles `bytes`, going through `<cache_dir>/<sha256>.cwasm` when a cache
/// directory is given.
fn compile_cached(engine: &Engine, bytes: &[u8], cache_dir: Option<&Path>) -> Result<Module, HostError> {
    let Some(cache_dir) = cache_dir else {
        return Ok(Module::new(engine, bytes)?);
    };

    let hash = hex::encode(Sha256::digest(bytes));
    let cwasm_path = cache_dir.join(format!("{hash}.cwasm"));

    if cwasm_path.exists() {
        match std::fs::read(&cwasm_path) {
            Ok(serialized) => {
                // SAFETY: the artifact was serialized by this engine
                // configuration and is keyed by the hash of its source bytes.
                match unsafe { Module::deserialize(engine, &serialized) } {
                    Ok(module) => {
                        debug!(path = %cwasm_path.display(), "Loaded cached compiled unit");
                        return Ok(module);
                    }
                    Err(e) => {
                        warn!(path = %cwasm_path.display(), error = %e, "Cached unit unusable, recompiling");
                    }
                }
            }
            Err(e) => warn!(path = %cwasm_path.display(), error = %e, "Failed to read cached unit"),
        }
    }

    let compile_start = Instant::now();
    let module = Module::new(engine, bytes)?;
    debug!(size_bytes = bytes.len(), elapsed_ms = compile_start.elapsed().as_millis(), "Compiled unit");

    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        warn!(path = %cache_dir.display(), error = %e, "Failed to create compiled unit cache");
        return Ok(module);
    }
    match module.serialize() {
        Ok(serialized) => {
            if let Err(e) = std::fs::write(&cwasm_path, &serialized) {
                warn!(path = %cwasm_path.display(), error = %e, "Failed to write compiled unit cache");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize compiled unit"),
    }
    Ok(module)
}
