//! Discovery of plugin packages in the modules directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use wasmtime::Engine;

use modhost_package::{is_package_path, ModuleDescriptor, PluginPackage};

use crate::error::HostError;
use crate::load_context::{LoadContext, LoadOptions};
use crate::materializer::DependencyMaterializer;
use crate::mediator::SandboxMediator;
use crate::policy::PolicyEngine;

/// A package whose dependencies are materialized and whose load context is
/// open, ready to be instantiated.
#[derive(Debug)]
pub struct PreparedModule {
    pub name: String,
    pub package: PathBuf,
    pub descriptor: ModuleDescriptor,
    pub context: Arc<LoadContext>,
}

pub struct ModuleScanner<'a> {
    modules_dir: &'a Path,
    materializer: &'a DependencyMaterializer,
    engine: &'a Engine,
    mediator: &'a SandboxMediator,
    policy: &'a PolicyEngine,
    load_options: LoadOptions,
}

impl<'a> ModuleScanner<'a> {
    pub fn new(
        modules_dir: &'a Path,
        materializer: &'a DependencyMaterializer,
        engine: &'a Engine,
        mediator: &'a SandboxMediator,
        policy: &'a PolicyEngine,
        load_options: LoadOptions,
    ) -> Self {
        Self {
            modules_dir,
            materializer,
            engine,
            mediator,
            policy,
            load_options,
        }
    }

    /// Package files in the modules directory, sorted by path.
    pub fn package_paths(&self) -> Result<Vec<PathBuf>, HostError> {
        if !self.modules_dir.exists() {
            info!(dir = %self.modules_dir.display(), "Modules directory missing, creating it");
            std::fs::create_dir_all(self.modules_dir)?;
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(self.modules_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_package_path(path))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Prepares every package. A package that fails is logged and skipped.
    pub fn scan(&self) -> Result<Vec<PreparedModule>, HostError> {
        let paths = self.package_paths()?;
        info!(dir = %self.modules_dir.display(), packages = paths.len(), "Scanning modules");

        let prepared = paths
            .iter()
            .filter_map(|path| match self.prepare(path) {
                Ok(Some(module)) => Some(module),
                Ok(None) => None,
                Err(e) => {
                    warn!(package = %path.display(), error = %e, severity = ?e.severity(), "Package skipped");
                    None
                }
            })
            .collect();
        Ok(prepared)
    }

    /// `Ok(None)` when the package has no descriptor.
    pub fn prepare(&self, path: &Path) -> Result<Option<PreparedModule>, HostError> {
        let mut package = PluginPackage::open(path)?;
        let Some(descriptor) = package.read_descriptor()? else {
            warn!(package = %path.display(), "No module.yml in package, skipping");
            return Ok(None);
        };
        let name = descriptor.module_name.clone();

        if !self.policy.is_module_allowed(&name) {
            return Err(HostError::PolicyDenied(name));
        }

        let search_path = self.materializer.materialize(&mut package, &descriptor)?;
        drop(package);

        let token = self.mediator.token_for(&name);
        let context = Arc::new(LoadContext::open(
            &name,
            token,
            self.engine,
            search_path,
            self.load_options.clone(),
        ));
        if !context.has_unit(&descriptor.main) {
            context.release();
            return Err(HostError::UnitNotFound {
                module: name,
                unit: descriptor.main,
            });
        }

        info!(module = %name, main = %descriptor.main, "Module prepared");
        Ok(Some(PreparedModule {
            name,
            package: path.to_path_buf(),
            descriptor,
            context,
        }))
    }
}
