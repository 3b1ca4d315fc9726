//! Dependency materialization.
//!
//! Copies a package's embedded libraries into the shared libs directory and
//! fetches its remote artifacts there, producing the ordered archive search
//! path of its load context. Remote fetches are single-artifact: no
//! transitive resolution, no checksum verification. A failed fetch drops
//! that artifact only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use modhost_package::{ArtifactCoordinate, ModuleDescriptor, PackageError, PluginPackage};

use crate::config::HostConfig;
use crate::error::HostError;

/// Fetches and extracts dependency archives into one cache directory.
#[derive(Debug, Clone)]
pub struct DependencyMaterializer {
    libs_dir: PathBuf,
    repository_url: String,
    client: Client,
}

impl DependencyMaterializer {
    pub fn new(
        libs_dir: impl Into<PathBuf>,
        repository_url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, HostError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|e| HostError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            libs_dir: libs_dir.into(),
            repository_url: repository_url.into(),
            client,
        })
    }

    pub fn from_config(config: &HostConfig) -> Result<Self, HostError> {
        Self::new(
            &config.libs_dir,
            &config.repository_url,
            config.connect_timeout(),
            config.read_timeout(),
        )
    }

    pub fn libs_dir(&self) -> &Path {
        &self.libs_dir
    }

    /// `[package] + [extracted embedded] + [fetched remote]`.
    pub fn materialize(
        &self,
        package: &mut PluginPackage,
        descriptor: &ModuleDescriptor,
    ) -> Result<Vec<PathBuf>, HostError> {
        std::fs::create_dir_all(&self.libs_dir)?;

        let mut search_path = vec![package.path().to_path_buf()];
        search_path.extend(self.extract_embedded(package, &descriptor.embedded_libs)?);
        search_path.extend(self.fetch_remote(&descriptor.remote_deps));

        info!(
            package = %package.path().display(),
            archives = search_path.len(),
            "Dependencies materialized"
        );
        Ok(search_path)
    }

    /// Copies each embedded entry to `<libs_dir>/<package stem>_<file name>`.
    /// Missing entries are skipped.
    pub fn extract_embedded(
        &self,
        package: &mut PluginPackage,
        entries: &[String],
    ) -> Result<Vec<PathBuf>, HostError> {
        let stem = package.stem();
        let mut extracted = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(bytes) = package.read_entry(entry)? else {
                debug!(package = %stem, entry = %entry, "Embedded library not in package, skipping");
                continue;
            };
            let file_name = Path::new(entry)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.replace('/', "_"));
            let target = self.libs_dir.join(format!("{stem}_{file_name}"));
            std::fs::write(&target, bytes)?;
            debug!(entry = %entry, target = %target.display(), "Extracted embedded library");
            extracted.push(target);
        }
        Ok(extracted)
    }

    /// Fetches every coordinate that is not cached yet. Failures are logged
    /// and the artifact is dropped.
    pub fn fetch_remote(&self, coordinates: &[ArtifactCoordinate]) -> Vec<PathBuf> {
        coordinates
            .iter()
            .filter_map(|coordinate| match self.fetch_one(coordinate) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(artifact = %coordinate, error = %e, "Remote dependency dropped");
                    None
                }
            })
            .collect()
    }

    /// One artifact. A file of the same name in the cache counts as a hit.
    pub fn fetch_one(&self, coordinate: &ArtifactCoordinate) -> Result<PathBuf, HostError> {
        if !coordinate.is_path_safe() {
            return Err(PackageError::InvalidCoordinate(coordinate.to_string()).into());
        }
        let target = self.libs_dir.join(coordinate.file_name());
        if target.exists() {
            debug!(artifact = %coordinate, "Remote dependency cached");
            return Ok(target);
        }

        let url = coordinate.url(&self.repository_url);
        let fetch_error = |message: String| HostError::Fetch {
            url: url.clone(),
            message,
        };

        info!(artifact = %coordinate, url = %url, "Fetching remote dependency");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| fetch_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().map_err(|e| fetch_error(e.to_string()))?;

        std::fs::create_dir_all(&self.libs_dir)?;
        std::fs::write(&target, &bytes)?;
        info!(artifact = %coordinate, size_bytes = bytes.len(), "Remote dependency stored");
        Ok(target)
    }
}
