//! `module.yml` descriptor parsing.
//!
//! The format is line oriented, not real YAML:
//!
//! ```text
//! main: com.example.alpha.Main
//! module_name: alpha
//! embeddedLibs: libs/a.jar, libs/b.jar
//! mavenDeps:
//!   - com.example:foo:1.0
//! ```
//!
//! `-` lines append to whichever list key was seen last (embedded libraries
//! when no list key has been seen yet). Blank lines and `#` comments are
//! ignored, unknown keys are skipped.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::PackageError;

/// Name given to descriptors without `module_name`.
pub const UNKNOWN_NAME: &str = "unknown";

/// A remote artifact, `group:artifact:version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactCoordinate {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

impl ArtifactCoordinate {
    /// No part can name another directory once joined into a path.
    pub fn is_path_safe(&self) -> bool {
        [&self.group, &self.artifact, &self.version]
            .iter()
            .all(|part| !part.contains(['/', '\\', '\0']) && !part.contains(".."))
    }

    /// Cache file name, `<artifact>-<version>.jar`.
    pub fn file_name(&self) -> String {
        format!("{}-{}.jar", self.artifact, self.version)
    }

    /// Path below a repository root in the standard central layout.
    pub fn repository_path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group.replace('.', "/"),
            self.artifact,
            self.version,
            self.file_name()
        )
    }

    /// Full artifact URL below `repository_url`.
    pub fn url(&self, repository_url: &str) -> String {
        format!(
            "{}/{}",
            repository_url.trim_end_matches('/'),
            self.repository_path()
        )
    }
}

impl FromStr for ArtifactCoordinate {
    type Err = PackageError;

    /// Extra `:`-separated parts after the version are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':').map(str::trim);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(g), Some(a), Some(v)) if !g.is_empty() && !a.is_empty() && !v.is_empty() => {
                let coordinate = Self {
                    group: g.to_string(),
                    artifact: a.to_string(),
                    version: v.to_string(),
                };
                if coordinate.is_path_safe() {
                    Ok(coordinate)
                } else {
                    Err(PackageError::InvalidCoordinate(s.to_string()))
                }
            }
            _ => Err(PackageError::InvalidCoordinate(s.to_string())),
        }
    }
}

impl fmt::Display for ArtifactCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)
    }
}

/// Parsed `module.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Dotted name of the entry-point unit.
    pub main: String,
    pub module_name: String,
    /// Package-relative paths of embedded library archives, in order.
    pub embedded_libs: Vec<String>,
    /// Remote artifacts, in order. Malformed coordinates are dropped.
    pub remote_deps: Vec<ArtifactCoordinate>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpenList {
    None,
    Embedded,
    Remote,
}

impl ModuleDescriptor {
    /// Parses descriptor text. Fails only when `main` is missing.
    pub fn parse(text: &str) -> Result<Self, PackageError> {
        let mut main = None;
        let mut name = None;
        let mut embedded = Vec::new();
        let mut remote_raw = Vec::new();
        let mut open = OpenList::None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("main:") {
                main = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("module_name:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("embeddedLibs:") {
                open = OpenList::Embedded;
                embedded.extend(split_list(rest));
            } else if let Some(rest) = line.strip_prefix("mavenDeps:") {
                open = OpenList::Remote;
                remote_raw.extend(split_list(rest));
            } else if let Some(rest) = line.strip_prefix('-') {
                let item = rest.trim().to_string();
                if open == OpenList::Remote {
                    remote_raw.push(item);
                } else {
                    embedded.push(item);
                }
            }
        }

        let main = main.ok_or(PackageError::MissingMain)?;
        let module_name = name.unwrap_or_else(|| UNKNOWN_NAME.to_string());

        let remote_deps = remote_raw
            .iter()
            .filter_map(|raw| match raw.parse::<ArtifactCoordinate>() {
                Ok(coord) => Some(coord),
                Err(e) => {
                    warn!(module = %module_name, error = %e, "Dropping remote dependency");
                    None
                }
            })
            .collect();

        Ok(Self {
            main,
            module_name,
            embedded_libs: embedded,
            remote_deps,
        })
    }

    /// Parses descriptor bytes read from a package entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PackageError> {
        let text = std::str::from_utf8(bytes).map_err(|_| PackageError::DescriptorEncoding)?;
        Self::parse(text)
    }
}

fn split_list(rest: &str) -> impl Iterator<Item = String> + '_ {
    rest.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
