//! Plugin package format.
//!
//! A plugin package is a zip archive (`*.jar` or `*.zip`) with:
//! - `module.yml` descriptor at the root
//! - compiled code units as `<dotted/name/with/slashes>.wasm`
//! - optional embedded library archives at arbitrary paths
//! - optional entity schemas as `schema/<entity>.sql`
//!
//! This crate parses descriptors, gives read access to package entries and
//! builds packages for tooling and tests.

mod descriptor;
mod error;
mod package;

pub use descriptor::{ArtifactCoordinate, ModuleDescriptor};
pub use error::PackageError;
pub use package::{unit_entry_name, PackageBuilder, PluginPackage, DESCRIPTOR_ENTRY};

/// File extensions recognised as plugin packages.
pub const PACKAGE_EXTENSIONS: &[&str] = &["jar", "zip"];

/// Whether `path` looks like a plugin package by extension.
pub fn is_package_path(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            PACKAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn package_extensions() {
        assert!(is_package_path(Path::new("modules/alpha.jar")));
        assert!(is_package_path(Path::new("modules/alpha.ZIP")));
        assert!(!is_package_path(Path::new("modules/alpha.wasm")));
        assert!(!is_package_path(Path::new("modules/README")));
    }
}
