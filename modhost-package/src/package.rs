//! Plugin package access and building.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::{ModuleDescriptor, PackageError};

/// Archive entry holding the module descriptor.
pub const DESCRIPTOR_ENTRY: &str = "module.yml";

const UNIT_EXTENSION: &str = ".wasm";

/// Archive entry name of a dotted unit name: `a.b.C` -> `a/b/C.wasm`.
pub fn unit_entry_name(dotted: &str) -> String {
    format!("{}{UNIT_EXTENSION}", dotted.replace('.', "/"))
}

/// An open plugin package (or any other archive on a load context's search
/// path). Holds the file handle until dropped.
pub struct PluginPackage {
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl PluginPackage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PackageError> {
        let path = path.as_ref().to_path_buf();
        let archive = ZipArchive::new(File::open(&path)?)?;
        Ok(Self { path, archive })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without extension, used to prefix extracted libraries.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.archive.index_for_name(name).is_some()
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.archive.file_names().map(str::to_string).collect()
    }

    /// Reads one entry. `Ok(None)` when the archive has no such entry.
    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>, PackageError> {
        let mut file = match self.archive.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    /// Reads the bytes of a code unit by dotted name.
    pub fn read_unit(&mut self, dotted: &str) -> Result<Option<Vec<u8>>, PackageError> {
        self.read_entry(&unit_entry_name(dotted))
    }

    /// Reads and parses `module.yml`. `Ok(None)` when the package has none.
    pub fn read_descriptor(&mut self) -> Result<Option<ModuleDescriptor>, PackageError> {
        match self.read_entry(DESCRIPTOR_ENTRY)? {
            Some(bytes) => ModuleDescriptor::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Deterministic SHA-256 over all entries, sorted by name.
    pub fn content_hash(&mut self) -> Result<String, PackageError> {
        let mut names = self.entry_names();
        names.sort();

        let mut hasher = Sha256::new();
        for name in names {
            let data = self.read_entry(&name)?.unwrap_or_default();
            hasher.update(name.as_bytes());
            hasher.update((data.len() as u64).to_le_bytes());
            hasher.update(&data);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Debug for PluginPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginPackage")
            .field("path", &self.path)
            .field("entries", &self.archive.len())
            .finish()
    }
}

/// Fluent builder for plugin packages.
#[derive(Debug, Default)]
pub struct PackageBuilder {
    descriptor: Option<String>,
    entries: BTreeMap<String, Vec<u8>>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the raw `module.yml` text.
    pub fn descriptor(mut self, text: impl Into<String>) -> Self {
        self.descriptor = Some(text.into());
        self
    }

    /// Adds a code unit under its dotted name.
    pub fn unit(mut self, dotted: &str, wasm: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(unit_entry_name(dotted), wasm.into());
        self
    }

    /// Adds an arbitrary entry (embedded library, schema file, ...).
    pub fn entry(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(name.to_string(), data.into());
        self
    }

    /// Builds the zip archive and returns the raw bytes.
    pub fn build(self) -> Result<Vec<u8>, PackageError> {
        let buf = std::io::Cursor::new(Vec::new());
        let mut zip = ZipWriter::new(buf);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        if let Some(ref text) = self.descriptor {
            zip.start_file(DESCRIPTOR_ENTRY, options)?;
            zip.write_all(text.as_bytes())?;
        }

        for (name, data) in &self.entries {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(data)?;
        }

        let finished = zip.finish()?;
        Ok(finished.into_inner())
    }

    /// Builds and writes the archive to `path`.
    pub fn write_to(self, path: impl AsRef<Path>) -> Result<PathBuf, PackageError> {
        let path = path.as_ref().to_path_buf();
        let bytes = self.build()?;
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_names_map_to_nested_paths() {
        assert_eq!(unit_entry_name("com.example.Main"), "com/example/Main.wasm");
        assert_eq!(unit_entry_name("Main"), "Main.wasm");
    }

    #[test]
    fn build_and_open_minimal() {
        let dir = tempfile::tempdir().unwrap();
        let path = PackageBuilder::new()
            .descriptor("main: a.Main\nmodule_name: alpha\n")
            .unit("a.Main", b"\0asm".to_vec())
            .write_to(dir.path().join("alpha.jar"))
            .unwrap();

        let mut pkg = PluginPackage::open(&path).unwrap();
        assert_eq!(pkg.stem(), "alpha");
        assert!(pkg.has_entry("a/Main.wasm"));
        assert_eq!(pkg.read_unit("a.Main").unwrap().unwrap(), b"\0asm");
        assert_eq!(pkg.read_descriptor().unwrap().unwrap().module_name, "alpha");
    }

    #[test]
    fn content_hash_ignores_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = PackageBuilder::new()
            .entry("x", b"1".to_vec())
            .entry("y", b"2".to_vec())
            .write_to(dir.path().join("a.zip"))
            .unwrap();
        let b = PackageBuilder::new()
            .entry("y", b"2".to_vec())
            .entry("x", b"1".to_vec())
            .write_to(dir.path().join("b.zip"))
            .unwrap();

        let ha = PluginPackage::open(a).unwrap().content_hash().unwrap();
        let hb = PluginPackage::open(b).unwrap().content_hash().unwrap();
        assert_eq!(ha, hb);
    }
}
