//! Module names and the sanitised keys derived from them.
//!
//! A module name is whatever the plugin's descriptor declares. Two keys are
//! derived from it: the sandbox key (directory under the data root) and the
//! tenant key (directory under the database root, lowercased).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder name for descriptors without a `module_name` entry.
pub const UNKNOWN_MODULE: &str = "unknown";

/// Display name of a plugin module. Primary key in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleName(String);

impl ModuleName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name used for the module's sandbox root.
    #[must_use]
    pub fn sandbox_key(&self) -> String {
        sandbox_key(&self.0)
    }

    /// Directory name used for the module's persistence tenant.
    #[must_use]
    pub fn tenant_key(&self) -> String {
        tenant_key(&self.0)
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ModuleName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Replaces every character outside `[a-zA-Z0-9_-]` with `_`.
///
/// The result is always a single path segment: separators, dots and
/// drive colons cannot survive, so `..` becomes `__`.
#[must_use]
pub fn sandbox_key(name: &str) -> String {
    let key: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() { "_".to_string() } else { key }
}

/// Lowercased [`sandbox_key`], used for database directories.
#[must_use]
pub fn tenant_key(name: &str) -> String {
    sandbox_key(name).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_key_keeps_safe_characters() {
        assert_eq!(sandbox_key("Alpha_module-2"), "Alpha_module-2");
    }

    #[test]
    fn sandbox_key_replaces_separators_and_dots() {
        assert_eq!(sandbox_key("../evil/name"), "___evil_name");
        assert_eq!(sandbox_key("a b:c\\d"), "a_b_c_d");
    }

    #[test]
    fn sandbox_key_never_empty() {
        assert_eq!(sandbox_key(""), "_");
    }

    #[test]
    fn tenant_key_is_lowercase() {
        assert_eq!(tenant_key("Chat Service"), "chat_service");
    }

    #[test]
    fn module_name_display() {
        let name = ModuleName::from("beta");
        assert_eq!(name.to_string(), "beta");
        assert_eq!(name.sandbox_key(), "beta");
    }
}
