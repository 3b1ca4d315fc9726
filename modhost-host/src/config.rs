//! Host configuration, read from `modhost.toml`.
//!
//! Every key is optional. A missing file means defaults; a malformed file is
//! logged and also means defaults, so a typo never keeps the host down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::limits::ResourceLimits;
use crate::policy::PolicyConfig;

/// Default repository for remote artifacts.
pub const DEFAULT_REPOSITORY_URL: &str = "https://repo1.maven.org/maven2";

/// Conventional config file name.
pub const CONFIG_FILE: &str = "modhost.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory scanned for plugin packages.
    pub modules_dir: PathBuf,
    /// Shared cache of extracted and downloaded archives.
    pub libs_dir: PathBuf,
    /// Global data root; each module's sandbox lives below it.
    pub data_root: PathBuf,
    /// Root of per-module database directories.
    pub database_root: PathBuf,
    pub repository_url: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub pool_max_size: u32,
    pub pool_min_idle: u32,
    /// Mirror module loggers into `<sandbox>/logs/<logger>.log`.
    pub save_logs: bool,
    pub limits: LimitsConfig,
    pub policy: PolicyConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            modules_dir: PathBuf::from("modules"),
            libs_dir: PathBuf::from("modules-libs"),
            data_root: PathBuf::from("modules-data"),
            database_root: PathBuf::from("modules-db"),
            repository_url: DEFAULT_REPOSITORY_URL.to_string(),
            connect_timeout_secs: 15,
            read_timeout_secs: 15,
            pool_max_size: 5,
            pool_min_idle: 1,
            save_logs: true,
            limits: LimitsConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl HostConfig {
    /// Loads from `path`, falling back to defaults when the file is missing
    /// or cannot be parsed.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "No config file found, using defaults");
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<HostConfig>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded host configuration");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    /// Every relative directory resolved against `base`.
    #[must_use]
    pub fn rooted_at(mut self, base: &Path) -> Self {
        for dir in [
            &mut self.modules_dir,
            &mut self.libs_dir,
            &mut self.data_root,
            &mut self.database_root,
        ] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Where compiled units are cached.
    pub fn compiled_cache_dir(&self) -> PathBuf {
        self.libs_dir.join("compiled")
    }
}

/// `[limits]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_memory_bytes: usize,
    pub fuel_per_call: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            max_memory_bytes: limits.max_memory_bytes,
            fuel_per_call: limits.fuel_per_call,
        }
    }
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(config: &LimitsConfig) -> Self {
        ResourceLimits {
            max_memory_bytes: config.max_memory_bytes,
            fuel_per_call: config.fuel_per_call,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyMode, RewriteFailurePolicy};
    use pretty_assertions::assert_eq;

    fn load_config_from_str(contents: &str) -> HostConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, contents).unwrap();
        HostConfig::load_from(&path)
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load_from(&dir.path().join("absent.toml"));
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.pool_max_size, 5);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = load_config_from_str(
            r#"
modules_dir = "plugins"
read_timeout_secs = 3

[limits]
fuel_per_call = 1000

[policy]
mode = "denylist"
denied_modules = ["evil"]
rewrite_failure = "fail-closed"
"#,
        );
        assert_eq!(config.modules_dir, PathBuf::from("plugins"));
        assert_eq!(config.read_timeout_secs, 3);
        assert_eq!(config.connect_timeout_secs, 15);
        assert_eq!(config.limits.fuel_per_call, 1000);
        assert_eq!(config.limits.max_memory_bytes, LimitsConfig::default().max_memory_bytes);
        assert_eq!(config.policy.mode, PolicyMode::Denylist);
        assert_eq!(config.policy.rewrite_failure, RewriteFailurePolicy::FailClosed);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let config = load_config_from_str("modules_dir = [this is not toml");
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn rooted_at_only_touches_relative_dirs() {
        let config = HostConfig {
            data_root: PathBuf::from("/var/lib/modhost"),
            ..HostConfig::default()
        }
        .rooted_at(Path::new("/srv"));
        assert_eq!(config.modules_dir, PathBuf::from("/srv/modules"));
        assert_eq!(config.data_root, PathBuf::from("/var/lib/modhost"));
        assert_eq!(config.compiled_cache_dir(), PathBuf::from("/srv/modules-libs/compiled"));
    }
}
