//! Load policy: which modules may be admitted, and what happens when a unit
//! cannot be sandboxed.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Module admission mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only modules named in `allowed_modules` load.
    Allowlist,
    /// Every module except those in `denied_modules` loads.
    Denylist,
    #[default]
    /// No restrictions.
    Unrestricted,
}

/// What to do with a unit the rewriter could not fully sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RewriteFailurePolicy {
    /// Define the original bytes and log. Sandboxing is absent for that unit.
    #[default]
    FailOpen,
    /// Refuse the unit. Unpatchable call sites count as failures too.
    FailClosed,
}

/// `[policy]` table of the host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    pub allowed_modules: Vec<String>,
    pub denied_modules: Vec<String>,
    pub rewrite_failure: RewriteFailurePolicy,
}

/// Enforces policy decisions.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn with_config(config: PolicyConfig) -> Self {
        if config.mode != PolicyMode::Unrestricted {
            info!(mode = ?config.mode, "Module admission policy active");
        }
        Self { config }
    }

    /// Check if a module may be loaded.
    pub fn is_module_allowed(&self, module: &str) -> bool {
        match self.config.mode {
            PolicyMode::Unrestricted => true,
            PolicyMode::Allowlist => self.config.allowed_modules.iter().any(|m| m == module),
            PolicyMode::Denylist => !self.config.denied_modules.iter().any(|m| m == module),
        }
    }

    pub fn rewrite_failure(&self) -> RewriteFailurePolicy {
        self.config.rewrite_failure
    }

    /// Returns the active policy config.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_allows_all() {
        let engine = PolicyEngine::with_config(PolicyConfig::default());
        assert!(engine.is_module_allowed("anything"));
        assert_eq!(engine.rewrite_failure(), RewriteFailurePolicy::FailOpen);
    }

    #[test]
    fn allowlist_mode() {
        let engine = PolicyEngine::with_config(PolicyConfig {
            mode: PolicyMode::Allowlist,
            allowed_modules: vec!["alpha".into()],
            ..Default::default()
        });
        assert!(engine.is_module_allowed("alpha"));
        assert!(!engine.is_module_allowed("beta"));
    }

    #[test]
    fn denylist_mode_blocks_listed_allows_others() {
        let engine = PolicyEngine::with_config(PolicyConfig {
            mode: PolicyMode::Denylist,
            denied_modules: vec!["evil".into()],
            ..Default::default()
        });
        assert!(!engine.is_module_allowed("evil"));
        assert!(engine.is_module_allowed("alpha"));
    }

    #[test]
    fn rewrite_failure_parses_kebab_case() {
        let config: PolicyConfig = toml::from_str(r#"rewrite_failure = "fail-closed""#).unwrap();
        assert_eq!(config.rewrite_failure, RewriteFailurePolicy::FailClosed);
        assert_eq!(config.mode, PolicyMode::Unrestricted);
    }
}
