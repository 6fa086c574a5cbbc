//! Per-action limit rules.
//!
//! Operators describe a default limit plus optional overrides per action in
//! YAML. Fields left out of an action entry fall back to the default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::key::Action;
use super::policy::{LimitConfig, LimitOverride};
use crate::error::{BulwarkError, Result};

/// A complete rules document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Limit applied to actions without their own entry
    #[serde(default)]
    pub default: LimitConfig,
    /// Map of action name to its overrides
    #[serde(default)]
    pub actions: HashMap<String, LimitOverride>,
}

impl RateLimitRules {
    /// Rules with only the built-in default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| BulwarkError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Add or replace the overrides for one action.
    pub fn with_action(mut self, action: &str, overrides: LimitOverride) -> Self {
        self.actions.insert(action.to_string(), overrides);
        self
    }

    /// Check the default and every resolved action limit.
    pub fn validate(&self) -> Result<()> {
        self.default
            .validate()
            .map_err(|e| BulwarkError::Config(format!("default: {}", e)))?;

        for (action, overrides) in &self.actions {
            if action.is_empty() {
                return Err(BulwarkError::Config("action names must not be empty".to_string()));
            }
            self.default
                .merge(overrides)
                .validate()
                .map_err(|e| BulwarkError::Config(format!("action {}: {}", action, e)))?;
        }

        Ok(())
    }

    /// Resolve the limit that applies to `action`.
    pub fn find_limit(&self, action: &Action) -> LimitConfig {
        match self.actions.get(action.as_str()) {
            Some(overrides) => self.default.merge(overrides),
            None => self.default,
        }
    }
}
