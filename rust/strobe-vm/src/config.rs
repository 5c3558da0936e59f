//! Runtime configuration, read from the `[vm]` table of a TOML file.
//!
//! ```toml
//! [vm]
//! max_stack = 256
//! max_call_depth = 64
//! instruction_budget = 100000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest accepted `vm.max_call_depth`.
pub const MAX_CALL_DEPTH_CEILING: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    /// Operand stack limit per call frame.
    pub max_stack: usize,
    /// Nesting limit for user-defined function calls.
    pub max_call_depth: usize,
    /// Instructions one evaluation may execute across all frames.
    pub instruction_budget: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack: 256,
            max_call_depth: 64,
            instruction_budget: 100_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub vm: VmConfig,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the file at `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject limits no program could run under, and call depths past
    /// [`MAX_CALL_DEPTH_CEILING`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vm.max_stack == 0 {
            return Err(ConfigError::Invalid {
                key: "vm.max_stack",
                reason: "must be at least 1".into(),
            });
        }
        if self.vm.max_call_depth == 0 || self.vm.max_call_depth > MAX_CALL_DEPTH_CEILING {
            return Err(ConfigError::Invalid {
                key: "vm.max_call_depth",
                reason: format!("must be between 1 and {MAX_CALL_DEPTH_CEILING}"),
            });
        }
        if self.vm.instruction_budget == 0 {
            return Err(ConfigError::Invalid {
                key: "vm.instruction_budget",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.vm.max_stack, 256);
    }

    #[test]
    fn test_partial_table() {
        let config = RuntimeConfig::from_toml_str("[vm]\nmax_call_depth = 8\n").unwrap();
        assert_eq!(config.vm.max_call_depth, 8);
        assert_eq!(config.vm.instruction_budget, 100_000);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = RuntimeConfig::from_toml_str("[vm]\nturbo = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_stack_rejected() {
        let err = RuntimeConfig::from_toml_str("[vm]\nmax_stack = 0\n").unwrap_err();
        assert!(err.to_string().contains("vm.max_stack"));
    }

    #[test]
    fn test_call_depth_bounds() {
        let err = RuntimeConfig::from_toml_str("[vm]\nmax_call_depth = 1000000\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "vm.max_call_depth",
                ..
            }
        ));
        let err = RuntimeConfig::from_toml_str("[vm]\nmax_call_depth = 0\n").unwrap_err();
        assert!(err.to_string().contains("vm.max_call_depth"));

        let config = RuntimeConfig::from_toml_str("[vm]\nmax_call_depth = 1024\n").unwrap();
        assert_eq!(config.vm.max_call_depth, MAX_CALL_DEPTH_CEILING);
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeConfig::load_from(Path::new("/nonexistent/strobe.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
