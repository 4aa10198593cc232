//! Executor configuration
//!
//! Every field has a default, so a config file only needs the values it
//! overrides:
//!
//! ```json
//! { "allowed_imports": ["statistics"], "limits": { "max_operations": 100000 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SafepyError};

pub const DEFAULT_MAX_OPERATIONS: u64 = 10_000_000;
pub const DEFAULT_MAX_WHILE_ITERATIONS: u64 = 1_000_000;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1000;
pub const DEFAULT_MAX_COLLECTION_LEN: usize = 10_000_000;
pub const DEFAULT_MAX_OUTPUT_LEN: usize = 50_000;
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 20;
pub const DEFAULT_MAX_EXPRESSION_DEPTH: usize = 200;

/// Resource budgets enforced while restricting and evaluating a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Evaluation steps per `execute` call
    pub max_operations: u64,
    /// Iterations of a single `while` loop
    pub max_while_iterations: u64,
    /// Nested function calls
    pub max_call_depth: usize,
    /// Items produced by sequence repetition or range materialisation
    pub max_collection_len: usize,
    /// Characters of captured `print` output
    pub max_output_len: usize,
    /// Nested statement blocks
    pub max_nesting_depth: usize,
    /// Nested expressions
    pub max_expression_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_while_iterations: DEFAULT_MAX_WHILE_ITERATIONS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_collection_len: DEFAULT_MAX_COLLECTION_LEN,
            max_output_len: DEFAULT_MAX_OUTPUT_LEN,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            max_expression_depth: DEFAULT_MAX_EXPRESSION_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Modules allowed on top of the built-in list
    pub allowed_imports: Vec<String>,
    pub limits: Limits,
    /// Seed for the `random` module; entropy when unset
    pub random_seed: Option<u64>,
}

impl ExecutorConfig {
    /// Load a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            SafepyError::RuntimeRestriction(format!(
                "invalid config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let limits = Limits::default();
        assert_eq!(limits.max_operations, 10_000_000);
        assert_eq!(limits.max_while_iterations, 1_000_000);
        assert_eq!(limits.max_output_len, 50_000);
        assert_eq!(limits.max_nesting_depth, 20);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"allowed_imports": ["statistics"], "limits": {{"max_call_depth": 50}}}}"#
        )
        .unwrap();

        let config = ExecutorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.allowed_imports, vec!["statistics"]);
        assert_eq!(config.limits.max_call_depth, 50);
        assert_eq!(config.limits.max_operations, DEFAULT_MAX_OPERATIONS);
        assert!(config.random_seed.is_none());
    }

    #[test]
    fn test_bad_file_is_reported() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = ExecutorConfig::from_file(file.path()).unwrap_err();
        assert!(err.message().contains("invalid config file"));
    }
}
