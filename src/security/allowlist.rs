//! Import allow-list

use std::collections::BTreeSet;

use crate::error::{Result, SafepyError};
use crate::security::policy::is_denied_module;

/// Modules every executor may import
pub const DEFAULT_ALLOWED: &[&str] = &[
    "math",
    "random",
    "datetime",
    "time",
    "json",
    "re",
    "string",
    "collections",
    "itertools",
    "functools",
    "operator",
];

/// Dotted module names that may be imported when their package is allowed
const SUBMODULE_CARVE_OUTS: &[&str] = &[];

/// Resolved allow-list of one executor
#[derive(Debug, Clone)]
pub struct ImportGate {
    allowed: BTreeSet<String>,
}

impl Default for ImportGate {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl ImportGate {
    /// Built-in list plus `additional`, minus the permanently denied modules
    pub fn new<I, S>(additional: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: BTreeSet<String> =
            DEFAULT_ALLOWED.iter().map(|m| m.to_string()).collect();
        for module in additional {
            let module = module.as_ref().trim();
            if module.is_empty() {
                continue;
            }
            if is_denied_module(module) {
                tracing::warn!(module, "refusing to allow-list a denied module");
                continue;
            }
            allowed.insert(module.to_string());
        }
        Self { allowed }
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.check(name).is_ok()
    }

    /// Decide whether `name` (possibly dotted) may be imported
    pub fn check(&self, name: &str) -> Result<()> {
        let top = name.split('.').next().unwrap_or(name);
        if !self.allowed.contains(top) {
            return Err(SafepyError::ImportRestriction(format!(
                "import of module '{}' is not allowed; allowed modules: {}",
                name,
                self.allowed().join(", ")
            )));
        }
        if name.contains('.') && !SUBMODULE_CARVE_OUTS.contains(&name) {
            return Err(SafepyError::ImportRestriction(format!(
                "import of submodule '{}' is not allowed",
                name
            )));
        }
        Ok(())
    }

    /// Sorted module names
    pub fn allowed(&self) -> Vec<String> {
        self.allowed.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_allowed() {
        let gate = ImportGate::default();
        assert!(gate.is_allowed("math"));
        assert!(gate.is_allowed("collections"));
        assert!(!gate.is_allowed("statistics"));
        assert_eq!(gate.allowed().len(), DEFAULT_ALLOWED.len());
    }

    #[test]
    fn test_additions_merge_and_denied_are_dropped() {
        let gate = ImportGate::new(["statistics", "os", "subprocess", " copy "]);
        assert!(gate.is_allowed("statistics"));
        assert!(gate.is_allowed("copy"));
        assert!(!gate.is_allowed("os"));
        assert!(!gate.allowed().contains(&"subprocess".to_string()));
    }

    #[test]
    fn test_rejection_names_module() {
        let err = ImportGate::default().check("socket").unwrap_err();
        assert!(matches!(err, SafepyError::ImportRestriction(_)));
        assert!(err.message().contains("'socket'"));
    }

    #[test]
    fn test_submodules_are_rejected() {
        let err = ImportGate::default().check("collections.abc").unwrap_err();
        assert!(err.message().contains("submodule 'collections.abc'"));
    }

    #[test]
    fn test_allowed_is_sorted() {
        let gate = ImportGate::new(["copy"]);
        let list = gate.allowed();
        let mut sorted = list.clone();
        sorted.sort();
        assert_eq!(list, sorted);
    }
}
