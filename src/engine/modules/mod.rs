//! Natively implemented modules
//!
//! Each submodule builds a fresh [`Module`] on import. Whether a program may
//! import one at all is decided by the import gate before [`load`] is reached.

pub mod collections;
pub mod copy;
pub mod datetime;
pub mod functools;
pub mod itertools;
pub mod json;
pub mod math;
pub mod operator;
pub mod random;
pub mod re;
pub mod statistics;
pub mod string;
pub mod time;

use crate::value::Module;

/// Names of every module with a native implementation
pub const NATIVE_MODULES: &[&str] = &[
    "collections",
    "copy",
    "datetime",
    "functools",
    "itertools",
    "json",
    "math",
    "operator",
    "random",
    "re",
    "statistics",
    "string",
    "time",
];

/// Build the module object for an import that already passed the gate
pub fn load(name: &str) -> Option<Module> {
    let module = match name {
        "collections" => collections::module(),
        "copy" => copy::module(),
        "datetime" => datetime::module(),
        "functools" => functools::module(),
        "itertools" => itertools::module(),
        "json" => json::module(),
        "math" => math::module(),
        "operator" => operator::module(),
        "random" => random::module(),
        "re" => re::module(),
        "statistics" => statistics::module(),
        "string" => string::module(),
        "time" => time::module(),
        _ => return None,
    };
    Some(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_native_module_loads() {
        for name in NATIVE_MODULES {
            let module = load(name).unwrap();
            assert_eq!(module.name, *name);
            assert!(!module.members.is_empty());
        }
    }

    #[test]
    fn test_unknown_module_is_none() {
        assert!(load("os").is_none());
        assert!(load("numpy").is_none());
    }
}
