//! Fixed deny lists

use crate::error::{Result, SafepyError};

/// Modules that can never be allow-listed, whatever the caller asks for
pub const DENIED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "io",
    "pathlib",
    "shutil",
    "importlib",
    "builtins",
    "ctypes",
    "pickle",
    "marshal",
    "inspect",
    "gc",
    "threading",
    "multiprocessing",
    "signal",
    "posix",
    "nt",
    "pty",
    "tempfile",
    "glob",
    "urllib",
    "http",
    "asyncio",
    "code",
    "codeop",
    "runpy",
    "types",
    "resource",
    "fcntl",
];

/// Names that reach dynamic code execution or host primitives
pub const FORBIDDEN_NAMES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "globals",
    "locals",
    "vars",
    "breakpoint",
    "input",
    "exit",
    "quit",
    "help",
    "memoryview",
    "setattr",
    "delattr",
    "super",
    "object",
];

pub fn is_denied_module(name: &str) -> bool {
    let top = name.split('.').next().unwrap_or(name);
    DENIED_MODULES.contains(&top)
}

pub fn is_forbidden_name(name: &str) -> bool {
    FORBIDDEN_NAMES.contains(&name)
}

/// `__name__` style identifiers
pub fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Attribute names evaluated code may not touch: anything starting with `_`
pub fn check_attribute(name: &str) -> Result<()> {
    if name.starts_with('_') {
        return Err(SafepyError::SyntaxRestriction(format!(
            "access to attribute '{}' is not allowed",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_modules_match_top_level() {
        assert!(is_denied_module("os"));
        assert!(is_denied_module("os.path"));
        assert!(!is_denied_module("math"));
        assert!(!is_denied_module("osx"));
    }

    #[test]
    fn test_dunder_detection() {
        assert!(is_dunder("__class__"));
        assert!(is_dunder("__import__"));
        assert!(!is_dunder("__"));
        assert!(!is_dunder("_private"));
        assert!(!is_dunder("__x"));
    }

    #[test]
    fn test_private_attributes_rejected() {
        assert!(check_attribute("upper").is_ok());
        let err = check_attribute("_fields").unwrap_err();
        assert!(matches!(err, SafepyError::SyntaxRestriction(_)));
        assert!(check_attribute("__dict__").is_err());
    }
}
