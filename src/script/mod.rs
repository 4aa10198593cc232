//! Program checking and execution
//!
//! [`validator`] restricts a source unit to the sandboxed subset and
//! [`runner`] drives a whole `execute` call.

pub mod runner;
pub mod validator;

pub use runner::{ExecutionResult, Executor};
pub use validator::{
    has_errors, has_warnings, restrict, validate_program, RestrictedProgram, ValidationIssue,
    ValidationOptions, ValidationSeverity,
};
