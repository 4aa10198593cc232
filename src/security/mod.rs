//! Security policy for evaluated code
//!
//! [`allowlist`] decides which modules an import may load; [`policy`] holds
//! the fixed lists of names, attributes and modules the sandbox refuses.

pub mod allowlist;
pub mod policy;

pub use allowlist::{ImportGate, DEFAULT_ALLOWED};
pub use policy::{check_attribute, is_dunder, is_forbidden_name};
