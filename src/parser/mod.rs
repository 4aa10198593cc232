//! Parser for the sandboxed Python subset

pub mod ast;
pub mod grammar;
pub mod layout;

pub use ast::*;
pub use grammar::parse_program;
