//! Command line interface

pub mod args;

pub use args::{parse_var, Args, LimitArgs, SubCommand};
