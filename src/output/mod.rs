//! Output capture and result formatting

pub mod capture;
pub mod formatter;
pub mod human;
pub mod json;

pub use capture::PrintBuffer;
pub use formatter::{format_error, format_output, OutputFormat};
