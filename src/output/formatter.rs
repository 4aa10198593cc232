//! Output formatting

use crate::error::SafepyError;
use crate::output::human::{format_human, format_human_error};
use crate::output::json::{format_json, format_json_error};
use crate::script::ExecutionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

pub fn format_output(result: &ExecutionResult, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Human => format_human(result),
        OutputFormat::Json => format_json(result),
    }
}

/// Render a failed execution together with whatever it printed first
pub fn format_error(error: &SafepyError, logs: &str, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Human => format_human_error(error, logs),
        OutputFormat::Json => format_json_error(error, logs),
    }
}
