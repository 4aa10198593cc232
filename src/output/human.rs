//! Human-readable output formatting

use crate::error::SafepyError;
use crate::script::ExecutionResult;
use crate::value::Value;

pub fn format_human(result: &ExecutionResult) -> String {
    let mut output = result.logs.clone();

    if result.is_final_answer {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&format!("Final answer: {}\n", result.value));
    } else if !matches!(result.value, Value::None) {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&format!("{:?}\n", result.value));
    }

    output
}

pub fn format_human_error(error: &SafepyError, logs: &str) -> String {
    let mut output = logs.to_string();
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(&format!("{}\n", error));
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_shown_as_repr_after_logs() {
        let result = ExecutionResult {
            value: Value::str("done"),
            logs: "step 1\nstep 2".to_string(),
            is_final_answer: false,
        };
        assert_eq!(format_human(&result), "step 1\nstep 2\n'done'\n");
    }

    #[test]
    fn test_none_value_is_hidden() {
        let result = ExecutionResult {
            value: Value::None,
            logs: "hi\n".to_string(),
            is_final_answer: false,
        };
        assert_eq!(format_human(&result), "hi\n");
    }

    #[test]
    fn test_final_answer_uses_str() {
        let result = ExecutionResult {
            value: Value::str("42 apples"),
            logs: String::new(),
            is_final_answer: true,
        };
        assert_eq!(format_human(&result), "Final answer: 42 apples\n");
    }

    #[test]
    fn test_error_follows_logs() {
        let err = SafepyError::Name("name 'x' is not defined".to_string()).at_line(2);
        assert_eq!(
            format_human_error(&err, "before"),
            "before\nNameError: name 'x' is not defined (line 2)\n"
        );
    }
}
