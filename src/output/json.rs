//! JSON output formatting

use serde_json::{json, Value};

use crate::error::SafepyError;
use crate::script::ExecutionResult;

pub fn format_json(result: &ExecutionResult) -> String {
    serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".to_string())
}

pub fn format_json_error(error: &SafepyError, logs: &str) -> String {
    let data: Value = json!({
        "error": error.report(),
        "logs": logs,
    });
    serde_json::to_string_pretty(&data).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value as PyValue;

    #[test]
    fn test_result_fields() {
        let result = ExecutionResult {
            value: PyValue::list(vec![PyValue::Int(1), PyValue::str("a")]),
            logs: "x\n".to_string(),
            is_final_answer: true,
        };
        let parsed: Value = serde_json::from_str(&format_json(&result)).unwrap();
        assert_eq!(parsed["value"], json!([1, "a"]));
        assert_eq!(parsed["logs"], "x\n");
        assert_eq!(parsed["is_final_answer"], true);
    }

    #[test]
    fn test_error_report() {
        let err = SafepyError::ImportRestriction("import of module 'os' is not allowed".into());
        let parsed: Value = serde_json::from_str(&format_json_error(&err, "")).unwrap();
        assert_eq!(parsed["error"]["kind"], "ImportRestriction");
        assert_eq!(parsed["logs"], "");
    }
}
