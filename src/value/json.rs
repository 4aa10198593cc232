//! Conversion between runtime values and JSON
//!
//! `from_json`/`to_json` bridge to `serde_json` for injected variables and
//! execution results. `dumps` writes text itself so the output matches
//! Python's `json.dumps` byte for byte (separators, float repr, escaping).

use std::fmt::Write;

use serde_json::{Map, Number};

use crate::error::{Result, SafepyError};
use crate::value::format::{float_repr, repr};
use crate::value::{Dict, Value};

/// Convert parsed JSON into a runtime value; objects become insertion
/// ordered dicts
pub fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(s),
        serde_json::Value::Array(items) => {
            Value::list(items.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(map) => {
            let mut dict = Dict::new();
            for (key, value) in map {
                // string keys are always hashable
                let _ = dict.insert(Value::str(key), from_json(value));
            }
            Value::dict(dict)
        }
    }
}

fn not_serializable(value: &Value) -> SafepyError {
    SafepyError::type_error(format!(
        "Object of type {} is not JSON serializable",
        value.type_name()
    ))
}

/// JSON object key for a dict key, following `json.dumps` coercions
fn key_text(key: &Value) -> Result<String> {
    match key {
        Value::Str(s) => Ok(s.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(float_repr(*f)),
        Value::Bool(true) => Ok("true".to_string()),
        Value::Bool(false) => Ok("false".to_string()),
        Value::None => Ok("null".to_string()),
        other => Err(SafepyError::type_error(format!(
            "keys must be str, int, float, bool or None, not {}",
            other.type_name()
        ))),
    }
}

/// Nesting beyond this is treated as a reference cycle
const MAX_DEPTH: usize = 1_000;

/// Strict conversion; fails on values JSON cannot represent
pub fn to_json(value: &Value) -> Result<serde_json::Value> {
    to_json_at(value, 0)
}

fn to_json_at(value: &Value, depth: usize) -> Result<serde_json::Value> {
    if depth > MAX_DEPTH {
        return Err(SafepyError::value_error("Circular reference detected"));
    }
    let nested = |item: &Value| to_json_at(item, depth + 1);
    crate::stack::ensure_sufficient_stack(|| {
        let json = match value {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    SafepyError::value_error(format!(
                        "Out of range float values are not JSON compliant: {}",
                        float_repr(*f)
                    ))
                })?,
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::List(items) => serde_json::Value::Array(
                items.borrow().iter().map(nested).collect::<Result<_>>()?,
            ),
            Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(nested).collect::<Result<_>>()?)
            }
            Value::Dict(dict) => {
                let mut map = Map::new();
                for (key, item) in dict.borrow().iter() {
                    map.insert(key_text(key)?, nested(item)?);
                }
                serde_json::Value::Object(map)
            }
            other => return Err(not_serializable(other)),
        };
        Ok(json)
    })
}

/// Best-effort conversion for reporting results: anything JSON cannot
/// represent is rendered with `repr`
pub fn to_json_lossy(value: &Value) -> serde_json::Value {
    to_json_lossy_at(value, 0)
}

fn to_json_lossy_at(value: &Value, depth: usize) -> serde_json::Value {
    if depth > MAX_DEPTH {
        return serde_json::Value::String("...".to_string());
    }
    crate::stack::ensure_sufficient_stack(|| match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(float_repr(*f))),
        Value::Str(s) => serde_json::Value::String(s.to_string()),
        Value::List(_) | Value::Tuple(_) | Value::Set(_) => match value.iter() {
            Ok(items) => serde_json::Value::Array(items.map(|v| to_json_lossy_at(&v, depth + 1)).collect()),
            Err(_) => serde_json::Value::String(repr(value)),
        },
        Value::Dict(dict) => {
            let mut map = Map::new();
            for (key, item) in dict.borrow().iter() {
                let key = key_text(key).unwrap_or_else(|_| repr(key));
                map.insert(key, to_json_lossy_at(item, depth + 1));
            }
            serde_json::Value::Object(map)
        }
        other => serde_json::Value::String(other.to_string()),
    })
}

/// Options accepted by `json.dumps`
#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub indent: Option<String>,
    pub sort_keys: bool,
    pub ensure_ascii: bool,
    pub allow_nan: bool,
    pub item_separator: String,
    pub key_separator: String,
    /// Longest output accepted before failing with a MemoryError
    pub max_len: usize,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            indent: None,
            sort_keys: false,
            ensure_ascii: true,
            allow_nan: true,
            item_separator: ", ".to_string(),
            key_separator: ": ".to_string(),
            max_len: usize::MAX,
        }
    }
}

/// `json.dumps(value, ...)`
pub fn dumps(value: &Value, options: &DumpOptions) -> Result<String> {
    let mut writer = JsonWriter {
        out: String::new(),
        options,
        seen: Vec::new(),
    };
    writer.write(value, 0)?;
    Ok(writer.out)
}

struct JsonWriter<'a> {
    out: String,
    options: &'a DumpOptions,
    seen: Vec<usize>,
}

impl JsonWriter<'_> {
    fn write(&mut self, value: &Value, depth: usize) -> Result<()> {
        crate::stack::ensure_sufficient_stack(|| self.write_inner(value, depth))?;
        self.check_len(0)
    }

    fn check_len(&self, extra: usize) -> Result<()> {
        if self.out.len().saturating_add(extra) > self.options.max_len {
            return Err(SafepyError::memory(self.options.max_len));
        }
        Ok(())
    }

    fn write_inner(&mut self, value: &Value, depth: usize) -> Result<()> {
        match value {
            Value::None => self.out.push_str("null"),
            Value::Bool(true) => self.out.push_str("true"),
            Value::Bool(false) => self.out.push_str("false"),
            Value::Int(i) => {
                let _ = write!(self.out, "{}", i);
            }
            Value::Float(f) => self.write_float(*f)?,
            Value::Str(s) => self.write_str(s),
            Value::List(_) | Value::Tuple(_) => {
                let items: Vec<Value> = match value {
                    Value::List(items) => items.borrow().clone(),
                    Value::Tuple(items) => items.to_vec(),
                    _ => Vec::new(),
                };
                self.enter(value)?;
                self.write_sequence(&items, depth)?;
                self.seen.pop();
            }
            Value::Dict(dict) => {
                let mut entries = Vec::new();
                for (key, item) in dict.borrow().iter() {
                    entries.push((key_text(key)?, item.clone()));
                }
                if self.options.sort_keys {
                    entries.sort_by(|a, b| a.0.cmp(&b.0));
                }
                self.enter(value)?;
                self.write_object(&entries, depth)?;
                self.seen.pop();
            }
            other => return Err(not_serializable(other)),
        }
        Ok(())
    }

    fn enter(&mut self, value: &Value) -> Result<()> {
        if let Some(id) = value.identity() {
            if self.seen.contains(&id) {
                return Err(SafepyError::value_error("Circular reference detected"));
            }
            self.seen.push(id);
        } else {
            self.seen.push(0);
        }
        Ok(())
    }

    fn newline(&mut self, depth: usize) -> Result<()> {
        if let Some(indent) = &self.options.indent {
            self.check_len(indent.len().saturating_mul(depth).saturating_add(1))?;
            self.out.push('\n');
            for _ in 0..depth {
                self.out.push_str(indent);
            }
        }
        Ok(())
    }

    fn write_sequence(&mut self, items: &[Value], depth: usize) -> Result<()> {
        if items.is_empty() {
            self.out.push_str("[]");
            return Ok(());
        }
        self.out.push('[');
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.out.push_str(&self.options.item_separator);
            }
            self.newline(depth + 1)?;
            self.write(item, depth + 1)?;
        }
        self.newline(depth)?;
        self.out.push(']');
        Ok(())
    }

    fn write_object(&mut self, entries: &[(String, Value)], depth: usize) -> Result<()> {
        if entries.is_empty() {
            self.out.push_str("{}");
            return Ok(());
        }
        self.out.push('{');
        for (i, (key, item)) in entries.iter().enumerate() {
            if i > 0 {
                self.out.push_str(&self.options.item_separator);
            }
            self.newline(depth + 1)?;
            self.write_str(key);
            self.out.push_str(&self.options.key_separator);
            self.write(item, depth + 1)?;
        }
        self.newline(depth)?;
        self.out.push('}');
        Ok(())
    }

    fn write_float(&mut self, f: f64) -> Result<()> {
        if f.is_finite() {
            self.out.push_str(&float_repr(f));
            return Ok(());
        }
        if !self.options.allow_nan {
            return Err(SafepyError::value_error(format!(
                "Out of range float values are not JSON compliant: {}",
                float_repr(f)
            )));
        }
        self.out.push_str(if f.is_nan() {
            "NaN"
        } else if f > 0.0 {
            "Infinity"
        } else {
            "-Infinity"
        });
        Ok(())
    }

    fn write_str(&mut self, s: &str) {
        self.out.push('"');
        for c in s.chars() {
            match c {
                '"' => self.out.push_str("\\\""),
                '\\' => self.out.push_str("\\\\"),
                '\n' => self.out.push_str("\\n"),
                '\r' => self.out.push_str("\\r"),
                '\t' => self.out.push_str("\\t"),
                '\u{8}' => self.out.push_str("\\b"),
                '\u{c}' => self.out.push_str("\\f"),
                c if (c as u32) < 0x20 => {
                    let _ = write!(self.out, "\\u{:04x}", c as u32);
                }
                c if self.options.ensure_ascii && !c.is_ascii() => {
                    let mut units = [0u16; 2];
                    for unit in c.encode_utf16(&mut units) {
                        let _ = write!(self.out, "\\u{:04x}", unit);
                    }
                }
                c => self.out.push(c),
            }
        }
        self.out.push('"');
    }
}

/// `json.loads(text)`
pub fn loads(text: &str) -> Result<Value> {
    let parsed: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| SafepyError::RuntimeRestriction(format!("JSONDecodeError: {}", e)))?;
    Ok(from_json(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        loads(r#"{"name": "café", "scores": [1, 2.5, null], "ok": true}"#).unwrap()
    }

    #[test]
    fn test_dumps_matches_python_defaults() {
        let text = dumps(&sample(), &DumpOptions::default()).unwrap();
        assert_eq!(
            text,
            r#"{"name": "caf\u00e9", "scores": [1, 2.5, null], "ok": true}"#
        );
    }

    #[test]
    fn test_dumps_indent_and_sort_keys() {
        let options = DumpOptions {
            indent: Some("  ".to_string()),
            sort_keys: true,
            ensure_ascii: false,
            item_separator: ",".to_string(),
            ..DumpOptions::default()
        };
        let text = dumps(&sample(), &options).unwrap();
        assert_eq!(
            text,
            "{\n  \"name\": \"café\",\n  \"ok\": true,\n  \"scores\": [\n    1,\n    2.5,\n    null\n  ]\n}"
        );
    }

    #[test]
    fn test_dumps_rejects_sets_and_cycles() {
        let set = Value::set(crate::value::Set::new());
        assert!(dumps(&set, &DumpOptions::default())
            .unwrap_err()
            .message()
            .contains("not JSON serializable"));

        let list = Value::list(vec![]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert!(dumps(&list, &DumpOptions::default()).is_err());
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_conversion_depth_is_capped() {
        let mut deep = Value::list(vec![]);
        for _ in 0..5_000 {
            deep = Value::list(vec![deep]);
        }
        assert!(to_json(&deep).is_err());
        assert!(to_json_lossy(&deep).is_array());
    }

    #[test]
    fn test_loads_error_is_reported() {
        let err = loads("{bad").unwrap_err();
        assert!(err.message().starts_with("JSONDecodeError"));
    }

    #[test]
    fn test_round_trip_through_serde() {
        let value = sample();
        let json = to_json(&value).unwrap();
        assert_eq!(json["scores"][1], serde_json::json!(2.5));
        assert!(from_json(json).equals(&value));
    }

    #[test]
    fn test_lossy_conversion_renders_unsupported_values() {
        let value = Value::tuple(vec![Value::Float(f64::INFINITY), Value::Range(crate::value::Range {
            start: 0,
            stop: 3,
            step: 1,
        })]);
        let json = to_json_lossy(&value);
        assert_eq!(json, serde_json::json!(["inf", "range(0, 3)"]));
    }
}
