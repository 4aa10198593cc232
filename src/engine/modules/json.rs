//! `json` module over the value codec in `value::json`

use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::value::json::{dumps as encode, loads as decode, DumpOptions};
use crate::value::{Arguments, Module, Value};

pub fn module() -> Module {
    Module::new("json")
        .function("dumps", dumps)
        .function("loads", loads)
}

fn separators(value: Value) -> Result<(String, String)> {
    let items: Vec<Value> = value.iter()?.collect();
    match items.as_slice() {
        [Value::Str(item), Value::Str(key)] => Ok((item.to_string(), key.to_string())),
        _ => Err(SafepyError::type_error(
            "separators must be a (item_separator, key_separator) pair of str",
        )),
    }
}

fn indent(value: Value, max_len: usize) -> Result<Option<String>> {
    match value {
        Value::None => Ok(None),
        Value::Str(s) => Ok(Some(s.to_string())),
        Value::Int(n) if n > 0 && n as u64 > max_len as u64 => Err(SafepyError::memory(max_len)),
        Value::Int(n) => Ok(Some(" ".repeat(n.max(0) as usize))),
        other => Err(SafepyError::type_error(format!(
            "indent must be None, int or str, not {}",
            other.type_name()
        ))),
    }
}

fn dump_options(args: &mut Arguments, max_len: usize) -> Result<DumpOptions> {
    let mut options = DumpOptions {
        max_len,
        ..DumpOptions::default()
    };
    if let Some(value) = args.take_keyword("indent") {
        options.indent = indent(value, max_len)?;
        if options.indent.is_some() {
            options.item_separator = ",".to_string();
        }
    }
    if let Some(value) = args.take_keyword("separators") {
        if !value.is_none() {
            (options.item_separator, options.key_separator) = separators(value)?;
        }
    }
    if let Some(value) = args.take_keyword("sort_keys") {
        options.sort_keys = value.truthy();
    }
    if let Some(value) = args.take_keyword("ensure_ascii") {
        options.ensure_ascii = value.truthy();
    }
    if let Some(value) = args.take_keyword("allow_nan") {
        options.allow_nan = value.truthy();
    }
    Ok(options)
}

fn dumps(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let options = dump_options(&mut args, interp.limits.max_collection_len)?;
    let [value] = args.exact::<1>("dumps")?;
    Ok(Value::str(encode(&value, &options)?))
}

fn loads(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [text] = args.exact::<1>("loads")?;
    match text {
        Value::Str(s) => Ok(decode(&s)?),
        other => Err(SafepyError::type_error(format!(
            "the JSON object must be str, not {}",
            other.type_name()
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indent_switches_item_separator() {
        let mut args = Arguments::new(vec![]);
        args.keywords.push(("indent".to_string(), Value::Int(2)));
        let options = dump_options(&mut args, 1_000).unwrap();
        assert_eq!(options.indent.as_deref(), Some("  "));
        assert_eq!(options.item_separator, ",");
        assert_eq!(options.key_separator, ": ");
    }

    #[test]
    fn test_explicit_separators_win() {
        let mut args = Arguments::new(vec![]);
        args.keywords.push((
            "separators".to_string(),
            Value::tuple(vec![Value::str(","), Value::str(":")]),
        ));
        let options = dump_options(&mut args, 1_000).unwrap();
        assert_eq!(options.item_separator, ",");
        assert_eq!(options.key_separator, ":");
    }

    #[test]
    fn test_oversized_indent_rejected() {
        let mut args = Arguments::new(vec![]);
        args.keywords.push(("indent".to_string(), Value::Int(1_000_000_000_000)));
        let err = dump_options(&mut args, 1_000).unwrap_err();
        assert!(err.message().starts_with("MemoryError"));

        let options = DumpOptions {
            indent: Some(" ".repeat(100)),
            max_len: 1_000,
            ..DumpOptions::default()
        };
        let nested = Value::list(vec![Value::list(vec![Value::list(vec![Value::Int(1); 5]); 5]); 5]);
        assert!(encode(&nested, &options).is_err());
    }

    #[test]
    fn test_bad_separators_rejected() {
        assert!(separators(Value::str(",:;")).is_err());
        assert!(separators(Value::Int(1)).is_err());
        assert_eq!(
            separators(Value::str(",:")).unwrap(),
            (",".to_string(), ":".to_string())
        );
    }
}
