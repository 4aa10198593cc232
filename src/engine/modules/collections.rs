//! `collections` module
//!
//! `Counter` and `defaultdict` are dict flavours, `OrderedDict` is a plain
//! dict (dicts keep insertion order) and `deque` is a list with the deque
//! methods added.

use crate::engine::builtins::update_dict;
use crate::engine::{EvalResult, Interpreter};
use crate::error::SafepyError;
use crate::value::{Arguments, Builtin, BuiltinFn, Dict, DictFlavor, Module, Value};

const CLASSES: &[(&str, BuiltinFn)] = &[
    ("Counter", counter),
    ("defaultdict", defaultdict),
    ("OrderedDict", ordered_dict),
    ("deque", deque),
];

pub fn module() -> Module {
    CLASSES
        .iter()
        .fold(Module::new("collections"), |module, (name, func)| {
            module.class(*name, *func)
        })
}

/// Class object for a `collections` type name
pub fn class_named(name: &str) -> Option<Builtin> {
    CLASSES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(n, func)| Builtin::class(*n, *func))
}

/// Add (`sign = 1`) or subtract (`sign = -1`) counts from a mapping or iterable
pub fn counter_update(
    interp: &mut Interpreter<'_>,
    counts: &mut Dict,
    source: &Value,
    sign: i64,
) -> EvalResult<()> {
    let pairs: Vec<(Value, i64)> = match source {
        Value::Dict(mapping) => mapping
            .borrow()
            .items()
            .into_iter()
            .map(|(k, v)| Ok((k, v.as_int()?)))
            .collect::<crate::error::Result<_>>()?,
        other => interp
            .collect(other)?
            .into_iter()
            .map(|k| (k, 1))
            .collect(),
    };
    for (key, delta) in pairs {
        let current = match counts.get(&key)? {
            Some(value) => value.as_int()?,
            None => 0,
        };
        let updated = delta
            .checked_mul(sign)
            .and_then(|d| current.checked_add(d))
            .ok_or_else(|| SafepyError::overflow("count does not fit in 64 bits"))?;
        counts.insert(key, Value::Int(updated))?;
    }
    Ok(())
}

fn counter(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let keywords = std::mem::take(&mut args.keywords);
    let values = args.between("Counter", 0, 1)?;
    let mut counts = Dict::with_flavor(DictFlavor::Counter);
    if let Some(source) = values.first() {
        counter_update(interp, &mut counts, source, 1)?;
    }
    if !keywords.is_empty() {
        let extra = Dict::from_pairs(keywords.into_iter().map(|(k, v)| (Value::str(k), v)))?;
        counter_update(interp, &mut counts, &Value::dict(extra), 1)?;
    }
    Ok(Value::dict(counts))
}

fn defaultdict(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let keywords = std::mem::take(&mut args.keywords);
    let values = args.between("defaultdict", 0, 2)?;
    let mut values = values.into_iter();
    let factory = values.next().unwrap_or(Value::None);
    if !factory.is_none() && !factory.is_callable() {
        return Err(
            SafepyError::type_error("first argument must be callable or None").into(),
        );
    }
    let mut dict = Dict::with_flavor(DictFlavor::DefaultDict(factory));
    if let Some(source) = values.next() {
        update_dict(interp, &mut dict, &source)?;
    }
    for (key, value) in keywords {
        dict.insert(Value::str(key), value)?;
    }
    Ok(Value::dict(dict))
}

fn ordered_dict(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let keywords = std::mem::take(&mut args.keywords);
    let values = args.between("OrderedDict", 0, 1)?;
    let mut dict = Dict::new();
    if let Some(source) = values.first() {
        update_dict(interp, &mut dict, source)?;
    }
    for (key, value) in keywords {
        dict.insert(Value::str(key), value)?;
    }
    Ok(Value::dict(dict))
}

fn deque(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let maxlen = args.take_keyword("maxlen");
    let mut values = args.between("deque", 0, 2)?;
    let maxlen = if values.len() == 2 { values.pop() } else { maxlen };
    let mut items = match values.first() {
        Some(iterable) => interp.collect(iterable)?,
        None => Vec::new(),
    };
    if let Some(maxlen) = maxlen.filter(|m| !m.is_none()) {
        let maxlen = maxlen.as_int()?;
        if maxlen < 0 {
            return Err(SafepyError::value_error("maxlen must be non-negative").into());
        }
        // bounded deques keep the newest items; the bound itself is not enforced later
        let excess = items.len().saturating_sub(maxlen as usize);
        items.drain(..excess);
    }
    Ok(Value::list(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_lookup() {
        assert_eq!(class_named("Counter").map(|b| b.name), Some("Counter"));
        assert!(class_named("namedtuple").is_none());
    }

    #[test]
    fn test_module_exposes_classes() {
        let module = module();
        for name in ["Counter", "defaultdict", "OrderedDict", "deque"] {
            assert!(module.get(name).is_some(), "missing {}", name);
        }
    }
}
