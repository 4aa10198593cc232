//! Builtin functions and types visible to every program

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::engine::modules::{collections, datetime, math};
use crate::engine::{operators, EvalResult, Interpreter, Interrupt};
use crate::error::{Result, SafepyError};
use crate::parser::ast::BinOp;
use crate::security::policy;
use crate::value::format::{format_value, repr, to_str};
use crate::value::{
    Arguments, Builtin, BuiltinFn, BuiltinKind, Dict, HashKey, IterSource, IterState, Range, Set,
    Temporal, Value,
};

const FUNCTIONS: &[(&str, BuiltinFn)] = &[
    ("print", print),
    ("len", len),
    ("isinstance", isinstance),
    ("abs", abs),
    ("round", round),
    ("min", min),
    ("max", max),
    ("sum", sum),
    ("sorted", sorted),
    ("reversed", reversed),
    ("enumerate", enumerate),
    ("zip", zip),
    ("map", map),
    ("filter", filter),
    ("all", all),
    ("any", any),
    ("iter", iter),
    ("next", next),
    ("ord", ord),
    ("chr", chr),
    ("divmod", divmod),
    ("pow", pow),
    ("repr", repr_),
    ("hex", hex),
    ("bin", bin),
    ("oct", oct),
    ("hash", hash),
    ("callable", callable),
    ("getattr", getattr),
    ("hasattr", hasattr),
    ("format", format),
    ("sqrt", math::sqrt),
    ("ceil", math::ceil),
    ("floor", math::floor),
    ("log", math::log),
    ("exp", math::exp),
    ("sin", math::sin),
    ("cos", math::cos),
    ("tan", math::tan),
    ("asin", math::asin),
    ("acos", math::acos),
    ("atan", math::atan),
    ("atan2", math::atan2),
    ("degrees", math::degrees),
    ("radians", math::radians),
    ("final_answer", final_answer),
];

const CLASSES: &[(&str, BuiltinFn)] = &[
    ("int", int),
    ("float", float),
    ("str", str_),
    ("bool", bool_),
    ("list", list),
    ("tuple", tuple),
    ("dict", dict),
    ("set", set),
    ("range", range),
    ("type", type_),
];

/// The builtin namespace
pub fn table() -> HashMap<&'static str, Value> {
    let functions = FUNCTIONS
        .iter()
        .map(|(name, func)| (*name, Value::Builtin(Builtin::function(*name, *func))));
    let classes = CLASSES
        .iter()
        .map(|(name, func)| (*name, Value::Builtin(Builtin::class(*name, *func))));
    functions.chain(classes).collect()
}

/// Whether `name` is a builtin function or type
pub fn is_builtin(name: &str) -> bool {
    FUNCTIONS.iter().chain(CLASSES).any(|(n, _)| *n == name)
}

fn no_instances(_: &mut Interpreter<'_>, _: Arguments) -> EvalResult<Value> {
    Err(SafepyError::type_error("cannot create instances of this type").into())
}

/// The class object reported by `type(value)`
pub fn type_of(value: &Value) -> Builtin {
    let name = value.type_name();
    CLASSES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(n, func)| Builtin::class(*n, *func))
        .or_else(|| datetime::class_named(name))
        .or_else(|| collections::class_named(name))
        .unwrap_or_else(|| Builtin::class(name, no_instances))
}

/// `isinstance` check against one class
pub fn type_matches(value: &Value, class: &str) -> bool {
    match (class, value) {
        ("int", Value::Int(_) | Value::Bool(_)) => true,
        ("dict" | "OrderedDict", Value::Dict(_)) => true,
        ("deque", Value::List(_)) => true,
        ("date", Value::Temporal(Temporal::Date(_) | Temporal::DateTime(_))) => true,
        ("type", Value::Builtin(b)) => b.kind == BuiltinKind::Type,
        _ => value.type_name() == class,
    }
}

// ============================================================================
// Conversions shared with methods and modules
// ============================================================================

/// Truncate a float to an int the way `int()` does
pub fn float_to_int(f: f64) -> Result<i64> {
    if f.is_nan() {
        return Err(SafepyError::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(SafepyError::overflow("cannot convert float infinity to integer"));
    }
    let t = f.trunc();
    if t < i64::MIN as f64 || t >= i64::MAX as f64 {
        return Err(SafepyError::overflow("int too large to convert"));
    }
    Ok(t as i64)
}

/// Digits with Python's underscore rule: single underscores between digits
fn strip_underscores(digits: &str) -> Option<String> {
    if digits.starts_with('_') || digits.ends_with('_') || digits.contains("__") {
        return None;
    }
    Some(digits.replace('_', ""))
}

/// `int(text, base)`
pub fn parse_int(text: &str, base: u32) -> Result<i64> {
    let invalid = || {
        SafepyError::value_error(format!(
            "invalid literal for int() with base {}: {}",
            base,
            repr(&Value::str(text))
        ))
    };
    let trimmed = text.trim();
    let (negative, body) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = body.to_ascii_lowercase();
    let (radix, digits) = match (base, lower.get(..2)) {
        (0 | 16, Some("0x")) => (16, &body[2..]),
        (0 | 8, Some("0o")) => (8, &body[2..]),
        (0 | 2, Some("0b")) => (2, &body[2..]),
        (0, _) => (10, body),
        (base, _) => (base, body),
    };
    // prefixed digits may start with one underscore: 0x_ff
    let digits = if digits.len() != body.len() {
        digits.strip_prefix('_').unwrap_or(digits)
    } else {
        digits
    };
    let digits = strip_underscores(digits).ok_or_else(invalid)?;
    if digits.is_empty() {
        return Err(invalid());
    }
    let mut acc: i128 = 0;
    for c in digits.chars() {
        let d = c.to_digit(radix).ok_or_else(invalid)?;
        acc = acc * radix as i128 + d as i128;
        if acc > i64::MAX as i128 + 1 {
            return Err(SafepyError::overflow("int too large to convert"));
        }
    }
    let acc = if negative { -acc } else { acc };
    i64::try_from(acc).map_err(|_| SafepyError::overflow("int too large to convert"))
}

/// `float(text)`
pub fn parse_float(text: &str) -> Result<f64> {
    let invalid = || {
        SafepyError::value_error(format!(
            "could not convert string to float: {}",
            repr(&Value::str(text))
        ))
    };
    let trimmed = text.trim();
    let (sign, body) = match trimmed.as_bytes().first() {
        Some(b'-') => (-1.0, &trimmed[1..]),
        Some(b'+') => (1.0, &trimmed[1..]),
        _ => (1.0, trimmed),
    };
    match body.to_ascii_lowercase().as_str() {
        "inf" | "infinity" => return Ok(sign * f64::INFINITY),
        "nan" => return Ok(f64::NAN),
        _ => {}
    }
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit() || "._eE+-".contains(c)) {
        return Err(invalid());
    }
    let cleaned = strip_underscores(body).ok_or_else(invalid)?;
    cleaned
        .parse::<f64>()
        .map(|f| sign * f)
        .map_err(|_| invalid())
}

/// Iterator object over a value, sharing state when it already is one
pub fn make_iterator(value: &Value) -> Result<Value> {
    let kind = match value {
        Value::Iterator(_) => return Ok(value.clone()),
        Value::Range(r) => {
            return Ok(Value::Iterator(Rc::new(RefCell::new(IterState {
                kind: "range_iterator",
                source: IterSource::Range {
                    next: r.start,
                    remaining: r.len(),
                    step: r.step,
                },
            }))))
        }
        Value::List(_) => "list_iterator",
        Value::Tuple(_) => "tuple_iterator",
        Value::Str(_) => "str_iterator",
        Value::Dict(_) => "dict_keyiterator",
        Value::Set(_) => "set_iterator",
        other => {
            return Err(SafepyError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
    };
    Ok(Value::iterator(kind, value.iter()?))
}

// ============================================================================
// Output and introspection
// ============================================================================

fn text_keyword(value: Option<Value>, default: &str, name: &str) -> Result<String> {
    match value {
        None | Some(Value::None) => Ok(default.to_string()),
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(other) => Err(SafepyError::type_error(format!(
            "{} must be None or a string, not {}",
            name,
            other.type_name()
        ))),
    }
}

fn print(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let sep = text_keyword(args.take_keyword("sep"), " ", "sep")?;
    let end = text_keyword(args.take_keyword("end"), "\n", "end")?;
    args.take_keyword("flush");
    args.finish("print")?;
    let mut line = args
        .positional
        .iter()
        .map(to_str)
        .collect::<Vec<_>>()
        .join(&sep);
    line.push_str(&end);
    interp.output.write(&line);
    Ok(Value::None)
}

fn len(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("len")?;
    Ok(Value::Int(value.len()? as i64))
}

fn type_(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("type")?;
    Ok(Value::Builtin(type_of(&value)))
}

fn isinstance(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value, classes] = args.exact::<2>("isinstance")?;
    let candidates = match &classes {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    for class in &candidates {
        match class {
            Value::Builtin(b) if b.kind == BuiltinKind::Type => {
                if type_matches(&value, b.name) {
                    return Ok(Value::Bool(true));
                }
            }
            _ => {
                return Err(SafepyError::type_error(
                    "isinstance() arg 2 must be a type, a tuple of types, or a union",
                )
                .into())
            }
        }
    }
    Ok(Value::Bool(false))
}

fn callable(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("callable")?;
    Ok(Value::Bool(value.is_callable()))
}

fn repr_(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("repr")?;
    Ok(Value::str(repr(&value)))
}

fn format(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("format", 1, 2)?;
    let spec = match values.get(1) {
        Some(spec) => spec.as_str()?.to_string(),
        None => String::new(),
    };
    let value = values.swap_remove(0);
    Ok(Value::str(format_value(&value, &spec, interp.limits.max_collection_len)?))
}

fn is_attribute_error(error: &SafepyError) -> bool {
    error.message().starts_with("AttributeError")
}

fn getattr(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("getattr", 2, 3)?;
    let default = if values.len() == 3 { values.pop() } else { None };
    let name = values[1].as_str().map_err(|_| {
        SafepyError::type_error("attribute name must be string")
    })?;
    policy::check_attribute(&name)?;
    match interp.get_attribute(&values[0], &name) {
        Err(Interrupt::Error(e)) if is_attribute_error(&e) => default.ok_or(Interrupt::Error(e)),
        result => result,
    }
}

fn hasattr(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value, name] = args.exact::<2>("hasattr")?;
    let name = name
        .as_str()
        .map_err(|_| SafepyError::type_error("attribute name must be string"))?;
    policy::check_attribute(&name)?;
    match interp.get_attribute(&value, &name) {
        Ok(_) => Ok(Value::Bool(true)),
        Err(Interrupt::Error(e)) if is_attribute_error(&e) => Ok(Value::Bool(false)),
        Err(e) => Err(e),
    }
}

fn hash(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("hash")?;
    let key = HashKey::of(&value)?;
    let hashed = match key {
        HashKey::Int(-1) => -2,
        HashKey::Int(i) => i,
        key => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            hasher.finish() as i64
        }
    };
    Ok(Value::Int(hashed))
}

fn final_answer(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let answer = args.take_keyword("answer");
    let mut values = args.between("final_answer", 0, 1)?;
    let answer = values.pop().or(answer).unwrap_or(Value::None);
    Err(Interrupt::FinalAnswer(answer))
}

// ============================================================================
// Constructors
// ============================================================================

fn int(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let base = args.take_keyword("base");
    let mut values = args.between("int", 0, 2)?;
    let base = if values.len() == 2 { values.pop() } else { base };
    let Some(value) = values.pop() else {
        return Ok(Value::Int(0));
    };
    if let Some(base) = base {
        let base = base.as_int()?;
        let Value::Str(text) = &value else {
            return Err(SafepyError::type_error(
                "int() can't convert non-string with explicit base",
            )
            .into());
        };
        if base != 0 && !(2..=36).contains(&base) {
            return Err(
                SafepyError::value_error("int() base must be >= 2 and <= 36, or 0").into(),
            );
        }
        return Ok(Value::Int(parse_int(text, base as u32)?));
    }
    let result = match &value {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        Value::Float(f) => float_to_int(*f)?,
        Value::Str(s) => parse_int(s, 10)?,
        other => {
            return Err(SafepyError::type_error(format!(
                "int() argument must be a string or a real number, not '{}'",
                other.type_name()
            ))
            .into())
        }
    };
    Ok(Value::Int(result))
}

fn float(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("float", 0, 1)?;
    let result = match values.pop() {
        None => 0.0,
        Some(Value::Str(s)) => parse_float(&s)?,
        Some(v) if v.is_number() => v.as_float()?,
        Some(other) => {
            return Err(SafepyError::type_error(format!(
                "float() argument must be a string or a real number, not '{}'",
                other.type_name()
            ))
            .into())
        }
    };
    Ok(Value::Float(result))
}

fn str_(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("str", 0, 1)?;
    Ok(match values.pop() {
        None => Value::str(""),
        Some(value @ Value::Str(_)) => value,
        Some(value) => Value::str(to_str(&value)),
    })
}

fn bool_(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("bool", 0, 1)?;
    Ok(Value::Bool(values.pop().map(|v| v.truthy()).unwrap_or(false)))
}

fn list(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("list", 0, 1)?;
    Ok(match values.pop() {
        None => Value::list(Vec::new()),
        Some(iterable) => Value::list(interp.collect(&iterable)?),
    })
}

fn tuple(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("tuple", 0, 1)?;
    Ok(match values.pop() {
        None => Value::tuple(Vec::new()),
        Some(value @ Value::Tuple(_)) => value,
        Some(iterable) => Value::tuple(interp.collect(&iterable)?),
    })
}

fn set(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("set", 0, 1)?;
    Ok(match values.pop() {
        None => Value::set(Set::new()),
        Some(iterable) => Value::set(Set::from_values(interp.collect(&iterable)?)?),
    })
}

/// Fill `dict` from a mapping or an iterable of pairs
pub fn update_dict(interp: &mut Interpreter<'_>, dict: &mut Dict, source: &Value) -> EvalResult<()> {
    if let Value::Dict(other) = source {
        for (key, value) in other.borrow().items() {
            dict.insert(key, value)?;
        }
        return Ok(());
    }
    for (i, pair) in interp.collect(source)?.into_iter().enumerate() {
        let items = pair.iter().map_err(|_| {
            SafepyError::type_error(format!(
                "cannot convert dictionary update sequence element #{} to a sequence",
                i
            ))
        })?;
        let items: Vec<Value> = items.collect();
        let [key, value]: [Value; 2] = items.try_into().map_err(|items: Vec<Value>| {
            SafepyError::value_error(format!(
                "dictionary update sequence element #{} has length {}; 2 is required",
                i,
                items.len()
            ))
        })?;
        dict.insert(key, value)?;
    }
    Ok(())
}

fn dict(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let keywords = args.keywords.clone();
    let values = Arguments::new(args.positional).between("dict", 0, 1)?;
    let mut dict = Dict::new();
    if let Some(source) = values.first() {
        update_dict(interp, &mut dict, source)?;
    }
    for (key, value) in keywords {
        dict.insert(Value::str(key), value)?;
    }
    Ok(Value::dict(dict))
}

fn range(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = args.between("range", 1, 3)?;
    let ints = values
        .iter()
        .map(Value::as_int)
        .collect::<Result<Vec<i64>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(SafepyError::internal("range arity").into()),
    };
    if step == 0 {
        return Err(SafepyError::value_error("range() arg 3 must not be zero").into());
    }
    Ok(Value::Range(Range { start, stop, step }))
}

// ============================================================================
// Numbers
// ============================================================================

fn abs(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("abs")?;
    let result = match &value {
        Value::Int(_) | Value::Bool(_) => Value::Int(
            value
                .as_int()?
                .checked_abs()
                .ok_or_else(|| SafepyError::overflow("integer absolute value does not fit in 64 bits"))?,
        ),
        Value::Float(f) => Value::Float(f.abs()),
        Value::Temporal(Temporal::Delta(d)) => Value::Temporal(Temporal::Delta(d.abs())),
        other => {
            return Err(SafepyError::type_error(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            ))
            .into())
        }
    };
    Ok(result)
}

/// Round half to even at a decimal position, matching Python's exact rounding
pub fn round_float(f: f64, ndigits: i64) -> f64 {
    if !f.is_finite() {
        return f;
    }
    if ndigits >= 0 {
        if ndigits > 320 {
            return f;
        }
        // decimal formatting rounds the exact binary value half to even
        return format!("{:.*}", ndigits as usize, f).parse().unwrap_or(f);
    }
    let scale = 10f64.powi(ndigits.saturating_neg().min(400) as i32);
    if scale.is_infinite() {
        return 0.0 * f;
    }
    (f / scale).round_ties_even() * scale
}

fn round_int(i: i64, ndigits: i64) -> Result<i64> {
    if ndigits >= 0 {
        return Ok(i);
    }
    let Some(scale) = u32::try_from(ndigits.saturating_neg()).ok().and_then(|e| 10i64.checked_pow(e)) else {
        return Ok(0);
    };
    let q = i.div_euclid(scale);
    let r = i.rem_euclid(scale);
    let q = match (2 * r as i128).cmp(&(scale as i128)) {
        Ordering::Greater => q + 1,
        Ordering::Equal if q % 2 != 0 => q + 1,
        _ => q,
    };
    q.checked_mul(scale)
        .ok_or_else(|| SafepyError::overflow("rounded integer does not fit in 64 bits"))
}

fn round(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let ndigits = args.take_keyword("ndigits");
    let mut values = args.between("round", 1, 2)?;
    let ndigits = if values.len() == 2 { values.pop() } else { ndigits };
    let ndigits = match ndigits {
        None | Some(Value::None) => None,
        Some(n) => Some(n.as_int()?),
    };
    let number = values.swap_remove(0);
    let result = match (&number, ndigits) {
        (Value::Int(_) | Value::Bool(_), None) => Value::Int(number.as_int()?),
        (Value::Int(_) | Value::Bool(_), Some(n)) => Value::Int(round_int(number.as_int()?, n)?),
        (Value::Float(f), None) => Value::Int(float_to_int(f.round_ties_even())?),
        (Value::Float(f), Some(n)) => Value::Float(round_float(*f, n)),
        (other, _) => {
            return Err(SafepyError::type_error(format!(
                "type {} doesn't define __round__ method",
                other.type_name()
            ))
            .into())
        }
    };
    Ok(result)
}

fn divmod(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [a, b] = args.exact::<2>("divmod")?;
    let quotient = operators::binary(BinOp::FloorDiv, &a, &b, interp.limits)?;
    let remainder = operators::binary(BinOp::Mod, &a, &b, interp.limits)?;
    Ok(Value::tuple(vec![quotient, remainder]))
}

fn pow(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let modulus = args.take_keyword("mod");
    let mut values = args.between("pow", 2, 3)?;
    let modulus = if values.len() == 3 { values.pop() } else { modulus };
    let exp = values.pop().unwrap_or(Value::None);
    let base = values.pop().unwrap_or(Value::None);
    match modulus {
        None | Some(Value::None) => {
            Ok(operators::binary(BinOp::Pow, &base, &exp, interp.limits)?)
        }
        Some(modulus) => {
            let (base, exp, modulus) = (base.as_int()?, exp.as_int()?, modulus.as_int()?);
            if modulus == 0 {
                return Err(SafepyError::value_error("pow() 3rd argument cannot be 0").into());
            }
            if exp < 0 {
                return Err(SafepyError::value_error(
                    "pow() 2nd argument cannot be negative when 3rd argument specified",
                )
                .into());
            }
            let m = modulus as i128;
            let mut result: i128 = 1;
            let mut b = (base as i128).rem_euclid(m);
            let mut e = exp;
            while e > 0 {
                if e & 1 == 1 {
                    result = (result * b).rem_euclid(m);
                }
                b = (b * b).rem_euclid(m);
                e >>= 1;
            }
            // Python's result takes the sign of the modulus
            let result = if modulus < 0 && result > 0 { result + m } else { result.rem_euclid(m) };
            Ok(Value::Int(result as i64))
        }
    }
}

fn radix(value: &Value, prefix: &str, name: &str) -> Result<Value> {
    let i = match value {
        Value::Int(_) | Value::Bool(_) => value.as_int()?,
        other => {
            return Err(SafepyError::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            )))
        }
    };
    let magnitude = i.unsigned_abs();
    let digits = match name {
        "hex" => format!("{:x}", magnitude),
        "oct" => format!("{:o}", magnitude),
        _ => format!("{:b}", magnitude),
    };
    let sign = if i < 0 { "-" } else { "" };
    Ok(Value::str(format!("{}{}{}", sign, prefix, digits)))
}

fn hex(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("hex")?;
    Ok(radix(&value, "0x", "hex")?)
}

fn bin(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("bin")?;
    Ok(radix(&value, "0b", "bin")?)
}

fn oct(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("oct")?;
    Ok(radix(&value, "0o", "oct")?)
}

fn ord(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("ord")?;
    let text = value.as_str().map_err(|_| {
        SafepyError::type_error(format!(
            "ord() expected string of length 1, but {} found",
            value.type_name()
        ))
    })?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(Value::Int(c as i64)),
        _ => Err(SafepyError::type_error(format!(
            "ord() expected a character, but string of length {} found",
            text.chars().count()
        ))
        .into()),
    }
}

fn chr(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("chr")?;
    let code = value.as_int()?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|c| Value::str(c.to_string()))
        .ok_or_else(|| SafepyError::value_error("chr() arg not in range(0x110000)").into())
}

// ============================================================================
// Iteration
// ============================================================================

fn sum(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let start = args.take_keyword("start");
    let mut values = args.between("sum", 1, 2)?;
    let start = if values.len() == 2 { values.pop() } else { start };
    let iterable = values.swap_remove(0);
    let mut total = start.unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(
            SafepyError::type_error("sum() can't sum strings [use ''.join(seq) instead]").into(),
        );
    }

    // Compensated float accumulation: (sum, compensation)
    let mut float: Option<(f64, f64)> = None;
    for item in iterable.iter()? {
        interp.tick()?;
        if let Some((acc, compensation)) = float.as_mut() {
            if item.is_number() {
                let x = item.as_float()?;
                let t = *acc + x;
                if acc.abs() >= x.abs() {
                    *compensation += (*acc - t) + x;
                } else {
                    *compensation += (x - t) + *acc;
                }
                *acc = t;
                continue;
            }
            total = Value::Float(*acc + *compensation);
            float = None;
        }
        let floating = (matches!(item, Value::Float(_)) && total.is_number())
            || (matches!(total, Value::Float(_)) && item.is_number());
        if floating {
            let (a, x) = (total.as_float()?, item.as_float()?);
            let t = a + x;
            let compensation = if a.abs() >= x.abs() { (a - t) + x } else { (x - t) + a };
            float = Some((t, compensation));
        } else {
            total = operators::binary(BinOp::Add, &total, &item, interp.limits)?;
        }
    }
    if let Some((acc, compensation)) = float {
        let result = acc + compensation;
        // inf - inf in the compensation must not turn an infinite sum into NaN
        total = Value::Float(if result.is_nan() && !acc.is_nan() { acc } else { result });
    }
    Ok(total)
}

fn extremum(
    interp: &mut Interpreter<'_>,
    mut args: Arguments,
    name: &str,
    want: Ordering,
) -> EvalResult<Value> {
    let key = args.take_keyword("key").filter(|k| !k.is_none());
    let default = args.take_keyword("default");
    args.finish(name)?;
    let items = match args.positional.len() {
        0 => {
            return Err(SafepyError::type_error(format!(
                "{} expected at least 1 argument, got 0",
                name
            ))
            .into())
        }
        1 => interp.collect(&args.positional[0])?,
        _ if default.is_some() => {
            return Err(SafepyError::type_error(format!(
                "Cannot specify a default for {}() with multiple positional arguments",
                name
            ))
            .into())
        }
        _ => args.positional,
    };
    let mut items = items.into_iter();
    let Some(mut best) = items.next() else {
        return default.ok_or_else(|| {
            SafepyError::value_error(format!("{}() iterable argument is empty", name)).into()
        });
    };
    let symbol = if want == Ordering::Less { "<" } else { ">" };
    let mut best_key = match &key {
        Some(func) => interp.call_with(func, vec![best.clone()])?,
        None => best.clone(),
    };
    for item in items {
        interp.tick()?;
        let item_key = match &key {
            Some(func) => interp.call_with(func, vec![item.clone()])?,
            None => item.clone(),
        };
        if item_key.compare(&best_key, symbol)? == Some(want) {
            best = item;
            best_key = item_key;
        }
    }
    Ok(best)
}

fn min(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    extremum(interp, args, "min", Ordering::Less)
}

fn max(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    extremum(interp, args, "max", Ordering::Greater)
}

fn sorted(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let key = args.take_keyword("key");
    let reverse = args.take_keyword("reverse").map(|r| r.truthy()).unwrap_or(false);
    let [iterable] = args.exact::<1>("sorted")?;
    let items = interp.collect(&iterable)?;
    Ok(Value::list(interp.sort_values(items, key.as_ref(), reverse)?))
}

fn reversed(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("reversed")?;
    let kind = match &value {
        Value::List(_) | Value::Tuple(_) | Value::Str(_) => "list_reverseiterator",
        Value::Range(_) => "range_iterator",
        Value::Dict(_) => "dict_reversekeyiterator",
        other => {
            return Err(SafepyError::type_error(format!(
                "'{}' object is not reversible",
                other.type_name()
            ))
            .into())
        }
    };
    if let Value::Range(r) = &value {
        let len = r.len();
        if len == 0 {
            return Ok(Value::iterator(kind, Vec::new()));
        }
        return Ok(Value::Iterator(Rc::new(RefCell::new(IterState {
            kind,
            source: IterSource::Range {
                next: r.get(len - 1),
                remaining: len,
                step: r.step.wrapping_neg(),
            },
        }))));
    }
    let mut items = interp.collect(&value)?;
    items.reverse();
    Ok(Value::iterator(kind, items))
}

fn enumerate(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let start = args.take_keyword("start");
    let mut values = args.between("enumerate", 1, 2)?;
    let start = if values.len() == 2 { values.pop() } else { start };
    let start = match start {
        Some(start) => start.as_int()?,
        None => 0,
    };
    let items = interp.collect(&values[0])?;
    let mut pairs = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let index = start
            .checked_add(i as i64)
            .ok_or_else(|| SafepyError::overflow("enumerate index does not fit in 64 bits"))?;
        pairs.push(Value::tuple(vec![Value::Int(index), item]));
    }
    Ok(Value::iterator("enumerate", pairs))
}

/// Materialise several iterables, stopping at the shortest
pub fn collect_columns(
    interp: &mut Interpreter<'_>,
    iterables: &[Value],
) -> EvalResult<Vec<Vec<Value>>> {
    iterables.iter().map(|it| interp.collect(it)).collect()
}

fn zip(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let strict = args.take_keyword("strict").map(|s| s.truthy()).unwrap_or(false);
    args.finish("zip")?;
    let columns = collect_columns(interp, &args.positional)?;
    let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
    if strict {
        let first = columns.first().map(Vec::len).unwrap_or(0);
        if let Some(i) = columns.iter().position(|c| c.len() != first) {
            let relation = if columns[i].len() < first { "shorter" } else { "longer" };
            return Err(SafepyError::value_error(format!(
                "zip() argument {} is {} than argument 1",
                i + 1,
                relation
            ))
            .into());
        }
    }
    let mut iters: Vec<_> = columns.into_iter().map(Vec::into_iter).collect();
    let rows = (0..shortest)
        .map(|_| Value::tuple(iters.iter_mut().filter_map(Iterator::next).collect()))
        .collect::<Vec<_>>();
    Ok(Value::iterator("zip", rows))
}

fn map(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("map", 2, usize::MAX)?;
    let func = values.remove(0);
    let columns = collect_columns(interp, &values)?;
    let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
    let mut results = Vec::with_capacity(shortest);
    for row in 0..shortest {
        let call_args = columns.iter().map(|c| c[row].clone()).collect();
        results.push(interp.call_with(&func, call_args)?);
    }
    Ok(Value::iterator("map", results))
}

fn filter(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [func, iterable] = args.exact::<2>("filter")?;
    let mut kept = Vec::new();
    for item in interp.collect(&iterable)? {
        let keep = if func.is_none() {
            item.truthy()
        } else {
            interp.call_with(&func, vec![item.clone()])?.truthy()
        };
        if keep {
            kept.push(item);
        }
    }
    Ok(Value::iterator("filter", kept))
}

fn all(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [iterable] = args.exact::<1>("all")?;
    for item in iterable.iter()? {
        interp.tick()?;
        if !item.truthy() {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn any(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [iterable] = args.exact::<1>("any")?;
    for item in iterable.iter()? {
        interp.tick()?;
        if item.truthy() {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn iter(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("iter")?;
    Ok(make_iterator(&value)?)
}

fn next(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("next", 1, 2)?;
    let default = if values.len() == 2 { values.pop() } else { None };
    let Value::Iterator(state) = &values[0] else {
        return Err(SafepyError::type_error(format!(
            "'{}' object is not an iterator",
            values[0].type_name()
        ))
        .into());
    };
    let next = state.borrow_mut().next_value();
    next.or(default)
        .ok_or_else(|| SafepyError::RuntimeRestriction("StopIteration".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DictFlavor;

    #[test]
    fn test_parse_int_follows_python_literal_rules() {
        assert_eq!(parse_int(" 42 ", 10).unwrap(), 42);
        assert_eq!(parse_int("-1_000", 10).unwrap(), -1000);
        assert_eq!(parse_int("0xff", 0).unwrap(), 255);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        assert_eq!(parse_int("-9223372036854775808", 10).unwrap(), i64::MIN);
        assert!(parse_int("1__0", 10).is_err());
        assert!(parse_int("", 10).is_err());
        let err = parse_int("abc", 10).unwrap_err();
        assert_eq!(
            err.message(),
            "ValueError: invalid literal for int() with base 10: 'abc'"
        );
        let err = parse_int("99999999999999999999", 10).unwrap_err();
        assert!(err.message().contains("OverflowError"));
    }

    #[test]
    fn test_parse_float() {
        assert_eq!(parse_float("1.5").unwrap(), 1.5);
        assert_eq!(parse_float(" -2e3 ").unwrap(), -2000.0);
        assert!(parse_float("Infinity").unwrap().is_infinite());
        assert!(parse_float("nan").unwrap().is_nan());
        assert!(parse_float("1,5").is_err());
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_float(2.675, 2), 2.67);
        assert_eq!(round_float(0.125, 2), 0.12);
        assert_eq!(round_float(1234.5, -2), 1200.0);
        assert_eq!(round_int(1250, -2).unwrap(), 1200);
        assert_eq!(round_int(1350, -2).unwrap(), 1400);
        assert_eq!(round_int(-1250, -2).unwrap(), -1200);
        assert_eq!(round_int(77, i64::MIN).unwrap(), 0);
        assert_eq!(round_float(1.5, i64::MIN), 0.0);
    }

    #[test]
    fn test_float_to_int_rejects_non_finite() {
        assert_eq!(float_to_int(-3.9).unwrap(), -3);
        assert!(float_to_int(f64::NAN).is_err());
        assert_eq!(
            float_to_int(f64::INFINITY).unwrap_err().kind(),
            crate::error::ErrorKind::Arithmetic
        );
    }

    #[test]
    fn test_type_matches_hierarchy() {
        assert!(type_matches(&Value::Bool(true), "int"));
        assert!(!type_matches(&Value::Int(1), "bool"));
        assert!(type_matches(
            &Value::dict(Dict::with_flavor(DictFlavor::Counter)),
            "dict"
        ));
        assert!(type_matches(&Value::list(vec![]), "list"));
    }

    #[test]
    fn test_table_contains_every_builtin() {
        let table = table();
        for name in ["print", "len", "sorted", "final_answer", "sqrt", "int", "type"] {
            assert!(table.contains_key(name), "missing {}", name);
        }
        assert!(is_builtin("zip"));
        assert!(!is_builtin("eval"));
    }
}
