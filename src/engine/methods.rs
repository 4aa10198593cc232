//! Methods and data attributes of builtin values
//!
//! Method calls on a receiver go straight to [`call_method`]; reading a
//! method without calling it produces a bound method value that dispatches
//! back here when called.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::engine::builtins::{self, float_to_int, type_matches};
use crate::engine::modules::{collections, datetime, re};
use crate::engine::operators::{self, slice_indices, SliceBounds};
use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::value::format::{repr, str_format, to_str};
use crate::value::{Arguments, BoundMethod, BuiltinKind, Dict, DictFlavor, Set, Value};

const STR_METHODS: &[&str] = &[
    "upper", "lower", "capitalize", "title", "swapcase", "casefold", "strip", "lstrip", "rstrip",
    "split", "rsplit", "splitlines", "join", "replace", "startswith", "endswith", "find", "rfind",
    "index", "rindex", "count", "isdigit", "isdecimal", "isnumeric", "isalpha", "isalnum",
    "isspace", "isupper", "islower", "istitle", "isidentifier", "isascii", "center", "ljust",
    "rjust", "zfill", "format", "format_map", "partition", "rpartition", "expandtabs",
    "removeprefix", "removesuffix",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "remove", "pop", "clear", "index", "count", "sort", "reverse",
    "copy", "appendleft", "popleft", "extendleft", "rotate",
];

const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "pop", "popitem", "setdefault", "update", "clear", "copy",
];

const COUNTER_METHODS: &[&str] = &["most_common", "elements", "subtract", "total"];

const SET_METHODS: &[&str] = &[
    "add", "remove", "discard", "pop", "clear", "copy", "union", "intersection", "difference",
    "symmetric_difference", "update", "intersection_update", "difference_update",
    "symmetric_difference_update", "issubset", "issuperset", "isdisjoint",
];

const TUPLE_METHODS: &[&str] = &["index", "count"];

const INT_METHODS: &[&str] = &["bit_length", "conjugate", "is_integer", "as_integer_ratio"];

const FLOAT_METHODS: &[&str] = &["is_integer", "conjugate", "as_integer_ratio"];

/// Methods callable on instances of the named type
fn methods_of(type_name: &str) -> &'static [&'static str] {
    match type_name {
        "str" => STR_METHODS,
        "list" | "deque" => LIST_METHODS,
        "dict" | "defaultdict" | "OrderedDict" => DICT_METHODS,
        "set" => SET_METHODS,
        "tuple" | "range" => TUPLE_METHODS,
        "int" | "bool" => INT_METHODS,
        "float" => FLOAT_METHODS,
        _ => &[],
    }
}

/// Whether `value.name(...)` resolves to a method
pub fn has_method(value: &Value, name: &str) -> bool {
    match value {
        Value::Dict(d) if matches!(d.borrow().flavor, DictFlavor::Counter) => {
            DICT_METHODS.contains(&name) || COUNTER_METHODS.contains(&name)
        }
        Value::Temporal(t) => datetime::has_method(t, name),
        Value::Pattern(_) | Value::Match(_) => re::has_method(value, name),
        other => methods_of(other.type_name()).contains(&name),
    }
}

fn class_has(owner: &str, name: &str) -> bool {
    match owner {
        "Counter" => DICT_METHODS.contains(&name) || COUNTER_METHODS.contains(&name),
        "dict" | "OrderedDict" | "defaultdict" => name == "fromkeys" || DICT_METHODS.contains(&name),
        "datetime" | "date" | "timedelta" => datetime::class_has(owner, name),
        other => methods_of(other).contains(&name),
    }
}

fn no_attribute(value: &Value, name: &str) -> SafepyError {
    match value {
        Value::Builtin(b) if b.kind == BuiltinKind::Type => SafepyError::attribute_error(format!(
            "type object '{}' has no attribute '{}'",
            b.name, name
        )),
        other => SafepyError::attribute_error(format!(
            "'{}' object has no attribute '{}'",
            other.type_name(),
            name
        )),
    }
}

/// Non-callable attributes such as `x.real` or `dt.year`
fn data_attribute(value: &Value, name: &str) -> Option<Value> {
    match (value, name) {
        (Value::Int(_) | Value::Bool(_), "real" | "numerator") => value.as_int().ok().map(Value::Int),
        (Value::Int(_) | Value::Bool(_), "imag") => Some(Value::Int(0)),
        (Value::Int(_) | Value::Bool(_), "denominator") => Some(Value::Int(1)),
        (Value::Float(f), "real") => Some(Value::Float(*f)),
        (Value::Float(_), "imag") => Some(Value::Float(0.0)),
        (Value::Range(r), "start") => Some(Value::Int(r.start)),
        (Value::Range(r), "stop") => Some(Value::Int(r.stop)),
        (Value::Range(r), "step") => Some(Value::Int(r.step)),
        (Value::Dict(d), "default_factory") => match &d.borrow().flavor {
            DictFlavor::DefaultDict(factory) => Some(factory.clone()),
            _ => None,
        },
        (Value::Temporal(t), name) => datetime::attribute(t, name),
        (Value::Pattern(_) | Value::Match(_), name) => re::attribute(value, name),
        (Value::Builtin(b), name) if b.kind == BuiltinKind::Type => {
            datetime::class_attribute(b.name, name)
        }
        _ => None,
    }
}

/// `value.name` for everything except modules
pub fn get_attribute(value: &Value, name: &str) -> Result<Value> {
    if let Some(attribute) = data_attribute(value, name) {
        return Ok(attribute);
    }
    let known = match value {
        Value::Builtin(owner) if owner.kind == BuiltinKind::Type => class_has(owner.name, name),
        other => has_method(other, name),
    };
    if !known {
        return Err(no_attribute(value, name));
    }
    Ok(Value::Method(Rc::new(BoundMethod {
        receiver: value.clone(),
        name: name.to_string(),
    })))
}

/// `Type.name(...)`: class methods, or an instance method with an explicit receiver
pub fn call_unbound(
    interp: &mut Interpreter<'_>,
    owner: &'static str,
    name: &str,
    mut args: Arguments,
) -> EvalResult<Value> {
    match (owner, name) {
        ("dict" | "OrderedDict" | "defaultdict" | "Counter", "fromkeys") => {
            return dict_fromkeys(interp, args)
        }
        ("datetime" | "date" | "timedelta", _) if datetime::is_class_method(owner, name) => {
            return datetime::call_class_method(interp, owner, name, args)
        }
        _ => {}
    }
    if args.positional.is_empty() {
        return Err(SafepyError::type_error(format!(
            "unbound method {}.{}() needs an argument",
            owner, name
        ))
        .into());
    }
    let receiver = args.positional.remove(0);
    if !type_matches(&receiver, owner) {
        return Err(SafepyError::type_error(format!(
            "descriptor '{}' for '{}' objects doesn't apply to a '{}' object",
            name,
            owner,
            receiver.type_name()
        ))
        .into());
    }
    call_method(interp, &receiver, name, args)
}

/// `receiver.name(*args)`
pub fn call_method(
    interp: &mut Interpreter<'_>,
    receiver: &Value,
    name: &str,
    args: Arguments,
) -> EvalResult<Value> {
    match receiver {
        Value::Str(s) if STR_METHODS.contains(&name) => str_method(interp, s, name, args),
        Value::List(_) if LIST_METHODS.contains(&name) => list_method(interp, receiver, name, args),
        Value::Dict(_) if has_method(receiver, name) => dict_method(interp, receiver, name, args),
        Value::Set(_) if SET_METHODS.contains(&name) => set_method(interp, receiver, name, args),
        Value::Tuple(_) | Value::Range(_) if TUPLE_METHODS.contains(&name) => {
            sequence_method(receiver, name, args)
        }
        Value::Int(_) | Value::Bool(_) if INT_METHODS.contains(&name) => {
            int_method(receiver.as_int()?, name, args)
        }
        Value::Float(f) if FLOAT_METHODS.contains(&name) => float_method(*f, name, args),
        Value::Temporal(t) if datetime::has_method(t, name) => {
            datetime::call_method(interp, t, name, args)
        }
        Value::Pattern(_) | Value::Match(_) if re::has_method(receiver, name) => {
            re::call_method(interp, receiver, name, args)
        }
        _ => {
            // `x.real()` and friends: the attribute exists but is not callable
            let attribute = get_attribute(receiver, name)?;
            interp.call(&attribute, args)
        }
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn optional_int(value: Option<Value>) -> Result<Option<i64>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(v) => Ok(Some(v.as_int()?)),
    }
}

fn optional_str(value: Option<Value>, what: &str) -> Result<Option<Rc<str>>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s)),
        Some(other) => Err(SafepyError::type_error(format!(
            "{} arg must be None or str, not {}",
            what,
            other.type_name()
        ))),
    }
}

fn str_arg(value: &Value, method: &str) -> Result<Rc<str>> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(SafepyError::type_error(format!(
            "{}() argument must be str, not {}",
            method,
            other.type_name()
        ))),
    }
}

fn fill_char(value: Option<Value>) -> Result<char> {
    match value {
        None => Ok(' '),
        Some(Value::Str(s)) if s.chars().count() == 1 => Ok(s.chars().next().unwrap_or(' ')),
        Some(_) => Err(SafepyError::type_error(
            "The fill character must be exactly one character long",
        )),
    }
}

// ============================================================================
// str
// ============================================================================

fn byte_offset(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

fn char_index(s: &str, byte: usize) -> i64 {
    s[..byte].chars().count() as i64
}

/// Byte window for `start`/`end` arguments; `None` when `start` lies past the end
fn search_window(s: &str, start: Option<i64>, end: Option<i64>) -> Result<Option<(usize, usize)>> {
    let len = s.chars().count();
    if let Some(start) = start {
        let adjusted = if start < 0 { start + len as i64 } else { start };
        if adjusted > len as i64 {
            return Ok(None);
        }
    }
    let (start, stop, _) = slice_indices(
        SliceBounds {
            lower: start,
            upper: end,
            step: None,
        },
        len,
    )?;
    let stop = stop.max(start);
    Ok(Some((
        byte_offset(s, start as usize),
        byte_offset(s, stop as usize),
    )))
}

fn split_whitespace(s: &str, maxsplit: i64) -> Vec<Value> {
    let mut parts = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if maxsplit >= 0 && parts.len() as i64 >= maxsplit {
            parts.push(Value::str(rest));
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(Value::str(&rest[..end]));
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(Value::str(rest));
                break;
            }
        }
    }
    parts
}

fn rsplit_whitespace(s: &str, maxsplit: i64) -> Vec<Value> {
    if maxsplit < 0 {
        return split_whitespace(s, maxsplit);
    }
    let mut parts = Vec::new();
    let mut rest = s.trim_end();
    while !rest.is_empty() {
        if parts.len() as i64 >= maxsplit {
            parts.push(Value::str(rest));
            break;
        }
        match rest.rfind(char::is_whitespace) {
            Some(at) => {
                let width = rest[at..].chars().next().map(char::len_utf8).unwrap_or(1);
                parts.push(Value::str(&rest[at + width..]));
                rest = rest[..at].trim_end();
            }
            None => {
                parts.push(Value::str(rest));
                break;
            }
        }
    }
    parts.reverse();
    parts
}

const LINE_BREAKS: &[char] = &[
    '\n', '\r', '\x0b', '\x0c', '\x1c', '\x1d', '\x1e', '\u{85}', '\u{2028}', '\u{2029}',
];

fn splitlines(s: &str, keepends: bool) -> Vec<Value> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !LINE_BREAKS.contains(&c) {
            continue;
        }
        let mut end = i + c.len_utf8();
        if c == '\r' {
            if let Some((_, '\n')) = chars.peek() {
                chars.next();
                end += 1;
            }
        }
        lines.push(Value::str(if keepends { &s[start..end] } else { &s[start..i] }));
        start = end;
    }
    if start < s.len() {
        lines.push(Value::str(&s[start..]));
    }
    lines
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut previous_cased = false;
    for c in s.chars() {
        if previous_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        previous_cased = c.is_alphabetic();
    }
    out
}

fn is_title(s: &str) -> bool {
    let mut previous_cased = false;
    let mut any_cased = false;
    for c in s.chars() {
        if c.is_uppercase() {
            if previous_cased {
                return false;
            }
            previous_cased = true;
            any_cased = true;
        } else if c.is_lowercase() {
            if !previous_cased {
                return false;
            }
            previous_cased = true;
            any_cased = true;
        } else {
            previous_cased = false;
        }
    }
    any_cased
}

fn pad(s: &str, width: i64, fill: char, align: char) -> String {
    let len = s.chars().count() as i64;
    if width <= len {
        return s.to_string();
    }
    let total = (width - len) as usize;
    let (left, right) = match align {
        '<' => (0, total),
        '>' => (total, 0),
        _ => {
            let left = total / 2 + (total & width as usize & 1);
            (left, total - left)
        }
    };
    let fill = fill.to_string();
    format!("{}{}{}", fill.repeat(left), s, fill.repeat(right))
}

fn zfill(s: &str, width: i64) -> String {
    let len = s.chars().count() as i64;
    if width <= len {
        return s.to_string();
    }
    let zeros = "0".repeat((width - len) as usize);
    match s.chars().next() {
        Some(sign @ ('+' | '-')) => format!("{}{}{}", sign, zeros, &s[1..]),
        _ => format!("{}{}", zeros, s),
    }
}

fn expand_tabs(s: &str, tabsize: i64) -> String {
    let mut out = String::with_capacity(s.len());
    let mut column = 0i64;
    for c in s.chars() {
        match c {
            '\t' => {
                if tabsize > 0 {
                    let spaces = tabsize - column % tabsize;
                    out.push_str(&" ".repeat(spaces as usize));
                    column += spaces;
                }
            }
            '\n' | '\r' => {
                out.push(c);
                column = 0;
            }
            c => {
                out.push(c);
                column += 1;
            }
        }
    }
    out
}

/// Prefix or suffix test against a str or a tuple of str
fn affix_matches(s: &str, affix: &Value, method: &str, test: fn(&str, &str) -> bool) -> Result<bool> {
    match affix {
        Value::Str(a) => Ok(test(s, a)),
        Value::Tuple(items) => {
            for item in items.iter() {
                if test(s, &str_arg(item, method)?) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(SafepyError::type_error(format!(
            "{} first arg must be str or a tuple of str, not {}",
            method,
            other.type_name()
        ))),
    }
}

fn str_method(
    interp: &mut Interpreter<'_>,
    s: &Rc<str>,
    name: &str,
    mut args: Arguments,
) -> EvalResult<Value> {
    let text: &str = s;
    let value = match name {
        "upper" => {
            args.exact::<0>(name)?;
            Value::str(text.to_uppercase())
        }
        "lower" => {
            args.exact::<0>(name)?;
            Value::str(text.to_lowercase())
        }
        "casefold" => {
            args.exact::<0>(name)?;
            Value::str(text.to_lowercase())
        }
        "swapcase" => {
            args.exact::<0>(name)?;
            Value::str(
                text.chars()
                    .flat_map(|c| {
                        if c.is_uppercase() {
                            c.to_lowercase().collect::<Vec<_>>()
                        } else {
                            c.to_uppercase().collect::<Vec<_>>()
                        }
                    })
                    .collect::<String>(),
            )
        }
        "capitalize" => {
            args.exact::<0>(name)?;
            let mut chars = text.chars();
            let capitalized = match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            };
            Value::str(capitalized)
        }
        "title" => {
            args.exact::<0>(name)?;
            Value::str(title_case(text))
        }
        "strip" | "lstrip" | "rstrip" => {
            let chars = optional_str(args.between(name, 0, 1)?.pop(), name)?;
            let stripped = match (&chars, name) {
                (None, "strip") => text.trim(),
                (None, "lstrip") => text.trim_start(),
                (None, _) => text.trim_end(),
                (Some(set), "strip") => text.trim_matches(|c: char| set.contains(c)),
                (Some(set), "lstrip") => text.trim_start_matches(|c: char| set.contains(c)),
                (Some(set), _) => text.trim_end_matches(|c: char| set.contains(c)),
            };
            Value::str(stripped)
        }
        "split" | "rsplit" => {
            let maxsplit = args.take_keyword("maxsplit");
            let sep = args.take_keyword("sep");
            let mut values = args.between(name, 0, 2)?;
            let maxsplit = if values.len() == 2 { values.pop() } else { maxsplit };
            let sep = if values.is_empty() { sep } else { values.pop() };
            let maxsplit = optional_int(maxsplit)?.unwrap_or(-1);
            let parts = match optional_str(sep, name)? {
                None if name == "split" => split_whitespace(text, maxsplit),
                None => rsplit_whitespace(text, maxsplit),
                Some(sep) if sep.is_empty() => {
                    return Err(SafepyError::value_error("empty separator").into())
                }
                Some(sep) => {
                    let mut parts: Vec<Value> = match (name, maxsplit) {
                        ("split", n) if n >= 0 => text
                            .splitn(n as usize + 1, &*sep)
                            .map(Value::str)
                            .collect(),
                        ("rsplit", n) if n >= 0 => text
                            .rsplitn(n as usize + 1, &*sep)
                            .map(Value::str)
                            .collect(),
                        _ => text.split(&*sep).map(Value::str).collect(),
                    };
                    if name == "rsplit" && maxsplit >= 0 {
                        parts.reverse();
                    }
                    parts
                }
            };
            Value::list(parts)
        }
        "splitlines" => {
            let keepends = args.take_keyword("keepends");
            let mut values = args.between(name, 0, 1)?;
            let keepends = values.pop().or(keepends).map(|v| v.truthy()).unwrap_or(false);
            Value::list(splitlines(text, keepends))
        }
        "join" => {
            let [iterable] = args.exact::<1>(name)?;
            let items = interp.collect(&iterable)?;
            let mut pieces = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Str(piece) => pieces.push(piece.clone()),
                    other => {
                        return Err(SafepyError::type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            i,
                            other.type_name()
                        ))
                        .into())
                    }
                }
            }
            let total = pieces.iter().fold(0u64, |acc, p| acc.saturating_add(p.len() as u64));
            let separators = (text.len() as u64).saturating_mul(pieces.len().saturating_sub(1) as u64);
            interp.check_len(total.saturating_add(separators))?;
            Value::str(pieces.iter().map(|p| &**p).collect::<Vec<&str>>().join(text))
        }
        "replace" => {
            let count = args.take_keyword("count");
            let mut values = args.between(name, 2, 3)?;
            let count = optional_int(if values.len() == 3 { values.pop() } else { count })?;
            let new = str_arg(&values[1], name)?;
            let old = str_arg(&values[0], name)?;
            if new.len() > old.len() {
                let found = if old.is_empty() {
                    text.chars().count() as u64 + 1
                } else {
                    text.matches(&*old).count() as u64
                };
                let found = match count {
                    Some(n) if n >= 0 => found.min(n as u64),
                    _ => found,
                };
                let growth = found.saturating_mul((new.len() - old.len()) as u64);
                interp.check_len((text.len() as u64).saturating_add(growth))?;
            }
            Value::str(match count {
                Some(n) if n >= 0 => text.replacen(&*old, &new, n as usize),
                _ => text.replace(&*old, &new),
            })
        }
        "startswith" | "endswith" => {
            let values = args.between(name, 1, 3)?;
            let mut values = values.into_iter();
            let affix = values.next().unwrap_or(Value::None);
            let start = optional_int(values.next())?;
            let end = optional_int(values.next())?;
            let Some((a, b)) = search_window(text, start, end)? else {
                return Ok(Value::Bool(false));
            };
            let window = &text[a..b];
            let test: fn(&str, &str) -> bool = if name == "startswith" {
                |s, affix| s.starts_with(affix)
            } else {
                |s, affix| s.ends_with(affix)
            };
            Value::Bool(affix_matches(window, &affix, name, test)?)
        }
        "find" | "rfind" | "index" | "rindex" | "count" => {
            let values = args.between(name, 1, 3)?;
            let mut values = values.into_iter();
            let needle = str_arg(&values.next().unwrap_or(Value::None), name)?;
            let start = optional_int(values.next())?;
            let end = optional_int(values.next())?;
            let window = search_window(text, start, end)?;
            if name == "count" {
                let count = match window {
                    Some((a, b)) => text[a..b].matches(&*needle).count(),
                    None => 0,
                };
                return Ok(Value::Int(count as i64));
            }
            let found = window.and_then(|(a, b)| {
                let hay = &text[a..b];
                let at = if name.starts_with('r') {
                    hay.rfind(&*needle)
                } else {
                    hay.find(&*needle)
                };
                at.map(|at| char_index(text, a + at))
            });
            match (found, name) {
                (Some(i), _) => Value::Int(i),
                (None, "index" | "rindex") => {
                    return Err(SafepyError::value_error("substring not found").into())
                }
                (None, _) => Value::Int(-1),
            }
        }
        "isdigit" | "isdecimal" | "isnumeric" | "isalpha" | "isalnum" | "isspace" | "isascii" => {
            args.exact::<0>(name)?;
            let test: fn(char) -> bool = match name {
                "isdigit" | "isdecimal" => |c| c.is_ascii_digit(),
                "isnumeric" => char::is_numeric,
                "isalpha" => char::is_alphabetic,
                "isalnum" => char::is_alphanumeric,
                "isspace" => char::is_whitespace,
                _ => |c| c.is_ascii(),
            };
            let empty_ok = name == "isascii";
            Value::Bool((empty_ok || !text.is_empty()) && text.chars().all(test))
        }
        "isupper" | "islower" => {
            args.exact::<0>(name)?;
            let cased: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
            let wanted = if name == "isupper" {
                cased.iter().any(|c| c.is_uppercase()) && !cased.iter().any(|c| c.is_lowercase())
            } else {
                cased.iter().any(|c| c.is_lowercase()) && !cased.iter().any(|c| c.is_uppercase())
            };
            Value::Bool(wanted)
        }
        "istitle" => {
            args.exact::<0>(name)?;
            Value::Bool(is_title(text))
        }
        "isidentifier" => {
            args.exact::<0>(name)?;
            let mut chars = text.chars();
            let valid = match chars.next() {
                Some(first) => {
                    (first.is_alphabetic() || first == '_')
                        && chars.all(|c| c.is_alphanumeric() || c == '_')
                }
                None => false,
            };
            Value::Bool(valid)
        }
        "center" | "ljust" | "rjust" => {
            let mut values = args.between(name, 1, 2)?;
            let fill = fill_char(if values.len() == 2 { values.pop() } else { None })?;
            let width = values[0].as_int()?;
            let align = match name {
                "ljust" => '<',
                "rjust" => '>',
                _ => '^',
            };
            interp.check_len(width.max(0) as u64)?;
            Value::str(pad(text, width, fill, align))
        }
        "zfill" => {
            let [width] = args.exact::<1>(name)?;
            let width = width.as_int()?;
            interp.check_len(width.max(0) as u64)?;
            Value::str(zfill(text, width))
        }
        "expandtabs" => {
            let tabsize = args.take_keyword("tabsize");
            let mut values = args.between(name, 0, 1)?;
            let tabsize = optional_int(values.pop().or(tabsize))?.unwrap_or(8);
            let tabs = text.matches('\t').count() as u64;
            interp.check_len(
                (text.len() as u64).saturating_add(tabs.saturating_mul(tabsize.max(0) as u64)),
            )?;
            Value::str(expand_tabs(text, tabsize))
        }
        "format" => Value::str(str_format(
            text,
            &args.positional,
            &args.keywords,
            interp.limits.max_collection_len,
        )?),
        "format_map" => {
            let [mapping] = args.exact::<1>(name)?;
            let Value::Dict(mapping) = mapping else {
                return Err(SafepyError::type_error("format_map() argument must be a mapping").into());
            };
            let keywords: Vec<(String, Value)> = mapping
                .borrow()
                .items()
                .into_iter()
                .map(|(k, v)| (to_str(&k), v))
                .collect();
            Value::str(str_format(text, &[], &keywords, interp.limits.max_collection_len)?)
        }
        "partition" | "rpartition" => {
            let [sep] = args.exact::<1>(name)?;
            let sep = str_arg(&sep, name)?;
            if sep.is_empty() {
                return Err(SafepyError::value_error("empty separator").into());
            }
            let at = if name == "partition" {
                text.find(&*sep)
            } else {
                text.rfind(&*sep)
            };
            let parts = match (at, name) {
                (Some(at), _) => [&text[..at], &*sep, &text[at + sep.len()..]],
                (None, "partition") => [text, "", ""],
                (None, _) => ["", "", text],
            };
            Value::tuple(parts.iter().map(|p| Value::str(*p)).collect())
        }
        "removeprefix" => {
            let [prefix] = args.exact::<1>(name)?;
            let prefix = str_arg(&prefix, name)?;
            Value::str(text.strip_prefix(&*prefix).unwrap_or(text))
        }
        "removesuffix" => {
            let [suffix] = args.exact::<1>(name)?;
            let suffix = str_arg(&suffix, name)?;
            Value::str(text.strip_suffix(&*suffix).unwrap_or(text))
        }
        _ => return Err(no_attribute(&Value::Str(s.clone()), name).into()),
    };
    Ok(value)
}

// ============================================================================
// list (and deque)
// ============================================================================

fn list_method(
    interp: &mut Interpreter<'_>,
    receiver: &Value,
    name: &str,
    mut args: Arguments,
) -> EvalResult<Value> {
    let Value::List(list) = receiver else {
        return Err(SafepyError::internal("list method on a non-list").into());
    };
    let value = match name {
        "append" | "appendleft" => {
            let [item] = args.exact::<1>(name)?;
            let mut items = list.borrow_mut();
            if items.len() >= interp.limits.max_collection_len {
                return Err(interp.memory_error().into());
            }
            if name == "append" {
                items.push(item);
            } else {
                items.insert(0, item);
            }
            Value::None
        }
        "extend" | "extendleft" => {
            let [iterable] = args.exact::<1>(name)?;
            let extra = interp.collect(&iterable)?;
            let mut items = list.borrow_mut();
            if items.len().saturating_add(extra.len()) > interp.limits.max_collection_len {
                return Err(interp.memory_error().into());
            }
            if name == "extend" {
                items.extend(extra);
            } else {
                for item in extra {
                    items.insert(0, item);
                }
            }
            Value::None
        }
        "insert" => {
            let [index, item] = args.exact::<2>(name)?;
            let mut items = list.borrow_mut();
            let len = items.len() as i64;
            let index = index.as_int()?;
            let index = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(index as usize, item);
            Value::None
        }
        "remove" => {
            let [item] = args.exact::<1>(name)?;
            let mut items = list.borrow_mut();
            let position = items.iter().position(|v| v.equals(&item)).ok_or_else(|| {
                SafepyError::value_error("list.remove(x): x not in list")
            })?;
            items.remove(position);
            Value::None
        }
        "pop" | "popleft" => {
            let index = if name == "popleft" {
                args.exact::<0>(name)?;
                Some(0)
            } else {
                optional_int(args.between(name, 0, 1)?.pop())?
            };
            let mut items = list.borrow_mut();
            if items.is_empty() {
                let message = if name == "popleft" {
                    "pop from an empty deque"
                } else {
                    "pop from empty list"
                };
                return Err(SafepyError::index_error(message).into());
            }
            let index = index.unwrap_or(-1);
            let position = operators::normalize_index(index, items.len())
                .ok_or_else(|| SafepyError::index_error("pop index out of range"))?;
            items.remove(position)
        }
        "clear" => {
            args.exact::<0>(name)?;
            list.borrow_mut().clear();
            Value::None
        }
        "index" | "count" => return sequence_method(receiver, name, args),
        "sort" => {
            let key = args.take_keyword("key");
            let reverse = args.take_keyword("reverse").map(|r| r.truthy()).unwrap_or(false);
            args.exact::<0>(name)?;
            let items = list.borrow().clone();
            let sorted = interp.sort_values(items, key.as_ref(), reverse)?;
            *list.borrow_mut() = sorted;
            Value::None
        }
        "reverse" => {
            args.exact::<0>(name)?;
            list.borrow_mut().reverse();
            Value::None
        }
        "copy" => {
            args.exact::<0>(name)?;
            Value::list(list.borrow().clone())
        }
        "rotate" => {
            let steps = optional_int(args.between(name, 0, 1)?.pop())?.unwrap_or(1);
            let mut items = list.borrow_mut();
            if !items.is_empty() {
                let len = items.len() as i64;
                let shift = steps.rem_euclid(len) as usize;
                items.rotate_right(shift);
            }
            Value::None
        }
        _ => return Err(no_attribute(receiver, name).into()),
    };
    Ok(value)
}

/// `index` and `count` shared by list, tuple and range
fn sequence_method(receiver: &Value, name: &str, args: Arguments) -> EvalResult<Value> {
    let values = args.between(name, 1, 3)?;
    let mut values = values.into_iter();
    let item = values.next().unwrap_or(Value::None);
    let items: Vec<Value> = receiver.iter()?.collect();
    if name == "count" {
        return Ok(Value::Int(items.iter().filter(|v| v.equals(&item)).count() as i64));
    }
    let start = optional_int(values.next())?;
    let end = optional_int(values.next())?;
    let (start, stop, _) = slice_indices(
        SliceBounds {
            lower: start,
            upper: end,
            step: None,
        },
        items.len(),
    )?;
    (start.max(0) as usize..stop.max(0) as usize)
        .find(|i| items.get(*i).map(|v| v.equals(&item)).unwrap_or(false))
        .map(|i| Value::Int(i as i64))
        .ok_or_else(|| {
            let message = match receiver {
                Value::List(_) => format!("{} is not in list", repr(&item)),
                Value::Range(_) => format!("{} is not in range", repr(&item)),
                _ => "tuple.index(x): x not in tuple".to_string(),
            };
            SafepyError::value_error(message).into()
        })
}

// ============================================================================
// dict (and Counter / defaultdict)
// ============================================================================

fn dict_fromkeys(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let mut values = args.between("fromkeys", 1, 2)?;
    let default = if values.len() == 2 {
        values.pop().unwrap_or(Value::None)
    } else {
        Value::None
    };
    let mut dict = Dict::new();
    for key in interp.collect(&values[0])? {
        dict.insert(key, default.clone())?;
    }
    Ok(Value::dict(dict))
}

fn dict_method(
    interp: &mut Interpreter<'_>,
    receiver: &Value,
    name: &str,
    mut args: Arguments,
) -> EvalResult<Value> {
    let Value::Dict(dict) = receiver else {
        return Err(SafepyError::internal("dict method on a non-dict").into());
    };
    let is_counter = matches!(dict.borrow().flavor, DictFlavor::Counter);
    let value = match name {
        "get" => {
            let values = args.between(name, 1, 2)?;
            let mut values = values.into_iter();
            let key = values.next().unwrap_or(Value::None);
            let default = values.next().unwrap_or(Value::None);
            let found = dict.borrow().get(&key)?;
            found.unwrap_or(default)
        }
        "keys" => {
            args.exact::<0>(name)?;
            Value::list(dict.borrow().keys())
        }
        "values" => {
            args.exact::<0>(name)?;
            Value::list(dict.borrow().values())
        }
        "items" => {
            args.exact::<0>(name)?;
            let pairs = dict
                .borrow()
                .items()
                .into_iter()
                .map(|(k, v)| Value::tuple(vec![k, v]))
                .collect();
            Value::list(pairs)
        }
        "pop" => {
            let values = args.between(name, 1, 2)?;
            let mut values = values.into_iter();
            let key = values.next().unwrap_or(Value::None);
            let default = values.next();
            let removed = dict.borrow_mut().remove(&key)?;
            match (removed, default) {
                (Some(value), _) => value,
                (None, Some(default)) => default,
                (None, None) => return Err(SafepyError::key_error(repr(&key)).into()),
            }
        }
        "popitem" => {
            args.exact::<0>(name)?;
            let last = dict.borrow_mut().pop_last();
            match last {
                Some((key, value)) => Value::tuple(vec![key, value]),
                None => {
                    return Err(
                        SafepyError::key_error("'popitem(): dictionary is empty'").into()
                    )
                }
            }
        }
        "setdefault" => {
            let values = args.between(name, 1, 2)?;
            let mut values = values.into_iter();
            let key = values.next().unwrap_or(Value::None);
            let default = values.next().unwrap_or(Value::None);
            let existing = dict.borrow().get(&key)?;
            match existing {
                Some(value) => value,
                None => {
                    dict.borrow_mut().insert(key, default.clone())?;
                    default
                }
            }
        }
        "update" if is_counter => {
            let sources = args.between(name, 0, 1)?;
            let mut counts = dict.borrow().clone();
            for source in &sources {
                collections::counter_update(interp, &mut counts, source, 1)?;
            }
            *dict.borrow_mut() = counts;
            Value::None
        }
        "subtract" if is_counter => {
            let sources = args.between(name, 0, 1)?;
            let mut counts = dict.borrow().clone();
            for source in &sources {
                collections::counter_update(interp, &mut counts, source, -1)?;
            }
            *dict.borrow_mut() = counts;
            Value::None
        }
        "update" => {
            let keywords = std::mem::take(&mut args.keywords);
            let sources = args.between(name, 0, 1)?;
            let mut updated = dict.borrow().clone();
            if let Some(source) = sources.first() {
                builtins::update_dict(interp, &mut updated, source)?;
            }
            for (key, value) in keywords {
                updated.insert(Value::str(key), value)?;
            }
            *dict.borrow_mut() = updated;
            Value::None
        }
        "clear" => {
            args.exact::<0>(name)?;
            dict.borrow_mut().clear();
            Value::None
        }
        "copy" => {
            args.exact::<0>(name)?;
            Value::dict(dict.borrow().clone())
        }
        "most_common" if is_counter => {
            let n = optional_int(args.between(name, 0, 1)?.pop())?;
            let pairs = dict.borrow().items();
            let mut order: Vec<usize> = (0..pairs.len()).collect();
            operators::merge_sort(&mut order, &mut |a, b| {
                let (x, y) = (&pairs[a].1, &pairs[b].1);
                Ok(x.compare(y, ">")? == Some(Ordering::Greater))
            })?;
            let limit = n.map(|n| n.max(0) as usize).unwrap_or(order.len());
            let picked = order
                .into_iter()
                .take(limit)
                .map(|i| Value::tuple(vec![pairs[i].0.clone(), pairs[i].1.clone()]))
                .collect();
            Value::list(picked)
        }
        "elements" if is_counter => {
            args.exact::<0>(name)?;
            let mut items = Vec::new();
            for (key, count) in dict.borrow().items() {
                let count = count.as_int()?.max(0) as usize;
                if items.len().saturating_add(count) > interp.limits.max_collection_len {
                    return Err(interp.memory_error().into());
                }
                items.extend(std::iter::repeat(key).take(count));
            }
            Value::iterator("chain", items)
        }
        "total" if is_counter => {
            args.exact::<0>(name)?;
            let mut total: i64 = 0;
            for count in dict.borrow().values() {
                total = total
                    .checked_add(count.as_int()?)
                    .ok_or_else(|| SafepyError::overflow("Counter total does not fit in 64 bits"))?;
            }
            Value::Int(total)
        }
        _ => return Err(no_attribute(receiver, name).into()),
    };
    Ok(value)
}

// ============================================================================
// set
// ============================================================================

fn set_method(
    interp: &mut Interpreter<'_>,
    receiver: &Value,
    name: &str,
    args: Arguments,
) -> EvalResult<Value> {
    let Value::Set(set) = receiver else {
        return Err(SafepyError::internal("set method on a non-set").into());
    };
    let value = match name {
        "add" => {
            let [item] = args.exact::<1>(name)?;
            set.borrow_mut().insert(item)?;
            Value::None
        }
        "remove" => {
            let [item] = args.exact::<1>(name)?;
            if !set.borrow_mut().remove(&item)? {
                return Err(SafepyError::key_error(repr(&item)).into());
            }
            Value::None
        }
        "discard" => {
            let [item] = args.exact::<1>(name)?;
            set.borrow_mut().remove(&item)?;
            Value::None
        }
        "pop" => {
            args.exact::<0>(name)?;
            let popped = set.borrow_mut().pop_first();
            popped.ok_or_else(|| SafepyError::key_error("'pop from an empty set'"))?
        }
        "clear" => {
            args.exact::<0>(name)?;
            set.borrow_mut().clear();
            Value::None
        }
        "copy" => {
            args.exact::<0>(name)?;
            Value::set(set.borrow().clone())
        }
        "issubset" | "issuperset" | "isdisjoint" => {
            let [other] = args.exact::<1>(name)?;
            let other = Set::from_values(interp.collect(&other)?)?;
            let this = set.borrow();
            Value::Bool(match name {
                "issubset" => this.is_subset(&other),
                "issuperset" => other.is_subset(&this),
                _ => this.iter().all(|v| !other.contains(v).unwrap_or(false)),
            })
        }
        _ => {
            // union family: accept any number of iterables
            args.finish(name)?;
            let mut result = set.borrow().clone();
            for other in &args.positional {
                let other = Set::from_values(interp.collect(other)?)?;
                result = match name.trim_end_matches("_update") {
                    "union" | "update" => Set::from_values(result.iter().chain(other.iter()).cloned())?,
                    "intersection" => Set::from_values(
                        result.iter().filter(|v| other.contains(v).unwrap_or(false)).cloned(),
                    )?,
                    "difference" => Set::from_values(
                        result.iter().filter(|v| !other.contains(v).unwrap_or(false)).cloned(),
                    )?,
                    "symmetric_difference" => Set::from_values(
                        result
                            .iter()
                            .filter(|v| !other.contains(v).unwrap_or(false))
                            .chain(other.iter().filter(|v| !result.contains(v).unwrap_or(false)))
                            .cloned(),
                    )?,
                    _ => return Err(no_attribute(receiver, name).into()),
                };
            }
            if name == "update" || name.ends_with("_update") {
                *set.borrow_mut() = result;
                Value::None
            } else {
                Value::set(result)
            }
        }
    };
    Ok(value)
}

// ============================================================================
// Numbers
// ============================================================================

fn int_method(i: i64, name: &str, args: Arguments) -> EvalResult<Value> {
    args.exact::<0>(name)?;
    let value = match name {
        "bit_length" => Value::Int(64 - i.unsigned_abs().leading_zeros() as i64),
        "conjugate" => Value::Int(i),
        "is_integer" => Value::Bool(true),
        _ => Value::tuple(vec![Value::Int(i), Value::Int(1)]),
    };
    Ok(value)
}

fn float_method(f: f64, name: &str, args: Arguments) -> EvalResult<Value> {
    args.exact::<0>(name)?;
    let value = match name {
        "is_integer" => Value::Bool(f.is_finite() && f.fract() == 0.0),
        "conjugate" => Value::Float(f),
        _ => {
            if f.is_nan() {
                return Err(
                    SafepyError::value_error("cannot convert NaN to integer ratio").into(),
                );
            }
            if f.is_infinite() {
                return Err(
                    SafepyError::overflow("cannot convert Infinity to integer ratio").into(),
                );
            }
            let mut numerator = f;
            let mut denominator: i64 = 1;
            while numerator.fract() != 0.0 {
                numerator *= 2.0;
                denominator = denominator.checked_mul(2).ok_or_else(|| {
                    SafepyError::overflow("integer ratio does not fit in 64 bits")
                })?;
            }
            Value::tuple(vec![
                Value::Int(float_to_int(numerator)?),
                Value::Int(denominator),
            ])
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_whitespace_with_maxsplit() {
        let parts = split_whitespace("  a b  c ", 1);
        let texts: Vec<String> = parts.iter().map(to_str).collect();
        assert_eq!(texts, vec!["a", "b  c "]);

        let parts = rsplit_whitespace("  a b c", 1);
        let texts: Vec<String> = parts.iter().map(to_str).collect();
        assert_eq!(texts, vec!["  a b", "c"]);
    }

    #[test]
    fn test_splitlines_handles_crlf() {
        let lines = splitlines("a\r\nb\nc", false);
        assert_eq!(Value::list(lines).to_string(), "['a', 'b', 'c']");
        let lines = splitlines("a\r\nb\n", true);
        assert_eq!(Value::list(lines).to_string(), "['a\\r\\n', 'b\\n']");
    }

    #[test]
    fn test_center_matches_python_bias() {
        assert_eq!(pad("ab", 5, '*', '^'), "**ab*");
        assert_eq!(pad("abc", 6, '*', '^'), "*abc**");
        assert_eq!(zfill("-42", 6), "-00042");
    }

    #[test]
    fn test_title_and_istitle() {
        assert_eq!(title_case("hello wORLD 2nd"), "Hello World 2Nd");
        assert!(is_title("Hello World"));
        assert!(!is_title("Hello world"));
    }

    #[test]
    fn test_search_window_past_end() {
        assert!(search_window("abc", Some(5), None).unwrap().is_none());
        assert_eq!(search_window("héllo", Some(1), Some(3)).unwrap(), Some((1, 4)));
    }

    #[test]
    fn test_attributes_and_methods_resolve() {
        assert!(has_method(&Value::str("x"), "upper"));
        assert!(!has_method(&Value::str("x"), "append"));
        assert!(get_attribute(&Value::Int(5), "real").is_ok());
        let err = get_attribute(&Value::Int(5), "nope").unwrap_err();
        assert_eq!(
            err.message(),
            "AttributeError: 'int' object has no attribute 'nope'"
        );
        let counter = Value::dict(Dict::with_flavor(DictFlavor::Counter));
        assert!(has_method(&counter, "most_common"));
        assert!(!has_method(&Value::dict(Dict::new()), "most_common"));
    }
}
