//! Python-style text rendering: `repr`, `str`, the format-spec mini
//! language, `%` interpolation and `str.format`

use std::fmt::Write;

use chrono::{Datelike, Duration, Timelike};

use crate::error::{Result, SafepyError};
use crate::stack::ensure_sufficient_stack;
use crate::value::{BuiltinKind, DictFlavor, Temporal, Value};

/// `repr(value)`
pub fn repr(value: &Value) -> String {
    let mut out = String::new();
    write_repr(&mut out, value, &mut Vec::new());
    out
}

/// `str(value)`
pub fn to_str(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        Value::Temporal(t) => temporal_str(t),
        _ => repr(value),
    }
}

fn write_repr(out: &mut String, value: &Value, seen: &mut Vec<usize>) {
    ensure_sufficient_stack(|| write_repr_inner(out, value, seen))
}

fn write_items<'a>(
    out: &mut String,
    items: impl Iterator<Item = &'a Value>,
    seen: &mut Vec<usize>,
) {
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(out, item, seen);
    }
}

fn write_repr_inner(out: &mut String, value: &Value, seen: &mut Vec<usize>) {
    // Containers that hold themselves print as `[...]`
    if let Some(id) = value.identity() {
        if matches!(value, Value::List(_) | Value::Dict(_) | Value::Set(_)) {
            if seen.contains(&id) {
                out.push_str(match value {
                    Value::List(_) => "[...]",
                    _ => "{...}",
                });
                return;
            }
            seen.push(id);
        }
    }

    match value {
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => out.push_str(&quote_str(s)),
        Value::List(items) => {
            out.push('[');
            write_items(out, items.borrow().iter(), seen);
            out.push(']');
        }
        Value::Tuple(items) => {
            out.push('(');
            write_items(out, items.iter(), seen);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::Dict(dict) => {
            let dict = dict.borrow();
            let close = match &dict.flavor {
                DictFlavor::Plain => "",
                DictFlavor::Counter => {
                    if dict.is_empty() {
                        out.push_str("Counter()");
                        seen.pop();
                        return;
                    }
                    out.push_str("Counter(");
                    ")"
                }
                DictFlavor::DefaultDict(factory) => {
                    out.push_str("defaultdict(");
                    write_repr(out, factory, seen);
                    out.push_str(", ");
                    ")"
                }
            };
            let mut entries: Vec<(&Value, &Value)> = dict.iter().collect();
            if matches!(dict.flavor, DictFlavor::Counter) {
                // most common first, ties keep insertion order
                let count = |v: &Value| v.as_float().unwrap_or(f64::NEG_INFINITY);
                entries.sort_by(|a, b| {
                    count(b.1)
                        .partial_cmp(&count(a.1))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(out, key, seen);
                out.push_str(": ");
                write_repr(out, val, seen);
            }
            out.push('}');
            out.push_str(close);
        }
        Value::Set(set) => {
            let set = set.borrow();
            if set.is_empty() {
                out.push_str("set()");
            } else {
                out.push('{');
                write_items(out, set.iter(), seen);
                out.push('}');
            }
        }
        Value::Range(r) => {
            if r.step == 1 {
                let _ = write!(out, "range({}, {})", r.start, r.stop);
            } else {
                let _ = write!(out, "range({}, {}, {})", r.start, r.stop, r.step);
            }
        }
        Value::Iterator(it) => {
            let _ = write!(out, "<{} object>", it.borrow().kind);
        }
        Value::Function(func) => {
            let _ = write!(out, "<function {}>", func.def.name);
        }
        Value::Builtin(b) => match b.kind {
            BuiltinKind::Type => {
                let _ = write!(out, "<class '{}'>", b.name);
            }
            BuiltinKind::Function => {
                let _ = write!(out, "<built-in function {}>", b.name);
            }
        },
        Value::Tool(tool) => {
            let _ = write!(out, "<tool {}>", tool.name());
        }
        Value::Method(method) => match &method.receiver {
            Value::Builtin(owner) => {
                let _ = write!(out, "<method '{}' of '{}' objects>", method.name, owner.name);
            }
            receiver => {
                let _ = write!(
                    out,
                    "<bound method {}.{}>",
                    receiver.type_name(),
                    method.name
                );
            }
        },
        Value::Partial(partial) => {
            out.push_str("functools.partial(");
            write_repr(out, &partial.func, seen);
            for arg in &partial.args {
                out.push_str(", ");
                write_repr(out, arg, seen);
            }
            for (name, arg) in &partial.keywords {
                let _ = write!(out, ", {}=", name);
                write_repr(out, arg, seen);
            }
            out.push(')');
        }
        Value::Module(module) => {
            let _ = write!(out, "<module '{}'>", module.name);
        }
        Value::Pattern(pattern) => {
            let _ = write!(out, "re.compile({})", quote_str(&pattern.source));
        }
        Value::Match(m) => {
            let (start, end) = m.spans.first().copied().flatten().unwrap_or((0, 0));
            let _ = write!(
                out,
                "<re.Match object; span=({}, {}), match={}>",
                m.char_offset(start),
                m.char_offset(end),
                quote_str(&m.haystack[start..end])
            );
        }
        Value::Temporal(t) => out.push_str(&temporal_repr(t)),
    }

    if matches!(value, Value::List(_) | Value::Dict(_) | Value::Set(_)) {
        seen.pop();
    }
}

/// Shortest round-tripping float text, Python style
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let abs = f.abs();
    if !(1e-4..1e16).contains(&abs) {
        let text = format!("{:e}", f);
        let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
        let exponent: i32 = exponent.parse().unwrap_or(0);
        return format!(
            "{}e{}{:02}",
            mantissa,
            if exponent < 0 { '-' } else { '+' },
            exponent.abs()
        );
    }
    let text = format!("{}", f);
    if text.contains('.') {
        text
    } else {
        format!("{}.0", text)
    }
}

/// Quote a string the way `repr` does
pub fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

// ============================================================================
// datetime rendering
// ============================================================================

/// Normalised `(days, seconds, microseconds)` of a timedelta, with
/// `0 <= seconds < 86400` and `0 <= microseconds < 1_000_000`
pub fn delta_parts(delta: &Duration) -> (i64, i64, i64) {
    let total = delta
        .num_microseconds()
        .unwrap_or_else(|| delta.num_milliseconds().saturating_mul(1000));
    let day = 86_400_000_000i64;
    let days = total.div_euclid(day);
    let rest = total.rem_euclid(day);
    (days, rest / 1_000_000, rest % 1_000_000)
}

fn temporal_str(t: &Temporal) -> String {
    match t {
        Temporal::DateTime(dt) => {
            let micros = dt.nanosecond() / 1000;
            if micros == 0 {
                dt.format("%Y-%m-%d %H:%M:%S").to_string()
            } else {
                format!("{}.{:06}", dt.format("%Y-%m-%d %H:%M:%S"), micros)
            }
        }
        Temporal::Date(d) => d.format("%Y-%m-%d").to_string(),
        Temporal::Delta(delta) => {
            let (days, seconds, micros) = delta_parts(delta);
            let mut out = String::new();
            if days != 0 {
                let _ = write!(
                    out,
                    "{} day{}, ",
                    days,
                    if days.abs() == 1 { "" } else { "s" }
                );
            }
            let _ = write!(
                out,
                "{}:{:02}:{:02}",
                seconds / 3600,
                (seconds % 3600) / 60,
                seconds % 60
            );
            if micros != 0 {
                let _ = write!(out, ".{:06}", micros);
            }
            out
        }
    }
}

fn temporal_repr(t: &Temporal) -> String {
    match t {
        Temporal::DateTime(dt) => {
            let mut out = format!(
                "datetime.datetime({}, {}, {}, {}, {}",
                dt.year(),
                dt.month(),
                dt.day(),
                dt.hour(),
                dt.minute()
            );
            let micros = dt.nanosecond() / 1000;
            if dt.second() != 0 || micros != 0 {
                let _ = write!(out, ", {}", dt.second());
            }
            if micros != 0 {
                let _ = write!(out, ", {}", micros);
            }
            out.push(')');
            out
        }
        Temporal::Date(d) => format!("datetime.date({}, {}, {})", d.year(), d.month(), d.day()),
        Temporal::Delta(delta) => {
            let (days, seconds, micros) = delta_parts(delta);
            let mut parts = Vec::new();
            if days != 0 {
                parts.push(format!("days={}", days));
            }
            if seconds != 0 {
                parts.push(format!("seconds={}", seconds));
            }
            if micros != 0 {
                parts.push(format!("microseconds={}", micros));
            }
            if parts.is_empty() {
                "datetime.timedelta(0)".to_string()
            } else {
                format!("datetime.timedelta({})", parts.join(", "))
            }
        }
    }
}

// ============================================================================
// Format specification mini-language
// ============================================================================

/// Parsed `[[fill]align][sign][#][0][width][,|_][.precision][type]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatSpec {
    pub fill: Option<char>,
    pub align: Option<char>,
    pub sign: Option<char>,
    pub alternate: bool,
    pub zero: bool,
    pub width: Option<usize>,
    pub grouping: Option<char>,
    pub precision: Option<usize>,
    pub kind: Option<char>,
}

/// Largest precision the float formatter accepts
const MAX_PRECISION: usize = u16::MAX as usize;

fn invalid_spec(spec: &str) -> SafepyError {
    SafepyError::value_error(format!("Invalid format specifier '{}'", spec))
}

impl FormatSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let chars: Vec<char> = spec.chars().collect();
        let mut parsed = FormatSpec::default();
        let mut i = 0;
        let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

        if chars.len() >= 2 && is_align(chars[1]) {
            parsed.fill = Some(chars[0]);
            parsed.align = Some(chars[1]);
            i = 2;
        } else if chars.first().copied().is_some_and(is_align) {
            parsed.align = Some(chars[0]);
            i = 1;
        }
        if let Some(&c) = chars.get(i) {
            if matches!(c, '+' | '-' | ' ') {
                parsed.sign = Some(c);
                i += 1;
            }
        }
        if chars.get(i) == Some(&'#') {
            parsed.alternate = true;
            i += 1;
        }
        if chars.get(i) == Some(&'0') {
            parsed.zero = true;
            i += 1;
        }
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i > start {
            let digits: String = chars[start..i].iter().collect();
            parsed.width = Some(digits.parse().map_err(|_| invalid_spec(spec))?);
        }
        if let Some(&c) = chars.get(i) {
            if c == ',' || c == '_' {
                parsed.grouping = Some(c);
                i += 1;
            }
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            if i == start {
                return Err(SafepyError::value_error("Format specifier missing precision"));
            }
            let digits: String = chars[start..i].iter().collect();
            parsed.precision = Some(digits.parse().map_err(|_| invalid_spec(spec))?);
        }
        if let Some(&c) = chars.get(i) {
            parsed.kind = Some(c);
            i += 1;
        }
        if i != chars.len() {
            return Err(invalid_spec(spec));
        }
        Ok(parsed)
    }

    /// Reject widths and precisions that would build a string longer than
    /// `max_len`
    pub fn check_size(&self, max_len: usize) -> Result<()> {
        if let Some(precision) = self.precision {
            if precision > MAX_PRECISION {
                return Err(SafepyError::value_error("precision too big"));
            }
        }
        let longest = self.width.unwrap_or(0).max(self.precision.unwrap_or(0));
        if longest > max_len {
            return Err(SafepyError::memory(max_len));
        }
        Ok(())
    }
}

/// `format(value, spec)`; `max_len` bounds the padded width
pub fn format_value(value: &Value, spec: &str, max_len: usize) -> Result<String> {
    if spec.is_empty() {
        return Ok(to_str(value));
    }
    if let Value::Temporal(t) = value {
        return Ok(strftime(t, spec));
    }
    let parsed = FormatSpec::parse(spec)?;
    parsed.check_size(max_len)?;
    format_with_spec(value, &parsed)
}

pub fn format_with_spec(value: &Value, spec: &FormatSpec) -> Result<String> {
    let float_kind = matches!(
        spec.kind,
        Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%')
    );
    match value {
        Value::Int(_) | Value::Bool(_) if float_kind => {
            format_float(value.as_float()?, spec)
        }
        Value::Int(_) | Value::Bool(_) => format_int(value.as_int()?, spec),
        Value::Float(f) => match spec.kind {
            None | Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%' | 'n') => format_float(*f, spec),
            Some(k) => Err(unknown_code(k, "float")),
        },
        Value::Str(s) => match spec.kind {
            None | Some('s') => {
                if spec.sign.is_some() {
                    return Err(SafepyError::value_error(
                        "Sign not allowed in string format specifier",
                    ));
                }
                let text: String = match spec.precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s.to_string(),
                };
                Ok(pad(&text, spec, '<'))
            }
            Some(k) => Err(unknown_code(k, "str")),
        },
        Value::None if spec.kind.is_none() && spec.precision.is_none() => {
            Ok(pad("None", spec, '<'))
        }
        other => Err(SafepyError::type_error(format!(
            "unsupported format string passed to {}.__format__",
            other.type_name()
        ))),
    }
}

fn unknown_code(code: char, type_name: &str) -> SafepyError {
    SafepyError::value_error(format!(
        "Unknown format code '{}' for object of type '{}'",
        code, type_name
    ))
}

fn pad(text: &str, spec: &FormatSpec, default_align: char) -> String {
    let width = spec.width.unwrap_or(0);
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }
    let fill = spec.fill.unwrap_or(' ');
    let padding = width - len;
    let fill_str = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    match spec.align.unwrap_or(default_align) {
        '<' => format!("{}{}", text, fill_str(padding)),
        '^' => format!(
            "{}{}{}",
            fill_str(padding / 2),
            text,
            fill_str(padding - padding / 2)
        ),
        _ => format!("{}{}", fill_str(padding), text),
    }
}

/// Pad a number whose sign/prefix must stay left of `=` padding
fn pad_number(prefix: &str, body: &str, spec: &FormatSpec) -> String {
    let mut spec = spec.clone();
    if spec.zero && spec.align.is_none() {
        spec.fill = Some(spec.fill.unwrap_or('0'));
        spec.align = Some('=');
    }
    if spec.align == Some('=') {
        let width = spec.width.unwrap_or(0);
        let len = prefix.chars().count() + body.chars().count();
        let fill: String = std::iter::repeat(spec.fill.unwrap_or(' '))
            .take(width.saturating_sub(len))
            .collect();
        return format!("{}{}{}", prefix, fill, body);
    }
    pad(&format!("{}{}", prefix, body), &spec, '>')
}

fn sign_prefix(negative: bool, spec: &FormatSpec) -> &'static str {
    match (negative, spec.sign) {
        (true, _) => "-",
        (false, Some('+')) => "+",
        (false, Some(' ')) => " ",
        _ => "",
    }
}

fn group_digits(digits: &str, separator: char, every: usize) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut out = String::with_capacity(chars.len() + chars.len() / every);
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % every == 0 {
            out.push(separator);
        }
        out.push(*c);
    }
    out
}

fn format_int(value: i64, spec: &FormatSpec) -> Result<String> {
    if spec.precision.is_some() {
        return Err(SafepyError::value_error(
            "Precision not allowed in integer format specifier",
        ));
    }
    let magnitude = (value as i128).unsigned_abs();
    let (digits, radix_prefix, group_every) = match spec.kind {
        None | Some('d') | Some('n') => (magnitude.to_string(), "", 3),
        Some('b') => (format!("{:b}", magnitude), "0b", 4),
        Some('o') => (format!("{:o}", magnitude), "0o", 4),
        Some('x') => (format!("{:x}", magnitude), "0x", 4),
        Some('X') => (format!("{:X}", magnitude), "0X", 4),
        Some('c') => {
            let c = u32::try_from(value)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| SafepyError::overflow("%c arg not in range(0x110000)"))?;
            return Ok(pad(&c.to_string(), spec, '<'));
        }
        Some('s') => return Err(unknown_code('s', "int")),
        Some(k) => return Err(unknown_code(k, "int")),
    };
    let digits = match spec.grouping {
        Some(sep) => group_digits(&digits, sep, group_every),
        None => digits,
    };
    let mut prefix = sign_prefix(value < 0, spec).to_string();
    if spec.alternate {
        prefix.push_str(radix_prefix);
    }
    Ok(pad_number(&prefix, &digits, spec))
}

fn strip_fraction_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

/// `{:.Ne}` with a Python-style signed two-digit exponent
fn exp_format(x: f64, precision: usize, upper: bool) -> String {
    let text = format!("{:.*e}", precision, x);
    let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    format!(
        "{}{}{}{:02}",
        mantissa,
        if upper { 'E' } else { 'e' },
        if exponent < 0 { '-' } else { '+' },
        exponent.abs()
    )
}

fn general_format(x: f64, precision: usize, alternate: bool, upper: bool) -> String {
    let precision = precision.max(1);
    let exponent = if x == 0.0 {
        0
    } else {
        let text = format!("{:.*e}", precision - 1, x);
        text.split_once('e')
            .and_then(|(_, e)| e.parse::<i32>().ok())
            .unwrap_or(0)
    };
    if exponent >= -4 && exponent < precision as i32 {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        let text = format!("{:.*}", decimals, x);
        if alternate {
            text
        } else {
            strip_fraction_zeros(&text)
        }
    } else {
        let text = exp_format(x, precision - 1, upper);
        if alternate {
            return text;
        }
        let (mantissa, exp) = text
            .split_once(if upper { 'E' } else { 'e' })
            .unwrap_or((&text, ""));
        format!(
            "{}{}{}",
            strip_fraction_zeros(mantissa),
            if upper { 'E' } else { 'e' },
            exp
        )
    }
}

fn format_float(value: f64, spec: &FormatSpec) -> Result<String> {
    let upper = matches!(spec.kind, Some('E' | 'F' | 'G'));
    let negative = value.is_sign_negative() && !value.is_nan();
    let x = value.abs();

    let body = if x.is_nan() || x.is_infinite() {
        let text = if x.is_nan() { "nan" } else { "inf" };
        let text = if upper { text.to_uppercase() } else { text.to_string() };
        if spec.kind == Some('%') {
            format!("{}%", text)
        } else {
            text
        }
    } else {
        match spec.kind {
            Some('f' | 'F') => format!("{:.*}", spec.precision.unwrap_or(6), x),
            Some('e' | 'E') => exp_format(x, spec.precision.unwrap_or(6), upper),
            Some('g' | 'G' | 'n') => {
                general_format(x, spec.precision.unwrap_or(6), spec.alternate, upper)
            }
            Some('%') => format!("{:.*}%", spec.precision.unwrap_or(6), x * 100.0),
            _ => match spec.precision {
                Some(p) => {
                    let text = general_format(x, p, spec.alternate, false);
                    if text.contains(['.', 'e']) {
                        text
                    } else {
                        format!("{}.0", text)
                    }
                }
                None => float_repr(x),
            },
        }
    };

    let body = match spec.grouping {
        Some(sep) if x.is_finite() => {
            let split = body.find(['.', 'e', 'E', '%']).unwrap_or(body.len());
            format!("{}{}", group_digits(&body[..split], sep, 3), &body[split..])
        }
        _ => body,
    };
    Ok(pad_number(sign_prefix(negative, spec), &body, spec))
}

/// `strftime` for datetime values; chrono's directives match Python's for
/// the common cases
pub fn strftime(t: &Temporal, format: &str) -> String {
    use chrono::format::{Item, StrftimeItems};

    let items: Vec<Item> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return format.to_string();
    }
    match t {
        Temporal::DateTime(dt) => dt.format_with_items(items.into_iter()).to_string(),
        Temporal::Date(d) => d
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.format_with_items(items.into_iter()).to_string())
            .unwrap_or_default(),
        Temporal::Delta(_) => temporal_str(t),
    }
}

// ============================================================================
// printf-style `%` formatting
// ============================================================================

/// `template % args`
pub fn percent_format(template: &str, args: &Value, max_len: usize) -> Result<String> {
    let (items, mapping): (Vec<Value>, Option<Value>) = match args {
        Value::Tuple(items) => (items.to_vec(), None),
        Value::Dict(_) => (Vec::new(), Some(args.clone())),
        other => (vec![other.clone()], None),
    };
    let mut items = items.into_iter();
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    let incomplete = || SafepyError::value_error("incomplete format");

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;

        let mut key = None;
        if chars.get(i) == Some(&'(') {
            let close = chars[i..]
                .iter()
                .position(|c| *c == ')')
                .ok_or_else(|| SafepyError::value_error("incomplete format key"))?;
            key = Some(chars[i + 1..i + close].iter().collect::<String>());
            i += close + 1;
        }

        let mut spec = FormatSpec::default();
        let mut left = false;
        while let Some(&c) = chars.get(i) {
            match c {
                '-' => left = true,
                '+' => spec.sign = Some('+'),
                ' ' => {
                    if spec.sign.is_none() {
                        spec.sign = Some(' ')
                    }
                }
                '#' => spec.alternate = true,
                '0' => spec.zero = true,
                _ => break,
            }
            i += 1;
        }
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i > start {
            spec.width = Some(
                chars[start..i]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .unwrap_or(usize::MAX),
            );
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            let digits: String = chars[start..i].iter().collect();
            spec.precision = Some(if digits.is_empty() {
                0
            } else {
                digits.parse().unwrap_or(usize::MAX)
            });
        }
        spec.check_size(max_len)?;
        while matches!(chars.get(i), Some('h' | 'l' | 'L')) {
            i += 1;
        }
        let conversion = *chars.get(i).ok_or_else(incomplete)?;
        i += 1;

        if conversion == '%' {
            out.push('%');
            continue;
        }
        if left {
            spec.align = Some('<');
            spec.zero = false;
        }

        let value = match (&key, &mapping) {
            (Some(key), Some(Value::Dict(dict))) => dict
                .borrow()
                .get_str(key)
                .ok_or_else(|| SafepyError::key_error(quote_str(key)))?,
            (Some(_), _) => {
                return Err(SafepyError::type_error("format requires a mapping"))
            }
            (None, _) => items.next().ok_or_else(|| {
                SafepyError::type_error("not enough arguments for format string")
            })?,
        };

        let text = match conversion {
            's' | 'r' | 'a' => {
                let text = if conversion == 's' {
                    to_str(&value)
                } else {
                    repr(&value)
                };
                spec.sign = None;
                spec.zero = false;
                spec.align.get_or_insert('>');
                format_with_spec(&Value::str(text), &spec)?
            }
            'd' | 'i' | 'u' => {
                let int = match &value {
                    Value::Float(f) if f.is_finite() => f.trunc() as i64,
                    other => other.as_int().map_err(|_| {
                        SafepyError::type_error(format!(
                            "%{} format: a real number is required, not {}",
                            conversion,
                            other.type_name()
                        ))
                    })?,
                };
                spec.precision = None;
                format_int(int, &spec)?
            }
            'x' | 'X' | 'o' | 'c' => {
                spec.kind = Some(conversion);
                spec.precision = None;
                format_int(value.as_int()?, &spec)?
            }
            'e' | 'E' | 'f' | 'F' | 'g' | 'G' => {
                spec.kind = Some(conversion);
                format_float(value.as_float()?, &spec)?
            }
            other => {
                return Err(SafepyError::value_error(format!(
                    "unsupported format character '{}'",
                    other
                )))
            }
        };
        out.push_str(&text);
        if out.len() > max_len {
            return Err(SafepyError::memory(max_len));
        }
    }

    if mapping.is_none() && items.next().is_some() {
        return Err(SafepyError::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

// ============================================================================
// str.format
// ============================================================================

/// `template.format(*positional, **keywords)`
pub fn str_format(
    template: &str,
    positional: &[Value],
    keywords: &[(String, Value)],
    max_len: usize,
) -> Result<String> {
    let mut formatter = FieldFormatter {
        positional,
        keywords,
        max_len,
        next_auto: 0,
        manual: false,
    };
    formatter.render(template, 0)
}

struct FieldFormatter<'a> {
    positional: &'a [Value],
    keywords: &'a [(String, Value)],
    max_len: usize,
    next_auto: usize,
    manual: bool,
}

impl FieldFormatter<'_> {
    fn render(&mut self, template: &str, depth: usize) -> Result<String> {
        if depth > 2 {
            return Err(SafepyError::value_error("Max string recursion exceeded"));
        }
        let chars: Vec<char> = template.chars().collect();
        let mut out = String::with_capacity(template.len());
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '{' if chars.get(i + 1) == Some(&'{') => {
                    out.push('{');
                    i += 2;
                }
                '}' if chars.get(i + 1) == Some(&'}') => {
                    out.push('}');
                    i += 2;
                }
                '}' => {
                    return Err(SafepyError::value_error(
                        "Single '}' encountered in format string",
                    ))
                }
                '{' => {
                    let mut nesting = 0;
                    let mut j = i + 1;
                    while j < chars.len() {
                        match chars[j] {
                            '{' => nesting += 1,
                            '}' if nesting == 0 => break,
                            '}' => nesting -= 1,
                            _ => {}
                        }
                        j += 1;
                    }
                    if j >= chars.len() {
                        return Err(SafepyError::value_error(
                            "Single '{' encountered in format string",
                        ));
                    }
                    let field: String = chars[i + 1..j].iter().collect();
                    out.push_str(&self.field(&field, depth)?);
                    if out.len() > self.max_len {
                        return Err(SafepyError::memory(self.max_len));
                    }
                    i = j + 1;
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    fn field(&mut self, field: &str, depth: usize) -> Result<String> {
        let (head, spec) = match field.find(':') {
            Some(at) => (&field[..at], &field[at + 1..]),
            None => (field, ""),
        };
        let (name, conversion) = match head.find('!') {
            Some(at) => (&head[..at], head[at + 1..].chars().next()),
            None => (head, None),
        };

        let (base, accessors) = match name.find('[') {
            Some(at) => (&name[..at], &name[at..]),
            None => (name, ""),
        };
        if base.contains('.') {
            return Err(SafepyError::value_error(
                "attribute access in format fields is not supported",
            ));
        }

        let mut value = if base.is_empty() {
            if self.manual {
                return Err(SafepyError::value_error(
                    "cannot switch from manual field specification to automatic field numbering",
                ));
            }
            let index = self.next_auto;
            self.next_auto += 1;
            self.positional_arg(index)?
        } else if let Ok(index) = base.parse::<usize>() {
            if self.next_auto > 0 {
                return Err(SafepyError::value_error(
                    "cannot switch from automatic field numbering to manual field specification",
                ));
            }
            self.manual = true;
            self.positional_arg(index)?
        } else {
            self.keywords
                .iter()
                .find(|(k, _)| k == base)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| SafepyError::key_error(quote_str(base)))?
        };

        let mut rest = accessors;
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| SafepyError::value_error("Missing ']' in format string"))?;
            let key = &stripped[..close];
            value = index_field(&value, key)?;
            rest = &stripped[close + 1..];
        }

        let value = match conversion {
            None => value,
            Some('s') => Value::str(to_str(&value)),
            Some('r') | Some('a') => Value::str(repr(&value)),
            Some(other) => {
                return Err(SafepyError::value_error(format!(
                    "Unknown conversion specifier {}",
                    other
                )))
            }
        };
        let spec = if spec.contains('{') {
            self.render(spec, depth + 1)?
        } else {
            spec.to_string()
        };
        format_value(&value, &spec, self.max_len)
    }

    fn positional_arg(&self, index: usize) -> Result<Value> {
        self.positional.get(index).cloned().ok_or_else(|| {
            SafepyError::index_error(format!(
                "Replacement index {} out of range for positional args tuple",
                index
            ))
        })
    }
}

fn index_field(value: &Value, key: &str) -> Result<Value> {
    match value {
        Value::List(_) | Value::Tuple(_) => {
            let index: usize = key
                .parse()
                .map_err(|_| SafepyError::type_error("list indices must be integers"))?;
            let items = match value {
                Value::List(l) => l.borrow().clone(),
                Value::Tuple(t) => t.to_vec(),
                _ => Vec::new(),
            };
            items
                .get(index)
                .cloned()
                .ok_or_else(|| SafepyError::index_error("list index out of range"))
        }
        Value::Dict(dict) => {
            let dict = dict.borrow();
            let found = match key.parse::<i64>() {
                Ok(i) => dict.get(&Value::Int(i))?,
                Err(_) => dict.get_str(key),
            };
            found.ok_or_else(|| SafepyError::key_error(quote_str(key)))
        }
        other => Err(SafepyError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1_000;
    use crate::value::Dict;

    #[test]
    fn test_float_repr() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn test_repr_of_containers() {
        let mut dict = Dict::new();
        dict.insert(Value::str("a"), Value::list(vec![Value::Int(1), Value::None]))
            .unwrap();
        assert_eq!(repr(&Value::dict(dict)), "{'a': [1, None]}");
        assert_eq!(repr(&Value::tuple(vec![Value::Int(1)])), "(1,)");
        assert_eq!(repr(&Value::str("it's")), "\"it's\"");
        assert_eq!(repr(&Value::str("a\nb")), "'a\\nb'");
    }

    #[test]
    fn test_self_referencing_list() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_eq!(repr(&list), "[1, [...]]");
        // break the cycle so the test does not leak
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_format_spec_numbers() {
        assert_eq!(format_value(&Value::Float(3.14159), ".2f", MAX).unwrap(), "3.14");
        assert_eq!(format_value(&Value::Int(1234567), ",", MAX).unwrap(), "1,234,567");
        assert_eq!(format_value(&Value::Int(42), "08.3f", MAX).unwrap(), "0042.000");
        assert_eq!(format_value(&Value::Int(255), "#x", MAX).unwrap(), "0xff");
        assert_eq!(format_value(&Value::Int(-5), "05d", MAX).unwrap(), "-0005");
        assert_eq!(format_value(&Value::Float(0.25), ".1%", MAX).unwrap(), "25.0%");
        assert_eq!(format_value(&Value::Float(12345.678), ".3g", MAX).unwrap(), "1.23e+04");
        assert_eq!(format_value(&Value::Float(1234.5), ",.2f", MAX).unwrap(), "1,234.50");
        assert_eq!(format_value(&Value::Float(1e-7), "e", MAX).unwrap(), "1.000000e-07");
    }

    #[test]
    fn test_format_spec_alignment() {
        assert_eq!(format_value(&Value::str("ab"), ">5", MAX).unwrap(), "   ab");
        assert_eq!(format_value(&Value::str("ab"), "*^6", MAX).unwrap(), "**ab**");
        assert_eq!(format_value(&Value::Int(7), "<3", MAX).unwrap(), "7  ");
        assert!(format_value(&Value::str("x"), "d", MAX).is_err());
    }

    #[test]
    fn test_percent_format() {
        let args = Value::tuple(vec![Value::str("x"), Value::Int(3), Value::Float(2.5)]);
        assert_eq!(
            percent_format("%s=%d (%.2f) 100%%", &args, MAX).unwrap(),
            "x=3 (2.50) 100%"
        );
        assert_eq!(percent_format("%5s|%-4d|", &Value::tuple(vec![Value::str("a"), Value::Int(1)]), MAX).unwrap(), "    a|1   |");
        assert!(percent_format("%s %s", &Value::str("only"), MAX).is_err());
        assert!(percent_format("%s", &Value::tuple(vec![Value::Int(1), Value::Int(2)]), MAX).is_err());
    }

    #[test]
    fn test_str_format() {
        let positional = vec![Value::str("world"), Value::Float(3.14159)];
        let keywords = vec![("n".to_string(), Value::Int(5))];
        assert_eq!(
            str_format("hello {}! pi={:.2f} n={n:>3}", &positional, &keywords, MAX).unwrap(),
            "hello world! pi=3.14 n=  5"
        );
        assert_eq!(
            str_format("{0}{0}{1!r}", &positional, &[], MAX).unwrap(),
            "worldworld3.14159"
        );
        assert_eq!(str_format("{{x}}", &[], &[], MAX).unwrap(), "{x}");
        assert!(str_format("{} {}", &positional[..1], &[], MAX).is_err());
    }

    #[test]
    fn test_oversized_width_and_precision_rejected() {
        let err = format_value(&Value::Int(1), ">1000000000", MAX).unwrap_err();
        assert!(err.message().starts_with("MemoryError"));
        let err = format_value(&Value::Float(1.0), ".1000000000f", usize::MAX).unwrap_err();
        assert_eq!(err.message(), "ValueError: precision too big");
        assert!(format_value(&Value::Float(1.0), ".70000e", usize::MAX).is_err());
        assert!(percent_format("%1000000000d", &Value::Int(1), MAX).is_err());
        assert!(percent_format("%.99999999999999999999f", &Value::Float(1.0), usize::MAX).is_err());
        assert!(str_format("{:>5000}", &[Value::Int(1)], &[], MAX).is_err());
        assert_eq!(format_value(&Value::Int(1), ">1000", MAX).unwrap().len(), 1000);
    }

    #[test]
    fn test_timedelta_str() {
        let delta = Duration::seconds(90061);
        assert_eq!(temporal_str(&Temporal::Delta(delta)), "1 day, 1:01:01");
        let negative = Duration::seconds(-1);
        assert_eq!(temporal_str(&Temporal::Delta(negative)), "-1 day, 23:59:59");
    }
}
