//! `re` module on the linear-time `regex` engine
//!
//! Backreferences and lookaround are not supported by the engine and fail at
//! compile time with `re.error`.

use std::rc::Rc;

use regex::{Captures, Regex, RegexBuilder};

use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::value::{Arguments, Dict, MatchData, Module, Pattern, Value};

pub const IGNORECASE: i64 = 2;
pub const MULTILINE: i64 = 8;
pub const DOTALL: i64 = 16;
pub const UNICODE: i64 = 32;
pub const VERBOSE: i64 = 64;
pub const ASCII: i64 = 256;

/// Compiled program size cap handed to the regex engine
const REGEX_SIZE_LIMIT: usize = 1 << 22;

const PATTERN_METHODS: &[&str] = &[
    "search", "match", "fullmatch", "findall", "finditer", "sub", "subn", "split",
];

const MATCH_METHODS: &[&str] = &["group", "groups", "groupdict", "start", "end", "span", "expand"];

pub fn module() -> Module {
    Module::new("re")
        .function("compile", compile)
        .function("search", search)
        .function("match", match_)
        .function("fullmatch", fullmatch)
        .function("findall", findall)
        .function("finditer", finditer)
        .function("sub", sub)
        .function("subn", subn)
        .function("split", split)
        .function("escape", escape)
        .with("I", Value::Int(IGNORECASE))
        .with("IGNORECASE", Value::Int(IGNORECASE))
        .with("M", Value::Int(MULTILINE))
        .with("MULTILINE", Value::Int(MULTILINE))
        .with("S", Value::Int(DOTALL))
        .with("DOTALL", Value::Int(DOTALL))
        .with("U", Value::Int(UNICODE))
        .with("UNICODE", Value::Int(UNICODE))
        .with("X", Value::Int(VERBOSE))
        .with("VERBOSE", Value::Int(VERBOSE))
        .with("A", Value::Int(ASCII))
        .with("ASCII", Value::Int(ASCII))
}

fn re_error(message: impl std::fmt::Display) -> SafepyError {
    SafepyError::RuntimeRestriction(format!("re.error: {}", message))
}

/// Python spellings the engine writes differently
fn translate(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Z') => out.push_str("\\z"),
            Some(next) => {
                out.push('\\');
                out.push(next);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn build(source: &str, flags: i64) -> Result<Regex> {
    RegexBuilder::new(source)
        .case_insensitive(flags & IGNORECASE != 0)
        .multi_line(flags & MULTILINE != 0)
        .dot_matches_new_line(flags & DOTALL != 0)
        .ignore_whitespace(flags & VERBOSE != 0)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| match e {
            regex::Error::Syntax(detail) => {
                let summary = detail
                    .lines()
                    .rev()
                    .find(|l| l.starts_with("error:"))
                    .unwrap_or(detail.as_str())
                    .trim_start_matches("error:")
                    .trim()
                    .to_string();
                re_error(summary)
            }
            regex::Error::CompiledTooBig(_) => re_error("pattern too large"),
            other => re_error(other),
        })
}

pub fn compile_pattern(source: &str, flags: i64) -> Result<Rc<Pattern>> {
    let regex = build(&translate(source), flags)?;
    Ok(Rc::new(Pattern {
        source: source.to_string(),
        flags,
        regex,
    }))
}

/// `pattern` argument of the module functions: str or compiled pattern
fn pattern_arg(value: &Value, flags: Option<Value>) -> Result<Rc<Pattern>> {
    let flags = match flags {
        None | Some(Value::None) => 0,
        Some(f) => f.as_int()?,
    };
    match value {
        Value::Pattern(p) => {
            if flags != 0 {
                return Err(SafepyError::value_error(
                    "cannot process flags argument with a compiled pattern",
                ));
            }
            Ok(p.clone())
        }
        Value::Str(s) => compile_pattern(s, flags),
        other => Err(SafepyError::type_error(format!(
            "first argument must be string or compiled pattern, not {}",
            other.type_name()
        ))),
    }
}

fn text_arg(value: &Value) -> Result<Rc<str>> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(SafepyError::type_error(format!(
            "expected string, got '{}'",
            other.type_name()
        ))),
    }
}

fn make_match(pattern: &Rc<Pattern>, haystack: &Rc<str>, caps: &Captures<'_>) -> Value {
    let spans = (0..caps.len())
        .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
        .collect();
    Value::Match(Rc::new(MatchData {
        haystack: haystack.clone(),
        spans,
        pattern: pattern.clone(),
    }))
}

fn byte_offset(text: &str, chars: i64) -> usize {
    if chars <= 0 {
        return 0;
    }
    text.char_indices()
        .nth(chars as usize)
        .map(|(b, _)| b)
        .unwrap_or(text.len())
}

#[derive(Clone, Copy, PartialEq)]
enum Anchor {
    None,
    Start,
    Full,
}

fn find(pattern: &Rc<Pattern>, haystack: &Rc<str>, pos: usize, anchor: Anchor) -> Result<Value> {
    let found = match anchor {
        Anchor::None => pattern.regex.captures_at(haystack, pos).map(|c| make_match(pattern, haystack, &c)),
        // a match starting at `pos` is the leftmost one whenever it exists
        Anchor::Start => pattern
            .regex
            .captures_at(haystack, pos)
            .filter(|c| c.get(0).map(|m| m.start()) == Some(pos))
            .map(|c| make_match(pattern, haystack, &c)),
        Anchor::Full => {
            let anchored = build(
                &format!("\\A(?:{})\\z", translate(&pattern.source)),
                pattern.flags,
            )?;
            anchored
                .captures(&haystack[pos..])
                .map(|c| {
                    let spans = (0..c.len())
                        .map(|i| c.get(i).map(|m| (m.start() + pos, m.end() + pos)))
                        .collect();
                    Value::Match(Rc::new(MatchData {
                        haystack: haystack.clone(),
                        spans,
                        pattern: pattern.clone(),
                    }))
                })
        }
    };
    Ok(found.unwrap_or(Value::None))
}

fn group_text(m: Option<regex::Match<'_>>) -> Value {
    Value::str(m.map(|m| m.as_str()).unwrap_or(""))
}

fn findall_in(pattern: &Rc<Pattern>, haystack: &str) -> Value {
    let groups = pattern.regex.captures_len() - 1;
    let items = pattern
        .regex
        .captures_iter(haystack)
        .map(|caps| match groups {
            0 => group_text(caps.get(0)),
            1 => group_text(caps.get(1)),
            n => Value::tuple((1..=n).map(|i| group_text(caps.get(i))).collect()),
        })
        .collect();
    Value::list(items)
}

fn finditer_in(pattern: &Rc<Pattern>, haystack: &Rc<str>) -> Value {
    let matches: Vec<Value> = pattern
        .regex
        .captures_iter(haystack)
        .map(|caps| make_match(pattern, haystack, &caps))
        .collect();
    Value::iterator("callable_iterator", matches)
}

fn split_in(pattern: &Rc<Pattern>, haystack: &str, maxsplit: i64) -> Value {
    let mut parts = Vec::new();
    let mut last = 0;
    for (n, caps) in pattern.regex.captures_iter(haystack).enumerate() {
        if maxsplit > 0 && n as i64 >= maxsplit {
            break;
        }
        let Some(whole) = caps.get(0) else { continue };
        parts.push(Value::str(&haystack[last..whole.start()]));
        for i in 1..caps.len() {
            parts.push(match caps.get(i) {
                Some(m) => Value::str(m.as_str()),
                None => Value::None,
            });
        }
        last = whole.end();
    }
    parts.push(Value::str(&haystack[last..]));
    Value::list(parts)
}

/// Expand a Python replacement template (`\1`, `\g<name>`, escapes)
pub fn expand_template(template: &str, pattern: &Pattern, caps: &Captures<'_>) -> Result<String> {
    let group = |index: usize| -> Result<&str> {
        if index >= caps.len() {
            return Err(re_error(format!("invalid group reference {}", index)));
        }
        Ok(caps.get(index).map(|m| m.as_str()).unwrap_or(""))
    };
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(d) if d.is_ascii_digit() => {
                let mut digits = d.to_string();
                if let Some(&e) = chars.peek() {
                    if e.is_ascii_digit() {
                        digits.push(e);
                        chars.next();
                    }
                }
                let index: usize = digits.parse().map_err(|_| re_error("bad group reference"))?;
                out.push_str(group(index)?);
            }
            Some('g') => {
                if chars.next() != Some('<') {
                    return Err(re_error("missing <"));
                }
                let name: String = chars.by_ref().take_while(|c| *c != '>').collect();
                let index = match name.parse::<usize>() {
                    Ok(i) => i,
                    Err(_) => pattern
                        .regex
                        .capture_names()
                        .position(|n| n == Some(name.as_str()))
                        .ok_or_else(|| {
                            SafepyError::index_error(format!("unknown group name '{}'", name))
                        })?,
                };
                out.push_str(group(index)?);
            }
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) if other.is_ascii_alphabetic() => {
                return Err(re_error(format!("bad escape \\{}", other)))
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => return Err(re_error("bad escape (end of pattern)")),
        }
    }
    Ok(out)
}

fn substitute(
    interp: &mut Interpreter<'_>,
    pattern: &Rc<Pattern>,
    replacement: &Value,
    haystack: &Rc<str>,
    count: i64,
) -> EvalResult<(String, i64)> {
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    let mut n = 0;
    let all: Vec<Captures<'_>> = pattern.regex.captures_iter(haystack).collect();
    for caps in &all {
        if count > 0 && n >= count {
            break;
        }
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&haystack[last..whole.start()]);
        match replacement {
            Value::Str(template) => out.push_str(&expand_template(template, pattern, caps)?),
            func if func.is_callable() => {
                let m = make_match(pattern, haystack, caps);
                let piece = interp.call_with(func, vec![m])?;
                out.push_str(&text_arg(&piece)?);
            }
            other => {
                return Err(SafepyError::type_error(format!(
                    "expected str or callable replacement, not {}",
                    other.type_name()
                ))
                .into())
            }
        }
        if out.len() > interp.limits.max_collection_len {
            return Err(interp.memory_error().into());
        }
        last = whole.end();
        n += 1;
    }
    out.push_str(&haystack[last..]);
    Ok((out, n))
}

// ============================================================================
// Module functions
// ============================================================================

fn compile(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let flags = args.take(1, "flags");
    let values = args.between("compile", 1, 2)?;
    Ok(Value::Pattern(pattern_arg(&values[0], flags)?))
}

/// `(pattern, string, flags=0)` shared by the search-style functions
fn pattern_and_text(mut args: Arguments, name: &str) -> Result<(Rc<Pattern>, Rc<str>)> {
    let flags = args.take(2, "flags");
    let values = args.between(name, 2, 3)?;
    Ok((pattern_arg(&values[0], flags)?, text_arg(&values[1])?))
}

fn search(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (pattern, text) = pattern_and_text(args, "search")?;
    Ok(find(&pattern, &text, 0, Anchor::None)?)
}

fn match_(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (pattern, text) = pattern_and_text(args, "match")?;
    Ok(find(&pattern, &text, 0, Anchor::Start)?)
}

fn fullmatch(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (pattern, text) = pattern_and_text(args, "fullmatch")?;
    Ok(find(&pattern, &text, 0, Anchor::Full)?)
}

fn findall(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (pattern, text) = pattern_and_text(args, "findall")?;
    Ok(findall_in(&pattern, &text))
}

fn finditer(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (pattern, text) = pattern_and_text(args, "finditer")?;
    Ok(finditer_in(&pattern, &text))
}

fn sub_args(mut args: Arguments, name: &str) -> Result<(Rc<Pattern>, Value, Rc<str>, i64)> {
    let flags = args.take(4, "flags");
    let count = args.take(3, "count");
    let values = args.between(name, 3, 5)?;
    let count = match count {
        Some(c) => c.as_int()?,
        None => 0,
    };
    Ok((
        pattern_arg(&values[0], flags)?,
        values[1].clone(),
        text_arg(&values[2])?,
        count,
    ))
}

fn sub(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (pattern, replacement, text, count) = sub_args(args, "sub")?;
    let (out, _) = substitute(interp, &pattern, &replacement, &text, count)?;
    Ok(Value::str(out))
}

fn subn(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (pattern, replacement, text, count) = sub_args(args, "subn")?;
    let (out, n) = substitute(interp, &pattern, &replacement, &text, count)?;
    Ok(Value::tuple(vec![Value::str(out), Value::Int(n)]))
}

fn split(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let flags = args.take(3, "flags");
    let maxsplit = args.take(2, "maxsplit");
    let values = args.between("split", 2, 4)?;
    let pattern = pattern_arg(&values[0], flags)?;
    let text = text_arg(&values[1])?;
    let maxsplit = match maxsplit {
        Some(m) => m.as_int()?,
        None => 0,
    };
    Ok(split_in(&pattern, &text, maxsplit))
}

/// Escape the characters Python's `re.escape` escapes
pub fn escape_text(text: &str) -> String {
    const SPECIAL: &str = "()[]{}?*+-|^$\\.&~# \t\n\r\x0b\x0c";
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [text] = args.exact::<1>("escape")?;
    Ok(Value::str(escape_text(&text_arg(&text)?)))
}

// ============================================================================
// Pattern and Match objects
// ============================================================================

pub fn has_method(value: &Value, name: &str) -> bool {
    match value {
        Value::Pattern(_) => PATTERN_METHODS.contains(&name),
        Value::Match(_) => MATCH_METHODS.contains(&name),
        _ => false,
    }
}

pub fn attribute(value: &Value, name: &str) -> Option<Value> {
    match (value, name) {
        (Value::Pattern(p), "pattern") => Some(Value::str(p.source.as_str())),
        (Value::Pattern(p), "flags") => Some(Value::Int(p.flags)),
        (Value::Pattern(p), "groups") => Some(Value::Int(p.regex.captures_len() as i64 - 1)),
        (Value::Pattern(p), "groupindex") => {
            let mut dict = Dict::new();
            for (i, name) in p.regex.capture_names().enumerate() {
                if let Some(name) = name {
                    dict.insert(Value::str(name), Value::Int(i as i64)).ok()?;
                }
            }
            Some(Value::dict(dict))
        }
        (Value::Match(m), "string") => Some(Value::Str(m.haystack.clone())),
        (Value::Match(m), "re") => Some(Value::Pattern(m.pattern.clone())),
        (Value::Match(_), "pos") => Some(Value::Int(0)),
        (Value::Match(m), "endpos") => Some(Value::Int(m.char_offset(m.haystack.len()))),
        (Value::Match(m), "lastindex") => Some(
            (1..m.spans.len())
                .filter(|i| m.spans[*i].is_some())
                .max_by_key(|i| m.spans[*i].map(|(_, end)| end))
                .map(|i| Value::Int(i as i64))
                .unwrap_or(Value::None),
        ),
        _ => None,
    }
}

fn match_span(m: &MatchData, group: Option<Value>) -> Result<Option<(i64, i64)>> {
    let index = match group {
        Some(g) => m.group_index(&g)?,
        None => 0,
    };
    Ok(m
        .spans
        .get(index)
        .copied()
        .flatten()
        .map(|(start, end)| (m.char_offset(start), m.char_offset(end))))
}

fn match_method(
    m: &Rc<MatchData>,
    name: &str,
    mut args: Arguments,
) -> EvalResult<Value> {
    let value = match name {
        "group" => {
            args.finish(name)?;
            let groups = std::mem::take(&mut args.positional);
            let fetch = |g: &Value| -> Result<Value> {
                let index = m.group_index(g)?;
                m.group(index).ok_or_else(|| SafepyError::index_error("no such group"))
            };
            match groups.as_slice() {
                [] => fetch(&Value::Int(0))?,
                [one] => fetch(one)?,
                many => Value::tuple(many.iter().map(fetch).collect::<Result<Vec<_>>>()?),
            }
        }
        "groups" => {
            let default = args.take(0, "default").unwrap_or(Value::None);
            args.between(name, 0, 1)?;
            let items = (1..m.spans.len())
                .map(|i| match m.spans[i] {
                    Some(_) => m.group(i).unwrap_or(Value::None),
                    None => default.clone(),
                })
                .collect();
            Value::tuple(items)
        }
        "groupdict" => {
            let default = args.take(0, "default").unwrap_or(Value::None);
            args.between(name, 0, 1)?;
            let mut dict = Dict::new();
            for (i, group) in m.pattern.regex.capture_names().enumerate() {
                if let Some(group) = group {
                    let value = match m.spans.get(i).copied().flatten() {
                        Some(_) => m.group(i).unwrap_or(Value::None),
                        None => default.clone(),
                    };
                    dict.insert(Value::str(group), value)?;
                }
            }
            Value::dict(dict)
        }
        "start" | "end" | "span" => {
            let group = args.between(name, 0, 1)?.pop();
            let span = match_span(m, group)?.unwrap_or((-1, -1));
            match name {
                "start" => Value::Int(span.0),
                "end" => Value::Int(span.1),
                _ => Value::tuple(vec![Value::Int(span.0), Value::Int(span.1)]),
            }
        }
        "expand" => {
            let [template] = args.exact::<1>(name)?;
            let caps = m
                .pattern
                .regex
                .captures_at(&m.haystack, m.spans.first().copied().flatten().map_or(0, |s| s.0))
                .ok_or_else(|| SafepyError::internal("match no longer reproducible"))?;
            Value::str(expand_template(&text_arg(&template)?, &m.pattern, &caps)?)
        }
        _ => return Err(SafepyError::internal(format!("unknown match method {}", name)).into()),
    };
    Ok(value)
}

fn pattern_method(
    interp: &mut Interpreter<'_>,
    pattern: &Rc<Pattern>,
    name: &str,
    mut args: Arguments,
) -> EvalResult<Value> {
    match name {
        "search" | "match" | "fullmatch" => {
            let pos = args.take(1, "pos");
            let values = args.between(name, 1, 2)?;
            let text = text_arg(&values[0])?;
            let pos = match pos {
                Some(p) => byte_offset(&text, p.as_int()?),
                None => 0,
            };
            let anchor = match name {
                "search" => Anchor::None,
                "match" => Anchor::Start,
                _ => Anchor::Full,
            };
            Ok(find(pattern, &text, pos, anchor)?)
        }
        "findall" => {
            let [text] = args.exact::<1>(name)?;
            Ok(findall_in(pattern, &text_arg(&text)?))
        }
        "finditer" => {
            let [text] = args.exact::<1>(name)?;
            Ok(finditer_in(pattern, &text_arg(&text)?))
        }
        "split" => {
            let maxsplit = args.take(1, "maxsplit");
            let values = args.between(name, 1, 2)?;
            let maxsplit = match maxsplit {
                Some(m) => m.as_int()?,
                None => 0,
            };
            Ok(split_in(pattern, &text_arg(&values[0])?, maxsplit))
        }
        "sub" | "subn" => {
            let count = args.take(2, "count");
            let values = args.between(name, 2, 3)?;
            let count = match count {
                Some(c) => c.as_int()?,
                None => 0,
            };
            let text = text_arg(&values[1])?;
            let (out, n) = substitute(interp, pattern, &values[0], &text, count)?;
            if name == "sub" {
                Ok(Value::str(out))
            } else {
                Ok(Value::tuple(vec![Value::str(out), Value::Int(n)]))
            }
        }
        _ => Err(SafepyError::internal(format!("unknown pattern method {}", name)).into()),
    }
}

pub fn call_method(
    interp: &mut Interpreter<'_>,
    value: &Value,
    name: &str,
    args: Arguments,
) -> EvalResult<Value> {
    match value {
        Value::Pattern(p) => pattern_method(interp, p, name, args),
        Value::Match(m) => match_method(m, name, args),
        other => Err(SafepyError::attribute_error(format!(
            "'{}' object has no attribute '{}'",
            other.type_name(),
            name
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_end_anchor() {
        assert_eq!(translate(r"abc\Z"), r"abc\z");
        assert_eq!(translate(r"\\Z"), r"\\Z");
    }

    #[test]
    fn test_lookaround_is_rejected() {
        let err = compile_pattern("(?=a)b", 0).unwrap_err();
        assert!(err.message().starts_with("re.error:"));
    }

    #[test]
    fn test_expand_template_groups() {
        let pattern = compile_pattern(r"(?P<word>\w+) (\d+)", 0).unwrap();
        let caps = pattern.regex.captures("abc 42").unwrap();
        assert_eq!(
            expand_template(r"\2-\g<word>-\g<1>", &pattern, &caps).unwrap(),
            "42-abc-abc"
        );
        assert!(expand_template(r"\9", &pattern, &caps).is_err());
    }

    #[test]
    fn test_split_keeps_groups() {
        let pattern = compile_pattern(r"(,)", 0).unwrap();
        assert_eq!(split_in(&pattern, "a,b", 0).to_string(), "['a', ',', 'b']");
        let plain = compile_pattern(r",\s*", 0).unwrap();
        assert_eq!(split_in(&plain, "a, b,c", 1).to_string(), "['a', 'b,c']");
    }

    #[test]
    fn test_findall_shapes() {
        let none = compile_pattern(r"\d", 0).unwrap();
        assert_eq!(findall_in(&none, "a1b2").to_string(), "['1', '2']");
        let two = compile_pattern(r"(\w)(\d)", 0).unwrap();
        assert_eq!(findall_in(&two, "a1b2").to_string(), "[('a', '1'), ('b', '2')]");
    }

    #[test]
    fn test_match_anchoring() {
        let pattern = compile_pattern("a|ab", 0).unwrap();
        let text: Rc<str> = Rc::from("ab");
        assert!(matches!(find(&pattern, &text, 0, Anchor::Full).unwrap(), Value::Match(_)));
        let later = compile_pattern("b", 0).unwrap();
        assert!(find(&later, &text, 0, Anchor::Start).unwrap().is_none());
        assert!(matches!(find(&later, &text, 0, Anchor::None).unwrap(), Value::Match(_)));
    }

    #[test]
    fn test_escape_matches_python() {
        assert_eq!(escape_text("a.b*c"), r"a\.b\*c");
        assert_eq!(escape_text("x_y"), "x_y");
    }
}
