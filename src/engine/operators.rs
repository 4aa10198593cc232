//! Operators, subscripts and slices

use std::cmp::Ordering;

use chrono::Duration;

use crate::config::Limits;
use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::parser::ast::{BinOp, CmpOp, UnaryOp};
use crate::value::format::{delta_parts, percent_format, repr};
use crate::value::{Dict, DictFlavor, Range, Set, Temporal, Value};

/// Evaluated `lower:upper:step`
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceBounds {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
    pub step: Option<i64>,
}

fn unsupported(op: &str, left: &Value, right: &Value) -> SafepyError {
    SafepyError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn int_overflow(op: BinOp) -> SafepyError {
    SafepyError::overflow(format!(
        "integer result of '{}' does not fit in 64 bits",
        op.symbol()
    ))
}

fn memory_error(limits: &Limits) -> SafepyError {
    SafepyError::memory(limits.max_collection_len)
}

fn check_len(len: usize, limits: &Limits) -> Result<()> {
    if len > limits.max_collection_len {
        return Err(memory_error(limits));
    }
    Ok(())
}

/// `left op right`
pub fn binary(op: BinOp, left: &Value, right: &Value, limits: &Limits) -> Result<Value> {
    match (left, right) {
        (Value::Float(_), r) | (r, Value::Float(_)) if r.is_number() && left.is_number() => {
            float_binary(op, left.as_float()?, right.as_float()?)
        }
        (l, r) if l.is_number() && r.is_number() => {
            if let (Value::Bool(a), Value::Bool(b)) = (l, r) {
                match op {
                    BinOp::BitAnd => return Ok(Value::Bool(*a && *b)),
                    BinOp::BitOr => return Ok(Value::Bool(*a || *b)),
                    BinOp::BitXor => return Ok(Value::Bool(a != b)),
                    _ => {}
                }
            }
            int_binary(op, l.as_int()?, r.as_int()?)
        }
        (Value::Str(a), Value::Str(b)) if op == BinOp::Add => {
            check_len(a.len().saturating_add(b.len()), limits)?;
            let mut out = String::with_capacity(a.len() + b.len());
            out.push_str(a);
            out.push_str(b);
            Ok(Value::str(out))
        }
        (Value::Str(template), args) if op == BinOp::Mod => {
            Ok(Value::str(percent_format(template, args, limits.max_collection_len)?))
        }
        (Value::Str(_) | Value::List(_) | Value::Tuple(_), count)
        | (count, Value::Str(_) | Value::List(_) | Value::Tuple(_))
            if op == BinOp::Mul && matches!(count, Value::Int(_) | Value::Bool(_)) =>
        {
            let sequence = if matches!(left, Value::Int(_) | Value::Bool(_)) {
                right
            } else {
                left
            };
            repeat(sequence, count.as_int()?, limits)
        }
        (Value::List(a), Value::List(b)) if op == BinOp::Add => {
            check_len(a.borrow().len().saturating_add(b.borrow().len()), limits)?;
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (Value::Tuple(a), Value::Tuple(b)) if op == BinOp::Add => {
            check_len(a.len().saturating_add(b.len()), limits)?;
            let mut items = a.to_vec();
            items.extend(b.iter().cloned());
            Ok(Value::tuple(items))
        }
        (Value::Set(a), Value::Set(b)) => {
            let set = set_binary(op, &a.borrow(), &b.borrow())
                .ok_or_else(|| unsupported(op.symbol(), left, right))??;
            Ok(Value::set(set))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            let dict = dict_binary(op, &a.borrow(), &b.borrow())
                .ok_or_else(|| unsupported(op.symbol(), left, right))??;
            Ok(Value::dict(dict))
        }
        (Value::Temporal(_), _) | (_, Value::Temporal(_)) => temporal_binary(op, left, right)
            .ok_or_else(|| unsupported(op.symbol(), left, right))?,
        _ => Err(unsupported(op.symbol(), left, right)),
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<Value> {
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(|| int_overflow(op))?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(|| int_overflow(op))?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(|| int_overflow(op))?,
        BinOp::Div => {
            if b == 0 {
                return Err(SafepyError::zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(SafepyError::zero_division(
                    "integer division or modulo by zero",
                ));
            }
            let q = a.checked_div(b).ok_or_else(|| int_overflow(op))?;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(SafepyError::zero_division("integer modulo by zero"));
            }
            let r = a.checked_rem(b).unwrap_or(0);
            if r != 0 && ((r < 0) != (b < 0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => return int_pow(a, b),
        BinOp::LShift => {
            if b < 0 {
                return Err(SafepyError::value_error("negative shift count"));
            }
            if a == 0 {
                0
            } else if b >= 63 {
                return Err(int_overflow(op));
            } else {
                let shifted = a << b;
                if shifted >> b != a {
                    return Err(int_overflow(op));
                }
                shifted
            }
        }
        BinOp::RShift => {
            if b < 0 {
                return Err(SafepyError::value_error("negative shift count"));
            }
            if b >= 64 {
                if a < 0 {
                    -1
                } else {
                    0
                }
            } else {
                a >> b
            }
        }
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::BitAnd => a & b,
    };
    Ok(Value::Int(value))
}

fn int_pow(base: i64, exp: i64) -> Result<Value> {
    if exp < 0 {
        if base == 0 {
            return Err(SafepyError::zero_division(
                "0.0 cannot be raised to a negative power",
            ));
        }
        return Ok(Value::Float((base as f64).powf(exp as f64)));
    }
    match base {
        0 | 1 => return Ok(Value::Int(if exp == 0 { 1 } else { base })),
        -1 => return Ok(Value::Int(if exp % 2 == 0 { 1 } else { -1 })),
        _ => {}
    }
    u32::try_from(exp)
        .ok()
        .and_then(|exp| base.checked_pow(exp))
        .map(Value::Int)
        .ok_or_else(|| int_overflow(BinOp::Pow))
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Result<Value> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(SafepyError::zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(SafepyError::zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(SafepyError::zero_division("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(SafepyError::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            if a < 0.0 && b.fract() != 0.0 && b.is_finite() {
                return Err(SafepyError::Arithmetic(
                    "ValueError: negative number cannot be raised to a fractional power"
                        .to_string(),
                ));
            }
            let result = a.powf(b);
            if result.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(SafepyError::overflow("numerical result out of range"));
            }
            result
        }
        BinOp::LShift | BinOp::RShift | BinOp::BitOr | BinOp::BitXor | BinOp::BitAnd => {
            return Err(SafepyError::type_error(format!(
                "unsupported operand type(s) for {}: 'float'",
                op.symbol()
            )))
        }
    };
    Ok(Value::Float(value))
}

fn repeat(sequence: &Value, count: i64, limits: &Limits) -> Result<Value> {
    let count = count.max(0) as usize;
    let len = sequence.len()?;
    if len.saturating_mul(count) > limits.max_collection_len {
        return Err(memory_error(limits));
    }
    Ok(match sequence {
        Value::Str(s) => Value::str(s.repeat(count)),
        Value::List(items) => Value::list(repeat_items(&items.borrow(), count)),
        Value::Tuple(items) => Value::tuple(repeat_items(items, count)),
        _ => return Err(SafepyError::internal("repeat on a non-sequence")),
    })
}

fn repeat_items(items: &[Value], count: usize) -> Vec<Value> {
    items
        .iter()
        .cloned()
        .cycle()
        .take(items.len() * count)
        .collect()
}

fn set_binary(op: BinOp, a: &Set, b: &Set) -> Option<Result<Set>> {
    let result = match op {
        BinOp::BitOr => Set::from_values(a.iter().chain(b.iter()).cloned()),
        BinOp::BitAnd => Set::from_values(
            a.iter()
                .filter(|v| b.contains(v).unwrap_or(false))
                .cloned(),
        ),
        BinOp::Sub => Set::from_values(
            a.iter()
                .filter(|v| !b.contains(v).unwrap_or(false))
                .cloned(),
        ),
        BinOp::BitXor => Set::from_values(
            a.iter()
                .filter(|v| !b.contains(v).unwrap_or(false))
                .chain(b.iter().filter(|v| !a.contains(v).unwrap_or(false)))
                .cloned(),
        ),
        _ => return None,
    };
    Some(result)
}

fn dict_binary(op: BinOp, a: &Dict, b: &Dict) -> Option<Result<Dict>> {
    let counters = matches!(a.flavor, DictFlavor::Counter);
    let result = match op {
        BinOp::BitOr => {
            let mut merged = a.clone();
            b.iter()
                .try_for_each(|(k, v)| merged.insert(k.clone(), v.clone()).map(|_| ()))
                .map(|_| merged)
        }
        BinOp::Add | BinOp::Sub if counters => counter_combine(op, a, b),
        _ => return None,
    };
    Some(result)
}

/// `Counter + Counter` and `Counter - Counter`, keeping positive counts
fn counter_combine(op: BinOp, a: &Dict, b: &Dict) -> Result<Dict> {
    let mut out = Dict::with_flavor(DictFlavor::Counter);
    let mut keys = a.keys();
    for key in b.keys() {
        if !a.contains(&key)? {
            keys.push(key);
        }
    }
    for key in keys {
        let x = a.get(&key)?.map(|v| v.as_int()).transpose()?.unwrap_or(0);
        let y = b.get(&key)?.map(|v| v.as_int()).transpose()?.unwrap_or(0);
        let count = match op {
            BinOp::Add => x.checked_add(y),
            _ => x.checked_sub(y),
        }
        .ok_or_else(|| int_overflow(op))?;
        if count > 0 {
            out.insert(key, Value::Int(count))?;
        }
    }
    Ok(out)
}

fn delta_micros(delta: &Duration) -> Result<i64> {
    delta
        .num_microseconds()
        .ok_or_else(|| SafepyError::overflow("timedelta out of range"))
}

fn temporal_overflow() -> SafepyError {
    SafepyError::overflow("date value out of range")
}

fn temporal_binary(op: BinOp, left: &Value, right: &Value) -> Option<Result<Value>> {
    use Temporal::*;
    let (Value::Temporal(l), r) = (left, right) else {
        // number * timedelta
        if let (n, Value::Temporal(Delta(d))) = (left, right) {
            if op == BinOp::Mul && n.is_number() {
                return Some(scale_delta(d, n));
            }
        }
        return None;
    };
    let result = match (l, op, r) {
        (DateTime(dt), BinOp::Add, Value::Temporal(Delta(d))) => dt
            .checked_add_signed(*d)
            .map(|t| Value::Temporal(DateTime(t)))
            .ok_or_else(temporal_overflow),
        (DateTime(dt), BinOp::Sub, Value::Temporal(Delta(d))) => dt
            .checked_sub_signed(*d)
            .map(|t| Value::Temporal(DateTime(t)))
            .ok_or_else(temporal_overflow),
        (DateTime(a), BinOp::Sub, Value::Temporal(DateTime(b))) => {
            Ok(Value::Temporal(Delta(a.signed_duration_since(*b))))
        }
        (Date(date), BinOp::Add, Value::Temporal(Delta(d))) => date
            .checked_add_signed(Duration::days(delta_parts(d).0))
            .map(|t| Value::Temporal(Date(t)))
            .ok_or_else(temporal_overflow),
        (Date(date), BinOp::Sub, Value::Temporal(Delta(d))) => date
            .checked_sub_signed(Duration::days(delta_parts(d).0))
            .map(|t| Value::Temporal(Date(t)))
            .ok_or_else(temporal_overflow),
        (Date(a), BinOp::Sub, Value::Temporal(Date(b))) => {
            Ok(Value::Temporal(Delta(a.signed_duration_since(*b))))
        }
        (Delta(a), BinOp::Add, Value::Temporal(Delta(b))) => a
            .checked_add(b)
            .map(|d| Value::Temporal(Delta(d)))
            .ok_or_else(temporal_overflow),
        (Delta(a), BinOp::Sub, Value::Temporal(Delta(b))) => a
            .checked_sub(b)
            .map(|d| Value::Temporal(Delta(d)))
            .ok_or_else(temporal_overflow),
        (Delta(d), BinOp::Add, Value::Temporal(DateTime(dt))) => dt
            .checked_add_signed(*d)
            .map(|t| Value::Temporal(DateTime(t)))
            .ok_or_else(temporal_overflow),
        (Delta(d), BinOp::Add, Value::Temporal(Date(date))) => date
            .checked_add_signed(Duration::days(delta_parts(d).0))
            .map(|t| Value::Temporal(Date(t)))
            .ok_or_else(temporal_overflow),
        (Delta(d), BinOp::Mul, n) if n.is_number() => scale_delta(d, n),
        (Delta(a), BinOp::Div, Value::Temporal(Delta(b))) => (|| {
            let divisor = delta_micros(b)?;
            if divisor == 0 {
                return Err(SafepyError::zero_division("division by zero"));
            }
            Ok(Value::Float(delta_micros(a)? as f64 / divisor as f64))
        })(),
        (Delta(a), BinOp::FloorDiv, Value::Temporal(Delta(b))) => (|| {
            let divisor = delta_micros(b)?;
            if divisor == 0 {
                return Err(SafepyError::zero_division(
                    "integer division or modulo by zero",
                ));
            }
            int_binary(BinOp::FloorDiv, delta_micros(a)?, divisor)
        })(),
        (Delta(d), BinOp::Div | BinOp::FloorDiv, n) if n.is_number() => (|| {
            let divisor = n.as_float()?;
            if divisor == 0.0 {
                return Err(SafepyError::zero_division("division by zero"));
            }
            let micros = delta_micros(d)? as f64 / divisor;
            let micros = if op == BinOp::FloorDiv {
                micros.floor()
            } else {
                micros.round_ties_even()
            };
            Ok(Value::Temporal(Delta(Duration::microseconds(micros as i64))))
        })(),
        _ => return None,
    };
    Some(result)
}

fn scale_delta(delta: &Duration, factor: &Value) -> Result<Value> {
    let micros = delta_micros(delta)?;
    let scaled = match factor {
        Value::Float(f) => {
            let product = (micros as f64 * f).round_ties_even();
            if !product.is_finite() || product.abs() >= i64::MAX as f64 {
                return Err(temporal_overflow());
            }
            product as i64
        }
        n => micros
            .checked_mul(n.as_int()?)
            .ok_or_else(temporal_overflow)?,
    };
    Ok(Value::Temporal(Temporal::Delta(Duration::microseconds(
        scaled,
    ))))
}

/// `target op= value`; mutable containers are updated in place
pub fn augmented(op: BinOp, target: &Value, value: &Value, limits: &Limits) -> Result<Value> {
    match (target, op) {
        (Value::List(items), BinOp::Add) => {
            let extra: Vec<Value> = value.iter()?.collect();
            check_len(items.borrow().len().saturating_add(extra.len()), limits)?;
            items.borrow_mut().extend(extra);
            Ok(target.clone())
        }
        (Value::List(items), BinOp::Mul) => {
            let count = value.as_int()?.max(0) as usize;
            let len = items.borrow().len();
            if len.saturating_mul(count) > limits.max_collection_len {
                return Err(memory_error(limits));
            }
            let repeated = repeat_items(&items.borrow(), count);
            *items.borrow_mut() = repeated;
            Ok(target.clone())
        }
        (Value::Set(set), BinOp::BitOr | BinOp::BitAnd | BinOp::Sub | BinOp::BitXor) => {
            let Value::Set(other) = value else {
                return Err(unsupported(&format!("{}=", op.symbol()), target, value));
            };
            let updated = set_binary(op, &set.borrow(), &other.borrow())
                .ok_or_else(|| unsupported(op.symbol(), target, value))??;
            *set.borrow_mut() = updated;
            Ok(target.clone())
        }
        (Value::Dict(dict), BinOp::BitOr) => {
            let pairs = match value {
                Value::Dict(other) => other.borrow().items(),
                _ => return Err(unsupported("|=", target, value)),
            };
            let mut dict = dict.borrow_mut();
            for (key, val) in pairs {
                dict.insert(key, val)?;
            }
            Ok(target.clone())
        }
        _ => binary(op, target, value, limits),
    }
}

/// `-x`, `+x`, `~x`
pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value> {
    let bad = || {
        SafepyError::type_error(format!(
            "bad operand type for unary {}: '{}'",
            match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                UnaryOp::Invert => "~",
                UnaryOp::Not => "not",
            },
            operand.type_name()
        ))
    };
    match (op, operand) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, v @ (Value::Int(_) | Value::Bool(_))) => v
            .as_int()?
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| SafepyError::overflow("integer negation does not fit in 64 bits")),
        (UnaryOp::Neg, Value::Temporal(Temporal::Delta(d))) => {
            Ok(Value::Temporal(Temporal::Delta(-*d)))
        }
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Pos, v @ (Value::Int(_) | Value::Bool(_))) => Ok(Value::Int(v.as_int()?)),
        (UnaryOp::Pos, v @ Value::Temporal(Temporal::Delta(_))) => Ok(v.clone()),
        (UnaryOp::Invert, v @ (Value::Int(_) | Value::Bool(_))) => Ok(Value::Int(!v.as_int()?)),
        _ => Err(bad()),
    }
}

/// One link of a comparison chain
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    match op {
        CmpOp::Eq => Ok(left.equals(right)),
        CmpOp::NotEq => Ok(!left.equals(right)),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => Ok(!contains(right, left)?),
        CmpOp::Is => Ok(left.is(right)),
        CmpOp::IsNot => Ok(!left.is(right)),
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
            if let (Value::Set(a), Value::Set(b)) = (left, right) {
                let (a, b) = (a.borrow(), b.borrow());
                return Ok(match op {
                    CmpOp::Lt => a.len() < b.len() && a.is_subset(&b),
                    CmpOp::LtE => a.is_subset(&b),
                    CmpOp::Gt => a.len() > b.len() && b.is_subset(&a),
                    _ => b.is_subset(&a),
                });
            }
            let ordering = left.compare(right, op.symbol())?;
            Ok(match ordering {
                None => false,
                Some(ordering) => match op {
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::LtE => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
            })
        }
    }
}

/// `item in container`
pub fn contains(container: &Value, item: &Value) -> Result<bool> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(&**needle)),
            other => Err(SafepyError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.equals(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.equals(item))),
        Value::Dict(dict) => dict.borrow().contains(item),
        Value::Set(set) => set.borrow().contains(item),
        Value::Range(range) => Ok(match item {
            Value::Int(_) | Value::Bool(_) => range.contains(item.as_int()?),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => range.contains(*f as i64),
            _ => false,
        }),
        Value::Iterator(_) => {
            for value in container.iter()? {
                if value.equals(item) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(SafepyError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

// ============================================================================
// Subscripts
// ============================================================================

/// Resolve a possibly negative index against `len`
pub fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

fn sequence_index(container: &Value, index: &Value) -> Result<i64> {
    match index {
        Value::Int(_) | Value::Bool(_) => index.as_int(),
        other => Err(SafepyError::type_error(format!(
            "{} indices must be integers or slices, not {}",
            container.type_name(),
            other.type_name()
        ))),
    }
}

/// `obj[index]`
pub fn get_item(interp: &mut Interpreter<'_>, obj: &Value, index: &Value) -> EvalResult<Value> {
    let out_of_range =
        || SafepyError::index_error(format!("{} index out of range", obj.type_name()));
    let value = match obj {
        Value::List(items) => {
            let items = items.borrow();
            let i = normalize_index(sequence_index(obj, index)?, items.len())
                .ok_or_else(out_of_range)?;
            items[i].clone()
        }
        Value::Tuple(items) => {
            let i = normalize_index(sequence_index(obj, index)?, items.len())
                .ok_or_else(out_of_range)?;
            items[i].clone()
        }
        Value::Str(s) => {
            let i = sequence_index(obj, index)?;
            let len = s.chars().count();
            let i = normalize_index(i, len).ok_or_else(|| {
                SafepyError::index_error("string index out of range")
            })?;
            s.chars()
                .nth(i)
                .map(|c| Value::str(c.to_string()))
                .ok_or_else(out_of_range)?
        }
        Value::Range(range) => {
            let len = range.len();
            let i = sequence_index(obj, index)?;
            let i = if i < 0 { i as i128 + len as i128 } else { i as i128 };
            if i < 0 || i >= len as i128 {
                return Err(out_of_range().into());
            }
            Value::Int(range.get(i as u64))
        }
        Value::Dict(dict) => {
            let (found, flavor) = {
                let dict = dict.borrow();
                (dict.get(index)?, dict.flavor.clone())
            };
            match (found, flavor) {
                (Some(value), _) => value,
                (None, DictFlavor::Counter) => Value::Int(0),
                (None, DictFlavor::DefaultDict(factory)) if !factory.is_none() => {
                    let value = interp.call_with(&factory, Vec::new())?;
                    dict.borrow_mut().insert(index.clone(), value.clone())?;
                    value
                }
                (None, _) => return Err(SafepyError::key_error(repr(index)).into()),
            }
        }
        Value::Match(m) => {
            let i = m.group_index(index)?;
            m.group(i).unwrap_or(Value::None)
        }
        Value::Builtin(b) => {
            // `list[int]` style generic aliases in annotations
            Value::Builtin(*b)
        }
        other => {
            return Err(SafepyError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))
            .into())
        }
    };
    Ok(value)
}

/// Python `slice.indices(len)`: clamped `(start, stop, step)`
pub fn slice_indices(bounds: SliceBounds, len: usize) -> Result<(i64, i64, i64)> {
    let len = len as i64;
    let step = bounds.step.unwrap_or(1);
    if step == 0 {
        return Err(SafepyError::value_error("slice step cannot be zero"));
    }
    let clamp = |value: Option<i64>, default: i64| -> i64 {
        match value {
            None => default,
            Some(v) if v < 0 => {
                let v = v.saturating_add(len);
                if v < 0 {
                    if step < 0 {
                        -1
                    } else {
                        0
                    }
                } else {
                    v
                }
            }
            Some(v) => {
                if v >= len {
                    if step < 0 {
                        len - 1
                    } else {
                        len
                    }
                } else {
                    v
                }
            }
        }
    };
    let (start, stop) = if step > 0 {
        (clamp(bounds.lower, 0), clamp(bounds.upper, len))
    } else {
        (clamp(bounds.lower, len - 1), clamp(bounds.upper, -1))
    };
    Ok((start, stop, step))
}

/// Positions selected by a slice
fn slice_positions(bounds: SliceBounds, len: usize) -> Result<Vec<usize>> {
    let (start, stop, step) = slice_indices(bounds, len)?;
    let mut positions = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        positions.push(i as usize);
        i += step;
    }
    Ok(positions)
}

/// `obj[lower:upper:step]`
pub fn get_slice(obj: &Value, bounds: SliceBounds) -> Result<Value> {
    match obj {
        Value::List(items) => {
            let items = items.borrow();
            let picked = slice_positions(bounds, items.len())?
                .into_iter()
                .map(|i| items[i].clone())
                .collect();
            Ok(Value::list(picked))
        }
        Value::Tuple(items) => {
            let picked = slice_positions(bounds, items.len())?
                .into_iter()
                .map(|i| items[i].clone())
                .collect();
            Ok(Value::tuple(picked))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked: String = slice_positions(bounds, chars.len())?
                .into_iter()
                .map(|i| chars[i])
                .collect();
            Ok(Value::str(picked))
        }
        Value::Range(range) => {
            let len = usize::try_from(range.len()).unwrap_or(usize::MAX);
            let (start, stop, step) = slice_indices(bounds, len)?;
            let at = |i: i64| range.start as i128 + i as i128 * range.step as i128;
            let clamp = |v: i128| v.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
            Ok(Value::Range(Range {
                start: clamp(at(start)),
                stop: clamp(at(stop)),
                step: clamp(range.step as i128 * step as i128),
            }))
        }
        other => Err(SafepyError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `obj[index] = value`
pub fn set_item(obj: &Value, index: Value, value: Value) -> Result<()> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(sequence_index(obj, &index)?, items.len())
                .ok_or_else(|| SafepyError::index_error("list assignment index out of range"))?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(dict) => {
            dict.borrow_mut().insert(index, value)?;
            Ok(())
        }
        other => Err(SafepyError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// `obj[lower:upper:step] = items`
pub fn set_slice(obj: &Value, bounds: SliceBounds, values: Vec<Value>) -> Result<()> {
    let Value::List(items) = obj else {
        return Err(SafepyError::type_error(format!(
            "'{}' object does not support slice assignment",
            obj.type_name()
        )));
    };
    let mut items = items.borrow_mut();
    if bounds.step.unwrap_or(1) == 1 {
        let (start, stop, _) = slice_indices(bounds, items.len())?;
        let start = start as usize;
        let stop = (stop as usize).max(start);
        items.splice(start..stop, values);
        return Ok(());
    }
    let positions = slice_positions(bounds, items.len())?;
    if positions.len() != values.len() {
        return Err(SafepyError::value_error(format!(
            "attempt to assign sequence of size {} to extended slice of size {}",
            values.len(),
            positions.len()
        )));
    }
    for (i, value) in positions.into_iter().zip(values) {
        items[i] = value;
    }
    Ok(())
}

/// `del obj[index]`
pub fn del_item(obj: &Value, index: &Value) -> Result<()> {
    match obj {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(sequence_index(obj, index)?, items.len())
                .ok_or_else(|| SafepyError::index_error("list assignment index out of range"))?;
            items.remove(i);
            Ok(())
        }
        Value::Dict(dict) => match dict.borrow_mut().remove(index)? {
            Some(_) => Ok(()),
            None => Err(SafepyError::key_error(repr(index))),
        },
        other => Err(SafepyError::type_error(format!(
            "'{}' object doesn't support item deletion",
            other.type_name()
        ))),
    }
}

/// `del obj[lower:upper:step]`
pub fn del_slice(obj: &Value, bounds: SliceBounds) -> Result<()> {
    let Value::List(items) = obj else {
        return Err(SafepyError::type_error(format!(
            "'{}' object doesn't support item deletion",
            obj.type_name()
        )));
    };
    let mut items = items.borrow_mut();
    let mut doomed = vec![false; items.len()];
    for i in slice_positions(bounds, items.len())? {
        doomed[i] = true;
    }
    let mut position = 0;
    items.retain(|_| {
        let keep = !doomed[position];
        position += 1;
        keep
    });
    Ok(())
}

/// Stable bottom-up merge sort with a fallible comparator. `less(a, b)`
/// reports whether `a` must come before `b`.
pub fn merge_sort<T: Copy>(
    items: &mut Vec<T>,
    less: &mut dyn FnMut(T, T) -> Result<bool>,
) -> Result<()> {
    let len = items.len();
    if len < 2 {
        return Ok(());
    }
    let mut buffer = items.clone();
    let mut width = 1;
    while width < len {
        let mut start = 0;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            let (mut i, mut j, mut k) = (start, mid, start);
            while i < mid && j < end {
                // right run wins only when strictly smaller
                if less(items[j], items[i])? {
                    buffer[k] = items[j];
                    j += 1;
                } else {
                    buffer[k] = items[i];
                    i += 1;
                }
                k += 1;
            }
            buffer[k..k + (mid - i)].copy_from_slice(&items[i..mid]);
            k += mid - i;
            buffer[k..k + (end - j)].copy_from_slice(&items[j..end]);
            start += 2 * width;
        }
        std::mem::swap(items, &mut buffer);
        width *= 2;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::default()
    }

    fn int(v: &Value) -> i64 {
        v.as_int().unwrap()
    }

    #[test]
    fn test_floor_division_and_modulo_follow_floor_semantics() {
        let l = limits();
        assert_eq!(int(&binary(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2), &l).unwrap()), -4);
        assert_eq!(int(&binary(BinOp::Mod, &Value::Int(-7), &Value::Int(2), &l).unwrap()), 1);
        assert_eq!(int(&binary(BinOp::Mod, &Value::Int(7), &Value::Int(-2), &l).unwrap()), -1);
        let f = binary(BinOp::Mod, &Value::Float(-1.5), &Value::Int(1), &l).unwrap();
        assert_eq!(f.as_float().unwrap(), 0.5);
    }

    #[test]
    fn test_division_by_zero_is_arithmetic() {
        let err = binary(BinOp::Div, &Value::Int(1), &Value::Int(0), &limits()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Arithmetic);
        assert!(err.message().contains("ZeroDivisionError"));
    }

    #[test]
    fn test_integer_overflow_is_arithmetic() {
        let err = binary(BinOp::Mul, &Value::Int(i64::MAX), &Value::Int(2), &limits()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Arithmetic);
        let err = binary(BinOp::Pow, &Value::Int(2), &Value::Int(64), &limits()).unwrap_err();
        assert!(err.message().contains("OverflowError"));
    }

    #[test]
    fn test_pow_rules() {
        let l = limits();
        assert_eq!(binary(BinOp::Pow, &Value::Int(2), &Value::Int(-1), &l).unwrap().as_float().unwrap(), 0.5);
        assert!(binary(BinOp::Pow, &Value::Int(0), &Value::Int(-1), &l).is_err());
        assert_eq!(int(&binary(BinOp::Pow, &Value::Int(-1), &Value::Int(1_000_001), &l).unwrap()), -1);
        assert!(binary(BinOp::Pow, &Value::Float(10.0), &Value::Float(400.0), &l).is_err());
    }

    #[test]
    fn test_repetition_respects_collection_limit() {
        let l = Limits {
            max_collection_len: 10,
            ..Limits::default()
        };
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(binary(BinOp::Mul, &list, &Value::Int(5), &l).unwrap().len().unwrap(), 10);
        let err = binary(BinOp::Mul, &Value::Int(6), &list, &l).unwrap_err();
        assert!(err.message().starts_with("MemoryError"));

        let tuple = Value::tuple(vec![Value::str("a"), Value::list(vec![])]);
        let repeated = binary(BinOp::Mul, &tuple, &Value::Int(2), &l).unwrap();
        assert_eq!(format!("{:?}", repeated), "('a', [], 'a', [])");
    }

    #[test]
    fn test_concatenation_respects_collection_limit() {
        let l = Limits {
            max_collection_len: 10,
            ..Limits::default()
        };
        let word = Value::str("abcdef");
        let err = binary(BinOp::Add, &word, &word, &l).unwrap_err();
        assert!(err.message().starts_with("MemoryError"));

        let list = Value::list(vec![Value::Int(0); 6]);
        assert!(binary(BinOp::Add, &list, &list, &l).is_err());
        assert!(augmented(BinOp::Add, &list, &list, &l).is_err());
        assert_eq!(list.len().unwrap(), 6);

        let pair = Value::tuple(vec![Value::Int(1); 5]);
        assert_eq!(binary(BinOp::Add, &pair, &pair, &l).unwrap().len().unwrap(), 10);
    }

    #[test]
    fn test_mixed_types_are_rejected() {
        let err = binary(BinOp::Add, &Value::Int(1), &Value::str("a"), &limits()).unwrap_err();
        assert!(err
            .message()
            .contains("unsupported operand type(s) for +: 'int' and 'str'"));
    }

    #[test]
    fn test_set_comparisons_are_subset_tests() {
        let a = Value::set(Set::from_values(vec![Value::Int(1)]).unwrap());
        let b = Value::set(Set::from_values(vec![Value::Int(1), Value::Int(2)]).unwrap());
        assert!(compare(CmpOp::Lt, &a, &b).unwrap());
        assert!(!compare(CmpOp::Gt, &a, &b).unwrap());
        assert!(compare(CmpOp::LtE, &a, &a).unwrap());
    }

    #[test]
    fn test_nan_comparisons_are_false() {
        let nan = Value::Float(f64::NAN);
        assert!(!compare(CmpOp::Lt, &nan, &Value::Int(1)).unwrap());
        assert!(!compare(CmpOp::GtE, &nan, &Value::Int(1)).unwrap());
        assert!(!compare(CmpOp::Eq, &nan, &nan).unwrap());
    }

    #[test]
    fn test_slices_clamp_like_python() {
        let list = Value::list((0..5).map(Value::Int).collect());
        let picked = get_slice(
            &list,
            SliceBounds {
                lower: Some(-2),
                upper: Some(100),
                step: None,
            },
        )
        .unwrap();
        assert_eq!(picked.to_string(), "[3, 4]");

        let reversed = get_slice(
            &list,
            SliceBounds {
                step: Some(-2),
                ..SliceBounds::default()
            },
        )
        .unwrap();
        assert_eq!(reversed.to_string(), "[4, 2, 0]");

        let range = Value::Range(Range {
            start: 0,
            stop: 10,
            step: 1,
        });
        let sliced = get_slice(
            &range,
            SliceBounds {
                lower: Some(2),
                upper: Some(8),
                step: Some(3),
            },
        )
        .unwrap();
        assert_eq!(sliced.to_string(), "range(2, 8, 3)");
    }

    #[test]
    fn test_slice_assignment_and_deletion() {
        let list = Value::list((0..5).map(Value::Int).collect());
        set_slice(
            &list,
            SliceBounds {
                lower: Some(1),
                upper: Some(3),
                step: None,
            },
            vec![Value::str("x")],
        )
        .unwrap();
        assert_eq!(list.to_string(), "[0, 'x', 3, 4]");

        del_slice(
            &list,
            SliceBounds {
                step: Some(2),
                ..SliceBounds::default()
            },
        )
        .unwrap();
        assert_eq!(list.to_string(), "['x', 4]");
    }

    #[test]
    fn test_in_place_list_extend_is_visible_through_alias() {
        let list = Value::list(vec![Value::Int(1)]);
        let alias = list.clone();
        augmented(
            BinOp::Add,
            &list,
            &Value::tuple(vec![Value::Int(2)]),
            &limits(),
        )
        .unwrap();
        assert_eq!(alias.to_string(), "[1, 2]");
    }

    #[test]
    fn test_merge_sort_is_stable() {
        let keys = [3, 1, 3, 2, 1];
        let mut order: Vec<usize> = (0..keys.len()).collect();
        merge_sort(&mut order, &mut |a, b| Ok(keys[a] < keys[b])).unwrap();
        assert_eq!(order, vec![1, 4, 3, 0, 2]);
    }

    #[test]
    fn test_containment() {
        assert!(contains(&Value::str("hello"), &Value::str("ell")).unwrap());
        assert!(contains(&Value::str("hello"), &Value::Int(1)).is_err());
        let range = Value::Range(Range {
            start: 0,
            stop: 10,
            step: 2,
        });
        assert!(contains(&range, &Value::Float(4.0)).unwrap());
        assert!(!contains(&range, &Value::Int(5)).unwrap());
    }
}
