//! `math` module; the common functions are also plain builtins

use crate::engine::builtins::float_to_int;
use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::value::{Arguments, Module, Value};

pub fn module() -> Module {
    Module::new("math")
        .with("pi", Value::Float(std::f64::consts::PI))
        .with("e", Value::Float(std::f64::consts::E))
        .with("tau", Value::Float(std::f64::consts::TAU))
        .with("inf", Value::Float(f64::INFINITY))
        .with("nan", Value::Float(f64::NAN))
        .function("sqrt", sqrt)
        .function("ceil", ceil)
        .function("floor", floor)
        .function("trunc", trunc)
        .function("log", log)
        .function("log2", log2)
        .function("log10", log10)
        .function("exp", exp)
        .function("pow", pow)
        .function("sin", sin)
        .function("cos", cos)
        .function("tan", tan)
        .function("asin", asin)
        .function("acos", acos)
        .function("atan", atan)
        .function("atan2", atan2)
        .function("sinh", sinh)
        .function("cosh", cosh)
        .function("tanh", tanh)
        .function("hypot", hypot)
        .function("degrees", degrees)
        .function("radians", radians)
        .function("fabs", fabs)
        .function("copysign", copysign)
        .function("fmod", fmod)
        .function("isclose", isclose)
        .function("isfinite", isfinite)
        .function("isinf", isinf)
        .function("isnan", isnan)
        .function("factorial", factorial)
        .function("gcd", gcd)
        .function("lcm", lcm)
        .function("comb", comb)
        .function("perm", perm)
        .function("prod", prod)
        .function("fsum", fsum)
        .function("isqrt", isqrt)
}

/// A finite result, or Python's "math range error"
fn checked(result: f64, inputs_finite: bool) -> Result<f64> {
    if result.is_infinite() && inputs_finite {
        return Err(SafepyError::overflow("math range error"));
    }
    Ok(result)
}

fn unary(args: Arguments, name: &str, f: impl Fn(f64) -> Result<f64>) -> EvalResult<Value> {
    let [x] = args.exact::<1>(name)?;
    Ok(Value::Float(f(number(&x)?)?))
}

fn number(value: &Value) -> Result<f64> {
    if !value.is_number() {
        return Err(SafepyError::type_error(format!(
            "must be real number, not {}",
            value.type_name()
        )));
    }
    value.as_float()
}

fn integer(value: &Value, name: &str) -> Result<i64> {
    match value {
        Value::Int(_) | Value::Bool(_) => value.as_int(),
        other => Err(SafepyError::type_error(format!(
            "{}() only accepts integral values, not {}",
            name,
            other.type_name()
        ))),
    }
}

pub fn sqrt(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "sqrt", |x| {
        if x < 0.0 {
            return Err(SafepyError::math_domain());
        }
        Ok(x.sqrt())
    })
}

fn rounding(args: Arguments, name: &str, f: fn(f64) -> f64) -> EvalResult<Value> {
    let [x] = args.exact::<1>(name)?;
    match x {
        Value::Int(_) | Value::Bool(_) => Ok(Value::Int(x.as_int()?)),
        other => Ok(Value::Int(float_to_int(f(number(&other)?))?)),
    }
}

pub fn ceil(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    rounding(args, "ceil", f64::ceil)
}

pub fn floor(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    rounding(args, "floor", f64::floor)
}

fn trunc(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    rounding(args, "trunc", f64::trunc)
}

fn ln(x: f64) -> Result<f64> {
    if x <= 0.0 {
        return Err(SafepyError::math_domain());
    }
    Ok(x.ln())
}

pub fn log(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = args.between("log", 1, 2)?;
    let x = ln(number(&values[0])?)?;
    match values.get(1) {
        None => Ok(Value::Float(x)),
        Some(base) => {
            let base = ln(number(base)?)?;
            if base == 0.0 {
                return Err(SafepyError::zero_division("float division by zero").into());
            }
            Ok(Value::Float(x / base))
        }
    }
}

fn log2(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "log2", |x| Ok(ln(x)? / std::f64::consts::LN_2))
}

fn log10(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "log10", |x| {
        ln(x)?;
        Ok(x.log10())
    })
}

pub fn exp(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "exp", |x| checked(x.exp(), x.is_finite()))
}

fn pow(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [x, y] = args.exact::<2>("pow")?;
    let (x, y) = (number(&x)?, number(&y)?);
    if x == 0.0 && y < 0.0 {
        return Err(SafepyError::math_domain().into());
    }
    if x < 0.0 && y.fract() != 0.0 && y.is_finite() {
        return Err(SafepyError::math_domain().into());
    }
    Ok(Value::Float(checked(x.powf(y), x.is_finite() && y.is_finite())?))
}

fn trig(args: Arguments, name: &str, f: fn(f64) -> f64) -> EvalResult<Value> {
    unary(args, name, |x| {
        if x.is_infinite() {
            return Err(SafepyError::math_domain());
        }
        Ok(f(x))
    })
}

pub fn sin(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    trig(args, "sin", f64::sin)
}

pub fn cos(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    trig(args, "cos", f64::cos)
}

pub fn tan(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    trig(args, "tan", f64::tan)
}

fn inverse_trig(args: Arguments, name: &str, f: fn(f64) -> f64) -> EvalResult<Value> {
    unary(args, name, |x| {
        if !(-1.0..=1.0).contains(&x) {
            return Err(SafepyError::math_domain());
        }
        Ok(f(x))
    })
}

pub fn asin(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    inverse_trig(args, "asin", f64::asin)
}

pub fn acos(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    inverse_trig(args, "acos", f64::acos)
}

pub fn atan(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "atan", |x| Ok(x.atan()))
}

pub fn atan2(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [y, x] = args.exact::<2>("atan2")?;
    Ok(Value::Float(number(&y)?.atan2(number(&x)?)))
}

fn sinh(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "sinh", |x| checked(x.sinh(), x.is_finite()))
}

fn cosh(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "cosh", |x| checked(x.cosh(), x.is_finite()))
}

fn tanh(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "tanh", |x| Ok(x.tanh()))
}

fn hypot(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    args.finish("hypot")?;
    let mut total = 0.0f64;
    for value in &args.positional {
        total = total.hypot(number(value)?);
    }
    Ok(Value::Float(total))
}

pub fn degrees(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "degrees", |x| Ok(x.to_degrees()))
}

pub fn radians(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "radians", |x| Ok(x.to_radians()))
}

fn fabs(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "fabs", |x| Ok(x.abs()))
}

fn copysign(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [x, y] = args.exact::<2>("copysign")?;
    Ok(Value::Float(number(&x)?.copysign(number(&y)?)))
}

fn fmod(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [x, y] = args.exact::<2>("fmod")?;
    let (x, y) = (number(&x)?, number(&y)?);
    if y == 0.0 || x.is_infinite() {
        return Err(SafepyError::math_domain().into());
    }
    Ok(Value::Float(x % y))
}

fn isclose(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let rel_tol = match args.take_keyword("rel_tol") {
        Some(v) => number(&v)?,
        None => 1e-9,
    };
    let abs_tol = match args.take_keyword("abs_tol") {
        Some(v) => number(&v)?,
        None => 0.0,
    };
    if rel_tol < 0.0 || abs_tol < 0.0 {
        return Err(SafepyError::value_error("tolerances must be non-negative").into());
    }
    let [a, b] = args.exact::<2>("isclose")?;
    let (a, b) = (number(&a)?, number(&b)?);
    if a == b {
        return Ok(Value::Bool(true));
    }
    if a.is_infinite() || b.is_infinite() {
        return Ok(Value::Bool(false));
    }
    let diff = (a - b).abs();
    let close = diff <= (rel_tol * b).abs() || diff <= (rel_tol * a).abs() || diff <= abs_tol;
    Ok(Value::Bool(close))
}

fn isfinite(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [x] = args.exact::<1>("isfinite")?;
    Ok(Value::Bool(number(&x)?.is_finite()))
}

fn isinf(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [x] = args.exact::<1>("isinf")?;
    Ok(Value::Bool(number(&x)?.is_infinite()))
}

fn isnan(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [x] = args.exact::<1>("isnan")?;
    Ok(Value::Bool(number(&x)?.is_nan()))
}

fn factorial(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [n] = args.exact::<1>("factorial")?;
    let n = integer(&n, "factorial")?;
    if n < 0 {
        return Err(
            SafepyError::value_error("factorial() not defined for negative values").into(),
        );
    }
    let mut acc: i64 = 1;
    for k in 2..=n {
        acc = acc
            .checked_mul(k)
            .ok_or_else(|| SafepyError::overflow("factorial result does not fit in 64 bits"))?;
    }
    Ok(Value::Int(acc))
}

fn gcd_pair(a: i64, b: i64) -> Result<i64> {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    i64::try_from(a).map_err(|_| SafepyError::overflow("gcd result does not fit in 64 bits"))
}

fn gcd(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    args.finish("gcd")?;
    let mut acc = 0;
    for value in &args.positional {
        acc = gcd_pair(acc, integer(value, "gcd")?)?;
    }
    Ok(Value::Int(acc))
}

fn lcm(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    args.finish("lcm")?;
    let overflow = || SafepyError::overflow("lcm result does not fit in 64 bits");
    let mut acc: i64 = 1;
    for value in &args.positional {
        let n = integer(value, "lcm")?;
        if n == 0 || acc == 0 {
            acc = 0;
            continue;
        }
        acc = (acc / gcd_pair(acc, n)?)
            .checked_mul(n)
            .and_then(i64::checked_abs)
            .ok_or_else(overflow)?;
    }
    Ok(Value::Int(acc))
}

fn comb_perm(args: Arguments, name: &str) -> Result<(i64, i64)> {
    let values = args.between(name, 1, 2)?;
    let n = integer(&values[0], name)?;
    let k = match values.get(1) {
        Some(k) if !k.is_none() => integer(k, name)?,
        _ => n,
    };
    if n < 0 || k < 0 {
        return Err(SafepyError::value_error(format!(
            "{} must be a non-negative integer",
            if n < 0 { "n" } else { "k" }
        )));
    }
    Ok((n, k))
}

fn comb(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (n, k) = comb_perm(args, "comb")?;
    if k > n {
        return Ok(Value::Int(0));
    }
    let k = k.min(n - k);
    let mut acc: i128 = 1;
    for i in 0..k {
        acc = acc * (n - i) as i128 / (i + 1) as i128;
        if acc > i64::MAX as i128 {
            return Err(SafepyError::overflow("comb result does not fit in 64 bits").into());
        }
    }
    Ok(Value::Int(acc as i64))
}

fn perm(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (n, k) = comb_perm(args, "perm")?;
    if k > n {
        return Ok(Value::Int(0));
    }
    let mut acc: i64 = 1;
    for i in 0..k {
        acc = acc
            .checked_mul(n - i)
            .ok_or_else(|| SafepyError::overflow("perm result does not fit in 64 bits"))?;
    }
    Ok(Value::Int(acc))
}

fn prod(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let start = args.take_keyword("start").unwrap_or(Value::Int(1));
    let [iterable] = args.exact::<1>("prod")?;
    let mut acc = start;
    for item in interp.collect(&iterable)? {
        acc = crate::engine::operators::binary(
            crate::parser::ast::BinOp::Mul,
            &acc,
            &item,
            interp.limits,
        )?;
    }
    Ok(acc)
}

/// Exactly rounded float sum (Shewchuk partials)
pub fn exact_sum(values: &[f64]) -> f64 {
    let mut partials: Vec<f64> = Vec::new();
    let mut special = 0.0;
    for &x in values {
        if !x.is_finite() {
            special += x;
            continue;
        }
        let mut x = x;
        let mut i = 0;
        for j in 0..partials.len() {
            let mut y = partials[j];
            if x.abs() < y.abs() {
                std::mem::swap(&mut x, &mut y);
            }
            let hi = x + y;
            let lo = y - (hi - x);
            if lo != 0.0 {
                partials[i] = lo;
                i += 1;
            }
            x = hi;
        }
        partials.truncate(i);
        partials.push(x);
    }
    if special != 0.0 || special.is_nan() {
        return special;
    }
    partials.iter().sum()
}

fn fsum(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [iterable] = args.exact::<1>("fsum")?;
    let values = interp
        .collect(&iterable)?
        .iter()
        .map(number)
        .collect::<Result<Vec<f64>>>()?;
    Ok(Value::Float(exact_sum(&values)))
}

fn isqrt(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [n] = args.exact::<1>("isqrt")?;
    let n = integer(&n, "isqrt")?;
    if n < 0 {
        return Err(
            SafepyError::value_error("isqrt() argument must be nonnegative").into(),
        );
    }
    let mut root = (n as f64).sqrt() as i64;
    while root.checked_mul(root).map_or(true, |sq| sq > n) {
        root -= 1;
    }
    while (root + 1).checked_mul(root + 1).is_some_and(|sq| sq <= n) {
        root += 1;
    }
    Ok(Value::Int(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_sum_cancels() {
        assert_eq!(exact_sum(&[0.1; 10]), 1.0);
        assert_eq!(exact_sum(&[1e100, 1.0, -1e100, 1.0]), 2.0);
        assert!(exact_sum(&[f64::INFINITY, -f64::INFINITY]).is_nan());
    }

    #[test]
    fn test_gcd_pair() {
        assert_eq!(gcd_pair(12, 18).unwrap(), 6);
        assert_eq!(gcd_pair(-4, 6).unwrap(), 2);
        assert_eq!(gcd_pair(0, 0).unwrap(), 0);
        assert_eq!(gcd_pair(i64::MIN, 6).unwrap(), 2);
        let err = gcd_pair(i64::MIN, 0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Arithmetic);
    }

    #[test]
    fn test_checked_range() {
        assert!(checked(f64::INFINITY, true).is_err());
        assert!(checked(f64::INFINITY, false).is_ok());
    }

    #[test]
    fn test_integer_rejects_floats() {
        let err = integer(&Value::Float(2.0), "factorial").unwrap_err();
        assert!(err.message().contains("only accepts integral values"));
    }
}
