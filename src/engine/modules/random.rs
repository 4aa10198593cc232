//! `random` module backed by the executor's seedable generator
//!
//! Sequences are reproducible for a given seed within this implementation;
//! they do not match CPython's Mersenne Twister output.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::value::format::to_str;
use crate::value::{Arguments, Module, Value};

pub fn module() -> Module {
    Module::new("random")
        .function("seed", seed)
        .function("random", random)
        .function("uniform", uniform)
        .function("randint", randint)
        .function("randrange", randrange)
        .function("choice", choice)
        .function("choices", choices)
        .function("sample", sample)
        .function("shuffle", shuffle)
        .function("gauss", gauss)
        .function("normalvariate", gauss)
        .function("getrandbits", getrandbits)
}

/// Seed material for `random.seed(value)`
fn seed_of(value: &Value) -> Result<u64> {
    match value {
        Value::Int(_) | Value::Bool(_) => Ok(value.as_int()? as u64),
        Value::Float(f) => Ok(f.to_bits()),
        Value::Str(s) => {
            let mut hasher = DefaultHasher::new();
            s.hash(&mut hasher);
            Ok(hasher.finish())
        }
        other => Err(SafepyError::type_error(format!(
            "The only supported seed types are: None, int, float, str; not {}",
            other.type_name()
        ))),
    }
}

fn seed(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = args.between("seed", 0, 1)?;
    *interp.rng = match values.first() {
        None | Some(Value::None) => StdRng::from_entropy(),
        Some(value) => StdRng::seed_from_u64(seed_of(value)?),
    };
    tracing::debug!(seed = ?values.first().map(to_str), "random reseeded");
    Ok(Value::None)
}

fn random(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    args.exact::<0>("random")?;
    Ok(Value::Float(interp.rng.gen::<f64>()))
}

fn uniform(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [a, b] = args.exact::<2>("uniform")?;
    let (a, b) = (a.as_float()?, b.as_float()?);
    Ok(Value::Float(a + (b - a) * interp.rng.gen::<f64>()))
}

fn randint(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [a, b] = args.exact::<2>("randint")?;
    let (a, b) = (a.as_int()?, b.as_int()?);
    if a > b {
        return Err(SafepyError::value_error(format!(
            "empty range in randrange({}, {})",
            a,
            b as i128 + 1
        ))
        .into());
    }
    Ok(Value::Int(interp.rng.gen_range(a..=b)))
}

fn randrange(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = args.between("randrange", 1, 3)?;
    let ints = values
        .iter()
        .map(Value::as_int)
        .collect::<Result<Vec<i64>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(SafepyError::internal("randrange arity").into()),
    };
    if step == 0 {
        return Err(SafepyError::value_error("zero step for randrange()").into());
    }
    let range = crate::value::Range { start, stop, step };
    let len = range.len();
    if len == 0 {
        return Err(SafepyError::value_error(format!(
            "empty range in randrange({}, {})",
            start, stop
        ))
        .into());
    }
    Ok(Value::Int(range.get(interp.rng.gen_range(0..len))))
}

fn choice(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [population] = args.exact::<1>("choice")?;
    let items = interp.collect(&population)?;
    items
        .choose(&mut *interp.rng)
        .cloned()
        .ok_or_else(|| SafepyError::index_error("Cannot choose from an empty sequence").into())
}

fn choices(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let weights = args.take_keyword("weights");
    let cum_weights = args.take_keyword("cum_weights");
    let k = args.take_keyword("k").map(|k| k.as_int()).transpose()?.unwrap_or(1);
    let values = args.between("choices", 1, 2)?;
    let items = interp.collect(&values[0])?;
    let weights = values.get(1).cloned().or(weights);
    if k < 0 || k as usize > interp.limits.max_collection_len {
        return Err(interp.memory_error().into());
    }
    if items.is_empty() {
        return Err(SafepyError::index_error("Cannot choose from an empty population").into());
    }
    let cumulative = match (weights, cum_weights) {
        (Some(_), Some(_)) => {
            return Err(SafepyError::type_error(
                "Cannot specify both weights and cumulative weights",
            )
            .into())
        }
        (Some(w), None) if !w.is_none() => {
            let mut total = 0.0;
            let mut out = Vec::new();
            for weight in interp.collect(&w)? {
                total += weight.as_float()?;
                out.push(total);
            }
            Some(out)
        }
        (None, Some(c)) if !c.is_none() => Some(
            interp
                .collect(&c)?
                .iter()
                .map(Value::as_float)
                .collect::<Result<Vec<f64>>>()?,
        ),
        _ => None,
    };
    let mut picked = Vec::with_capacity(k as usize);
    match cumulative {
        None => {
            for _ in 0..k {
                let index = interp.rng.gen_range(0..items.len());
                picked.push(items[index].clone());
            }
        }
        Some(cumulative) => {
            if cumulative.len() != items.len() {
                return Err(SafepyError::value_error(
                    "The number of weights does not match the population",
                )
                .into());
            }
            let total = cumulative.last().copied().unwrap_or(0.0);
            if !(total > 0.0) || !total.is_finite() {
                return Err(SafepyError::value_error("Total of weights must be greater than zero").into());
            }
            for _ in 0..k {
                let point = interp.rng.gen::<f64>() * total;
                let index = cumulative.partition_point(|c| *c <= point).min(items.len() - 1);
                picked.push(items[index].clone());
            }
        }
    }
    Ok(Value::list(picked))
}

fn sample(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let k = args.take_keyword("k");
    let mut values = args.between("sample", 1, 2)?;
    let k = if values.len() == 2 { values.pop() } else { k }
        .ok_or_else(|| SafepyError::type_error("sample() missing required argument 'k'"))?
        .as_int()?;
    let items = interp.collect(&values[0])?;
    if k < 0 || k as usize > items.len() {
        return Err(SafepyError::value_error("Sample larger than population or is negative").into());
    }
    let picked = items
        .choose_multiple(&mut *interp.rng, k as usize)
        .cloned()
        .collect();
    Ok(Value::list(picked))
}

fn shuffle(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [target] = args.exact::<1>("shuffle")?;
    let Value::List(items) = target else {
        return Err(SafepyError::type_error(format!(
            "shuffle() argument must be a list, not {}",
            target.type_name()
        ))
        .into());
    };
    items.borrow_mut().shuffle(&mut *interp.rng);
    Ok(Value::None)
}

fn gauss(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let mu = args.take(0, "mu").map(|v| v.as_float()).transpose()?.unwrap_or(0.0);
    let sigma = args.take(1, "sigma").map(|v| v.as_float()).transpose()?.unwrap_or(1.0);
    // Box-Muller
    let u1: f64 = 1.0 - interp.rng.gen::<f64>();
    let u2: f64 = interp.rng.gen::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    Ok(Value::Float(mu + sigma * z))
}

fn getrandbits(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [k] = args.exact::<1>("getrandbits")?;
    let k = k.as_int()?;
    if !(0..=63).contains(&k) {
        return Err(SafepyError::value_error("number of bits must be between 0 and 63").into());
    }
    let bits = interp.rng.gen::<u64>() >> (64 - k.max(1)) as u32;
    Ok(Value::Int(if k == 0 { 0 } else { bits as i64 }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_material_is_stable() {
        assert_eq!(seed_of(&Value::Int(42)).unwrap(), 42);
        assert_eq!(
            seed_of(&Value::str("abc")).unwrap(),
            seed_of(&Value::str("abc")).unwrap()
        );
        assert!(seed_of(&Value::list(vec![])).is_err());
    }
}
