//! `statistics` module over int and float data

use crate::engine::modules::math::exact_sum;
use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::value::{Arguments, Module, Value};

pub fn module() -> Module {
    Module::new("statistics")
        .function("mean", mean)
        .function("fmean", fmean)
        .function("geometric_mean", geometric_mean)
        .function("harmonic_mean", harmonic_mean)
        .function("median", median)
        .function("median_low", median_low)
        .function("median_high", median_high)
        .function("mode", mode)
        .function("multimode", multimode)
        .function("variance", variance)
        .function("pvariance", pvariance)
        .function("stdev", stdev)
        .function("pstdev", pstdev)
}

fn statistics_error(message: &str) -> SafepyError {
    SafepyError::RuntimeRestriction(format!("StatisticsError: {}", message))
}

fn data(interp: &mut Interpreter<'_>, args: Arguments, name: &str) -> EvalResult<Vec<Value>> {
    let [iterable] = args.exact::<1>(name)?;
    let items = interp.collect(&iterable)?;
    for item in &items {
        if !item.is_number() {
            return Err(SafepyError::type_error(format!(
                "can't convert type '{}' to numerator/denominator",
                item.type_name()
            ))
            .into());
        }
    }
    Ok(items)
}

fn floats(items: &[Value]) -> Result<Vec<f64>> {
    items.iter().map(Value::as_float).collect()
}

fn all_ints(items: &[Value]) -> bool {
    items
        .iter()
        .all(|v| matches!(v, Value::Int(_) | Value::Bool(_)))
}

/// Int when the data are ints and the mean is whole, else float
fn mean_of(items: &[Value]) -> Result<Value> {
    if items.is_empty() {
        return Err(statistics_error("mean requires at least one data point"));
    }
    if all_ints(items) {
        let total: i128 = items
            .iter()
            .map(|v| v.as_int().map(i128::from))
            .sum::<Result<i128>>()?;
        let n = items.len() as i128;
        if total % n == 0 {
            if let Ok(whole) = i64::try_from(total / n) {
                return Ok(Value::Int(whole));
            }
        }
        return Ok(Value::Float(total as f64 / n as f64));
    }
    Ok(Value::Float(exact_sum(&floats(items)?) / items.len() as f64))
}

fn mean(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let items = data(interp, args, "mean")?;
    Ok(mean_of(&items)?)
}

fn fmean(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let items = data(interp, args, "fmean")?;
    if items.is_empty() {
        return Err(statistics_error("fmean requires at least one data point").into());
    }
    Ok(Value::Float(exact_sum(&floats(&items)?) / items.len() as f64))
}

fn geometric_mean(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = floats(&data(interp, args, "geometric_mean")?)?;
    if values.is_empty() || values.iter().any(|x| *x <= 0.0) {
        return Err(statistics_error(
            "geometric mean requires a non-empty dataset containing positive numbers",
        )
        .into());
    }
    let logs: Vec<f64> = values.iter().map(|x| x.ln()).collect();
    Ok(Value::Float((exact_sum(&logs) / values.len() as f64).exp()))
}

fn harmonic_mean(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = floats(&data(interp, args, "harmonic_mean")?)?;
    if values.is_empty() {
        return Err(statistics_error("harmonic_mean requires at least one data point").into());
    }
    if values.iter().any(|x| *x < 0.0) {
        return Err(statistics_error("harmonic mean does not support negative values").into());
    }
    if values.iter().any(|x| *x == 0.0) {
        return Ok(Value::Float(0.0));
    }
    let inverses: Vec<f64> = values.iter().map(|x| 1.0 / x).collect();
    Ok(Value::Float(values.len() as f64 / exact_sum(&inverses)))
}

fn sorted_data(interp: &mut Interpreter<'_>, args: Arguments, name: &str) -> EvalResult<Vec<Value>> {
    let items = data(interp, args, name)?;
    if items.is_empty() {
        return Err(statistics_error("no median for empty data").into());
    }
    interp.sort_values(items, None, false)
}

fn median(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let items = sorted_data(interp, args, "median")?;
    let n = items.len();
    if n % 2 == 1 {
        return Ok(items[n / 2].clone());
    }
    let pair = [items[n / 2 - 1].clone(), items[n / 2].clone()];
    let (a, b) = (pair[0].as_float()?, pair[1].as_float()?);
    Ok(Value::Float((a + b) / 2.0))
}

fn median_low(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let items = sorted_data(interp, args, "median_low")?;
    let n = items.len();
    Ok(items[if n % 2 == 1 { n / 2 } else { n / 2 - 1 }].clone())
}

fn median_high(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let items = sorted_data(interp, args, "median_high")?;
    Ok(items[items.len() / 2].clone())
}

/// Values tied for the highest count, in first-seen order
fn most_frequent(items: &[Value]) -> Vec<Value> {
    let mut counts: Vec<(Value, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(v, _)| v.equals(item)) {
            Some((_, n)) => *n += 1,
            None => counts.push((item.clone(), 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max().unwrap_or(0);
    counts
        .into_iter()
        .filter(|(_, n)| *n == best)
        .map(|(v, _)| v)
        .collect()
}

fn mode(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [iterable] = args.exact::<1>("mode")?;
    let items = interp.collect(&iterable)?;
    most_frequent(&items)
        .into_iter()
        .next()
        .ok_or_else(|| statistics_error("no mode for empty data").into())
}

fn multimode(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [iterable] = args.exact::<1>("multimode")?;
    let items = interp.collect(&iterable)?;
    Ok(Value::list(most_frequent(&items)))
}

/// Sum of squared deviations from the mean
fn squared_deviations(values: &[f64]) -> f64 {
    let mean = exact_sum(values) / values.len() as f64;
    let squares: Vec<f64> = values.iter().map(|x| (x - mean) * (x - mean)).collect();
    exact_sum(&squares)
}

fn spread(
    interp: &mut Interpreter<'_>,
    args: Arguments,
    name: &str,
    sample: bool,
) -> EvalResult<f64> {
    let values = floats(&data(interp, args, name)?)?;
    let minimum = if sample { 2 } else { 1 };
    if values.len() < minimum {
        let message = if sample {
            format!("{} requires at least two data points", name)
        } else {
            format!("{} requires at least one data point", name)
        };
        return Err(statistics_error(&message).into());
    }
    let divisor = if sample { values.len() - 1 } else { values.len() };
    Ok(squared_deviations(&values) / divisor as f64)
}

fn variance(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    Ok(Value::Float(spread(interp, args, "variance", true)?))
}

fn pvariance(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    Ok(Value::Float(spread(interp, args, "pvariance", false)?))
}

fn stdev(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    Ok(Value::Float(spread(interp, args, "stdev", true)?.sqrt()))
}

fn pstdev(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    Ok(Value::Float(spread(interp, args, "pstdev", false)?.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|i| Value::Int(*i)).collect()
    }

    #[test]
    fn test_mean_keeps_int_when_whole() {
        assert!(matches!(mean_of(&ints(&[1, 2, 3])).unwrap(), Value::Int(2)));
        assert!(matches!(mean_of(&ints(&[1, 2])).unwrap(), Value::Float(f) if f == 1.5));
        assert!(mean_of(&[]).is_err());
    }

    #[test]
    fn test_most_frequent_first_seen_order() {
        let modes = most_frequent(&ints(&[3, 1, 3, 1, 2]));
        assert_eq!(Value::list(modes).to_string(), "[3, 1]");
    }

    #[test]
    fn test_squared_deviations() {
        assert_eq!(squared_deviations(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 32.0);
    }
}
