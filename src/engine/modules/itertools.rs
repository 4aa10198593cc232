//! `itertools` module
//!
//! Results are materialised iterators bounded by the collection limit, except
//! `count` (a lazy counter) and `islice` (which only pulls what it needs).

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::builtins::collect_columns;
use crate::engine::{operators, EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::parser::ast::BinOp;
use crate::value::{Arguments, IterSource, IterState, Module, Value};

pub fn module() -> Module {
    Module::new("itertools")
        .function("chain", chain)
        .function("product", product)
        .function("permutations", permutations)
        .function("combinations", combinations)
        .function("combinations_with_replacement", combinations_with_replacement)
        .function("accumulate", accumulate)
        .function("islice", islice)
        .function("groupby", groupby)
        .function("zip_longest", zip_longest)
        .function("starmap", starmap)
        .function("takewhile", takewhile)
        .function("dropwhile", dropwhile)
        .function("filterfalse", filterfalse)
        .function("pairwise", pairwise)
        .function("compress", compress)
        .function("repeat", repeat)
        .function("count", count)
}

/// Refuse to build more than the collection limit allows
fn ensure_room(interp: &Interpreter<'_>, total: u128) -> Result<()> {
    if total > interp.limits.max_collection_len as u128 {
        return Err(interp.memory_error());
    }
    Ok(())
}

fn optional_r(value: Option<Value>) -> Result<Option<usize>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(v) => {
            let r = v.as_int()?;
            if r < 0 {
                return Err(SafepyError::value_error("r must be non-negative"));
            }
            Ok(Some(r as usize))
        }
    }
}

fn chain(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    args.finish("chain")?;
    let mut items = Vec::new();
    for iterable in &args.positional {
        let part = interp.collect(iterable)?;
        ensure_room(interp, (items.len() + part.len()) as u128)?;
        items.extend(part);
    }
    Ok(Value::iterator("chain", items))
}

fn product(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let repeat = args
        .take_keyword("repeat")
        .map(|r| r.as_int())
        .transpose()?
        .unwrap_or(1);
    if repeat < 0 {
        return Err(SafepyError::value_error("repeat argument cannot be negative").into());
    }
    args.finish("product")?;
    let columns = collect_columns(interp, &args.positional)?;
    let pools: Vec<Vec<Value>> = (0..repeat).flat_map(|_| columns.iter().cloned()).collect();
    let total = pools
        .iter()
        .try_fold(1u128, |acc, pool| acc.checked_mul(pool.len() as u128))
        .unwrap_or(u128::MAX);
    ensure_room(interp, total)?;
    let mut rows: Vec<Vec<Value>> = vec![Vec::new()];
    for pool in &pools {
        let mut next = Vec::with_capacity(rows.len() * pool.len());
        for row in &rows {
            for item in pool {
                let mut extended = row.clone();
                extended.push(item.clone());
                next.push(extended);
            }
        }
        rows = next;
    }
    Ok(Value::iterator(
        "product",
        rows.into_iter().map(Value::tuple),
    ))
}

fn falling_factorial(n: usize, r: usize) -> u128 {
    (0..r).fold(1u128, |acc, i| acc.saturating_mul((n - i) as u128))
}

fn binomial(n: usize, r: usize) -> u128 {
    if r > n {
        return 0;
    }
    let r = r.min(n - r);
    (0..r).fold(1u128, |acc, i| {
        acc.saturating_mul((n - i) as u128) / (i as u128 + 1)
    })
}

fn permutations(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let r = args.take_keyword("r");
    let mut values = args.between("permutations", 1, 2)?;
    let r = if values.len() == 2 { values.pop() } else { r };
    let pool = interp.collect(&values[0])?;
    let n = pool.len();
    let r = optional_r(r)?.unwrap_or(n);
    if r > n {
        return Ok(Value::iterator("permutations", Vec::new()));
    }
    ensure_room(interp, falling_factorial(n, r))?;
    let mut out = Vec::new();
    let mut indices: Vec<usize> = (0..n).collect();
    let mut cycles: Vec<usize> = (0..r).map(|i| n - i).collect();
    out.push(Value::tuple(indices[..r].iter().map(|&i| pool[i].clone()).collect()));
    'outer: loop {
        for i in (0..r).rev() {
            cycles[i] -= 1;
            if cycles[i] == 0 {
                let moved = indices.remove(i);
                indices.push(moved);
                cycles[i] = n - i;
            } else {
                let j = n - cycles[i];
                indices.swap(i, j);
                out.push(Value::tuple(indices[..r].iter().map(|&i| pool[i].clone()).collect()));
                continue 'outer;
            }
        }
        break;
    }
    Ok(Value::iterator("permutations", out))
}

fn combinations_of(
    interp: &mut Interpreter<'_>,
    args: Arguments,
    name: &'static str,
    replacement: bool,
) -> EvalResult<Value> {
    let [iterable, r] = args.exact::<2>(name)?;
    let pool = interp.collect(&iterable)?;
    let n = pool.len();
    let r = optional_r(Some(r))?.unwrap_or(0);
    let total = if replacement {
        if n == 0 {
            u128::from(r == 0)
        } else {
            binomial(n + r - 1, r)
        }
    } else {
        binomial(n, r)
    };
    ensure_room(interp, total)?;
    if total == 0 {
        return Ok(Value::iterator(name, Vec::new()));
    }
    let pick = |indices: &[usize]| Value::tuple(indices.iter().map(|&i| pool[i].clone()).collect());
    let mut out = Vec::with_capacity(total as usize);
    let mut indices: Vec<usize> = if replacement { vec![0; r] } else { (0..r).collect() };
    out.push(pick(&indices));
    loop {
        let limit = |i: usize| if replacement { n - 1 } else { i + n - r };
        let Some(i) = (0..r).rev().find(|&i| indices[i] != limit(i)) else {
            break;
        };
        if replacement {
            let next = indices[i] + 1;
            for slot in &mut indices[i..] {
                *slot = next;
            }
        } else {
            indices[i] += 1;
            for j in i + 1..r {
                indices[j] = indices[j - 1] + 1;
            }
        }
        out.push(pick(&indices));
    }
    Ok(Value::iterator(name, out))
}

fn combinations(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    combinations_of(interp, args, "combinations", false)
}

fn combinations_with_replacement(
    interp: &mut Interpreter<'_>,
    args: Arguments,
) -> EvalResult<Value> {
    combinations_of(interp, args, "combinations_with_replacement", true)
}

fn accumulate(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let initial = args.take_keyword("initial");
    let func = args.take_keyword("func");
    let mut values = args.between("accumulate", 1, 2)?;
    let func = if values.len() == 2 { values.pop() } else { func }.filter(|f| !f.is_none());
    let items = interp.collect(&values[0])?;
    let mut out = Vec::with_capacity(items.len() + 1);
    let mut acc: Option<Value> = None;
    if let Some(initial) = initial.filter(|i| !i.is_none()) {
        out.push(initial.clone());
        acc = Some(initial);
    }
    for item in items {
        let next = match acc.take() {
            None => item,
            Some(total) => match &func {
                Some(func) => interp.call_with(func, vec![total, item])?,
                None => operators::binary(BinOp::Add, &total, &item, interp.limits)?,
            },
        };
        out.push(next.clone());
        acc = Some(next);
    }
    Ok(Value::iterator("accumulate", out))
}

fn islice(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = args.between("islice", 2, 4)?;
    let bound = |v: Option<&Value>| -> Result<Option<u64>> {
        match v {
            None | Some(Value::None) => Ok(None),
            Some(v) => {
                let n = v.as_int()?;
                if n < 0 {
                    return Err(SafepyError::value_error(
                        "Indices for islice() must be None or an integer: 0 <= x <= sys.maxsize.",
                    ));
                }
                Ok(Some(n as u64))
            }
        }
    };
    let (start, stop, step) = if values.len() == 2 {
        (0, bound(values.get(1))?, 1)
    } else {
        let step = bound(values.get(3))?.unwrap_or(1);
        if step == 0 {
            return Err(SafepyError::value_error(
                "Step for islice() must be a positive integer or None.",
            )
            .into());
        }
        (bound(values.get(1))?.unwrap_or(0), bound(values.get(2))?, step)
    };
    let mut source = values[0].iter()?;
    let mut out = Vec::new();
    let mut position = 0u64;
    while stop.map_or(true, |stop| position < stop) {
        interp.tick()?;
        let Some(item) = source.next() else { break };
        if position >= start && (position - start) % step == 0 {
            ensure_room(interp, out.len() as u128 + 1)?;
            out.push(item);
        }
        position += 1;
    }
    Ok(Value::iterator("islice", out))
}

fn groupby(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let key = args.take_keyword("key");
    let mut values = args.between("groupby", 1, 2)?;
    let key = if values.len() == 2 { values.pop() } else { key }.filter(|k| !k.is_none());
    let items = interp.collect(&values[0])?;
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    for item in items {
        let k = match &key {
            Some(func) => interp.call_with(func, vec![item.clone()])?,
            None => item.clone(),
        };
        match groups.last_mut() {
            Some((current, members)) if current.equals(&k) => members.push(item),
            _ => groups.push((k, vec![item])),
        }
    }
    let out = groups
        .into_iter()
        .map(|(k, members)| Value::tuple(vec![k, Value::iterator("_grouper", members)]));
    Ok(Value::iterator("groupby", out))
}

fn zip_longest(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let fill = args.take_keyword("fillvalue").unwrap_or(Value::None);
    args.finish("zip_longest")?;
    let columns = collect_columns(interp, &args.positional)?;
    let longest = columns.iter().map(Vec::len).max().unwrap_or(0);
    let rows = (0..longest).map(|i| {
        Value::tuple(
            columns
                .iter()
                .map(|c| c.get(i).cloned().unwrap_or_else(|| fill.clone()))
                .collect(),
        )
    });
    Ok(Value::iterator("zip_longest", rows.collect::<Vec<_>>()))
}

fn starmap(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [func, iterable] = args.exact::<2>("starmap")?;
    let mut out = Vec::new();
    for item in interp.collect(&iterable)? {
        let call_args = interp.collect(&item)?;
        out.push(interp.call_with(&func, call_args)?);
    }
    Ok(Value::iterator("starmap", out))
}

fn predicate_split(
    interp: &mut Interpreter<'_>,
    args: Arguments,
    name: &'static str,
) -> EvalResult<(Vec<Value>, usize)> {
    let [predicate, iterable] = args.exact::<2>(name)?;
    let items = interp.collect(&iterable)?;
    let mut split = items.len();
    for (i, item) in items.iter().enumerate() {
        if !interp.call_with(&predicate, vec![item.clone()])?.truthy() {
            split = i;
            break;
        }
    }
    Ok((items, split))
}

fn takewhile(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (mut items, split) = predicate_split(interp, args, "takewhile")?;
    items.truncate(split);
    Ok(Value::iterator("takewhile", items))
}

fn dropwhile(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let (items, split) = predicate_split(interp, args, "dropwhile")?;
    Ok(Value::iterator("dropwhile", items.into_iter().skip(split)))
}

fn filterfalse(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [predicate, iterable] = args.exact::<2>("filterfalse")?;
    let mut out = Vec::new();
    for item in interp.collect(&iterable)? {
        let keep = if predicate.is_none() {
            !item.truthy()
        } else {
            !interp.call_with(&predicate, vec![item.clone()])?.truthy()
        };
        if keep {
            out.push(item);
        }
    }
    Ok(Value::iterator("filterfalse", out))
}

fn pairwise(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [iterable] = args.exact::<1>("pairwise")?;
    let items = interp.collect(&iterable)?;
    let pairs = items
        .windows(2)
        .map(|w| Value::tuple(w.to_vec()))
        .collect::<Vec<_>>();
    Ok(Value::iterator("pairwise", pairs))
}

fn compress(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [data, selectors] = args.exact::<2>("compress")?;
    let data = interp.collect(&data)?;
    let selectors = interp.collect(&selectors)?;
    let kept = data
        .into_iter()
        .zip(selectors)
        .filter_map(|(item, keep)| keep.truthy().then_some(item))
        .collect::<Vec<_>>();
    Ok(Value::iterator("compress", kept))
}

fn repeat(interp: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let times = args.take_keyword("times");
    let mut values = args.between("repeat", 1, 2)?;
    let times = if values.len() == 2 { values.pop() } else { times };
    let Some(times) = times else {
        return Err(SafepyError::RuntimeRestriction(
            "itertools.repeat() without a count is not available in the sandbox".to_string(),
        )
        .into());
    };
    let times = times.as_int()?.max(0) as usize;
    ensure_room(interp, times as u128)?;
    let item = values.swap_remove(0);
    Ok(Value::iterator("repeat", vec![item; times]))
}

/// `count(start=0, step=1)`: lazy, so only ever consumed piecewise
fn count(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let start = args.take(0, "start").map(|v| v.as_int()).transpose()?.unwrap_or(0);
    let step = args.take(1, "step").map(|v| v.as_int()).transpose()?.unwrap_or(1);
    args.between("count", 0, 2)?;
    Ok(Value::Iterator(Rc::new(RefCell::new(IterState {
        kind: "count",
        source: IterSource::Range {
            next: start,
            remaining: u64::MAX,
            step,
        },
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_helpers() {
        assert_eq!(falling_factorial(5, 2), 20);
        assert_eq!(binomial(5, 2), 10);
        assert_eq!(binomial(2, 5), 0);
        assert_eq!(binomial(60, 30), 118264581564861424);
    }
}
