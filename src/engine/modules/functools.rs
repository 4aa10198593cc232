//! `functools` module

use std::rc::Rc;

use crate::engine::{EvalResult, Interpreter};
use crate::error::SafepyError;
use crate::value::{Arguments, Module, Partial, Value};

pub fn module() -> Module {
    Module::new("functools")
        .function("reduce", reduce)
        .function("partial", partial)
}

fn reduce(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = args.between("reduce", 2, 3)?;
    let mut values = values.into_iter();
    let func = values.next().unwrap_or(Value::None);
    let iterable = values.next().unwrap_or(Value::None);
    let initial = values.next();
    let mut items = interp.collect(&iterable)?.into_iter();
    let mut acc = match initial.or_else(|| items.next()) {
        Some(acc) => acc,
        None => {
            return Err(SafepyError::type_error(
                "reduce() of empty iterable with no initial value",
            )
            .into())
        }
    };
    for item in items {
        interp.tick()?;
        acc = interp.call_with(&func, vec![acc, item])?;
    }
    Ok(acc)
}

fn partial(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    if args.positional.is_empty() {
        return Err(
            SafepyError::type_error("type 'partial' takes at least one argument").into(),
        );
    }
    let func = args.positional.remove(0);
    if !func.is_callable() {
        return Err(SafepyError::type_error("the first argument must be callable").into());
    }
    Ok(Value::Partial(Rc::new(Partial {
        func,
        args: args.positional,
        keywords: args.keywords,
    })))
}
