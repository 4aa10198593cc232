//! `operator` module: the language's operators as functions

use std::rc::Rc;

use crate::engine::{operators, EvalResult, Interpreter};
use crate::error::SafepyError;
use crate::parser::ast::{BinOp, CmpOp, UnaryOp};
use crate::value::{Arguments, Builtin, Module, Partial, Value};

macro_rules! binary_ops {
    ($($name:ident => $op:expr),* $(,)?) => {
        $(
            fn $name(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
                let [a, b] = args.exact::<2>(stringify!($name))?;
                Ok(operators::binary($op, &a, &b, interp.limits)?)
            }
        )*
    };
}

macro_rules! comparisons {
    ($($name:ident => $op:expr),* $(,)?) => {
        $(
            fn $name(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
                let [a, b] = args.exact::<2>(stringify!($name))?;
                Ok(Value::Bool(operators::compare($op, &a, &b)?))
            }
        )*
    };
}

binary_ops! {
    add => BinOp::Add,
    sub => BinOp::Sub,
    mul => BinOp::Mul,
    truediv => BinOp::Div,
    floordiv => BinOp::FloorDiv,
    mod_ => BinOp::Mod,
    pow => BinOp::Pow,
    lshift => BinOp::LShift,
    rshift => BinOp::RShift,
    and_ => BinOp::BitAnd,
    or_ => BinOp::BitOr,
    xor => BinOp::BitXor,
}

comparisons! {
    eq => CmpOp::Eq,
    ne => CmpOp::NotEq,
    lt => CmpOp::Lt,
    le => CmpOp::LtE,
    gt => CmpOp::Gt,
    ge => CmpOp::GtE,
    is_ => CmpOp::Is,
    is_not => CmpOp::IsNot,
}

pub fn module() -> Module {
    Module::new("operator")
        .function("add", add)
        .function("sub", sub)
        .function("mul", mul)
        .function("truediv", truediv)
        .function("floordiv", floordiv)
        .function("mod", mod_)
        .function("pow", pow)
        .function("lshift", lshift)
        .function("rshift", rshift)
        .function("and_", and_)
        .function("or_", or_)
        .function("xor", xor)
        .function("concat", add)
        .function("eq", eq)
        .function("ne", ne)
        .function("lt", lt)
        .function("le", le)
        .function("gt", gt)
        .function("ge", ge)
        .function("is_", is_)
        .function("is_not", is_not)
        .function("neg", neg)
        .function("pos", pos)
        .function("not_", not_)
        .function("invert", invert)
        .function("truth", truth)
        .function("abs", abs)
        .function("contains", contains)
        .function("getitem", getitem)
        .function("itemgetter", itemgetter)
        .function("attrgetter", attrgetter)
        .function("methodcaller", methodcaller)
}

fn unary(args: Arguments, name: &str, op: UnaryOp) -> EvalResult<Value> {
    let [a] = args.exact::<1>(name)?;
    Ok(operators::unary(op, &a)?)
}

fn neg(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "neg", UnaryOp::Neg)
}

fn pos(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "pos", UnaryOp::Pos)
}

fn not_(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "not_", UnaryOp::Not)
}

fn invert(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    unary(args, "invert", UnaryOp::Invert)
}

fn truth(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [a] = args.exact::<1>("truth")?;
    Ok(Value::Bool(a.truthy()))
}

fn abs(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [a] = args.exact::<1>("abs")?;
    let zero = Value::Int(0);
    if operators::compare(CmpOp::Lt, &a, &zero)? {
        Ok(operators::unary(UnaryOp::Neg, &a)?)
    } else {
        Ok(a)
    }
}

fn contains(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [container, item] = args.exact::<2>("contains")?;
    Ok(Value::Bool(operators::contains(&container, &item)?))
}

fn getitem(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [obj, key] = args.exact::<2>("getitem")?;
    operators::get_item(interp, &obj, &key)
}

/// A builtin with leading arguments already bound
fn bind(name: &'static str, func: crate::value::BuiltinFn, args: Vec<Value>) -> Value {
    Value::Partial(Rc::new(Partial {
        func: Value::Builtin(Builtin::function(name, func)),
        args,
        keywords: Vec::new(),
    }))
}

fn require_some(args: &Arguments, name: &str) -> EvalResult<()> {
    args.finish(name)?;
    if args.positional.is_empty() {
        return Err(
            SafepyError::type_error(format!("{} expected 1 argument, got 0", name)).into(),
        );
    }
    Ok(())
}

fn itemgetter(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    require_some(&args, "itemgetter")?;
    Ok(bind("itemgetter", apply_itemgetter, vec![Value::tuple(args.positional)]))
}

fn apply_itemgetter(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [keys, obj] = args.exact::<2>("itemgetter")?;
    let keys: Vec<Value> = keys.iter()?.collect();
    if let [key] = keys.as_slice() {
        return operators::get_item(interp, &obj, key);
    }
    let mut out = Vec::with_capacity(keys.len());
    for key in &keys {
        out.push(operators::get_item(interp, &obj, key)?);
    }
    Ok(Value::tuple(out))
}

fn attrgetter(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    require_some(&args, "attrgetter")?;
    for name in &args.positional {
        name.as_str()?;
    }
    Ok(bind("attrgetter", apply_attrgetter, vec![Value::tuple(args.positional)]))
}

fn apply_attrgetter(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [names, obj] = args.exact::<2>("attrgetter")?;
    let names: Vec<Value> = names.iter()?.collect();
    let mut out = Vec::with_capacity(names.len());
    for name in &names {
        let mut value = obj.clone();
        for part in name.as_str()?.split('.') {
            value = interp.get_attribute(&value, part)?;
        }
        out.push(value);
    }
    if out.len() == 1 {
        return Ok(out.swap_remove(0));
    }
    Ok(Value::tuple(out))
}

fn methodcaller(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let keywords = std::mem::take(&mut args.keywords);
    require_some(&args, "methodcaller")?;
    let name = args.positional.remove(0);
    name.as_str()?;
    let bound_keywords = Value::tuple(
        keywords
            .into_iter()
            .map(|(k, v)| Value::tuple(vec![Value::str(k), v]))
            .collect(),
    );
    Ok(bind(
        "methodcaller",
        apply_methodcaller,
        vec![name, Value::tuple(args.positional), bound_keywords],
    ))
}

fn apply_methodcaller(interp: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [name, positional, keywords, obj] = args.exact::<4>("methodcaller")?;
    let mut call = Arguments::new(positional.iter()?.collect());
    for pair in keywords.iter()? {
        let pair: Vec<Value> = pair.iter()?.collect();
        if let [key, value] = pair.as_slice() {
            call.keywords.push((key.as_str()?.to_string(), value.clone()));
        }
    }
    let method = interp.get_attribute(&obj, &name.as_str()?)?;
    interp.call(&method, call)
}
