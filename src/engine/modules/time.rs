//! `time` module; there is deliberately no `sleep`

use std::sync::OnceLock;
use std::time::Instant;

use chrono::{Local, Utc};

use crate::engine::{EvalResult, Interpreter};
use crate::error::SafepyError;
use crate::value::format::strftime as render;
use crate::value::{Arguments, Module, Temporal, Value};

pub fn module() -> Module {
    Module::new("time")
        .function("time", time)
        .function("time_ns", time_ns)
        .function("perf_counter", perf_counter)
        .function("monotonic", perf_counter)
        .function("process_time", perf_counter)
        .function("strftime", strftime)
}

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

fn time(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    args.exact::<0>("time")?;
    let now = Utc::now();
    let micros = now.timestamp_micros();
    Ok(Value::Float(micros as f64 / 1e6))
}

fn time_ns(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    args.exact::<0>("time_ns")?;
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .ok_or_else(|| SafepyError::overflow("timestamp out of range"))?;
    Ok(Value::Int(nanos))
}

fn perf_counter(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    args.exact::<0>("perf_counter")?;
    Ok(Value::Float(epoch().elapsed().as_secs_f64()))
}

fn strftime(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let values = args.between("strftime", 1, 2)?;
    let format = values[0].as_str()?;
    let moment = match values.get(1) {
        None => Temporal::DateTime(Local::now().naive_local()),
        Some(Value::Temporal(t @ (Temporal::DateTime(_) | Temporal::Date(_)))) => *t,
        Some(other) => {
            return Err(SafepyError::type_error(format!(
                "strftime() argument 2 must be a datetime, not {}",
                other.type_name()
            ))
            .into())
        }
    };
    Ok(Value::str(render(&moment, &format)))
}
