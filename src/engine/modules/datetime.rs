//! `datetime` module: naive `datetime`, `date` and `timedelta`
//!
//! Values are timezone-naive; `now()` and `fromtimestamp()` use local time.

use chrono::{
    Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};

use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::value::format::{delta_parts, repr, strftime};
use crate::value::{Arguments, Builtin, BuiltinFn, Module, Temporal, Value};

const CLASSES: &[(&str, BuiltinFn)] = &[
    ("datetime", new_datetime),
    ("date", new_date),
    ("timedelta", new_timedelta),
];

const DATETIME_METHODS: &[&str] = &[
    "strftime", "isoformat", "date", "timestamp", "weekday", "isoweekday", "replace",
    "toordinal", "ctime",
];

const DATE_METHODS: &[&str] = &[
    "strftime", "isoformat", "weekday", "isoweekday", "replace", "toordinal", "ctime",
];

const DELTA_METHODS: &[&str] = &["total_seconds"];

const DATETIME_CLASS_METHODS: &[&str] = &[
    "now", "today", "utcnow", "strptime", "fromisoformat", "fromtimestamp", "combine",
];

const DATE_CLASS_METHODS: &[&str] = &["today", "fromisoformat", "fromtimestamp", "fromordinal"];

/// Largest timedelta magnitude in days
const MAX_DELTA_DAYS: i64 = 999_999_999;

pub fn module() -> Module {
    CLASSES
        .iter()
        .fold(Module::new("datetime"), |module, (name, func)| {
            module.class(*name, *func)
        })
        .with("MINYEAR", Value::Int(1))
        .with("MAXYEAR", Value::Int(9999))
}

/// Class object for a `datetime` type name
pub fn class_named(name: &str) -> Option<Builtin> {
    CLASSES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(n, func)| Builtin::class(*n, *func))
}

fn instance_methods(owner: &str) -> &'static [&'static str] {
    match owner {
        "datetime" => DATETIME_METHODS,
        "date" => DATE_METHODS,
        "timedelta" => DELTA_METHODS,
        _ => &[],
    }
}

pub fn is_class_method(owner: &str, name: &str) -> bool {
    match owner {
        "datetime" => DATETIME_CLASS_METHODS.contains(&name),
        "date" => DATE_CLASS_METHODS.contains(&name),
        _ => false,
    }
}

/// Attribute lookup on the class object itself
pub fn class_has(owner: &str, name: &str) -> bool {
    is_class_method(owner, name) || instance_methods(owner).contains(&name)
}

fn kind(t: &Temporal) -> &'static str {
    match t {
        Temporal::DateTime(_) => "datetime",
        Temporal::Date(_) => "date",
        Temporal::Delta(_) => "timedelta",
    }
}

pub fn has_method(t: &Temporal, name: &str) -> bool {
    instance_methods(kind(t)).contains(&name)
}

// ============================================================================
// Range checks and construction
// ============================================================================

fn out_of_range(what: &str) -> SafepyError {
    SafepyError::value_error(format!("{} is out of range", what))
}

fn build_date(year: i64, month: i64, day: i64) -> Result<NaiveDate> {
    if !(1..=9999).contains(&year) {
        return Err(SafepyError::value_error(format!(
            "year {} is out of range",
            year
        )));
    }
    if !(1..=12).contains(&month) {
        return Err(SafepyError::value_error("month must be in 1..12"));
    }
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .filter(|_| day >= 1)
        .ok_or_else(|| SafepyError::value_error("day is out of range for month"))
}

fn build_time(hour: i64, minute: i64, second: i64, micro: i64) -> Result<NaiveTime> {
    if !(0..24).contains(&hour) {
        return Err(SafepyError::value_error("hour must be in 0..23"));
    }
    if !(0..60).contains(&minute) {
        return Err(SafepyError::value_error("minute must be in 0..59"));
    }
    if !(0..60).contains(&second) {
        return Err(SafepyError::value_error("second must be in 0..59"));
    }
    if !(0..1_000_000).contains(&micro) {
        return Err(SafepyError::value_error("microsecond must be in 0..999999"));
    }
    NaiveTime::from_hms_micro_opt(hour as u32, minute as u32, second as u32, micro as u32)
        .ok_or_else(|| out_of_range("time"))
}

fn check_year(dt: NaiveDateTime) -> Result<NaiveDateTime> {
    if (1..=9999).contains(&dt.year()) {
        Ok(dt)
    } else {
        Err(out_of_range("date value"))
    }
}

/// Named datetime fields taken from positional slots or keywords
fn fields(mut args: Arguments, name: &str, names: &[&str], required: usize) -> Result<Vec<i64>> {
    let mut out = Vec::with_capacity(names.len());
    for (i, field) in names.iter().enumerate() {
        match args.take(i, field) {
            Some(value) => out.push(value.as_int()?),
            None if i < required => {
                return Err(SafepyError::type_error(format!(
                    "function missing required argument '{}' (pos {})",
                    field,
                    i + 1
                )))
            }
            None => out.push(0),
        }
    }
    args.between(name, 0, names.len())?;
    Ok(out)
}

const DATETIME_FIELDS: &[&str] = &[
    "year", "month", "day", "hour", "minute", "second", "microsecond",
];

fn new_datetime(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let f = fields(args, "datetime", DATETIME_FIELDS, 3)?;
    let date = build_date(f[0], f[1], f[2])?;
    let time = build_time(f[3], f[4], f[5], f[6])?;
    Ok(Value::Temporal(Temporal::DateTime(date.and_time(time))))
}

fn new_date(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let f = fields(args, "date", &DATETIME_FIELDS[..3], 3)?;
    Ok(Value::Temporal(Temporal::Date(build_date(f[0], f[1], f[2])?)))
}

/// Microseconds per unit, in positional order
const DELTA_UNITS: &[(&str, i64)] = &[
    ("days", 86_400_000_000),
    ("seconds", 1_000_000),
    ("microseconds", 1),
    ("milliseconds", 1_000),
    ("minutes", 60_000_000),
    ("hours", 3_600_000_000),
    ("weeks", 604_800_000_000),
];

/// A timedelta from a microsecond count, within Python's range
pub fn delta_from_micros(micros: i128) -> Result<Duration> {
    let limit = (MAX_DELTA_DAYS as i128 + 1) * 86_400_000_000;
    if micros >= limit || micros < -limit {
        return Err(SafepyError::overflow(format!(
            "days={}; must have magnitude <= {}",
            micros.div_euclid(86_400_000_000),
            MAX_DELTA_DAYS
        )));
    }
    Ok(Duration::microseconds(micros as i64))
}

fn new_timedelta(_: &mut Interpreter<'_>, mut args: Arguments) -> EvalResult<Value> {
    let mut whole: i128 = 0;
    let mut fraction: f64 = 0.0;
    for (i, (unit, scale)) in DELTA_UNITS.iter().enumerate() {
        match args.take(i, unit) {
            None => {}
            Some(Value::Float(f)) => {
                if !f.is_finite() {
                    return Err(SafepyError::overflow("cannot convert float to timedelta").into());
                }
                fraction += f * *scale as f64;
            }
            Some(value) => whole += value.as_int()? as i128 * *scale as i128,
        }
    }
    args.between("timedelta", 0, DELTA_UNITS.len())?;
    if fraction.abs() > 1e30 {
        return Err(SafepyError::overflow("timedelta value out of range").into());
    }
    let total = whole + fraction.round_ties_even() as i128;
    Ok(Value::Temporal(Temporal::Delta(delta_from_micros(total)?)))
}

// ============================================================================
// Attributes and instance methods
// ============================================================================

/// Data attributes such as `dt.year` or `delta.days`
pub fn attribute(t: &Temporal, name: &str) -> Option<Value> {
    let int = |v: i64| Some(Value::Int(v));
    match (t, name) {
        (Temporal::DateTime(dt), "year") => int(dt.year() as i64),
        (Temporal::DateTime(dt), "month") => int(dt.month() as i64),
        (Temporal::DateTime(dt), "day") => int(dt.day() as i64),
        (Temporal::DateTime(dt), "hour") => int(dt.hour() as i64),
        (Temporal::DateTime(dt), "minute") => int(dt.minute() as i64),
        (Temporal::DateTime(dt), "second") => int(dt.second() as i64),
        (Temporal::DateTime(dt), "microsecond") => int((dt.nanosecond() / 1000) as i64),
        (Temporal::DateTime(_), "tzinfo") => Some(Value::None),
        (Temporal::Date(d), "year") => int(d.year() as i64),
        (Temporal::Date(d), "month") => int(d.month() as i64),
        (Temporal::Date(d), "day") => int(d.day() as i64),
        (Temporal::Delta(delta), "days") => int(delta_parts(delta).0),
        (Temporal::Delta(delta), "seconds") => int(delta_parts(delta).1),
        (Temporal::Delta(delta), "microseconds") => int(delta_parts(delta).2),
        _ => None,
    }
}

/// `datetime.min`, `timedelta.max` and the like
pub fn class_attribute(owner: &str, name: &str) -> Option<Value> {
    let value = match (owner, name) {
        ("datetime", "min") => Temporal::DateTime(
            NaiveDate::from_ymd_opt(1, 1, 1)?.and_hms_opt(0, 0, 0)?,
        ),
        ("datetime", "max") => Temporal::DateTime(
            NaiveDate::from_ymd_opt(9999, 12, 31)?.and_hms_micro_opt(23, 59, 59, 999_999)?,
        ),
        ("date", "min") => Temporal::Date(NaiveDate::from_ymd_opt(1, 1, 1)?),
        ("date", "max") => Temporal::Date(NaiveDate::from_ymd_opt(9999, 12, 31)?),
        ("timedelta", "min") => Temporal::Delta(Duration::days(-MAX_DELTA_DAYS)),
        ("timedelta", "max") => Temporal::Delta(
            Duration::days(MAX_DELTA_DAYS) + Duration::microseconds(86_399_999_999),
        ),
        ("timedelta", "resolution") => Temporal::Delta(Duration::microseconds(1)),
        _ => return None,
    };
    Some(Value::Temporal(value))
}

fn isoformat(t: &Temporal, sep: &str) -> String {
    match t {
        Temporal::DateTime(dt) => {
            let micros = dt.nanosecond() / 1000;
            let base = format!(
                "{}{}{}",
                dt.format("%Y-%m-%d"),
                sep,
                dt.format("%H:%M:%S")
            );
            if micros == 0 {
                base
            } else {
                format!("{}.{:06}", base, micros)
            }
        }
        Temporal::Date(d) => d.format("%Y-%m-%d").to_string(),
        Temporal::Delta(_) => crate::value::format::to_str(&Value::Temporal(*t)),
    }
}

fn replace(t: &Temporal, mut args: Arguments) -> Result<Temporal> {
    let names: &[&str] = match t {
        Temporal::DateTime(_) => DATETIME_FIELDS,
        _ => &DATETIME_FIELDS[..3],
    };
    let current: Vec<i64> = names
        .iter()
        .map(|n| match attribute(t, n) {
            Some(Value::Int(i)) => i,
            _ => 0,
        })
        .collect();
    let mut updated = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        updated.push(match args.take(i, name) {
            Some(value) => value.as_int()?,
            None => current[i],
        });
    }
    args.between("replace", 0, names.len())?;
    let date = build_date(updated[0], updated[1], updated[2])?;
    Ok(match t {
        Temporal::DateTime(_) => Temporal::DateTime(date.and_time(build_time(
            updated[3], updated[4], updated[5], updated[6],
        )?)),
        _ => Temporal::Date(date),
    })
}

fn local_timestamp(dt: &NaiveDateTime) -> Result<f64> {
    let local = Local
        .from_local_datetime(dt)
        .earliest()
        .ok_or_else(|| out_of_range("local time"))?;
    Ok(local.timestamp_micros() as f64 / 1e6)
}

pub fn call_method(
    _: &mut Interpreter<'_>,
    t: &Temporal,
    name: &str,
    mut args: Arguments,
) -> EvalResult<Value> {
    let date_of = |t: &Temporal| match t {
        Temporal::DateTime(dt) => Some(dt.date()),
        Temporal::Date(d) => Some(*d),
        Temporal::Delta(_) => None,
    };
    let value = match (t, name) {
        (_, "strftime") => {
            let [format] = args.exact::<1>(name)?;
            Value::str(strftime(t, &format.as_str()?))
        }
        (_, "isoformat") => {
            let sep = args.take(0, "sep");
            args.between(name, 0, 1)?;
            let sep = match sep {
                Some(sep) => sep.as_str()?.to_string(),
                None => "T".to_string(),
            };
            Value::str(isoformat(t, &sep))
        }
        (_, "ctime") => {
            args.exact::<0>(name)?;
            Value::str(strftime(t, "%a %b %e %H:%M:%S %Y"))
        }
        (Temporal::DateTime(dt), "date") => {
            args.exact::<0>(name)?;
            Value::Temporal(Temporal::Date(dt.date()))
        }
        (Temporal::DateTime(dt), "timestamp") => {
            args.exact::<0>(name)?;
            Value::Float(local_timestamp(dt)?)
        }
        (_, "weekday" | "isoweekday" | "toordinal") => {
            args.exact::<0>(name)?;
            let date = date_of(t).ok_or_else(|| SafepyError::internal("timedelta weekday"))?;
            Value::Int(match name {
                "weekday" => date.weekday().num_days_from_monday() as i64,
                "isoweekday" => date.weekday().number_from_monday() as i64,
                _ => date.num_days_from_ce() as i64,
            })
        }
        (_, "replace") => Value::Temporal(replace(t, args)?),
        (Temporal::Delta(delta), "total_seconds") => {
            args.exact::<0>(name)?;
            let micros = delta
                .num_microseconds()
                .ok_or_else(|| SafepyError::overflow("timedelta too large"))?;
            Value::Float(micros as f64 / 1e6)
        }
        _ => {
            return Err(SafepyError::attribute_error(format!(
                "'{}' object has no attribute '{}'",
                kind(t),
                name
            ))
            .into())
        }
    };
    Ok(value)
}

// ============================================================================
// Class methods
// ============================================================================

fn parse_iso(text: &str) -> Option<Temporal> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .map(Temporal::DateTime)
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(Temporal::Date)
        })
}

fn strptime(text: &str, format: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, format)
        .or_else(|_| NaiveDate::parse_from_str(text, format).map(|d| d.and_time(NaiveTime::MIN)))
        .or_else(|_| {
            // time-only formats default to 1900-01-01 like Python
            NaiveTime::parse_from_str(text, format).map(|t| {
                NaiveDate::from_ymd_opt(1900, 1, 1)
                    .unwrap_or_default()
                    .and_time(t)
            })
        })
        .map_err(|_| {
            SafepyError::value_error(format!(
                "time data {} does not match format {}",
                repr(&Value::str(text)),
                repr(&Value::str(format))
            ))
        })
}

fn from_timestamp(value: &Value) -> Result<NaiveDateTime> {
    let seconds = value.as_float()?;
    if !seconds.is_finite() || seconds.abs() > 1e14 {
        return Err(SafepyError::overflow("timestamp out of range for platform time_t"));
    }
    let micros = (seconds * 1e6).round_ties_even() as i64;
    let utc = Utc
        .timestamp_micros(micros)
        .single()
        .ok_or_else(|| out_of_range("timestamp"))?;
    Ok(utc.with_timezone(&Local).naive_local())
}

pub fn call_class_method(
    _: &mut Interpreter<'_>,
    owner: &str,
    name: &str,
    args: Arguments,
) -> EvalResult<Value> {
    let date_only = owner == "date";
    let wrap = |dt: NaiveDateTime| {
        if date_only {
            Value::Temporal(Temporal::Date(dt.date()))
        } else {
            Value::Temporal(Temporal::DateTime(dt))
        }
    };
    let value = match name {
        "now" | "today" => {
            args.exact::<0>(name)?;
            wrap(Local::now().naive_local())
        }
        "utcnow" => {
            args.exact::<0>(name)?;
            wrap(Utc::now().naive_utc())
        }
        "strptime" => {
            let [text, format] = args.exact::<2>(name)?;
            wrap(check_year(strptime(&text.as_str()?, &format.as_str()?)?)?)
        }
        "fromisoformat" => {
            let [text] = args.exact::<1>(name)?;
            let text = text.as_str()?;
            let parsed = parse_iso(&text).ok_or_else(|| {
                SafepyError::value_error(format!(
                    "Invalid isoformat string: {}",
                    repr(&Value::str(text.clone()))
                ))
            })?;
            match (parsed, date_only) {
                (Temporal::DateTime(dt), false) => Value::Temporal(Temporal::DateTime(dt)),
                (Temporal::Date(d), false) => {
                    Value::Temporal(Temporal::DateTime(d.and_time(NaiveTime::MIN)))
                }
                (Temporal::Date(d), true) => Value::Temporal(Temporal::Date(d)),
                _ => {
                    return Err(SafepyError::value_error(format!(
                        "Invalid isoformat string: {}",
                        repr(&Value::str(text.clone()))
                    ))
                    .into())
                }
            }
        }
        "fromtimestamp" => {
            let [seconds] = args.exact::<1>(name)?;
            wrap(from_timestamp(&seconds)?)
        }
        "fromordinal" => {
            let [ordinal] = args.exact::<1>(name)?;
            let ordinal = ordinal.as_int()?;
            let date = i32::try_from(ordinal)
                .ok()
                .filter(|o| (1..=3_652_059).contains(o))
                .and_then(NaiveDate::from_num_days_from_ce_opt)
                .ok_or_else(|| SafepyError::value_error(format!("ordinal must be >= 1; got {}", ordinal)))?;
            Value::Temporal(Temporal::Date(date))
        }
        "combine" => {
            let values = args.between(name, 1, 2)?;
            let date = match values.first() {
                Some(Value::Temporal(Temporal::Date(d))) => *d,
                Some(Value::Temporal(Temporal::DateTime(dt))) => dt.date(),
                _ => {
                    return Err(SafepyError::type_error(
                        "combine() argument 1 must be datetime.date",
                    )
                    .into())
                }
            };
            let time = match values.get(1) {
                Some(Value::Temporal(Temporal::DateTime(dt))) => dt.time(),
                None => NaiveTime::MIN,
                Some(_) => {
                    return Err(SafepyError::type_error(
                        "combine() argument 2 must be a datetime",
                    )
                    .into())
                }
            };
            Value::Temporal(Temporal::DateTime(date.and_time(time)))
        }
        _ => {
            return Err(SafepyError::attribute_error(format!(
                "type object '{}' has no attribute '{}'",
                owner, name
            ))
            .into())
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_build_date_validates_fields() {
        assert!(build_date(2024, 2, 29).is_ok());
        let err = build_date(2023, 2, 29).unwrap_err();
        assert_eq!(err.message(), "ValueError: day is out of range for month");
        assert!(build_date(0, 1, 1).is_err());
        assert!(build_date(2024, 13, 1).is_err());
    }

    #[test]
    fn test_isoformat_and_parse_agree() {
        let t = Temporal::DateTime(dt(2024, 1, 2, 3, 4, 5));
        assert_eq!(isoformat(&t, "T"), "2024-01-02T03:04:05");
        assert_eq!(parse_iso("2024-01-02T03:04:05"), Some(t));
        assert_eq!(
            parse_iso("2024-01-02"),
            Some(Temporal::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()))
        );
        assert_eq!(parse_iso("02/01/2024"), None);
    }

    #[test]
    fn test_strptime_date_only_format() {
        let parsed = strptime("2024-03-15", "%Y-%m-%d").unwrap();
        assert_eq!(parsed, dt(2024, 3, 15, 0, 0, 0));
        let err = strptime("15/03", "%Y-%m-%d").unwrap_err();
        assert!(err.message().starts_with("ValueError: time data '15/03'"));
    }

    #[test]
    fn test_delta_attributes_are_normalised() {
        let delta = Temporal::Delta(Duration::seconds(-1));
        assert!(matches!(attribute(&delta, "days"), Some(Value::Int(-1))));
        assert!(matches!(attribute(&delta, "seconds"), Some(Value::Int(86399))));
    }

    #[test]
    fn test_delta_range() {
        assert!(delta_from_micros(86_400_000_000 * 1_000_000_000).is_err());
        assert!(delta_from_micros(86_400_000_000 * 999_999_999).is_ok());
    }

    #[test]
    fn test_class_attribute_bounds() {
        assert!(class_attribute("date", "max").is_some());
        assert!(class_attribute("timedelta", "resolution").is_some());
        assert!(class_attribute("date", "nope").is_none());
    }
}
