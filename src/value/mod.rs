//! Runtime values of the sandboxed language
//!
//! Containers are reference counted and interior mutable so that aliasing
//! behaves like Python (`b = a; b.append(1)` is visible through `a`). The
//! interpreter is single threaded, so `Rc`/`RefCell` is used throughout and
//! values are deliberately `!Send`.

pub mod dict;
pub mod format;
pub mod json;

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::context::ScopeRef;
use crate::engine::{EvalResult, Interpreter};
use crate::error::{Result, SafepyError};
use crate::parser::ast::FunctionDef;

pub use dict::{Dict, DictFlavor, HashKey, Set};

/// A runtime value
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<ListCell>),
    Tuple(Rc<TupleItems>),
    Dict(Rc<RefCell<Dict>>),
    Set(Rc<RefCell<Set>>),
    Range(Range),
    Iterator(Rc<RefCell<IterState>>),
    Function(Rc<Function>),
    Builtin(Builtin),
    Tool(Tool),
    Method(Rc<BoundMethod>),
    Partial(Rc<Partial>),
    Module(Rc<Module>),
    Pattern(Rc<Pattern>),
    Match(Rc<MatchData>),
    Temporal(Temporal),
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(ListCell(RefCell::new(items))))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(TupleItems(items)))
    }

    pub fn dict(dict: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn set(set: Set) -> Value {
        Value::Set(Rc::new(RefCell::new(set)))
    }

    pub fn iterator(kind: &'static str, items: impl IntoIterator<Item = Value>) -> Value {
        Value::Iterator(Rc::new(RefCell::new(IterState {
            kind,
            source: IterSource::Items(items.into_iter().collect()),
        })))
    }

    /// Python type name, as reported in error messages and by `type()`
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(d) => match d.borrow().flavor {
                DictFlavor::Plain => "dict",
                DictFlavor::Counter => "Counter",
                DictFlavor::DefaultDict(_) => "defaultdict",
            },
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Iterator(it) => it.borrow().kind,
            Value::Function(_) => "function",
            Value::Builtin(b) => match b.kind {
                BuiltinKind::Function => "builtin_function_or_method",
                BuiltinKind::Type => "type",
            },
            Value::Tool(_) => "tool",
            Value::Method(_) => "method",
            Value::Partial(_) => "functools.partial",
            Value::Module(_) => "module",
            Value::Pattern(_) => "re.Pattern",
            Value::Match(_) => "re.Match",
            Value::Temporal(Temporal::DateTime(_)) => "datetime",
            Value::Temporal(Temporal::Date(_)) => "date",
            Value::Temporal(Temporal::Delta(_)) => "timedelta",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Set(s) => !s.borrow().is_empty(),
            Value::Range(r) => r.len() > 0,
            Value::Temporal(Temporal::Delta(d)) => !d.is_zero(),
            _ => true,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Builtin(_)
                | Value::Tool(_)
                | Value::Method(_)
                | Value::Partial(_)
        )
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Integer view of a value, accepting `bool` like Python does
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(*b as i64),
            other => Err(SafepyError::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            ))),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Bool(b) => Ok(*b as i64 as f64),
            Value::Float(f) => Ok(*f),
            other => Err(SafepyError::type_error(format!(
                "must be real number, not {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_str(&self) -> Result<Rc<str>> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            other => Err(SafepyError::type_error(format!(
                "expected str, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    /// Iterate the value. Lists, tuples and dicts are snapshotted; ranges
    /// and iterator objects are consumed lazily.
    pub fn iter(&self) -> Result<ValueIter> {
        let items: Vec<Value> = match self {
            Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
            Value::List(l) => l.borrow().clone(),
            Value::Tuple(t) => t.to_vec(),
            Value::Dict(d) => d.borrow().keys(),
            Value::Set(s) => s.borrow().items(),
            Value::Range(r) => {
                return Ok(ValueIter::Range {
                    next: r.start,
                    remaining: r.len(),
                    step: r.step,
                })
            }
            Value::Iterator(it) => return Ok(ValueIter::Shared(it.clone())),
            other => {
                return Err(SafepyError::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        };
        Ok(ValueIter::Items(items.into_iter()))
    }

    /// Number of items for sized values
    pub fn len(&self) -> Result<usize> {
        match self {
            Value::Str(s) => Ok(s.chars().count()),
            Value::List(l) => Ok(l.borrow().len()),
            Value::Tuple(t) => Ok(t.len()),
            Value::Dict(d) => Ok(d.borrow().len()),
            Value::Set(s) => Ok(s.borrow().len()),
            Value::Range(r) => match i64::try_from(r.len()) {
                Ok(len) => Ok(len as usize),
                Err(_) => Err(SafepyError::overflow(
                    "Python int too large to convert to C ssize_t",
                )),
            },
            other => Err(SafepyError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        }
    }

    /// Python `==`
    pub fn equals(&self, other: &Value) -> bool {
        crate::stack::ensure_sufficient_stack(|| self.equals_inner(other))
    }

    fn equals_inner(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (a, b) if a.is_number() && b.is_number() => match (a, b) {
                (Value::Float(_), _) | (_, Value::Float(_)) => {
                    a.as_float().ok() == b.as_float().ok()
                }
                _ => a.as_int().ok() == b.as_int().ok(),
            },
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_equals(&a.borrow(), &b.borrow())
            }
            (Value::Tuple(a), Value::Tuple(b)) => seq_equals(a, b),
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| match b.get(k) {
                        Ok(Some(other)) => v.equals(&other),
                        _ => false,
                    })
            }
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|v| b.contains(v).unwrap_or(false))
            }
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            (Value::Temporal(a), Value::Temporal(b)) => a == b,
            (a, b) => a.identity().is_some() && a.identity() == b.identity(),
        }
    }

    /// Address used for `is` and for hashing objects without value equality
    pub fn identity(&self) -> Option<usize> {
        let ptr = match self {
            Value::List(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Dict(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Set(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Tuple(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Str(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Iterator(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Function(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Tool(tool) => Rc::as_ptr(&tool.func) as *const () as usize,
            Value::Method(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Partial(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Module(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Pattern(rc) => Rc::as_ptr(rc) as *const () as usize,
            Value::Match(rc) => Rc::as_ptr(rc) as *const () as usize,
            _ => return None,
        };
        Some(ptr)
    }

    /// Python `is`
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            (a, b) => a.identity().is_some() && a.identity() == b.identity(),
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=` and sorting. `Ok(None)` means the
    /// operands are comparable but unordered (NaN).
    pub fn compare(&self, other: &Value, op: &str) -> Result<Option<Ordering>> {
        crate::stack::ensure_sufficient_stack(|| self.compare_inner(other, op))
    }

    fn compare_inner(&self, other: &Value, op: &str) -> Result<Option<Ordering>> {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => match (a, b) {
                (Value::Float(_), _) | (_, Value::Float(_)) => {
                    Ok(a.as_float()?.partial_cmp(&b.as_float()?))
                }
                _ => Ok(Some(a.as_int()?.cmp(&b.as_int()?))),
            },
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) => seq_compare(&a.borrow(), &b.borrow(), op),
            (Value::Tuple(a), Value::Tuple(b)) => seq_compare(a, b, op),
            (Value::Temporal(a), Value::Temporal(b))
                if std::mem::discriminant(a) == std::mem::discriminant(b) =>
            {
                Ok(a.partial_cmp(b))
            }
            (a, b) => Err(SafepyError::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op,
                a.type_name(),
                b.type_name()
            ))),
        }
    }
}

fn seq_equals(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
}

fn seq_compare(a: &[Value], b: &[Value], op: &str) -> Result<Option<Ordering>> {
    for (x, y) in a.iter().zip(b) {
        if !x.equals(y) {
            return x.compare(y, op);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format::repr(self))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format::to_str(self))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        json::from_json(json)
    }
}

// ============================================================================
// Container storage and dropping
// ============================================================================

/// Storage behind a `list` value
pub struct ListCell(pub(crate) RefCell<Vec<Value>>);

impl Deref for ListCell {
    type Target = RefCell<Vec<Value>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for ListCell {
    fn drop(&mut self) {
        release(std::mem::take(self.0.get_mut()));
    }
}

/// Storage behind a `tuple` value
pub struct TupleItems(Vec<Value>);

impl Deref for TupleItems {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl Drop for TupleItems {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.0));
    }
}

/// Drop values through a worklist. A container referenced only from the
/// worklist has its children moved onto it before it is freed, so a
/// program that nests a million lists does not overflow the native stack
/// when the outermost one goes away.
pub(crate) fn release(mut pending: Vec<Value>) {
    while let Some(value) = pending.pop() {
        match value {
            Value::List(list) => {
                if Rc::strong_count(&list) == 1 {
                    if let Ok(mut items) = list.try_borrow_mut() {
                        pending.append(&mut items);
                    }
                }
            }
            Value::Tuple(mut tuple) => {
                if let Some(items) = Rc::get_mut(&mut tuple) {
                    pending.append(&mut items.0);
                }
            }
            Value::Dict(dict) => {
                if Rc::strong_count(&dict) == 1 {
                    if let Ok(mut dict) = dict.try_borrow_mut() {
                        pending.extend(dict.take_values());
                    }
                }
            }
            Value::Iterator(state) => {
                if Rc::strong_count(&state) == 1 {
                    if let Ok(mut state) = state.try_borrow_mut() {
                        pending.extend(state.take_values());
                    }
                }
            }
            Value::Function(mut function) => {
                if let Some(function) = Rc::get_mut(&mut function) {
                    pending.extend(function.take_values());
                }
            }
            Value::Method(mut method) => {
                if let Some(method) = Rc::get_mut(&mut method) {
                    pending.push(std::mem::replace(&mut method.receiver, Value::None));
                }
            }
            Value::Partial(mut partial) => {
                if let Some(partial) = Rc::get_mut(&mut partial) {
                    pending.extend(partial.take_values());
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// Call arguments
// ============================================================================

/// Evaluated arguments of a call
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl Arguments {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    /// Remove and return a keyword argument
    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let index = self.keywords.iter().position(|(k, _)| k == name)?;
        Some(self.keywords.remove(index).1)
    }

    /// Fail if any keyword arguments remain unconsumed
    pub fn finish(&self, function: &str) -> Result<()> {
        match self.keywords.first() {
            Some((name, _)) => Err(SafepyError::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                function, name
            ))),
            None => Ok(()),
        }
    }

    /// Exactly `N` positional arguments and no keywords
    pub fn exact<const N: usize>(self, function: &str) -> Result<[Value; N]> {
        self.finish(function)?;
        let given = self.positional.len();
        self.positional.try_into().map_err(|_| {
            SafepyError::type_error(format!(
                "{}() takes exactly {} argument{} ({} given)",
                function,
                N,
                if N == 1 { "" } else { "s" },
                given
            ))
        })
    }

    /// Between `min` and `max` positional arguments and no keywords
    pub fn between(self, function: &str, min: usize, max: usize) -> Result<Vec<Value>> {
        self.finish(function)?;
        let given = self.positional.len();
        if given < min || given > max {
            let (bound, count) = if min == max {
                ("exactly", min)
            } else if given < min {
                ("at least", min)
            } else {
                ("at most", max)
            };
            return Err(SafepyError::type_error(format!(
                "{}() takes {} {} argument{} ({} given)",
                function,
                bound,
                count,
                if count == 1 { "" } else { "s" },
                given
            )));
        }
        Ok(self.positional)
    }

    /// Positional argument at `index`, or the keyword `name`
    pub fn take(&mut self, index: usize, name: &str) -> Option<Value> {
        if index < self.positional.len() {
            return Some(std::mem::replace(&mut self.positional[index], Value::None));
        }
        self.take_keyword(name)
    }
}

// ============================================================================
// Callables
// ============================================================================

/// A user-defined function or lambda
pub struct Function {
    pub def: Rc<FunctionDef>,
    /// Evaluated defaults, aligned with `def.params.positional`
    pub defaults: Vec<Option<Value>>,
    /// Evaluated defaults, aligned with `def.params.kwonly`
    pub kw_defaults: Vec<Option<Value>>,
    /// Scope the function was defined in; `None` at module level
    pub closure: Option<ScopeRef>,
}

pub type BuiltinFn = fn(&mut Interpreter<'_>, Arguments) -> EvalResult<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Function,
    /// A constructor that also names a type, such as `int` or `datetime`
    Type,
}

/// A function implemented natively by the interpreter
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
    pub kind: BuiltinKind,
}

impl Builtin {
    pub fn function(name: &'static str, func: BuiltinFn) -> Self {
        Self {
            name,
            func,
            kind: BuiltinKind::Function,
        }
    }

    pub fn class(name: &'static str, func: BuiltinFn) -> Self {
        Self {
            name,
            func,
            kind: BuiltinKind::Type,
        }
    }
}

pub type ToolFn = dyn Fn(Arguments) -> Result<Value>;

/// A host function exposed to evaluated code
#[derive(Clone)]
pub struct Tool {
    name: Rc<str>,
    func: Rc<ToolFn>,
}

impl Tool {
    pub fn new(func: impl Fn(Arguments) -> Result<Value> + 'static) -> Self {
        Self {
            name: Rc::from("tool"),
            func: Rc::new(func),
        }
    }

    pub(crate) fn named(mut self, name: &str) -> Self {
        self.name = Rc::from(name);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: Arguments) -> Result<Value> {
        (self.func)(args)
    }
}

impl Function {
    fn take_values(&mut self) -> Vec<Value> {
        let mut values: Vec<Value> = self
            .defaults
            .drain(..)
            .chain(self.kw_defaults.drain(..))
            .flatten()
            .collect();
        if let Some(scope) = self.closure.take() {
            if Rc::strong_count(&scope) == 1 {
                if let Ok(mut scope) = scope.try_borrow_mut() {
                    values.extend(scope.take_values());
                }
            }
        }
        values
    }
}

impl Drop for Function {
    fn drop(&mut self) {
        release(self.take_values());
    }
}

/// A method looked up on a receiver, such as `"a,b".split`
pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

impl Drop for BoundMethod {
    fn drop(&mut self) {
        if !matches!(self.receiver, Value::None) {
            release(vec![std::mem::replace(&mut self.receiver, Value::None)]);
        }
    }
}

/// `functools.partial` object
pub struct Partial {
    pub func: Value,
    pub args: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl Partial {
    fn take_values(&mut self) -> Vec<Value> {
        let mut values = std::mem::take(&mut self.args);
        values.extend(self.keywords.drain(..).map(|(_, value)| value));
        values.push(std::mem::replace(&mut self.func, Value::None));
        values
    }
}

impl Drop for Partial {
    fn drop(&mut self) {
        release(self.take_values());
    }
}

/// An imported native module
pub struct Module {
    pub name: &'static str,
    pub members: BTreeMap<&'static str, Value>,
}

impl Module {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            members: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &'static str, value: Value) -> Self {
        self.members.insert(name, value);
        self
    }

    pub fn function(self, name: &'static str, func: BuiltinFn) -> Self {
        self.with(name, Value::Builtin(Builtin::function(name, func)))
    }

    pub fn class(self, name: &'static str, func: BuiltinFn) -> Self {
        self.with(name, Value::Builtin(Builtin::class(name, func)))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.members.get(name).cloned()
    }
}

// ============================================================================
// Sequences and iteration
// ============================================================================

/// `range(start, stop, step)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> u64 {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let len = if step > 0 && start < stop {
            (stop - start + step - 1) / step
        } else if step < 0 && start > stop {
            (start - stop - step - 1) / -step
        } else {
            0
        };
        len as u64
    }

    pub fn get(&self, index: u64) -> i64 {
        (self.start as i128 + index as i128 * self.step as i128) as i64
    }

    pub fn contains(&self, value: i64) -> bool {
        let (value, start, step) = (value as i128, self.start as i128, self.step as i128);
        let in_bounds = if step > 0 {
            value >= start && value < self.stop as i128
        } else {
            value <= start && value > self.stop as i128
        };
        in_bounds && (value - start) % step == 0
    }
}

/// State behind an iterator object such as the result of `map` or `iter`
pub struct IterState {
    pub kind: &'static str,
    pub source: IterSource,
}

pub enum IterSource {
    Items(VecDeque<Value>),
    Range { next: i64, remaining: u64, step: i64 },
}

impl Drop for IterState {
    fn drop(&mut self) {
        release(self.take_values());
    }
}

impl IterState {
    fn take_values(&mut self) -> Vec<Value> {
        match &mut self.source {
            IterSource::Items(items) => items.drain(..).collect(),
            IterSource::Range { .. } => Vec::new(),
        }
    }

    pub fn next_value(&mut self) -> Option<Value> {
        match &mut self.source {
            IterSource::Items(items) => items.pop_front(),
            IterSource::Range {
                next,
                remaining,
                step,
            } => {
                if *remaining == 0 {
                    return None;
                }
                let value = *next;
                *remaining -= 1;
                *next = next.wrapping_add(*step);
                Some(Value::Int(value))
            }
        }
    }

    pub fn remaining(&self) -> u64 {
        match &self.source {
            IterSource::Items(items) => items.len() as u64,
            IterSource::Range { remaining, .. } => *remaining,
        }
    }
}

/// Iteration over any iterable value
pub enum ValueIter {
    Items(std::vec::IntoIter<Value>),
    Range { next: i64, remaining: u64, step: i64 },
    Shared(Rc<RefCell<IterState>>),
}

impl ValueIter {
    /// Upper bound on the number of items left
    pub fn remaining(&self) -> u64 {
        match self {
            ValueIter::Items(items) => items.len() as u64,
            ValueIter::Range { remaining, .. } => *remaining,
            ValueIter::Shared(state) => state.borrow().remaining(),
        }
    }
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Items(items) => items.next(),
            ValueIter::Range {
                next,
                remaining,
                step,
            } => {
                if *remaining == 0 {
                    return None;
                }
                let value = *next;
                *remaining -= 1;
                *next = next.wrapping_add(*step);
                Some(Value::Int(value))
            }
            ValueIter::Shared(state) => state.borrow_mut().next_value(),
        }
    }
}

// ============================================================================
// re and datetime objects
// ============================================================================

/// A compiled `re` pattern
#[derive(Debug)]
pub struct Pattern {
    /// Pattern text as written by the program
    pub source: String,
    pub flags: i64,
    pub regex: regex::Regex,
}

/// Result of a successful `re` match
pub struct MatchData {
    pub haystack: Rc<str>,
    /// Byte spans of each group, group 0 being the whole match
    pub spans: Vec<Option<(usize, usize)>>,
    pub pattern: Rc<Pattern>,
}

impl MatchData {
    pub fn group(&self, index: usize) -> Option<Value> {
        let span = self.spans.get(index)?;
        Some(match span {
            Some((start, end)) => Value::str(&self.haystack[*start..*end]),
            None => Value::None,
        })
    }

    pub fn group_index(&self, key: &Value) -> Result<usize> {
        let index = match key {
            Value::Int(i) if *i >= 0 => Some(*i as usize),
            Value::Str(name) => self
                .pattern
                .regex
                .capture_names()
                .position(|n| n == Some(&**name)),
            _ => None,
        };
        index
            .filter(|i| *i < self.spans.len())
            .ok_or_else(|| SafepyError::index_error("no such group"))
    }

    /// Character offset of a byte offset in the haystack
    pub fn char_offset(&self, byte: usize) -> i64 {
        self.haystack[..byte].chars().count() as i64
    }
}

/// `datetime.datetime`, `datetime.date` and `datetime.timedelta` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Temporal {
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Delta(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
        assert!(Value::Bool(true).equals(&Value::Int(1)));
        assert!(!Value::Int(1).equals(&Value::str("1")));
    }

    #[test]
    fn test_container_equality_is_structural() {
        let a = Value::list(vec![Value::Int(1), Value::tuple(vec![Value::str("x")])]);
        let b = Value::list(vec![Value::Int(1), Value::tuple(vec![Value::str("x")])]);
        assert!(a.equals(&b));
        assert!(!a.is(&b));
        assert!(a.is(&a.clone()));
    }

    #[test]
    fn test_compare_sequences_and_mismatch() {
        let a = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::tuple(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(a.compare(&b, "<").unwrap(), Some(Ordering::Less));

        let err = Value::Int(1).compare(&Value::str("a"), "<").unwrap_err();
        assert!(err.message().contains("'<' not supported"));
        assert_eq!(
            Value::Float(f64::NAN).compare(&Value::Int(1), "<").unwrap(),
            None
        );
    }

    #[test]
    fn test_range_len_and_contains() {
        let r = Range {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert_eq!(r.len(), 4);
        assert!(r.contains(9));
        assert!(!r.contains(10));

        let down = Range {
            start: 5,
            stop: 0,
            step: -2,
        };
        assert_eq!(down.len(), 3);
        assert_eq!(down.get(2), 1);

        let full = Value::Range(Range {
            start: i64::MIN,
            stop: i64::MAX,
            step: 1,
        });
        let err = full.len().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Arithmetic);
        assert!(full.truthy());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.truthy());
        assert!(!Value::str("").truthy());
        assert!(Value::list(vec![Value::None]).truthy());
        assert!(!Value::dict(Dict::new()).truthy());
    }

    #[test]
    fn test_arguments_exact() {
        let args = Arguments::new(vec![Value::Int(1), Value::Int(2)]);
        let [a, b] = args.exact::<2>("pair").unwrap();
        assert!(a.equals(&Value::Int(1)));
        assert!(b.equals(&Value::Int(2)));

        let err = Arguments::new(vec![]).exact::<1>("len").unwrap_err();
        assert!(err.message().contains("len() takes exactly 1 argument (0 given)"));

        let two = Arguments::new(vec![Value::Int(1), Value::Int(2)]);
        let err = two.between("final_answer", 0, 1).unwrap_err();
        assert_eq!(
            err.message(),
            "TypeError: final_answer() takes at most 1 argument (2 given)"
        );
        let err = Arguments::new(vec![]).between("pow", 2, 3).unwrap_err();
        assert!(err.message().contains("takes at least 2 arguments (0 given)"));
    }

    #[test]
    fn test_deeply_nested_containers_drop() {
        let mut list = Value::list(vec![]);
        let mut tuple = Value::tuple(vec![]);
        let mut dict = Value::dict(Dict::new());
        for i in 0..1_000_000 {
            list = Value::list(vec![list]);
            tuple = Value::tuple(vec![Value::Int(i), tuple]);
            let mut next = Dict::new();
            next.insert(Value::Int(i), dict).unwrap();
            dict = Value::dict(next);
        }
        let key = HashKey::of(&tuple).unwrap();
        assert_eq!(key, HashKey::of(&tuple.clone()).unwrap());
        drop(key);
        drop(list);
        drop(tuple);
        drop(dict);
    }

    #[test]
    fn test_release_keeps_shared_children() {
        let shared = Value::list(vec![Value::Int(7)]);
        let outer = Value::list(vec![shared.clone(), Value::tuple(vec![shared.clone()])]);
        drop(outer);
        assert_eq!(shared.len().unwrap(), 1);
    }

    #[test]
    fn test_shared_iterator_is_consumed_once() {
        let it = Value::iterator("list_iterator", vec![Value::Int(1), Value::Int(2)]);
        let first: Vec<Value> = it.iter().unwrap().take(1).collect();
        let rest: Vec<Value> = it.iter().unwrap().collect();
        assert_eq!(first.len(), 1);
        assert_eq!(rest.len(), 1);
    }
}
