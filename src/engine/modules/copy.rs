//! `copy` module

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::engine::{EvalResult, Interpreter};
use crate::error::Result;
use crate::stack::ensure_sufficient_stack;
use crate::value::{Arguments, Dict, ListCell, Module, Set, Value};

pub fn module() -> Module {
    Module::new("copy")
        .function("copy", copy)
        .function("deepcopy", deepcopy)
}

/// New top-level container sharing the same elements
pub fn shallow(value: &Value) -> Value {
    match value {
        Value::List(items) => Value::list(items.borrow().clone()),
        Value::Dict(dict) => Value::dict(dict.borrow().clone()),
        Value::Set(set) => Value::set(set.borrow().clone()),
        other => other.clone(),
    }
}

/// Recursive copy; shared and cyclic references are reproduced, not duplicated
pub fn deep(value: &Value) -> Result<Value> {
    Deep::default().copy(value)
}

#[derive(Default)]
struct Deep {
    memo: HashMap<usize, Value>,
}

impl Deep {
    fn copy(&mut self, value: &Value) -> Result<Value> {
        ensure_sufficient_stack(|| self.copy_inner(value))
    }

    fn copy_inner(&mut self, value: &Value) -> Result<Value> {
        if let Some(id) = value.identity() {
            if let Some(done) = self.memo.get(&id) {
                return Ok(done.clone());
            }
        }
        let copied = match value {
            Value::List(items) => {
                let target = Rc::new(ListCell(RefCell::new(Vec::new())));
                self.remember(value, Value::List(target.clone()));
                let source = items.borrow().clone();
                let mut out = Vec::with_capacity(source.len());
                for item in &source {
                    out.push(self.copy(item)?);
                }
                *target.borrow_mut() = out;
                Value::List(target)
            }
            Value::Dict(dict) => {
                let target = Rc::new(RefCell::new(Dict::with_flavor(dict.borrow().flavor.clone())));
                self.remember(value, Value::Dict(target.clone()));
                let items = dict.borrow().items();
                for (key, item) in items {
                    let item = self.copy(&item)?;
                    target.borrow_mut().insert(key, item)?;
                }
                Value::Dict(target)
            }
            Value::Set(set) => {
                // set elements are hashable, hence immutable
                Value::set(Set::from_values(set.borrow().items())?)
            }
            Value::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(self.copy(item)?);
                }
                Value::tuple(out)
            }
            other => other.clone(),
        };
        self.remember(value, copied.clone());
        Ok(copied)
    }

    fn remember(&mut self, original: &Value, copy: Value) {
        if let Some(id) = original.identity() {
            self.memo.insert(id, copy);
        }
    }
}

fn copy(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("copy")?;
    Ok(shallow(&value))
}

fn deepcopy(_: &mut Interpreter<'_>, args: Arguments) -> EvalResult<Value> {
    let [value] = args.exact::<1>("deepcopy")?;
    Ok(deep(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_copy_detaches_nested_lists() {
        let inner = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![inner.clone(), inner.clone()]);
        let copied = deep(&outer).unwrap();
        if let Value::List(inner) = &inner {
            inner.borrow_mut().push(Value::Int(2));
        }
        assert_eq!(copied.to_string(), "[[1], [1]]");
        // aliasing inside the copy is preserved
        let Value::List(items) = &copied else { panic!("not a list") };
        let items = items.borrow();
        assert!(items[0].is(&items[1]));
    }

    #[test]
    fn test_deep_copy_of_cycle_terminates() {
        let list = Value::list(vec![]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        let copied = deep(&list).unwrap();
        let Value::List(items) = &copied else { panic!("not a list") };
        assert!(items.borrow()[0].is(&copied));
        // break the cycles so the test does not leak
        items.borrow_mut().clear();
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_shallow_copy_shares_elements() {
        let inner = Value::list(vec![]);
        let outer = Value::list(vec![inner.clone()]);
        let copied = shallow(&outer);
        assert!(!copied.is(&outer));
        let Value::List(items) = &copied else { panic!("not a list") };
        assert!(items.borrow()[0].is(&inner));
    }
}
