//! Binding environment for evaluated programs
//!
//! The environment keeps a persistent layer that survives across `execute`
//! calls (injected variables, module-level assignments and tools) and hands
//! out ephemeral [`Scope`]s for function bodies and comprehensions.
//!
//! Name resolution walks the scope chain, then the persistent globals, then
//! the registered tools and finally the builtin table.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::engine::builtins;
use crate::error::{Result, SafepyError};
use crate::value::{Tool, Value};

/// Shared handle to a scope; closures keep their defining scope alive
pub type ScopeRef = Rc<RefCell<Scope>>;

/// A function-call or comprehension scope
#[derive(Default)]
pub struct Scope {
    vars: HashMap<String, Value>,
    parent: Option<ScopeRef>,
}

impl Scope {
    /// Create a scope nested inside `parent` (`None` means module level)
    pub fn child(parent: Option<ScopeRef>) -> ScopeRef {
        Rc::new(RefCell::new(Scope {
            vars: HashMap::new(),
            parent,
        }))
    }

    /// Look a name up in this scope and its enclosing scopes
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.get(name) {
            return Some(value.clone());
        }
        let mut next = self.parent.clone();
        while let Some(scope) = next {
            let scope = scope.borrow();
            if let Some(value) = scope.vars.get(name) {
                return Some(value.clone());
            }
            next = scope.parent.clone();
        }
        None
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub(crate) fn take_values(&mut self) -> Vec<Value> {
        self.vars.drain().map(|(_, value)| value).collect()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        crate::value::release(self.take_values());
    }
}

/// Persistent bindings of one executor
pub struct Environment {
    /// Module-level bindings, including injected variables
    globals: HashMap<String, Value>,

    /// Injected variables as originally defined, restored by [`reset`](Self::reset)
    injected: BTreeMap<String, Value>,

    /// Host callables; evaluated code may call but not rebind them
    tools: BTreeMap<String, Value>,

    builtins: HashMap<&'static str, Value>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            globals: HashMap::new(),
            injected: BTreeMap::new(),
            tools: BTreeMap::new(),
            builtins: builtins::table(),
        }
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a name as seen from `scope`
    pub fn lookup(&self, scope: Option<&ScopeRef>, name: &str) -> Result<Value> {
        if let Some(scope) = scope {
            if let Some(value) = scope.borrow().get(name) {
                return Ok(value);
            }
        }
        self.globals
            .get(name)
            .or_else(|| self.tools.get(name))
            .or_else(|| self.builtins.get(name))
            .cloned()
            .ok_or_else(|| SafepyError::Name(format!("name '{}' is not defined", name)))
    }

    /// Bind a name in the innermost scope, or at module level
    pub fn define(&mut self, scope: Option<&ScopeRef>, name: &str, value: Value) -> Result<()> {
        self.check_not_tool(name, "assign to")?;
        match scope {
            Some(scope) => scope.borrow_mut().set(name, value),
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    /// `del name`
    pub fn delete(&mut self, scope: Option<&ScopeRef>, name: &str) -> Result<()> {
        self.check_not_tool(name, "delete")?;
        let removed = match scope {
            Some(scope) => scope.borrow_mut().remove(name),
            None => self.globals.remove(name),
        };
        removed
            .map(|_| ())
            .ok_or_else(|| SafepyError::Name(format!("name '{}' is not defined", name)))
    }

    fn check_not_tool(&self, name: &str, action: &str) -> Result<()> {
        if self.tools.contains_key(name) {
            return Err(SafepyError::RuntimeRestriction(format!(
                "cannot {} '{}': it is a registered tool",
                action, name
            )));
        }
        Ok(())
    }

    /// Inject a variable from the host
    pub fn define_variable(&mut self, name: &str, value: Value) -> Result<()> {
        self.check_not_tool(name, "define variable")?;
        tracing::debug!(name, kind = value.type_name(), "variable injected");
        self.injected.insert(name.to_string(), value.clone());
        self.globals.insert(name.to_string(), value);
        Ok(())
    }

    /// Register a host tool, replacing any variable of the same name
    pub fn define_tool(&mut self, name: &str, tool: Tool) {
        tracing::debug!(name, "tool registered");
        self.globals.remove(name);
        self.injected.remove(name);
        self.tools
            .insert(name.to_string(), Value::Tool(tool.named(name)));
    }

    pub fn is_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    /// A persistent binding, if any
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Names bound at module level, sorted
    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.globals.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Drop program-created globals; tools and injected variables stay
    pub fn reset(&mut self) {
        self.globals = self
            .injected
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }

    /// Human readable listing of the persistent layer
    pub fn display(&self) -> String {
        let mut output = String::new();

        output.push_str("Variables\n");
        output.push_str("---------\n");
        for name in self.variable_names() {
            if let Some(value) = self.globals.get(&name) {
                let mut text = value.to_string();
                if text.chars().count() > 60 {
                    text = text.chars().take(57).collect::<String>() + "...";
                }
                output.push_str(&format!("  {} = {}\n", name, text));
            }
        }

        if !self.tools.is_empty() {
            output.push_str("\nTools:\n");
            for name in self.tools.keys() {
                output.push_str(&format!("  {}\n", name));
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_order() {
        let mut env = Environment::new();
        env.define(None, "x", Value::Int(1)).unwrap();

        let outer = Scope::child(None);
        outer.borrow_mut().set("y", Value::Int(2));
        let inner = Scope::child(Some(outer.clone()));

        assert_eq!(env.lookup(Some(&inner), "x").unwrap().as_int().unwrap(), 1);
        assert_eq!(env.lookup(Some(&inner), "y").unwrap().as_int().unwrap(), 2);
        assert!(env.lookup(Some(&inner), "len").unwrap().is_callable());
        assert!(matches!(
            env.lookup(Some(&inner), "missing"),
            Err(SafepyError::Name(_))
        ));
    }

    #[test]
    fn test_writes_go_to_innermost_scope() {
        let mut env = Environment::new();
        let scope = Scope::child(None);
        env.define(Some(&scope), "local", Value::Int(5)).unwrap();
        assert!(env.variable("local").is_none());
        assert!(scope.borrow().contains("local"));
    }

    #[test]
    fn test_shadowing_builtin_keeps_table() {
        let mut env = Environment::new();
        env.define(None, "len", Value::Int(3)).unwrap();
        assert_eq!(env.lookup(None, "len").unwrap().as_int().unwrap(), 3);
        env.delete(None, "len").unwrap();
        assert!(env.lookup(None, "len").unwrap().is_callable());
    }

    #[test]
    fn test_tools_cannot_be_rebound() {
        let mut env = Environment::new();
        env.define_variable("search", Value::Int(1)).unwrap();
        env.define_tool("search", Tool::new(|_| Ok(Value::None)));

        assert!(env.variable("search").is_none());
        let err = env.define(None, "search", Value::Int(2)).unwrap_err();
        assert!(err.message().contains("registered tool"));
        assert!(env.delete(None, "search").is_err());
        assert!(env.define_variable("search", Value::Int(2)).is_err());
    }

    #[test]
    fn test_reset_restores_injected_variables() {
        let mut env = Environment::new();
        env.define_variable("limit", Value::Int(10)).unwrap();
        env.define(None, "limit", Value::Int(99)).unwrap();
        env.define(None, "scratch", Value::None).unwrap();
        env.define_tool("lookup", Tool::new(|_| Ok(Value::None)));

        env.reset();
        assert_eq!(env.variable("limit").unwrap().as_int().unwrap(), 10);
        assert!(env.variable("scratch").is_none());
        assert!(env.is_tool("lookup"));
    }

    #[test]
    fn test_display_lists_bindings() {
        let mut env = Environment::new();
        env.define_variable("name", Value::str("safepy")).unwrap();
        env.define_tool("fetch", Tool::new(|_| Ok(Value::None)));
        let text = env.display();
        assert!(text.contains("name = safepy"));
        assert!(text.contains("fetch"));
    }
}
