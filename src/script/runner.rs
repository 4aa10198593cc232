//! Executor facade: one sandboxed session
//!
//! An [`Executor`] owns the persistent bindings, the import allow-list, the
//! print buffer and the `random` state. Each [`Executor::execute`] call runs
//! restrict, then evaluate, then capture, against that state.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::config::{ExecutorConfig, Limits};
use crate::context::Environment;
use crate::engine::{Interpreter, Interrupt};
use crate::error::{Result, SafepyError};
use crate::output::PrintBuffer;
use crate::script::validator::{restrict, ValidationIssue, ValidationOptions};
use crate::security::{policy, ImportGate};
use crate::value::json::to_json_lossy;
use crate::value::{Tool, Value};

/// Outcome of one successful `execute` call
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Value of the last executed top-level statement, or the final answer
    pub value: Value,
    /// Everything the program printed
    pub logs: String,
    /// Whether the program stopped by calling `final_answer`
    pub is_final_answer: bool,
}

impl Serialize for ExecutionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ExecutionResult", 3)?;
        state.serialize_field("value", &to_json_lossy(&self.value))?;
        state.serialize_field("logs", &self.logs)?;
        state.serialize_field("is_final_answer", &self.is_final_answer)?;
        state.end()
    }
}

/// A sandboxed evaluation session
pub struct Executor {
    env: Environment,
    imports: ImportGate,
    output: PrintBuffer,
    rng: StdRng,
    limits: Limits,
}

impl Executor {
    /// Executor with default limits; `allowed_imports` extends the built-in list
    pub fn new<I, S>(allowed_imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_config(allowed_imports, ExecutorConfig::default())
    }

    /// Executor from a config; `allowed_imports` is merged with the config's list
    pub fn with_config<I, S>(allowed_imports: I, config: ExecutorConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested: Vec<String> = allowed_imports
            .into_iter()
            .map(|m| m.as_ref().to_string())
            .chain(config.allowed_imports)
            .collect();
        let imports = ImportGate::new(&requested);
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        tracing::debug!(allowed = ?imports.allowed(), seeded = config.random_seed.is_some(), "executor created");
        Self {
            env: Environment::new(),
            imports,
            output: PrintBuffer::new(config.limits.max_output_len),
            rng,
            limits: config.limits,
        }
    }

    /// Run one source unit against the session state
    pub fn execute(&mut self, source: &str) -> Result<ExecutionResult> {
        let span = tracing::debug_span!("execute", bytes = source.len());
        let _enter = span.enter();

        self.output.clear();
        let restricted = restrict(source, &self.validation_options())?;

        let mut interp = Interpreter::new(
            &mut self.env,
            &self.imports,
            &mut self.output,
            &mut self.rng,
            &self.limits,
        );
        let outcome = interp.run(&restricted.program);
        let operations = interp.operations();

        let (value, is_final_answer) = match outcome {
            Ok(value) => (value, false),
            Err(Interrupt::FinalAnswer(value)) => (value, true),
            Err(Interrupt::Error(e)) => {
                tracing::debug!(operations, error = %e, "execution failed");
                return Err(e);
            }
        };
        tracing::debug!(operations, is_final_answer, "execution finished");

        Ok(ExecutionResult {
            value,
            logs: self.output.contents(),
            is_final_answer,
        })
    }

    /// Load and run a source file
    pub fn run_file(&mut self, path: &Path) -> Result<ExecutionResult> {
        let source = fs::read_to_string(path)?;
        self.execute(&source)
    }

    /// Restrict a source unit without running it, returning its warnings
    pub fn check(&self, source: &str) -> Result<Vec<ValidationIssue>> {
        Ok(restrict(source, &self.validation_options())?.warnings)
    }

    /// Inject variables into the persistent layer
    pub fn define_variables<I, K, V>(&mut self, variables: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in variables {
            let name = name.as_ref();
            check_binding_name(name)?;
            self.env.define_variable(name, value.into())?;
        }
        Ok(())
    }

    /// Register host callables; evaluated code can call but not rebind them
    pub fn define_tools<I, K>(&mut self, tools: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Tool)>,
        K: AsRef<str>,
    {
        for (name, tool) in tools {
            let name = name.as_ref();
            check_binding_name(name)?;
            self.env.define_tool(name, tool);
        }
        Ok(())
    }

    /// Sorted module names evaluated code may import
    pub fn list_allowed_imports(&self) -> Vec<String> {
        self.imports.allowed()
    }

    /// Output captured by the most recent call, including a failed one
    pub fn last_logs(&self) -> String {
        self.output.contents()
    }

    /// A persistent binding, such as a module-level assignment
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.env.variable(name)
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.env.variable_names()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.env.tool_names()
    }

    /// Human readable listing of variables and tools
    pub fn describe(&self) -> String {
        self.env.display()
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Drop program-created globals; tools, injected variables and the
    /// allow-list stay
    pub fn reset(&mut self) {
        tracing::debug!("executor reset");
        self.env.reset();
        self.output.clear();
    }

    fn validation_options(&self) -> ValidationOptions {
        let mut options = ValidationOptions::from(&self.limits);
        options.host_names = self
            .env
            .tool_names()
            .into_iter()
            .chain(self.env.variable_names())
            .collect();
        options
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

/// Host-supplied names must be plain identifiers outside the dunder space
fn check_binding_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_alphabetic() || first == '_')
                && chars.all(|c| c.is_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(SafepyError::RuntimeRestriction(format!(
            "'{}' is not a valid identifier",
            name
        )));
    }
    if policy::is_dunder(name) {
        return Err(SafepyError::RuntimeRestriction(format!(
            "cannot bind reserved name '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn seeded() -> Executor {
        let config = ExecutorConfig {
            random_seed: Some(7),
            ..Default::default()
        };
        Executor::with_config(std::iter::empty::<String>(), config)
    }

    #[test]
    fn test_value_of_last_statement() {
        let mut executor = Executor::default();
        let result = executor.execute("x = 2\nx * 21").unwrap();
        assert_eq!(result.value.as_int().unwrap(), 42);
        assert!(!result.is_final_answer);
        assert!(result.logs.is_empty());
    }

    #[test]
    fn test_logs_reset_each_call() {
        let mut executor = Executor::default();
        let first = executor.execute("print('a')\nprint('b')").unwrap();
        assert_eq!(first.logs, "a\nb\n");
        assert!(first.value.is_none());

        let second = executor.execute("1").unwrap();
        assert_eq!(second.logs, "");
    }

    #[test]
    fn test_final_answer_stops_program() {
        let mut executor = Executor::default();
        let source = "\
def search(n):
    for i in range(n):
        if i == 3:
            final_answer(i * 10)
    return -1
search(10)
print('unreachable')
";
        let result = executor.execute(source).unwrap();
        assert!(result.is_final_answer);
        assert_eq!(result.value.as_int().unwrap(), 30);
        assert!(!result.logs.contains("unreachable"));
    }

    #[test]
    fn test_failed_import_keeps_earlier_effects() {
        let mut executor = Executor::default();
        let err = executor.execute("kept = 1\nprint('before')\nimport os").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImportRestriction);
        assert_eq!(err.line(), Some(3));
        assert_eq!(executor.variable("kept").unwrap().as_int().unwrap(), 1);
        assert_eq!(executor.last_logs(), "before\n");
    }

    #[test]
    fn test_error_kinds() {
        let mut executor = Executor::default();
        let cases = [
            ("1 / 0", ErrorKind::Arithmetic),
            ("undefined_name", ErrorKind::Name),
            ("(1).__class__", ErrorKind::SyntaxRestriction),
            ("x = 5\nx()", ErrorKind::RuntimeRestriction),
        ];
        for (source, kind) in cases {
            assert_eq!(executor.execute(source).unwrap_err().kind(), kind, "{}", source);
        }
    }

    #[test]
    fn test_variables_and_tools_persist() {
        let mut executor = Executor::default();
        executor
            .define_variables([("items", json!([3, 1, 2])), ("label", json!("n"))])
            .unwrap();
        executor
            .define_tools([(
                "double",
                Tool::new(|args| Ok(Value::Int(args.positional[0].as_int()? * 2))),
            )])
            .unwrap();

        let result = executor.execute("total = double(sum(items))").unwrap();
        assert_eq!(result.value.as_int().unwrap(), 12);
        let result = executor.execute("f'{label}={total}'").unwrap();
        assert_eq!(result.value.to_string(), "n=12");

        let err = executor.execute("double = 1").unwrap_err();
        assert!(err.message().contains("registered tool"));
    }

    #[test]
    fn test_final_answer_tool_is_called() {
        let mut executor = Executor::default();
        executor
            .define_tools([(
                "final_answer",
                Tool::new(|args| Ok(Value::str(format!("answer: {}", args.positional[0])))),
            )])
            .unwrap();
        let result = executor.execute("final_answer(5)").unwrap();
        assert!(result.is_final_answer);
        assert_eq!(result.value.to_string(), "answer: 5");
    }

    #[test]
    fn test_invalid_binding_names() {
        let mut executor = Executor::default();
        assert!(executor.define_variables([("1x", json!(1))]).is_err());
        assert!(executor.define_variables([("__builtins__", json!(1))]).is_err());
        assert!(executor
            .define_tools([("bad name", Tool::new(|_| Ok(Value::None)))])
            .is_err());
    }

    #[test]
    fn test_reset_keeps_tools_and_injected() {
        let mut executor = Executor::new(["statistics"]);
        executor.define_variables([("base", json!(10))]).unwrap();
        executor
            .define_tools([("noop", Tool::new(|_| Ok(Value::None)))])
            .unwrap();
        executor.execute("scratch = base + 1").unwrap();

        executor.reset();
        assert!(executor.variable("scratch").is_none());
        assert_eq!(executor.variable("base").unwrap().as_int().unwrap(), 10);
        assert_eq!(executor.tool_names(), vec!["noop"]);
        assert!(executor.list_allowed_imports().contains(&"statistics".to_string()));
    }

    #[test]
    fn test_seeded_random_is_repeatable() {
        let source = "import random\n[random.randint(1, 100) for _ in range(5)]";
        let a = seeded().execute(source).unwrap().value.to_string();
        let b = seeded().execute(source).unwrap().value.to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn test_result_serializes_value_as_json() {
        let mut executor = Executor::default();
        let result = executor.execute("{'a': [1, 2.5, None], 'b': (True,)}").unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["value"], json!({"a": [1, 2.5, null], "b": [true]}));
        assert_eq!(json["is_final_answer"], false);
    }

    #[test]
    fn test_check_reports_warnings_without_running() {
        let executor = Executor::default();
        let warnings = executor.check("max = 3").unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(executor.variable("max").is_none());
        assert!(executor.check("eval('1')").is_err());
    }

    #[test]
    fn test_run_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "import math\nmath.floor(2.7)").unwrap();
        let mut executor = Executor::default();
        let result = executor.run_file(file.path()).unwrap();
        assert_eq!(result.value.as_int().unwrap(), 2);
    }
}
