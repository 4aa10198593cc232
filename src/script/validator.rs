//! Grammar restrictor
//!
//! Parses a source unit and walks the tree before anything runs, rejecting
//! constructs outside the sandboxed subset. Errors stop the program;
//! warnings are logged and handed back to the caller.

use std::collections::HashSet;

use crate::config::Limits;
use crate::engine::builtins;
use crate::error::{Result, SafepyError};
use crate::parser::ast::*;
use crate::parser::parse_program;
use crate::security::policy;
use crate::stack::ensure_sufficient_stack;

/// A problem found while restricting a program
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub line: Option<usize>,
    pub message: String,
    pub severity: ValidationSeverity,
}

/// Severity level for validation issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.severity {
            ValidationSeverity::Error => "ERROR",
            ValidationSeverity::Warning => "WARNING",
        };
        if let Some(line) = self.line {
            write!(f, "{} (line {}): {}", prefix, line, self.message)
        } else {
            write!(f, "{}: {}", prefix, self.message)
        }
    }
}

impl ValidationIssue {
    fn into_error(self) -> SafepyError {
        let error = SafepyError::SyntaxRestriction(self.message);
        match self.line {
            Some(line) => error.at_line(line),
            None => error,
        }
    }
}

/// Validation options
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Maximum nesting depth of statement blocks
    pub max_nesting_depth: usize,
    /// Maximum nesting depth of expressions
    pub max_expression_depth: usize,
    /// Names bound outside the program (tools, injected variables) that may
    /// be referenced even when they shadow a forbidden builtin
    pub host_names: HashSet<String>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self::from(&Limits::default())
    }
}

impl From<&Limits> for ValidationOptions {
    fn from(limits: &Limits) -> Self {
        Self {
            max_nesting_depth: limits.max_nesting_depth,
            max_expression_depth: limits.max_expression_depth,
            host_names: HashSet::new(),
        }
    }
}

/// A program that passed the restrictor
#[derive(Debug)]
pub struct RestrictedProgram {
    pub program: Program,
    pub warnings: Vec<ValidationIssue>,
}

/// Parse and validate `source`; the first error becomes a
/// `SyntaxRestrictionError` tagged with its line
pub fn restrict(source: &str, options: &ValidationOptions) -> Result<RestrictedProgram> {
    let program = parse_program(source)?;
    let issues = validate_program(&program, options);

    let mut warnings = Vec::new();
    for issue in issues {
        match issue.severity {
            ValidationSeverity::Error => {
                tracing::debug!(line = issue.line, message = %issue.message, "program rejected");
                return Err(issue.into_error());
            }
            ValidationSeverity::Warning => {
                tracing::warn!(line = issue.line, message = %issue.message, "restrictor warning");
                warnings.push(issue);
            }
        }
    }
    Ok(RestrictedProgram { program, warnings })
}

/// Validate a parsed program for safety and correctness
pub fn validate_program(program: &Program, options: &ValidationOptions) -> Vec<ValidationIssue> {
    let mut bound = HashSet::new();
    collect_bindings(&program.body, &mut bound);

    let mut walker = Walker {
        options,
        bound,
        issues: Vec::new(),
        line: 1,
    };
    walker.block(&program.body, Context::default());
    walker.issues
}

/// Check if a script has any validation errors (not just warnings)
pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|e| e.severity == ValidationSeverity::Error)
}

/// Check if a script has any validation warnings
pub fn has_warnings(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|e| e.severity == ValidationSeverity::Warning)
}

// ============================================================================
// Bound names
// ============================================================================

/// Every name the program binds anywhere, used to let a program define its
/// own `input` or `compile` without tripping the forbidden-name check
fn collect_bindings(body: &[Stmt], out: &mut HashSet<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                targets.iter().for_each(|t| bind_target(t, out));
            }
            StmtKind::AugAssign { target, .. } | StmtKind::AnnAssign { target, .. } => {
                bind_target(target, out)
            }
            StmtKind::If { branches, orelse } => {
                for (_, branch) in branches {
                    collect_bindings(branch, out);
                }
                collect_bindings(orelse, out);
            }
            StmtKind::For {
                target,
                body,
                orelse,
                ..
            } => {
                bind_target(target, out);
                collect_bindings(body, out);
                collect_bindings(orelse, out);
            }
            StmtKind::While { body, orelse, .. } => {
                collect_bindings(body, out);
                collect_bindings(orelse, out);
            }
            StmtKind::FunctionDef(def) => {
                out.insert(def.name.clone());
                out.extend(def.params.names().map(str::to_string));
                collect_bindings(&def.body, out);
            }
            StmtKind::Import(aliases) | StmtKind::ImportFrom { names: aliases, .. } => {
                out.extend(aliases.iter().map(|a| a.binding().to_string()));
            }
            _ => {}
        }
    }
}

fn bind_target(target: &Target, out: &mut HashSet<String>) {
    let mut names = Vec::new();
    target.bound_names(&mut names);
    out.extend(names.into_iter().map(str::to_string));
}

// ============================================================================
// Walk
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Context {
    depth: usize,
    in_function: bool,
    in_loop: bool,
}

impl Context {
    fn nested(self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self
        }
    }

    fn in_loop(self) -> Self {
        Self {
            in_loop: true,
            ..self.nested()
        }
    }

    fn function_body(self) -> Self {
        Self {
            depth: self.depth + 1,
            in_function: true,
            in_loop: false,
        }
    }
}

struct Walker<'a> {
    options: &'a ValidationOptions,
    bound: HashSet<String>,
    issues: Vec<ValidationIssue>,
    /// Line of the statement being walked
    line: usize,
}

impl Walker<'_> {
    fn error(&mut self, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            line: Some(self.line),
            message: message.into(),
            severity: ValidationSeverity::Error,
        });
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            line: Some(self.line),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        });
    }

    fn block(&mut self, body: &[Stmt], ctx: Context) {
        if ctx.depth > self.options.max_nesting_depth {
            if let Some(first) = body.first() {
                self.line = first.line;
            }
            self.error(format!(
                "maximum nesting depth ({}) exceeded",
                self.options.max_nesting_depth
            ));
            return;
        }
        for stmt in body {
            ensure_sufficient_stack(|| self.stmt(stmt, ctx));
        }
    }

    fn stmt(&mut self, stmt: &Stmt, ctx: Context) {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => self.expr(expr, 0),
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    self.target(target);
                    self.shadowing(target);
                }
                self.expr(value, 0);
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.target(target);
                self.expr(value, 0);
            }
            StmtKind::AnnAssign { target, value } => {
                self.target(target);
                self.shadowing(target);
                if let Some(value) = value {
                    self.expr(value, 0);
                }
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    self.expr(test, 0);
                    self.block(body, ctx.nested());
                }
                self.block(orelse, ctx.nested());
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.target(target);
                self.expr(iter, 0);
                self.block(body, ctx.in_loop());
                self.block(orelse, ctx.nested());
            }
            StmtKind::While { test, body, orelse } => {
                self.expr(test, 0);
                if matches!(test, Expr::Constant(Constant::Bool(true))) && !exits_loop(body) {
                    self.warning("`while True` loop has no `break`");
                }
                self.block(body, ctx.in_loop());
                self.block(orelse, ctx.nested());
            }
            StmtKind::FunctionDef(def) => {
                self.identifier(&def.name);
                if builtins::is_builtin(&def.name) {
                    self.warning(format!("function '{}' shadows a builtin", def.name));
                }
                self.function(def, ctx, 0);
            }
            StmtKind::Return(value) => {
                if !ctx.in_function {
                    self.error("'return' outside function");
                }
                if let Some(value) = value {
                    self.expr(value, 0);
                }
            }
            StmtKind::Break | StmtKind::Continue => {
                if !ctx.in_loop {
                    let keyword = if matches!(stmt.kind, StmtKind::Break) {
                        "break"
                    } else {
                        "continue"
                    };
                    self.error(format!("'{}' outside loop", keyword));
                }
            }
            StmtKind::Pass => {}
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    self.module_name(&alias.name);
                    if let Some(name) = &alias.alias {
                        self.identifier(name);
                    }
                }
            }
            StmtKind::ImportFrom {
                module,
                names,
                level,
                wildcard,
            } => {
                if *level > 0 {
                    self.error("relative imports are not allowed");
                }
                if *wildcard {
                    self.error(format!("'from {} import *' is not allowed", module));
                }
                self.module_name(module);
                for alias in names {
                    self.identifier(&alias.name);
                    if let Some(name) = &alias.alias {
                        self.identifier(name);
                    }
                }
            }
            StmtKind::Delete(targets) => targets.iter().for_each(|t| self.target(t)),
            StmtKind::Assert { test, msg } => {
                self.expr(test, 0);
                if let Some(msg) = msg {
                    self.expr(msg, 0);
                }
            }
            StmtKind::Forbidden(kind) => {
                self.error(format!("'{}' statements are not allowed", kind));
            }
        }
    }

    fn function(&mut self, def: &FunctionDef, ctx: Context, depth: usize) {
        if !def.decorators.is_empty() {
            self.error("decorators are not allowed");
        }
        for name in def.params.names() {
            self.identifier(name);
        }
        for param in def.params.positional.iter().chain(&def.params.kwonly) {
            if let Some(default) = &param.default {
                self.expr(default, depth);
            }
        }
        let line = self.line;
        self.block(&def.body, ctx.function_body());
        self.line = line;
    }

    fn module_name(&mut self, dotted: &str) {
        for part in dotted.split('.') {
            self.identifier(part);
        }
    }

    /// Dunder names are refused wherever they appear
    fn identifier(&mut self, name: &str) {
        if policy::is_dunder(name) {
            self.error(format!("access to '{}' is not allowed", name));
        }
    }

    fn reference(&mut self, name: &str) {
        self.identifier(name);
        if policy::is_forbidden_name(name)
            && !self.bound.contains(name)
            && !self.options.host_names.contains(name)
        {
            self.error(format!("use of '{}' is not allowed", name));
        }
    }

    fn attribute(&mut self, attr: &str) {
        if let Err(e) = policy::check_attribute(attr) {
            self.error(e.message());
        }
    }

    fn shadowing(&mut self, target: &Target) {
        let mut names = Vec::new();
        target.bound_names(&mut names);
        for name in names {
            if builtins::is_builtin(name) {
                self.warning(format!("assignment to '{}' shadows a builtin", name));
            }
        }
    }

    fn target(&mut self, target: &Target) {
        match target {
            Target::Name(name) => self.identifier(name),
            Target::Attribute { value, attr } => {
                self.attribute(attr);
                self.expr(value, 1);
            }
            Target::Subscript { value, index } => {
                self.expr(value, 1);
                self.expr(index, 1);
            }
            Target::Sequence(items) => items.iter().for_each(|t| self.target(t)),
            Target::Starred(inner) => self.target(inner),
        }
    }

    fn expr(&mut self, expr: &Expr, depth: usize) {
        if depth > self.options.max_expression_depth {
            self.error(format!(
                "maximum expression nesting depth ({}) exceeded",
                self.options.max_expression_depth
            ));
            return;
        }
        ensure_sufficient_stack(|| self.expr_inner(expr, depth + 1));
    }

    fn expr_inner(&mut self, expr: &Expr, depth: usize) {
        match expr {
            Expr::Constant(_) => {}
            Expr::FString(parts) => self.fstring(parts, depth),
            Expr::Name(name) => self.reference(name),
            Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => {
                items.iter().for_each(|e| self.expr(e, depth));
            }
            Expr::Dict(items) => {
                for item in items {
                    match item {
                        DictItem::Pair(key, value) => {
                            self.expr(key, depth);
                            self.expr(value, depth);
                        }
                        DictItem::Unpack(value) => self.expr(value, depth),
                    }
                }
            }
            Expr::Starred(value) => self.expr(value, depth),
            Expr::Attribute { value, attr } => {
                self.attribute(attr);
                self.expr(value, depth);
            }
            Expr::Subscript { value, index } => {
                self.expr(value, depth);
                self.expr(index, depth);
            }
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part, depth);
                }
            }
            Expr::Call { func, args } => {
                self.reflective_call(func, args);
                self.expr(func, depth);
                for arg in args {
                    match arg {
                        Argument::Positional(e) | Argument::Star(e) | Argument::DoubleStar(e) => {
                            self.expr(e, depth)
                        }
                        Argument::Keyword(name, e) => {
                            self.identifier(name);
                            self.expr(e, depth);
                        }
                    }
                }
            }
            Expr::Unary { operand, .. } => self.expr(operand, depth),
            Expr::Binary { left, right, .. } => {
                self.expr(left, depth);
                self.expr(right, depth);
            }
            Expr::BoolOp { values, .. } => values.iter().for_each(|e| self.expr(e, depth)),
            Expr::Compare { left, ops } => {
                self.expr(left, depth);
                ops.iter().for_each(|(_, e)| self.expr(e, depth));
            }
            Expr::IfExp { test, body, orelse } => {
                self.expr(test, depth);
                self.expr(body, depth);
                self.expr(orelse, depth);
            }
            Expr::Lambda(def) => {
                // a lambda body is a single return, so only the loop context changes
                let ctx = Context {
                    depth: 0,
                    in_function: true,
                    in_loop: false,
                };
                self.function(def, ctx, depth);
            }
            Expr::ListComp {
                element,
                generators,
            }
            | Expr::SetComp {
                element,
                generators,
            }
            | Expr::GeneratorExp {
                element,
                generators,
            } => {
                self.generators(generators, depth);
                self.expr(element, depth);
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                self.generators(generators, depth);
                self.expr(key, depth);
                self.expr(value, depth);
            }
        }
    }

    fn generators(&mut self, generators: &[Comprehension], depth: usize) {
        for generator in generators {
            self.target(&generator.target);
            self.expr(&generator.iter, depth);
            generator
                .conditions
                .iter()
                .for_each(|e| self.expr(e, depth));
        }
    }

    fn fstring(&mut self, parts: &[FStringPart], depth: usize) {
        for part in parts {
            if let FStringPart::Field { expr, spec, .. } = part {
                self.expr(expr, depth);
                self.fstring(spec, depth);
            }
        }
    }

    /// `getattr(x, "__class__")` and friends with a literal private name
    fn reflective_call(&mut self, func: &Expr, args: &[Argument]) {
        let Expr::Name(name) = func else {
            return;
        };
        if !matches!(name.as_str(), "getattr" | "hasattr") || self.bound.contains(name) {
            return;
        }
        if let Some(Argument::Positional(Expr::Constant(Constant::Str(attr)))) = args.get(1) {
            self.attribute(attr);
        }
    }
}

/// Whether a loop body contains a `break` or `return` for this loop
fn exits_loop(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::Break | StmtKind::Return(_) => true,
        StmtKind::If { branches, orelse } => {
            branches.iter().any(|(_, b)| exits_loop(b)) || exits_loop(orelse)
        }
        // a break inside a nested loop's else clause leaves the outer loop
        StmtKind::For { orelse, .. } | StmtKind::While { orelse, .. } => exits_loop(orelse),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(source: &str) -> Result<RestrictedProgram> {
        restrict(source, &ValidationOptions::default())
    }

    fn rejection(source: &str) -> String {
        match check(source) {
            Ok(_) => panic!("accepted: {}", source),
            Err(e) => {
                assert!(matches!(
                    e.kind(),
                    crate::error::ErrorKind::SyntaxRestriction
                ));
                e.message()
            }
        }
    }

    #[test]
    fn test_accepts_safe_subset() {
        let source = "\
import math
def f(x, *args, k=1, **kw):
    return [i * k for i in range(x) if i % 2]
total = sum(f(5))
while total > 0:
    total -= 1
    if total == 2:
        break
";
        let restricted = check(source).unwrap();
        assert_eq!(restricted.program.body.len(), 4);
        assert!(restricted.warnings.is_empty());
    }

    #[test]
    fn test_forbidden_statements() {
        assert!(rejection("class A:\n    pass\n").contains("'class'"));
        assert!(rejection("try:\n    x = 1\nexcept:\n    pass\n").contains("'try'"));
        assert!(rejection("raise ValueError('x')").contains("'raise'"));
        assert!(rejection("def f():\n    global x\n").contains("'global'"));
    }

    #[test]
    fn test_dunder_and_private_access() {
        assert!(rejection("x = 1\nx.__class__").contains("__class__"));
        assert!(rejection("__import__('os')").contains("__import__"));
        assert!(rejection("y = [1]._secret").contains("_secret"));
        assert!(rejection("getattr(1, '__class__')").contains("__class__"));
    }

    #[test]
    fn test_forbidden_names_unless_bound() {
        assert!(rejection("eval('1 + 1')").contains("eval"));
        assert!(rejection("open('/etc/passwd')").contains("open"));

        let own = check("def compile(x):\n    return x\ncompile(3)");
        assert!(own.is_ok());

        let mut options = ValidationOptions::default();
        options.host_names.insert("input".to_string());
        assert!(restrict("input('q')", &options).is_ok());
    }

    #[test]
    fn test_imports_shape() {
        assert!(rejection("from . import x").contains("relative"));
        assert!(rejection("from math import *").contains("import *"));
        // disallowed modules are refused at run time, not here
        assert!(check("import os").is_ok());
    }

    #[test]
    fn test_control_flow_placement() {
        assert!(rejection("return 1").contains("outside function"));
        assert!(rejection("break").contains("outside loop"));
        assert!(rejection("def f():\n    continue\n").contains("outside loop"));
        assert!(check("for i in range(3):\n    def g():\n        return i\n").is_ok());
    }

    #[test]
    fn test_decorators_rejected() {
        assert!(rejection("@cache\ndef f():\n    pass\n").contains("decorators"));
    }

    #[test]
    fn test_nesting_limit() {
        let options = ValidationOptions {
            max_nesting_depth: 2,
            ..Default::default()
        };
        let source = "if 1:\n    if 1:\n        if 1:\n            x = 1\n";
        let err = restrict(source, &options).unwrap_err();
        assert!(err.message().contains("nesting depth"));
        assert_eq!(err.line(), Some(4));
    }

    #[test]
    fn test_expression_depth_limit() {
        let options = ValidationOptions {
            max_expression_depth: 10,
            ..Default::default()
        };
        let source = format!("x = {}1{}", "(-".repeat(20), ")".repeat(20));
        let err = restrict(&source, &options).unwrap_err();
        assert!(err.message().contains("expression nesting depth"));
    }

    #[test]
    fn test_warnings() {
        let restricted = check("list = [1]\nwhile True:\n    x = 1\n").unwrap();
        assert_eq!(restricted.warnings.len(), 2);
        assert!(has_warnings(&restricted.warnings));
        assert!(!has_errors(&restricted.warnings));
        assert!(restricted.warnings[0].to_string().starts_with("WARNING (line 1)"));

        let bounded = check("while True:\n    if x:\n        break\n").unwrap();
        assert!(bounded.warnings.is_empty());
    }

    #[test]
    fn test_error_line_reported() {
        let err = check("x = 1\ny = 2\nz = x.__dict__\n").unwrap_err();
        assert_eq!(err.line(), Some(3));
        assert!(err.to_string().starts_with("SyntaxRestrictionError"));
    }
}
