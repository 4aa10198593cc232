//! Statement execution and expression evaluation

use std::rc::Rc;

use rand::rngs::StdRng;

use crate::config::Limits;
use crate::context::{Environment, Scope, ScopeRef};
use crate::engine::{methods, modules, operators, EvalResult, Flow, Interrupt};
use crate::error::{Result, SafepyError};
use crate::output::PrintBuffer;
use crate::parser::ast::*;
use crate::security::{policy, ImportGate};
use crate::stack::ensure_sufficient_stack;
use crate::value::format::{format_value, repr, to_str};
use crate::value::{Arguments, BuiltinKind, Dict, Function, Set, Value};

/// One evaluation of a program against an executor's state
pub struct Interpreter<'a> {
    pub env: &'a mut Environment,
    pub imports: &'a ImportGate,
    pub output: &'a mut PrintBuffer,
    pub rng: &'a mut StdRng,
    pub limits: &'a Limits,
    operations: u64,
    call_depth: usize,
    /// Innermost function or comprehension scope; `None` at module level
    scope: Option<ScopeRef>,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        env: &'a mut Environment,
        imports: &'a ImportGate,
        output: &'a mut PrintBuffer,
        rng: &'a mut StdRng,
        limits: &'a Limits,
    ) -> Self {
        Self {
            env,
            imports,
            output,
            rng,
            limits,
            operations: 0,
            call_depth: 0,
            scope: None,
        }
    }

    /// Run a program; its value is the value of the last top-level statement
    pub fn run(&mut self, program: &Program) -> EvalResult<Value> {
        let mut last = Value::None;
        for stmt in &program.body {
            match self.exec_stmt(stmt)? {
                Flow::Next(value) => last = value,
                Flow::Break | Flow::Continue | Flow::Return(_) => {
                    return Err(SafepyError::SyntaxRestriction(
                        "control flow statement outside of a function or loop".to_string(),
                    )
                    .at_line(stmt.line)
                    .into())
                }
            }
        }
        Ok(last)
    }

    pub fn operations(&self) -> u64 {
        self.operations
    }

    /// Count one evaluation step against the operation budget
    pub fn tick(&mut self) -> Result<()> {
        self.operations += 1;
        if self.operations > self.limits.max_operations {
            return Err(SafepyError::RuntimeRestriction(format!(
                "operation limit exceeded: more than {} operations",
                self.limits.max_operations
            )));
        }
        Ok(())
    }

    pub fn memory_error(&self) -> SafepyError {
        SafepyError::memory(self.limits.max_collection_len)
    }

    /// Fail before building a string or container of `len` items
    pub fn check_len(&self, len: u64) -> Result<()> {
        if len > self.limits.max_collection_len as u64 {
            return Err(self.memory_error());
        }
        Ok(())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec_block(&mut self, body: &[Stmt]) -> EvalResult<Flow> {
        let mut last = Value::None;
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Next(value) => last = value,
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next(last))
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> EvalResult<Flow> {
        ensure_sufficient_stack(|| self.exec_stmt_inner(stmt)).map_err(|i| i.at_line(stmt.line))
    }

    fn exec_stmt_inner(&mut self, stmt: &Stmt) -> EvalResult<Flow> {
        self.tick()?;
        let flow = match &stmt.kind {
            StmtKind::Expr(expr) => Flow::Next(self.eval(expr)?),
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
                Flow::Next(value)
            }
            StmtKind::AugAssign { target, op, value } => {
                Flow::Next(self.aug_assign(target, *op, value)?)
            }
            StmtKind::AnnAssign { target, value } => match value {
                Some(value) => {
                    let value = self.eval(value)?;
                    self.assign(target, value.clone())?;
                    Flow::Next(value)
                }
                None => Flow::Next(Value::None),
            },
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(orelse)?
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => self.exec_for(target, iter, body, orelse)?,
            StmtKind::While { test, body, orelse } => self.exec_while(test, body, orelse)?,
            StmtKind::FunctionDef(def) => {
                let func = self.make_function(def)?;
                self.env.define(self.scope.as_ref(), &def.name, func)?;
                Flow::Next(Value::None)
            }
            StmtKind::Return(value) => match value {
                Some(expr) => Flow::Return(self.eval(expr)?),
                None => Flow::Return(Value::None),
            },
            StmtKind::Break => Flow::Break,
            StmtKind::Continue => Flow::Continue,
            StmtKind::Pass => Flow::Next(Value::None),
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    let module = self.import(&alias.name)?;
                    self.env.define(self.scope.as_ref(), alias.binding(), module)?;
                }
                Flow::Next(Value::None)
            }
            StmtKind::ImportFrom {
                module,
                names,
                level,
                wildcard,
            } => {
                if *level > 0 || *wildcard {
                    return Err(SafepyError::SyntaxRestriction(
                        "relative and wildcard imports are not allowed".to_string(),
                    )
                    .into());
                }
                let loaded = self.import(module)?;
                let Value::Module(loaded) = loaded else {
                    return Err(SafepyError::internal("import produced a non-module").into());
                };
                for alias in names {
                    let member = loaded.get(&alias.name).ok_or_else(|| {
                        SafepyError::ImportRestriction(format!(
                            "cannot import name '{}' from '{}'",
                            alias.name, module
                        ))
                    })?;
                    let binding = alias.alias.as_deref().unwrap_or(&alias.name);
                    self.env.define(self.scope.as_ref(), binding, member)?;
                }
                Flow::Next(Value::None)
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
                Flow::Next(Value::None)
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test)?.truthy() {
                    let message = match msg {
                        Some(msg) => format!("AssertionError: {}", to_str(&self.eval(msg)?)),
                        None => "AssertionError".to_string(),
                    };
                    return Err(SafepyError::RuntimeRestriction(message).into());
                }
                Flow::Next(Value::None)
            }
            StmtKind::Forbidden(kind) => {
                return Err(SafepyError::SyntaxRestriction(format!(
                    "'{}' statements are not allowed",
                    kind
                ))
                .into())
            }
        };
        Ok(flow)
    }

    fn exec_for(
        &mut self,
        target: &Target,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> EvalResult<Flow> {
        let iterable = self.eval(iter)?;
        let mut last = Value::None;
        for item in iterable.iter()? {
            self.assign(target, item)?;
            match self.exec_block(body)? {
                Flow::Next(value) => last = value,
                Flow::Continue => {}
                Flow::Break => return Ok(Flow::Next(last)),
                ret @ Flow::Return(_) => return Ok(ret),
            }
        }
        match self.exec_block(orelse)? {
            Flow::Next(value) if !orelse.is_empty() => Ok(Flow::Next(value)),
            Flow::Next(_) => Ok(Flow::Next(last)),
            flow => Ok(flow),
        }
    }

    fn exec_while(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> EvalResult<Flow> {
        let mut iterations: u64 = 0;
        while self.eval(test)?.truthy() {
            iterations += 1;
            if iterations > self.limits.max_while_iterations {
                return Err(SafepyError::RuntimeRestriction(format!(
                    "while loop exceeded the maximum of {} iterations",
                    self.limits.max_while_iterations
                ))
                .into());
            }
            match self.exec_block(body)? {
                Flow::Next(_) | Flow::Continue => {}
                Flow::Break => return Ok(Flow::Next(Value::None)),
                ret @ Flow::Return(_) => return Ok(ret),
            }
        }
        match self.exec_block(orelse)? {
            Flow::Next(_) => Ok(Flow::Next(Value::None)),
            flow => Ok(flow),
        }
    }

    fn import(&mut self, name: &str) -> EvalResult<Value> {
        self.imports.check(name)?;
        tracing::debug!(module = name, "import");
        match modules::load(name) {
            Some(module) => Ok(Value::Module(Rc::new(module))),
            None => Err(SafepyError::ImportRestriction(format!(
                "module '{}' is not available in the sandbox",
                name
            ))
            .into()),
        }
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    pub fn assign(&mut self, target: &Target, value: Value) -> EvalResult<()> {
        match target {
            Target::Name(name) => {
                self.env.define(self.scope.as_ref(), name, value)?;
            }
            Target::Subscript { value: obj, index } => {
                let obj = self.eval(obj)?;
                match index.as_ref() {
                    Expr::Slice { lower, upper, step } => {
                        let bounds = self.slice_bounds(lower, upper, step)?;
                        let items = self.collect(&value)?;
                        operators::set_slice(&obj, bounds, items)?;
                    }
                    index => {
                        let index = self.eval(index)?;
                        operators::set_item(&obj, index, value)?;
                    }
                }
            }
            Target::Attribute { value: obj, attr } => {
                let obj = self.eval(obj)?;
                return Err(SafepyError::attribute_error(format!(
                    "'{}' object attribute '{}' is read-only",
                    obj.type_name(),
                    attr
                ))
                .into());
            }
            Target::Sequence(targets) => self.unpack(targets, value)?,
            Target::Starred(_) => {
                return Err(SafepyError::SyntaxRestriction(
                    "starred assignment target must be in a list or tuple".to_string(),
                )
                .into())
            }
        }
        Ok(())
    }

    fn unpack(&mut self, targets: &[Target], value: Value) -> EvalResult<()> {
        let items = self.collect(&value)?;
        let star = targets.iter().position(|t| matches!(t, Target::Starred(_)));
        match star {
            None => {
                if items.len() != targets.len() {
                    return Err(SafepyError::value_error(if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    })
                    .into());
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
            }
            Some(star) => {
                let after = targets.len() - star - 1;
                if items.len() < star + after {
                    return Err(SafepyError::value_error(format!(
                        "not enough values to unpack (expected at least {}, got {})",
                        star + after,
                        items.len()
                    ))
                    .into());
                }
                let mut items = items;
                let tail = items.split_off(items.len() - after);
                let middle = items.split_off(star);
                for (target, item) in targets[..star].iter().zip(items) {
                    self.assign(target, item)?;
                }
                if let Target::Starred(inner) = &targets[star] {
                    self.assign(inner, Value::list(middle))?;
                }
                for (target, item) in targets[star + 1..].iter().zip(tail) {
                    self.assign(target, item)?;
                }
            }
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> EvalResult<Value> {
        match target {
            Target::Name(name) => {
                let current = self.env.lookup(self.scope.as_ref(), name)?;
                let rhs = self.eval(value)?;
                let result = operators::augmented(op, &current, &rhs, self.limits)?;
                self.env.define(self.scope.as_ref(), name, result.clone())?;
                Ok(result)
            }
            Target::Subscript { value: obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                let current = operators::get_item(self, &obj, &index)?;
                let rhs = self.eval(value)?;
                let result = operators::augmented(op, &current, &rhs, self.limits)?;
                operators::set_item(&obj, index, result.clone())?;
                Ok(result)
            }
            Target::Attribute { .. } => {
                self.assign(target, Value::None)?;
                Ok(Value::None)
            }
            Target::Sequence(_) | Target::Starred(_) => Err(SafepyError::SyntaxRestriction(
                "illegal expression for augmented assignment".to_string(),
            )
            .into()),
        }
    }

    fn delete(&mut self, target: &Target) -> EvalResult<()> {
        match target {
            Target::Name(name) => self.env.delete(self.scope.as_ref(), name)?,
            Target::Subscript { value, index } => {
                let obj = self.eval(value)?;
                match index.as_ref() {
                    Expr::Slice { lower, upper, step } => {
                        let bounds = self.slice_bounds(lower, upper, step)?;
                        operators::del_slice(&obj, bounds)?;
                    }
                    index => {
                        let index = self.eval(index)?;
                        operators::del_item(&obj, &index)?;
                    }
                }
            }
            Target::Sequence(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
            }
            Target::Attribute { value, attr } => {
                let obj = self.eval(value)?;
                return Err(SafepyError::attribute_error(format!(
                    "cannot delete attribute '{}' of '{}' object",
                    attr,
                    obj.type_name()
                ))
                .into());
            }
            Target::Starred(_) => {
                return Err(
                    SafepyError::SyntaxRestriction("cannot delete starred".to_string()).into(),
                )
            }
        }
        Ok(())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        self.tick()?;
        ensure_sufficient_stack(|| self.eval_inner(expr))
    }

    fn eval_inner(&mut self, expr: &Expr) -> EvalResult<Value> {
        let value = match expr {
            Expr::Constant(constant) => match constant {
                Constant::None => Value::None,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(i) => Value::Int(*i),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::str(s.as_str()),
            },
            Expr::FString(parts) => Value::str(self.render_fstring(parts)?),
            Expr::Name(name) => self.env.lookup(self.scope.as_ref(), name)?,
            Expr::List(items) => Value::list(self.eval_items(items)?),
            Expr::Tuple(items) => Value::tuple(self.eval_items(items)?),
            Expr::Set(items) => Value::set(Set::from_values(self.eval_items(items)?)?),
            Expr::Dict(items) => self.eval_dict(items)?,
            Expr::Starred(_) => {
                return Err(SafepyError::SyntaxRestriction(
                    "can't use starred expression here".to_string(),
                )
                .into())
            }
            Expr::Attribute { value, attr } => {
                let obj = self.eval(value)?;
                self.get_attribute(&obj, attr)?
            }
            Expr::Subscript { value, index } => {
                let obj = self.eval(value)?;
                match index.as_ref() {
                    Expr::Slice { lower, upper, step } => {
                        let bounds = self.slice_bounds(lower, upper, step)?;
                        operators::get_slice(&obj, bounds)?
                    }
                    index => {
                        let index = self.eval(index)?;
                        operators::get_item(self, &obj, &index)?
                    }
                }
            }
            Expr::Slice { .. } => {
                return Err(SafepyError::SyntaxRestriction(
                    "slices are only allowed inside subscripts".to_string(),
                )
                .into())
            }
            Expr::Call { func, args } => self.eval_call(func, args)?,
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Value::Bool(!operand.truthy()),
                    op => operators::unary(*op, &operand)?,
                }
            }
            Expr::Binary { left, op, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                operators::binary(*op, &left, &right, self.limits)?
            }
            Expr::BoolOp { op, values } => {
                let mut result = Value::None;
                for (i, value) in values.iter().enumerate() {
                    result = self.eval(value)?;
                    let last = i + 1 == values.len();
                    let decided = match op {
                        BoolOp::And => !result.truthy(),
                        BoolOp::Or => result.truthy(),
                    };
                    if decided || last {
                        break;
                    }
                }
                result
            }
            Expr::Compare { left, ops } => {
                let mut current = self.eval(left)?;
                for (op, right) in ops {
                    let right = self.eval(right)?;
                    if !operators::compare(*op, &current, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    current = right;
                }
                Value::Bool(true)
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)?
                } else {
                    self.eval(orelse)?
                }
            }
            Expr::Lambda(def) => self.make_function(def)?,
            Expr::ListComp {
                element,
                generators,
            } => {
                let mut items = Vec::new();
                self.comprehension(generators, &mut |interp| {
                    items.push(interp.eval(element)?);
                    Ok(())
                })?;
                Value::list(items)
            }
            Expr::GeneratorExp {
                element,
                generators,
            } => {
                let mut items = Vec::new();
                self.comprehension(generators, &mut |interp| {
                    items.push(interp.eval(element)?);
                    Ok(())
                })?;
                Value::iterator("generator", items)
            }
            Expr::SetComp {
                element,
                generators,
            } => {
                let mut set = Set::new();
                self.comprehension(generators, &mut |interp| {
                    set.insert(interp.eval(element)?)?;
                    Ok(())
                })?;
                Value::set(set)
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                let mut dict = Dict::new();
                self.comprehension(generators, &mut |interp| {
                    let k = interp.eval(key)?;
                    let v = interp.eval(value)?;
                    dict.insert(k, v)?;
                    Ok(())
                })?;
                Value::dict(dict)
            }
        };
        Ok(value)
    }

    /// Display items, expanding `*iterable`
    fn eval_items(&mut self, items: &[Expr]) -> EvalResult<Vec<Value>> {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Expr::Starred(inner) => {
                    let inner = self.eval(inner)?;
                    values.extend(self.collect(&inner)?);
                }
                item => values.push(self.eval(item)?),
            }
        }
        Ok(values)
    }

    fn eval_dict(&mut self, items: &[DictItem]) -> EvalResult<Value> {
        let mut dict = Dict::new();
        for item in items {
            match item {
                DictItem::Pair(key, value) => {
                    let key = self.eval(key)?;
                    let value = self.eval(value)?;
                    dict.insert(key, value)?;
                }
                DictItem::Unpack(mapping) => match self.eval(mapping)? {
                    Value::Dict(other) => {
                        for (key, value) in other.borrow().items() {
                            dict.insert(key, value)?;
                        }
                    }
                    other => {
                        return Err(SafepyError::type_error(format!(
                            "'{}' object is not a mapping",
                            other.type_name()
                        ))
                        .into())
                    }
                },
            }
        }
        Ok(Value::dict(dict))
    }

    fn slice_bounds(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
    ) -> EvalResult<operators::SliceBounds> {
        let mut part = |expr: &Option<Box<Expr>>| -> EvalResult<Option<i64>> {
            match expr {
                None => Ok(None),
                Some(expr) => match self.eval(expr)? {
                    Value::None => Ok(None),
                    value => Ok(Some(value.as_int().map_err(|_| {
                        SafepyError::type_error(
                            "slice indices must be integers or None",
                        )
                    })?)),
                },
            }
        };
        Ok(operators::SliceBounds {
            lower: part(lower)?,
            upper: part(upper)?,
            step: part(step)?,
        })
    }

    fn render_fstring(&mut self, parts: &[FStringPart]) -> EvalResult<String> {
        let mut out = String::new();
        for part in parts {
            match part {
                FStringPart::Literal(text) => out.push_str(text),
                FStringPart::Field {
                    expr,
                    text,
                    debug,
                    conversion,
                    spec,
                } => {
                    let value = self.eval(expr)?;
                    if *debug {
                        out.push_str(text);
                    }
                    let conversion = match conversion {
                        Some(c) => Some(*c),
                        None if *debug && spec.is_empty() => Some('r'),
                        None => None,
                    };
                    let value = match conversion {
                        Some('r') | Some('a') => Value::str(repr(&value)),
                        Some('s') => Value::str(to_str(&value)),
                        _ => value,
                    };
                    let spec = self.render_fstring(spec)?;
                    out.push_str(&format_value(&value, &spec, self.limits.max_collection_len)?);
                    self.check_len(out.len() as u64)?;
                }
            }
        }
        Ok(out)
    }

    fn comprehension(
        &mut self,
        generators: &[Comprehension],
        emit: &mut dyn FnMut(&mut Self) -> EvalResult<()>,
    ) -> EvalResult<()> {
        let Some(first) = generators.first() else {
            return Ok(());
        };
        // The outermost iterable is evaluated in the enclosing scope
        let iterable = self.eval(&first.iter)?;
        let scope = Scope::child(self.scope.clone());
        let saved = std::mem::replace(&mut self.scope, Some(scope));
        let result = self.comprehension_level(generators, 0, Some(iterable), emit);
        self.scope = saved;
        result
    }

    fn comprehension_level(
        &mut self,
        generators: &[Comprehension],
        level: usize,
        iterable: Option<Value>,
        emit: &mut dyn FnMut(&mut Self) -> EvalResult<()>,
    ) -> EvalResult<()> {
        let Some(generator) = generators.get(level) else {
            return emit(self);
        };
        let iterable = match iterable {
            Some(iterable) => iterable,
            None => self.eval(&generator.iter)?,
        };
        'items: for item in iterable.iter()? {
            self.tick()?;
            self.assign(&generator.target, item)?;
            for condition in &generator.conditions {
                if !self.eval(condition)?.truthy() {
                    continue 'items;
                }
            }
            ensure_sufficient_stack(|| {
                self.comprehension_level(generators, level + 1, None, emit)
            })?;
        }
        Ok(())
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    pub fn get_attribute(&mut self, obj: &Value, attr: &str) -> EvalResult<Value> {
        policy::check_attribute(attr)?;
        match obj {
            Value::Module(module) => module.get(attr).ok_or_else(|| {
                SafepyError::attribute_error(format!(
                    "module '{}' has no attribute '{}'",
                    module.name, attr
                ))
                .into()
            }),
            _ => Ok(methods::get_attribute(obj, attr)?),
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn eval_call(&mut self, func: &Expr, args: &[Argument]) -> EvalResult<Value> {
        if let Expr::Attribute { value, attr } = func {
            let receiver = self.eval(value)?;
            let plain_receiver = !matches!(
                receiver,
                Value::Module(_)
                    | Value::Builtin(_)
                    | Value::Function(_)
                    | Value::Partial(_)
                    | Value::Tool(_)
            );
            if plain_receiver {
                policy::check_attribute(attr)?;
                let args = self.eval_arguments(args)?;
                return methods::call_method(self, &receiver, attr, args);
            }
            let callee = self.get_attribute(&receiver, attr)?;
            let args = self.eval_arguments(args)?;
            return self.call(&callee, args);
        }
        let callee = self.eval(func)?;
        let args = self.eval_arguments(args)?;
        self.call(&callee, args)
    }

    fn eval_arguments(&mut self, args: &[Argument]) -> EvalResult<Arguments> {
        let mut out = Arguments::default();
        for arg in args {
            match arg {
                Argument::Positional(expr) => {
                    let value = self.eval(expr)?;
                    out.positional.push(value);
                }
                Argument::Star(expr) => {
                    let value = self.eval(expr)?;
                    let items = self.collect(&value)?;
                    out.positional.extend(items);
                }
                Argument::Keyword(name, expr) => {
                    let value = self.eval(expr)?;
                    push_keyword(&mut out, name.clone(), value)?;
                }
                Argument::DoubleStar(expr) => match self.eval(expr)? {
                    Value::Dict(mapping) => {
                        for (key, value) in mapping.borrow().items() {
                            let Value::Str(key) = key else {
                                return Err(
                                    SafepyError::type_error("keywords must be strings").into()
                                );
                            };
                            push_keyword(&mut out, key.to_string(), value)?;
                        }
                    }
                    other => {
                        return Err(SafepyError::type_error(format!(
                            "argument after ** must be a mapping, not {}",
                            other.type_name()
                        ))
                        .into())
                    }
                },
            }
        }
        Ok(out)
    }

    /// Call any callable value
    pub fn call(&mut self, func: &Value, args: Arguments) -> EvalResult<Value> {
        match func {
            Value::Function(function) => self.call_function(function, args),
            Value::Builtin(builtin) => (builtin.func)(self, args),
            Value::Tool(tool) => {
                tracing::debug!(tool = tool.name(), "tool call");
                let result = tool.call(args)?;
                if tool.name() == "final_answer" {
                    return Err(Interrupt::FinalAnswer(result));
                }
                Ok(result)
            }
            Value::Method(method) => match &method.receiver {
                Value::Builtin(owner) if owner.kind == BuiltinKind::Type => {
                    methods::call_unbound(self, owner.name, &method.name, args)
                }
                receiver => {
                    let receiver = receiver.clone();
                    methods::call_method(self, &receiver, &method.name, args)
                }
            },
            Value::Partial(partial) => {
                let mut merged = Arguments::new(partial.args.clone());
                merged.positional.extend(args.positional);
                merged.keywords = partial.keywords.clone();
                for (name, value) in args.keywords {
                    match merged.keywords.iter_mut().find(|(k, _)| *k == name) {
                        Some(slot) => slot.1 = value,
                        None => merged.keywords.push((name, value)),
                    }
                }
                let func = partial.func.clone();
                self.call(&func, merged)
            }
            other => Err(SafepyError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    /// Call with positional arguments only
    pub fn call_with(&mut self, func: &Value, args: Vec<Value>) -> EvalResult<Value> {
        self.call(func, Arguments::new(args))
    }

    fn make_function(&mut self, def: &Rc<FunctionDef>) -> EvalResult<Value> {
        if !def.decorators.is_empty() {
            return Err(
                SafepyError::SyntaxRestriction("decorators are not allowed".to_string()).into(),
            );
        }
        let mut defaults = Vec::with_capacity(def.params.positional.len());
        for param in &def.params.positional {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            });
        }
        let mut kw_defaults = Vec::with_capacity(def.params.kwonly.len());
        for param in &def.params.kwonly {
            kw_defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            });
        }
        Ok(Value::Function(Rc::new(Function {
            def: def.clone(),
            defaults,
            kw_defaults,
            closure: self.scope.clone(),
        })))
    }

    fn call_function(&mut self, function: &Rc<Function>, args: Arguments) -> EvalResult<Value> {
        if self.call_depth >= self.limits.max_call_depth {
            return Err(SafepyError::RuntimeRestriction(format!(
                "RecursionError: maximum recursion depth of {} exceeded",
                self.limits.max_call_depth
            ))
            .into());
        }
        let scope = Scope::child(function.closure.clone());
        bind_arguments(function, args, &scope)?;

        let saved = std::mem::replace(&mut self.scope, Some(scope));
        self.call_depth += 1;
        let result = self.exec_block(&function.def.body);
        self.call_depth -= 1;
        self.scope = saved;

        match result? {
            Flow::Return(value) => Ok(value),
            Flow::Next(_) => Ok(Value::None),
            Flow::Break | Flow::Continue => Err(SafepyError::SyntaxRestriction(
                "'break' or 'continue' outside loop".to_string(),
            )
            .into()),
        }
    }

    // ========================================================================
    // Helpers for builtins
    // ========================================================================

    /// Materialise an iterable, refusing absurd sizes up front
    pub fn collect(&mut self, value: &Value) -> EvalResult<Vec<Value>> {
        let iter = value.iter()?;
        if iter.remaining() > self.limits.max_collection_len as u64 {
            return Err(self.memory_error().into());
        }
        Ok(iter.collect())
    }

    /// Stable sort by an optional key function
    pub fn sort_values(
        &mut self,
        items: Vec<Value>,
        key: Option<&Value>,
        reverse: bool,
    ) -> EvalResult<Vec<Value>> {
        let keys = match key {
            Some(func) if !func.is_none() => {
                let mut keys = Vec::with_capacity(items.len());
                for item in &items {
                    keys.push(self.call_with(func, vec![item.clone()])?);
                }
                keys
            }
            _ => items.clone(),
        };
        let mut order: Vec<usize> = (0..items.len()).collect();
        operators::merge_sort(&mut order, &mut |a, b| {
            let (a, b) = if reverse { (b, a) } else { (a, b) };
            Ok(keys[a].compare(&keys[b], "<")? == Some(std::cmp::Ordering::Less))
        })?;
        let mut slots: Vec<Option<Value>> = items.into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect())
    }
}

fn push_keyword(args: &mut Arguments, name: String, value: Value) -> Result<()> {
    if args.keywords.iter().any(|(k, _)| *k == name) {
        return Err(SafepyError::type_error(format!(
            "got multiple values for keyword argument '{}'",
            name
        )));
    }
    args.keywords.push((name, value));
    Ok(())
}

/// Bind call arguments to a function's parameters in a fresh scope
fn bind_arguments(function: &Function, args: Arguments, scope: &ScopeRef) -> Result<()> {
    let def = &function.def;
    let params = &def.params;
    let name = def.name.as_str();

    let mut slots: Vec<Option<Value>> = vec![None; params.positional.len()];
    let mut positional = args.positional.into_iter();
    for slot in slots.iter_mut() {
        match positional.next() {
            Some(value) => *slot = Some(value),
            None => break,
        }
    }
    let extra: Vec<Value> = positional.collect();
    if !extra.is_empty() && params.vararg.is_none() {
        let given = params.positional.len() + extra.len();
        return Err(SafepyError::type_error(format!(
            "{}() takes {} positional argument{} but {} {} given",
            name,
            params.positional.len(),
            if params.positional.len() == 1 { "" } else { "s" },
            given,
            if given == 1 { "was" } else { "were" }
        )));
    }

    let mut kw_slots: Vec<Option<Value>> = vec![None; params.kwonly.len()];
    let mut kwargs = Dict::new();
    for (key, value) in args.keywords {
        if let Some(i) = params.positional.iter().position(|p| p.name == key) {
            if slots[i].is_some() {
                return Err(SafepyError::type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    name, key
                )));
            }
            slots[i] = Some(value);
        } else if let Some(i) = params.kwonly.iter().position(|p| p.name == key) {
            kw_slots[i] = Some(value);
        } else if params.kwarg.is_some() {
            kwargs.insert(Value::str(key), value)?;
        } else {
            return Err(SafepyError::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                name, key
            )));
        }
    }

    let mut scope = scope.borrow_mut();
    for (i, param) in params.positional.iter().enumerate() {
        let value = match slots[i].take() {
            Some(value) => value,
            None => function.defaults.get(i).cloned().flatten().ok_or_else(|| {
                SafepyError::type_error(format!(
                    "{}() missing 1 required positional argument: '{}'",
                    name, param.name
                ))
            })?,
        };
        scope.set(&param.name, value);
    }
    if let Some(vararg) = &params.vararg {
        scope.set(vararg, Value::tuple(extra));
    }
    for (i, param) in params.kwonly.iter().enumerate() {
        let value = match kw_slots[i].take() {
            Some(value) => value,
            None => function.kw_defaults.get(i).cloned().flatten().ok_or_else(|| {
                SafepyError::type_error(format!(
                    "{}() missing 1 required keyword-only argument: '{}'",
                    name, param.name
                ))
            })?,
        };
        scope.set(&param.name, value);
    }
    if let Some(kwarg) = &params.kwarg {
        scope.set(kwarg, Value::dict(kwargs));
    }
    Ok(())
}
