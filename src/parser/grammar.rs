//! Pest grammar parser for the sandboxed Python subset

use std::rc::Rc;

use pest::error::InputLocation;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::error::{Result, SafepyError};
use crate::parser::ast::*;
use crate::parser::layout::{self, Layout, DEDENT, INDENT};
use crate::stack::{ensure_sufficient_stack, with_parse_stack};

#[derive(Parser)]
#[grammar = "../grammar/safepy.pest"]
pub struct SafepyParser;

/// Largest source unit accepted, in bytes
pub const MAX_SOURCE_LEN: usize = 1 << 20;

/// Parse a source unit into an AST
pub fn parse_program(source: &str) -> Result<Program> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(SafepyError::SyntaxRestriction(format!(
            "source is {} bytes, the limit is {}",
            source.len(),
            MAX_SOURCE_LEN
        )));
    }

    let layout = layout::layout(source)?;
    let pairs = with_parse_stack(|| SafepyParser::parse(Rule::program, &layout.text))
        .map_err(|e| syntax_error(&layout, source, &e))?;

    let program = pairs
        .into_iter()
        .next()
        .ok_or_else(|| SafepyError::SyntaxRestriction("empty parse".to_string()))?;

    let builder = Builder {
        layout: Some(&layout),
        fixed_line: 1,
    };
    let mut body = Vec::new();
    for pair in program.into_inner() {
        if pair.as_rule() != Rule::EOI {
            builder.statement(pair, &mut body)?;
        }
    }
    Ok(Program { body })
}

fn syntax_error(layout: &Layout, source: &str, err: &pest::error::Error<Rule>) -> SafepyError {
    let offset = match err.location {
        InputLocation::Pos(pos) => pos,
        InputLocation::Span((start, _)) => start,
    };
    let header = unopened_block(&layout.text, offset);
    let line = layout.line_for_offset(header.unwrap_or(offset));
    let before = layout.text.get(..offset).unwrap_or("");
    let message = match layout.text.get(offset..).and_then(|rest| rest.chars().next()) {
        _ if header.is_some() => "expected an indented block",
        Some(INDENT) => "unexpected indent",
        Some(DEDENT) => "unexpected dedent",
        _ if before.trim_end_matches([' ', '\t']).ends_with(":\n") => {
            "expected an indented block"
        }
        _ => "invalid syntax",
    };
    let text = source.lines().nth(line.saturating_sub(1)).unwrap_or("").trim();
    if text.is_empty() {
        SafepyError::SyntaxRestriction(message.to_string()).at_line(line)
    } else {
        SafepyError::SyntaxRestriction(format!("{} in `{}`", message, text)).at_line(line)
    }
}

/// Start of a block header whose next line does not open a block. pest may
/// report a failed compound statement at its first line, so the search
/// starts there and stays inside that statement's body.
fn unopened_block(text: &str, offset: usize) -> Option<usize> {
    let start = text.get(..offset)?.rfind('\n').map_or(0, |i| i + 1);
    if start > 0 {
        let previous = text[..start - 1].rfind('\n').map_or(0, |i| i + 1);
        let is_header = text[previous..start]
            .trim_end_matches(['\n', ' ', '\t'])
            .ends_with(':');
        if is_header && !text[start..].starts_with(INDENT) {
            return Some(previous);
        }
    }
    let mut depth = 0i64;
    let mut line_start = start;
    for (i, line) in text[start..].split_inclusive('\n').enumerate() {
        if i > 0 {
            for marker in line.chars().take_while(|c| *c == INDENT || *c == DEDENT) {
                depth += if marker == INDENT { 1 } else { -1 };
            }
            if depth <= 0 {
                return None;
            }
        }
        let line_end = line_start + line.len();
        let is_header = line.trim_end_matches(['\n', ' ', '\t']).ends_with(':');
        if !is_header && i == 0 {
            return None;
        }
        if is_header && !text[line_end..].starts_with(INDENT) {
            return Some(line_start);
        }
        line_start = line_end;
    }
    None
}

fn unexpected(pair: &Pair<Rule>) -> SafepyError {
    SafepyError::internal(format!("unexpected grammar rule {:?}", pair.as_rule()))
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_and
            | Rule::kw_as
            | Rule::kw_assert
            | Rule::kw_async
            | Rule::kw_await
            | Rule::kw_break
            | Rule::kw_class
            | Rule::kw_continue
            | Rule::kw_def
            | Rule::kw_del
            | Rule::kw_elif
            | Rule::kw_else
            | Rule::kw_except
            | Rule::kw_finally
            | Rule::kw_for
            | Rule::kw_from
            | Rule::kw_global
            | Rule::kw_if
            | Rule::kw_import
            | Rule::kw_in
            | Rule::kw_is
            | Rule::kw_lambda
            | Rule::kw_nonlocal
            | Rule::kw_not
            | Rule::kw_or
            | Rule::kw_pass
            | Rule::kw_raise
            | Rule::kw_return
            | Rule::kw_try
            | Rule::kw_while
            | Rule::kw_with
            | Rule::kw_yield
    )
}

/// Children of a pair with keyword tokens removed
fn significant(pair: Pair<'_, Rule>) -> impl Iterator<Item = Pair<'_, Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

fn first_child(pair: Pair<'_, Rule>) -> Result<Pair<'_, Rule>> {
    let rule = pair.as_rule();
    significant(pair)
        .next()
        .ok_or_else(|| SafepyError::internal(format!("{:?} has no children", rule)))
}

struct Builder<'a> {
    layout: Option<&'a Layout>,
    /// Line used when parsing text that is not part of the layout, such as
    /// f-string fields
    fixed_line: usize,
}

impl<'a> Builder<'a> {
    fn line(&self, pair: &Pair<Rule>) -> usize {
        match self.layout {
            Some(layout) => layout.line_for_offset(pair.as_span().start()),
            None => self.fixed_line,
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn statement(&self, pair: Pair<Rule>, out: &mut Vec<Stmt>) -> Result<()> {
        ensure_sufficient_stack(|| self.statement_inner(pair, out))
    }

    fn statement_inner(&self, pair: Pair<Rule>, out: &mut Vec<Stmt>) -> Result<()> {
        let line = self.line(&pair);
        let kind = match pair.as_rule() {
            Rule::simple_stmts => {
                for inner in pair.into_inner() {
                    let line = self.line(&inner);
                    let kind = self
                        .simple_statement(inner)
                        .map_err(|e| e.at_line(line))?;
                    out.push(Stmt { line, kind });
                }
                return Ok(());
            }
            Rule::if_stmt => self.if_statement(pair),
            Rule::while_stmt => self.while_statement(pair),
            Rule::for_stmt => self.for_statement(pair),
            Rule::funcdef => self
                .function_def(pair, Vec::new())
                .map(|def| StmtKind::FunctionDef(Rc::new(def))),
            Rule::decorated => self.decorated(pair),
            Rule::forbidden_block => self.forbidden(pair),
            _ => Err(unexpected(&pair)),
        }
        .map_err(|e| e.at_line(line))?;
        out.push(Stmt { line, kind });
        Ok(())
    }

    fn suite(&self, pair: Pair<Rule>) -> Result<Vec<Stmt>> {
        let mut body = Vec::new();
        for inner in pair.into_inner() {
            self.statement(inner, &mut body)?;
        }
        Ok(body)
    }

    fn else_suite(&self, pair: Option<Pair<Rule>>) -> Result<Vec<Stmt>> {
        match pair {
            Some(clause) => self.suite(first_child(clause)?),
            None => Ok(Vec::new()),
        }
    }

    fn simple_statement(&self, pair: Pair<Rule>) -> Result<StmtKind> {
        match pair.as_rule() {
            Rule::pass_stmt => Ok(StmtKind::Pass),
            Rule::break_stmt => Ok(StmtKind::Break),
            Rule::continue_stmt => Ok(StmtKind::Continue),
            Rule::return_stmt => {
                let value = significant(pair)
                    .next()
                    .map(|p| self.star_items(p))
                    .transpose()?;
                Ok(StmtKind::Return(value))
            }
            Rule::del_stmt => {
                let target = self.target_list(first_child(pair)?)?;
                let targets = match target {
                    Target::Sequence(items) => items,
                    single => vec![single],
                };
                Ok(StmtKind::Delete(targets))
            }
            Rule::assert_stmt => {
                let mut parts = significant(pair);
                let test = self.expr(
                    parts
                        .next()
                        .ok_or_else(|| SafepyError::internal("assert without test"))?,
                )?;
                let msg = parts.next().map(|p| self.expr(p)).transpose()?;
                Ok(StmtKind::Assert { test, msg })
            }
            Rule::import_stmt => {
                let names = significant(pair)
                    .map(|p| self.import_alias(p))
                    .collect::<Result<Vec<_>>>()?;
                Ok(StmtKind::Import(names))
            }
            Rule::from_import => self.from_import(pair),
            Rule::forbidden_simple => self.forbidden(pair),
            Rule::expr_stmt => self.expr_statement(pair),
            _ => Err(unexpected(&pair)),
        }
    }

    fn if_statement(&self, pair: Pair<Rule>) -> Result<StmtKind> {
        let mut branches = Vec::new();
        let mut orelse = Vec::new();
        let mut inner = significant(pair);

        let test = self.expr(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("if without condition"))?,
        )?;
        let body = self.suite(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("if without body"))?,
        )?;
        branches.push((test, body));

        for clause in inner {
            match clause.as_rule() {
                Rule::elif_clause => {
                    let mut parts = significant(clause);
                    let test = self.expr(
                        parts
                            .next()
                            .ok_or_else(|| SafepyError::internal("elif without condition"))?,
                    )?;
                    let body = self.suite(
                        parts
                            .next()
                            .ok_or_else(|| SafepyError::internal("elif without body"))?,
                    )?;
                    branches.push((test, body));
                }
                Rule::else_clause => orelse = self.else_suite(Some(clause))?,
                _ => return Err(unexpected(&clause)),
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn while_statement(&self, pair: Pair<Rule>) -> Result<StmtKind> {
        let mut inner = significant(pair);
        let test = self.expr(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("while without condition"))?,
        )?;
        let body = self.suite(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("while without body"))?,
        )?;
        let orelse = self.else_suite(inner.next())?;
        Ok(StmtKind::While { test, body, orelse })
    }

    fn for_statement(&self, pair: Pair<Rule>) -> Result<StmtKind> {
        let mut inner = significant(pair);
        let target = self.target_list(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("for without target"))?,
        )?;
        let iter = self.star_items(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("for without iterable"))?,
        )?;
        let body = self.suite(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("for without body"))?,
        )?;
        let orelse = self.else_suite(inner.next())?;
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn decorated(&self, pair: Pair<Rule>) -> Result<StmtKind> {
        let mut decorators = Vec::new();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::decorator => decorators.push(self.expr(first_child(inner)?)?),
                Rule::funcdef => {
                    let def = self.function_def(inner, decorators)?;
                    return Ok(StmtKind::FunctionDef(Rc::new(def)));
                }
                Rule::forbidden_block => return self.forbidden(inner),
                _ => return Err(unexpected(&inner)),
            }
        }
        Err(SafepyError::internal("decorator without definition"))
    }

    fn forbidden(&self, pair: Pair<Rule>) -> Result<StmtKind> {
        let keyword = pair
            .into_inner()
            .next()
            .ok_or_else(|| SafepyError::internal("forbidden statement without keyword"))?;
        ForbiddenKind::from_keyword(keyword.as_str())
            .map(StmtKind::Forbidden)
            .ok_or_else(|| unexpected(&keyword))
    }

    fn import_alias(&self, pair: Pair<Rule>) -> Result<ImportAlias> {
        let mut parts = significant(pair);
        let name = parts
            .next()
            .ok_or_else(|| SafepyError::internal("import without name"))?
            .as_str()
            .to_string();
        let alias = parts.next().map(|p| p.as_str().to_string());
        Ok(ImportAlias { name, alias })
    }

    fn from_import(&self, pair: Pair<Rule>) -> Result<StmtKind> {
        let mut module = String::new();
        let mut level = 0;
        let mut names = Vec::new();
        let mut wildcard = false;
        for inner in significant(pair) {
            match inner.as_rule() {
                Rule::relative_dots => level = inner.as_str().len(),
                Rule::dotted_name => module = inner.as_str().to_string(),
                Rule::import_star => wildcard = true,
                Rule::import_as_name => names.push(self.import_alias(inner)?),
                _ => return Err(unexpected(&inner)),
            }
        }
        Ok(StmtKind::ImportFrom {
            module,
            names,
            level,
            wildcard,
        })
    }

    fn expr_statement(&self, pair: Pair<Rule>) -> Result<StmtKind> {
        let mut inner = pair.into_inner();
        let head = inner
            .next()
            .ok_or_else(|| SafepyError::internal("empty expression statement"))?;
        let tails: Vec<Pair<Rule>> = inner.collect();
        let Some(first_tail) = tails.first() else {
            return Ok(StmtKind::Expr(self.star_items(head)?));
        };

        match first_tail.as_rule() {
            Rule::annotation_tail => {
                let target = self.single_target(self.star_items(head)?, "annotated")?;
                let value = first_tail
                    .clone()
                    .into_inner()
                    .nth(1)
                    .map(|p| self.star_items(p))
                    .transpose()?;
                Ok(StmtKind::AnnAssign { target, value })
            }
            Rule::augassign_tail => {
                let target = self.single_target(self.star_items(head)?, "augmented")?;
                let mut parts = first_tail.clone().into_inner();
                let op_text = parts
                    .next()
                    .ok_or_else(|| SafepyError::internal("augmented assignment without operator"))?
                    .as_str();
                let op = BinOp::from_symbol(op_text.trim_end_matches('='))
                    .ok_or_else(|| SafepyError::internal(format!("operator {}", op_text)))?;
                let value = self.star_items(
                    parts
                        .next()
                        .ok_or_else(|| SafepyError::internal("augmented assignment without value"))?,
                )?;
                Ok(StmtKind::AugAssign { target, op, value })
            }
            Rule::assign_tail => {
                let mut exprs = vec![self.star_items(head)?];
                for tail in tails {
                    exprs.push(self.star_items(first_child(tail)?)?);
                }
                let value = exprs
                    .pop()
                    .ok_or_else(|| SafepyError::internal("assignment without value"))?;
                let targets = exprs
                    .into_iter()
                    .map(|e| self.target_from_expr(e))
                    .collect::<Result<Vec<_>>>()?;
                Ok(StmtKind::Assign { targets, value })
            }
            _ => Err(unexpected(first_tail)),
        }
    }

    // ========================================================================
    // Functions
    // ========================================================================

    fn function_def(&self, pair: Pair<Rule>, decorators: Vec<Expr>) -> Result<FunctionDef> {
        let line = self.line(&pair);
        let mut name = String::new();
        let mut params = Parameters::default();
        let mut body = Vec::new();
        for inner in significant(pair) {
            match inner.as_rule() {
                Rule::identifier => name = inner.as_str().to_string(),
                Rule::parameters => params = self.parameters(inner)?,
                Rule::return_annotation => {}
                Rule::suite => body = self.suite(inner)?,
                _ => return Err(unexpected(&inner)),
            }
        }
        Ok(FunctionDef {
            name,
            line,
            params,
            body,
            decorators,
            is_lambda: false,
        })
    }

    fn lambda(&self, pair: Pair<Rule>) -> Result<Expr> {
        let line = self.line(&pair);
        let mut params = Parameters::default();
        let mut body = None;
        for inner in significant(pair) {
            match inner.as_rule() {
                Rule::lambda_params => params = self.parameters(inner)?,
                Rule::expression => body = Some(self.expr(inner)?),
                _ => return Err(unexpected(&inner)),
            }
        }
        let body = body.ok_or_else(|| SafepyError::internal("lambda without body"))?;
        Ok(Expr::Lambda(Rc::new(FunctionDef {
            name: "<lambda>".to_string(),
            line,
            params,
            body: vec![Stmt {
                line,
                kind: StmtKind::Return(Some(body)),
            }],
            decorators: Vec::new(),
            is_lambda: true,
        })))
    }

    fn parameters(&self, pair: Pair<Rule>) -> Result<Parameters> {
        let mut params = Parameters::default();
        let mut keyword_only = false;
        let mut bare_star = false;
        let mut seen: Vec<String> = Vec::new();

        let mut check_duplicate = |name: &str| -> Result<()> {
            if seen.iter().any(|s| s == name) {
                return Err(SafepyError::SyntaxRestriction(format!(
                    "duplicate argument '{}' in function definition",
                    name
                )));
            }
            seen.push(name.to_string());
            Ok(())
        };

        for item in pair.into_inner() {
            match item.as_rule() {
                Rule::param | Rule::lambda_param => {
                    let mut name = String::new();
                    let mut default = None;
                    for part in item.into_inner() {
                        match part.as_rule() {
                            Rule::identifier => name = part.as_str().to_string(),
                            Rule::annotation => {}
                            Rule::param_default => default = Some(self.expr(first_child(part)?)?),
                            _ => return Err(unexpected(&part)),
                        }
                    }
                    check_duplicate(&name)?;
                    if keyword_only {
                        bare_star = false;
                        params.kwonly.push(Param { name, default });
                    } else {
                        let after_default = params.positional.iter().any(|p| p.default.is_some());
                        if after_default && default.is_none() {
                            return Err(SafepyError::SyntaxRestriction(
                                "non-default argument follows default argument".to_string(),
                            ));
                        }
                        params.positional.push(Param { name, default });
                    }
                }
                Rule::varargs_param | Rule::lambda_varargs => {
                    let name = first_child(item)?.as_str().to_string();
                    check_duplicate(&name)?;
                    params.vararg = Some(name);
                    keyword_only = true;
                }
                Rule::bare_star => {
                    keyword_only = true;
                    bare_star = true;
                }
                Rule::slash => {}
                Rule::kwargs_param | Rule::lambda_kwargs => {
                    let name = first_child(item)?.as_str().to_string();
                    check_duplicate(&name)?;
                    params.kwarg = Some(name);
                }
                _ => return Err(unexpected(&item)),
            }
        }

        if bare_star {
            return Err(SafepyError::SyntaxRestriction(
                "named arguments must follow bare *".to_string(),
            ));
        }
        Ok(params)
    }

    // ========================================================================
    // Targets
    // ========================================================================

    fn target_list(&self, pair: Pair<Rule>) -> Result<Target> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::primary => items.push(self.target_from_expr(self.expr(inner)?)?),
                Rule::star_target => {
                    let inner_expr = self.expr(first_child(inner)?)?;
                    items.push(Target::Starred(Box::new(self.target_from_expr(inner_expr)?)));
                }
                Rule::trailing_comma => trailing_comma = true,
                _ => return Err(unexpected(&inner)),
            }
        }
        if items.len() == 1 && !trailing_comma && !matches!(items[0], Target::Starred(_)) {
            return Ok(items.remove(0));
        }
        check_single_star(&items)?;
        Ok(Target::Sequence(items))
    }

    fn single_target(&self, expr: Expr, context: &str) -> Result<Target> {
        match expr {
            Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. } => {
                self.target_from_expr(expr)
            }
            other => Err(SafepyError::SyntaxRestriction(format!(
                "illegal target for {} assignment: {}",
                context,
                describe_expr(&other)
            ))),
        }
    }

    fn target_from_expr(&self, expr: Expr) -> Result<Target> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Attribute { value, attr } => Ok(Target::Attribute { value, attr }),
            Expr::Subscript { value, index } => Ok(Target::Subscript { value, index }),
            Expr::Tuple(items) | Expr::List(items) => {
                let targets = items
                    .into_iter()
                    .map(|e| self.target_from_expr(e))
                    .collect::<Result<Vec<_>>>()?;
                check_single_star(&targets)?;
                Ok(Target::Sequence(targets))
            }
            Expr::Starred(inner) => Ok(Target::Starred(Box::new(self.target_from_expr(*inner)?))),
            other => Err(SafepyError::SyntaxRestriction(format!(
                "cannot assign to {}",
                describe_expr(&other)
            ))),
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn star_items(&self, pair: Pair<Rule>) -> Result<Expr> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::trailing_comma => trailing_comma = true,
                _ => items.push(self.expr(inner)?),
            }
        }
        if items.len() == 1 && !trailing_comma {
            let item = items.remove(0);
            if matches!(item, Expr::Starred(_)) {
                return Err(SafepyError::SyntaxRestriction(
                    "can't use starred expression here".to_string(),
                ));
            }
            return Ok(item);
        }
        Ok(Expr::Tuple(items))
    }

    fn expr(&self, pair: Pair<Rule>) -> Result<Expr> {
        ensure_sufficient_stack(|| self.expr_inner(pair))
    }

    fn expr_inner(&self, pair: Pair<Rule>) -> Result<Expr> {
        match pair.as_rule() {
            Rule::expression | Rule::slice_upper | Rule::dict_value => self.expr(first_child(pair)?),
            Rule::lambda_def => self.lambda(pair),
            Rule::conditional => {
                let mut parts: Vec<Pair<Rule>> = significant(pair).collect();
                if parts.len() == 1 {
                    return self.expr(parts.remove(0));
                }
                let orelse = self.expr(parts.remove(2))?;
                let test = self.expr(parts.remove(1))?;
                let body = self.expr(parts.remove(0))?;
                Ok(Expr::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                })
            }
            Rule::disjunction | Rule::conjunction => {
                let op = if pair.as_rule() == Rule::disjunction {
                    BoolOp::Or
                } else {
                    BoolOp::And
                };
                let mut values = significant(pair)
                    .map(|p| self.expr(p))
                    .collect::<Result<Vec<_>>>()?;
                if values.len() == 1 {
                    return Ok(values.remove(0));
                }
                Ok(Expr::BoolOp { op, values })
            }
            Rule::inversion => {
                let mut inner = pair.into_inner();
                let first = inner
                    .next()
                    .ok_or_else(|| SafepyError::internal("empty inversion"))?;
                if first.as_rule() == Rule::kw_not {
                    let operand = self.expr(
                        inner
                            .next()
                            .ok_or_else(|| SafepyError::internal("not without operand"))?,
                    )?;
                    return Ok(Expr::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(operand),
                    });
                }
                self.expr(first)
            }
            Rule::comparison => self.comparison(pair),
            Rule::bitor | Rule::bitxor | Rule::bitand => {
                let op = match pair.as_rule() {
                    Rule::bitor => BinOp::BitOr,
                    Rule::bitxor => BinOp::BitXor,
                    _ => BinOp::BitAnd,
                };
                let mut operands = pair.into_inner();
                let mut left = self.expr(
                    operands
                        .next()
                        .ok_or_else(|| SafepyError::internal("empty bit operation"))?,
                )?;
                for right in operands {
                    left = Expr::Binary {
                        left: Box::new(left),
                        op,
                        right: Box::new(self.expr(right)?),
                    };
                }
                Ok(left)
            }
            Rule::shift | Rule::sum | Rule::term => {
                let mut inner = pair.into_inner();
                let mut left = self.expr(
                    inner
                        .next()
                        .ok_or_else(|| SafepyError::internal("empty binary operation"))?,
                )?;
                while let Some(op_pair) = inner.next() {
                    let op = BinOp::from_symbol(op_pair.as_str())
                        .ok_or_else(|| unexpected(&op_pair))?;
                    let right = self.expr(
                        inner
                            .next()
                            .ok_or_else(|| SafepyError::internal("operator without operand"))?,
                    )?;
                    left = Expr::Binary {
                        left: Box::new(left),
                        op,
                        right: Box::new(right),
                    };
                }
                Ok(left)
            }
            Rule::factor => {
                let mut inner = pair.into_inner();
                let first = inner
                    .next()
                    .ok_or_else(|| SafepyError::internal("empty factor"))?;
                if first.as_rule() != Rule::unary_op {
                    return self.expr(first);
                }
                let op = match first.as_str() {
                    "-" => UnaryOp::Neg,
                    "+" => UnaryOp::Pos,
                    _ => UnaryOp::Invert,
                };
                let operand = inner
                    .next()
                    .ok_or_else(|| SafepyError::internal("unary operator without operand"))?;
                // -9223372036854775808 only fits once the sign is applied
                if op == UnaryOp::Neg && is_int_literal(&operand) {
                    if let Some(value) = negative_int_literal(operand.as_str()) {
                        return Ok(Expr::Constant(Constant::Int(value)));
                    }
                }
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(self.expr(operand)?),
                })
            }
            Rule::power => {
                let mut inner = pair.into_inner();
                let base = self.expr(
                    inner
                        .next()
                        .ok_or_else(|| SafepyError::internal("empty power"))?,
                )?;
                match inner.next() {
                    Some(exponent) => Ok(Expr::Binary {
                        left: Box::new(base),
                        op: BinOp::Pow,
                        right: Box::new(self.expr(exponent)?),
                    }),
                    None => Ok(base),
                }
            }
            Rule::primary => self.primary(pair),
            Rule::starred | Rule::dstar_item => Ok(Expr::Starred(Box::new(
                self.expr(first_child(pair)?)?,
            ))),
            Rule::kw_none => Ok(Expr::Constant(Constant::None)),
            Rule::kw_true => Ok(Expr::Constant(Constant::Bool(true))),
            Rule::kw_false => Ok(Expr::Constant(Constant::Bool(false))),
            Rule::int_lit => parse_int(pair.as_str()).map(|v| Expr::Constant(Constant::Int(v))),
            Rule::float_lit => parse_float(pair.as_str()).map(|v| Expr::Constant(Constant::Float(v))),
            Rule::strings => self.strings(pair),
            Rule::identifier => Ok(Expr::Name(pair.as_str().to_string())),
            Rule::paren_form => self.paren_form(pair),
            Rule::list_display => self.list_display(pair),
            Rule::brace_display => self.brace_display(pair),
            _ => Err(unexpected(&pair)),
        }
    }

    fn comparison(&self, pair: Pair<Rule>) -> Result<Expr> {
        let mut inner = pair.into_inner();
        let left = self.expr(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("empty comparison"))?,
        )?;
        let mut ops = Vec::new();
        while let Some(op_pair) = inner.next() {
            let text = op_pair.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
            let op = match text.as_str() {
                "==" => CmpOp::Eq,
                "!=" => CmpOp::NotEq,
                "<" => CmpOp::Lt,
                "<=" => CmpOp::LtE,
                ">" => CmpOp::Gt,
                ">=" => CmpOp::GtE,
                "in" => CmpOp::In,
                "not in" => CmpOp::NotIn,
                "is" => CmpOp::Is,
                "is not" => CmpOp::IsNot,
                _ => return Err(unexpected(&op_pair)),
            };
            let right = self.expr(
                inner
                    .next()
                    .ok_or_else(|| SafepyError::internal("comparison without operand"))?,
            )?;
            ops.push((op, right));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::Compare {
            left: Box::new(left),
            ops,
        })
    }

    fn primary(&self, pair: Pair<Rule>) -> Result<Expr> {
        let mut inner = pair.into_inner();
        let mut value = self.expr(
            inner
                .next()
                .ok_or_else(|| SafepyError::internal("empty primary"))?,
        )?;
        for trailer in inner {
            value = match trailer.as_rule() {
                Rule::call => {
                    let args = match trailer.into_inner().next() {
                        Some(arguments) => self.arguments(arguments)?,
                        None => Vec::new(),
                    };
                    Expr::Call {
                        func: Box::new(value),
                        args,
                    }
                }
                Rule::subscription => Expr::Subscript {
                    value: Box::new(value),
                    index: Box::new(self.subscripts(first_child(trailer)?)?),
                },
                Rule::attribute => Expr::Attribute {
                    value: Box::new(value),
                    attr: first_child(trailer)?.as_str().to_string(),
                },
                _ => return Err(unexpected(&trailer)),
            };
        }
        Ok(value)
    }

    fn arguments(&self, pair: Pair<Rule>) -> Result<Vec<Argument>> {
        let mut args = Vec::new();
        for arg in pair.into_inner() {
            let argument = match arg.as_rule() {
                Rule::kwarg => {
                    let mut parts = arg.into_inner();
                    let name = parts
                        .next()
                        .ok_or_else(|| SafepyError::internal("keyword argument without name"))?
                        .as_str()
                        .to_string();
                    let value = self.expr(
                        parts
                            .next()
                            .ok_or_else(|| SafepyError::internal("keyword argument without value"))?,
                    )?;
                    if args.iter().any(|a| matches!(a, Argument::Keyword(n, _) if *n == name)) {
                        return Err(SafepyError::SyntaxRestriction(format!(
                            "keyword argument repeated: {}",
                            name
                        )));
                    }
                    Argument::Keyword(name, value)
                }
                Rule::dstar_arg => Argument::DoubleStar(self.expr(first_child(arg)?)?),
                Rule::star_arg => Argument::Star(self.expr(first_child(arg)?)?),
                Rule::positional_arg => {
                    let mut parts = arg.into_inner();
                    let element = self.expr(
                        parts
                            .next()
                            .ok_or_else(|| SafepyError::internal("empty argument"))?,
                    )?;
                    let generators = parts
                        .map(|p| self.comprehension(p))
                        .collect::<Result<Vec<_>>>()?;
                    if generators.is_empty() {
                        Argument::Positional(element)
                    } else {
                        Argument::Positional(Expr::GeneratorExp {
                            element: Box::new(element),
                            generators,
                        })
                    }
                }
                _ => return Err(unexpected(&arg)),
            };
            args.push(argument);
        }
        Ok(args)
    }

    fn subscripts(&self, pair: Pair<Rule>) -> Result<Expr> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        for item in pair.into_inner() {
            match item.as_rule() {
                Rule::subscript_item => items.push(self.subscript_item(item)?),
                Rule::trailing_comma => trailing_comma = true,
                _ => return Err(unexpected(&item)),
            }
        }
        if items.len() == 1 && !trailing_comma {
            return Ok(items.remove(0));
        }
        Ok(Expr::Tuple(items))
    }

    fn subscript_item(&self, pair: Pair<Rule>) -> Result<Expr> {
        let mut lower = None;
        let mut slice = None;
        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::expression => lower = Some(Box::new(self.expr(part)?)),
                Rule::slice_rest => slice = Some(part),
                _ => return Err(unexpected(&part)),
            }
        }
        let Some(rest) = slice else {
            return lower
                .map(|b| *b)
                .ok_or_else(|| SafepyError::internal("empty subscript"));
        };

        let mut upper = None;
        let mut step = None;
        for part in rest.into_inner() {
            match part.as_rule() {
                Rule::slice_upper => upper = Some(Box::new(self.expr(part)?)),
                Rule::slice_step => {
                    step = part
                        .into_inner()
                        .next()
                        .map(|p| self.expr(p).map(Box::new))
                        .transpose()?
                }
                _ => return Err(unexpected(&part)),
            }
        }
        Ok(Expr::Slice { lower, upper, step })
    }

    fn comprehension(&self, pair: Pair<Rule>) -> Result<Comprehension> {
        let mut parts = significant(pair);
        let target = self.target_list(
            parts
                .next()
                .ok_or_else(|| SafepyError::internal("comprehension without target"))?,
        )?;
        let iter = self.expr(
            parts
                .next()
                .ok_or_else(|| SafepyError::internal("comprehension without iterable"))?,
        )?;
        let conditions = parts
            .map(|cond| self.expr(first_child(cond)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Comprehension {
            target,
            iter,
            conditions,
        })
    }

    /// Items, comprehension clauses and trailing comma of a bracketed display
    fn display_parts<'p>(
        &self,
        pair: Pair<'p, Rule>,
    ) -> (Vec<Pair<'p, Rule>>, Vec<Pair<'p, Rule>>, bool) {
        let mut items = Vec::new();
        let mut generators = Vec::new();
        let mut trailing_comma = false;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::comp_for => generators.push(inner),
                Rule::trailing_comma => trailing_comma = true,
                _ => items.push(inner),
            }
        }
        (items, generators, trailing_comma)
    }

    fn comprehension_parts(
        &self,
        mut items: Vec<Pair<Rule>>,
        generators: Vec<Pair<Rule>>,
    ) -> Result<(Expr, Vec<Comprehension>)> {
        let element = self.expr(items.remove(0))?;
        if matches!(element, Expr::Starred(_)) {
            return Err(SafepyError::SyntaxRestriction(
                "iterable unpacking cannot be used in comprehension".to_string(),
            ));
        }
        let generators = generators
            .into_iter()
            .map(|g| self.comprehension(g))
            .collect::<Result<Vec<_>>>()?;
        Ok((element, generators))
    }

    fn paren_form(&self, pair: Pair<Rule>) -> Result<Expr> {
        let (items, generators, trailing_comma) = self.display_parts(pair);
        if items.is_empty() {
            return Ok(Expr::Tuple(Vec::new()));
        }
        if !generators.is_empty() {
            let (element, generators) = self.comprehension_parts(items, generators)?;
            return Ok(Expr::GeneratorExp {
                element: Box::new(element),
                generators,
            });
        }
        let mut exprs = items
            .into_iter()
            .map(|p| self.expr(p))
            .collect::<Result<Vec<_>>>()?;
        if exprs.len() == 1 && !trailing_comma {
            let expr = exprs.remove(0);
            if matches!(expr, Expr::Starred(_)) {
                return Err(SafepyError::SyntaxRestriction(
                    "can't use starred expression here".to_string(),
                ));
            }
            return Ok(expr);
        }
        Ok(Expr::Tuple(exprs))
    }

    fn list_display(&self, pair: Pair<Rule>) -> Result<Expr> {
        let (items, generators, _) = self.display_parts(pair);
        if !generators.is_empty() {
            let (element, generators) = self.comprehension_parts(items, generators)?;
            return Ok(Expr::ListComp {
                element: Box::new(element),
                generators,
            });
        }
        let exprs = items
            .into_iter()
            .map(|p| self.expr(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Expr::List(exprs))
    }

    fn brace_display(&self, pair: Pair<Rule>) -> Result<Expr> {
        let (items, generators, _) = self.display_parts(pair);
        if items.is_empty() {
            return Ok(Expr::Dict(Vec::new()));
        }

        let mut dict_items = Vec::new();
        let mut set_items = Vec::new();
        for item in items {
            let mut parts: Vec<Pair<Rule>> = item.into_inner().collect();
            match parts.len() {
                1 if parts[0].as_rule() == Rule::dstar_item => {
                    let inner = self.expr(first_child(parts.remove(0))?)?;
                    dict_items.push(DictItem::Unpack(inner));
                }
                1 => set_items.push(self.expr(parts.remove(0))?),
                2 => {
                    let value = self.expr(parts.remove(1))?;
                    let key = self.expr(parts.remove(0))?;
                    dict_items.push(DictItem::Pair(key, value));
                }
                _ => return Err(SafepyError::internal("malformed brace item")),
            }
        }
        if !dict_items.is_empty() && !set_items.is_empty() {
            return Err(SafepyError::SyntaxRestriction(
                "invalid syntax: cannot mix dict entries and set items".to_string(),
            ));
        }

        if generators.is_empty() {
            return Ok(if set_items.is_empty() {
                Expr::Dict(dict_items)
            } else {
                Expr::Set(set_items)
            });
        }

        let generators = generators
            .into_iter()
            .map(|g| self.comprehension(g))
            .collect::<Result<Vec<_>>>()?;
        if let Some(element) = set_items.pop() {
            if matches!(element, Expr::Starred(_)) || !set_items.is_empty() {
                return Err(SafepyError::SyntaxRestriction(
                    "invalid set comprehension".to_string(),
                ));
            }
            return Ok(Expr::SetComp {
                element: Box::new(element),
                generators,
            });
        }
        match dict_items.pop() {
            Some(DictItem::Pair(key, value)) if dict_items.is_empty() => Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                generators,
            }),
            _ => Err(SafepyError::SyntaxRestriction(
                "dict unpacking cannot be used in dict comprehension".to_string(),
            )),
        }
    }

    // ========================================================================
    // String literals
    // ========================================================================

    fn strings(&self, pair: Pair<Rule>) -> Result<Expr> {
        let line = self.line(&pair);
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut formatted = false;

        for literal in pair.into_inner() {
            let mut prefix = String::new();
            let mut body = "";
            let mut quote_len = 1;
            for part in literal.into_inner() {
                match part.as_rule() {
                    Rule::string_prefix => prefix = part.as_str().to_ascii_lowercase(),
                    Rule::triple_dq | Rule::triple_sq => {
                        body = part.as_str();
                        quote_len = 3;
                    }
                    Rule::short_dq | Rule::short_sq => body = part.as_str(),
                    _ => return Err(unexpected(&part)),
                }
            }
            if prefix.contains('b') {
                return Err(SafepyError::SyntaxRestriction(
                    "bytes literals are not supported".to_string(),
                ));
            }
            let content = body
                .get(quote_len..body.len().saturating_sub(quote_len))
                .unwrap_or("");
            let raw = prefix.contains('r');

            if prefix.contains('f') {
                formatted = true;
                parts.extend(self.fstring_parts(content, raw, line)?);
            } else {
                let text = if raw {
                    content.to_string()
                } else {
                    decode_escapes(content)?
                };
                parts.push(FStringPart::Literal(text));
            }
        }

        if formatted {
            return Ok(Expr::FString(merge_literals(parts)));
        }
        let mut text = String::new();
        for part in parts {
            if let FStringPart::Literal(s) = part {
                text.push_str(&s);
            }
        }
        Ok(Expr::Constant(Constant::Str(text)))
    }

    fn fstring_parts(&self, content: &str, raw: bool, line: usize) -> Result<Vec<FStringPart>> {
        let chars: Vec<char> = content.chars().collect();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        let flush = |literal: &mut String, parts: &mut Vec<FStringPart>| -> Result<()> {
            if !literal.is_empty() {
                let text = if raw {
                    std::mem::take(literal)
                } else {
                    let decoded = decode_escapes(literal)?;
                    literal.clear();
                    decoded
                };
                parts.push(FStringPart::Literal(text));
            }
            Ok(())
        };

        while i < chars.len() {
            let c = chars[i];
            match c {
                '{' if chars.get(i + 1) == Some(&'{') => {
                    literal.push('{');
                    i += 2;
                }
                '}' if chars.get(i + 1) == Some(&'}') => {
                    literal.push('}');
                    i += 2;
                }
                '}' => {
                    return Err(SafepyError::SyntaxRestriction(
                        "f-string: single '}' is not allowed".to_string(),
                    ))
                }
                '{' => {
                    flush(&mut literal, &mut parts)?;
                    let (field, next) = self.fstring_field(&chars, i + 1, raw, line)?;
                    parts.push(field);
                    i = next;
                }
                _ => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        flush(&mut literal, &mut parts)?;
        Ok(parts)
    }

    /// Parse one replacement field starting just after its `{`. Returns the
    /// field and the index just past its closing `}`.
    fn fstring_field(
        &self,
        chars: &[char],
        start: usize,
        raw: bool,
        line: usize,
    ) -> Result<(FStringPart, usize)> {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut i = start;
        let mut expr_end = None;
        let mut conversion = None;
        let mut spec_start = None;

        // Expression section
        while i < chars.len() {
            let c = chars[i];
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                i += 1;
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                '}' if depth > 0 => depth -= 1,
                '}' => {
                    expr_end = Some(i);
                    break;
                }
                '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => {
                    expr_end = Some(i);
                    conversion = chars.get(i + 1).copied();
                    i += 2;
                    match chars.get(i) {
                        Some(':') => spec_start = Some(i + 1),
                        Some('}') => {}
                        _ => {
                            return Err(SafepyError::SyntaxRestriction(
                                "f-string: expecting '}'".to_string(),
                            ))
                        }
                    }
                    break;
                }
                ':' if depth == 0 => {
                    expr_end = Some(i);
                    spec_start = Some(i + 1);
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        let expr_end = expr_end.ok_or_else(|| {
            SafepyError::SyntaxRestriction("f-string: expecting '}'".to_string())
        })?;

        // Format spec section, which may itself contain nested fields
        let mut spec = Vec::new();
        if let Some(spec_start) = spec_start {
            let mut nested = 0usize;
            i = spec_start;
            while i < chars.len() {
                match chars[i] {
                    '{' => nested += 1,
                    '}' if nested > 0 => nested -= 1,
                    '}' => break,
                    _ => {}
                }
                i += 1;
            }
            let spec_text: String = chars[spec_start..i.min(chars.len())].iter().collect();
            spec = self.fstring_parts(&spec_text, raw, line)?;
        }
        if chars.get(i) != Some(&'}') {
            return Err(SafepyError::SyntaxRestriction(
                "f-string: expecting '}'".to_string(),
            ));
        }

        let mut text: String = chars[start..expr_end].iter().collect();
        let mut debug = false;
        let trimmed = text.trim_end();
        if trimmed.ends_with('=')
            && !["==", "!=", "<=", ">="].iter().any(|op| trimmed.ends_with(op))
        {
            debug = true;
            text = trimmed[..trimmed.len() - 1].to_string();
        }
        if text.trim().is_empty() {
            return Err(SafepyError::SyntaxRestriction(
                "f-string: empty expression not allowed".to_string(),
            ));
        }
        if let Some(conv) = conversion {
            if !matches!(conv, 'r' | 's' | 'a') {
                return Err(SafepyError::SyntaxRestriction(format!(
                    "f-string: invalid conversion character '{}'",
                    conv
                )));
            }
        }

        let expr = self.fstring_expression(&text, line)?;
        let field = FStringPart::Field {
            expr: Box::new(expr),
            text: chars[start..expr_end].iter().collect(),
            debug,
            conversion: if debug && conversion.is_none() && spec_start.is_none() {
                Some('r')
            } else {
                conversion
            },
            spec,
        };
        Ok((field, i + 1))
    }

    fn fstring_expression(&self, text: &str, line: usize) -> Result<Expr> {
        let source = text.replace('\n', " ");
        let source = source.trim();
        let pairs = with_parse_stack(|| SafepyParser::parse(Rule::fstring_expr, source)).map_err(
            |_| SafepyError::SyntaxRestriction(format!("f-string: invalid syntax in `{}`", source)),
        )?;
        let entry = pairs
            .into_iter()
            .next()
            .ok_or_else(|| SafepyError::internal("empty f-string expression"))?;
        let items = entry
            .into_inner()
            .next()
            .ok_or_else(|| SafepyError::internal("empty f-string expression"))?;
        let nested = Builder {
            layout: None,
            fixed_line: line,
        };
        nested.star_items(items)
    }
}

// ============================================================================
// Literal helpers
// ============================================================================

fn check_single_star(targets: &[Target]) -> Result<()> {
    let starred = targets
        .iter()
        .filter(|t| matches!(t, Target::Starred(_)))
        .count();
    if starred > 1 {
        return Err(SafepyError::SyntaxRestriction(
            "multiple starred expressions in assignment".to_string(),
        ));
    }
    Ok(())
}

fn describe_expr(expr: &Expr) -> &'static str {
    match expr {
        Expr::Constant(_) | Expr::FString(_) => "literal",
        Expr::Call { .. } => "function call",
        Expr::Lambda(_) => "lambda",
        Expr::Compare { .. } => "comparison",
        Expr::IfExp { .. } => "conditional expression",
        Expr::ListComp { .. }
        | Expr::SetComp { .. }
        | Expr::DictComp { .. }
        | Expr::GeneratorExp { .. } => "comprehension",
        Expr::Dict(_) => "dict literal",
        Expr::Set(_) => "set display",
        Expr::Tuple(_) => "tuple",
        Expr::List(_) => "list",
        _ => "expression",
    }
}

fn is_int_literal(pair: &Pair<Rule>) -> bool {
    // factor -> power -> primary -> int_lit with no trailers or exponent
    let mut current = pair.clone();
    loop {
        let mut inner = current.clone().into_inner();
        let Some(first) = inner.next() else {
            return false;
        };
        if inner.next().is_some() {
            return false;
        }
        match first.as_rule() {
            Rule::int_lit => return true,
            Rule::power | Rule::primary => current = first,
            _ => return false,
        }
    }
}

fn negative_int_literal(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(|c| *c != '_').collect();
    format!("-{}", digits).parse::<i64>().ok()
}

fn parse_int(text: &str) -> Result<i64> {
    let digits: String = text.chars().filter(|c| *c != '_').collect();
    let lower = digits.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2)
    } else {
        if digits.len() > 1 && digits.starts_with('0') && digits.chars().any(|c| c != '0') {
            return Err(SafepyError::SyntaxRestriction(
                "leading zeros in decimal integer literals are not permitted".to_string(),
            ));
        }
        digits.parse::<i64>()
    };
    parsed.map_err(|_| {
        SafepyError::SyntaxRestriction(format!(
            "integer literal {} does not fit in 64 bits",
            text
        ))
    })
}

fn parse_float(text: &str) -> Result<f64> {
    let digits: String = text.chars().filter(|c| *c != '_').collect();
    digits
        .parse::<f64>()
        .map_err(|_| SafepyError::SyntaxRestriction(format!("invalid float literal {}", text)))
}

fn merge_literals(parts: Vec<FStringPart>) -> Vec<FStringPart> {
    let mut merged: Vec<FStringPart> = Vec::with_capacity(parts.len());
    for part in parts {
        match (merged.last_mut(), part) {
            (Some(FStringPart::Literal(prev)), FStringPart::Literal(next)) => prev.push_str(&next),
            (_, part) => merged.push(part),
        }
    }
    merged
}

/// Decode backslash escapes in a non-raw string literal body
pub fn decode_escapes(body: &str) -> Result<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escape) = chars.next() else {
            out.push('\\');
            break;
        };
        match escape {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0C'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\x0B'),
            '0'..='7' => {
                let mut value = escape.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(value).unwrap_or('\u{FFFD}'));
            }
            'x' | 'u' | 'U' => {
                let width = match escape {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = (0..width).filter_map(|_| chars.next()).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == width)
                    .ok_or_else(|| {
                        SafepyError::SyntaxRestriction(format!(
                            "truncated \\{}{} escape",
                            escape, hex
                        ))
                    })?;
                let decoded = char::from_u32(code).ok_or_else(|| {
                    SafepyError::SyntaxRestriction(format!("illegal Unicode character \\{}{}", escape, hex))
                })?;
                out.push(decoded);
            }
            'N' => {
                return Err(SafepyError::SyntaxRestriction(
                    "named unicode escapes (\\N{...}) are not supported".to_string(),
                ))
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(source: &str) -> StmtKind {
        let program = parse_program(source).unwrap();
        assert_eq!(program.body.len(), 1, "expected one statement in {:?}", source);
        program.body.into_iter().next().unwrap().kind
    }

    fn expr(source: &str) -> Expr {
        match single(source) {
            StmtKind::Expr(e) => e,
            other => panic!("Expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_arithmetic_precedence() {
        match expr("1 + 2 * 3") {
            Expr::Binary {
                op: BinOp::Add,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. })),
            other => panic!("Expected addition, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_power_binds_tighter_than_unary() {
        match expr("-2 ** 2") {
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => assert!(matches!(*operand, Expr::Binary { op: BinOp::Pow, .. })),
            other => panic!("Expected negation, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_chained_comparison() {
        match expr("a < b <= c not in d") {
            Expr::Compare { ops, .. } => {
                let kinds: Vec<CmpOp> = ops.iter().map(|(op, _)| *op).collect();
                assert_eq!(kinds, vec![CmpOp::Lt, CmpOp::LtE, CmpOp::NotIn]);
            }
            other => panic!("Expected comparison, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_is_not() {
        match expr("x is not None") {
            Expr::Compare { ops, .. } => assert_eq!(ops[0].0, CmpOp::IsNot),
            other => panic!("Expected comparison, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_chained_assignment_and_unpacking() {
        match single("a = b, *c = [1, 2, 3]") {
            StmtKind::Assign { targets, .. } => {
                assert_eq!(targets.len(), 2);
                assert!(matches!(targets[0], Target::Name(_)));
                match &targets[1] {
                    Target::Sequence(items) => {
                        assert!(matches!(items[1], Target::Starred(_)))
                    }
                    other => panic!("Expected sequence target, got {:?}", other),
                }
            }
            other => panic!("Expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_augmented_assignment() {
        match single("total //= 2") {
            StmtKind::AugAssign { op, .. } => assert_eq!(op, BinOp::FloorDiv),
            other => panic!("Expected augmented assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_annotated_assignment() {
        assert!(matches!(
            single("count: int = 3"),
            StmtKind::AnnAssign { value: Some(_), .. }
        ));
    }

    #[test]
    fn test_parse_if_elif_else_lines() {
        let program = parse_program("x = 1\nif x > 1:\n    y = 1\nelif x:\n    y = 2\nelse:\n    y = 3\n").unwrap();
        assert_eq!(program.body.len(), 2);
        assert_eq!(program.body[1].line, 2);
        match &program.body[1].kind {
            StmtKind::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(branches[1].1[0].line, 5);
                assert_eq!(orelse.len(), 1);
            }
            other => panic!("Expected if statement, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_function_def() {
        let source = "def f(a, b=2, *args, key=None, **kw) -> int:\n    return a\n";
        match single(source) {
            StmtKind::FunctionDef(def) => {
                assert_eq!(def.name, "f");
                assert_eq!(def.params.positional.len(), 2);
                assert_eq!(def.params.vararg.as_deref(), Some("args"));
                assert_eq!(def.params.kwonly[0].name, "key");
                assert_eq!(def.params.kwarg.as_deref(), Some("kw"));
                assert_eq!(def.body.len(), 1);
            }
            other => panic!("Expected function definition, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_lambda_in_call() {
        match expr("sorted(items, key=lambda p: p[1], reverse=True)") {
            Expr::Call { args, .. } => {
                assert_eq!(args.len(), 3);
                assert!(matches!(&args[1], Argument::Keyword(name, Expr::Lambda(_)) if name == "key"));
            }
            other => panic!("Expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_comprehensions() {
        assert!(matches!(expr("[x * 2 for x in xs if x]"), Expr::ListComp { .. }));
        assert!(matches!(expr("{k: v for k, v in pairs}"), Expr::DictComp { .. }));
        assert!(matches!(expr("{x for x in xs}"), Expr::SetComp { .. }));
        assert!(matches!(expr("(x for x in xs)"), Expr::GeneratorExp { .. }));
        match expr("sum(x for x in range(3))") {
            Expr::Call { args, .. } => {
                assert!(matches!(&args[0], Argument::Positional(Expr::GeneratorExp { .. })))
            }
            other => panic!("Expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_displays() {
        assert!(matches!(expr("()"), Expr::Tuple(items) if items.is_empty()));
        assert!(matches!(expr("(1,)"), Expr::Tuple(items) if items.len() == 1));
        assert!(matches!(expr("(1)"), Expr::Constant(Constant::Int(1))));
        assert!(matches!(expr("{}"), Expr::Dict(items) if items.is_empty()));
        assert!(matches!(expr("{1, 2}"), Expr::Set(items) if items.len() == 2));
        assert!(matches!(expr("{**a, 'k': 1}"), Expr::Dict(items) if items.len() == 2));
    }

    #[test]
    fn test_parse_slices() {
        match expr("xs[1:-1:2]") {
            Expr::Subscript { index, .. } => assert!(matches!(
                *index,
                Expr::Slice {
                    lower: Some(_),
                    upper: Some(_),
                    step: Some(_)
                }
            )),
            other => panic!("Expected subscript, got {:?}", other),
        }
        match expr("xs[::-1]") {
            Expr::Subscript { index, .. } => assert!(matches!(
                *index,
                Expr::Slice {
                    lower: None,
                    upper: None,
                    step: Some(_)
                }
            )),
            other => panic!("Expected subscript, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_numbers() {
        assert!(matches!(expr("0xff"), Expr::Constant(Constant::Int(255))));
        assert!(matches!(expr("1_000"), Expr::Constant(Constant::Int(1000))));
        assert!(matches!(expr("0b101"), Expr::Constant(Constant::Int(5))));
        assert!(matches!(expr("1e3"), Expr::Constant(Constant::Float(f)) if f == 1000.0));
        assert!(matches!(expr(".5"), Expr::Constant(Constant::Float(f)) if f == 0.5));
        assert!(matches!(
            expr("-9223372036854775808"),
            Expr::Constant(Constant::Int(i64::MIN))
        ));
        assert!(parse_program("99999999999999999999").is_err());
    }

    #[test]
    fn test_parse_strings() {
        assert!(matches!(expr("'a' \"b\""), Expr::Constant(Constant::Str(s)) if s == "ab"));
        assert!(matches!(expr(r"'\x41\n'"), Expr::Constant(Constant::Str(s)) if s == "A\n"));
        assert!(matches!(expr(r"r'\d+'"), Expr::Constant(Constant::Str(s)) if s == "\\d+"));
        assert!(matches!(expr("'''x\ny'''"), Expr::Constant(Constant::Str(s)) if s == "x\ny"));
        assert!(parse_program("b'bytes'").is_err());
    }

    #[test]
    fn test_parse_fstring() {
        match expr("f'{name!r:>{width}} = {x + 1:.2f} {{literal}} {y=}'") {
            Expr::FString(parts) => {
                let fields = parts
                    .iter()
                    .filter(|p| matches!(p, FStringPart::Field { .. }))
                    .count();
                assert_eq!(fields, 3);
                match &parts[0] {
                    FStringPart::Field {
                        conversion, spec, ..
                    } => {
                        assert_eq!(*conversion, Some('r'));
                        assert_eq!(spec.len(), 2);
                    }
                    other => panic!("Expected field, got {:?}", other),
                }
                assert!(parts.iter().any(
                    |p| matches!(p, FStringPart::Literal(s) if s.contains("{literal}"))
                ));
                assert!(parts
                    .iter()
                    .any(|p| matches!(p, FStringPart::Field { debug: true, .. })));
            }
            other => panic!("Expected f-string, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_imports() {
        match single("import math as m, json") {
            StmtKind::Import(names) => {
                assert_eq!(names[0].binding(), "m");
                assert_eq!(names[1].binding(), "json");
            }
            other => panic!("Expected import, got {:?}", other),
        }
        match single("from collections import (Counter,\n    defaultdict as dd)") {
            StmtKind::ImportFrom { module, names, .. } => {
                assert_eq!(module, "collections");
                assert_eq!(names[1].binding(), "dd");
            }
            other => panic!("Expected from-import, got {:?}", other),
        }
        assert!(matches!(
            single("from . import x"),
            StmtKind::ImportFrom { level: 1, .. }
        ));
        assert!(matches!(
            single("from os import *"),
            StmtKind::ImportFrom { wildcard: true, .. }
        ));
    }

    #[test]
    fn test_parse_forbidden_statements() {
        let program = parse_program(
            "class A:\n    x = 1\ntry:\n    pass\nexcept Exception:\n    pass\nelse:\n    pass\nglobal y\n",
        )
        .unwrap();
        let kinds: Vec<ForbiddenKind> = program
            .body
            .iter()
            .filter_map(|s| match s.kind {
                StmtKind::Forbidden(k) => Some(k),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![ForbiddenKind::Class, ForbiddenKind::Try, ForbiddenKind::Global]
        );
    }

    #[test]
    fn test_parse_decorator_kept() {
        match single("@cache\ndef f():\n    pass\n") {
            StmtKind::FunctionDef(def) => assert_eq!(def.decorators.len(), 1),
            other => panic!("Expected function definition, got {:?}", other),
        }
    }

    #[test]
    fn test_keywords_are_not_identifiers() {
        assert!(parse_program("lambda = 3").is_err());
        assert!(matches!(single("iffy = 3"), StmtKind::Assign { .. }));
    }

    #[test]
    fn test_syntax_error_reports_source_line() {
        let err = parse_program("x = 1\n\ny = = 2\n").unwrap_err();
        assert_eq!(err.line(), Some(3));
        assert!(err.message().contains("invalid syntax"));
        assert!(err.message().contains("y = = 2"));
    }

    #[test]
    fn test_unexpected_indent() {
        let err = parse_program("x = 1\n    y = 2\n").unwrap_err();
        assert!(err.message().contains("unexpected indent"));
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_missing_block() {
        let err = parse_program("if x:\ny = 2\n").unwrap_err();
        assert!(err.message().contains("expected an indented block"));
        assert_eq!(err.line(), Some(1));

        let err = parse_program("for i in r:\n    if i:\n    y = 2\n").unwrap_err();
        assert!(err.message().contains("expected an indented block"));
        assert_eq!(err.line(), Some(2));

        let err = parse_program("x = 1\nwhile x:").unwrap_err();
        assert!(err.message().contains("expected an indented block"));

        let err = parse_program("if x:\n    y = (1 +\n").unwrap_err();
        assert!(!err.message().contains("expected an indented block"));
    }

    #[test]
    fn test_invalid_targets() {
        assert!(parse_program("f() = 1").is_err());
        assert!(parse_program("a, b += 1").is_err());
        assert!(parse_program("*a, *b = xs").is_err());
        assert!(parse_program("def f(a=1, b):\n    pass\n").is_err());
    }

    #[test]
    fn test_semicolon_statements() {
        let program = parse_program("a = 1; b = 2; print(a + b)").unwrap();
        assert_eq!(program.body.len(), 3);
    }
}
