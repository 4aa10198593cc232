//! Abstract Syntax Tree definitions for the supported Python subset
//!
//! The tree is a closed set of node kinds. Anything the grammar recognises
//! but the sandbox refuses to run is kept as [`StmtKind::Forbidden`] so the
//! restrictor can name the construct in its error.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// A parsed source unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub body: Vec<Stmt>,
}

/// A statement together with the source line it starts on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StmtKind {
    Expr(Expr),
    /// `a = b = value`; one entry per `=` target, evaluated left to right
    Assign {
        targets: Vec<Target>,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    /// `x: int = 3`; the annotation is parsed and discarded
    AnnAssign {
        target: Target,
        value: Option<Expr>,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    FunctionDef(Rc<FunctionDef>),
    Return(Option<Expr>),
    Break,
    Continue,
    Pass,
    Import(Vec<ImportAlias>),
    ImportFrom {
        module: String,
        names: Vec<ImportAlias>,
        /// Number of leading dots in a relative import
        level: usize,
        wildcard: bool,
    },
    Delete(Vec<Target>),
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    Forbidden(ForbiddenKind),
}

/// Statements that parse but are outside the sandboxed subset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForbiddenKind {
    Class,
    Try,
    Except,
    Finally,
    With,
    Raise,
    Global,
    Nonlocal,
    Yield,
    Async,
    Await,
}

impl ForbiddenKind {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let kind = match keyword {
            "class" => ForbiddenKind::Class,
            "try" => ForbiddenKind::Try,
            "except" => ForbiddenKind::Except,
            "finally" => ForbiddenKind::Finally,
            "with" => ForbiddenKind::With,
            "raise" => ForbiddenKind::Raise,
            "global" => ForbiddenKind::Global,
            "nonlocal" => ForbiddenKind::Nonlocal,
            "yield" => ForbiddenKind::Yield,
            "async" => ForbiddenKind::Async,
            "await" => ForbiddenKind::Await,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for ForbiddenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keyword = match self {
            ForbiddenKind::Class => "class",
            ForbiddenKind::Try => "try",
            ForbiddenKind::Except => "except",
            ForbiddenKind::Finally => "finally",
            ForbiddenKind::With => "with",
            ForbiddenKind::Raise => "raise",
            ForbiddenKind::Global => "global",
            ForbiddenKind::Nonlocal => "nonlocal",
            ForbiddenKind::Yield => "yield",
            ForbiddenKind::Async => "async",
            ForbiddenKind::Await => "await",
        };
        f.write_str(keyword)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportAlias {
    /// Module or member name, dotted for `import a.b`
    pub name: String,
    pub alias: Option<String>,
}

impl ImportAlias {
    /// Name the import binds in the current scope
    pub fn binding(&self) -> &str {
        match &self.alias {
            Some(alias) => alias,
            None => self.name.split('.').next().unwrap_or(&self.name),
        }
    }
}

// ============================================================================
// Functions
// ============================================================================

/// A `def` statement or a lambda
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub line: usize,
    pub params: Parameters,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Expr>,
    pub is_lambda: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Parameters {
    /// Parameters that may be passed positionally or by keyword
    pub positional: Vec<Param>,
    pub vararg: Option<String>,
    pub kwonly: Vec<Param>,
    pub kwarg: Option<String>,
}

impl Parameters {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.positional
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.vararg.as_deref())
            .chain(self.kwonly.iter().map(|p| p.name.as_str()))
            .chain(self.kwarg.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

// ============================================================================
// Assignment targets
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Target {
    Name(String),
    Attribute { value: Box<Expr>, attr: String },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    /// Tuple or list unpacking
    Sequence(Vec<Target>),
    Starred(Box<Target>),
}

impl Target {
    /// Names bound by assigning to this target
    pub fn bound_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Target::Name(name) => out.push(name),
            Target::Sequence(items) => items.iter().for_each(|t| t.bound_names(out)),
            Target::Starred(inner) => inner.bound_names(out),
            Target::Attribute { .. } | Target::Subscript { .. } => {}
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Constant(Constant),
    FString(Vec<FStringPart>),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    Dict(Vec<DictItem>),
    /// `*value` inside a display or call
    Starred(Box<Expr>),
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Argument>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    BoolOp {
        op: BoolOp,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda(Rc<FunctionDef>),
    ListComp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    SetComp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        generators: Vec<Comprehension>,
    },
    GeneratorExp {
        element: Box<Expr>,
        generators: Vec<Comprehension>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FStringPart {
    Literal(String),
    Field {
        expr: Box<Expr>,
        /// Source text of the expression, kept for `f"{x=}"`
        text: String,
        debug: bool,
        conversion: Option<char>,
        spec: Vec<FStringPart>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DictItem {
    Pair(Expr, Expr),
    Unpack(Expr),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Argument {
    Positional(Expr),
    Star(Expr),
    Keyword(String, Expr),
    DoubleStar(Expr),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comprehension {
    pub target: Target,
    pub iter: Expr,
    pub conditions: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::BitAnd => "&",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let op = match symbol {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "//" => BinOp::FloorDiv,
            "%" => BinOp::Mod,
            "**" => BinOp::Pow,
            "<<" => BinOp::LShift,
            ">>" => BinOp::RShift,
            "|" => BinOp::BitOr,
            "^" => BinOp::BitXor,
            "&" => BinOp::BitAnd,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_alias_binding() {
        let plain = ImportAlias {
            name: "collections.abc".to_string(),
            alias: None,
        };
        assert_eq!(plain.binding(), "collections");

        let aliased = ImportAlias {
            name: "math".to_string(),
            alias: Some("m".to_string()),
        };
        assert_eq!(aliased.binding(), "m");
    }

    #[test]
    fn test_target_bound_names() {
        let target = Target::Sequence(vec![
            Target::Name("a".to_string()),
            Target::Starred(Box::new(Target::Name("rest".to_string()))),
            Target::Subscript {
                value: Box::new(Expr::Name("d".to_string())),
                index: Box::new(Expr::Constant(Constant::Int(0))),
            },
        ]);
        let mut names = Vec::new();
        target.bound_names(&mut names);
        assert_eq!(names, vec!["a", "rest"]);
    }

    #[test]
    fn test_binop_symbols_round_trip() {
        for op in [BinOp::Add, BinOp::FloorDiv, BinOp::Pow, BinOp::RShift] {
            assert_eq!(BinOp::from_symbol(op.symbol()), Some(op));
        }
    }
}
