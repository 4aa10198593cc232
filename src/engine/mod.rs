//! Tree-walking evaluator
//!
//! [`Interpreter`] walks the AST produced by the parser. Control flow inside
//! a function (`break`, `continue`, `return`) travels in the `Ok` channel as
//! a [`Flow`]; the final-answer halt and errors travel in the `Err` channel as
//! an [`Interrupt`] so every frame unwinds with `?`.

pub mod builtins;
pub mod interpreter;
pub mod methods;
pub mod modules;
pub mod operators;

pub use interpreter::Interpreter;

use crate::error::SafepyError;
use crate::value::Value;

/// Non-local exit from evaluation
#[derive(Debug)]
pub enum Interrupt {
    /// `final_answer(value)` was called; nothing else runs
    FinalAnswer(Value),
    Error(SafepyError),
}

impl Interrupt {
    /// Tag an error with the line of the statement it escaped from
    pub fn at_line(self, line: usize) -> Self {
        match self {
            Interrupt::Error(e) => Interrupt::Error(e.at_line(line)),
            answer => answer,
        }
    }
}

impl From<SafepyError> for Interrupt {
    fn from(e: SafepyError) -> Self {
        Interrupt::Error(e)
    }
}

pub type EvalResult<T> = std::result::Result<T, Interrupt>;

/// How a statement finished
#[derive(Debug)]
pub enum Flow {
    /// Fell through, carrying the statement's value
    Next(Value),
    Break,
    Continue,
    Return(Value),
}
