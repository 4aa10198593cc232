//! Error types for safepy
//!
//! Every failure surfaced to a caller is one of the five restriction kinds
//! below. Runtime faults that Python would raise as `TypeError`, `KeyError`,
//! `IndexError` and friends are reported as `RuntimeRestrictionError` with the
//! Python exception name leading the message.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafepyError {
    #[error("SyntaxRestrictionError: {0}")]
    SyntaxRestriction(String),

    #[error("ImportRestrictionError: {0}")]
    ImportRestriction(String),

    #[error("NameError: {0}")]
    Name(String),

    #[error("ArithmeticRestrictionError: {0}")]
    Arithmetic(String),

    #[error("RuntimeRestrictionError: {0}")]
    RuntimeRestriction(String),

    #[error("{source} (line {line})")]
    Located {
        line: usize,
        #[source]
        source: Box<SafepyError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SafepyError>;

/// Category of a [`SafepyError`], independent of line information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    SyntaxRestriction,
    ImportRestriction,
    Name,
    Arithmetic,
    RuntimeRestriction,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::SyntaxRestriction => "SyntaxRestrictionError",
            ErrorKind::ImportRestriction => "ImportRestrictionError",
            ErrorKind::Name => "NameError",
            ErrorKind::Arithmetic => "ArithmeticRestrictionError",
            ErrorKind::RuntimeRestriction => "RuntimeRestrictionError",
            ErrorKind::Io => "IOError",
        };
        f.write_str(name)
    }
}

/// Serializable summary of a failed execution, for relaying to a client
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub line: Option<usize>,
    pub message: String,
}

impl SafepyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SafepyError::SyntaxRestriction(_) => ErrorKind::SyntaxRestriction,
            SafepyError::ImportRestriction(_) => ErrorKind::ImportRestriction,
            SafepyError::Name(_) => ErrorKind::Name,
            SafepyError::Arithmetic(_) => ErrorKind::Arithmetic,
            SafepyError::RuntimeRestriction(_) => ErrorKind::RuntimeRestriction,
            SafepyError::Located { source, .. } => source.kind(),
            SafepyError::Io(_) => ErrorKind::Io,
        }
    }

    /// The message without the error kind prefix or line suffix
    pub fn message(&self) -> String {
        match self {
            SafepyError::SyntaxRestriction(m)
            | SafepyError::ImportRestriction(m)
            | SafepyError::Name(m)
            | SafepyError::Arithmetic(m)
            | SafepyError::RuntimeRestriction(m) => m.clone(),
            SafepyError::Located { source, .. } => source.message(),
            SafepyError::Io(e) => e.to_string(),
        }
    }

    pub fn line(&self) -> Option<usize> {
        match self {
            SafepyError::Located { line, .. } => Some(*line),
            _ => None,
        }
    }

    /// Attach a source line unless the error already carries one
    pub fn at_line(self, line: usize) -> Self {
        match self {
            located @ SafepyError::Located { .. } => located,
            io @ SafepyError::Io(_) => io,
            other => SafepyError::Located {
                line,
                source: Box::new(other),
            },
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            line: self.line(),
            message: self.message(),
        }
    }

    pub fn type_error(message: impl std::fmt::Display) -> Self {
        SafepyError::RuntimeRestriction(format!("TypeError: {}", message))
    }

    pub fn value_error(message: impl std::fmt::Display) -> Self {
        SafepyError::RuntimeRestriction(format!("ValueError: {}", message))
    }

    pub fn index_error(message: impl std::fmt::Display) -> Self {
        SafepyError::RuntimeRestriction(format!("IndexError: {}", message))
    }

    pub fn key_error(message: impl std::fmt::Display) -> Self {
        SafepyError::RuntimeRestriction(format!("KeyError: {}", message))
    }

    pub fn attribute_error(message: impl std::fmt::Display) -> Self {
        SafepyError::RuntimeRestriction(format!("AttributeError: {}", message))
    }

    pub fn zero_division(message: impl std::fmt::Display) -> Self {
        SafepyError::Arithmetic(format!("ZeroDivisionError: {}", message))
    }

    pub fn overflow(message: impl std::fmt::Display) -> Self {
        SafepyError::Arithmetic(format!("OverflowError: {}", message))
    }

    /// A container or string would grow past `limit` items
    pub fn memory(limit: usize) -> Self {
        SafepyError::RuntimeRestriction(format!(
            "MemoryError: collection would exceed {} items",
            limit
        ))
    }

    pub fn math_domain() -> Self {
        SafepyError::Arithmetic("ValueError: math domain error".to_string())
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        tracing::error!(%message, "internal interpreter fault");
        SafepyError::RuntimeRestriction(format!("internal error: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_kind_prefix() {
        let err = SafepyError::ImportRestriction("import of 'os' is not allowed".to_string());
        assert_eq!(
            err.to_string(),
            "ImportRestrictionError: import of 'os' is not allowed"
        );
    }

    #[test]
    fn test_located_keeps_kind_and_message() {
        let err = SafepyError::zero_division("division by zero").at_line(3);
        assert_eq!(err.kind(), ErrorKind::Arithmetic);
        assert_eq!(err.line(), Some(3));
        assert_eq!(err.message(), "ZeroDivisionError: division by zero");
        assert_eq!(
            err.to_string(),
            "ArithmeticRestrictionError: ZeroDivisionError: division by zero (line 3)"
        );
    }

    #[test]
    fn test_at_line_does_not_rewrap() {
        let err = SafepyError::Name("name 'x' is not defined".to_string())
            .at_line(2)
            .at_line(7);
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_report_serializes() {
        let report = SafepyError::type_error("bad operand").report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "RuntimeRestriction");
        assert_eq!(json["message"], "TypeError: bad operand");
    }
}
