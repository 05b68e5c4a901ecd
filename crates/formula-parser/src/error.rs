//! Formula error types

use thiserror::Error;

/// Result type for formula operations
pub type FormulaResult<T> = std::result::Result<T, FormulaError>;

/// A malformed formula, reported by the parser
///
/// `position` is the byte offset of the offending token in the formula text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Syntax error at position {position}: {message}")]
pub struct SyntaxError {
    pub position: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// Errors that can occur during formula parsing, compilation or evaluation
///
/// Missing variables and arithmetic on non-numbers are not errors; they
/// evaluate to [`Value::Undefined`](crate::Value::Undefined).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    /// Formula parse error
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// Call to a name that no function provider knows
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// A function rejected its arguments
    #[error("Invalid arguments for {function}: {message}")]
    Argument { function: String, message: String },

    /// A variable whose resolution re-enters itself, or a resolution chain
    /// that is too deep
    #[error("Recursion limit reached while resolving '{name}': {}", chain.join(" -> "))]
    RecursionLimit { name: String, chain: Vec<String> },

    /// Formula nesting exceeds what the native compiler accepts
    #[error("Formula nesting depth {depth} exceeds the native compiler limit of {limit}")]
    NestingTooDeep { depth: usize, limit: usize },

    /// Native code generation failed
    #[error("Native compilation failed: {0}")]
    Native(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let err = SyntaxError::new(4, "Unterminated variable reference");
        assert_eq!(
            err.to_string(),
            "Syntax error at position 4: Unterminated variable reference"
        );

        let err: FormulaError = err.into();
        assert!(matches!(err, FormulaError::Syntax(SyntaxError { position: 4, .. })));
    }

    #[test]
    fn test_recursion_limit_display() {
        let err = FormulaError::RecursionLimit {
            name: "A".into(),
            chain: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(
            err.to_string(),
            "Recursion limit reached while resolving 'A': A -> B -> A"
        );
    }
}
