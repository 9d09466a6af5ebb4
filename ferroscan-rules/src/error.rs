//! Error types for the rule engine

use thiserror::Error;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Rule include cannot be resolved: {0}")]
    Io(String),

    #[error("Invalid regex pattern '{pattern}': {error}")]
    InvalidRegex { pattern: String, error: String },

    #[error("Invalid hex string '{0}'")]
    InvalidHex(String),

    #[error("Rule set exceeds {limit} string patterns")]
    TooManyPatterns { limit: usize },

    #[error("Empty pattern '${0}'")]
    EmptyPattern(String),

    #[error("Duplicate rule name '{0}'")]
    DuplicateRule(String),

    #[error("Undefined string reference '{reference}' in rule '{rule}'")]
    UndefinedString { rule: String, reference: String },
}

/// Result type for rule engine operations
pub type RuleResult<T> = Result<T, RuleError>;
