use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EntityUid;

/// Location of a syntax error inside policy or schema text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Byte offset from the start of the input.
    pub offset: usize,
    /// 1-based line number.
    pub line: usize,
    /// 1-based column, counted in characters.
    pub column: usize,
}

impl SourcePosition {
    pub fn from_offset(input: &str, offset: usize) -> Self {
        let offset = offset.min(input.len());
        let mut line = 1;
        let mut column = 1;
        for (idx, ch) in input.char_indices() {
            if idx >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Self {
            offset,
            line,
            column,
        }
    }
}

impl Display for SourcePosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyError {
    #[error("syntax error at {position}: {message}")]
    SyntaxError {
        message: String,
        position: SourcePosition,
    },

    #[error("structured input does not match the expected shape at `{path}`: {message}")]
    SchemaMismatch { path: String, message: String },

    #[error("duplicate policy id: {0}")]
    DuplicateId(String),

    #[error("duplicate entity: {0}")]
    DuplicateEntity(String),

    #[error("request validation error: {0}")]
    RequestValidation(#[from] RequestValidationError),

    #[error("entity validation error: {0}")]
    EntityValidation(String),

    #[error("policy validation failed: {0}")]
    PolicyValidation(String),

    #[error("template link error: {0}")]
    TemplateLink(String),

    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Poisoned lock error: {0}")]
    PoisonedLockError(String),
}

impl PolicyError {
    pub(crate) fn syntax(input: &str, offset: usize, message: impl Into<String>) -> Self {
        PolicyError::SyntaxError {
            message: message.into(),
            position: SourcePosition::from_offset(input, offset),
        }
    }

    pub(crate) fn mismatch(path: impl Into<String>, message: impl Into<String>) -> Self {
        PolicyError::SchemaMismatch {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(err: serde_json::Error) -> Self {
        PolicyError::InvalidFormat(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for PolicyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PolicyError::PoisonedLockError(err.to_string())
    }
}

/// Typed runtime failures raised while evaluating a policy condition.
///
/// These never abort an authorization call: the authorizer records the
/// offending policy in `Diagnostics::errors` and carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationError {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("attribute `{attribute}` not found on {target}")]
    AttributeNotFound { target: String, attribute: String },

    #[error("entity {0} does not exist")]
    UnknownEntity(EntityUid),

    #[error("integer overflow while evaluating `{op}`")]
    IntegerOverflow { op: String },

    #[error("expression nesting exceeds the limit of {limit}")]
    RecursionLimit { limit: usize },

    #[error("template slot {0} is not linked")]
    UnlinkedSlot(String),
}

impl EvaluationError {
    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        EvaluationError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// A request that does not fit the declared shape of its action.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestValidationError {
    #[error("action {0} is not declared in the schema")]
    UnknownAction(EntityUid),

    #[error("entity type `{0}` is not declared in the schema")]
    UndeclaredEntityType(String),

    #[error("principal type `{principal_type}` is not applicable to action {action}")]
    PrincipalNotApplicable {
        action: EntityUid,
        principal_type: String,
    },

    #[error("resource type `{resource_type}` is not applicable to action {action}")]
    ResourceNotApplicable {
        action: EntityUid,
        resource_type: String,
    },

    #[error("context for action {action} is missing required attribute `{attribute}`")]
    MissingContextAttribute { action: EntityUid, attribute: String },

    #[error("context for action {action} has undeclared attribute `{attribute}`")]
    UnexpectedContextAttribute { action: EntityUid, attribute: String },

    #[error("context attribute `{attribute}` for action {action}: expected {expected}, found {found}")]
    ContextTypeMismatch {
        action: EntityUid,
        attribute: String,
        expected: String,
        found: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_position_tracks_lines_and_columns() {
        let input = "permit (\n  principal,\n  oops";
        let offset = input.find("oops").unwrap();
        let pos = SourcePosition::from_offset(input, offset);
        assert_eq!(pos.line, 3);
        assert_eq!(pos.column, 3);
        assert_eq!(pos.offset, offset);
    }

    #[test]
    fn test_source_position_clamps_past_end() {
        let pos = SourcePosition::from_offset("abc", 99);
        assert_eq!(pos.offset, 3);
        assert_eq!(pos.column, 4);
    }

    #[test]
    fn test_syntax_error_display_includes_position() {
        let err = PolicyError::syntax("permit\n(", 7, "expected `principal`");
        assert_eq!(
            err.to_string(),
            "syntax error at line 2, column 1: expected `principal`"
        );
    }

    #[test]
    fn test_evaluation_error_converts_into_policy_error() {
        let err: PolicyError = EvaluationError::type_mismatch("long", "string").into();
        assert!(matches!(err, PolicyError::Evaluation(_)));
    }

    #[test]
    fn test_error_serialization() {
        let err = PolicyError::DuplicateId("policy0".into());
        let json = serde_json::to_value(&err).unwrap();
        let back: PolicyError = serde_json::from_value(json).unwrap();
        assert_eq!(err, back);
    }
}
