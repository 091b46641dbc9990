//! Tunables for authorization and pretty-printing.
//!
//! Plain serde structs; hosts load them from whatever format they use.

use serde::{Deserialize, Serialize};

/// Default bound on expression nesting, shared by the parser and evaluator.
pub const DEFAULT_MAX_EXPRESSION_DEPTH: usize = 256;

/// What happens when a request does not fit the schema.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValidationMode {
    /// Reject the request with a `RequestValidation` error.
    #[default]
    Strict,
    /// Log a warning and evaluate the request anyway.
    Permissive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizerConfig {
    pub validation_mode: ValidationMode,
    pub max_expression_depth: usize,
    /// Validate entity stores against the schema before a batch runs.
    pub validate_entities: bool,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            validation_mode: ValidationMode::Strict,
            max_expression_depth: DEFAULT_MAX_EXPRESSION_DEPTH,
            validate_entities: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub line_width: usize,
    pub indent_width: usize,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            line_width: 88,
            indent_width: 2,
        }
    }
}
