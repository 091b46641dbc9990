//! Authorization outcomes: decision, diagnostics and the response envelope.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::EvaluationError;

use super::PolicyId;

/// Version metadata for the policy set used during an evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
pub struct PolicyVersion {
    /// SHA-256 of the policy source.
    pub hash: String,
    /// When this policy set was loaded into the engine (RFC 3339).
    pub loaded_at: String,
}

impl Display for PolicyVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{} @ {}", self.hash, self.loaded_at)
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

/// Which policies shaped a decision, and which failed to evaluate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Diagnostics {
    /// Policies that determined the decision.
    pub reasons: BTreeSet<PolicyId>,
    /// Policies whose evaluation raised an error.
    pub errors: BTreeSet<PolicyId>,
    #[serde(skip)]
    error_details: BTreeMap<PolicyId, EvaluationError>,
}

impl Diagnostics {
    pub(crate) fn record_error(&mut self, id: PolicyId, error: EvaluationError) {
        self.errors.insert(id.clone());
        self.error_details.insert(id, error);
    }

    /// The typed error behind each id in `errors`.
    pub fn error_details(&self) -> &BTreeMap<PolicyId, EvaluationError> {
        &self.error_details
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Response {
    pub decision: Decision,
    pub correlation_id: Option<String>,
    pub diagnostics: Diagnostics,
}

impl Response {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let reasons: Vec<&str> = self.diagnostics.reasons.iter().map(PolicyId::as_str).collect();
        write!(f, "{}({})", self.decision, reasons.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_json_snapshot;

    #[test]
    fn test_policy_version_display() {
        let version = PolicyVersion {
            hash: "abc123".to_string(),
            loaded_at: "2023-01-01T00:00:00Z".to_string(),
        };
        assert_eq!(version.to_string(), "abc123 @ 2023-01-01T00:00:00Z");
    }

    #[test]
    fn test_decision_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Decision::Allow).unwrap(), "allow");
        assert_eq!(Decision::Deny.to_string(), "deny");
    }

    #[test]
    fn test_response_serialization_hides_error_details() {
        let mut diagnostics = Diagnostics::default();
        diagnostics.reasons.insert(PolicyId::new("policy1"));
        diagnostics.record_error(
            PolicyId::new("policy0"),
            EvaluationError::type_mismatch("long", "string"),
        );
        let response = Response {
            decision: Decision::Deny,
            correlation_id: Some("abc".into()),
            diagnostics,
        };

        assert_eq!(response.diagnostics.error_details().len(), 1);
        assert_eq!(response.to_string(), "deny(policy1)");
        assert_json_snapshot!(response, @r#"
        {
          "decision": "deny",
          "correlation_id": "abc",
          "diagnostics": {
            "reasons": [
              "policy1"
            ],
            "errors": [
              "policy0"
            ]
          }
        }
        "#);
    }
}
