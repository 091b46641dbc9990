use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::error::PolicyError;
use crate::policy_set::PolicySet;
use crate::schema::Schema;
use crate::types::PolicyVersion;

/// Compile policy text into a `PolicySet`.
///
/// ```rust
/// use canopy_core::compile_policy;
/// let text = r#"
///     permit (principal, action, resource);
///     forbid (principal == User::"evil", action, resource);
/// "#;
/// let set = compile_policy(text).unwrap();
/// assert_eq!(set.policies().len(), 2);
/// ```
pub fn compile_policy(text: &str) -> Result<PolicySet, PolicyError> {
    text.parse()
}

/// Compile schema text, either the human-readable form or JSON.
///
/// Input whose first non-blank character is `{` is read as JSON.
pub fn compile_schema(text: &str) -> Result<Schema, PolicyError> {
    if text.trim_start().starts_with('{') {
        Schema::from_json_str(text)
    } else {
        text.parse()
    }
}

/// Hash the policy source and stamp the current time.
pub(crate) fn policy_version(text: &str) -> PolicyVersion {
    PolicyVersion {
        hash: format!("{:x}", Sha256::digest(text.as_bytes())),
        loaded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[test]
    fn test_compile_policy() {
        let text = r#"
            permit (principal == User::"alice", action == Action::"read", resource == Document::"doc1");
            permit (principal == User::"bob", action == Action::"write", resource == Document::"doc2");
        "#;
        let set = compile_policy(text).unwrap();
        assert_eq!(set.policies().len(), 2);
        assert!(set.templates().is_empty());
    }

    #[test]
    fn test_compile_policy_reports_position() {
        let err = compile_policy("permit (principal, action resource);").unwrap_err();
        assert!(matches!(
            err,
            PolicyError::SyntaxError { position, .. } if position.line == 1
        ));
    }

    #[parameterized(
        text = { "entity User; action view appliesTo { principal: User, resource: User };" },
        json = { r#"{"": {"entityTypes": {"User": {}}, "actions": {"view": {"appliesTo": {"principalTypes": ["User"], "resourceTypes": ["User"]}}}}}"# },
    )]
    fn test_compile_schema_detects_format(text: &str) {
        let schema = compile_schema(text).unwrap();
        assert!(schema.entity_type("User").is_some());
        assert!(schema.action(&r#"Action::"view""#.parse().unwrap()).is_some());
    }

    #[test]
    fn test_policy_version() {
        let version = policy_version("permit (principal, action, resource);");
        assert_eq!(version.hash.len(), 64);
        assert_eq!(
            version.hash,
            format!("{:x}", Sha256::digest(b"permit (principal, action, resource);"))
        );
        assert!(chrono::DateTime::parse_from_rfc3339(&version.loaded_at).is_ok());
    }
}
