use std::sync::{Arc, OnceLock};

use super::*;
use crate::config::ValidationMode;
use crate::error::{EvaluationError, RequestValidationError};
use crate::types::{Context, Decision, Entity, PolicyId};
use sha2::{Digest, Sha256};
use yare::parameterized;

mod schema;

const PHOTO_POLICY: &str = r#"
permit (
    principal == User::"alice",
    action == Action::"view",
    resource in Album::"jane_vacation"
);
"#;

const PHOTO_POLICY_WITHOUT_ALICE: &str = r#"
permit (
    principal == User::"bob",
    action == Action::"view",
    resource in Album::"jane_vacation"
);
"#;

const POLICY_WITH_FORBID: &str = r#"
@id("allow-all")
permit (principal, action, resource);

@id("deny-all")
forbid (principal, action, resource);
"#;

const POLICY_WITH_OWNER: &str = r#"
@id("owner-only")
permit (
    principal,
    action == Action::"edit",
    resource
) when {
    resource.owner == principal
};

@id("staff-edit")
permit (
    principal in Group::"staff",
    action == Action::"edit",
    resource is Photo
);
"#;

const POLICY_WITH_GROUPS: &str = r#"
@id("admins")
permit (
    principal in Group::"admins",
    action in [Action::"delete", Action::"view"],
    resource is Photo
);

@id("users")
permit (
    principal in Group::"users",
    action == Action::"view",
    resource is Photo
);

@id("alice")
permit (
    principal == User::"alice",
    action == Action::"comment",
    resource
);

@id("any-user")
permit (
    principal is User,
    action == Action::"read",
    resource
);

@id("admin-users")
permit (
    principal is User in Group::"admins",
    action == Action::"write",
    resource
);

@id("everyone")
permit (
    principal,
    action == Action::"ping",
    resource
);
"#;

const TEST_SCHEMA: &str = r#"
entity User in [Group];
entity Group;
entity Document {
    id: String,
    sensitivity: Long
};

action "read" appliesTo {
    principal: [User],
    resource: [Document],
};
"#;

const TEST_SCHEMA_POLICY: &str = r#"
permit (
    principal == User::"alice",
    action == Action::"read",
    resource is Document
) when {
    resource.sensitivity < 3
};
"#;

const TEST_SCHEMA_WRITE: &str = r#"
entity User;
entity Document {
    id: String,
    sensitivity: Long
};

action "write" appliesTo {
    principal: [User],
    resource: [Document],
};
"#;

const TEST_SCHEMA_POLICY_WRITE: &str = r#"
permit (
    principal == User::"alice",
    action == Action::"write",
    resource is Document
);
"#;

#[derive(Clone)]
struct SharedLogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

struct SharedLogWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogBuffer {
    type Writer = SharedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogWriter(Arc::clone(&self.0))
    }
}

impl std::io::Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedLogBuffer {
    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// Process-wide capturing subscriber. Tests using it must be `#[serial]`.
fn log_sink() -> SharedLogBuffer {
    static LOG_SINK: OnceLock<SharedLogBuffer> = OnceLock::new();
    LOG_SINK
        .get_or_init(|| {
            let sink = SharedLogBuffer(Arc::new(std::sync::Mutex::new(Vec::new())));
            let subscriber = tracing_subscriber::fmt()
                .with_ansi(false)
                .without_time()
                .with_target(false)
                .with_max_level(tracing::Level::DEBUG)
                .with_writer(sink.clone())
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .expect("global test subscriber should initialize");
            tracing::callsite::rebuild_interest_cache();
            sink
        })
        .clone()
}

fn uid(text: &str) -> EntityUid {
    text.parse().expect("valid entity uid")
}

fn engine_from_policy(policy_text: &str) -> PolicyEngine {
    PolicyEngine::new_from_str(policy_text).expect("policy should load")
}

fn schema_engine_from_policy(policy_text: &str, schema_text: &str) -> PolicyEngine {
    PolicyEngine::new_from_str_with_cedarschema(policy_text, schema_text)
        .expect("schema + policy should load")
}

fn request(principal: &str, action: &str, resource: &str) -> Request {
    Request::new(uid(principal), uid(action), uid(resource))
}

fn user_request(user: &str, action: &str, resource: &str) -> Request {
    request(
        &format!(r#"User::"{user}""#),
        &format!(r#"Action::"{action}""#),
        resource,
    )
}

/// `Photo::"p1"` in `Album::"jane_vacation"` in `Account::"jane"`.
fn photo_entities() -> Entities {
    Entities::from_entities([
        Entity::with_uid(uid(r#"Photo::"p1""#)).with_parent(uid(r#"Album::"jane_vacation""#)),
        Entity::with_uid(uid(r#"Album::"jane_vacation""#)).with_parent(uid(r#"Account::"jane""#)),
        Entity::with_uid(uid(r#"Account::"jane""#)),
        Entity::with_uid(uid(r#"Photo::"loose""#)),
        Entity::with_uid(uid(r#"Photo::"owned""#)).with_attr("owner", uid(r#"User::"alice""#)),
        Entity::with_uid(uid(r#"User::"alice""#)).with_parent(uid(r#"Group::"admins""#)),
        Entity::with_uid(uid(r#"User::"bob""#)).with_parent(uid(r#"Group::"users""#)),
        Entity::with_uid(uid(r#"User::"sam""#)).with_parent(uid(r#"Group::"staff""#)),
        Entity::with_uid(uid(r#"Group::"admins""#)).with_parent(uid(r#"Group::"users""#)),
    ])
    .expect("unique entities")
}

fn documents() -> Entities {
    Entities::from_entities([
        Entity::with_uid(uid(r#"Document::"doc1""#))
            .with_attr("id", "doc1")
            .with_attr("sensitivity", 1),
        Entity::with_uid(uid(r#"Document::"secret""#))
            .with_attr("id", "secret")
            .with_attr("sensitivity", 9),
    ])
    .expect("unique entities")
}

fn reasons(response: &Response) -> Vec<&str> {
    response.diagnostics.reasons.iter().map(PolicyId::as_str).collect()
}

fn errors(response: &Response) -> Vec<&str> {
    response.diagnostics.errors.iter().map(PolicyId::as_str).collect()
}

fn assert_allow(response: &Response) {
    assert_eq!(response.decision, Decision::Allow, "{response}");
}

fn assert_deny(response: &Response) {
    assert_eq!(response.decision, Decision::Deny, "{response}");
}

include!("core.rs");
include!("evaluate.rs");
include!("listing.rs");
