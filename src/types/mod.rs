//! Data model types shared by the parser, evaluator and authorizer.
//!
//! Canonical string forms:
//! - EntityUid: `Type::"id"` or `NS::Type::"id"`, id escaped like a string literal
//! - Value: Cedar literal syntax (`true`, `42`, `"s"`, `[..]`, `{..}`)
//!
//! JSON forms follow the entity-attribute format: entity references are
//! written `{"__entity": {"type": ..., "id": ...}}`.

mod context;
mod decision;
mod entity;
mod entity_uid;
mod policy_id;
mod request;
mod value;

pub use context::Context;
pub use decision::{Decision, Diagnostics, PolicyVersion, Response};
pub use entity::Entity;
pub(crate) use entity_uid::is_type_name;
pub use entity_uid::EntityUid;
pub use policy_id::PolicyId;
pub use request::Request;
pub use value::{ENTITY_ESCAPE, Value};
