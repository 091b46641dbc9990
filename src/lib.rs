// src/lib.rs
//! Canopy: parse, validate and evaluate Cedar-style authorization policies.
//!
//! ```rust
//! use canopy_core::{Entities, PolicySet, Request, is_authorized};
//!
//! let policies: PolicySet = r#"
//!     permit (principal == User::"alice", action == Action::"view", resource in Album::"trip");
//! "#
//! .parse()
//! .unwrap();
//! let entities = Entities::from_json_str(
//!     r#"[{"uid": {"type": "Photo", "id": "p1"}, "parents": [{"type": "Album", "id": "trip"}]}]"#,
//! )
//! .unwrap();
//! let request = Request::new(
//!     r#"User::"alice""#.parse().unwrap(),
//!     r#"Action::"view""#.parse().unwrap(),
//!     r#"Photo::"p1""#.parse().unwrap(),
//! );
//!
//! let response = is_authorized(&request, &policies, &entities, None).unwrap();
//! assert!(response.is_allowed());
//! ```

pub use authorizer::{Authorizer, BatchAuthorizer, is_authorized, is_authorized_batch};
pub use config::{AuthorizerConfig, FormatConfig, ValidationMode};
pub use engine::{EngineSnapshot, PolicyEngine};
pub use entities::Entities;
pub use error::{EvaluationError, PolicyError, RequestValidationError, SourcePosition};
pub use evaluator::{Env, Evaluator, evaluate};
pub use format::format_policies;
pub use loader::{compile_policy, compile_schema};
pub use parser::{parse_entity_uid, parse_expression, parse_policy, parse_policy_set};
pub use policy_set::{PolicySet, TemplateLink};
pub use schema::{Schema, ValidationResult};
pub use traits::EntityLookup;
pub use types::{
    Context, Decision, Diagnostics, Entity, EntityUid, PolicyId, PolicyVersion, Request,
    Response, Value,
};

pub use ast::{Effect, Policy};

pub mod ast;
mod authorizer;
pub mod config;
mod engine;
mod entities;
mod error;
mod evaluator;
mod format;
mod loader;
pub mod metrics;
mod parser;
mod policy_match;
mod policy_set;
pub mod schema;
mod timers;
mod traits;
mod tree;
pub mod types;
