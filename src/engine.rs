use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::ast::Policy;
use crate::authorizer::{Authorizer, BatchAuthorizer};
use crate::config::AuthorizerConfig;
use crate::entities::Entities;
use crate::error::PolicyError;
use crate::loader;
use crate::metrics::{self, EvaluationPhases, EvaluationStats};
use crate::policy_match::scope_match_reason;
use crate::policy_set::PolicySet;
use crate::schema::Schema;
use crate::timers::{PhaseTimer, as_millis_f64};
use crate::types::{EntityUid, PolicyVersion, Request, Response};

/// Everything one evaluation needs, frozen at load time.
///
/// Reloads never mutate a snapshot; they build a new one and swap it in, so
/// a caller holding an `Arc<EngineSnapshot>` keeps a consistent view.
#[derive(Debug)]
pub struct EngineSnapshot {
    authorizer: Authorizer,
    entities: Arc<Entities>,
    version: PolicyVersion,
}

impl EngineSnapshot {
    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    pub fn policy_set(&self) -> &PolicySet {
        self.authorizer.policy_set()
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.authorizer.schema()
    }

    pub fn version(&self) -> &PolicyVersion {
        &self.version
    }
}

/// The main engine handle. Cloneable and thread-safe.
#[derive(Clone)]
pub struct PolicyEngine {
    inner: Arc<RwLock<Arc<EngineSnapshot>>>,
}

impl PolicyEngine {
    pub fn new_from_str(policy_text: &str) -> Result<Self, PolicyError> {
        let authorizer = Authorizer::new(loader::compile_policy(policy_text)?)?;
        Ok(Self::from_snapshot(EngineSnapshot {
            authorizer,
            entities: Arc::new(Entities::empty()),
            version: loader::policy_version(policy_text),
        }))
    }

    /// Load policies that must validate against `schema`.
    pub fn new_from_str_with_schema(policy_text: &str, schema: Schema) -> Result<Self, PolicyError> {
        let authorizer = Authorizer::with_schema(loader::compile_policy(policy_text)?, schema)?;
        Ok(Self::from_snapshot(EngineSnapshot {
            authorizer,
            entities: Arc::new(Entities::empty()),
            version: loader::policy_version(policy_text),
        }))
    }

    /// Like `new_from_str_with_schema`, with the schema given as text or JSON.
    pub fn new_from_str_with_cedarschema(
        policy_text: &str,
        schema_text: &str,
    ) -> Result<Self, PolicyError> {
        Self::new_from_str_with_schema(policy_text, loader::compile_schema(schema_text)?)
    }

    /// Replace the entity store; entities are validated when a schema is set.
    ///
    /// Returns an engine with its own snapshot lock, so clones taken before
    /// this call keep their entities.
    pub fn with_entities(self, entities: Entities) -> Result<Self, PolicyError> {
        let current = self.current_snapshot();
        current.authorizer.validate_entities(&entities)?;
        Ok(Self::from_snapshot(EngineSnapshot {
            authorizer: current.authorizer.clone(),
            entities: Arc::new(entities),
            version: current.version.clone(),
        }))
    }

    /// Returns an engine using `config`; earlier clones keep their config.
    pub fn with_config(self, config: AuthorizerConfig) -> Result<Self, PolicyError> {
        let current = self.current_snapshot();
        Ok(Self::from_snapshot(EngineSnapshot {
            authorizer: current.authorizer.clone().with_config(config),
            entities: Arc::clone(&current.entities),
            version: current.version.clone(),
        }))
    }

    /// Swap in new policies, keeping the current schema, entities and config.
    pub fn reload_from_str(&self, policy_text: &str) -> Result<(), PolicyError> {
        let policies = loader::compile_policy(policy_text)?;
        self.replace(|current| {
            let authorizer = match current.authorizer.shared_schema() {
                Some(schema) => Authorizer::with_shared_schema(policies, schema)?,
                None => Authorizer::new(policies)?,
            };
            Ok(EngineSnapshot {
                authorizer: authorizer.with_config(current.authorizer.config().clone()),
                entities: Arc::clone(&current.entities),
                version: loader::policy_version(policy_text),
            })
        })?;
        self.log_reload("Policies", false);
        Ok(())
    }

    /// Swap in new policies together with a new schema. The current entities
    /// are revalidated against the new schema.
    pub fn reload_from_str_with_schema(
        &self,
        policy_text: &str,
        schema: Schema,
    ) -> Result<(), PolicyError> {
        let policies = loader::compile_policy(policy_text)?;
        let authorizer = Authorizer::with_schema(policies, schema)?;
        self.replace(|current| {
            let authorizer = authorizer.with_config(current.authorizer.config().clone());
            authorizer.validate_entities(&current.entities)?;
            Ok(EngineSnapshot {
                authorizer,
                entities: Arc::clone(&current.entities),
                version: loader::policy_version(policy_text),
            })
        })?;
        self.log_reload("Policies", true);
        Ok(())
    }

    pub fn reload_from_str_with_cedarschema(
        &self,
        policy_text: &str,
        schema_text: &str,
    ) -> Result<(), PolicyError> {
        self.reload_from_str_with_schema(policy_text, loader::compile_schema(schema_text)?)
    }

    pub fn reload_entities(&self, entities: Entities) -> Result<(), PolicyError> {
        self.replace(|current| {
            current.authorizer.validate_entities(&entities)?;
            Ok(EngineSnapshot {
                authorizer: current.authorizer.clone(),
                entities: Arc::new(entities),
                version: current.version.clone(),
            })
        })?;
        self.log_reload("Entities", false);
        Ok(())
    }

    /// Decide one request against the current snapshot.
    pub fn evaluate(&self, request: &Request) -> Result<Response, PolicyError> {
        let snapshot = self.current_snapshot();
        let mut validation = Duration::ZERO;
        let mut authorize = Duration::ZERO;
        let mut total = Duration::ZERO;

        let response = {
            let _total = PhaseTimer::new(&mut total);
            {
                let _phase = PhaseTimer::new(&mut validation);
                snapshot.authorizer.validate_request(request)?;
            }
            let _phase = PhaseTimer::new(&mut authorize);
            snapshot.authorizer.decide(request, snapshot.entities.as_ref())
        };

        if metrics::is_enabled() {
            metrics::record_evaluation(
                &EvaluationStats {
                    duration: total,
                    allowed: response.is_allowed(),
                    principal_id: request.principal.to_string(),
                    action_id: request.action.to_string(),
                    errored_policies: response.diagnostics.errors.len(),
                },
                &EvaluationPhases {
                    validation_ms: as_millis_f64(validation),
                    authorize_ms: as_millis_f64(authorize),
                    total_ms: as_millis_f64(total),
                },
            );
        }
        Ok(response)
    }

    /// Decide many requests against a single snapshot, in input order.
    pub fn evaluate_batch(&self, requests: &[Request]) -> Result<Vec<Response>, PolicyError> {
        let snapshot = self.current_snapshot();
        BatchAuthorizer::new(&snapshot.authorizer, &snapshot.entities)?.is_authorized_batch(requests)
    }

    /// Static and linked policies whose principal scope admits `principal`.
    pub fn policies_for_principal(&self, principal: &EntityUid) -> Result<Vec<Policy>, PolicyError> {
        let snapshot = self.current_snapshot();
        let mut matching = Vec::new();
        for policy in snapshot.authorizer.effective_policies() {
            let Some(reason) =
                scope_match_reason(policy.principal(), principal, snapshot.entities.as_ref())?
            else {
                continue;
            };
            debug!(
                event = "Listing",
                principal = %principal,
                policy = policy.id().as_str(),
                reason = %reason
            );
            matching.push(policy.clone());
        }
        Ok(matching)
    }

    pub fn current_snapshot(&self) -> Arc<EngineSnapshot> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&*guard),
            // A panicking writer can only have left a whole snapshot behind.
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn current_version(&self) -> PolicyVersion {
        self.current_snapshot().version.clone()
    }

    fn from_snapshot(snapshot: EngineSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// Build the next snapshot from the current one and swap it in. The write
    /// lock is held across the build so concurrent reloads cannot interleave.
    fn replace(
        &self,
        build: impl FnOnce(&EngineSnapshot) -> Result<EngineSnapshot, PolicyError>,
    ) -> Result<(), PolicyError> {
        let mut guard = self.inner.write()?;
        let next = build(&**guard)?;
        *guard = Arc::new(next);
        Ok(())
    }

    fn log_reload(&self, phase: &str, schema_reloaded: bool) {
        let snapshot = self.current_snapshot();
        let policy_count = snapshot.authorizer.effective_policies().len();
        info!(
            event = "PolicyReload",
            phase = phase,
            hash = snapshot.version.hash.as_str(),
            loaded_at = snapshot.version.loaded_at.as_str(),
            policies = policy_count,
            entities = snapshot.entities.len(),
            has_schema = snapshot.schema().is_some(),
            schema_reloaded = schema_reloaded
        );
        metrics::record_reload(
            policy_count,
            snapshot.entities.len(),
            snapshot.schema().is_some(),
        );
    }
}

#[cfg(test)]
mod tests;
