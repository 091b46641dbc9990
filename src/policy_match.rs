use crate::ast::{EntityReference, ScopeConstraint};
use crate::error::EvaluationError;
use crate::traits::EntityLookup;
use crate::types::EntityUid;

/// Why a scope constraint admitted an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub(crate) enum MatchReason {
    Any,
    Eq,
    In,
    Is,
    IsIn,
    InList,
}

/// Test one scope constraint against `uid`.
///
/// `In` holds on equality or through the entity hierarchy; an entity missing
/// from the store is simply not a descendant of anything.
pub(crate) fn scope_match_reason(
    constraint: &ScopeConstraint,
    uid: &EntityUid,
    entities: &dyn EntityLookup,
) -> Result<Option<MatchReason>, EvaluationError> {
    let reason = match constraint {
        ScopeConstraint::All => Some(MatchReason::Any),
        ScopeConstraint::Eq(target) => {
            (resolve(target)? == uid).then_some(MatchReason::Eq)
        }
        ScopeConstraint::In(target) => {
            in_hierarchy(uid, resolve(target)?, entities).then_some(MatchReason::In)
        }
        ScopeConstraint::InList(targets) => targets
            .iter()
            .any(|target| in_hierarchy(uid, target, entities))
            .then_some(MatchReason::InList),
        ScopeConstraint::Is(entity_type) => {
            (uid.entity_type() == entity_type).then_some(MatchReason::Is)
        }
        ScopeConstraint::IsIn(entity_type, target) => {
            let target = resolve(target)?;
            (uid.entity_type() == entity_type && in_hierarchy(uid, target, entities))
                .then_some(MatchReason::IsIn)
        }
    };
    Ok(reason)
}

pub(crate) fn scope_matches(
    constraint: &ScopeConstraint,
    uid: &EntityUid,
    entities: &dyn EntityLookup,
) -> Result<bool, EvaluationError> {
    Ok(scope_match_reason(constraint, uid, entities)?.is_some())
}

fn resolve(reference: &EntityReference) -> Result<&EntityUid, EvaluationError> {
    match reference {
        EntityReference::Uid(uid) => Ok(uid),
        EntityReference::Slot(slot) => Err(EvaluationError::UnlinkedSlot(slot.to_string())),
    }
}

fn in_hierarchy(uid: &EntityUid, target: &EntityUid, entities: &dyn EntityLookup) -> bool {
    uid == target || entities.is_descendant(uid, target)
}
