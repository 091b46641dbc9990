use crate::types::{Entity, EntityUid};

/// Read access to entity data, as needed by the evaluator and scope matching.
///
/// `Entities` is the in-crate implementation; hosts with their own entity
/// storage can implement this directly.
pub trait EntityLookup: Send + Sync {
    /// The entity record for `uid`, if it is known.
    fn entity(&self, uid: &EntityUid) -> Option<&Entity>;

    /// True when `uid == ancestor` or `ancestor` is reachable from `uid`
    /// through parent edges. Unknown uids only match themselves.
    fn is_descendant(&self, uid: &EntityUid, ancestor: &EntityUid) -> bool;

    /// True when `uid` is present in the store.
    fn contains(&self, uid: &EntityUid) -> bool {
        self.entity(uid).is_some()
    }
}
