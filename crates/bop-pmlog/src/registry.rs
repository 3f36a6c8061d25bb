use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::descriptor::{SlotState, SlotTable};
use crate::error::{LogMgrError, LogMgrResult};
use crate::ops::{LogOps, LogTypeId, SlotTag};

/// Outcome of a type registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The type was added; `bound` pending slots received its operations.
    Inserted { bound: usize },
    /// The type id was already known; nothing changed.
    AlreadyRegistered,
}

/// Known log types keyed by id. Entries are immutable once inserted.
#[derive(Default)]
pub struct TypeRegistry {
    entries: HashMap<LogTypeId, Arc<dyn LogOps>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, type_id: LogTypeId) -> bool {
        self.entries.contains_key(&type_id)
    }

    pub fn lookup(&self, type_id: LogTypeId) -> Option<Arc<dyn LogOps>> {
        self.entries.get(&type_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered type ids in ascending order.
    pub fn type_ids(&self) -> Vec<LogTypeId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn insert(&mut self, type_id: LogTypeId, ops: Arc<dyn LogOps>) -> LogMgrResult<()> {
        self.entries
            .try_reserve(1)
            .map_err(|_| LogMgrError::OutOfMemory)?;
        self.entries.insert(type_id, ops);
        Ok(())
    }
}

/// Adds `type_id` to the registry and binds its operations to every pending
/// slot carrying that tag, constructing their volatile log objects.
///
/// The caller must have exclusive access to both `registry` and `slots`:
/// bring-up passes values it owns outright, later callers pass lock guards.
///
/// If `alloc` fails on any pending slot the registration is undone: slots
/// bound by this call are unbound and the entry is removed.
pub(crate) fn register_type(
    registry: &mut TypeRegistry,
    slots: &mut SlotTable,
    type_id: LogTypeId,
    ops: Arc<dyn LogOps>,
) -> LogMgrResult<Registration> {
    if registry.contains(type_id) {
        debug!(type_id = type_id.as_u64(), "log type already registered");
        return Ok(Registration::AlreadyRegistered);
    }
    registry.insert(type_id, ops.clone())?;

    let mut bound = Vec::new();
    for slot in slots.slots_in(SlotState::Pending) {
        let descriptor = slots.descriptor_mut(slot);
        if descriptor.tag() != SlotTag::Typed(type_id) {
            continue;
        }
        descriptor.bind_ops(ops.clone());
        if let Err(err) = ops.alloc(descriptor) {
            warn!(
                type_id = type_id.as_u64(),
                slot = slot.index(),
                error = %err,
                "log alloc failed while binding pending slot; undoing registration"
            );
            descriptor.clear_binding();
            for slot in bound {
                slots.descriptor_mut(slot).clear_binding();
            }
            registry.entries.remove(&type_id);
            return Err(LogMgrError::invariant(format!(
                "alloc of log type {type_id} failed on pending slot {slot}: {err}"
            )));
        }
        bound.push(slot);
    }

    debug!(
        type_id = type_id.as_u64(),
        ops = ops.name(),
        bound = bound.len(),
        "log type registered"
    );
    Ok(Registration::Inserted { bound: bound.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogManagerConfig;
    use crate::descriptor::SlotId;
    use crate::pool::PersistentPool;
    use crate::pool::mapping::MemorySegmentMapper;
    use crate::test_support::SequenceLog;

    fn pending_table(tags: &[(usize, u64)]) -> SlotTable {
        let cfg = LogManagerConfig::for_tests("/unused").pool;
        let mapper = MemorySegmentMapper::new();
        let pool = PersistentPool::ensure_pool_mapped(&cfg, &mapper).expect("map");
        for (slot, tag) in tags {
            pool.mapping()
                .persist_u64(pool.layout().flags_offset(*slot), *tag)
                .expect("seed tag");
        }
        pool.create_descriptors().expect("descriptors")
    }

    #[test]
    fn registration_binds_matching_pending_slots() {
        let mut slots = pending_table(&[(2, 4), (7, 4), (9, 6)]);
        let mut registry = TypeRegistry::new();
        let log = SequenceLog::new();
        let ty = LogTypeId::new(4).expect("valid");

        let outcome = register_type(&mut registry, &mut slots, ty, log.clone()).expect("register");
        assert_eq!(outcome, Registration::Inserted { bound: 2 });
        assert_eq!(log.alloc_calls(), 2);
        assert!(slots.descriptor(SlotId(2)).ops().is_some());
        assert!(slots.descriptor(SlotId(2)).has_log());
        assert!(slots.descriptor(SlotId(9)).ops().is_none());
        assert_eq!(slots.count(SlotState::Pending), 3);
    }

    #[test]
    fn reregistration_is_a_no_op() {
        let mut slots = pending_table(&[(1, 4)]);
        let mut registry = TypeRegistry::new();
        let log = SequenceLog::new();
        let ty = LogTypeId::new(4).expect("valid");

        register_type(&mut registry, &mut slots, ty, log.clone()).expect("register");
        let again = register_type(&mut registry, &mut slots, ty, log.clone()).expect("again");
        assert_eq!(again, Registration::AlreadyRegistered);
        assert_eq!(registry.len(), 1);
        assert_eq!(log.alloc_calls(), 1);
    }

    #[test]
    fn failed_alloc_undoes_registration() {
        let mut slots = pending_table(&[(1, 4), (3, 4)]);
        let mut registry = TypeRegistry::new();
        let log = SequenceLog::new();
        log.fail_alloc_after(1);
        let ty = LogTypeId::new(4).expect("valid");

        let err = register_type(&mut registry, &mut slots, ty, log.clone()).expect_err("fails");
        assert!(matches!(err, LogMgrError::Invariant(_)));
        assert!(!registry.contains(ty));
        assert!(slots.descriptor(SlotId(1)).ops().is_none());
        assert!(!slots.descriptor(SlotId(1)).has_log());
        assert!(slots.descriptor(SlotId(3)).ops().is_none());
    }
}
