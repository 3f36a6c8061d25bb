//! Free-slot selection and the allocate/release protocol.

use tracing::{debug, warn};

use crate::descriptor::{SlotId, SlotState, SlotTable};
use crate::error::{LogMgrError, LogMgrResult};
use crate::ops::{LogTypeId, SlotTag};
use crate::registry::TypeRegistry;
use crate::test_support::{TagPersistContext, tag_persist_override};

/// Candidate picked from the free list for a requested type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSlotChoice {
    /// A free slot already tagged with the requested type.
    Tagged(SlotId),
    /// An untagged free slot that must be bound to the type.
    Untyped(SlotId),
    /// Neither exists. Free slots tagged with other types are not rebound.
    Unavailable,
}

/// Scans the free list once, preferring the first slot tagged `type_id` over
/// the first untagged one.
pub fn select_free_slot(slots: &SlotTable, type_id: LogTypeId) -> FreeSlotChoice {
    let mut tagged = None;
    let mut untyped = None;
    for slot in slots.slots_in(SlotState::Free) {
        match slots.descriptor(slot).tag() {
            SlotTag::Typed(id) if id == type_id && tagged.is_none() => tagged = Some(slot),
            SlotTag::Free if untyped.is_none() => untyped = Some(slot),
            _ => {}
        }
    }
    match (tagged, untyped) {
        (Some(slot), _) => FreeSlotChoice::Tagged(slot),
        (None, Some(slot)) => FreeSlotChoice::Untyped(slot),
        (None, None) => FreeSlotChoice::Unavailable,
    }
}

/// Hands out a free slot for `type_id` and moves it to the active list.
///
/// The new tag is persisted only after `init` succeeds, so after a crash the
/// slot is either untagged or bound to a fully initialized log. Every failure
/// leaves the slot free and its persisted tag unchanged.
pub(crate) fn allocate(
    registry: &TypeRegistry,
    slots: &mut SlotTable,
    type_id: LogTypeId,
) -> LogMgrResult<SlotId> {
    let (slot, bound_here) = match select_free_slot(slots, type_id) {
        FreeSlotChoice::Tagged(slot) => (slot, false),
        FreeSlotChoice::Untyped(slot) => {
            let ops = registry
                .lookup(type_id)
                .ok_or(LogMgrError::UnknownType(type_id))?;
            let descriptor = slots.descriptor_mut(slot);
            descriptor.bind_ops(ops.clone());
            if let Err(err) = ops.alloc(descriptor) {
                descriptor.clear_binding();
                warn!(slot = slot.index(), type_id = type_id.as_u64(), error = %err, "log alloc failed");
                return Err(LogMgrError::invariant(format!(
                    "alloc of log type {type_id} failed on slot {slot}: {err}"
                )));
            }
            (slot, true)
        }
        FreeSlotChoice::Unavailable => return Err(LogMgrError::NoFreeSlot(type_id)),
    };

    slots.transition(slot, SlotState::Active);
    if let Err(err) = activate(slots, slot, type_id) {
        warn!(slot = slot.index(), type_id = type_id.as_u64(), error = %err, "log activation failed; slot returned to free list");
        if bound_here {
            slots.descriptor_mut(slot).clear_binding();
        }
        slots.transition(slot, SlotState::Free);
        return Err(err);
    }

    debug!(
        slot = slot.index(),
        type_id = type_id.as_u64(),
        rebound = bound_here,
        "log slot allocated"
    );
    Ok(slot)
}

/// Initializes the log, then persists its tag.
fn activate(slots: &mut SlotTable, slot: SlotId, type_id: LogTypeId) -> LogMgrResult<()> {
    let descriptor = slots.descriptor_mut(slot);
    let ops = descriptor.ops().cloned().ok_or_else(|| {
        LogMgrError::invariant(format!("free slot {slot} tagged {type_id} has no operations"))
    })?;
    ops.init(descriptor)
        .map_err(|err| LogMgrError::invariant(format!("init of log type {type_id} failed on slot {slot}: {err}")))?;

    if let Some(result) = tag_persist_override(&TagPersistContext { slot, type_id }) {
        result?;
    }
    descriptor.metadata().persist_tag(SlotTag::Typed(type_id))
}

/// Returns an active slot to the free list, keeping its tag and binding so a
/// later allocation of the same type reuses it as is.
pub(crate) fn release(slots: &mut SlotTable, slot: SlotId) -> LogMgrResult<()> {
    if slots.state(slot) != Some(SlotState::Active) {
        return Err(LogMgrError::InvalidHandle(slot));
    }
    slots.transition(slot, SlotState::Free);
    debug!(slot = slot.index(), "log slot released");
    Ok(())
}
