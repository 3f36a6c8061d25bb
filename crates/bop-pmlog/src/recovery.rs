//! Multi-log recovery scheduler.
//!
//! Recovery is a k-way merge over per-slot step sequences. Each recovering
//! slot exposes the order of its next step; the scheduler always runs the
//! globally smallest one, so interleaved operations across logs are replayed
//! in the order they originally committed. Payload semantics stay with the
//! log types.

use tracing::{debug, trace, warn};

use crate::descriptor::{RecoveryOrder, SlotId, SlotState, SlotTable};
use crate::error::{LogMgrError, LogMgrResult};

/// Summary of one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pending slots moved into the recovery set.
    pub collected: usize,
    /// `recovery_do` invocations.
    pub steps: u64,
    /// Slots moved to the free list.
    pub recovered: usize,
    /// Slots left pending because their type has no recovery capability.
    pub pending: usize,
}

/// Recovers every pending slot whose type exposes recovery.
///
/// Safe to call repeatedly: with nothing eligible it returns an empty report.
pub(crate) fn run_recovery(slots: &mut SlotTable) -> LogMgrResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for slot in slots.slots_in(SlotState::Pending) {
        let descriptor = slots.descriptor_mut(slot);
        let Some(ops) = descriptor.ops().cloned() else {
            continue;
        };
        let Some(recovery) = ops.recovery() else {
            continue;
        };
        if let Err(err) = recovery.recovery_init(descriptor) {
            return Err(abort_pass(slots, slot, "recovery_init", err));
        }
        slots.transition(slot, SlotState::Recovering);
        report.collected += 1;
    }

    while let Some((slot, order)) = next_to_recover(slots) {
        trace!(slot = slot.index(), order, "replaying recovery step");
        if let Err(err) = recover_step(slots, slot, order) {
            return Err(abort_pass(slots, slot, "recovery step", err));
        }
        report.steps += 1;
    }

    for slot in slots.slots_in(SlotState::Recovering) {
        slots.transition(slot, SlotState::Free);
        report.recovered += 1;
    }
    report.pending = slots.count(SlotState::Pending);

    if report.collected > 0 || report.pending > 0 {
        debug!(
            collected = report.collected,
            steps = report.steps,
            recovered = report.recovered,
            pending = report.pending,
            "recovery pass complete"
        );
    }
    if report.pending > 0 {
        warn!(
            pending = report.pending,
            "slots left pending without a recovery-capable log type"
        );
    }
    Ok(report)
}

/// Recovering slot with the smallest order; ties go to the earlier slot in list order.
fn next_to_recover(slots: &SlotTable) -> Option<(SlotId, u64)> {
    let mut next: Option<(SlotId, u64)> = None;
    for slot in slots.slots_in(SlotState::Recovering) {
        let Some(order) = slots.descriptor(slot).order().value() else {
            continue;
        };
        if next.is_none_or(|(_, best)| order < best) {
            next = Some((slot, order));
        }
    }
    next
}

fn recover_step(slots: &mut SlotTable, slot: SlotId, order: u64) -> LogMgrResult<()> {
    let descriptor = slots.descriptor_mut(slot);
    let ops = descriptor
        .ops()
        .cloned()
        .ok_or_else(|| LogMgrError::invariant(format!("recovering slot {slot} has no operations")))?;
    let recovery = ops.recovery().ok_or_else(|| {
        LogMgrError::invariant(format!("log type {} lost its recovery capability", ops.name()))
    })?;
    recovery.recovery_do(descriptor)?;
    recovery.recovery_prepare_next(descriptor)?;
    match descriptor.order().value() {
        Some(next) if next <= order => Err(LogMgrError::invariant(format!(
            "slot {slot} recovery order went from {order} to {next}"
        ))),
        _ => Ok(()),
    }
}

/// Returns unfinished slots to pending so a later pass can retry them.
/// Slots that already finished are released to the free list.
fn abort_pass(
    slots: &mut SlotTable,
    failed: SlotId,
    stage: &'static str,
    err: LogMgrError,
) -> LogMgrError {
    warn!(slot = failed.index(), stage, error = %err, "recovery pass aborted");
    slots.descriptor_mut(failed).set_order(RecoveryOrder::NONE);
    if slots.state(failed) == Some(SlotState::Recovering) {
        slots.transition(failed, SlotState::Pending);
    }
    for slot in slots.slots_in(SlotState::Recovering) {
        let descriptor = slots.descriptor_mut(slot);
        if descriptor.order().is_none() {
            slots.transition(slot, SlotState::Free);
        } else {
            descriptor.set_order(RecoveryOrder::NONE);
            slots.transition(slot, SlotState::Pending);
        }
    }
    LogMgrError::invariant(format!("{stage} failed for slot {failed}: {err}"))
}
