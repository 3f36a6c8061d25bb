use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::descriptor::{LogDescriptor, RecoveryOrder, SlotId, SlotRegion};
use crate::error::{LogMgrError, LogMgrResult};
use crate::ops::{LogOps, LogTypeId, RecoveryOps, SlotTag, TruncationOps};

/// Slot and type an allocation is about to tag.
#[derive(Debug, Clone, Copy)]
pub struct TagPersistContext {
    pub slot: SlotId,
    pub type_id: LogTypeId,
}

/// Intercepts the tag store at the end of an allocation.
///
/// Returning `Some(Err(_))` aborts the allocation after `init` and before the
/// tag store, which is how tests stand in for a crash at that point.
pub type TagPersistHook =
    dyn Fn(&TagPersistContext) -> Option<LogMgrResult<()>> + Send + Sync + 'static;

#[cfg(debug_assertions)]
fn installed_tag_hook() -> &'static RwLock<Option<Arc<TagPersistHook>>> {
    static HOOK: OnceLock<RwLock<Option<Arc<TagPersistHook>>>> = OnceLock::new();
    HOOK.get_or_init(RwLock::default)
}

/// Outcome forced by the installed hook for `ctx`. `None` lets the store proceed.
pub fn tag_persist_override(ctx: &TagPersistContext) -> Option<LogMgrResult<()>> {
    #[cfg(debug_assertions)]
    {
        let hook = installed_tag_hook().read().clone();
        hook.and_then(|hook| hook(ctx))
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = ctx;
        None
    }
}

/// Reinstates the hook that was active before [`install_tag_persist_hook`].
pub struct TagPersistHookGuard {
    #[cfg(debug_assertions)]
    previous: Option<Arc<TagPersistHook>>,
}

impl Drop for TagPersistHookGuard {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            *installed_tag_hook().write() = self.previous.take();
        }
    }
}

/// Routes every tag store through `hook` until the returned guard drops.
#[cfg(debug_assertions)]
pub fn install_tag_persist_hook<F>(hook: F) -> TagPersistHookGuard
where
    F: Fn(&TagPersistContext) -> Option<LogMgrResult<()>> + Send + Sync + 'static,
{
    let previous = installed_tag_hook().write().replace(Arc::new(hook));
    TagPersistHookGuard { previous }
}

/// Release builds never consult `hook`.
#[cfg(not(debug_assertions))]
pub fn install_tag_persist_hook<F>(hook: F) -> TagPersistHookGuard
where
    F: Fn(&TagPersistContext) -> Option<LogMgrResult<()>> + Send + Sync + 'static,
{
    drop(hook);
    TagPersistHookGuard {}
}

/// Removes the installed hook even while guards are outstanding.
pub fn clear_tag_persist_hook() {
    #[cfg(debug_assertions)]
    {
        installed_tag_hook().write().take();
    }
}

/// Volatile state of a [`SequenceLog`] slot.
#[derive(Debug, Default)]
struct SequenceState {
    entries: Vec<u64>,
    cursor: usize,
    initialized: bool,
}

/// Minimal log type for exercising the manager.
///
/// A slot's physical region holds a count word followed by that many
/// recovery orders. Recovery replays each order into a shared journal, so
/// tests can observe how steps from several slots were interleaved.
#[derive(Debug, Default)]
pub struct SequenceLog {
    recoverable: bool,
    truncatable: bool,
    journal: Mutex<Vec<(SlotId, u64)>>,
    tags_at_init: Mutex<Vec<SlotTag>>,
    alloc_calls: AtomicUsize,
    init_calls: AtomicUsize,
    truncate_calls: AtomicUsize,
    recovery_attempts: AtomicU64,
    alloc_budget: Mutex<Option<usize>>,
    fail_init: AtomicBool,
    fail_recovery_at: AtomicU64,
}

#[allow(clippy::new_ret_no_self)]
impl SequenceLog {
    /// Recoverable log type without truncation support.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recoverable: true,
            ..Self::default()
        })
    }

    /// Log type whose pending slots can never be recovered.
    pub fn without_recovery() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recoverable log type that the truncation service visits.
    pub fn truncatable() -> Arc<Self> {
        Arc::new(Self {
            recoverable: true,
            truncatable: true,
            ..Self::default()
        })
    }

    /// Writes `orders` into `region` using the layout recovery reads back.
    pub fn write_entries(region: &mut SlotRegion, orders: &[u64]) -> LogMgrResult<()> {
        let needed = (orders.len() + 1) * 8;
        if needed > region.len() {
            return Err(LogMgrError::invariant(format!(
                "{} entries need {needed} bytes, region holds {}",
                orders.len(),
                region.len()
            )));
        }
        for (idx, order) in orders.iter().enumerate() {
            region.persist_u64((idx + 1) * 8, *order)?;
        }
        region.persist_u64(0, orders.len() as u64)
    }

    /// Reads the orders stored in `region`.
    pub fn read_entries(region: &SlotRegion) -> LogMgrResult<Vec<u64>> {
        let count = region.read_u64(0)? as usize;
        if count >= region.len() / 8 {
            return Err(LogMgrError::invariant(format!(
                "entry count {count} exceeds region of {} bytes",
                region.len()
            )));
        }
        (1..=count).map(|idx| region.read_u64(idx * 8)).collect()
    }

    /// Replayed steps as (slot, order), in replay order.
    pub fn journal(&self) -> Vec<(SlotId, u64)> {
        self.journal.lock().clone()
    }

    pub fn alloc_calls(&self) -> usize {
        self.alloc_calls.load(Ordering::Relaxed)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::Relaxed)
    }

    pub fn truncate_calls(&self) -> usize {
        self.truncate_calls.load(Ordering::Relaxed)
    }

    /// Persisted tag of each slot as observed inside `init`.
    pub fn tags_seen_at_init(&self) -> Vec<SlotTag> {
        self.tags_at_init.lock().clone()
    }

    /// Lets `successes` further `alloc` calls through, then fails every one after.
    pub fn fail_alloc_after(&self, successes: usize) {
        *self.alloc_budget.lock() = Some(successes);
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::Relaxed);
    }

    /// Fails the `attempt`-th `recovery_do` call, counting from one.
    pub fn fail_recovery_at(&self, attempt: u64) {
        self.recovery_attempts.store(0, Ordering::Relaxed);
        self.fail_recovery_at.store(attempt, Ordering::Relaxed);
    }

    fn state_and_region(
        descriptor: &mut LogDescriptor,
    ) -> LogMgrResult<(&mut SequenceState, &mut SlotRegion)> {
        let slot = descriptor.slot();
        descriptor
            .log_and_region_mut::<SequenceState>()
            .ok_or_else(|| LogMgrError::invariant(format!("slot {slot} has no sequence log")))
    }
}

impl LogOps for SequenceLog {
    fn name(&self) -> &str {
        "sequence"
    }

    fn alloc(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()> {
        if let Some(budget) = self.alloc_budget.lock().as_mut() {
            if *budget == 0 {
                return Err(LogMgrError::invariant("sequence log alloc refused"));
            }
            *budget -= 1;
        }
        self.alloc_calls.fetch_add(1, Ordering::Relaxed);
        descriptor.set_log(SequenceState::default());
        Ok(())
    }

    fn init(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()> {
        self.init_calls.fetch_add(1, Ordering::Relaxed);
        self.tags_at_init.lock().push(descriptor.tag());
        if self.fail_init.load(Ordering::Relaxed) {
            return Err(LogMgrError::invariant("sequence log init refused"));
        }
        let (state, region) = Self::state_and_region(descriptor)?;
        region.persist_u64(0, 0)?;
        *state = SequenceState {
            initialized: true,
            ..SequenceState::default()
        };
        Ok(())
    }

    fn recovery(&self) -> Option<&dyn RecoveryOps> {
        self.recoverable.then_some(self as &dyn RecoveryOps)
    }

    fn truncation(&self) -> Option<&dyn TruncationOps> {
        self.truncatable.then_some(self as &dyn TruncationOps)
    }

    fn flush(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()> {
        descriptor.region().flush()
    }
}

impl RecoveryOps for SequenceLog {
    fn recovery_init(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()> {
        let (state, region) = Self::state_and_region(descriptor)?;
        state.entries = Self::read_entries(region)?;
        state.cursor = 0;
        let first = state.entries.first().copied();
        descriptor.set_order(first.map_or(RecoveryOrder::NONE, RecoveryOrder::at));
        Ok(())
    }

    fn recovery_do(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()> {
        let attempt = self.recovery_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt == self.fail_recovery_at.load(Ordering::Relaxed) {
            return Err(LogMgrError::invariant(format!(
                "sequence log recovery refused at attempt {attempt}"
            )));
        }
        let slot = descriptor.slot();
        let order = descriptor
            .order()
            .value()
            .ok_or_else(|| LogMgrError::invariant(format!("slot {slot} has no recovery order")))?;
        self.journal.lock().push((slot, order));
        Ok(())
    }

    fn recovery_prepare_next(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()> {
        let (state, region) = Self::state_and_region(descriptor)?;
        state.cursor += 1;
        let next = state.entries.get(state.cursor).copied();
        if next.is_none() {
            state.entries.clear();
            region.persist_u64(0, 0)?;
        }
        descriptor.set_order(next.map_or(RecoveryOrder::NONE, RecoveryOrder::at));
        Ok(())
    }
}

impl TruncationOps for SequenceLog {
    fn truncate(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()> {
        let slot = descriptor.slot();
        let (state, region) = Self::state_and_region(descriptor)?;
        if !state.initialized {
            return Err(LogMgrError::invariant(format!(
                "slot {slot} truncated before init"
            )));
        }
        region.persist_u64(0, 0)?;
        state.entries.clear();
        state.cursor = 0;
        self.truncate_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
