use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::allocator;
use crate::config::LogManagerConfig;
use crate::descriptor::{LogDescriptor, SlotCounts, SlotId, SlotState, SlotTable};
use crate::error::{LogMgrError, LogMgrResult};
use crate::metrics::{LogManagerMetrics, LogManagerMetricsSnapshot};
use crate::ops::{LogOps, LogTypeId, SlotTag};
use crate::pool::PersistentPool;
use crate::pool::mapping::{FileSegmentMapper, SegmentMapper};
use crate::recovery::{self, RecoveryReport};
use crate::registry::{self, Registration, TypeRegistry};
use crate::truncation::{self, TruncationService};

/// Collects the pieces needed to bring up a [`LogManager`].
///
/// Built-in log types are registered while bring-up still owns the registry
/// and slot table outright, so they bind pending slots before the first
/// recovery pass without taking any lock.
pub struct LogManagerBuilder {
    config: LogManagerConfig,
    mapper: Option<Arc<dyn SegmentMapper>>,
    builtin: Vec<(LogTypeId, Arc<dyn LogOps>)>,
}

impl LogManagerBuilder {
    pub fn new(config: LogManagerConfig) -> Self {
        Self {
            config,
            mapper: None,
            builtin: Vec::new(),
        }
    }

    /// Overrides the segment mapper. Defaults to a [`FileSegmentMapper`]
    /// rooted at the pool's `root_dir`.
    pub fn mapper(mut self, mapper: Arc<dyn SegmentMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Adds a log type registered during bring-up, before recovery runs.
    pub fn builtin_type(mut self, type_id: LogTypeId, ops: Arc<dyn LogOps>) -> Self {
        self.builtin.push((type_id, ops));
        self
    }

    /// Maps the pool, builds the descriptors, registers built-in types and
    /// recovers every slot they can recover.
    pub fn open(self) -> LogMgrResult<Arc<LogManager>> {
        let Self {
            config,
            mapper,
            builtin,
        } = self;
        config.validate()?;
        let mapper = match mapper {
            Some(mapper) => mapper,
            None => Arc::new(FileSegmentMapper::new(config.pool.root_dir.clone())),
        };

        let pool = PersistentPool::ensure_pool_mapped(&config.pool, mapper.as_ref())?;
        let mut slots = pool.create_descriptors()?;
        let mut registry = TypeRegistry::new();
        let metrics = LogManagerMetrics::default();

        for (type_id, ops) in builtin {
            let registration = registry::register_type(&mut registry, &mut slots, type_id, ops)?;
            metrics.record_registration(registration);
        }
        let report = recovery::run_recovery(&mut slots)?;
        metrics.record_recovery(&report);
        let counts = slots.counts();

        let manager = Arc::new(LogManager {
            config,
            mapper,
            registry: RwLock::new(registry),
            slots: Mutex::new(slots),
            pool: Mutex::new(Some(pool)),
            metrics,
            truncation: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if manager.config.truncation.enabled {
            let service =
                TruncationService::start(Arc::downgrade(&manager), manager.config.truncation)?;
            *manager.truncation.lock() = Some(service);
        }

        info!(
            base = manager.config.pool.base_address,
            types = manager.registry.read().len(),
            free = counts.free,
            pending = counts.pending,
            recovered = report.recovered,
            "log manager ready"
        );
        Ok(manager)
    }
}

/// Owns the log pool, the type registry and the slot table.
///
/// Lock order is always registry before slots. Log type callbacks run with
/// the slot lock held.
pub struct LogManager {
    config: LogManagerConfig,
    mapper: Arc<dyn SegmentMapper>,
    registry: RwLock<TypeRegistry>,
    slots: Mutex<SlotTable>,
    pool: Mutex<Option<PersistentPool>>,
    metrics: LogManagerMetrics,
    truncation: Mutex<Option<TruncationService>>,
    closed: AtomicBool,
}

impl fmt::Debug for LogManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogManager")
            .field("base", &self.config.pool.base_address)
            .field("closed", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl LogManager {
    pub fn builder(config: LogManagerConfig) -> LogManagerBuilder {
        LogManagerBuilder::new(config)
    }

    /// Brings up a manager with no built-in types and the default mapper.
    pub fn open(config: LogManagerConfig) -> LogMgrResult<Arc<Self>> {
        LogManagerBuilder::new(config).open()
    }

    pub fn config(&self) -> &LogManagerConfig {
        &self.config
    }

    pub fn mapper(&self) -> &Arc<dyn SegmentMapper> {
        &self.mapper
    }

    fn lock_slots(&self) -> LogMgrResult<MutexGuard<'_, SlotTable>> {
        let slots = self.slots.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(LogMgrError::ShutDown);
        }
        Ok(slots)
    }

    /// Registers a log type after bring-up.
    ///
    /// Pending slots tagged with `type_id` get the type's operations and a
    /// volatile log object; recovering them is left to [`Self::run_recovery`].
    pub fn register_log_type(
        &self,
        type_id: LogTypeId,
        ops: Arc<dyn LogOps>,
    ) -> LogMgrResult<Registration> {
        let mut registry = self.registry.write();
        let mut slots = self.lock_slots()?;
        let registration = registry::register_type(&mut registry, &mut slots, type_id, ops)?;
        self.metrics.record_registration(registration);
        Ok(registration)
    }

    /// Recovers pending slots whose type has been registered since the last pass.
    pub fn run_recovery(&self) -> LogMgrResult<RecoveryReport> {
        let mut slots = self.lock_slots()?;
        let report = recovery::run_recovery(&mut slots)?;
        self.metrics.record_recovery(&report);
        Ok(report)
    }

    /// Hands out a slot for `type_id`, reusing one already tagged with it when
    /// possible.
    ///
    /// `UnknownType` and `NoFreeSlot` leave all state untouched.
    pub fn allocate_log(self: &Arc<Self>, type_id: LogTypeId) -> LogMgrResult<LogHandle> {
        let registry = self.registry.read();
        let mut slots = self.lock_slots()?;
        match allocator::allocate(&registry, &mut slots, type_id) {
            Ok(slot) => {
                self.metrics.record_allocation();
                Ok(LogHandle {
                    manager: self.clone(),
                    slot,
                    type_id,
                })
            }
            Err(err) => {
                self.metrics.record_allocation_failure(&err);
                Err(err)
            }
        }
    }

    /// Returns the handle's slot to the free list. The slot keeps its tag so
    /// the next allocation of the same type picks it first.
    pub fn free_log(&self, handle: LogHandle) -> LogMgrResult<()> {
        if !std::ptr::eq(Arc::as_ptr(&handle.manager), self) {
            return Err(LogMgrError::InvalidHandle(handle.slot));
        }
        let mut slots = self.lock_slots()?;
        allocator::release(&mut slots, handle.slot)?;
        self.metrics.record_release();
        Ok(())
    }

    /// Runs one truncation pass over the active logs.
    pub fn truncate_active_logs(&self) -> LogMgrResult<usize> {
        let mut slots = self.lock_slots()?;
        let truncated = truncation::truncate_active(&mut slots)?;
        self.metrics.record_truncation(truncated);
        Ok(truncated)
    }

    /// Wakes the truncation service. Returns false when it is not running.
    pub fn request_truncation(&self) -> bool {
        match self.truncation.lock().as_ref() {
            Some(service) => {
                service.wake();
                true
            }
            None => false,
        }
    }

    /// State and persisted tag of every slot, in slot order.
    pub fn slot_states(&self) -> LogMgrResult<Vec<(SlotId, SlotState, SlotTag)>> {
        let slots = self.lock_slots()?;
        Ok(slots
            .iter()
            .map(|(slot, state, descriptor)| (slot, state, descriptor.tag()))
            .collect())
    }

    pub fn slot_counts(&self) -> LogMgrResult<SlotCounts> {
        Ok(self.lock_slots()?.counts())
    }

    pub fn registered_types(&self) -> Vec<LogTypeId> {
        self.registry.read().type_ids()
    }

    pub fn metrics(&self) -> LogManagerMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the truncation service, flushes active logs and releases the
    /// pool mapping. Later calls return `ShutDown`.
    pub fn shutdown(&self) -> LogMgrResult<()> {
        {
            let _slots = self.slots.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(LogMgrError::ShutDown);
            }
        }

        // Passes still queued on the slot lock see `closed` and stop.
        if let Some(service) = self.truncation.lock().take() {
            service.shutdown();
        }

        let mut slots = self.slots.lock();

        let mut first_err = None;
        for slot in slots.slots_in(SlotState::Active) {
            let descriptor = slots.descriptor_mut(slot);
            let Some(ops) = descriptor.ops().cloned() else {
                continue;
            };
            if let Err(err) = ops.flush(descriptor) {
                warn!(slot = slot.index(), error = %err, "log flush failed during shutdown");
                first_err.get_or_insert(err);
            }
        }

        let active = slots.count(SlotState::Active);
        slots.clear();
        drop(slots);

        if let Some(pool) = self.pool.lock().take() {
            if let Err(err) = pool.flush() {
                warn!(error = %err, "pool flush failed during shutdown");
                first_err.get_or_insert(err);
            }
        }

        info!(active, "log manager shut down");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if let Some(service) = self.truncation.get_mut().take() {
            service.shutdown();
        }
        if !self.is_shut_down() {
            debug!("log manager dropped without shutdown");
        }
    }
}

/// An allocated log slot.
///
/// The handle keeps the manager alive. Passing it to
/// [`LogManager::free_log`] consumes it.
pub struct LogHandle {
    manager: Arc<LogManager>,
    slot: SlotId,
    type_id: LogTypeId,
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle")
            .field("slot", &self.slot)
            .field("type_id", &self.type_id)
            .finish()
    }
}

impl LogHandle {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn type_id(&self) -> LogTypeId {
        self.type_id
    }

    pub fn manager(&self) -> &Arc<LogManager> {
        &self.manager
    }

    /// Runs `f` against the slot's descriptor under the slot lock.
    pub fn with_descriptor<R>(
        &self,
        f: impl FnOnce(&mut LogDescriptor) -> LogMgrResult<R>,
    ) -> LogMgrResult<R> {
        let mut slots = self.manager.lock_slots()?;
        if slots.state(self.slot) != Some(SlotState::Active) {
            return Err(LogMgrError::InvalidHandle(self.slot));
        }
        f(slots.descriptor_mut(self.slot))
    }
}

#[cfg(test)]
mod manager_tests {
    use super::*;
    use crate::pool::mapping::MemorySegmentMapper;
    use crate::test_support::SequenceLog;

    fn ty(raw: u64) -> LogTypeId {
        LogTypeId::new(raw).expect("valid type")
    }

    fn open_in_memory(
        mapper: &Arc<MemorySegmentMapper>,
        builtin: &[(u64, Arc<SequenceLog>)],
    ) -> Arc<LogManager> {
        let mut builder =
            LogManager::builder(LogManagerConfig::for_tests("/unused")).mapper(mapper.clone());
        for (raw, log) in builtin {
            builder = builder.builtin_type(ty(*raw), log.clone());
        }
        builder.open().expect("open manager")
    }

    #[test]
    fn fresh_pool_starts_with_every_slot_free() {
        let mapper = Arc::new(MemorySegmentMapper::new());
        let manager = open_in_memory(&mapper, &[]);
        let counts = manager.slot_counts().expect("counts");
        assert_eq!(counts.free, 32);
        assert_eq!(counts.total(), 32);
        assert_eq!(manager.metrics().recovery_passes, 1);
        assert!(!manager.request_truncation());
    }

    #[test]
    fn builtin_types_recover_before_open_returns() {
        let mapper = Arc::new(MemorySegmentMapper::new());
        let log = SequenceLog::new();
        {
            let manager = open_in_memory(&mapper, &[(3, log.clone())]);
            let handle = manager.allocate_log(ty(3)).expect("allocate");
            handle
                .with_descriptor(|descriptor| {
                    SequenceLog::write_entries(descriptor.region_mut(), &[4, 8])
                })
                .expect("write");
        }

        let restarted = SequenceLog::new();
        let manager = open_in_memory(&mapper, &[(3, restarted.clone())]);
        let orders: Vec<u64> = restarted.journal().iter().map(|(_, order)| *order).collect();
        assert_eq!(orders, vec![4, 8]);
        assert_eq!(manager.slot_counts().expect("counts").free, 32);
        assert_eq!(manager.metrics().slots_recovered, 1);
    }

    #[test]
    fn handle_is_invalid_after_free() {
        let mapper = Arc::new(MemorySegmentMapper::new());
        let manager = open_in_memory(&mapper, &[(2, SequenceLog::new())]);
        let handle = manager.allocate_log(ty(2)).expect("allocate");
        let slot = handle.slot();
        manager.free_log(handle).expect("free");
        assert_eq!(
            manager.slot_states().expect("states")[slot.index()],
            (slot, SlotState::Free, SlotTag::Typed(ty(2)))
        );
        assert_eq!(manager.metrics().releases, 1);
    }

    #[test]
    fn shutdown_is_idempotent_and_closes_operations() {
        let mapper = Arc::new(MemorySegmentMapper::new());
        let manager = open_in_memory(&mapper, &[(2, SequenceLog::new())]);
        let handle = manager.allocate_log(ty(2)).expect("allocate");

        manager.shutdown().expect("shutdown");
        assert!(manager.is_shut_down());
        assert!(matches!(manager.shutdown(), Err(LogMgrError::ShutDown)));
        assert!(matches!(
            manager.allocate_log(ty(2)),
            Err(LogMgrError::ShutDown)
        ));
        assert!(matches!(
            handle.with_descriptor(|_| Ok(())),
            Err(LogMgrError::ShutDown)
        ));
        assert!(matches!(manager.run_recovery(), Err(LogMgrError::ShutDown)));
        assert!(matches!(
            manager.register_log_type(ty(4), SequenceLog::new()),
            Err(LogMgrError::ShutDown)
        ));
    }

    #[test]
    fn concurrent_shutdown_succeeds_once() {
        let config = LogManagerConfig::for_tests("/unused").with_truncation(true);
        let manager = LogManager::builder(config)
            .mapper(Arc::new(MemorySegmentMapper::new()))
            .builtin_type(ty(2), SequenceLog::truncatable())
            .open()
            .expect("open");
        manager.allocate_log(ty(2)).expect("allocate");

        let barrier = Arc::new(std::sync::Barrier::new(4));
        let outcomes: Vec<LogMgrResult<()>> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    manager.shutdown()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|thread| thread.join().expect("shutdown thread"))
            .collect();

        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|outcome| matches!(outcome, Err(LogMgrError::ShutDown)))
                .count(),
            3
        );
        assert!(!manager.request_truncation());
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let first = open_in_memory(&Arc::new(MemorySegmentMapper::new()), &[(2, SequenceLog::new())]);
        let second = open_in_memory(&Arc::new(MemorySegmentMapper::new()), &[]);
        let handle = first.allocate_log(ty(2)).expect("allocate");
        assert!(matches!(
            second.free_log(handle),
            Err(LogMgrError::InvalidHandle(_))
        ));
        assert_eq!(first.slot_counts().expect("counts").active, 1);
    }
}
