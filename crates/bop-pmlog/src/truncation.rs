//! Background truncation of active logs.
//!
//! The service owns a small Tokio runtime and wakes on an interval tick or an
//! explicit request. Each pass runs on the blocking pool because truncation
//! callbacks hold the manager's slot lock.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TruncationConfig;
use crate::descriptor::{SlotState, SlotTable};
use crate::error::{LogMgrError, LogMgrResult};
use crate::manager::LogManager;

/// Calls `truncate` on every active slot whose type supports it.
///
/// Returns how many logs were truncated. A failing log does not stop the
/// pass; the first failure is reported once every slot has been visited.
pub(crate) fn truncate_active(slots: &mut SlotTable) -> LogMgrResult<usize> {
    let mut truncated = 0;
    let mut first_err = None;
    for slot in slots.slots_in(SlotState::Active) {
        let descriptor = slots.descriptor_mut(slot);
        let Some(ops) = descriptor.ops().cloned() else {
            continue;
        };
        let Some(truncation) = ops.truncation() else {
            continue;
        };
        match truncation.truncate(descriptor) {
            Ok(()) => truncated += 1,
            Err(err) => {
                warn!(slot = slot.index(), error = %err, "log truncation failed");
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(truncated),
    }
}

pub(crate) struct TruncationService {
    runtime: Mutex<Option<Runtime>>,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl TruncationService {
    pub(crate) fn start(manager: Weak<LogManager>, config: TruncationConfig) -> LogMgrResult<Self> {
        let mut builder = Builder::new_multi_thread();
        builder
            .enable_all()
            .thread_name("pmlog-truncate")
            .worker_threads(config.worker_threads.unwrap_or(1).max(1));
        let runtime = builder.build().map_err(LogMgrError::from)?;

        let shutdown = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let task = runtime.spawn(run_truncation_service(
            manager,
            wake.clone(),
            shutdown.clone(),
            interval,
        ));
        debug!(interval_ms = config.interval_ms, "truncation service started");

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            shutdown,
            wake,
            task: Mutex::new(Some(task)),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        })
    }

    /// Requests a truncation pass without waiting for the next tick.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let mut guard = self.runtime.lock();
        if let Some(runtime) = guard.take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.shutdown_timeout);
            }
            debug!("truncation service stopped");
        }
    }
}

impl Drop for TruncationService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_truncation_service(
    manager: Weak<LogManager>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {},
            _ = tokio::time::sleep(interval) => {},
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };
        let outcome = tokio::task::spawn_blocking(move || manager.truncate_active_logs()).await;
        match outcome {
            Ok(Ok(truncated)) => {
                if truncated > 0 {
                    trace!(truncated, "truncation pass complete");
                }
            }
            Ok(Err(LogMgrError::ShutDown)) => break,
            Ok(Err(err)) => warn!(error = %err, "truncation pass failed"),
            Err(err) => warn!(error = %err, "truncation pass did not complete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::allocate;
    use crate::config::LogManagerConfig;
    use crate::ops::LogTypeId;
    use crate::pool::PersistentPool;
    use crate::pool::mapping::MemorySegmentMapper;
    use crate::registry::{TypeRegistry, register_type};
    use crate::test_support::SequenceLog;

    #[test]
    fn only_truncatable_active_logs_are_visited() {
        let cfg = LogManagerConfig::for_tests("/unused").pool;
        let mapper = MemorySegmentMapper::new();
        let pool = PersistentPool::ensure_pool_mapped(&cfg, &mapper).expect("map");
        let mut slots = pool.create_descriptors().expect("descriptors");
        let mut registry = TypeRegistry::new();
        let truncatable = SequenceLog::truncatable();
        let plain = SequenceLog::new();
        let t1 = LogTypeId::new(1).expect("valid");
        let t2 = LogTypeId::new(2).expect("valid");
        register_type(&mut registry, &mut slots, t1, truncatable.clone()).expect("register");
        register_type(&mut registry, &mut slots, t2, plain.clone()).expect("register");

        allocate(&registry, &mut slots, t1).expect("allocate t1");
        allocate(&registry, &mut slots, t1).expect("allocate t1");
        allocate(&registry, &mut slots, t2).expect("allocate t2");

        assert_eq!(truncate_active(&mut slots).expect("truncate"), 2);
        assert_eq!(truncatable.truncate_calls(), 2);
        assert_eq!(plain.truncate_calls(), 0);
    }
}
