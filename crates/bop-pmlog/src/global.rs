//! Process-wide log manager.
//!
//! The first successful [`init_manager`] brings up the pool and publishes the
//! manager; every later call returns the same instance. Bring-up is serialized
//! by a mutex and the published handle is read without locking.

use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, const_mutex};
use tracing::debug;

use crate::config::LogManagerConfig;
use crate::error::LogMgrResult;
use crate::manager::{LogHandle, LogManager, LogManagerBuilder};
use crate::ops::{LogOps, LogTypeId};
use crate::recovery::RecoveryReport;
use crate::registry::Registration;

static BRINGUP: Mutex<()> = const_mutex(());
static MANAGER: OnceLock<Arc<LogManager>> = OnceLock::new();

/// Brings up the process-wide manager from `builder` unless one is already
/// published, in which case `builder` is dropped unused.
pub fn init_manager(builder: LogManagerBuilder) -> LogMgrResult<Arc<LogManager>> {
    if let Some(manager) = MANAGER.get() {
        return Ok(manager.clone());
    }
    let _bringup = BRINGUP.lock();
    if let Some(manager) = MANAGER.get() {
        return Ok(manager.clone());
    }
    let manager = builder.open()?;
    let published = MANAGER.get_or_init(|| manager);
    debug!("process-wide log manager published");
    Ok(published.clone())
}

/// Brings up the process-wide manager with the default configuration.
pub fn init_default_manager() -> LogMgrResult<Arc<LogManager>> {
    init_manager(LogManagerBuilder::new(LogManagerConfig::default()))
}

/// The published manager, if bring-up has completed.
pub fn manager() -> Option<Arc<LogManager>> {
    MANAGER.get().cloned()
}

fn manager_or_init() -> LogMgrResult<Arc<LogManager>> {
    match MANAGER.get() {
        Some(manager) => Ok(manager.clone()),
        None => init_default_manager(),
    }
}

/// Registers `ops` with the process-wide manager, bringing it up first if needed.
pub fn register_log_type(type_id: LogTypeId, ops: Arc<dyn LogOps>) -> LogMgrResult<Registration> {
    manager_or_init()?.register_log_type(type_id, ops)
}

/// Runs a recovery pass on the process-wide manager.
pub fn run_recovery() -> LogMgrResult<RecoveryReport> {
    manager_or_init()?.run_recovery()
}

/// Allocates a log from the process-wide manager, bringing it up first if needed.
pub fn allocate_log(type_id: LogTypeId) -> LogMgrResult<LogHandle> {
    manager_or_init()?.allocate_log(type_id)
}
