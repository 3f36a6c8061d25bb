use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::LogMgrError;
use crate::recovery::RecoveryReport;
use crate::registry::Registration;

/// Point-in-time snapshot of log manager activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogManagerMetricsSnapshot {
    /// Log types added to the registry
    pub registrations: u64,
    /// Pending slots bound to a newly registered type
    pub pending_bound: u64,
    /// Successful allocations
    pub allocations: u64,
    /// Allocations refused for an unregistered type
    pub unknown_type_failures: u64,
    /// Allocations refused for lack of a usable free slot
    pub no_free_slot_failures: u64,
    /// Allocations that failed in a log type callback
    pub allocation_faults: u64,
    /// Slots returned to the free list by their owner
    pub releases: u64,
    /// Completed recovery passes
    pub recovery_passes: u64,
    /// Recovery steps replayed
    pub recovery_steps: u64,
    /// Slots moved from recovery to the free list
    pub slots_recovered: u64,
    /// Truncation passes run
    pub truncation_passes: u64,
    /// Logs truncated across all passes
    pub logs_truncated: u64,
}

/// Lock-free counters updated by the manager's operations.
#[derive(Debug, Default)]
pub struct LogManagerMetrics {
    registrations: AtomicU64,
    pending_bound: AtomicU64,
    allocations: AtomicU64,
    unknown_type_failures: AtomicU64,
    no_free_slot_failures: AtomicU64,
    allocation_faults: AtomicU64,
    releases: AtomicU64,
    recovery_passes: AtomicU64,
    recovery_steps: AtomicU64,
    slots_recovered: AtomicU64,
    truncation_passes: AtomicU64,
    logs_truncated: AtomicU64,
}

impl LogManagerMetrics {
    pub fn record_registration(&self, registration: Registration) {
        if let Registration::Inserted { bound } = registration {
            self.registrations.fetch_add(1, Ordering::Relaxed);
            self.pending_bound.fetch_add(bound as u64, Ordering::Relaxed);
        }
    }

    pub fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation_failure(&self, err: &LogMgrError) {
        let counter = match err {
            LogMgrError::UnknownType(_) => &self.unknown_type_failures,
            LogMgrError::NoFreeSlot(_) => &self.no_free_slot_failures,
            _ => &self.allocation_faults,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, report: &RecoveryReport) {
        self.recovery_passes.fetch_add(1, Ordering::Relaxed);
        self.recovery_steps.fetch_add(report.steps, Ordering::Relaxed);
        self.slots_recovered.fetch_add(report.recovered as u64, Ordering::Relaxed);
    }

    pub fn record_truncation(&self, truncated: usize) {
        self.truncation_passes.fetch_add(1, Ordering::Relaxed);
        self.logs_truncated.fetch_add(truncated as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LogManagerMetricsSnapshot {
        LogManagerMetricsSnapshot {
            registrations: self.registrations.load(Ordering::Relaxed),
            pending_bound: self.pending_bound.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            unknown_type_failures: self.unknown_type_failures.load(Ordering::Relaxed),
            no_free_slot_failures: self.no_free_slot_failures.load(Ordering::Relaxed),
            allocation_faults: self.allocation_faults.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            recovery_passes: self.recovery_passes.load(Ordering::Relaxed),
            recovery_steps: self.recovery_steps.load(Ordering::Relaxed),
            slots_recovered: self.slots_recovered.load(Ordering::Relaxed),
            truncation_passes: self.truncation_passes.load(Ordering::Relaxed),
            logs_truncated: self.logs_truncated.load(Ordering::Relaxed),
        }
    }
}
