use std::collections::HashSet;
use std::sync::Arc;

use bop_pmlog::test_support::SequenceLog;
use bop_pmlog::{
    FileSegmentMapper, LogManager, LogManagerConfig, LogMgrError, LogTypeId, MemorySegmentMapper,
    Registration, SegmentMapper, SlotId, SlotState, SlotTag,
};
use tempfile::TempDir;

fn ty(raw: u64) -> LogTypeId {
    LogTypeId::new(raw).expect("valid type")
}

fn open(mapper: &Arc<MemorySegmentMapper>, builtin: &[(u64, Arc<SequenceLog>)]) -> Arc<LogManager> {
    let mut builder =
        LogManager::builder(LogManagerConfig::for_tests("/unused")).mapper(mapper.clone());
    for (raw, log) in builtin {
        builder = builder.builtin_type(ty(*raw), log.clone());
    }
    builder.open().expect("open manager")
}

/// Leaves `entries` in freshly allocated slots of `type_id` and drops the
/// manager without recovering them, as a crash would.
fn seed_pending(mapper: &Arc<MemorySegmentMapper>, type_id: u64, entries: &[&[u64]]) -> Vec<SlotId> {
    let manager = open(mapper, &[(type_id, SequenceLog::new())]);
    let mut slots = Vec::new();
    for orders in entries {
        let handle = manager.allocate_log(ty(type_id)).expect("allocate");
        handle
            .with_descriptor(|descriptor| SequenceLog::write_entries(descriptor.region_mut(), orders))
            .expect("write entries");
        slots.push(handle.slot());
    }
    slots
}

fn assert_partition(manager: &LogManager) {
    let states = manager.slot_states().expect("states");
    let slot_count = manager.config().pool.slot_count;
    assert_eq!(states.len(), slot_count);
    let unique: HashSet<SlotId> = states.iter().map(|(slot, _, _)| *slot).collect();
    assert_eq!(unique.len(), slot_count);
    assert_eq!(manager.slot_counts().expect("counts").total(), slot_count);
}

#[test]
fn slots_stay_partitioned_across_operations() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    seed_pending(&mapper, 4, &[&[1, 3], &[2]]);

    let manager = open(&mapper, &[]);
    assert_partition(&manager);
    assert_eq!(manager.slot_counts().expect("counts").pending, 2);

    manager
        .register_log_type(ty(2), SequenceLog::new())
        .expect("register 2");
    let handles: Vec<_> = (0..5)
        .map(|_| manager.allocate_log(ty(2)).expect("allocate"))
        .collect();
    assert_partition(&manager);

    manager
        .register_log_type(ty(4), SequenceLog::new())
        .expect("register 4");
    manager.run_recovery().expect("recover");
    assert_partition(&manager);

    for handle in handles.into_iter().take(3) {
        manager.free_log(handle).expect("free");
    }
    assert_partition(&manager);
    let counts = manager.slot_counts().expect("counts");
    assert_eq!(counts.active, 2);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.recovering, 0);
}

#[test]
fn recovery_interleaves_logs_by_order_after_restart() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    let slots = seed_pending(&mapper, 6, &[&[1, 4, 7], &[2, 5], &[3, 6, 8]]);

    let log = SequenceLog::new();
    let manager = open(&mapper, &[(6, log.clone())]);
    let journal = log.journal();
    let orders: Vec<u64> = journal.iter().map(|(_, order)| *order).collect();
    assert_eq!(orders, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    let owners: Vec<SlotId> = journal.iter().map(|(slot, _)| *slot).collect();
    assert_eq!(
        owners,
        vec![slots[0], slots[1], slots[2], slots[0], slots[1], slots[2], slots[0], slots[2]]
    );

    let counts = manager.slot_counts().expect("counts");
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.free, 32);
    for slot in &slots {
        let (_, state, tag) = manager.slot_states().expect("states")[slot.index()];
        assert_eq!(state, SlotState::Free);
        assert_eq!(tag, SlotTag::Typed(ty(6)));
    }
}

#[test]
fn reregistration_leaves_one_entry_and_does_not_rebind() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    seed_pending(&mapper, 3, &[&[5]]);
    let manager = open(&mapper, &[]);

    let log = SequenceLog::new();
    let first = manager
        .register_log_type(ty(3), log.clone())
        .expect("register");
    assert_eq!(first, Registration::Inserted { bound: 1 });
    let second = manager
        .register_log_type(ty(3), log.clone())
        .expect("register again");
    assert_eq!(second, Registration::AlreadyRegistered);

    assert_eq!(manager.registered_types(), vec![ty(3)]);
    assert_eq!(log.alloc_calls(), 1);
    assert_eq!(manager.metrics().registrations, 1);
}

#[test]
fn tagged_free_slot_is_reused_without_alloc() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    let seeded = seed_pending(&mapper, 5, &[&[]]);

    let log = SequenceLog::new();
    let manager = open(&mapper, &[(5, log.clone())]);
    assert_eq!(log.alloc_calls(), 1);

    let handle = manager.allocate_log(ty(5)).expect("allocate");
    assert_eq!(handle.slot(), seeded[0]);
    assert_eq!(log.alloc_calls(), 1);
    assert_eq!(log.init_calls(), 1);
}

#[test]
fn unregistered_type_leaves_free_slot_free() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    let manager = open(&mapper, &[]);
    let before = manager.slot_states().expect("states");

    let err = manager.allocate_log(ty(9)).expect_err("unknown type");
    assert!(matches!(err, LogMgrError::UnknownType(id) if id == ty(9)));
    assert!(!err.is_fatal());
    assert_eq!(manager.slot_states().expect("states"), before);
    assert_eq!(manager.metrics().unknown_type_failures, 1);
}

#[test]
fn exhausting_the_pool_reports_no_free_slot() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    let manager = open(&mapper, &[(2, SequenceLog::new())]);
    let handles: Vec<_> = (0..32)
        .map(|_| manager.allocate_log(ty(2)).expect("allocate"))
        .collect();

    let err = manager.allocate_log(ty(2)).expect_err("pool exhausted");
    assert!(matches!(err, LogMgrError::NoFreeSlot(_)));
    assert_eq!(manager.slot_counts().expect("counts").active, 32);
    assert_eq!(manager.metrics().no_free_slot_failures, 1);
    drop(handles);
}

#[test]
fn pending_slot_of_unknown_type_survives_recovery() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    let seeded = seed_pending(&mapper, 7, &[&[1, 2]]);
    let manager = open(&mapper, &[(2, SequenceLog::new())]);

    for _ in 0..2 {
        let report = manager.run_recovery().expect("recover");
        assert_eq!(report.pending, 1);
        assert_eq!(report.recovered, 0);
    }
    let (_, state, tag) = manager.slot_states().expect("states")[seeded[0].index()];
    assert_eq!(state, SlotState::Pending);
    assert_eq!(tag, SlotTag::Typed(ty(7)));
}

#[test]
fn late_registration_unblocks_recovery() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    let seeded = seed_pending(&mapper, 7, &[&[10, 20]]);
    let manager = open(&mapper, &[]);
    assert_eq!(manager.slot_counts().expect("counts").pending, 1);

    let log = SequenceLog::new();
    manager.register_log_type(ty(7), log.clone()).expect("register");
    let report = manager.run_recovery().expect("recover");
    assert_eq!(report.collected, 1);
    assert_eq!(report.steps, 2);
    assert_eq!(log.journal(), vec![(seeded[0], 10), (seeded[0], 20)]);
    assert_eq!(manager.slot_counts().expect("counts").pending, 0);
}

#[test]
fn file_backed_pool_survives_reopen() {
    let temp = TempDir::new().expect("tempdir");
    let config = LogManagerConfig::for_tests(temp.path().join("pool"));
    let slot = {
        let manager = LogManager::builder(config.clone())
            .builtin_type(ty(4), SequenceLog::new())
            .open()
            .expect("open");
        let handle = manager.allocate_log(ty(4)).expect("allocate");
        handle
            .with_descriptor(|descriptor| SequenceLog::write_entries(descriptor.region_mut(), &[3, 9]))
            .expect("write");
        let slot = handle.slot();
        drop(handle);
        manager.shutdown().expect("shutdown");
        slot
    };
    assert!(config.pool.segment_path().exists());

    let mapper = Arc::new(FileSegmentMapper::new(config.pool.root_dir.clone()));
    let log = SequenceLog::new();
    let manager = LogManager::builder(config)
        .mapper(mapper.clone())
        .builtin_type(ty(4), log.clone())
        .open()
        .expect("reopen");
    assert_eq!(mapper.mappings_established(), 1);
    assert_eq!(log.journal(), vec![(slot, 3), (slot, 9)]);
    assert_eq!(manager.metrics().slots_recovered, 1);
}

#[test]
fn torn_anchor_and_segment_files_are_recreated_at_bring_up() {
    let temp = TempDir::new().expect("tempdir");
    let config = LogManagerConfig::for_tests(temp.path());
    std::fs::File::create(temp.path().join("log_pool.anchor")).expect("empty anchor");
    std::fs::File::create(config.pool.segment_path()).expect("empty segment");

    let manager = LogManager::open(config.clone()).expect("open over torn files");
    assert_eq!(manager.slot_counts().expect("counts").free, 32);
    manager.shutdown().expect("shutdown");

    let mapper = FileSegmentMapper::new(config.pool.root_dir.clone());
    assert_eq!(mapper.anchor().expect("anchor"), config.pool.base_address);
    assert_eq!(
        std::fs::metadata(config.pool.segment_path())
            .expect("metadata")
            .len(),
        config.pool.pool_size
    );
}

#[test]
fn anchored_pool_with_other_base_is_rejected() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    drop(open(&mapper, &[]));

    let mut config = LogManagerConfig::for_tests("/unused");
    config.pool.base_address += 0x1000_0000;
    let err = LogManager::builder(config)
        .mapper(mapper.clone())
        .open()
        .expect_err("base mismatch");
    assert!(matches!(err, LogMgrError::Mapping(_)));
    assert!(err.is_fatal());
}

#[test]
fn shutdown_flushes_and_closes() {
    let mapper = Arc::new(MemorySegmentMapper::new());
    let manager = open(&mapper, &[(2, SequenceLog::new())]);
    let _handle = manager.allocate_log(ty(2)).expect("allocate");

    manager.shutdown().expect("shutdown");
    assert!(matches!(manager.slot_counts(), Err(LogMgrError::ShutDown)));
    assert!(matches!(manager.shutdown(), Err(LogMgrError::ShutDown)));

    // The tag persisted before shutdown brings the slot back as pending.
    let reopened = open(&mapper, &[]);
    assert_eq!(reopened.slot_counts().expect("counts").pending, 1);
}
