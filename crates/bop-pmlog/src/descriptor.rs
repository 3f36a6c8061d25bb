//! Volatile log descriptors and the slot table that tracks their state.

use std::any::Any;
use std::fmt::{self, Display};
use std::ops::Range;
use std::sync::Arc;

use crate::error::{LogMgrError, LogMgrResult};
use crate::ops::{LogOps, SlotTag};
use crate::pool::mapping::{PoolMapping, PoolWord};

/// Index of a slot within the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl SlotId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Log-assigned sequence number used to interleave recovery across slots.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryOrder(Option<u64>);

impl RecoveryOrder {
    /// No recovery step is pending for the slot.
    pub const NONE: RecoveryOrder = RecoveryOrder(None);

    #[inline]
    pub const fn at(order: u64) -> Self {
        Self(Some(order))
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0.is_none()
    }

    #[inline]
    pub const fn value(self) -> Option<u64> {
        self.0
    }
}

/// Exclusive handle on a slot's `generic_flags` word.
#[derive(Debug)]
pub struct SlotMetadata {
    flags: PoolWord,
}

impl SlotMetadata {
    pub(crate) fn new(mapping: Arc<PoolMapping>, flags_offset: usize) -> LogMgrResult<Self> {
        Ok(Self {
            flags: PoolWord::new(mapping, flags_offset)?,
        })
    }

    pub fn generic_flags(&self) -> u64 {
        self.flags.load()
    }

    pub fn tag(&self) -> SlotTag {
        SlotTag::from_flags(self.generic_flags())
    }

    /// Persists `tag` into the low bits of `generic_flags` with a store-with-barrier.
    pub fn persist_tag(&self, tag: SlotTag) -> LogMgrResult<()> {
        let flags = tag.apply(self.generic_flags());
        self.flags.persist(flags)
    }
}

/// Exclusive view of a slot's physical log bytes.
///
/// Each slot owns exactly one region and regions never overlap, so the
/// borrow rules on `SlotRegion` carry over to the pool bytes.
#[derive(Debug)]
pub struct SlotRegion {
    mapping: Arc<PoolMapping>,
    range: Range<usize>,
}

impl SlotRegion {
    pub(crate) fn new(mapping: Arc<PoolMapping>, range: Range<usize>) -> Self {
        Self { mapping, range }
    }

    /// Offset of the region from the pool base.
    pub fn pool_offset(&self) -> usize {
        self.range.start
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is exclusively owned by this value; the shared
        // borrow of `self` rules out a live mutable slice.
        unsafe { self.mapping.slice(self.range.clone()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, with `&mut self` guaranteeing uniqueness.
        unsafe { self.mapping.slice_mut(self.range.clone()) }
    }

    fn word_range(&self, at: usize) -> LogMgrResult<Range<usize>> {
        if at % 8 != 0 || at + 8 > self.len() {
            return Err(LogMgrError::invariant(format!(
                "word at {at} outside physical log of {} bytes",
                self.len()
            )));
        }
        Ok(at..at + 8)
    }

    pub fn read_u64(&self, at: usize) -> LogMgrResult<u64> {
        let range = self.word_range(at)?;
        self.mapping.load_u64(self.range.start + range.start)
    }

    /// Durably stores a word inside the region with a store-with-barrier.
    pub fn persist_u64(&mut self, at: usize, value: u64) -> LogMgrResult<()> {
        let range = self.word_range(at)?;
        self.mapping
            .persist_u64(self.range.start + range.start, value)
    }

    /// Flushes the whole region to the backing media.
    pub fn flush(&self) -> LogMgrResult<()> {
        self.mapping.flush_range(self.range.clone())
    }
}

/// Volatile runtime handle to one pool slot.
pub struct LogDescriptor {
    slot: SlotId,
    metadata: SlotMetadata,
    region: SlotRegion,
    log: Option<Box<dyn Any + Send + Sync>>,
    ops: Option<Arc<dyn LogOps>>,
    order: RecoveryOrder,
}

impl fmt::Debug for LogDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogDescriptor")
            .field("slot", &self.slot)
            .field("tag", &self.tag())
            .field("ops", &self.ops.as_ref().map(|ops| ops.name()))
            .field("has_log", &self.log.is_some())
            .field("order", &self.order)
            .finish()
    }
}

impl LogDescriptor {
    pub(crate) fn new(slot: SlotId, metadata: SlotMetadata, region: SlotRegion) -> Self {
        Self {
            slot,
            metadata,
            region,
            log: None,
            ops: None,
            order: RecoveryOrder::NONE,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn metadata(&self) -> &SlotMetadata {
        &self.metadata
    }

    /// Persisted type tag of the slot.
    pub fn tag(&self) -> SlotTag {
        self.metadata.tag()
    }

    pub fn region(&self) -> &SlotRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut SlotRegion {
        &mut self.region
    }

    pub fn ops(&self) -> Option<&Arc<dyn LogOps>> {
        self.ops.as_ref()
    }

    pub fn order(&self) -> RecoveryOrder {
        self.order
    }

    pub fn set_order(&mut self, order: RecoveryOrder) {
        self.order = order;
    }

    pub fn has_log(&self) -> bool {
        self.log.is_some()
    }

    /// Installs the volatile log object, replacing any previous one.
    pub fn set_log<T>(&mut self, log: T)
    where
        T: Any + Send + Sync,
    {
        self.log = Some(Box::new(log));
    }

    pub fn take_log(&mut self) -> Option<Box<dyn Any + Send + Sync>> {
        self.log.take()
    }

    pub fn log<T: Any>(&self) -> Option<&T> {
        self.log.as_ref().and_then(|log| log.downcast_ref())
    }

    pub fn log_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.log.as_mut().and_then(|log| log.downcast_mut())
    }

    /// Borrows the volatile log object and the physical region together.
    pub fn log_and_region_mut<T: Any>(&mut self) -> Option<(&mut T, &mut SlotRegion)> {
        let log = self.log.as_mut()?.downcast_mut()?;
        Some((log, &mut self.region))
    }

    pub(crate) fn bind_ops(&mut self, ops: Arc<dyn LogOps>) {
        self.ops = Some(ops);
    }

    /// Drops the operations table and volatile log object.
    pub(crate) fn clear_binding(&mut self) {
        self.ops = None;
        self.log = None;
        self.order = RecoveryOrder::NONE;
    }
}

/// Which list a slot belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Reusable, possibly still tagged with its previous type.
    Free,
    /// Handed out to a client.
    Active,
    /// Holds persisted data awaiting recovery or its type's registration.
    Pending,
    /// Collected by an in-flight recovery pass.
    Recovering,
}

impl SlotState {
    pub const ALL: [SlotState; 4] = [
        SlotState::Free,
        SlotState::Active,
        SlotState::Pending,
        SlotState::Recovering,
    ];
}

impl Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Free => write!(f, "free"),
            SlotState::Active => write!(f, "active"),
            SlotState::Pending => write!(f, "pending"),
            SlotState::Recovering => write!(f, "recovering"),
        }
    }
}

/// Number of slots in each state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounts {
    pub free: usize,
    pub active: usize,
    pub pending: usize,
    pub recovering: usize,
}

impl SlotCounts {
    pub fn total(&self) -> usize {
        self.free + self.active + self.pending + self.recovering
    }

    pub fn get(&self, state: SlotState) -> usize {
        match state {
            SlotState::Free => self.free,
            SlotState::Active => self.active,
            SlotState::Pending => self.pending,
            SlotState::Recovering => self.recovering,
        }
    }
}

struct SlotEntry {
    descriptor: LogDescriptor,
    state: SlotState,
    /// Position within its list; moving a slot appends it to the tail.
    position: u64,
}

/// Arena of descriptors in which list membership is a per-slot state.
///
/// A slot is always in exactly one list; [`SlotTable::transition`] is the only
/// way to change which one. Iteration within a list follows the order slots
/// were appended to it.
pub struct SlotTable {
    entries: Vec<SlotEntry>,
    next_position: u64,
}

impl SlotTable {
    pub(crate) fn with_capacity(slots: usize) -> LogMgrResult<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(slots)
            .map_err(|_| LogMgrError::OutOfMemory)?;
        Ok(Self {
            entries,
            next_position: 0,
        })
    }

    pub(crate) fn push(&mut self, descriptor: LogDescriptor, state: SlotState) -> SlotId {
        let slot = SlotId(self.entries.len());
        debug_assert_eq!(descriptor.slot(), slot);
        let position = self.bump_position();
        self.entries.push(SlotEntry {
            descriptor,
            state,
            position,
        });
        slot
    }

    fn bump_position(&mut self) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        position
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        self.entries.get(slot.0).map(|entry| entry.state)
    }

    pub fn get(&self, slot: SlotId) -> Option<&LogDescriptor> {
        self.entries.get(slot.0).map(|entry| &entry.descriptor)
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut LogDescriptor> {
        self.entries.get_mut(slot.0).map(|entry| &mut entry.descriptor)
    }

    /// Panics on an out-of-range slot; callers pass ids taken from this table.
    pub(crate) fn descriptor(&self, slot: SlotId) -> &LogDescriptor {
        &self.entries[slot.0].descriptor
    }

    pub(crate) fn descriptor_mut(&mut self, slot: SlotId) -> &mut LogDescriptor {
        &mut self.entries[slot.0].descriptor
    }

    /// Moves `slot` to the tail of the `to` list.
    pub(crate) fn transition(&mut self, slot: SlotId, to: SlotState) {
        let position = self.bump_position();
        let entry = &mut self.entries[slot.0];
        entry.state = to;
        entry.position = position;
    }

    /// Slots currently in `state`, in list order.
    pub fn slots_in(&self, state: SlotState) -> Vec<SlotId> {
        let mut slots: Vec<(u64, SlotId)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state == state)
            .map(|(idx, entry)| (entry.position, SlotId(idx)))
            .collect();
        slots.sort_unstable_by_key(|(position, _)| *position);
        slots.into_iter().map(|(_, slot)| slot).collect()
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == state)
            .count()
    }

    pub fn counts(&self) -> SlotCounts {
        let mut counts = SlotCounts::default();
        for entry in &self.entries {
            match entry.state {
                SlotState::Free => counts.free += 1,
                SlotState::Active => counts.active += 1,
                SlotState::Pending => counts.pending += 1,
                SlotState::Recovering => counts.recovering += 1,
            }
        }
        counts
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, SlotState, &LogDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (SlotId(idx), entry.state, &entry.descriptor))
    }

    /// Drops every descriptor, releasing their references into the pool.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_over(mapping: &Arc<PoolMapping>, slots: usize) -> SlotTable {
        let mut table = SlotTable::with_capacity(slots).expect("reserve");
        for idx in 0..slots {
            let descriptor = LogDescriptor::new(
                SlotId(idx),
                SlotMetadata::new(mapping.clone(), idx * 64).expect("flags word"),
                SlotRegion::new(mapping.clone(), 4096 + idx * 4096..4096 + (idx + 1) * 4096),
            );
            table.push(descriptor, SlotState::Free);
        }
        table
    }

    #[test]
    fn transitions_keep_slots_in_one_list() {
        let mapping = Arc::new(PoolMapping::anonymous(0, 8 * 4096).expect("map"));
        let mut table = table_over(&mapping, 4);
        table.transition(SlotId(1), SlotState::Active);
        table.transition(SlotId(2), SlotState::Pending);
        table.transition(SlotId(2), SlotState::Recovering);

        let counts = table.counts();
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.free, 2);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.recovering, 1);
        for state in SlotState::ALL {
            assert_eq!(table.count(state), counts.get(state));
        }
    }

    #[test]
    fn transition_appends_to_list_tail() {
        let mapping = Arc::new(PoolMapping::anonymous(0, 8 * 4096).expect("map"));
        let mut table = table_over(&mapping, 4);
        table.transition(SlotId(0), SlotState::Active);
        table.transition(SlotId(0), SlotState::Free);
        assert_eq!(
            table.slots_in(SlotState::Free),
            vec![SlotId(1), SlotId(2), SlotId(3), SlotId(0)]
        );
    }

    #[test]
    fn regions_are_disjoint_views() {
        let mapping = Arc::new(PoolMapping::anonymous(0, 8 * 4096).expect("map"));
        let mut table = table_over(&mapping, 2);
        table
            .descriptor_mut(SlotId(0))
            .region_mut()
            .as_mut_slice()
            .fill(0xAA);
        assert!(
            table
                .descriptor(SlotId(1))
                .region()
                .as_slice()
                .iter()
                .all(|b| *b == 0)
        );
        let region = table.descriptor_mut(SlotId(1)).region_mut();
        region.persist_u64(8, 77).expect("persist");
        assert_eq!(region.read_u64(8).expect("read"), 77);
        assert!(region.read_u64(4093).is_err());
    }

    #[test]
    fn metadata_tag_round_trips_through_pool() {
        let mapping = Arc::new(PoolMapping::anonymous(0, 4096).expect("map"));
        let metadata = SlotMetadata::new(mapping.clone(), 128).expect("flags word");
        mapping.persist_u64(128, 0xF000).expect("seed flags");
        let ty = crate::ops::LogTypeId::new(4).expect("valid");
        metadata.persist_tag(SlotTag::Typed(ty)).expect("persist");
        assert_eq!(metadata.tag(), SlotTag::Typed(ty));
        assert_eq!(metadata.generic_flags(), 0xF004);
    }

    #[test]
    fn typed_log_access() {
        let mapping = Arc::new(PoolMapping::anonymous(0, 8 * 4096).expect("map"));
        let mut table = table_over(&mapping, 1);
        let descriptor = table.descriptor_mut(SlotId(0));
        assert!(descriptor.log::<u32>().is_none());
        descriptor.set_log(5u32);
        *descriptor.log_mut::<u32>().expect("u32 log") += 1;
        assert_eq!(descriptor.log::<u32>(), Some(&6));
        assert!(descriptor.log::<String>().is_none());
        let (log, region) = descriptor.log_and_region_mut::<u32>().expect("split");
        *log = region.len() as u32;
        assert_eq!(descriptor.log::<u32>(), Some(&4096));
    }
}
