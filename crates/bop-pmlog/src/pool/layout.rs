//! Bit-exact layout of the log pool.
//!
//! ```text
//! base ─┬─ metadata section: slot_count x LogMetadata, page aligned
//!       └─ physical-log section: slot_count x page_align(physical_log_size)
//! ```

use std::ops::Range;

use crate::config::PoolConfig;
use crate::error::{LogMgrError, LogMgrResult};

/// Low bits of `generic_flags` carrying the slot's type tag.
pub const LOG_TYPE_MASK: u64 = 0x0000_0000_0000_00FF;

/// Tag of a slot not in use by any type.
pub const LOG_TYPE_FREE: u64 = 0;

/// Largest valid type id.
pub const MAX_LOG_TYPE: u64 = LOG_TYPE_MASK;

pub const METADATA_RECORD_SIZE: usize = 64;

/// Non-volatile per-slot metadata record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LogMetadata {
    pub generic_flags: u64,
    pub reserved: [u64; 7],
}

const _: () = {
    assert!(core::mem::size_of::<LogMetadata>() == METADATA_RECORD_SIZE);
};

/// Offset of `generic_flags` within a metadata record.
pub const GENERIC_FLAGS_OFFSET: usize = core::mem::offset_of!(LogMetadata, generic_flags);

/// Rounds `value` up to a multiple of `page_size`, a power of two.
/// `None` when the result does not fit in a u64.
#[inline]
pub const fn page_align(value: u64, page_size: u64) -> Option<u64> {
    match value.checked_add(page_size - 1) {
        Some(padded) => Some(padded & !(page_size - 1)),
        None => None,
    }
}

/// Offsets of every metadata record and physical log relative to the pool base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    slot_count: usize,
    metadata_section_size: u64,
    physical_log_size: u64,
    pool_size: u64,
}

impl PoolLayout {
    /// Computes the layout for `config`, failing if it exceeds the pool capacity.
    pub fn new(config: &PoolConfig) -> LogMgrResult<Self> {
        if config.slot_count == 0 {
            return Err(LogMgrError::invalid_config("slot_count must be non-zero"));
        }
        if config.page_size == 0 || !config.page_size.is_power_of_two() {
            return Err(LogMgrError::invalid_config(format!(
                "page_size {} is not a power of two",
                config.page_size
            )));
        }
        if config.physical_log_size == 0 {
            return Err(LogMgrError::invalid_config(
                "physical_log_size must be non-zero",
            ));
        }
        let overflow = || LogMgrError::invalid_config("pool layout overflows u64");
        let slots = u64::try_from(config.slot_count).map_err(|_| overflow())?;
        let metadata_section_size = slots
            .checked_mul(METADATA_RECORD_SIZE as u64)
            .and_then(|bytes| page_align(bytes, config.page_size))
            .ok_or_else(overflow)?;
        let physical_log_size =
            page_align(config.physical_log_size, config.page_size).ok_or_else(overflow)?;
        let required = slots
            .checked_mul(physical_log_size)
            .and_then(|logs| logs.checked_add(metadata_section_size))
            .ok_or_else(overflow)?;
        if required > config.pool_size {
            return Err(LogMgrError::invalid_config(format!(
                "{} slots need {required} bytes but the pool holds {}",
                config.slot_count, config.pool_size
            )));
        }
        Ok(Self {
            slot_count: config.slot_count,
            metadata_section_size,
            physical_log_size,
            pool_size: config.pool_size,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    pub fn metadata_section_size(&self) -> u64 {
        self.metadata_section_size
    }

    /// Page-aligned size of each physical log.
    pub fn physical_log_size(&self) -> u64 {
        self.physical_log_size
    }

    /// Offset of the metadata record for `slot`.
    pub fn metadata_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < self.slot_count);
        slot * METADATA_RECORD_SIZE
    }

    /// Offset of `generic_flags` for `slot`.
    pub fn flags_offset(&self, slot: usize) -> usize {
        self.metadata_offset(slot) + GENERIC_FLAGS_OFFSET
    }

    /// Byte range of the physical log for `slot`.
    pub fn physical_log_range(&self, slot: usize) -> Range<usize> {
        debug_assert!(slot < self.slot_count);
        let start = self.metadata_section_size + slot as u64 * self.physical_log_size;
        start as usize..(start + self.physical_log_size) as usize
    }
}
