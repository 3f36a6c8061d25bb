//! Persistent log pool bring-up.
//!
//! The pool is one segment holding a metadata record and a page-aligned
//! physical log per slot (see [`layout`]). Bring-up maps the segment, creating
//! it when needed, and publishes its base through the anchor word so a later
//! initializer sees either no pool or a complete one.

pub mod layout;
pub mod mapping;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::descriptor::{LogDescriptor, SlotId, SlotMetadata, SlotRegion, SlotState, SlotTable};
use crate::error::{LogMgrError, LogMgrResult};

use layout::PoolLayout;
use mapping::{PoolMapping, SegmentMapper};

/// The mapped log pool and its layout.
#[derive(Debug)]
pub struct PersistentPool {
    mapping: Arc<PoolMapping>,
    layout: PoolLayout,
}

impl PersistentPool {
    /// Maps the pool described by `config`, creating its segment on first use.
    ///
    /// A segment left behind by a crash between creation and anchor
    /// publication is adopted rather than recreated.
    pub fn ensure_pool_mapped(
        config: &PoolConfig,
        mapper: &dyn SegmentMapper,
    ) -> LogMgrResult<Self> {
        let layout = PoolLayout::new(config)?;
        let base = config.base_address;
        if base == 0 {
            return Err(LogMgrError::invalid_config("pool base address must be non-zero"));
        }

        let anchor = mapper.anchor()?;
        let mapping = if anchor == 0 {
            let mapping = match mapper.find(base)? {
                Some(mapping) if mapping.len() as u64 >= config.pool_size => {
                    debug!(base, "adopting pool segment created before its anchor was published");
                    mapping
                }
                Some(torn) => {
                    // Never published, so nothing in it can be live.
                    warn!(
                        base,
                        len = torn.len(),
                        "recreating pool segment left short before its anchor was published"
                    );
                    drop(torn);
                    mapper.create(base, config.pool_size)?
                }
                None => mapper.create(base, config.pool_size)?,
            };
            mapper.publish_anchor(base)?;
            mapping
        } else if anchor != base {
            return Err(LogMgrError::mapping(format!(
                "pool anchored at {anchor:#x} but configured at {base:#x}"
            )));
        } else {
            mapper.find(base)?.ok_or_else(|| {
                LogMgrError::mapping(format!("pool anchored at {base:#x} but its segment is missing"))
            })?
        };

        if (mapping.len() as u64) < config.pool_size {
            return Err(LogMgrError::mapping(format!(
                "pool segment holds {} bytes, configuration needs {}",
                mapping.len(),
                config.pool_size
            )));
        }

        info!(
            base,
            slots = layout.slot_count(),
            pool_size = layout.pool_size(),
            durable = mapping.is_durable(),
            "log pool mapped"
        );
        Ok(Self { mapping, layout })
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    pub fn mapping(&self) -> &Arc<PoolMapping> {
        &self.mapping
    }

    /// Builds one descriptor per slot, classifying each by its persisted tag:
    /// untagged slots are free, everything else awaits recovery.
    pub fn create_descriptors(&self) -> LogMgrResult<SlotTable> {
        let slots = self.layout.slot_count();
        let mut table = SlotTable::with_capacity(slots)?;
        for idx in 0..slots {
            let slot = SlotId(idx);
            let metadata =
                SlotMetadata::new(self.mapping.clone(), self.layout.flags_offset(idx))?;
            let region = SlotRegion::new(self.mapping.clone(), self.layout.physical_log_range(idx));
            let descriptor = LogDescriptor::new(slot, metadata, region);
            let state = if descriptor.tag().is_free() {
                SlotState::Free
            } else {
                SlotState::Pending
            };
            table.push(descriptor, state);
        }
        let counts = table.counts();
        debug!(
            free = counts.free,
            pending = counts.pending,
            "log descriptors created"
        );
        Ok(table)
    }

    /// Flushes the whole pool to the backing media.
    pub fn flush(&self) -> LogMgrResult<()> {
        self.mapping.flush()
    }
}
