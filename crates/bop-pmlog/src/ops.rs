//! Log-type capability traits and type identifiers.
//!
//! Every log type plugs into the manager through [`LogOps`]. Recovery and
//! truncation are optional capabilities: a type that returns `None` from
//! [`LogOps::recovery`] never enters the recovery scheduler, and its pending
//! slots stay pending.

use std::fmt::{self, Display};
use std::num::NonZeroU8;

use crate::descriptor::LogDescriptor;
use crate::error::{LogMgrError, LogMgrResult};
use crate::pool::layout::{LOG_TYPE_FREE, LOG_TYPE_MASK, MAX_LOG_TYPE};

/// Identifier of a registered log type, in `1..=MAX_LOG_TYPE`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogTypeId(NonZeroU8);

impl LogTypeId {
    /// Validates a raw type id. Zero is reserved for [`SlotTag::Free`].
    pub fn new(raw: u64) -> LogMgrResult<Self> {
        if raw > MAX_LOG_TYPE {
            return Err(LogMgrError::InvalidType(raw));
        }
        NonZeroU8::new(raw as u8)
            .map(Self)
            .ok_or(LogMgrError::InvalidType(raw))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0.get() as u64
    }
}

impl TryFrom<u64> for LogTypeId {
    type Error = LogMgrError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LogTypeId> for u64 {
    #[inline]
    fn from(value: LogTypeId) -> Self {
        value.as_u64()
    }
}

impl Display for LogTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Persisted type tag of a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlotTag {
    Free,
    Typed(LogTypeId),
}

impl SlotTag {
    /// Decodes the tag carried in the low bits of `generic_flags`.
    pub fn from_flags(flags: u64) -> Self {
        let raw = flags & LOG_TYPE_MASK;
        match NonZeroU8::new(raw as u8) {
            Some(id) if raw != LOG_TYPE_FREE => SlotTag::Typed(LogTypeId(id)),
            _ => SlotTag::Free,
        }
    }

    /// Raw tag bits as stored in `generic_flags`.
    pub const fn raw(self) -> u64 {
        match self {
            SlotTag::Free => LOG_TYPE_FREE,
            SlotTag::Typed(id) => id.as_u64(),
        }
    }

    /// Replaces the tag bits of `flags`, preserving the rest.
    pub const fn apply(self, flags: u64) -> u64 {
        (flags & !LOG_TYPE_MASK) | self.raw()
    }

    pub fn is_free(self) -> bool {
        matches!(self, SlotTag::Free)
    }
}

impl Display for SlotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotTag::Free => write!(f, "free"),
            SlotTag::Typed(id) => write!(f, "type {id}"),
        }
    }
}

/// Operations every log type provides to the manager.
///
/// Callbacks run with the manager's slot lock held and must not call back
/// into the manager.
pub trait LogOps: Send + Sync + 'static {
    /// Human readable name used in diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Constructs the volatile log object for `descriptor`
    /// (see [`LogDescriptor::set_log`]).
    fn alloc(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()>;

    /// Prepares the volatile log object for active use. Runs before the
    /// slot's new tag is persisted.
    fn init(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()>;

    /// Recovery capability, if the type supports replay after a restart.
    fn recovery(&self) -> Option<&dyn RecoveryOps> {
        None
    }

    /// Truncation capability driven by the background truncation service.
    fn truncation(&self) -> Option<&dyn TruncationOps> {
        None
    }

    /// Flushes dirty state of an active log during shutdown.
    fn flush(&self, _descriptor: &mut LogDescriptor) -> LogMgrResult<()> {
        Ok(())
    }
}

/// Per-slot recovery hooks driven by the recovery scheduler.
///
/// The scheduler repeatedly picks the recovering slot with the smallest
/// [`crate::RecoveryOrder`], calls [`RecoveryOps::recovery_do`] and then
/// [`RecoveryOps::recovery_prepare_next`], until no slot has an order left.
pub trait RecoveryOps: Send + Sync {
    /// Prepares the slot and optionally assigns its first recovery order.
    fn recovery_init(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()>;

    /// Performs one unit of replay for the slot's current order.
    fn recovery_do(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()>;

    /// Advances the order to the next step, or clears it when the slot is done.
    /// Orders must strictly increase within a slot.
    fn recovery_prepare_next(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()>;
}

pub trait TruncationOps: Send + Sync {
    /// Reclaims log space that no longer needs to be retained.
    fn truncate(&self, descriptor: &mut LogDescriptor) -> LogMgrResult<()>;
}
