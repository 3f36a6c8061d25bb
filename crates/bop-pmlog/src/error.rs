use std::fmt::Display;

use crate::descriptor::SlotId;
use crate::ops::LogTypeId;

/// A specialized error type for log manager operations.
///
/// `UnknownType` and `NoFreeSlot` are ordinary allocation outcomes and leave
/// shared state untouched. Everything reported through [`LogMgrError::is_fatal`]
/// means bring-up or an installed log type broke its contract.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LogMgrError {
    /// Descriptor or registry storage could not be grown.
    #[error("out of memory")]
    OutOfMemory,
    /// Allocation requested for a type with no registered operations.
    #[error("unknown log type: {0}")]
    UnknownType(LogTypeId),
    /// No free slot is tagged with the requested type or untyped.
    #[error("no free log slot for type {0}")]
    NoFreeSlot(LogTypeId),
    /// Raw value is outside the valid type id range.
    #[error("invalid log type id: {0}")]
    InvalidType(u64),
    /// Pool geometry or other configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The pool segment could not be located or mapped.
    #[error("pool mapping failed: {0}")]
    Mapping(String),
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A log type callback was missing or failed.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// The handle does not refer to an active slot.
    #[error("slot {0} is not active")]
    InvalidHandle(SlotId),
    /// The manager has been shut down.
    #[error("log manager is shut down")]
    ShutDown,
}

impl LogMgrError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a mapping failure from a displayable value.
    pub fn mapping<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Mapping(msg.to_string())
    }

    /// Create an invariant violation from a displayable value.
    pub fn invariant<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Invariant(msg.to_string())
    }

    /// Returns true for failures callers are not expected to recover from.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            LogMgrError::UnknownType(_)
                | LogMgrError::NoFreeSlot(_)
                | LogMgrError::InvalidType(_)
                | LogMgrError::InvalidHandle(_)
                | LogMgrError::ShutDown
        )
    }
}

/// A Result type alias for log manager operations.
pub type LogMgrResult<T> = Result<T, LogMgrError>;
