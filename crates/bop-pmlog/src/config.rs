use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LogMgrError, LogMgrResult};
use crate::pool::layout::PoolLayout;

/// Fixed address the pool segment is identified by.
pub const DEFAULT_POOL_BASE: u64 = 0x0000_1000_0000_0000;

/// Number of log slots in the reference configuration.
pub const DEFAULT_SLOT_COUNT: usize = 32;

/// Default size of one physical log region before page alignment.
const DEFAULT_PHYSICAL_LOG_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Default pool capacity; 32 x 1 MiB logs plus the metadata section.
const DEFAULT_POOL_SIZE: u64 = 64 * 1024 * 1024; // 64 MiB

const DEFAULT_PAGE_SIZE: u64 = 4096;

const DEFAULT_TRUNCATION_INTERVAL_MS: u64 = 10;

const DEFAULT_TRUNCATION_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

fn default_root_dir() -> PathBuf {
    PathBuf::from("pmlog")
}

/// Geometry and backing location of the persistent log pool.
///
/// The layout derived from these values is fixed for the lifetime of the pool:
/// reopening an existing pool with a different geometry reinterprets its bytes.
///
/// # Example
///
/// ```rust
/// use bop_pmlog::PoolConfig;
///
/// let mut pool = PoolConfig::default();
/// pool.physical_log_size = 64 * 1024;
/// pool.pool_size = 4 * 1024 * 1024;
/// pool.validate().expect("fits");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding the pool segment and its anchor word.
    pub root_dir: PathBuf,
    /// Fixed address identifying the pool segment.
    pub base_address: u64,
    /// Total capacity of the pool segment in bytes.
    pub pool_size: u64,
    /// Number of log slots.
    pub slot_count: usize,
    /// Physical log size per slot; rounded up to `page_size`.
    pub physical_log_size: u64,
    /// Page size used for section alignment. Must be a power of two.
    pub page_size: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            base_address: DEFAULT_POOL_BASE,
            pool_size: DEFAULT_POOL_SIZE,
            slot_count: DEFAULT_SLOT_COUNT,
            physical_log_size: DEFAULT_PHYSICAL_LOG_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PoolConfig {
    /// Validates the geometry by computing the layout it implies.
    pub fn validate(&self) -> LogMgrResult<()> {
        PoolLayout::new(self).map(|_| ())
    }

    /// Path of the segment file backing the pool at `base_address`.
    pub fn segment_path(&self) -> PathBuf {
        segment_file_path(&self.root_dir, self.base_address)
    }
}

/// File name of the segment mapped at `base`.
pub fn segment_file_path(root: &Path, base: u64) -> PathBuf {
    root.join(format!("segment-{base:016x}.pmem"))
}

/// Background truncation worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    /// Start the truncation service at bring-up.
    pub enabled: bool,
    /// Idle interval between truncation passes (milliseconds).
    pub interval_ms: u64,
    /// Worker threads for the truncation runtime (None = 1).
    pub worker_threads: Option<usize>,
    /// Maximum time to wait for the truncation runtime to stop (milliseconds).
    pub shutdown_timeout_ms: u64,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: DEFAULT_TRUNCATION_INTERVAL_MS,
            worker_threads: None,
            shutdown_timeout_ms: DEFAULT_TRUNCATION_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

/// Top-level options for bringing up a [`crate::LogManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogManagerConfig {
    pub pool: PoolConfig,
    pub truncation: TruncationConfig,
}

impl LogManagerConfig {
    /// Returns a copy rooted at `root_dir`.
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.pool.root_dir = root_dir.into();
        self
    }

    pub fn with_truncation(mut self, enabled: bool) -> Self {
        self.truncation.enabled = enabled;
        self
    }

    /// Small pool suitable for tests: 8 KiB logs in a 1 MiB segment.
    pub fn for_tests(root_dir: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::default().with_root_dir(root_dir);
        cfg.pool.physical_log_size = 8 * 1024;
        cfg.pool.pool_size = 1024 * 1024;
        cfg.truncation.interval_ms = 1;
        cfg
    }

    pub fn validate(&self) -> LogMgrResult<()> {
        self.pool.validate()?;
        if self.truncation.enabled && self.truncation.interval_ms == 0 {
            return Err(LogMgrError::invalid_config(
                "truncation interval must be non-zero when enabled",
            ));
        }
        Ok(())
    }
}
