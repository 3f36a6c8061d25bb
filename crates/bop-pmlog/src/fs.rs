use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use crate::error::{LogMgrError, LogMgrResult};

/// Replaces `path` with a zero-filled file of exactly `size` bytes, synced
/// before it is returned.
pub fn create_fixed_size_file(path: &Path, size: u64) -> LogMgrResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;
    file.sync_all()?;
    Ok(file)
}

/// Opens an existing file for read/write, returning `None` when it does not exist.
pub fn open_existing(path: &Path) -> LogMgrResult<Option<File>> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LogMgrError::from(err)),
    }
}

pub fn ensure_dir(path: &Path) -> LogMgrResult<()> {
    fs::create_dir_all(path).map_err(LogMgrError::from)
}

/// Makes entry changes under `dir` durable. Filesystems that refuse to sync
/// a directory handle are taken as already durable.
pub fn fsync_dir(dir: &Path) -> LogMgrResult<()> {
    let handle = match File::open(dir) {
        Ok(handle) => handle,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(LogMgrError::mapping(format!(
                "pool directory {} is missing",
                dir.display()
            )));
        }
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    match handle.sync_all() {
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
            ) =>
        {
            Ok(())
        }
        other => other.map_err(LogMgrError::from),
    }
}
