//! Local caches of VM images and installer downloads

mod ipsw;
mod oci;

pub use ipsw::*;
pub use oci::*;

use crate::{error::*, file_lock::FileLock, Config};
use chrono::{DateTime, Utc};
use std::{fs, io, os::unix::fs::MetadataExt as _, path::Path};

/// Logical size of a file, 0 if it does not exist
pub(crate) fn file_size(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Bytes allocated on disk for a file, 0 if it does not exist
pub(crate) fn allocated_size(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        // st_blocks is always in 512-byte units
        Ok(metadata) => Ok(metadata.blocks() * 512),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn access_date(path: &Path) -> Result<DateTime<Utc>> {
    Ok(fs::metadata(path)?.accessed()?.into())
}

/// Remove scratch directories under `<home>/tmp` which no running operation holds locked
pub fn gc_temporary_dirs(config: &Config) -> Result<()> {
    let entries = match fs::read_dir(config.tmp_dir()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        let lock = match FileLock::new(&path) {
            Ok(lock) => lock,
            // Removed by a concurrent GC
            Err(Error::LockFailed { .. }) => continue,
            Err(e) => return Err(e),
        };
        if !lock.try_lock()? {
            log::debug!("{} is in use, keeping it", path.display());
            continue;
        }
        log::info!("Removing stale temporary {}", path.display());
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
