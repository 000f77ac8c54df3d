//! Cache eviction by age and by size

use crate::error::*;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// An entry of a cache that may be deleted to free space
pub trait Prunable {
    /// Location on disk, also the identity of the entry
    fn path(&self) -> &Path;
    fn access_date(&self) -> Result<DateTime<Utc>>;
    /// Bytes actually occupied on disk, smaller than the logical size for sparse disks
    fn allocated_size(&self) -> Result<u64>;
    fn delete(&self) -> Result<()>;
}

/// A cache whose entries are subject to pruning
pub trait PrunableStorage {
    fn prunables(&self) -> Result<Vec<Box<dyn Prunable>>>;
}

fn collect(storages: &[&dyn PrunableStorage]) -> Result<Vec<(DateTime<Utc>, Box<dyn Prunable>)>> {
    let mut entries = Vec::new();
    for storage in storages {
        for prunable in storage.prunables()? {
            entries.push((prunable.access_date()?, prunable));
        }
    }
    Ok(entries)
}

/// Delete entries last accessed at or before `cutoff`, returning the deleted paths
pub fn prune_older_than(
    storages: &[&dyn PrunableStorage],
    cutoff: DateTime<Utc>,
) -> Result<Vec<PathBuf>> {
    let mut deleted = Vec::new();
    for (access_date, prunable) in collect(storages)? {
        if access_date <= cutoff {
            log::info!("Pruning {} (last accessed {})", prunable.path().display(), access_date);
            prunable.delete()?;
            deleted.push(prunable.path().to_owned());
        }
    }
    Ok(deleted)
}

/// Delete least recently used entries until the rest fits into `budget` bytes
pub fn prune_space_budget(storages: &[&dyn PrunableStorage], budget: u64) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut total = 0;
    for (access_date, prunable) in collect(storages)? {
        let size = prunable.allocated_size()?;
        total += size;
        entries.push((access_date, size, prunable));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut deleted = Vec::new();
    for (_, size, prunable) in entries {
        if total <= budget {
            break;
        }
        log::info!("Pruning {} to fit the cache budget", prunable.path().display());
        prunable.delete()?;
        total -= size;
        deleted.push(prunable.path().to_owned());
    }
    Ok(deleted)
}

/// Make room for `required` bytes when only `available` bytes are free
///
/// Least recently used entries are deleted until enough space is reclaimed.
/// Nothing is deleted if even deleting everything would not help.
/// `initiator` is the entry on whose behalf space is made and is never deleted.
pub fn reclaim_if_needed(
    storages: &[&dyn PrunableStorage],
    required: u64,
    available: u64,
    initiator: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    if available == 0 {
        log::warn!("Volume reports zero available capacity, not pruning");
        return Ok(Vec::new());
    }
    if required < available {
        return Ok(Vec::new());
    }
    let reclaim = required - available;

    let mut entries = collect(storages)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut used = 0;
    for (_, prunable) in &entries {
        used += prunable.allocated_size()?;
    }
    if used < reclaim {
        log::warn!(
            "Need to reclaim {} bytes but caches only use {} bytes, not pruning",
            reclaim,
            used
        );
        return Ok(Vec::new());
    }

    let initiator = initiator.and_then(|path| path.canonicalize().ok());
    let mut reclaimed = 0;
    let mut deleted = Vec::new();
    for (_, prunable) in entries {
        if reclaimed > reclaim {
            break;
        }
        if initiator.is_some() && prunable.path().canonicalize().ok() == initiator {
            continue;
        }
        reclaimed += prunable.allocated_size()?;
        log::info!("Pruning {} to reclaim space", prunable.path().display());
        prunable.delete()?;
        deleted.push(prunable.path().to_owned());
    }
    Ok(deleted)
}
