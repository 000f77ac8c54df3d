//! Disk of a previously pulled image, used as a source of layers for a new pull

use crate::{error::*, media_types, Digest, Manifest};
use memmap2::Mmap;
use std::{
    collections::HashMap,
    fs,
    ops::Range,
    path::{Path, PathBuf},
};

/// Where the uncompressed contents of a layer live in the cached disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLayer {
    pub range: Range<u64>,
    pub uncompressed_content_digest: String,
}

/// Read-only view of a cached disk indexed by compressed layer digest
pub struct LocalLayerCache {
    name: String,
    disk_path: PathBuf,
    mmap: Option<Mmap>,
    layers: HashMap<Digest, CachedLayer>,
}

impl LocalLayerCache {
    /// Index the v2 disk layers of `manifest`, whose contents are in `disk_path`
    pub fn new(name: &str, disk_path: &Path, manifest: &Manifest) -> Result<Self> {
        let file = fs::File::open(disk_path)?;
        let mmap = if file.metadata()?.len() > 0 {
            // SAFETY: cached disks are never modified in place, pulls write to a clone
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };

        let mut layers = HashMap::new();
        let mut offset = 0;
        for layer in manifest.layers_of(media_types::DISK_V2) {
            let size = layer.require_uncompressed_size()?;
            let uncompressed_content_digest = layer.require_uncompressed_content_digest()?;
            layers
                .entry(layer.digest.clone())
                .or_insert_with(|| CachedLayer {
                    range: offset..offset + size,
                    uncompressed_content_digest: uncompressed_content_digest.to_string(),
                });
            offset += size;
        }
        Ok(LocalLayerCache {
            name: name.to_string(),
            disk_path: disk_path.to_owned(),
            mmap,
            layers,
        })
    }

    /// Name of the cached image
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }

    pub fn find(&self, digest: &Digest) -> Option<&CachedLayer> {
        self.layers.get(digest)
    }

    /// Bytes of the cached disk, `None` if the range is past its end
    pub fn data(&self, range: &Range<u64>) -> Option<&[u8]> {
        let data: &[u8] = self.mmap.as_deref().unwrap_or(&[]);
        data.get(range.start as usize..range.end as usize)
    }
}
