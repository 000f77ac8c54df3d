//! Split VM disks into compressed registry layers and reassemble them
//!
//! Two wire formats exist, distinguished by the layer media type:
//!
//! - [v1]: the whole disk is one LZ4 frame, cut into fixed-size compressed layers.
//!   Layers can only be decompressed in order.
//! - [v2]: every layer is an independent LZ4 frame of a fixed-size uncompressed chunk,
//!   annotated with the uncompressed size and digest. Layers are pulled concurrently,
//!   can be resumed, and can be deduplicated against a [LocalLayerCache].

pub mod v1;
pub mod v2;

use crate::{
    cancel::Cancellation, distribution::Remote, error::*, local_layer_cache::LocalLayerCache,
    media_types, Digest, Layer, Manifest,
};
use std::{
    fmt, fs,
    io::{self, Read},
    os::unix::fs::{FileExt as _, MetadataExt as _},
    path::Path,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
};

/// Decompressed data is written in pieces of this size, so all-zero pieces can be skipped
pub const SUB_CHUNK_SIZE: usize = 64 * 1024;

/// Size of a single read from the decompressor
pub const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

static ZEROES: [u8; SUB_CHUNK_SIZE] = [0; SUB_CHUNK_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    V1,
    V2,
}

impl Default for DiskFormat {
    fn default() -> Self {
        DiskFormat::V2
    }
}

impl DiskFormat {
    pub fn media_type(&self) -> &'static str {
        match self {
            DiskFormat::V1 => media_types::DISK_V1,
            DiskFormat::V2 => media_types::DISK_V2,
        }
    }

    /// Detect the format from the disk layers of a manifest
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let v1 = manifest.layers_of(media_types::DISK_V1).count();
        let v2 = manifest.layers_of(media_types::DISK_V2).count();
        match (v1, v2) {
            (0, 0) => Err(Error::ShouldBeAtLeastOneLayer),
            (_, 0) => Ok(DiskFormat::V1),
            (0, _) => Ok(DiskFormat::V2),
            _ => Err(Error::UnsupportedDiskFormat(
                "manifest mixes v1 and v2 disk layers".to_string(),
            )),
        }
    }

    /// Compress and upload the disk, returning the disk layers in disk order
    pub fn push(
        &self,
        remote: &dyn Remote,
        disk: &Path,
        options: &PushOptions,
        cancel: &Cancellation,
    ) -> Result<Vec<Layer>> {
        match self {
            DiskFormat::V1 => v1::push(remote, disk, options, cancel),
            DiskFormat::V2 => v2::push(remote, disk, options, cancel),
        }
    }

    /// Download the disk layers of `manifest` into `disk`
    pub fn pull(
        &self,
        remote: &dyn Remote,
        manifest: &Manifest,
        disk: &Path,
        options: &PullOptions,
    ) -> Result<PullStats> {
        let layers: Vec<&Layer> = manifest.layers_of(self.media_type()).collect();
        match self {
            DiskFormat::V1 => v1::pull(remote, &layers, disk, options),
            DiskFormat::V2 => v2::pull(remote, &layers, disk, options),
        }
    }
}

impl FromStr for DiskFormat {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        match input {
            "v1" => Ok(DiskFormat::V1),
            "v2" => Ok(DiskFormat::V2),
            _ => Err(Error::UnsupportedDiskFormat(input.to_string())),
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskFormat::V1 => write!(f, "v1"),
            DiskFormat::V2 => write!(f, "v2"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Uncompressed bytes per layer for v2, compressed bytes per layer for v1
    pub layer_size: u64,
    /// Maximum number of layers uploaded at the same time
    pub concurrency: usize,
    /// Attempts per layer upload on network errors
    pub retries: usize,
}

#[derive(Clone)]
pub struct PullOptions<'a> {
    /// Maximum number of layers downloaded at the same time
    pub concurrency: usize,
    /// Attempts per layer download on network errors
    pub retries: usize,
    /// Previously pulled disk sharing layers with this one
    pub local_layer_cache: Option<&'a LocalLayerCache>,
    /// Start from a clone of the local layer cache's disk
    pub deduplicate: bool,
    pub cancel: &'a Cancellation,
}

/// What happened to the layers of a disk pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullStats {
    /// Layers downloaded from the registry
    pub fetched: usize,
    /// Layers already correct on disk from an interrupted pull
    pub skipped_on_disk: usize,
    /// Layers taken from the local layer cache instead of the network
    pub from_cache: usize,
    /// Bytes actually written to the disk file
    pub bytes_written: u64,
    /// Bytes of layers already in place in the deduplicated base disk
    pub deduplicated_bytes: u64,
}

/// Byte counter logging every 10%
#[derive(Debug)]
pub struct Progress {
    what: String,
    total: u64,
    done: AtomicU64,
    reported: AtomicU64,
}

impl Progress {
    pub fn new(what: impl Into<String>, total: u64) -> Self {
        Progress {
            what: what.into(),
            total,
            done: AtomicU64::new(0),
            reported: AtomicU64::new(0),
        }
    }

    pub fn add(&self, n: u64) {
        let done = self.done.fetch_add(n, Ordering::SeqCst) + n;
        if self.total == 0 {
            return;
        }
        let step = done.min(self.total) * 10 / self.total;
        if self.reported.fetch_max(step, Ordering::SeqCst) < step {
            log::info!("{}: {}%", self.what, step * 10);
        }
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
    }
}

/// Run `f` on every item using at most `concurrency` threads
///
/// Items are admitted in index order and results come back in index order,
/// whatever order they complete in. The first error stops admission of the remaining items.
pub(crate) fn bounded_map<T, R, F>(concurrency: usize, items: Vec<T>, f: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> Result<R> + Sync,
{
    let count = items.len();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .build()?;
    let abort = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel();
    pool.scope_fifo(|scope| {
        for (index, item) in items.into_iter().enumerate() {
            let tx = tx.clone();
            let f = &f;
            let abort = &abort;
            scope.spawn_fifo(move |_| {
                if abort.load(Ordering::SeqCst) {
                    return;
                }
                let result = f(index, item);
                if result.is_err() {
                    abort.store(true, Ordering::SeqCst);
                }
                // Receiver outlives the scope
                let _ = tx.send((index, result));
            });
        }
    });
    drop(tx);

    let mut results = Vec::with_capacity(count);
    let mut first_error = None;
    for (index, result) in rx {
        match result {
            Ok(value) => results.push((index, value)),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, value)| value).collect())
}

/// Call `f` until it succeeds, fails with a non-network error, or `attempts` are used up
pub(crate) fn with_retries<R>(attempts: usize, what: &str, mut f: impl FnMut() -> Result<R>) -> Result<R> {
    let mut attempt = 1;
    loop {
        match f() {
            Err(e) if e.is_network() && attempt < attempts => {
                log::warn!("{} failed: {}, retrying ({}/{})", what, e, attempt, attempts - 1);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Blob stream re-requested from where it broke off on network errors
pub(crate) struct ResumableBlobReader<'a> {
    remote: &'a dyn Remote,
    digest: &'a Digest,
    /// Compressed size from the manifest
    size: u64,
    offset: u64,
    reader: Option<Box<dyn Read + Send + Sync>>,
    retries_left: usize,
    progress: &'a Progress,
}

impl<'a> ResumableBlobReader<'a> {
    pub fn new(remote: &'a dyn Remote, layer: &'a Layer, retries: usize, progress: &'a Progress) -> Self {
        ResumableBlobReader {
            remote,
            digest: &layer.digest,
            size: layer.size,
            offset: 0,
            reader: None,
            retries_left: retries.saturating_sub(1),
            progress,
        }
    }

    fn retry(&mut self, e: &dyn fmt::Display) -> bool {
        if self.retries_left == 0 {
            return false;
        }
        log::warn!(
            "Download of {} interrupted at {} bytes: {}, resuming",
            self.digest,
            self.offset,
            e
        );
        self.retries_left -= 1;
        self.reader = None;
        true
    }
}

impl Read for ResumableBlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let result = match &mut self.reader {
                Some(reader) => reader.read(buf),
                None => {
                    match self.remote.pull_blob(self.digest, self.offset) {
                        Ok(reader) => self.reader = Some(reader),
                        Err(e) if e.is_network() && self.retry(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                    continue;
                }
            };
            match result {
                Ok(0) if !buf.is_empty() && self.offset < self.size => {
                    let e = io::Error::new(io::ErrorKind::UnexpectedEof, "blob ended early");
                    if !self.retry(&e) {
                        return Err(e);
                    }
                }
                Ok(n) => {
                    self.offset += n as u64;
                    self.progress.add(n as u64);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_network_io(&e) && self.retry(&e) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Read until `buf` is full or the stream ends
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// What the destination file contains before a layer is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteBase {
    /// Freshly truncated, reads as zeroes
    Zeroes,
    /// Left over from an interrupted pull, anything may be there
    Unknown,
    /// Clone of a cached disk, compare before writing
    BaseDisk,
}

/// Positional writer skipping sub-chunks which already have the right content
pub(crate) struct DiskWriter<'a> {
    file: &'a fs::File,
    base: WriteBase,
    block_size: u64,
}

impl<'a> DiskWriter<'a> {
    pub fn new(file: &'a fs::File, base: WriteBase) -> Result<Self> {
        let block_size = file.metadata()?.blksize().max(1);
        Ok(DiskWriter {
            file,
            base,
            block_size,
        })
    }

    /// Write `data` at `offset`, returning the number of bytes which actually hit the disk
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<u64> {
        let mut written = 0;
        let mut existing = vec![0u8; SUB_CHUNK_SIZE.min(data.len())];
        for (i, chunk) in data.chunks(SUB_CHUNK_SIZE).enumerate() {
            let at = offset + (i * SUB_CHUNK_SIZE) as u64;
            let zero = chunk == &ZEROES[..chunk.len()];
            match self.base {
                WriteBase::Zeroes if zero => continue,
                WriteBase::Unknown if zero && self.punch_hole(at, chunk.len() as u64) => continue,
                WriteBase::BaseDisk => {
                    let existing = &mut existing[..chunk.len()];
                    self.file.read_exact_at(existing, at)?;
                    if existing == chunk {
                        continue;
                    }
                }
                _ => {}
            }
            self.file.write_all_at(chunk, at)?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(&self, offset: u64, len: u64) -> bool {
        use std::os::unix::io::AsRawFd;
        if offset % self.block_size != 0 || len % self.block_size != 0 {
            return false;
        }
        // SAFETY: plain syscall on an open descriptor, no memory is shared
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        ret == 0
    }

    #[cfg(not(target_os = "linux"))]
    fn punch_hole(&self, _offset: u64, _len: u64) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Mutex, thread, time::Duration};

    #[test]
    fn bounded_map_keeps_order() -> Result<()> {
        // Later items finish first
        let out = bounded_map(4, (0..8u64).collect(), |index, item| {
            thread::sleep(Duration::from_millis(5 * (8 - item)));
            Ok((index, item * 2))
        })?;
        assert_eq!(out, (0..8).map(|i| (i as usize, i * 2)).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn bounded_map_is_bounded() -> Result<()> {
        let running = AtomicU64::new(0);
        let peak = AtomicU64::new(0);
        bounded_map(3, vec![(); 12], |_, _| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })?;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        Ok(())
    }

    #[test]
    fn bounded_map_stops_on_error() {
        let started = Mutex::new(Vec::new());
        let result = bounded_map(1, (0..10).collect(), |index, _: i32| {
            started.lock().unwrap().push(index);
            if index == 2 {
                Err(Error::ShouldBeAtLeastOneLayer)
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(Error::ShouldBeAtLeastOneLayer)));
        // Single thread admits in order, nothing after the failure runs
        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn retries_only_network_errors() {
        let mut calls = 0;
        let result: Result<()> = with_retries(3, "test", || {
            calls += 1;
            Err(Error::UnknownIo(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result: Result<()> = with_retries(3, "test", || {
            calls += 1;
            Err(Error::ShouldBeAtLeastOneLayer)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result = with_retries(3, "test", || {
            calls += 1;
            if calls < 2 {
                Err(Error::UnknownIo(io::Error::new(io::ErrorKind::TimedOut, "slow")))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn progress_steps() {
        let progress = Progress::new("test", 100);
        progress.add(5);
        progress.add(50);
        assert_eq!(progress.reported.load(Ordering::SeqCst), 5);
        progress.add(100);
        assert_eq!(progress.reported.load(Ordering::SeqCst), 10);
        assert_eq!(progress.done(), 155);
    }

    #[test]
    fn disk_writer_skips_zeroes_on_fresh_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");
        let file = fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.set_len(3 * SUB_CHUNK_SIZE as u64)?;

        let mut data = vec![0u8; 3 * SUB_CHUNK_SIZE];
        data[SUB_CHUNK_SIZE + 1] = 7;
        let written = DiskWriter::new(&file, WriteBase::Zeroes)?.write_at(&data, 0)?;
        assert_eq!(written, SUB_CHUNK_SIZE as u64);
        assert_eq!(fs::read(&path)?, data);
        Ok(())
    }

    #[test]
    fn disk_writer_clears_leftovers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0xffu8; 2 * SUB_CHUNK_SIZE])?;
        let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;

        let data = vec![0u8; 2 * SUB_CHUNK_SIZE];
        DiskWriter::new(&file, WriteBase::Unknown)?.write_at(&data, 0)?;
        assert_eq!(fs::read(&path)?, data);
        Ok(())
    }

    #[test]
    fn disk_writer_compares_with_base() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");
        let mut base = vec![1u8; 2 * SUB_CHUNK_SIZE];
        base[..SUB_CHUNK_SIZE].fill(0);
        fs::write(&path, &base)?;
        let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;

        // First sub-chunk differs (base has zeroes there), second is identical
        let data = vec![1u8; 2 * SUB_CHUNK_SIZE];
        let written = DiskWriter::new(&file, WriteBase::BaseDisk)?.write_at(&data, 0)?;
        assert_eq!(written, SUB_CHUNK_SIZE as u64);
        assert_eq!(fs::read(&path)?, data);
        Ok(())
    }

    #[test]
    fn disk_format_detection() -> Result<()> {
        use crate::manifest::Descriptor;
        let config = Descriptor {
            media_type: media_types::OCI_CONFIG.to_string(),
            size: 2,
            digest: Digest::from_buf_sha256(b"{}"),
        };
        let layer = |media_type| Layer::new(media_type, 1, Digest::from_buf_sha256(b"x"));
        let manifest = |layers| Manifest::new(config.clone(), layers, None, None);

        assert_eq!(
            DiskFormat::from_manifest(&manifest(vec![layer(media_types::DISK_V1)]))?,
            DiskFormat::V1
        );
        assert_eq!(
            DiskFormat::from_manifest(&manifest(vec![
                layer(media_types::CONFIG),
                layer(media_types::DISK_V2)
            ]))?,
            DiskFormat::V2
        );
        assert!(DiskFormat::from_manifest(&manifest(vec![layer(media_types::NVRAM)])).is_err());
        assert!(DiskFormat::from_manifest(&manifest(vec![
            layer(media_types::DISK_V1),
            layer(media_types::DISK_V2)
        ]))
        .is_err());
        assert_eq!("v1".parse::<DiskFormat>()?, DiskFormat::V1);
        assert!("v3".parse::<DiskFormat>().is_err());
        Ok(())
    }
}
