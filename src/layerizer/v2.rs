//! Independently compressed fixed-size disk chunks

use super::*;
use crate::digest::Hasher;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use memmap2::Mmap;
use std::{io::Write, sync::atomic::AtomicUsize};

pub fn push(
    remote: &dyn Remote,
    disk: &Path,
    options: &PushOptions,
    cancel: &Cancellation,
) -> Result<Vec<Layer>> {
    let file = fs::File::open(disk)?;
    let len = file.metadata()?.len();
    // Mapping an empty file fails on some platforms
    let mmap = if len > 0 {
        // SAFETY: the disk is not modified while it is being pushed
        Some(unsafe { Mmap::map(&file)? })
    } else {
        None
    };
    let data: &[u8] = mmap.as_deref().unwrap_or(&[]);
    let layer_size = options.layer_size.max(1) as usize;
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(layer_size).collect()
    };

    let progress = Progress::new("Pushing disk", len);
    let count = chunks.len();
    bounded_map(options.concurrency, chunks, |index, chunk| {
        cancel.check()?;
        let compressed = compress(chunk)?;
        let digest = Digest::from_buf_sha256(&compressed);
        let uncompressed_digest = Digest::from_buf_sha256(chunk);
        let what = format!("Upload of disk layer {}/{}", index + 1, count);
        with_retries(options.retries, &what, || {
            remote.push_blob_if_missing(&compressed, &digest)
        })?;
        progress.add(chunk.len() as u64);
        Ok(Layer::disk_v2(
            compressed.len() as u64,
            digest,
            chunk.len() as u64,
            &uncompressed_digest,
        ))
    })
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = FrameEncoder::new(Vec::new());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Disk layer with its validated annotations and position in the disk
struct Plan<'a> {
    layer: &'a Layer,
    offset: u64,
    size: u64,
    uncompressed_digest: &'a str,
}

#[derive(Default)]
struct Counters {
    fetched: AtomicUsize,
    skipped_on_disk: AtomicUsize,
    from_cache: AtomicUsize,
    bytes_written: AtomicU64,
    deduplicated_bytes: AtomicU64,
}

pub fn pull(
    remote: &dyn Remote,
    layers: &[&Layer],
    disk: &Path,
    options: &PullOptions,
) -> Result<PullStats> {
    // Offsets are fixed before any network call, so concurrent writes never overlap
    let mut plans = Vec::with_capacity(layers.len());
    let mut offset = 0;
    for &layer in layers {
        let size = layer.require_uncompressed_size()?;
        let uncompressed_digest = layer.require_uncompressed_content_digest()?;
        plans.push(Plan {
            layer,
            offset,
            size,
            uncompressed_digest,
        });
        offset += size;
    }
    let total_size = offset;

    let resumed = disk.exists();
    let base = if resumed {
        log::info!("Resuming pull into {}", disk.display());
        WriteBase::Unknown
    } else {
        match options.local_layer_cache {
            Some(cache) if options.deduplicate => {
                log::info!(
                    "Cloning {} as deduplication base",
                    cache.disk_path().display()
                );
                fs::copy(cache.disk_path(), disk)?;
                WriteBase::BaseDisk
            }
            _ => WriteBase::Zeroes,
        }
    };
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(disk)?;
    file.set_len(total_size)?;
    let writer = DiskWriter::new(&file, base)?;

    let compressed_total = plans.iter().map(|plan| plan.layer.size).sum();
    let progress = Progress::new("Pulling disk", compressed_total);
    let counters = Counters::default();
    let count = plans.len();

    bounded_map(options.concurrency, plans, |index, plan| {
        options.cancel.check()?;
        let layer = plan.layer;

        if resumed {
            let on_disk = Digest::from_file_range_sha256(disk, plan.offset, plan.size)?;
            if on_disk.to_string() == plan.uncompressed_digest {
                log::debug!("Disk layer {}/{} is already on disk", index + 1, count);
                counters.skipped_on_disk.fetch_add(1, Ordering::SeqCst);
                progress.add(layer.size);
                return Ok(());
            }
        }

        if let Some(cache) = options.local_layer_cache {
            let cached = cache
                .find(&layer.digest)
                .filter(|cached| cached.uncompressed_content_digest == plan.uncompressed_digest);
            if let Some(cached) = cached {
                // The clone only holds the layer if the cached disk is long enough
                match cache.data(&cached.range) {
                    Some(_) if base == WriteBase::BaseDisk && cached.range.start == plan.offset => {
                        counters
                            .deduplicated_bytes
                            .fetch_add(plan.size, Ordering::SeqCst);
                        counters.from_cache.fetch_add(1, Ordering::SeqCst);
                        progress.add(layer.size);
                        return Ok(());
                    }
                    Some(data) => {
                        let written = writer.write_at(data, plan.offset)?;
                        counters.bytes_written.fetch_add(written, Ordering::SeqCst);
                        counters.from_cache.fetch_add(1, Ordering::SeqCst);
                        progress.add(layer.size);
                        return Ok(());
                    }
                    None => {
                        log::warn!("Cached disk is shorter than its manifest, fetching layer instead")
                    }
                }
            }
        }

        let written = fetch(remote, &plan, &writer, options, &progress)?;
        counters.fetched.fetch_add(1, Ordering::SeqCst);
        counters.bytes_written.fetch_add(written, Ordering::SeqCst);
        Ok(())
    })?;

    Ok(PullStats {
        fetched: counters.fetched.into_inner(),
        skipped_on_disk: counters.skipped_on_disk.into_inner(),
        from_cache: counters.from_cache.into_inner(),
        bytes_written: counters.bytes_written.into_inner(),
        deduplicated_bytes: counters.deduplicated_bytes.into_inner(),
    })
}

/// Download, decompress and write one layer, verifying its uncompressed digest
fn fetch(
    remote: &dyn Remote,
    plan: &Plan,
    writer: &DiskWriter,
    options: &PullOptions,
    progress: &Progress,
) -> Result<u64> {
    let reader = ResumableBlobReader::new(remote, plan.layer, options.retries, progress);
    let mut decoder = FrameDecoder::new(reader);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut hasher = Hasher::new();
    let mut position = plan.offset;
    let mut written = 0;
    loop {
        options.cancel.check()?;
        let n = read_full(&mut decoder, &mut buf)?;
        if n == 0 {
            break;
        }
        if position + n as u64 > plan.offset + plan.size {
            return Err(Error::DigestMismatch {
                expected: plan.uncompressed_digest.to_string(),
                actual: format!("layer {} decompresses past its uncompressed size", plan.layer.digest),
            });
        }
        hasher.update(&buf[..n]);
        written += writer.write_at(&buf[..n], position)?;
        position += n as u64;
    }
    let actual = hasher.finalize().to_string();
    if actual != plan.uncompressed_digest {
        return Err(Error::DigestMismatch {
            expected: plan.uncompressed_digest.to_string(),
            actual,
        });
    }
    Ok(written)
}
