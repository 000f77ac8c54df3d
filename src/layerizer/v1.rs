//! Single LZ4 stream cut into fixed-size compressed layers
//!
//! Kept so that images pushed in this format can still be pulled.

use super::*;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io::Write;

pub fn push(
    remote: &dyn Remote,
    disk: &Path,
    options: &PushOptions,
    cancel: &Cancellation,
) -> Result<Vec<Layer>> {
    let mut file = fs::File::open(disk)?;
    let progress = Progress::new("Pushing disk", file.metadata()?.len());
    let layer_size = options.layer_size.max(1) as usize;
    let mut encoder = FrameEncoder::new(Vec::new());
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut layers = Vec::new();
    loop {
        cancel.check()?;
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
        progress.add(n as u64);
        while encoder.get_ref().len() >= layer_size {
            let compressed: Vec<u8> = encoder.get_mut().drain(..layer_size).collect();
            layers.push(push_layer(remote, &compressed, options.retries)?);
        }
    }
    let rest = encoder.finish()?;
    for compressed in rest.chunks(layer_size) {
        layers.push(push_layer(remote, compressed, options.retries)?);
    }
    Ok(layers)
}

fn push_layer(remote: &dyn Remote, compressed: &[u8], retries: usize) -> Result<Layer> {
    let digest = Digest::from_buf_sha256(compressed);
    with_retries(retries, "Upload of disk layer", || {
        remote.push_blob_if_missing(compressed, &digest)
    })?;
    Ok(Layer::new(media_types::DISK_V1, compressed.len() as u64, digest))
}

/// The layers of a v1 disk read back to back as one stream
struct ConcatBlobs<'a> {
    remote: &'a dyn Remote,
    layers: &'a [&'a Layer],
    next: usize,
    current: Option<ResumableBlobReader<'a>>,
    retries: usize,
    progress: &'a Progress,
}

impl Read for ConcatBlobs<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(current) = &mut self.current {
                let n = current.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
                self.current = None;
            }
            match self.layers.get(self.next) {
                Some(&layer) => {
                    self.current = Some(ResumableBlobReader::new(
                        self.remote,
                        layer,
                        self.retries,
                        self.progress,
                    ));
                    self.next += 1;
                }
                None => return Ok(0),
            }
        }
    }
}

/// Always a fresh pull, the stream cannot be entered in the middle
pub fn pull(
    remote: &dyn Remote,
    layers: &[&Layer],
    disk: &Path,
    options: &PullOptions,
) -> Result<PullStats> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(disk)?;
    let writer = DiskWriter::new(&file, WriteBase::Zeroes)?;
    let progress = Progress::new(
        "Pulling disk",
        layers.iter().map(|layer| layer.size).sum(),
    );
    let mut decoder = FrameDecoder::new(ConcatBlobs {
        remote,
        layers,
        next: 0,
        current: None,
        retries: options.retries,
        progress: &progress,
    });

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut position = 0;
    let mut bytes_written = 0;
    loop {
        options.cancel.check()?;
        let n = read_full(&mut decoder, &mut buf)?;
        if n == 0 {
            break;
        }
        bytes_written += writer.write_at(&buf[..n], position)?;
        position += n as u64;
    }
    // Trailing zeroes were skipped
    file.set_len(position)?;

    Ok(PullStats {
        fetched: layers.len(),
        bytes_written,
        ..Default::default()
    })
}
