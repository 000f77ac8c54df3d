//! In-memory registry shared by the integration tests

#![allow(dead_code)]

use ocivm::{distribution::Remote, error::*, Digest, Manifest, Reference};
use std::{
    collections::{HashMap, HashSet},
    io::{Cursor, Read},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

#[derive(Default)]
pub struct MemoryRemote {
    pub blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    pub manifests: Mutex<HashMap<String, Vec<u8>>>,
    /// Number of `pull_blob` calls
    pub fetches: AtomicUsize,
    /// Number of blobs actually uploaded
    pub uploads: AtomicUsize,
    /// Earlier uploads take longer, so they complete in reverse order
    pub reverse_completion: bool,
    /// Blobs failing with a non-retryable error when pulled
    pub failing: Mutex<HashSet<Digest>>,
    /// The first read of every blob stops after half of it
    pub truncate_first_read: bool,
    pub truncated: Mutex<HashSet<Digest>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }
}

impl Remote for MemoryRemote {
    fn pull_manifest(&self, reference: &Reference) -> Result<(Manifest, Vec<u8>)> {
        let raw = self
            .manifests
            .lock()
            .unwrap()
            .get(&reference.value())
            .cloned()
            .ok_or_else(|| Error::UnexpectedHttpStatus {
                when: "pulling manifest",
                code: 404,
                details: reference.value(),
            })?;
        Ok((Manifest::from_json(&raw)?, raw))
    }

    fn push_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<Digest> {
        let raw = manifest.to_canonical_json()?;
        let digest = Digest::from_buf_sha256(&raw);
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert(reference.value(), raw.clone());
        manifests.insert(digest.to_string(), raw);
        Ok(digest)
    }

    fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(digest))
    }

    fn push_blob(&self, data: &[u8], digest: &Digest) -> Result<()> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.reverse_completion {
            thread::sleep(Duration::from_millis(60u64.saturating_sub(10 * n as u64)));
        }
        assert_eq!(&Digest::from_buf_sha256(data), digest);
        self.blobs.lock().unwrap().insert(digest.clone(), data.to_vec());
        Ok(())
    }

    fn pull_blob(&self, digest: &Digest, offset: u64) -> Result<Box<dyn Read + Send + Sync>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(digest) {
            return Err(Error::UnexpectedHttpStatus {
                when: "pulling blob",
                code: 500,
                details: digest.to_string(),
            });
        }
        let data = self.blob(digest).ok_or_else(|| Error::UnexpectedHttpStatus {
            when: "pulling blob",
            code: 404,
            details: digest.to_string(),
        })?;
        let mut data = data[offset as usize..].to_vec();
        if self.truncate_first_read && self.truncated.lock().unwrap().insert(digest.clone()) {
            data.truncate(data.len() / 2);
        }
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Deterministic incompressible bytes with runs of zeroes, like a real disk
pub fn disk_contents(size: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        data.push((state >> 33) as u8);
    }
    // Every fourth 64 KiB region is empty
    for (i, chunk) in data.chunks_mut(64 * 1024).enumerate() {
        if i % 4 == 3 {
            chunk.fill(0);
        }
    }
    data
}
