//! Pull and Push VM images to OCI registry based on [OCI distribution specification](https://github.com/opencontainers/distribution-spec)

mod auth;
mod client;
mod credentials;

pub use auth::*;
pub use client::Client;
pub use credentials::*;

use crate::{error::*, Digest, Manifest, Reference, RemoteName};
use std::io::{self, Read, Write};

/// One repository of a registry, as seen by the layerizers and the image store
///
/// Implemented by [Client] for real registries. Every method may be called
/// concurrently from the transfer thread pool.
pub trait Remote: Send + Sync {
    /// Manifest and the raw bytes it was decoded from
    fn pull_manifest(&self, reference: &Reference) -> Result<(Manifest, Vec<u8>)>;

    /// Push manifest and return the digest of the bytes sent
    fn push_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<Digest>;

    fn blob_exists(&self, digest: &Digest) -> Result<bool>;

    /// Upload a blob whose digest has already been computed by the caller
    fn push_blob(&self, data: &[u8], digest: &Digest) -> Result<()>;

    /// Stream of the blob content starting at `offset`
    fn pull_blob(&self, digest: &Digest, offset: u64) -> Result<Box<dyn Read + Send + Sync>>;

    /// Push unless the registry already has a blob with this digest
    ///
    /// Returns whether the blob was actually uploaded.
    fn push_blob_if_missing(&self, data: &[u8], digest: &Digest) -> Result<bool> {
        if self.blob_exists(digest)? {
            log::debug!("Blob {} already exists, skip upload", digest);
            return Ok(false);
        }
        self.push_blob(data, digest)?;
        Ok(true)
    }

    /// Copy the whole blob into `sink`
    fn pull_blob_to(&self, digest: &Digest, sink: &mut dyn Write) -> Result<u64> {
        let mut reader = self.pull_blob(digest, 0)?;
        Ok(io::copy(&mut reader, sink)?)
    }
}

/// Client for the repository of `name`, reading credentials from the environment and docker config
pub fn connect(name: &RemoteName, insecure: bool, upload_chunk_size_mb: usize) -> Result<Client> {
    let credentials = CredentialsChain::standard()?;
    Ok(Client::from_remote_name(name, insecure, Box::new(credentials))?
        .with_upload_chunk_size(Some(upload_chunk_size_mb * 1024 * 1024)))
}
