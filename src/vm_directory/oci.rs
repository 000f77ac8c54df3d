use super::VmDirectory;
use crate::{
    cancel::Cancellation,
    distribution::Remote,
    error::*,
    layerizer::{with_retries, DiskFormat, PullOptions, PullStats, PushOptions},
    manifest::{Descriptor, OciConfig, OciConfigContainer},
    media_types,
    Digest, Layer, Manifest, Reference,
};
use chrono::Utc;
use std::{collections::BTreeMap, fs, path::Path};

impl VmDirectory {
    /// Populate this directory from the layers of `manifest`
    ///
    /// `manifest.json` is written last, so its presence means the pull went through.
    pub fn pull_from_registry(
        &self,
        remote: &dyn Remote,
        manifest: &Manifest,
        options: &PullOptions,
    ) -> Result<PullStats> {
        log::info!("Pulling config");
        let config = manifest.single_layer(media_types::CONFIG)?;
        pull_small_blob(remote, config, &self.config_path(), options.retries)?;

        let format = DiskFormat::from_manifest(manifest)?;
        let compressed: u64 = manifest.layers_of(format.media_type()).map(|l| l.size).sum();
        log::info!(
            "Pulling disk ({:.1} GB compressed, format {})",
            compressed as f64 / 1e9,
            format
        );
        let stats = format.pull(remote, manifest, &self.disk_path(), options)?;
        log::info!(
            "Disk pulled: {} layers fetched, {} already on disk, {} from {}",
            stats.fetched,
            stats.skipped_on_disk,
            stats.from_cache,
            options
                .local_layer_cache
                .map_or("no local cache", |cache| cache.name())
        );

        log::info!("Pulling NVRAM");
        let nvram = manifest.single_layer(media_types::NVRAM)?;
        pull_small_blob(remote, nvram, &self.nvram_path(), options.retries)?;

        fs::write(self.manifest_path(), manifest.to_canonical_json()?)?;
        Ok(stats)
    }

    /// Upload this VM and tag it with every reference, returning the manifest digest
    ///
    /// Blobs go first and the manifests last, so a failed push never leaves a tag pointing to missing data.
    pub fn push_to_registry(
        &self,
        remote: &dyn Remote,
        references: &[Reference],
        disk_format: DiskFormat,
        options: &PushOptions,
        labels: BTreeMap<String, String>,
        cancel: &Cancellation,
    ) -> Result<Digest> {
        let mut layers = Vec::new();

        log::info!("Pushing config");
        let config = fs::read(self.config_path())?;
        let vm_config: serde_json::Value = serde_json::from_slice(&config)?;
        let field = |key: &str, default: &str| {
            vm_config
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };
        let mut labels = labels;
        labels.insert(media_types::labels::DISK_FORMAT.to_string(), field("diskFormat", "raw"));
        let digest = push_small_blob(remote, &config, options.retries)?;
        layers.push(Layer::new(media_types::CONFIG, config.len() as u64, digest));

        let disk_size = fs::metadata(self.disk_path())?.len();
        log::info!(
            "Pushing disk ({:.1} GB, format {}), this will take a while",
            disk_size as f64 / 1e9,
            disk_format
        );
        layers.extend(disk_format.push(remote, &self.disk_path(), options, cancel)?);

        log::info!("Pushing NVRAM");
        let nvram = fs::read(self.nvram_path())?;
        let digest = push_small_blob(remote, &nvram, options.retries)?;
        layers.push(Layer::new(media_types::NVRAM, nvram.len() as u64, digest));

        // Registries like Docker Hub refuse manifests without an image config
        let oci_config = OciConfig {
            architecture: field("arch", "arm64"),
            os: field("os", "darwin"),
            config: Some(OciConfigContainer {
                labels: Some(labels),
            }),
        }
        .to_canonical_json()?;
        let digest = push_small_blob(remote, &oci_config, options.retries)?;
        let descriptor = Descriptor {
            media_type: media_types::OCI_CONFIG.to_string(),
            size: oci_config.len() as u64,
            digest,
        };
        let manifest = Manifest::new(descriptor, layers, Some(disk_size), Some(Utc::now()));

        cancel.check()?;
        for reference in references {
            log::info!("Pushing manifest for {}", reference);
            with_retries(options.retries, "Upload of manifest", || {
                remote.push_manifest(reference, &manifest)
            })?;
        }
        manifest.digest()
    }
}

fn push_small_blob(remote: &dyn Remote, data: &[u8], retries: usize) -> Result<Digest> {
    let digest = Digest::from_buf_sha256(data);
    with_retries(retries, "Upload of blob", || remote.push_blob_if_missing(data, &digest))?;
    Ok(digest)
}

/// Download a whole blob into `path` and check it against the layer digest
fn pull_small_blob(remote: &dyn Remote, layer: &Layer, path: &Path, retries: usize) -> Result<()> {
    with_retries(retries, "Download of blob", || {
        let mut file = fs::File::create(path)?;
        remote.pull_blob_to(&layer.digest, &mut file)
    })?;
    let actual = Digest::from_file_sha256(path)?;
    if actual != layer.digest {
        return Err(Error::DigestMismatch {
            expected: layer.digest.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
