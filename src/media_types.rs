//! Media types and annotation keys of VM images
//!
//! These are part of the wire format and never negotiated.

/// OCI image manifest, used as `Accept` and `Content-Type` of manifest requests
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image config, the stub config blob referenced by `config` of the manifest
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// VM configuration layer (`config.json`)
pub const CONFIG: &str = "application/vnd.cirruslabs.tart.config.v1";

/// Disk layers of a single LZ4 stream cut into fixed-size pieces
pub const DISK_V1: &str = "application/vnd.cirruslabs.tart.disk.v1";

/// Independently decompressible disk layers with uncompressed size/digest annotations
pub const DISK_V2: &str = "application/vnd.cirruslabs.tart.disk.v2";

/// NVRAM layer (`nvram.bin`)
pub const NVRAM: &str = "application/vnd.cirruslabs.tart.nvram.v1";

pub mod annotations {
    /// Manifest annotation: size of the whole decompressed disk
    pub const UNCOMPRESSED_DISK_SIZE: &str = "org.cirruslabs.tart.uncompressed-disk-size";
    /// Manifest annotation: RFC 3339 time of the push
    pub const UPLOAD_TIME: &str = "org.cirruslabs.tart.upload-time";
    /// Layer annotation: decompressed size of a disk layer
    pub const UNCOMPRESSED_SIZE: &str = "org.cirruslabs.tart.uncompressed-size";
    /// Layer annotation: digest of the decompressed contents of a disk layer
    pub const UNCOMPRESSED_CONTENT_DIGEST: &str = "org.cirruslabs.tart.uncompressed-content-digest";
}

pub mod labels {
    /// OCI config label recording the disk image format of the VM
    pub const DISK_FORMAT: &str = "org.cirruslabs.tart.disk.format";
}
