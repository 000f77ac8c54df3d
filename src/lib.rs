//! ocivm
//! =====
//!
//! Distribute virtual machine images through OCI registries and keep them in a local cache.
//!
//! A VM image is a directory with `config.json`, `disk.img` and `nvram.bin`.
//! Pushing turns it into a manifest with a config layer, compressed disk layers and an NVRAM layer.
//! Pulling reassembles the directory, resuming interrupted transfers and reusing layers
//! of images which are already cached.

pub mod config;
pub mod distribution;
pub mod error;
pub mod layerizer;
pub mod local_layer_cache;
pub mod manifest;
pub mod media_types;
pub mod prune;
pub mod storage;

mod cancel;
mod digest;
mod file_lock;
mod image_name;
mod vm_directory;

pub use cancel::Cancellation;
pub use config::Config;
pub use digest::Digest;
pub use file_lock::FileLock;
pub use image_name::{Reference, RemoteName};
pub use manifest::{Layer, Manifest};
pub use storage::{IpswCache, OciStorage};
pub use vm_directory::VmDirectory;
