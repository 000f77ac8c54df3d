//! Manifest describing a VM image: a stub OCI config plus ordered layers

use crate::{
    error::*,
    media_types::{self, annotations},
    Digest,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Reference to the stub OCI config blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub media_type: String,
    /// Compressed byte count on the wire
    pub size: u64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Layer {
    pub fn new(media_type: &str, size: u64, digest: Digest) -> Self {
        Layer {
            media_type: media_type.to_string(),
            size,
            digest,
            annotations: None,
        }
    }

    /// Disk layer carrying the uncompressed size and content digest annotations
    pub fn disk_v2(size: u64, digest: Digest, uncompressed_size: u64, uncompressed_digest: &Digest) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            annotations::UNCOMPRESSED_SIZE.to_string(),
            uncompressed_size.to_string(),
        );
        annotations.insert(
            annotations::UNCOMPRESSED_CONTENT_DIGEST.to_string(),
            uncompressed_digest.to_string(),
        );
        Layer {
            media_type: media_types::DISK_V2.to_string(),
            size,
            digest,
            annotations: Some(annotations),
        }
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }

    pub fn uncompressed_size(&self) -> Option<u64> {
        self.annotation(annotations::UNCOMPRESSED_SIZE)?.parse().ok()
    }

    pub fn uncompressed_content_digest(&self) -> Option<&str> {
        self.annotation(annotations::UNCOMPRESSED_CONTENT_DIGEST)
    }

    /// Like [Layer::uncompressed_size] but missing annotation is an error
    pub fn require_uncompressed_size(&self) -> Result<u64> {
        self.uncompressed_size()
            .ok_or_else(|| Error::MissingLayerAnnotation {
                digest: self.digest.to_string(),
                annotation: annotations::UNCOMPRESSED_SIZE,
            })
    }

    /// Like [Layer::uncompressed_content_digest] but missing annotation is an error
    pub fn require_uncompressed_content_digest(&self) -> Result<&str> {
        self.uncompressed_content_digest()
            .ok_or_else(|| Error::MissingLayerAnnotation {
                digest: self.digest.to_string(),
                annotation: annotations::UNCOMPRESSED_CONTENT_DIGEST,
            })
    }
}

impl Manifest {
    pub fn new(
        config: Descriptor,
        layers: Vec<Layer>,
        uncompressed_disk_size: Option<u64>,
        upload_time: Option<DateTime<Utc>>,
    ) -> Self {
        let mut annotations = BTreeMap::new();
        if let Some(size) = uncompressed_disk_size {
            annotations.insert(annotations::UNCOMPRESSED_DISK_SIZE.to_string(), size.to_string());
        }
        if let Some(time) = upload_time {
            annotations.insert(
                annotations::UPLOAD_TIME.to_string(),
                time.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        Manifest {
            schema_version: 2,
            media_type: media_types::OCI_MANIFEST.to_string(),
            config,
            layers,
            annotations: Some(annotations),
        }
    }

    pub fn from_json(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }

    /// Canonical encoding with keys sorted at every level
    ///
    /// This is what gets pushed, so hashing these bytes gives the digest the registry stores.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        // serde_json::Map is ordered by key
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }

    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::from_buf_sha256(&self.to_canonical_json()?))
    }

    pub fn uncompressed_disk_size(&self) -> Option<u64> {
        self.annotations
            .as_ref()?
            .get(annotations::UNCOMPRESSED_DISK_SIZE)?
            .parse()
            .ok()
    }

    pub fn layers_of<'a>(&'a self, media_type: &'a str) -> impl Iterator<Item = &'a Layer> + 'a {
        self.layers.iter().filter(move |layer| layer.media_type == media_type)
    }

    /// The single layer of the given media type, e.g. config or NVRAM
    pub fn single_layer(&self, media_type: &'static str) -> Result<&Layer> {
        let mut layers = self.layers_of(media_type);
        match (layers.next(), layers.count()) {
            (Some(layer), 0) => Ok(layer),
            (first, rest) => Err(Error::ShouldBeExactlyOneLayer {
                media_type,
                found: first.map_or(0, |_| 1 + rest),
            }),
        }
    }
}

/// Stub OCI image config pushed for registries which insist on a real image config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciConfig {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<OciConfigContainer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciConfigContainer {
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl OciConfig {
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }
}
