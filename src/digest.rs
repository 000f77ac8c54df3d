use crate::error::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{
    fmt, fs,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    str::FromStr,
};

/// Digest of contents
///
/// Digest is defined in [OCI image spec](https://github.com/opencontainers/image-spec/blob/v1.0.1/descriptor.md#digests)
/// as a string satisfies following EBNF:
///
/// ```text
/// digest                ::= algorithm ":" encoded
/// algorithm             ::= algorithm-component (algorithm-separator algorithm-component)*
/// algorithm-component   ::= [a-z0-9]+
/// algorithm-separator   ::= [+._-]
/// encoded               ::= [a-zA-Z0-9=_-]+
/// ```
///
/// Everything this crate produces is SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    pub algorithm: String,
    pub encoded: String,
}

lazy_static::lazy_static! {
    static ref ALGORITHM_RE: Regex = Regex::new(r"^[a-z0-9]+([+._-][a-z0-9]+)*$").unwrap();
    static ref ENCODED_RE: Regex = Regex::new(r"^[a-zA-Z0-9=_-]+$").unwrap();
    static ref SHA256_RE: Regex = Regex::new(r"^[a-f0-9]{64}$").unwrap();
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        Digest::new(input)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::new(&s).map_err(serde::de::Error::custom)
    }
}

impl Digest {
    pub fn new(input: &str) -> Result<Self> {
        let (algorithm, encoded) = input
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(input.to_string()))?;
        if !ALGORITHM_RE.is_match(algorithm) || !ENCODED_RE.is_match(encoded) {
            return Err(Error::InvalidDigest(input.to_string()));
        }
        if algorithm == "sha256" && !SHA256_RE.is_match(encoded) {
            return Err(Error::InvalidDigest(input.to_string()));
        }
        Ok(Digest {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_string(),
        })
    }

    /// Calc digest using SHA-256 algorithm
    pub fn from_buf_sha256(buf: &[u8]) -> Self {
        let hash = Sha256::digest(buf);
        Self::from_sha256_output(&hash)
    }

    /// Hash `size` bytes of the file starting at `offset`
    ///
    /// Reading stops early at the end of file, so a short file hashes to whatever bytes it has.
    pub fn from_file_range_sha256(path: &Path, offset: u64, size: u64) -> Result<Self> {
        let mut f = fs::File::open(path)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut hasher = Hasher::new();
        io::copy(&mut f.take(size), &mut hasher)?;
        Ok(hasher.finalize())
    }

    /// Hash a whole file
    pub fn from_file_sha256(path: &Path) -> Result<Self> {
        let mut f = fs::File::open(path)?;
        let mut hasher = Hasher::new();
        io::copy(&mut f, &mut hasher)?;
        Ok(hasher.finalize())
    }

    fn from_sha256_output(hash: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            encoded: base16ct::lower::encode_string(hash),
        }
    }
}

/// Incremental SHA-256 hasher producing a [Digest]
#[derive(Default, Clone)]
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest::from_sha256_output(&self.0.finalize())
    }
}

impl io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
