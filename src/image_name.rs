use crate::{error::*, Digest};
use regex::Regex;
use std::{fmt, str::FromStr};

/// Tag or digest part of a [RemoteName]
///
/// Tags sort before digests, then by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    pub fn latest() -> Self {
        Reference::Tag("latest".to_string())
    }

    /// Value used in `/v2/<name>/manifests/<reference>`
    pub fn value(&self) -> String {
        match self {
            Reference::Tag(tag) => tag.clone(),
            Reference::Digest(digest) => digest.to_string(),
        }
    }

    /// `:tag` or `@sha256:...`
    pub fn fully_qualified(&self) -> String {
        match self {
            Reference::Tag(tag) => format!(":{}", tag),
            Reference::Digest(digest) => format!("@{}", digest),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fully_qualified())
    }
}

/// Name of a VM image stored in a remote registry
///
/// ```text
/// remote-name ::= host [":" port] "/" namespace [":" tag | "@" digest]
/// namespace   ::= segment ("/" segment)*
/// segment     ::= [a-z0-9_.-]+
/// tag         ::= [a-zA-Z0-9_.-]+
/// digest      ::= "sha256:" [a-f0-9]{64}
/// ```
///
/// Only ASCII is accepted. A name without a registry host (e.g. `debian:latest`)
/// is not a remote name, callers treat the parse failure as "this is a local name".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteName {
    /// Registry host, including `:port` if given
    pub host: String,
    pub namespace: String,
    pub reference: Reference,
}

lazy_static::lazy_static! {
    static ref REMOTE_NAME_RE: Regex = Regex::new(concat!(
        r"^(?P<host>[A-Za-z0-9_.-]+)(?::(?P<port>[0-9]+))?",
        r"/(?P<namespace>[a-z0-9_.-]+(?:/[a-z0-9_.-]+)*)",
        r"(?::(?P<tag>[A-Za-z0-9_.-]+)|@(?P<digest>sha256:[a-f0-9]{64}))?$",
    )).unwrap();
}

impl RemoteName {
    pub fn new(host: &str, namespace: &str, reference: Reference) -> Self {
        RemoteName {
            host: host.to_string(),
            namespace: namespace.to_string(),
            reference,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let err = |reason: String| Error::InvalidRemoteName {
            name: name.to_string(),
            reason,
        };
        if let Some(pos) = name.find(|c: char| !c.is_ascii()) {
            return Err(err(format!("non-ASCII character at position {}", pos + 1)));
        }
        if !name.contains('/') {
            return Err(err("no registry host in name".to_string()));
        }
        let caps = REMOTE_NAME_RE
            .captures(name)
            .ok_or_else(|| err("does not match host[:port]/namespace[:tag|@digest]".to_string()))?;

        let mut host = caps["host"].to_string();
        if let Some(port) = caps.name("port") {
            host.push(':');
            host.push_str(port.as_str());
        }
        let reference = if let Some(tag) = caps.name("tag") {
            Reference::Tag(tag.as_str().to_string())
        } else if let Some(digest) = caps.name("digest") {
            Reference::Digest(Digest::new(digest.as_str())?)
        } else {
            Reference::latest()
        };
        Ok(RemoteName {
            host,
            namespace: caps["namespace"].to_string(),
            reference,
        })
    }

    /// Same repository, pointing to the given manifest digest
    pub fn with_digest(&self, digest: Digest) -> Self {
        RemoteName {
            reference: Reference::Digest(digest),
            ..self.clone()
        }
    }

    pub fn is_digest(&self) -> bool {
        matches!(self.reference, Reference::Digest(_))
    }
}

impl FromStr for RemoteName {
    type Err = Error;
    fn from_str(name: &str) -> Result<Self> {
        RemoteName::parse(name)
    }
}

impl fmt::Display for RemoteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.host, self.namespace, self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn tag() -> Result<()> {
        assert_eq!(
            RemoteName::parse("ghcr.io/a/b:latest")?,
            RemoteName::new("ghcr.io", "a/b", Reference::Tag("latest".to_string()))
        );
        assert_eq!(
            RemoteName::parse("ghcr.io/a/b:1.2.3-RC-1")?,
            RemoteName::new("ghcr.io", "a/b", Reference::Tag("1.2.3-RC-1".to_string()))
        );
        // Default tag
        assert_eq!(
            RemoteName::parse("ghcr.io/cirruslabs/macos")?.reference,
            Reference::latest()
        );
        Ok(())
    }

    #[test]
    fn digest() -> Result<()> {
        let name = RemoteName::parse(&format!("ghcr.io/a/b@{}", EMPTY_SHA256))?;
        assert_eq!(
            name,
            RemoteName::new("ghcr.io", "a/b", Reference::Digest(Digest::new(EMPTY_SHA256)?))
        );
        assert!(name.is_digest());
        assert_eq!(name.to_string(), format!("ghcr.io/a/b@{}", EMPTY_SHA256));

        // Only sha256 with 64 hex characters
        assert!(RemoteName::parse("ghcr.io/a/b@sha256:abcd").is_err());
        assert!(RemoteName::parse("ghcr.io/a/b@md5:abcd").is_err());
        Ok(())
    }

    #[test]
    fn ascii_only() {
        assert!(RemoteName::parse("touché.fr/a/b:latest").is_err());
        assert!(RemoteName::parse("ghcr.io/tou/ché:latest").is_err());
        assert!(RemoteName::parse("ghcr.io/a/b:touché").is_err());
    }

    #[test]
    fn local() {
        assert!(RemoteName::parse("debian:latest").is_err());
        assert!(RemoteName::parse("debian").is_err());
    }

    #[test]
    fn port() -> Result<()> {
        assert_eq!(RemoteName::parse("127.0.0.1:8080/a/b")?.host, "127.0.0.1:8080");
        // Port must be specified when ":" is used
        assert!(RemoteName::parse("127.0.0.1:/a/b").is_err());
        Ok(())
    }

    #[test]
    fn ordering() -> Result<()> {
        let tag = RemoteName::parse("ghcr.io/a/b:zzz")?;
        let digest = RemoteName::parse(&format!("ghcr.io/a/b@{}", EMPTY_SHA256))?;
        let other_ns = RemoteName::parse("ghcr.io/a/a:zzz")?;
        assert!(tag < digest);
        assert!(other_ns < tag);
        Ok(())
    }
}
