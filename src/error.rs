use std::{io, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid user input
    //
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Failed to parse remote name {name:?}: {reason}")]
    InvalidRemoteName { name: String, reason: String },
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported disk format: {0}")]
    UnsupportedDiskFormat(String),

    //
    // Invalid VM image
    //
    #[error(transparent)]
    InvalidJson(#[from] serde_json::error::Error),
    #[error("Layer {digest} is missing the {annotation} annotation")]
    MissingLayerAnnotation {
        digest: String,
        annotation: &'static str,
    },
    #[error("Expected exactly one layer of type {media_type}, found {found}")]
    ShouldBeExactlyOneLayer {
        media_type: &'static str,
        found: usize,
    },
    #[error("Manifest contains no disk layers")]
    ShouldBeAtLeastOneLayer,
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error(transparent)]
    Decompression(#[from] lz4_flex::frame::Error),

    //
    // Error from OCI registry
    //
    #[error(transparent)]
    NetworkError(Box<ureq::Transport>),
    #[error("Unexpected HTTP status code {code} when {when}: {details}")]
    UnexpectedHttpStatus {
        when: &'static str,
        code: u16,
        details: String,
    },
    #[error("Registry response is missing the Location header")]
    MissingLocationHeader,
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),
    #[error("Malformed WWW-Authenticate header: {0}")]
    MalformedHeader(String),

    //
    // Local storage state
    //
    #[error("VM directory is already initialized, preventing overwrite: {0}")]
    AlreadyInitialized(PathBuf),
    #[error("VM {0} does not exist")]
    VmDoesNotExist(String),
    #[error("VM directory {0} is missing some of its files (config.json, disk.img or nvram.bin)")]
    VmMissingFiles(PathBuf),
    #[error("Failed to lock {path}: {source}")]
    LockFailed { path: PathBuf, source: io::Error },
    #[error("Operation was cancelled")]
    Cancelled,

    //
    // System error
    //
    #[error("No valid home directory path could be retrieved from the operating system.")]
    NoValidHomeDirectory,
    #[error(transparent)]
    InvalidToml(#[from] toml::de::Error),
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    UnknownIo(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error came from the network and the operation may succeed when retried
    pub fn is_network(&self) -> bool {
        match self {
            Error::NetworkError(_) => true,
            Error::UnknownIo(e) => is_network_io(e),
            _ => false,
        }
    }
}

pub(crate) fn is_network_io(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionReset | ConnectionAborted | ConnectionRefused | TimedOut | UnexpectedEof | BrokenPipe
    )
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // Errors of this crate tunnelled through `io::Read` come back as themselves
        if e.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            if let Some(Ok(inner)) = e.into_inner().map(|inner| inner.downcast::<Error>()) {
                return *inner;
            }
            return Error::UnknownIo(io::Error::new(io::ErrorKind::Other, "lost wrapped error"));
        }
        Error::UnknownIo(e)
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Self::UnknownIo(e.into())
    }
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(code, res) => Error::UnexpectedHttpStatus {
                when: "talking to the registry",
                code,
                details: res.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(e) => Error::NetworkError(e.into()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::UnknownIo(e) => e,
            e if e.is_network() => io::Error::new(io::ErrorKind::ConnectionReset, e),
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_classification() {
        let reset = Error::UnknownIo(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_network());

        let missing = Error::UnknownIo(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!missing.is_network());

        let mismatch = Error::DigestMismatch {
            expected: "sha256:aa".to_string(),
            actual: "sha256:bb".to_string(),
        };
        assert!(!mismatch.is_network());

        // Round trip through io::Error keeps the classification
        let io: io::Error = reset.into();
        assert!(Error::from(io).is_network());
    }

    #[test]
    fn unwrap_tunnelled_errors() {
        let io: io::Error = Error::Cancelled.into();
        assert!(matches!(Error::from(io), Error::Cancelled));

        let io: io::Error = Error::MissingLocationHeader.into();
        assert!(matches!(Error::from(io), Error::MissingLocationHeader));

        let plain = io::Error::new(io::ErrorKind::NotFound, "plain");
        assert!(matches!(Error::from(plain), Error::UnknownIo(_)));
    }
}
