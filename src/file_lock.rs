//! Advisory whole-file locks shared between processes

use crate::error::*;
use fs4::FileExt;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Exclusive `flock`-style lock on a file or directory
///
/// The lock is released when the value is dropped, or explicitly with [FileLock::unlock].
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: fs::File,
}

impl FileLock {
    /// Open `path` for locking, it must already exist
    pub fn new(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).map_err(|source| Error::LockFailed {
            path: path.to_owned(),
            source,
        })?;
        Ok(FileLock {
            path: path.to_owned(),
            file,
        })
    }

    /// Take the lock without waiting, `false` if someone else holds it
    pub fn try_lock(&self) -> Result<bool> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(source) => Err(self.failed(source)),
        }
    }

    /// Block until the lock is ours
    pub fn lock(&self) -> Result<()> {
        self.file.lock_exclusive().map_err(|source| self.failed(source))
    }

    pub fn unlock(&self) -> Result<()> {
        FileExt::unlock(&self.file).map_err(|source| self.failed(source))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failed(&self, source: std::io::Error) -> Error {
        Error::LockFailed {
            path: self.path.clone(),
            source,
        }
    }
}
