//! Directory holding one VM: `config.json`, `disk.img` and `nvram.bin`

mod oci;

use crate::{
    error::*, file_lock::FileLock, prune::Prunable, storage, Config, Digest, Manifest,
};
use chrono::{DateTime, Utc};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDirectory {
    base: PathBuf,
}

impl VmDirectory {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        VmDirectory { base: base.into() }
    }

    /// Scratch directory whose name only depends on `key`
    ///
    /// A failed pull of the same image leaves its partial disk here, and the next attempt resumes it.
    pub fn temporary_deterministic(key: &str, config: &Config) -> Result<Self> {
        let hash = Digest::from_buf_sha256(key.as_bytes());
        let base = config.tmp_dir().join(hash.encoded);
        fs::create_dir_all(&base)?;
        Ok(VmDirectory { base })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn name(&self) -> String {
        self.base
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn disk_path(&self) -> PathBuf {
        self.base.join("disk.img")
    }

    pub fn nvram_path(&self) -> PathBuf {
        self.base.join("nvram.bin")
    }

    /// Manifest the VM was pulled with, used as local layer cache by later pulls
    pub fn manifest_path(&self) -> PathBuf {
        self.base.join("manifest.json")
    }

    /// Marker protecting a VM pulled by digest from garbage collection
    pub fn explicitly_pulled_mark(&self) -> PathBuf {
        self.base.join(".explicitly-pulled")
    }

    pub fn initialized(&self) -> bool {
        self.config_path().exists() && self.disk_path().exists() && self.nvram_path().exists()
    }

    /// Create the directory, removing VM files left in it when `overwrite` is set
    pub fn initialize(&self, overwrite: bool) -> Result<()> {
        if !overwrite && self.initialized() {
            return Err(Error::AlreadyInitialized(self.base.clone()));
        }
        fs::create_dir_all(&self.base)?;
        for path in [self.config_path(), self.disk_path(), self.nvram_path()] {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if !self.base.exists() {
            return Err(Error::VmDoesNotExist(name.to_string()));
        }
        if !self.initialized() {
            return Err(Error::VmMissingFiles(self.base.clone()));
        }
        Ok(())
    }

    /// Advisory lock on the directory itself
    pub fn lock(&self) -> Result<FileLock> {
        FileLock::new(&self.base)
    }

    pub fn manifest(&self) -> Result<Option<Manifest>> {
        match fs::read(self.manifest_path()) {
            Ok(buf) => Ok(Some(Manifest::from_json(&buf)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark_explicitly_pulled(&self) -> Result<()> {
        fs::write(self.explicitly_pulled_mark(), b"")?;
        Ok(())
    }

    pub fn is_explicitly_pulled(&self) -> bool {
        self.explicitly_pulled_mark().exists()
    }

    /// Set the access time to now, so age-based pruning keeps this VM
    pub fn touch(&self) -> Result<()> {
        filetime::set_file_atime(&self.base, filetime::FileTime::now())?;
        Ok(())
    }

    /// Logical size of the VM files
    pub fn size(&self) -> Result<u64> {
        let mut size = 0;
        for path in [self.config_path(), self.disk_path(), self.nvram_path()] {
            size += storage::file_size(&path)?;
        }
        Ok(size)
    }
}

impl Prunable for VmDirectory {
    fn path(&self) -> &Path {
        &self.base
    }

    fn access_date(&self) -> Result<DateTime<Utc>> {
        storage::access_date(&self.base)
    }

    fn allocated_size(&self) -> Result<u64> {
        let mut size = 0;
        for path in [self.config_path(), self.disk_path(), self.nvram_path()] {
            size += storage::allocated_size(&path)?;
        }
        Ok(size)
    }

    fn delete(&self) -> Result<()> {
        fs::remove_dir_all(&self.base)?;
        Ok(())
    }
}
