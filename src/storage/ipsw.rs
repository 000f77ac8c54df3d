use crate::{
    error::*,
    prune::{Prunable, PrunableStorage},
    Config,
};
use chrono::{DateTime, Utc};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Downloaded macOS restore images, kept for reuse by later VM creation
#[derive(Debug, Clone)]
pub struct IpswCache {
    dir: PathBuf,
}

impl IpswCache {
    pub fn new(config: &Config) -> Result<Self> {
        let dir = config.ipsw_dir();
        fs::create_dir_all(&dir)?;
        Ok(IpswCache { dir })
    }
}

/// Single cached file
#[derive(Debug, Clone)]
pub struct PrunableFile {
    path: PathBuf,
}

impl PrunableFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PrunableFile { path: path.into() }
    }
}

impl Prunable for PrunableFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn access_date(&self) -> Result<DateTime<Utc>> {
        super::access_date(&self.path)
    }

    fn allocated_size(&self) -> Result<u64> {
        super::allocated_size(&self.path)
    }

    fn delete(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl PrunableStorage for IpswCache {
    fn prunables(&self) -> Result<Vec<Box<dyn Prunable>>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut prunables: Vec<Box<dyn Prunable>> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "ipsw") {
                prunables.push(Box::new(PrunableFile::new(path)));
            }
        }
        Ok(prunables)
    }
}
