use super::IpswCache;
use crate::{
    cancel::Cancellation,
    distribution::Remote,
    error::*,
    file_lock::FileLock,
    layerizer::{with_retries, PullOptions},
    local_layer_cache::LocalLayerCache,
    media_types,
    prune::{self, Prunable, PrunableStorage},
    Config, Digest, Manifest, Reference, RemoteName, VmDirectory,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};

/// Characters of a registry host escaped in directory names, e.g. the `:` before a port
const HOST_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'-').remove(b'_');

/// Room for `config.json` and `nvram.bin` next to the disk
const OTHER_VM_FILES_SIZE: u64 = 128 * 1024 * 1024;

/// Images pulled from registries
///
/// ```text
/// <root>/<percent-encoded host>/<namespace...>/sha256:<hex>   VM directory
/// <root>/<percent-encoded host>/<namespace...>/<tag>          symlink to a digest directory
/// ```
#[derive(Debug, Clone)]
pub struct OciStorage {
    root: PathBuf,
    config: Config,
}

/// Cached image found by [OciStorage::list]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: RemoteName,
    pub vm: VmDirectory,
    /// Tag link rather than a digest directory
    pub is_symlink: bool,
}

impl OciStorage {
    pub fn new(config: &Config) -> Result<Self> {
        let root = config.oci_dir();
        fs::create_dir_all(&root)?;
        Ok(OciStorage {
            root,
            config: config.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vm_path(&self, name: &RemoteName) -> PathBuf {
        let mut path = self.host_path(&name.host);
        for segment in name.namespace.split('/') {
            path.push(segment);
        }
        path.push(name.reference.value());
        path
    }

    fn host_path(&self, host: &str) -> PathBuf {
        self.root
            .join(utf8_percent_encode(host, HOST_ENCODE_SET).to_string())
    }

    pub fn exists(&self, name: &RemoteName) -> bool {
        VmDirectory::new(self.vm_path(name)).initialized()
    }

    /// Validated VM directory of `name`, marked as just used
    pub fn open(&self, name: &RemoteName) -> Result<VmDirectory> {
        let vm = VmDirectory::new(self.vm_path(name));
        vm.validate(&name.to_string())?;
        vm.touch()?;
        Ok(vm)
    }

    pub fn create(&self, name: &RemoteName, overwrite: bool) -> Result<VmDirectory> {
        let vm = VmDirectory::new(self.vm_path(name));
        vm.initialize(overwrite)?;
        Ok(vm)
    }

    /// Rename a fully populated directory into place as `name`
    pub fn move_into(&self, name: &RemoteName, from: &VmDirectory) -> Result<()> {
        let target = self.vm_path(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_entry(&target)?;
        fs::rename(from.base_dir(), &target)?;
        Ok(())
    }

    pub fn delete(&self, name: &RemoteName) -> Result<()> {
        let path = self.vm_path(name);
        if fs::symlink_metadata(&path).is_err() {
            return Err(Error::VmDoesNotExist(name.to_string()));
        }
        remove_entry(&path)?;
        self.gc()
    }

    /// Point the tag `from` to the digest directory `to`, replacing a previous link
    pub fn link(&self, from: &RemoteName, to: &RemoteName) -> Result<()> {
        let path = self.vm_path(from);
        remove_entry(&path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(self.vm_path(to), &path)?;
        self.gc()
    }

    /// Give the cached image `source` the additional tag `target`
    pub fn tag(&self, source: &RemoteName, target: &RemoteName) -> Result<()> {
        if target.is_digest() {
            return Err(Error::InvalidRemoteName {
                name: target.to_string(),
                reason: "cannot tag with a digest".to_string(),
            });
        }
        self.open(source)?;
        let resolved = fs::canonicalize(self.vm_path(source))?;
        let path = self.vm_path(target);
        remove_entry(&path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(resolved, &path)?;
        self.gc()
    }

    pub fn is_linked(&self, from: &RemoteName, to: &RemoteName) -> bool {
        match (
            fs::canonicalize(self.vm_path(from)),
            fs::canonicalize(self.vm_path(to)),
        ) {
            (Ok(from), Ok(to)) => from == to,
            _ => false,
        }
    }

    /// Remove broken tag links, then digest directories nothing links to
    ///
    /// Directories pulled by digest carry a marker and are kept without links.
    pub fn gc(&self) -> Result<()> {
        let mut links: HashMap<PathBuf, usize> = HashMap::new();
        let mut walker = walkdir::WalkDir::new(&self.root).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let path = entry.path();
            if entry.path_is_symlink() {
                match fs::canonicalize(path) {
                    Ok(resolved) => {
                        if VmDirectory::new(&resolved).initialized() {
                            *links.entry(resolved).or_default() += 1;
                        }
                    }
                    Err(_) => {
                        log::info!("Removing broken link {}", path.display());
                        fs::remove_file(path)?;
                    }
                }
                continue;
            }
            if entry.file_type().is_dir() && VmDirectory::new(path).initialized() {
                walker.skip_current_dir();
                links.entry(fs::canonicalize(path)?).or_default();
            }
        }

        for (path, count) in links {
            let vm = VmDirectory::new(&path);
            if count == 0 && !vm.is_explicitly_pulled() {
                log::info!("Removing {}, no tag refers to it", path.display());
                vm.delete()?;
            }
        }
        Ok(())
    }

    /// Cached images sorted by name, tag links and digest directories alike
    pub fn list(&self) -> Result<Vec<ListEntry>> {
        let mut entries = Vec::new();
        let mut walker = walkdir::WalkDir::new(&self.root).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let is_symlink = entry.path_is_symlink();
            let vm = VmDirectory::new(entry.path());
            if !(is_symlink || entry.file_type().is_dir()) || !vm.initialized() {
                continue;
            }
            if !is_symlink {
                walker.skip_current_dir();
            }
            match self.name_of(entry.path(), is_symlink) {
                Some(name) => entries.push(ListEntry {
                    name,
                    vm,
                    is_symlink,
                }),
                None => log::warn!("Ignoring unexpected entry {}", entry.path().display()),
            }
        }
        entries.sort_by_cached_key(|entry| entry.name.to_string());
        Ok(entries)
    }

    /// Inverse of [OciStorage::vm_path]
    fn name_of(&self, path: &Path, is_symlink: bool) -> Option<RemoteName> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        if components.len() < 3 {
            return None;
        }
        let last = components.pop()?;
        let host = percent_decode_str(components.remove(0)).decode_utf8().ok()?;
        let reference = if is_symlink {
            Reference::Tag(last.to_string())
        } else {
            Reference::Digest(Digest::new(last).ok()?)
        };
        Some(RemoteName::new(&host, &components.join("/"), reference))
    }

    /// Cached image sharing the most disk layers with `manifest`, if it saves enough to be worth it
    ///
    /// Overlap is the compressed size of the distinct shared layers. The first candidate wins a tie.
    pub fn choose_local_layer_cache(&self, manifest: &Manifest) -> Result<Option<LocalLayerCache>> {
        let target: HashSet<&Digest> = manifest
            .layers_of(media_types::DISK_V2)
            .map(|layer| &layer.digest)
            .collect();
        if target.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(u64, ListEntry, Manifest)> = None;
        for entry in self.list()? {
            if entry.is_symlink {
                continue;
            }
            let candidate = match entry.vm.manifest() {
                Ok(Some(candidate)) => candidate,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Ignoring manifest of {}: {}", entry.name, e);
                    continue;
                }
            };
            let mut seen = HashSet::new();
            let overlap: u64 = candidate
                .layers_of(media_types::DISK_V2)
                .filter(|layer| target.contains(&layer.digest) && seen.insert(&layer.digest))
                .map(|layer| layer.size)
                .sum();
            log::debug!("{} shares {} bytes of layers", entry.name, overlap);
            if best.as_ref().map_or(true, |(max, _, _)| overlap > *max) {
                best = Some((overlap, entry, candidate));
            }
        }

        match best {
            Some((overlap, entry, candidate))
                if overlap > 0 && overlap >= self.config.settings.min_dedup_savings_bytes =>
            {
                log::info!("Using {} as local layer cache, sharing {} bytes", entry.name, overlap);
                Ok(Some(LocalLayerCache::new(
                    &entry.name.to_string(),
                    &entry.vm.disk_path(),
                    &candidate,
                )?))
            }
            _ => Ok(None),
        }
    }

    /// Fetch `name` from the registry into the cache
    ///
    /// The image lands in its digest directory, and a tag `name` becomes a link to it.
    /// A failed pull keeps its temporary directory so the next attempt resumes it.
    /// A cancelled pull removes it and leaves the cache as it was.
    pub fn pull(
        &self,
        name: &RemoteName,
        remote: &dyn Remote,
        concurrency: usize,
        deduplicate: bool,
        cancel: &Cancellation,
    ) -> Result<()> {
        let retries = self.config.settings.pull_retries;
        log::info!("Pulling manifest of {}", name);
        let (manifest, raw) = with_retries(retries, "Download of manifest", || {
            remote.pull_manifest(&name.reference)
        })?;
        let digest_name = name.with_digest(Digest::from_buf_sha256(&raw));

        if self.exists(name)
            && self.exists(&digest_name)
            && (*name == digest_name || self.is_linked(name, &digest_name))
        {
            log::info!("{} is up to date", name);
            if *name == digest_name {
                // May have been cached through a tag until now, pin it
                VmDirectory::new(self.vm_path(&digest_name)).mark_explicitly_pulled()?;
            }
            self.open(name)?;
            return Ok(());
        }

        // Pulls from one host are serialized across processes
        let host_dir = self.host_path(&name.host);
        fs::create_dir_all(&host_dir)?;
        let host_lock = FileLock::new(&host_dir)?;
        if !host_lock.try_lock()? {
            log::info!("Waiting for another pull from {} to finish", name.host);
            host_lock.lock()?;
        }

        if self.exists(&digest_name) {
            log::info!("{} is already cached", digest_name);
        } else {
            self.pull_into_cache(name, &digest_name, &manifest, remote, concurrency, deduplicate, cancel)?;
        }

        if *name != digest_name {
            self.link(name, &digest_name)?;
        } else {
            VmDirectory::new(self.vm_path(&digest_name)).mark_explicitly_pulled()?;
        }
        host_lock.unlock()?;
        self.open(name)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn pull_into_cache(
        &self,
        name: &RemoteName,
        digest_name: &RemoteName,
        manifest: &Manifest,
        remote: &dyn Remote,
        concurrency: usize,
        deduplicate: bool,
        cancel: &Cancellation,
    ) -> Result<()> {
        let tmp = VmDirectory::temporary_deterministic(&name.to_string(), &self.config)?;
        let tmp_lock = tmp.lock()?;
        if !tmp_lock.try_lock()? {
            return Err(Error::LockFailed {
                path: tmp.base_dir().to_owned(),
                source: io::Error::new(io::ErrorKind::WouldBlock, "used by another pull"),
            });
        }
        // Our own directory is locked and survives
        super::gc_temporary_dirs(&self.config)?;

        let result = self.pull_locked(&tmp, manifest, remote, concurrency, deduplicate, cancel);
        match result {
            Ok(()) => {
                if name.is_digest() {
                    tmp.mark_explicitly_pulled()?;
                }
                self.move_into(digest_name, &tmp)?;
                log::info!("Cached {}", digest_name);
                Ok(())
            }
            Err(Error::Cancelled) => {
                log::info!("Pull cancelled, removing {}", tmp.base_dir().display());
                drop(tmp_lock);
                tmp.delete()?;
                Err(Error::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    fn pull_locked(
        &self,
        tmp: &VmDirectory,
        manifest: &Manifest,
        remote: &dyn Remote,
        concurrency: usize,
        deduplicate: bool,
        cancel: &Cancellation,
    ) -> Result<()> {
        if self.config.settings.auto_prune {
            if let Some(disk_size) = manifest.uncompressed_disk_size() {
                let available = fs4::available_space(&self.root)?;
                let ipsw = IpswCache::new(&self.config)?;
                let storages: [&dyn PrunableStorage; 2] = [self, &ipsw];
                let pruned = prune::reclaim_if_needed(
                    &storages,
                    disk_size + OTHER_VM_FILES_SIZE,
                    available,
                    Some(tmp.base_dir()),
                )?;
                if !pruned.is_empty() {
                    self.gc()?;
                }
            }
        }

        let local_layer_cache = self.choose_local_layer_cache(manifest)?;
        let options = PullOptions {
            concurrency,
            retries: self.config.settings.pull_retries,
            local_layer_cache: local_layer_cache.as_ref(),
            deduplicate,
            cancel,
        };
        with_retries(self.config.settings.pull_retries, "Pull", || {
            tmp.pull_from_registry(remote, manifest, &options)
        })?;
        cancel.check()
    }
}

impl PrunableStorage for OciStorage {
    /// Digest directories only, tag links go away with them on the next [OciStorage::gc]
    fn prunables(&self) -> Result<Vec<Box<dyn Prunable>>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|entry| !entry.is_symlink)
            .map(|entry| Box::new(entry.vm) as Box<dyn Prunable>)
            .collect())
    }
}

/// Remove a link or a directory, nothing to do if absent
fn remove_entry(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn is_not_found(e: &walkdir::Error) -> bool {
    e.io_error()
        .map_or(false, |e| e.kind() == io::ErrorKind::NotFound)
}
