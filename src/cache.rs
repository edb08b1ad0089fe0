//! Cache consistency engine.
//!
//! Decides when the local mirror of a path is missing or stale, talks to the remote
//! host through the connection pool when it is, and keeps the metadata tree in step
//! with what it finds. All per-path work runs under the tree lock.

use std::collections::HashSet;
use std::fs::{self, DirBuilder, Metadata, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use log::{debug, error, info, trace, warn};
use walkdir::WalkDir;

use crate::bulk::BulkTransfer;
use crate::config::Config;
use crate::epoch::{RefreshEpoch, EPOCH_MARKER};
use crate::error::{Error, Result};
use crate::metadata::{MetadataEntry, MetadataTree};
use crate::path;
use crate::pool::ConnectionPool;
use crate::remote::{Connector, RemoteDirEntry, RemoteSession};
use crate::stat::{unix_secs, FileKind, StatAttributes, S_IWUSR};

/// Cached copies whose mtime is within this many seconds of the remote are current.
const MTIME_TOLERANCE_SECS: i64 = 1;

pub struct CacheEngine<C: Connector> {
    pub(crate) config: Arc<Config>,
    pub(crate) tree: MetadataTree,
    pub(crate) pool: Option<Arc<ConnectionPool<C>>>,
    pub(crate) bulk: Option<Arc<dyn BulkTransfer>>,
    pub(crate) epoch: RefreshEpoch,
}

/// Stat stored with negative entries.
pub(crate) fn placeholder_stat() -> StatAttributes {
    StatAttributes::new(FileKind::RegularFile, 0, 0, UNIX_EPOCH)
}

pub(crate) fn remove_local(local: &Path) -> io::Result<()> {
    match fs::symlink_metadata(local) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(local),
        Ok(_) => fs::remove_file(local),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Run `op` on a path whose parent directory may lack owner write permission,
/// granting it for the duration.
fn with_writable_parent<T>(local: &Path, op: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
    let parent = match local.parent() {
        Some(parent) => parent,
        None => return op(),
    };
    let mode = fs::metadata(parent)?.permissions().mode();
    let locked = mode & S_IWUSR == 0;
    if locked {
        fs::set_permissions(parent, Permissions::from_mode(mode | S_IWUSR))?;
    }
    let result = op();
    if locked {
        fs::set_permissions(parent, Permissions::from_mode(mode))?;
    }
    result
}

fn is_marker(cache_root: &Path, local: &Path) -> bool {
    local == cache_root.join(EPOCH_MARKER)
}

impl<C: Connector> CacheEngine<C> {
    /// Engine backed by a live remote. The mount root is stat'ed up front.
    pub fn online(
        config: Arc<Config>,
        pool: Arc<ConnectionPool<C>>,
        bulk: Arc<dyn BulkTransfer>,
    ) -> Result<Self> {
        fs::create_dir_all(config.cache_root())?;
        let epoch = RefreshEpoch::new(config.cache_root());
        epoch.current()?;
        let root = config.remote_root().to_string();
        let root_stat = pool.with_session(|s| s.stat(&root))?;
        if !root_stat.is_dir() {
            return Err(Error::NotADirectory(root));
        }
        info!("mounted {} from {}", root, pool.connector().describe());
        Ok(CacheEngine {
            tree: MetadataTree::new(root_stat),
            epoch,
            pool: Some(pool),
            bulk: Some(bulk),
            config,
        })
    }

    /// Engine serving an existing cache without any remote access.
    pub fn offline(config: Arc<Config>) -> Result<Self> {
        let meta = fs::symlink_metadata(config.cache_root())?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(
                config.cache_root().display().to_string(),
            ));
        }
        info!("serving {:?} offline", config.cache_root());
        Ok(CacheEngine {
            tree: MetadataTree::new(StatAttributes::from_metadata(&meta)),
            epoch: RefreshEpoch::new(config.cache_root()),
            pool: None,
            bulk: None,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tree(&self) -> &MetadataTree {
        &self.tree
    }

    pub(crate) fn pool(&self) -> Result<&ConnectionPool<C>> {
        self.pool
            .as_deref()
            .ok_or_else(|| Error::NotConnected("cache is offline".to_string()))
    }

    fn bulk(&self) -> Result<&dyn BulkTransfer> {
        self.bulk
            .as_deref()
            .ok_or_else(|| Error::NotConnected("cache is offline".to_string()))
    }

    /// Record `path` in the tree, tolerating an unknown parent.
    pub(crate) fn record(&self, relative: &str, stat: StatAttributes, negative: bool) {
        if let Err(e) = self.tree.add(relative, stat, None, negative) {
            debug!("not recording {}: {}", relative, e);
        }
    }

    /// Stat attributes of a path, asking the remote only on a tree miss.
    pub fn lookup(&self, relative: &str) -> Result<MetadataEntry> {
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        if let Some(entry) = self.tree.find(&relative) {
            if entry.negative {
                trace!("negative entry for {}", relative);
                return Err(Error::NotFound(relative));
            }
            return Ok(entry);
        }

        let parent = self.lookup(path::parent(&relative))?;
        if !parent.stat.is_dir() {
            return Err(Error::NotADirectory(path::parent(&relative).to_string()));
        }

        let found = if self.config.is_offline() {
            fs::symlink_metadata(self.config.cache_path(&relative))
                .map(|meta| StatAttributes::from_metadata(&meta))
                .map_err(Error::from)
        } else {
            let remote = self.config.remote_path(&relative);
            self.pool()?.with_session(|s| s.stat(&remote))
        };

        match found {
            Ok(stat) => {
                if stat.is_dir() && !self.config.is_offline() {
                    self.make_cache_dir(&relative, &stat)?;
                }
                self.tree.add(&relative, stat, None, false)?;
                self.tree
                    .find(&relative)
                    .ok_or(Error::NotFound(relative))
            }
            Err(e) if e.is_not_found() => {
                debug!("{} does not exist", relative);
                self.tree.add(&relative, placeholder_stat(), None, true)?;
                Err(Error::NotFound(relative))
            }
            Err(e) => {
                error!("stat of {} failed: {}", relative, e);
                Err(e)
            }
        }
    }

    /// Whether a directory's listing in the tree can be served as is.
    pub fn is_populated(&self, entry: &MetadataEntry) -> Result<bool> {
        let enumerated = match entry.enumeration_time {
            Some(time) => time,
            None => return Ok(false),
        };
        if !self.config.refresh_dir_entries {
            return Ok(true);
        }
        Ok(enumerated >= self.epoch.current()?)
    }

    /// Positive children of a directory, enumerating it first if needed.
    pub fn list_children(&self, relative: &str) -> Result<Vec<MetadataEntry>> {
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let entry = self.lookup(&relative)?;
        if !entry.stat.is_dir() {
            return Err(Error::NotADirectory(relative));
        }
        if self.is_populated(&entry)? {
            debug!("{} already populated", relative);
        } else {
            self.populate_dir(&relative)?;
        }
        Ok(self
            .tree
            .find_children(&relative)
            .into_iter()
            .filter(|child| !child.negative)
            .collect())
    }

    fn read_listing(&self, relative: &str) -> Result<Vec<RemoteDirEntry>> {
        if self.config.is_offline() {
            let local = self.config.cache_path(relative);
            let mut entries = Vec::new();
            for dirent in fs::read_dir(&local)? {
                let dirent = dirent?;
                if is_marker(self.config.cache_root(), &dirent.path()) {
                    continue;
                }
                let meta = fs::symlink_metadata(dirent.path())?;
                entries.push(RemoteDirEntry {
                    name: dirent.file_name().to_string_lossy().into_owned(),
                    stat: StatAttributes::from_metadata(&meta),
                });
            }
            return Ok(entries);
        }

        let remote = self.config.remote_path(relative);
        self.pool()?.with_session(|s| {
            s.open_dir(&remote)?;
            let mut entries = Vec::new();
            while let Some(entry) = s.next_dir_entry()? {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                entries.push(entry);
            }
            Ok(entries)
        })
    }

    /// Enumerate a directory in full and replace its children in the tree. A
    /// failed listing leaves the tree as it was.
    pub fn populate_dir(&self, relative: &str) -> Result<()> {
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let stamp = if self.config.refresh_dir_entries {
            self.epoch.current()?
        } else {
            SystemTime::now()
        };

        let listing = self.read_listing(&relative).map_err(|e| {
            error!("listing {} failed: {}", relative, e);
            e
        })?;
        debug!("populating {} with {} entries", relative, listing.len());

        if !self.config.is_offline() {
            for entry in listing.iter().filter(|entry| entry.stat.is_dir()) {
                self.make_cache_dir(&path::join(&relative, &entry.name), &entry.stat)?;
            }
        }

        let mut names = HashSet::with_capacity(listing.len());
        for entry in listing {
            self.tree
                .add(&path::join(&relative, &entry.name), entry.stat, None, false)?;
            names.insert(entry.name);
        }
        let pruned = self.tree.prune_children(&relative, &names);
        if pruned > 0 {
            debug!("pruned {} stale entries of {}", pruned, relative);
        }

        let stat = match self.tree.find(&relative) {
            Some(entry) => entry.stat,
            None => return Err(Error::NotFound(relative)),
        };
        self.tree.add(&relative, stat, Some(stamp), false)
    }

    fn make_cache_dir(&self, relative: &str, stat: &StatAttributes) -> Result<()> {
        let local = self.config.cache_path(relative);
        match fs::symlink_metadata(&local) {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => fs::remove_file(&local)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        DirBuilder::new()
            .recursive(true)
            .mode(stat.perm | S_IWUSR)
            .create(&local)?;
        Ok(())
    }

    /// Local path of a cached copy, downloading or re-validating it first.
    pub fn ensure_cached(&self, relative: &str) -> Result<std::path::PathBuf> {
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let entry = self.lookup(&relative)?;
        let local = self.config.cache_path(&relative);
        match fs::symlink_metadata(&local) {
            Ok(_) => {
                if self.config.refresh_opened_files && !entry.stat.is_dir() {
                    self.refresh_if_stale(&relative, None)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.config.is_offline() {
                    return Err(Error::NotFound(relative));
                }
                self.cache_file(&relative, &entry.stat)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(local)
    }

    /// Copy one remote entry into the cache tree.
    pub fn cache_file(&self, relative: &str, stat: &StatAttributes) -> Result<()> {
        let relative = path::normalize(relative);
        let local = self.config.cache_path(&relative);
        if let Some(parent) = local.parent() {
            DirBuilder::new().recursive(true).mode(0o777).create(parent)?;
        }

        match stat.kind {
            FileKind::Directory => return self.make_cache_dir(&relative, stat),
            FileKind::Symlink => return self.cache_symlink(&relative, &local, stat),
            FileKind::RegularFile => {
                let fetched = if stat.size > self.config.large_file_threshold {
                    info!("fetching {} ({} bytes) in bulk", relative, stat.size);
                    self.bulk()?.bulk_fetch(&relative)
                } else {
                    self.download(&relative, &local)
                };
                if let Err(e) = fetched {
                    error!("caching {} failed: {}", relative, e);
                    if let Err(rm) = remove_local(&local) {
                        warn!("could not remove partial {:?}: {}", local, rm);
                    }
                    return Err(e);
                }
            }
            kind => {
                return Err(Error::Unsupported(format!("{} is a {:?}", relative, kind)));
            }
        }

        fs::set_permissions(&local, Permissions::from_mode(stat.perm | S_IWUSR))?;
        filetime::set_file_times(
            &local,
            FileTime::from_system_time(stat.atime),
            FileTime::from_system_time(stat.mtime),
        )?;
        debug!("cached {}", relative);
        Ok(())
    }

    fn download(&self, relative: &str, local: &Path) -> Result<()> {
        let remote = self.config.remote_path(relative);
        let chunk = self.config.transfer_chunk_size.max(1);
        self.pool()?.with_session(|s| {
            s.open_read(&remote)?;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(local)?;
            let mut buf = vec![0u8; chunk];
            let mut total = 0u64;
            loop {
                let n = s.read_next(&mut buf)?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])?;
                total += n as u64;
            }
            file.sync_all()?;
            trace!("downloaded {} bytes of {}", total, remote);
            Ok(())
        })
    }

    fn cache_symlink(&self, relative: &str, local: &Path, stat: &StatAttributes) -> Result<()> {
        let remote = self.config.remote_path(relative);
        let target = self.pool()?.with_session(|s| s.read_link(&remote))?;
        match fs::remove_file(local) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(&target, local)?;
        if let Err(e) = filetime::set_symlink_file_times(
            local,
            FileTime::from_system_time(stat.atime),
            FileTime::from_system_time(stat.mtime),
        ) {
            error!("setting times on link {:?} failed: {}", local, e);
            let _ = fs::remove_file(local);
            return Err(e.into());
        }
        debug!("cached link {} -> {}", relative, target);
        Ok(())
    }

    /// Bump the ctime of a cached copy without changing it, marking it validated
    /// for the current epoch.
    fn touch(local: &Path, meta: &Metadata) -> io::Result<()> {
        if meta.file_type().is_symlink() {
            std::os::unix::fs::lchown(local, Some(meta.uid()), Some(meta.gid()))
        } else {
            fs::set_permissions(local, Permissions::from_mode((meta.mode() & 0o7777) | S_IWUSR))
        }
    }

    /// Re-validate a cached copy against the remote once per refresh epoch.
    pub fn refresh_if_stale(&self, relative: &str, known: Option<StatAttributes>) -> Result<()> {
        let relative = path::normalize(relative);
        let local = self.config.cache_path(&relative);
        // ctime is read under the lock: a caller queued behind a refresh sees its touch.
        let _guard = self.tree.hold();
        let meta = match fs::symlink_metadata(&local) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() || self.config.is_offline() {
            return Ok(());
        }

        let cached = StatAttributes::from_metadata(&meta);
        if cached.ctime >= self.epoch.current()? {
            trace!("{} already refreshed", relative);
            return Ok(());
        }
        Self::touch(&local, &meta)?;

        let current = match known {
            Some(stat) => stat,
            None => {
                let remote = self.config.remote_path(&relative);
                match self.pool()?.with_session(|s| s.stat(&remote)) {
                    Ok(stat) => stat,
                    Err(e) if e.is_not_found() => {
                        info!("{} removed remotely", relative);
                        remove_local(&local)?;
                        self.record(&relative, placeholder_stat(), true);
                        return Err(e);
                    }
                    Err(e) => {
                        error!("stat of {} failed: {}", relative, e);
                        return Err(e);
                    }
                }
            }
        };

        let size_changed = cached.size != current.size;
        let time_changed =
            (unix_secs(cached.mtime) - unix_secs(current.mtime)).abs() > MTIME_TOLERANCE_SECS;
        if size_changed || time_changed {
            info!(
                "{} changed (size {} -> {}, mtime {} -> {})",
                relative,
                cached.size,
                current.size,
                unix_secs(cached.mtime),
                unix_secs(current.mtime)
            );
            self.cache_file(&relative, &current)?;
            self.record(&relative, current, false);
        }
        Ok(())
    }

    /// Detach a path and its subtree from the tree. The cached copy on disk
    /// is left for the caller.
    pub fn remove(&self, relative: &str) -> Result<()> {
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        self.tree.remove(&relative)?;
        Ok(())
    }

    pub fn start_refresh_epoch(&self) -> Result<SystemTime> {
        self.epoch.start()
    }

    /// Mirror every cached directory that holds files, once per directory.
    /// Returns the number of directories mirrored.
    pub fn refresh_cache(&self) -> Result<usize> {
        let bulk = self.bulk()?;
        let root = self.config.cache_root();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut mirrored = 0;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("walking cache: {}", e);
                    continue;
                }
            };
            let file_type = entry.file_type();
            if !(file_type.is_file() || file_type.is_symlink()) || is_marker(root, entry.path()) {
                continue;
            }
            let parent = match entry.path().parent() {
                Some(parent) => parent,
                None => continue,
            };
            let inode = match fs::symlink_metadata(parent) {
                Ok(meta) => meta.ino(),
                Err(e) => {
                    warn!("stat of {:?} failed: {}", parent, e);
                    continue;
                }
            };
            if !visited.insert(inode) {
                continue;
            }
            let relative = match path::relative_to_cache(root, parent) {
                Some(relative) => relative,
                None => continue,
            };
            match bulk.mirror_directory(&relative) {
                Ok(()) => mirrored += 1,
                Err(e) => error!("mirroring {} failed: {}", relative, e),
            }
        }
        info!("refreshed {} directories", mirrored);
        Ok(mirrored)
    }

    /// Delete cached file content, keeping the directory skeleton.
    pub fn clean_cache(&self) -> Result<usize> {
        let root = self.config.cache_root();
        let mut removed = 0;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("walking cache: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_dir() || is_marker(root, entry.path()) {
                continue;
            }
            match with_writable_parent(entry.path(), || fs::remove_file(entry.path())) {
                Ok(()) => removed += 1,
                Err(e) => error!("removing {:?} failed: {}", entry.path(), e),
            }
        }
        info!("removed {} cached files", removed);
        Ok(removed)
    }

    /// Delete everything below the cache root except the epoch marker.
    pub fn delete_cache(&self) -> Result<usize> {
        let root = self.config.cache_root();
        let mut removed = 0;
        for entry in WalkDir::new(root).min_depth(1).contents_first(true).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("walking cache: {}", e);
                    continue;
                }
            };
            if is_marker(root, entry.path()) {
                continue;
            }
            let result = with_writable_parent(entry.path(), || {
                if entry.file_type().is_dir() {
                    fs::remove_dir(entry.path())
                } else {
                    fs::remove_file(entry.path())
                }
            });
            match result {
                Ok(()) => removed += 1,
                Err(e) => error!("removing {:?} failed: {}", entry.path(), e),
            }
        }
        info!("deleted {} cache entries", removed);
        Ok(removed)
    }
}
