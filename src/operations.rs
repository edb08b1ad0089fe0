//! Write-through mutations.
//!
//! Each operation runs against the remote first; only when the remote accepts it
//! are the metadata tree and the cached copy brought in line.

use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::time::SystemTime;

use filetime::FileTime;
use log::{debug, info, warn};

use crate::cache::{placeholder_stat, remove_local, CacheEngine};
use crate::config::UPLOAD_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::metadata::MetadataEntry;
use crate::path;
use crate::remote::{Connector, RemoteSession};
use crate::stat::{StatAttributes, S_IWUSR};

impl<C: Connector> CacheEngine<C> {
    fn check_writable(&self) -> Result<()> {
        if self.config.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn update_stat(&self, relative: &str, update: impl FnOnce(&mut StatAttributes)) -> Result<()> {
        let mut entry = self.lookup(relative)?;
        update(&mut entry.stat);
        self.record(relative, entry.stat, false);
        Ok(())
    }

    pub fn mkdir(&self, relative: &str, mode: u32) -> Result<MetadataEntry> {
        self.check_writable()?;
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        self.lookup(path::parent(&relative))?;
        let remote = self.config.remote_path(&relative);
        let stat = self.pool()?.with_session(|s| {
            s.mkdir(&remote, mode & 0o7777)?;
            s.stat(&remote)
        })?;
        DirBuilder::new()
            .recursive(true)
            .mode(stat.perm | S_IWUSR)
            .create(self.config.cache_path(&relative))?;
        // Nothing to enumerate in a directory we just made.
        let stamp = self.epoch.current()?;
        self.tree.add(&relative, stat, Some(stamp), false)?;
        info!("created directory {}", relative);
        self.lookup(&relative)
    }

    /// Create an empty regular file remotely and its cached copy.
    pub fn create_file(&self, relative: &str, mode: u32) -> Result<(MetadataEntry, PathBuf)> {
        self.check_writable()?;
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        self.lookup(path::parent(&relative))?;
        let remote = self.config.remote_path(&relative);
        let stat = self.pool()?.with_session(|s| {
            s.mknod(&remote, mode & 0o7777)?;
            s.stat(&remote)
        })?;

        let local = self.config.cache_path(&relative);
        if let Some(parent) = local.parent() {
            DirBuilder::new().recursive(true).mode(0o777).create(parent)?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(stat.perm | S_IWUSR)
            .open(&local)?;
        fs::set_permissions(&local, Permissions::from_mode(stat.perm | S_IWUSR))?;
        filetime::set_file_times(
            &local,
            FileTime::from_system_time(stat.atime),
            FileTime::from_system_time(stat.mtime),
        )?;
        self.tree.add(&relative, stat, None, false)?;
        debug!("created {}", relative);
        Ok((self.lookup(&relative)?, local))
    }

    pub fn unlink(&self, relative: &str) -> Result<()> {
        self.check_writable()?;
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let remote = self.config.remote_path(&relative);
        self.pool()?.with_session(|s| s.unlink(&remote))?;
        self.forget(&relative)
    }

    pub fn rmdir(&self, relative: &str) -> Result<()> {
        self.check_writable()?;
        let relative = path::normalize(relative);
        if path::is_root(&relative) {
            return Err(Error::InvalidPath(relative));
        }
        let _guard = self.tree.hold();
        let remote = self.config.remote_path(&relative);
        self.pool()?.with_session(|s| s.rmdir(&remote))?;
        self.forget(&relative)
    }

    /// Drop a path that is known to be gone remotely, leaving a negative entry.
    /// Drop a path the remote no longer has, together with its cached copy.
    fn forget(&self, relative: &str) -> Result<()> {
        self.remove(relative)?;
        remove_local(&self.config.cache_path(relative))?;
        self.record(relative, placeholder_stat(), true);
        Ok(())
    }

    pub fn symlink(&self, target: &str, link: &str) -> Result<MetadataEntry> {
        self.check_writable()?;
        let link = path::normalize(link);
        let _guard = self.tree.hold();
        self.lookup(path::parent(&link))?;
        let remote = self.config.remote_path(&link);
        let stat = self.pool()?.with_session(|s| {
            s.symlink(target, &remote)?;
            s.stat(&remote)
        })?;
        self.cache_file(&link, &stat)?;
        self.tree.add(&link, stat, None, false)?;
        self.lookup(&link)
    }

    /// Rename a file. Directories are refused.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.check_writable()?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        let _guard = self.tree.hold();
        let entry = self.lookup(&from)?;
        if entry.stat.is_dir() {
            return Err(Error::RenameDirectory(from));
        }
        if let Ok(existing) = self.lookup(&to) {
            if existing.stat.is_dir() {
                return Err(Error::RenameDirectory(to));
            }
        }

        let remote_from = self.config.remote_path(&from);
        let remote_to = self.config.remote_path(&to);
        self.pool()?
            .with_session(|s| s.rename(&remote_from, &remote_to))?;

        let local_from = self.config.cache_path(&from);
        let local_to = self.config.cache_path(&to);
        match fs::symlink_metadata(&local_from) {
            Ok(_) => {
                if let Some(parent) = local_to.parent() {
                    DirBuilder::new().recursive(true).mode(0o777).create(parent)?;
                }
                fs::rename(&local_from, &local_to)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Nothing cached under the old name; drop any stale copy under the new one.
                if let Err(e) = fs::remove_file(&local_to) {
                    if e.kind() != io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.tree.remove(&from)?;
        self.record(&to, entry.stat, false);
        self.record(&from, placeholder_stat(), true);
        info!("renamed {} to {}", from, to);
        Ok(())
    }

    /// Hard link on the remote side. The new name is looked up like any other
    /// path; the cache keeps no link between the two.
    pub fn link(&self, target: &str, link: &str) -> Result<MetadataEntry> {
        self.check_writable()?;
        let target = path::normalize(target);
        let link = path::normalize(link);
        let _guard = self.tree.hold();
        let command = format!(
            "ln {} {}",
            self.config.remote_path(&target),
            self.config.remote_path(&link)
        );
        self.pool()?.with_session(|s| s.run_command(&command))?;
        self.tree.remove(&link)?;
        self.lookup(&link)
    }

    pub fn chmod(&self, relative: &str, mode: u32) -> Result<()> {
        self.check_writable()?;
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let remote = self.config.remote_path(&relative);
        let perm = mode & 0o7777;
        self.pool()?.with_session(|s| s.chmod(&remote, perm))?;

        let local = self.config.cache_path(&relative);
        match fs::symlink_metadata(&local) {
            Ok(meta) if !meta.file_type().is_symlink() => {
                fs::set_permissions(&local, Permissions::from_mode(perm | S_IWUSR))?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.update_stat(&relative, |stat| stat.perm = perm)
    }

    pub fn chown(&self, relative: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.check_writable()?;
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let current = self.lookup(&relative)?.stat;
        let uid = uid.unwrap_or(current.uid);
        let gid = gid.unwrap_or(current.gid);
        let remote = self.config.remote_path(&relative);
        self.pool()?.with_session(|s| s.chown(&remote, uid, gid))?;

        let local = self.config.cache_path(&relative);
        if let Err(e) = std::os::unix::fs::lchown(&local, Some(uid), Some(gid)) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("cached copy of {} keeps its owner: {}", relative, e);
            }
        }
        self.update_stat(&relative, |stat| {
            stat.uid = uid;
            stat.gid = gid;
        })
    }

    /// Only truncation to zero is supported by the remote protocol.
    pub fn truncate(&self, relative: &str, size: u64) -> Result<()> {
        self.check_writable()?;
        if size != 0 {
            return Err(Error::Unsupported(format!("truncate to {} bytes", size)));
        }
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let remote = self.config.remote_path(&relative);
        let stat = self.pool()?.with_session(|s| {
            s.truncate(&remote)?;
            s.stat(&remote)
        })?;

        let local = self.config.cache_path(&relative);
        match OpenOptions::new().write(true).open(&local) {
            Ok(file) => {
                file.set_len(0)?;
                filetime::set_file_mtime(&local, FileTime::from_system_time(stat.mtime))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.record(&relative, stat, false);
        Ok(())
    }

    /// Set times on the cached copy only.
    pub fn set_times(
        &self,
        relative: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let local = self.ensure_cached(&relative)?;
        let meta = fs::symlink_metadata(&local)?;
        let atime = atime.map_or_else(
            || FileTime::from_last_access_time(&meta),
            FileTime::from_system_time,
        );
        let mtime = mtime.map_or_else(
            || FileTime::from_last_modification_time(&meta),
            FileTime::from_system_time,
        );
        filetime::set_symlink_file_times(&local, atime, mtime)?;
        let updated = StatAttributes::from_metadata(&fs::symlink_metadata(&local)?);
        self.update_stat(&relative, |stat| {
            stat.atime = updated.atime;
            stat.mtime = updated.mtime;
        })
    }

    /// Send the cached copy of a file to the remote, then align the cached
    /// mtime with what the remote recorded.
    pub fn upload(&self, relative: &str) -> Result<()> {
        self.check_writable()?;
        let relative = path::normalize(relative);
        let _guard = self.tree.hold();
        let local = self.config.cache_path(&relative);
        let remote = self.config.remote_path(&relative);
        let mut file = File::open(&local)?;

        let stat = self.pool()?.with_session(|s| {
            s.open_write(&remote)?;
            let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
            let mut total = 0u64;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                s.write_next(&buf[..n])?;
                total += n as u64;
            }
            s.close_write()?;
            debug!("uploaded {} bytes to {}", total, remote);
            s.stat(&remote)
        })?;

        if let Err(e) = filetime::set_file_mtime(&local, FileTime::from_system_time(stat.mtime)) {
            warn!("could not align mtime of {:?}: {}", local, e);
        }
        self.record(&relative, stat, false);
        info!("uploaded {}", relative);
        Ok(())
    }
}
