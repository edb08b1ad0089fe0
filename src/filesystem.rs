//! FUSE Filesystem Implementation
//!
//! Maps kernel inode numbers onto mount-relative paths and forwards every call
//! to the cache engine. File content is always served from the cached copy;
//! writes go to the cached copy and are uploaded when the handle is released.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, EINVAL, EOPNOTSUPP, EROFS};
use log::{debug, error, info, trace};
use parking_lot::Mutex;

use crate::cache::CacheEngine;
use crate::error::{Error, Result};
use crate::path;
use crate::remote::Connector;
use crate::stat::{FileKind, StatAttributes, S_IFMT, S_IFREG};

/// Inode number for the root directory
const ROOT_INODE: u64 = 1;

/// Attribute TTL handed to the kernel. Kept short so that staleness checks
/// in the engine stay authoritative.
const TTL: Duration = Duration::from_secs(1);

const BLOCK_SIZE: u32 = 512;

/// Bidirectional inode number <-> path mapping. Numbers are never reused.
#[derive(Debug)]
struct InodeTable {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    next_inode: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = InodeTable {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        table.paths.insert(ROOT_INODE, path::ROOT.to_string());
        table.inodes.insert(path::ROOT.to_string(), ROOT_INODE);
        table
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inodes.get(path) {
            return *ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(ino, path.to_string());
        self.inodes.insert(path.to_string(), ino);
        ino
    }

    fn forget(&mut self, path: &str) {
        if let Some(ino) = self.inodes.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Move a file's inode to its new name, dropping whatever the target had.
    fn rename(&mut self, from: &str, to: &str) {
        self.forget(to);
        if let Some(ino) = self.inodes.remove(from) {
            self.paths.insert(ino, to.to_string());
            self.inodes.insert(to.to_string(), ino);
        }
    }
}

/// Handle on a cached copy opened by the kernel.
#[derive(Debug)]
struct OpenFile {
    file: File,
    path: String,
    /// Set once data was written; the copy is uploaded on release.
    written: bool,
}

pub struct CacheFs<C: Connector> {
    engine: Arc<CacheEngine<C>>,
    inodes: Mutex<InodeTable>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Socket => FileType::Socket,
    }
}

fn file_attr(ino: u64, stat: &StatAttributes) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(BLOCK_SIZE as u64),
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.mtime,
        kind: file_type(stat.kind),
        perm: stat.perm as u16,
        nlink: if stat.is_dir() { 2 } else { 1 },
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        flags: 0,
        blksize: BLOCK_SIZE,
    }
}

fn is_write_mode(flags: i32) -> bool {
    let mode = flags & libc::O_ACCMODE;
    mode == libc::O_WRONLY || mode == libc::O_RDWR
}

fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    if is_write_mode(flags) {
        options
            .truncate(flags & libc::O_TRUNC != 0)
            .append(flags & libc::O_APPEND != 0);
    }
    options
}

fn time_or_now(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    })
}

/// Log an engine error at a level matching how surprising it is.
fn log_error(op: &str, target: &str, e: &Error) {
    if e.is_not_found() {
        debug!("{} {}: {}", op, target, e);
    } else {
        error!("{} {} failed: {}", op, target, e);
    }
}

impl<C: Connector> CacheFs<C> {
    pub fn new(engine: Arc<CacheEngine<C>>) -> Self {
        CacheFs {
            engine,
            inodes: Mutex::new(InodeTable::new()),
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn path_of(&self, ino: u64) -> Result<String> {
        self.inodes
            .lock()
            .path(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String> {
        let parent = self.path_of(parent)?;
        let name = name
            .to_str()
            .ok_or_else(|| Error::InvalidPath(name.to_string_lossy().into_owned()))?;
        Ok(path::join(&parent, name))
    }

    fn attr_of(&self, path: &str, stat: &StatAttributes) -> FileAttr {
        let ino = self.inodes.lock().inode_for(path);
        file_attr(ino, stat)
    }

    /// Attributes of a path, preferring the cached copy while it has
    /// unsent writes.
    fn current_attr(&self, path: &str) -> Result<FileAttr> {
        let entry = self.engine.lookup(path)?;
        let dirty = self
            .open_files
            .lock()
            .values()
            .any(|open| open.written && open.path == path);
        if dirty {
            let meta = fs::symlink_metadata(self.engine.config().cache_path(path))?;
            return Ok(self.attr_of(path, &StatAttributes::from_metadata(&meta)));
        }
        Ok(self.attr_of(path, &entry.stat))
    }

    fn check_writable(&self) -> Result<()> {
        if self.engine.config().read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn open_cached(&self, path: &str, local: &Path, flags: i32) -> Result<u64> {
        let file = open_options(flags).open(local)?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let written = is_write_mode(flags) && flags & libc::O_TRUNC != 0;
        self.open_files.lock().insert(
            fh,
            OpenFile {
                file,
                path: path.to_string(),
                written,
            },
        );
        trace!("opened {} as fh {} (flags {:#o})", path, fh, flags);
        Ok(fh)
    }

    /// Upload a handle's writes, if any, and mark it clean.
    fn sync_handle(&self, fh: u64) -> Result<()> {
        let path = {
            let mut open_files = self.open_files.lock();
            let open = match open_files.get_mut(&fh) {
                Some(open) => open,
                None => return Err(Error::InvalidHandle(format!("fh {}", fh))),
            };
            if !open.written {
                return Ok(());
            }
            open.file.sync_all()?;
            open.written = false;
            open.path.clone()
        };
        self.engine.upload(&path)
    }
}

impl<C: Connector> Filesystem for CacheFs<C> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };
        trace!("lookup {}", path);
        match self.current_attr(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                log_error("lookup", &path, &e);
                reply.error(e.errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self.path_of(ino).and_then(|path| self.current_attr(&path));
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => {
                log_error("getattr", &ino.to_string(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let result = self
            .path_of(ino)
            .and_then(|path| self.engine.ensure_cached(&path))
            .and_then(|local| Ok(fs::read_link(local)?));
        match result {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => {
                log_error("readlink", &ino.to_string(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.errno()),
        };
        let children = match self.engine.list_children(&path) {
            Ok(children) => children,
            Err(e) => {
                log_error("readdir", &path, &e);
                return reply.error(e.errno());
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = {
            let mut inodes = self.inodes.lock();
            let parent_ino = inodes.inode_for(path::parent(&path));
            vec![
                (ino, FileType::Directory, ".".to_string()),
                (parent_ino, FileType::Directory, "..".to_string()),
            ]
        };
        let mut children = children;
        children.sort_by(|a, b| a.name.cmp(&b.name));
        for child in children {
            let child_ino = self.inodes.lock().inode_for(&path::join(&path, &child.name));
            entries.push((child_ino, file_type(child.stat.kind), child.name));
        }

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(*entry_ino, (i + 1) as i64, *kind, name.as_str());
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        if is_write_mode(flags) && self.engine.config().read_only {
            return reply.error(EROFS);
        }
        let result = self.path_of(ino).and_then(|path| {
            let local = self.engine.ensure_cached(&path)?;
            self.open_cached(&path, &local, flags)
        });
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => {
                log_error("open", &ino.to_string(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let open_files = self.open_files.lock();
        let open = match open_files.get(&fh) {
            Some(open) => open,
            None => return reply.error(EBADF),
        };
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match open.file.read_at(&mut buf[filled..], offset as u64 + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    error!("read of {} failed: {}", open.path, e);
                    return reply.error(e.raw_os_error().unwrap_or(libc::EIO));
                }
            }
        }
        reply.data(&buf[..filled]);
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let mut open_files = self.open_files.lock();
        let open = match open_files.get_mut(&fh) {
            Some(open) => open,
            None => return reply.error(EBADF),
        };
        match open.file.write_all_at(data, offset as u64) {
            Ok(()) => {
                open.written = true;
                reply.written(data.len() as u32);
            }
            Err(e) => {
                error!("write to {} failed: {}", open.path, e);
                reply.error(e.raw_os_error().unwrap_or(libc::EIO));
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            let (entry, local) = self.engine.create_file(&path, mode & !umask)?;
            let fh = self.open_cached(&path, &local, flags)?;
            Ok((self.attr_of(&path, &entry.stat), fh))
        });
        match result {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => {
                log_error("create", &name.to_string_lossy(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let kind = mode & S_IFMT;
        if kind != 0 && kind != S_IFREG {
            return reply.error(EOPNOTSUPP);
        }
        let result = self.child_path(parent, name).and_then(|path| {
            let (entry, _) = self.engine.create_file(&path, mode & !umask)?;
            Ok(self.attr_of(&path, &entry.stat))
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                log_error("mknod", &name.to_string_lossy(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            let entry = self.engine.mkdir(&path, mode & !umask)?;
            Ok(self.attr_of(&path, &entry.stat))
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                log_error("mkdir", &name.to_string_lossy(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.engine.unlink(&path)?;
            self.inodes.lock().forget(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_error("unlink", &name.to_string_lossy(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.engine.rmdir(&path)?;
            self.inodes.lock().forget(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_error("rmdir", &name.to_string_lossy(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let target = match target.to_str() {
            Some(target) => target.to_string(),
            None => return reply.error(EINVAL),
        };
        let result = self.child_path(parent, link_name).and_then(|path| {
            let entry = self.engine.symlink(&target, &path)?;
            Ok(self.attr_of(&path, &entry.stat))
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                log_error("symlink", &link_name.to_string_lossy(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            return reply.error(EINVAL);
        }
        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.engine.rename(&from, &to)?;
            self.inodes.lock().rename(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_error("rename", &name.to_string_lossy(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.path_of(ino).and_then(|target| {
            let path = self.child_path(newparent, newname)?;
            let entry = self.engine.link(&target, &path)?;
            Ok(self.attr_of(&path, &entry.stat))
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                log_error("link", &newname.to_string_lossy(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.path_of(ino).and_then(|path| {
            if mode.is_some() || uid.is_some() || gid.is_some() || size.is_some() {
                self.check_writable()?;
            }
            if let Some(mode) = mode {
                self.engine.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.engine.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.engine.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.engine
                    .set_times(&path, time_or_now(atime), time_or_now(mtime))?;
            }
            self.current_attr(&path)
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => {
                log_error("setattr", &ino.to_string(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match nix::sys::statvfs::statvfs(self.engine.config().cache_root()) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(errno) => {
                error!("statfs of cache failed: {}", errno);
                reply.error(errno as i32);
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.sync_handle(fh);
        let released = self.open_files.lock().remove(&fh);
        if let Some(open) = released {
            trace!("released fh {} for {}", fh, open.path);
        }
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_error("release", &fh.to_string(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.sync_handle(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_error("fsync", &fh.to_string(), &e);
                reply.error(e.errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let open_files = self.open_files.lock();
        match open_files.get(&fh) {
            Some(open) => match open.file.sync_data() {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
            },
            None => reply.error(EBADF),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.path_of(ino).and_then(|path| self.engine.lookup(&path)) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn destroy(&mut self) {
        let pending: Vec<u64> = self
            .open_files
            .lock()
            .iter()
            .filter(|(_, open)| open.written)
            .map(|(fh, _)| *fh)
            .collect();
        for fh in pending {
            if let Err(e) = self.sync_handle(fh) {
                error!("upload on unmount failed: {}", e);
            }
        }
        info!("unmounted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::fixture;
    use std::io::Write;

    #[test]
    fn test_inode_table() {
        let mut table = InodeTable::new();
        assert_eq!(table.path(ROOT_INODE).as_deref(), Some("/"));
        let a = table.inode_for("/a");
        assert_eq!(table.inode_for("/a"), a);
        let b = table.inode_for("/b");
        assert_ne!(a, b);

        table.rename("/a", "/b");
        assert_eq!(table.path(a).as_deref(), Some("/b"));
        assert_eq!(table.path(b), None);
        assert_eq!(table.inode_for("/b"), a);

        table.forget("/b");
        assert_eq!(table.path(a), None);
        assert!(table.inode_for("/b") > b);
    }

    #[test]
    fn test_file_attr() {
        let stat = StatAttributes::new(FileKind::Directory, 0o750, 0, SystemTime::UNIX_EPOCH);
        let attr = file_attr(7, &stat);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o750);
        assert_eq!(attr.nlink, 2);

        let stat = StatAttributes::new(FileKind::RegularFile, 0o644, 1025, SystemTime::UNIX_EPOCH);
        assert_eq!(file_attr(8, &stat).blocks, 3);
    }

    #[test]
    fn test_open_flags() {
        assert!(!is_write_mode(libc::O_RDONLY));
        assert!(is_write_mode(libc::O_WRONLY | libc::O_TRUNC));
        assert!(is_write_mode(libc::O_RDWR));
    }

    #[test]
    fn test_written_handle_uploads_on_sync() {
        let f = fixture();
        let engine = Arc::new(f.engine);
        let fs = CacheFs::new(engine.clone());

        let local = engine.ensure_cached("/docs/a.txt").unwrap();
        let fh = fs.open_cached("/docs/a.txt", &local, libc::O_RDWR).unwrap();
        {
            let mut open_files = fs.open_files.lock();
            let open = open_files.get_mut(&fh).unwrap();
            open.file.write_all_at(b"ALPHA", 0).unwrap();
            open.written = true;
        }
        assert_eq!(fs.current_attr("/docs/a.txt").unwrap().size, 5);

        fs.sync_handle(fh).unwrap();
        assert_eq!(f.remote.content("/docs/a.txt").unwrap(), b"ALPHA");
        assert!(!fs.open_files.lock()[&fh].written);
    }

    #[test]
    fn test_truncating_open_marks_handle_written() {
        let f = fixture();
        let engine = Arc::new(f.engine);
        let fs = CacheFs::new(engine.clone());

        let local = engine.ensure_cached("/top.txt").unwrap();
        let fh = fs
            .open_cached("/top.txt", &local, libc::O_WRONLY | libc::O_TRUNC)
            .unwrap();
        {
            let mut open_files = fs.open_files.lock();
            let open = open_files.get_mut(&fh).unwrap();
            open.file.write_all(b"new").unwrap();
        }
        fs.sync_handle(fh).unwrap();
        assert_eq!(f.remote.content("/top.txt").unwrap(), b"new");
        assert_eq!(engine.tree().find("/top.txt").unwrap().stat.size, 3);
    }
}
