//! Stat attributes shared by the remote session, the metadata tree and the cache.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Owner write bit. Forced on for everything the cache writes so that later
/// refreshes can rewrite it.
pub const S_IWUSR: u32 = 0o200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            S_IFIFO => FileKind::NamedPipe,
            S_IFCHR => FileKind::CharDevice,
            S_IFBLK => FileKind::BlockDevice,
            S_IFSOCK => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Directory => S_IFDIR,
            FileKind::RegularFile => S_IFREG,
            FileKind::Symlink => S_IFLNK,
            FileKind::NamedPipe => S_IFIFO,
            FileKind::CharDevice => S_IFCHR,
            FileKind::BlockDevice => S_IFBLK,
            FileKind::Socket => S_IFSOCK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatAttributes {
    pub kind: FileKind,
    /// Permission bits only (`0o7777`).
    pub perm: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl StatAttributes {
    pub fn new(kind: FileKind, perm: u32, size: u64, mtime: SystemTime) -> Self {
        StatAttributes {
            kind,
            perm: perm & 0o7777,
            size,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }

    /// Stat of a local file, as returned by `lstat`.
    pub fn from_metadata(meta: &Metadata) -> Self {
        StatAttributes {
            kind: FileKind::from_mode(meta.mode()),
            perm: meta.mode() & 0o7777,
            size: meta.size(),
            uid: meta.uid(),
            gid: meta.gid(),
            atime: system_time(meta.atime(), meta.atime_nsec()),
            mtime: system_time(meta.mtime(), meta.mtime_nsec()),
            ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        }
    }

    /// Full `st_mode`: type bits plus permission bits.
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | self.perm
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn mtime_secs(&self) -> i64 {
        unix_secs(self.mtime)
    }
}

pub fn system_time(secs: i64, nsec: i64) -> SystemTime {
    let nsec = nsec.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::new(0, nsec)
    }
}

/// Whole seconds since the epoch, negative for times before it.
pub fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
