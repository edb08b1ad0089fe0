//! Remote session abstraction.
//!
//! A session is one authenticated connection to the remote host. It can hold at
//! most one open directory cursor and one open file cursor at a time; opening a
//! new cursor replaces the previous one.

use crate::error::Result;
use crate::stat::StatAttributes;

/// One entry produced by a directory cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub name: String,
    pub stat: StatAttributes,
}

pub trait RemoteSession: Send {
    /// Cheap liveness probe. Must not block on the network.
    fn is_connected(&self) -> bool;

    fn noop(&mut self) -> Result<()>;

    /// Stat without following symbolic links.
    fn stat(&mut self, path: &str) -> Result<StatAttributes>;

    fn read_link(&mut self, path: &str) -> Result<String>;

    /// Open the directory cursor on `path`.
    fn open_dir(&mut self, path: &str) -> Result<()>;

    /// Next entry of the open directory cursor, `None` at end of directory.
    /// The cursor is closed on end of directory and on error.
    fn next_dir_entry(&mut self) -> Result<Option<RemoteDirEntry>>;

    /// Open the file cursor on `path` for reading.
    fn open_read(&mut self, path: &str) -> Result<()>;

    /// Read the next block into `buf`. `Ok(0)` is end of file and closes the cursor.
    fn read_next(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Open the file cursor on `path` for writing, truncating the remote file.
    fn open_write(&mut self, path: &str) -> Result<()>;

    fn write_next(&mut self, data: &[u8]) -> Result<()>;

    /// Flush and close the write cursor.
    fn close_write(&mut self) -> Result<()>;

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<()>;

    /// Create an empty regular file; fails if it already exists.
    fn mknod(&mut self, path: &str, mode: u32) -> Result<()>;

    fn unlink(&mut self, path: &str) -> Result<()>;

    fn rmdir(&mut self, path: &str) -> Result<()>;

    fn symlink(&mut self, target: &str, link: &str) -> Result<()>;

    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    fn chmod(&mut self, path: &str, mode: u32) -> Result<()>;

    fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<()>;

    /// Truncate to zero bytes.
    fn truncate(&mut self, path: &str) -> Result<()>;

    fn run_command(&mut self, command: &str) -> Result<()>;
}

/// Establishes new sessions (network handshake plus authentication).
pub trait Connector: Send + Sync {
    type Session: RemoteSession;

    fn connect(&self) -> Result<Self::Session>;

    /// Human readable target, used in log lines.
    fn describe(&self) -> String;
}
