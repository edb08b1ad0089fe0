//! In-memory remote host and bulk transfer used by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::bulk::BulkTransfer;
use crate::error::{Error, Result};
use crate::path;
use crate::remote::{Connector, RemoteDirEntry, RemoteSession};
use crate::stat::{FileKind, StatAttributes};

/// Modification time given to files added through the helpers.
pub fn base_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_600_000_000)
}

#[derive(Debug, Clone)]
struct MemoryNode {
    stat: StatAttributes,
    data: Vec<u8>,
    target: Option<String>,
}

#[derive(Default)]
struct RemoteState {
    nodes: BTreeMap<String, MemoryNode>,
    generation: u64,
    fail_connects: bool,
    fail_stats: bool,
    fail_listings: bool,
    fail_reads_after: Option<usize>,
    connects: usize,
    stats: usize,
    listings: usize,
    reads: usize,
    commands: Vec<String>,
}

/// Shared handle on the fake remote host. Clones see the same files.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

pub struct MemoryConnector {
    state: Arc<Mutex<RemoteState>>,
}

pub struct MemorySession {
    state: Arc<Mutex<RemoteState>>,
    generation: u64,
    dir_cursor: Option<VecDeque<RemoteDirEntry>>,
    listing_budget: Option<usize>,
    read_cursor: Option<(Vec<u8>, usize)>,
    write_cursor: Option<(String, Vec<u8>)>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut state = RemoteState::default();
        state.nodes.insert(
            path::ROOT.to_string(),
            MemoryNode {
                stat: StatAttributes::new(FileKind::Directory, 0o755, 0, base_time()),
                data: Vec::new(),
                target: None,
            },
        );
        MemoryRemote {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            state: self.state.clone(),
        }
    }

    pub fn add_dir(&self, path: &str) {
        self.insert(
            path,
            StatAttributes::new(FileKind::Directory, 0o755, 0, base_time()),
            Vec::new(),
            None,
        );
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.set_file(path, data, base_time());
    }

    /// Replace the content of a file and its modification time.
    pub fn set_file(&self, path: &str, data: &[u8], mtime: SystemTime) {
        self.insert(
            path,
            StatAttributes::new(FileKind::RegularFile, 0o644, data.len() as u64, mtime),
            data.to_vec(),
            None,
        );
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.insert(
            path,
            StatAttributes::new(FileKind::Symlink, 0o777, target.len() as u64, base_time()),
            Vec::new(),
            Some(target.to_string()),
        );
    }

    /// Change only the modification time, keeping content and size.
    pub fn touch(&self, path: &str, mtime: SystemTime) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(&path::normalize(path)) {
            node.stat.mtime = mtime;
        }
    }

    pub fn remove(&self, path: &str) {
        let path = path::normalize(path);
        self.state
            .lock()
            .nodes
            .retain(|key, _| key != &path && !key.starts_with(&format!("{}/", path)));
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(&path::normalize(path))
    }

    pub fn stat_of(&self, path: &str) -> Option<StatAttributes> {
        self.state
            .lock()
            .nodes
            .get(&path::normalize(path))
            .map(|n| n.stat.clone())
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .nodes
            .get(&path::normalize(path))
            .map(|n| n.data.clone())
    }

    /// Invalidate every session opened so far. New sessions are unaffected.
    pub fn disconnect_all(&self) {
        self.state.lock().generation += 1;
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.lock().fail_connects = fail;
    }

    pub fn fail_stats(&self, fail: bool) {
        self.state.lock().fail_stats = fail;
    }

    /// Listings return their first entry and then fail.
    pub fn fail_listings(&self, fail: bool) {
        self.state.lock().fail_listings = fail;
    }

    /// Reads fail once this many bytes of a file have been served.
    pub fn fail_reads_after(&self, bytes: Option<usize>) {
        self.state.lock().fail_reads_after = bytes;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn stat_count(&self) -> usize {
        self.state.lock().stats
    }

    pub fn list_count(&self) -> usize {
        self.state.lock().listings
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    fn insert(&self, path: &str, stat: StatAttributes, data: Vec<u8>, target: Option<String>) {
        self.state
            .lock()
            .nodes
            .insert(path::normalize(path), MemoryNode { stat, data, target });
    }
}

impl Connector for MemoryConnector {
    type Session = MemorySession;

    fn connect(&self) -> Result<MemorySession> {
        let mut state = self.state.lock();
        if state.fail_connects {
            return Err(Error::NotConnected("connection refused".to_string()));
        }
        state.connects += 1;
        Ok(MemorySession {
            state: self.state.clone(),
            generation: state.generation,
            dir_cursor: None,
            listing_budget: None,
            read_cursor: None,
            write_cursor: None,
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemorySession {
    fn check(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::ConnectionLost("session closed".to_string()))
        }
    }

    fn create(&mut self, path: &str, stat: StatAttributes, target: Option<String>) -> Result<()> {
        self.check()?;
        let path = path::normalize(path);
        let mut state = self.state.lock();
        match state.nodes.get(path::parent(&path)) {
            Some(parent) if parent.stat.is_dir() => {}
            _ => return Err(Error::NotFound(path)),
        }
        if state.nodes.contains_key(&path) {
            return Err(Error::AlreadyExists(path));
        }
        state.nodes.insert(
            path,
            MemoryNode {
                stat,
                data: Vec::new(),
                target,
            },
        );
        Ok(())
    }

    fn update(&mut self, path: &str, f: impl FnOnce(&mut MemoryNode)) -> Result<()> {
        self.check()?;
        let path = path::normalize(path);
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(&path)
            .ok_or_else(|| Error::NotFound(path.clone()))?;
        f(node);
        Ok(())
    }
}

impl RemoteSession for MemorySession {
    fn is_connected(&self) -> bool {
        self.state.lock().generation == self.generation
    }

    fn noop(&mut self) -> Result<()> {
        self.check()
    }

    fn stat(&mut self, path: &str) -> Result<StatAttributes> {
        self.check()?;
        let path = path::normalize(path);
        let mut state = self.state.lock();
        state.stats += 1;
        if state.fail_stats {
            return Err(Error::ConnectionLost(path));
        }
        state
            .nodes
            .get(&path)
            .map(|n| n.stat.clone())
            .ok_or(Error::NotFound(path))
    }

    fn read_link(&mut self, path: &str) -> Result<String> {
        self.check()?;
        let path = path::normalize(path);
        let state = self.state.lock();
        match state.nodes.get(&path) {
            Some(MemoryNode {
                target: Some(target),
                ..
            }) => Ok(target.clone()),
            Some(_) => Err(Error::InvalidHandle(path)),
            None => Err(Error::NotFound(path)),
        }
    }

    fn open_dir(&mut self, path: &str) -> Result<()> {
        self.check()?;
        let dir = path::normalize(path);
        let mut state = self.state.lock();
        state.listings += 1;
        match state.nodes.get(&dir) {
            Some(node) if node.stat.is_dir() => {}
            Some(_) => return Err(Error::NotADirectory(dir)),
            None => return Err(Error::NotFound(dir)),
        }
        // "." and ".." plus one real entry before an injected failure.
        self.listing_budget = state.fail_listings.then_some(3);
        let mut entries: VecDeque<RemoteDirEntry> = [".", ".."]
            .iter()
            .map(|name| RemoteDirEntry {
                name: name.to_string(),
                stat: state.nodes[&dir].stat.clone(),
            })
            .collect();
        for (key, node) in &state.nodes {
            if !path::is_root(key) && path::parent(key) == dir {
                entries.push_back(RemoteDirEntry {
                    name: path::file_name(key).to_string(),
                    stat: node.stat.clone(),
                });
            }
        }
        self.dir_cursor = Some(entries);
        Ok(())
    }

    fn next_dir_entry(&mut self) -> Result<Option<RemoteDirEntry>> {
        self.check()?;
        if let Some(budget) = self.listing_budget.as_mut() {
            if *budget == 0 {
                self.dir_cursor = None;
                self.listing_budget = None;
                return Err(Error::ConnectionLost("listing interrupted".to_string()));
            }
            *budget -= 1;
        }
        let cursor = self
            .dir_cursor
            .as_mut()
            .ok_or_else(|| Error::InvalidHandle("no directory open".to_string()))?;
        match cursor.pop_front() {
            Some(entry) => Ok(Some(entry)),
            None => {
                self.dir_cursor = None;
                Ok(None)
            }
        }
    }

    fn open_read(&mut self, path: &str) -> Result<()> {
        self.check()?;
        let path = path::normalize(path);
        let mut state = self.state.lock();
        state.reads += 1;
        let data = match state.nodes.get(&path) {
            Some(node) if node.stat.kind == FileKind::RegularFile => node.data.clone(),
            Some(_) => return Err(Error::Failure(path)),
            None => return Err(Error::NotFound(path)),
        };
        self.read_cursor = Some((data, 0));
        Ok(())
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        let limit = self.state.lock().fail_reads_after;
        let (data, offset) = self
            .read_cursor
            .as_mut()
            .ok_or_else(|| Error::InvalidHandle("no file open".to_string()))?;
        if let Some(limit) = limit {
            if *offset >= limit {
                self.read_cursor = None;
                return Err(Error::ConnectionLost("transfer aborted".to_string()));
            }
        }
        let mut end = data.len().min(*offset + buf.len());
        if let Some(limit) = limit {
            end = end.min(limit);
        }
        let n = end - *offset;
        buf[..n].copy_from_slice(&data[*offset..end]);
        *offset = end;
        if n == 0 {
            self.read_cursor = None;
        }
        Ok(n)
    }

    fn open_write(&mut self, path: &str) -> Result<()> {
        self.check()?;
        let path = path::normalize(path);
        match self.state.lock().nodes.get(path::parent(&path)) {
            Some(parent) if parent.stat.is_dir() => {}
            _ => return Err(Error::NotFound(path)),
        }
        self.write_cursor = Some((path, Vec::new()));
        Ok(())
    }

    fn write_next(&mut self, data: &[u8]) -> Result<()> {
        self.check()?;
        let (_, buf) = self
            .write_cursor
            .as_mut()
            .ok_or_else(|| Error::InvalidHandle("no file open".to_string()))?;
        buf.extend_from_slice(data);
        Ok(())
    }

    fn close_write(&mut self) -> Result<()> {
        self.check()?;
        let (path, data) = self
            .write_cursor
            .take()
            .ok_or_else(|| Error::InvalidHandle("no file open".to_string()))?;
        let mut state = self.state.lock();
        let perm = state.nodes.get(&path).map_or(0o644, |n| n.stat.perm);
        let stat = StatAttributes::new(
            FileKind::RegularFile,
            perm,
            data.len() as u64,
            SystemTime::now(),
        );
        state.nodes.insert(
            path,
            MemoryNode {
                stat,
                data,
                target: None,
            },
        );
        Ok(())
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        let stat = StatAttributes::new(FileKind::Directory, mode, 0, SystemTime::now());
        self.create(path, stat, None)
    }

    fn mknod(&mut self, path: &str, mode: u32) -> Result<()> {
        let stat = StatAttributes::new(FileKind::RegularFile, mode, 0, SystemTime::now());
        self.create(path, stat, None)
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        self.check()?;
        let path = path::normalize(path);
        let mut state = self.state.lock();
        match state.nodes.get(&path) {
            Some(node) if node.stat.is_dir() => Err(Error::Failure(path)),
            Some(_) => {
                state.nodes.remove(&path);
                Ok(())
            }
            None => Err(Error::NotFound(path)),
        }
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        self.check()?;
        let path = path::normalize(path);
        let mut state = self.state.lock();
        match state.nodes.get(&path) {
            Some(node) if node.stat.is_dir() => {}
            Some(_) => return Err(Error::NotADirectory(path)),
            None => return Err(Error::NotFound(path)),
        }
        let prefix = format!("{}/", path);
        if state.nodes.keys().any(|k| k.starts_with(&prefix)) {
            return Err(Error::Failure(format!("{} not empty", path)));
        }
        state.nodes.remove(&path);
        Ok(())
    }

    fn symlink(&mut self, target: &str, link: &str) -> Result<()> {
        let stat = StatAttributes::new(
            FileKind::Symlink,
            0o777,
            target.len() as u64,
            SystemTime::now(),
        );
        self.create(link, stat, Some(target.to_string()))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.check()?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&from) {
            return Err(Error::NotFound(from));
        }
        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = state.nodes.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                state.nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        self.update(path, |node| node.stat.perm = mode & 0o7777)
    }

    fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.update(path, |node| {
            node.stat.uid = uid;
            node.stat.gid = gid;
        })
    }

    fn truncate(&mut self, path: &str) -> Result<()> {
        self.update(path, |node| {
            node.data.clear();
            node.stat.size = 0;
            node.stat.mtime = SystemTime::now();
        })
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        self.check()?;
        self.state.lock().commands.push(command.to_string());
        Ok(())
    }
}

/// Bulk transfer that copies straight out of a [`MemoryRemote`] and records calls.
pub struct RecordingTransfer {
    remote: MemoryRemote,
    cache_root: PathBuf,
    fail: Mutex<bool>,
    fetched: Mutex<Vec<String>>,
    mirrored: Mutex<Vec<String>>,
}

impl RecordingTransfer {
    pub fn new(remote: MemoryRemote, cache_root: PathBuf) -> Self {
        RecordingTransfer {
            remote,
            cache_root,
            fail: Mutex::new(false),
            fetched: Mutex::new(Vec::new()),
            mirrored: Mutex::new(Vec::new()),
        }
    }

    /// Fetches write half the file and then fail.
    pub fn fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    pub fn mirrored(&self) -> Vec<String> {
        self.mirrored.lock().clone()
    }
}

impl BulkTransfer for RecordingTransfer {
    fn bulk_fetch(&self, relative: &str) -> Result<()> {
        self.fetched.lock().push(relative.to_string());
        let data = self
            .remote
            .content(relative)
            .ok_or_else(|| Error::NotFound(relative.to_string()))?;
        let local = path::cache_path(&self.cache_root, relative);
        if *self.fail.lock() {
            fs::write(&local, &data[..data.len() / 2])?;
            return Err(Error::Failure(format!("bulk fetch of {} failed", relative)));
        }
        fs::write(&local, &data)?;
        Ok(())
    }

    fn mirror_directory(&self, relative: &str) -> Result<()> {
        self.mirrored.lock().push(relative.to_string());
        Ok(())
    }
}
