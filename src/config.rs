//! Mount configuration.

use std::path::{Path, PathBuf};

use crate::path;

/// Files above this size go through the bulk transfer tool.
pub const LARGE_FILE_THRESHOLD: u64 = 10_000_000;

/// Block size for streamed downloads.
pub const TRANSFER_CHUNK_SIZE: usize = 320_000;

/// Block size for write-through uploads.
pub const UPLOAD_CHUNK_SIZE: usize = 512 * 1024;

pub const DEFAULT_FTP_PORT: u16 = 21;

/// Where and how to reach the remote host.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: bool,
    /// Remote directory mounted as `/`.
    pub root_dir: String,
}

impl RemoteSettings {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        RemoteSettings {
            host: host.into(),
            port: DEFAULT_FTP_PORT,
            user: user.into(),
            password: String::new(),
            tls: false,
            root_dir: path::ROOT.to_string(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "ftps"
        } else {
            "ftp"
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk mirror.
    pub cache_dir: PathBuf,
    /// `None` when serving the cache offline.
    pub remote: Option<RemoteSettings>,
    pub read_only: bool,
    /// Re-list directories enumerated before the current refresh epoch.
    pub refresh_dir_entries: bool,
    /// Re-validate cached files opened after the current refresh epoch started.
    pub refresh_opened_files: bool,
    pub large_file_threshold: u64,
    pub transfer_chunk_size: usize,
}

impl Config {
    pub fn online(cache_dir: impl Into<PathBuf>, remote: RemoteSettings) -> Self {
        Config {
            cache_dir: cache_dir.into(),
            remote: Some(remote),
            read_only: false,
            refresh_dir_entries: true,
            refresh_opened_files: true,
            large_file_threshold: LARGE_FILE_THRESHOLD,
            transfer_chunk_size: TRANSFER_CHUNK_SIZE,
        }
    }

    /// Frozen view of an existing cache. Always read-only.
    pub fn offline(cache_dir: impl Into<PathBuf>) -> Self {
        Config {
            cache_dir: cache_dir.into(),
            remote: None,
            read_only: true,
            refresh_dir_entries: false,
            refresh_opened_files: false,
            large_file_threshold: LARGE_FILE_THRESHOLD,
            transfer_chunk_size: TRANSFER_CHUNK_SIZE,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.remote.is_none()
    }

    pub fn remote_root(&self) -> &str {
        self.remote
            .as_ref()
            .map_or(path::ROOT, |remote| remote.root_dir.as_str())
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_dir
    }

    /// Remote location of a mount-relative path.
    pub fn remote_path(&self, relative: &str) -> String {
        path::remote_path(self.remote_root(), relative)
    }

    /// Cache location of a mount-relative path.
    pub fn cache_path(&self, relative: &str) -> PathBuf {
        path::cache_path(&self.cache_dir, relative)
    }
}
