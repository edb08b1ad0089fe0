//! ftpsnapfs - a snapshot cache filesystem over FTP
//!
//! Serves a remote FTP tree through FUSE from a local on-disk mirror. Metadata
//! lives in an in-memory tree, file content in the cache directory, and both are
//! re-validated against the remote once per refresh epoch. An existing cache can
//! also be mounted offline, with no remote at all.

pub mod bulk;
pub mod cache;
pub mod config;
pub mod epoch;
pub mod error;
pub mod filesystem;
pub mod ftp;
pub mod metadata;
mod operations;
pub mod path;
pub mod pool;
pub mod remote;
pub mod stat;

#[cfg(test)]
mod testing;

pub use bulk::{BulkTransfer, LftpTransfer};
pub use cache::CacheEngine;
pub use config::{Config, RemoteSettings};
pub use epoch::RefreshEpoch;
pub use error::{Error, Result};
pub use filesystem::CacheFs;
pub use ftp::FtpConnector;
pub use pool::ConnectionPool;
