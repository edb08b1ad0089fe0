//! Error kinds surfaced by the cache engine.
//!
//! Every remote protocol failure is folded into one of these variants before it
//! reaches the engine, and every variant maps onto exactly one errno for the mount
//! adapter.

use std::io;

use libc::{
    EACCES, EBADMSG, EEXIST, EINVAL, EIO, ENETDOWN, ENOENT, ENOMEDIUM, ENOTCONN, ENOTDIR,
    EOPNOTSUPP, EPERM, EROFS, EXDEV,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The remote entry does not exist. Becomes a negative metadata entry.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Generic remote failure with no more specific meaning.
    #[error("remote operation failed: {0}")]
    Failure(String),

    #[error("malformed response: {0}")]
    BadMessage(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("write protected: {0}")]
    WriteProtected(String),

    #[error("no medium: {0}")]
    NoMedium(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("read-only file system")]
    ReadOnly,

    #[error("directories cannot be renamed: {0}")]
    RenameDirectory(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => ENOENT,
            Error::PermissionDenied(_) => EACCES,
            Error::Failure(_) => EPERM,
            Error::BadMessage(_) => EBADMSG,
            Error::NotConnected(_) => ENOTCONN,
            Error::ConnectionLost(_) => ENETDOWN,
            Error::Unsupported(_) => EOPNOTSUPP,
            Error::InvalidHandle(_) => EINVAL,
            Error::AlreadyExists(_) => EEXIST,
            Error::WriteProtected(_) => EACCES,
            Error::NoMedium(_) => ENOMEDIUM,
            Error::NotADirectory(_) => ENOTDIR,
            Error::ReadOnly => EROFS,
            Error::RenameDirectory(_) => EXDEV,
            Error::InvalidPath(_) => EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(EIO),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Session-level failures: the session that produced them should not be reused.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::NotConnected(_) | Error::ConnectionLost(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("/a".into()).errno(), ENOENT);
        assert_eq!(Error::WriteProtected("/a".into()).errno(), EACCES);
        assert_eq!(Error::ConnectionLost("x".into()).errno(), ENETDOWN);
        assert_eq!(Error::RenameDirectory("/d".into()).errno(), EXDEV);
        assert_eq!(Error::ReadOnly.errno(), EROFS);

        let io_err = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(Error::from(io_err).errno(), libc::ENOSPC);
        let io_err = io::Error::new(io::ErrorKind::Other, "no errno");
        assert_eq!(Error::from(io_err).errno(), EIO);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(Error::NotFound("/a".into()).is_not_found());
        assert!(Error::from(io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(!Error::PermissionDenied("/a".into()).is_not_found());
    }
}
