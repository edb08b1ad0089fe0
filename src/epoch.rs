//! Global refresh epoch.
//!
//! The epoch is the modification time of a marker file in the cache root, so a
//! separate `ftpsnapfs refresh` process can advance it under a running mount.
//! Comparing it against the ctime of cached files keeps both sides of every
//! staleness check on the kernel's file clock.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info};

use crate::error::Result;

pub const EPOCH_MARKER: &str = ".ftpsnapfs_refresh_epoch";

#[derive(Debug, Clone)]
pub struct RefreshEpoch {
    marker: PathBuf,
}

impl RefreshEpoch {
    pub fn new(cache_root: &Path) -> Self {
        RefreshEpoch {
            marker: cache_root.join(EPOCH_MARKER),
        }
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Current epoch. A missing marker starts a new epoch.
    pub fn current(&self) -> Result<SystemTime> {
        match fs::metadata(&self.marker) {
            Ok(meta) => Ok(meta.modified()?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no refresh marker at {:?}", self.marker);
                self.start()
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Advance the epoch to now. Everything cached before this point is
    /// re-validated on next access.
    pub fn start(&self) -> Result<SystemTime> {
        let mut marker = File::create(&self.marker)?;
        writeln!(marker, "{}", chrono::Local::now().to_rfc3339())?;
        marker.sync_all()?;
        drop(marker);
        let epoch = fs::metadata(&self.marker)?.modified()?;
        info!("started refresh epoch {:?}", epoch);
        Ok(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_missing_marker_starts_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let epoch = RefreshEpoch::new(dir.path());
        assert!(!epoch.marker().exists());

        let first = epoch.current().unwrap();
        assert!(epoch.marker().exists());
        assert_eq!(epoch.current().unwrap(), first);
    }

    #[test]
    fn test_start_advances_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let epoch = RefreshEpoch::new(dir.path());
        let first = epoch.start().unwrap();
        sleep(Duration::from_millis(50));
        let second = epoch.start().unwrap();
        assert!(second > first);
        assert_eq!(epoch.current().unwrap(), second);
    }

    #[test]
    fn test_epoch_shared_through_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mounted = RefreshEpoch::new(dir.path());
        let first = mounted.current().unwrap();
        sleep(Duration::from_millis(50));
        let second = RefreshEpoch::new(dir.path()).start().unwrap();
        assert!(second > first);
        assert_eq!(mounted.current().unwrap(), second);
    }
}
