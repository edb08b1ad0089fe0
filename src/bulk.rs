//! Bulk transfers through an external `lftp` process.
//!
//! Large files and whole-directory refreshes are handed to `lftp`, which opens its
//! own parallel connections and does not touch the connection pool.

use std::path::PathBuf;
use std::process::Command;

use log::{debug, error, info};

use crate::config::RemoteSettings;
use crate::error::{Error, Result};
use crate::path;

/// Parallel segments per file.
const PGET_SEGMENTS: usize = 5;

pub trait BulkTransfer: Send + Sync {
    /// Download one file into its cache location, replacing any previous copy.
    fn bulk_fetch(&self, relative: &str) -> Result<()>;

    /// Bring the files already cached in one directory up to date, without
    /// descending into subdirectories.
    fn mirror_directory(&self, relative: &str) -> Result<()>;
}

pub struct LftpTransfer {
    remote: RemoteSettings,
    cache_root: PathBuf,
    program: String,
}

/// Quote an argument for the lftp command language.
fn quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

impl LftpTransfer {
    pub fn new(remote: RemoteSettings, cache_root: PathBuf) -> Self {
        LftpTransfer {
            remote,
            cache_root,
            program: "lftp".to_string(),
        }
    }

    fn open_command(&self) -> String {
        let mut script = String::new();
        if self.remote.tls {
            script.push_str("set ftp:ssl-force true; set ssl:verify-certificate no; ");
        }
        script.push_str(&format!(
            "open --env-password -u {} -p {} ftp://{}",
            quote(&self.remote.user),
            self.remote.port,
            self.remote.host
        ));
        script
    }

    fn fetch_script(&self, relative: &str) -> String {
        let remote = path::remote_path(&self.remote.root_dir, relative);
        let local = path::cache_path(&self.cache_root, relative);
        format!(
            "{}; pget -n {} {} -o {}",
            self.open_command(),
            PGET_SEGMENTS,
            quote(&remote),
            quote(&local.to_string_lossy())
        )
    }

    fn mirror_script(&self, relative: &str) -> String {
        let remote = path::remote_path(&self.remote.root_dir, relative);
        let local = path::cache_path(&self.cache_root, relative);
        format!(
            "{}; mirror --use-pget-n={} --no-recursion --delete --only-existing \
             --exclude-glob .ftpsnapfs_* {} {}",
            self.open_command(),
            PGET_SEGMENTS,
            quote(&remote),
            quote(&local.to_string_lossy())
        )
    }

    fn run(&self, script: &str) -> Result<()> {
        debug!("{} -c {}", self.program, script);
        let status = Command::new(&self.program)
            .arg("-c")
            .arg(script)
            .env("LFTP_PASSWORD", &self.remote.password)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            error!("{} exited with {}", self.program, status);
            Err(Error::Failure(format!("{} exited with {}", self.program, status)))
        }
    }
}

impl BulkTransfer for LftpTransfer {
    fn bulk_fetch(&self, relative: &str) -> Result<()> {
        info!("bulk fetch of {}", relative);
        self.run(&self.fetch_script(relative))
    }

    fn mirror_directory(&self, relative: &str) -> Result<()> {
        info!("mirroring {}", relative);
        self.run(&self.mirror_script(relative))
    }
}
