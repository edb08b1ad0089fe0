//! FTP Remote Session
//!
//! Implements the remote session over plain FTP or explicit FTPS using the
//! suppaftp crate. Metadata comes from MLST/MLSD facts; mutations the base
//! protocol lacks go through SITE commands.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, SystemTime};

use chrono::NaiveDateTime;
use log::{debug, error, info, trace, warn};
use nix::sys::socket::{setsockopt, sockopt};
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::{FileType, Mode};
use suppaftp::{FtpError, FtpStream, NativeTlsConnector, NativeTlsFtpStream};

use crate::config::RemoteSettings;
use crate::error::{Error, Result};
use crate::path;
use crate::remote::{Connector, RemoteDirEntry, RemoteSession};
use crate::stat::{system_time, FileKind, StatAttributes};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const KEEPALIVE_IDLE_SECS: u32 = 120;
pub const KEEPALIVE_PROBES: u32 = 5;
pub const KEEPALIVE_INTERVAL_SECS: u32 = 5;

/// Enum to handle both plain and TLS FTP streams
enum FtpStreamVariant {
    Plain(FtpStream),
    Tls(NativeTlsFtpStream),
}

/// Run the same expression against whichever stream variant is live.
macro_rules! with_stream {
    ($stream:expr, $s:ident => $body:expr) => {
        match $stream {
            FtpStreamVariant::Plain($s) => $body,
            FtpStreamVariant::Tls($s) => $body,
        }
    };
}

/// One logged-in FTP control connection plus its open cursors.
pub struct FtpSession {
    stream: FtpStreamVariant,
    listing: Option<VecDeque<String>>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
}

pub struct FtpConnector {
    settings: RemoteSettings,
}

/// Translate an FTP reply into an error kind.
pub fn reply_error(code: u32, body: &str, path: &str) -> Error {
    let what = format!("{}: {} {}", path, code, body.trim());
    let lower = body.to_ascii_lowercase();
    match code {
        550 if lower.contains("permission") || lower.contains("denied") => {
            Error::PermissionDenied(what)
        }
        550 => Error::NotFound(what),
        530 | 532 => Error::PermissionDenied(what),
        421 => Error::NotConnected(what),
        426 => Error::ConnectionLost(what),
        500 | 501 => Error::BadMessage(what),
        502 | 504 => Error::Unsupported(what),
        503 => Error::InvalidHandle(what),
        452 | 552 => Error::NoMedium(what),
        553 if lower.contains("exists") => Error::AlreadyExists(what),
        553 => Error::WriteProtected(what),
        450 | 451 => Error::Failure(what),
        _ => Error::NotFound(what),
    }
}

fn io_error(err: io::Error, path: &str) -> Error {
    match err.kind() {
        io::ErrorKind::NotConnected
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock => Error::ConnectionLost(format!("{}: {}", path, err)),
        _ => Error::Io(err),
    }
}

fn ftp_error(err: FtpError, path: &str) -> Error {
    let mapped = match err {
        FtpError::ConnectionError(e) => io_error(e, path),
        FtpError::UnexpectedResponse(resp) => {
            reply_error(resp.status.code(), &String::from_utf8_lossy(&resp.body), path)
        }
        FtpError::BadResponse => Error::BadMessage(path.to_string()),
        other => Error::Failure(format!("{}: {}", path, other)),
    };
    if !mapped.is_not_found() {
        debug!("ftp error on {}: {}", path, mapped);
    }
    mapped
}

/// Permission bits from an RFC 3659 `perm` fact, for servers without `unix.mode`.
fn parse_perm_fact(kind: FileKind, perm: &str) -> u32 {
    let mut mode: u32 = 0;
    let has = |c: char| perm.contains(c);

    if kind == FileKind::Directory {
        if has('e') || has('l') {
            mode |= 0o555;
        }
        if has('c') || has('m') || has('p') || has('d') {
            mode |= 0o200;
        }
    } else {
        if has('r') {
            mode |= 0o444;
        }
        if has('w') || has('a') {
            mode |= 0o200;
        }
    }

    mode
}

/// `modify` fact: `YYYYMMDDHHMMSS[.sss]` in UTC.
fn parse_modify_fact(value: &str) -> Option<SystemTime> {
    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (value, ""),
    };
    let time = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S")
        .ok()?
        .and_utc();
    let nanos = if fraction.is_empty() {
        0
    } else {
        let digits: String = fraction.chars().take(9).collect();
        let scale = 10u32.pow(9 - digits.len() as u32);
        digits.parse::<u32>().ok()? * scale
    };
    Some(system_time(time.timestamp(), nanos as i64))
}

/// One MLSX line parsed into its name, stat and (for links) target.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FactLine {
    name: String,
    stat: StatAttributes,
    link_target: Option<String>,
}

/// Parse a `fact=value;fact=value; name` line. `cdir`/`pdir` entries yield `None`.
fn parse_fact_line(line: &str) -> Option<FactLine> {
    let line = line.trim_start_matches(' ').trim_end_matches(['\r', '\n']);
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }

    let mut kind = None;
    let mut link_target = None;
    let mut size = 0u64;
    let mut mtime = None;
    let mut unix_mode = None;
    let mut perm_fact = None;
    let mut uid = None;
    let mut gid = None;

    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = match fact.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                let lower = value.to_ascii_lowercase();
                kind = Some(match lower.as_str() {
                    "file" => FileKind::RegularFile,
                    "dir" => FileKind::Directory,
                    "cdir" | "pdir" => return None,
                    _ if lower.starts_with("os.unix=slink") || lower.starts_with("os.unix=symlink") => {
                        link_target = value.split_once(':').map(|(_, t)| t.to_string());
                        FileKind::Symlink
                    }
                    _ => FileKind::RegularFile,
                });
            }
            "size" | "sizd" => size = value.parse().unwrap_or(0),
            "modify" => mtime = parse_modify_fact(value),
            "unix.mode" => unix_mode = u32::from_str_radix(value, 8).ok(),
            "perm" => perm_fact = Some(value.to_string()),
            "unix.uid" | "unix.owner" => uid = value.parse().ok(),
            "unix.gid" | "unix.group" => gid = value.parse().ok(),
            _ => trace!("ignoring fact {}", fact),
        }
    }

    let kind = kind.unwrap_or(FileKind::RegularFile);
    let perm = match (unix_mode, perm_fact) {
        (Some(mode), _) => mode,
        (None, Some(perm)) => parse_perm_fact(kind, &perm),
        (None, None) if kind == FileKind::Directory => 0o755,
        (None, None) if kind == FileKind::Symlink => 0o777,
        (None, None) => 0o644,
    };
    if kind == FileKind::Symlink {
        if let Some(target) = &link_target {
            size = target.len() as u64;
        }
    }

    let mut stat = StatAttributes::new(kind, perm, size, mtime.unwrap_or(SystemTime::UNIX_EPOCH));
    if let Some(uid) = uid {
        stat.uid = uid;
    }
    if let Some(gid) = gid {
        stat.gid = gid;
    }
    Some(FactLine {
        name: path::file_name(&path::normalize(name)).to_string(),
        stat,
        link_target,
    })
}

fn tune_socket(socket: &TcpStream) -> Result<()> {
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    setsockopt(socket, sockopt::KeepAlive, &true).map_err(io::Error::from)?;
    setsockopt(socket, sockopt::TcpKeepIdle, &KEEPALIVE_IDLE_SECS).map_err(io::Error::from)?;
    setsockopt(socket, sockopt::TcpKeepCount, &KEEPALIVE_PROBES).map_err(io::Error::from)?;
    setsockopt(socket, sockopt::TcpKeepInterval, &KEEPALIVE_INTERVAL_SECS)
        .map_err(io::Error::from)?;
    Ok(())
}

impl FtpConnector {
    pub fn new(settings: RemoteSettings) -> Self {
        FtpConnector { settings }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let address = self.settings.address();
        address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::NotConnected(format!("cannot resolve {}", address)))
    }
}

impl Connector for FtpConnector {
    type Session = FtpSession;

    fn connect(&self) -> Result<FtpSession> {
        let addr = self.resolve()?;
        let host = self.settings.host.as_str();
        info!("Connecting to FTP server at {}", addr);

        let stream = if self.settings.tls {
            // Create TLS connector
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| Error::NotConnected(format!("TLS setup failed: {}", e)))?;
            let native_connector = NativeTlsConnector::from(connector);

            let ftp_stream = NativeTlsFtpStream::connect_timeout(addr, CONNECT_TIMEOUT)
                .map_err(|e| ftp_error(e, host))?;
            tune_socket(ftp_stream.get_ref())?;
            let mut ftp_stream = ftp_stream
                .into_secure(native_connector, host)
                .map_err(|e| ftp_error(e, host))?;
            ftp_stream
                .login(&self.settings.user, &self.settings.password)
                .map_err(|e| ftp_error(e, host))?;
            FtpStreamVariant::Tls(ftp_stream)
        } else {
            let mut ftp_stream = FtpStream::connect_timeout(addr, CONNECT_TIMEOUT)
                .map_err(|e| ftp_error(e, host))?;
            tune_socket(ftp_stream.get_ref())?;
            ftp_stream
                .login(&self.settings.user, &self.settings.password)
                .map_err(|e| ftp_error(e, host))?;
            FtpStreamVariant::Plain(ftp_stream)
        };

        let mut session = FtpSession {
            stream,
            listing: None,
            reader: None,
            writer: None,
        };
        with_stream!(&mut session.stream, s => {
            s.set_mode(Mode::Passive);
            s.transfer_type(FileType::Binary)
        })
        .map_err(|e| ftp_error(e, host))?;

        info!("Successfully connected to FTP server");
        Ok(session)
    }

    fn describe(&self) -> String {
        format!(
            "{}://{}@{}{}",
            self.settings.scheme(),
            self.settings.user,
            self.settings.address(),
            self.settings.root_dir
        )
    }
}

impl FtpSession {
    fn socket(&self) -> &TcpStream {
        with_stream!(&self.stream, s => s.get_ref())
    }

    fn site(&mut self, command: &str, path: &str) -> Result<()> {
        debug!("SITE {}", command);
        let response = with_stream!(&mut self.stream, s => s.site(command))
            .map_err(|e| ftp_error(e, path))?;
        let code = response.status.code();
        if code >= 400 {
            return Err(reply_error(
                code,
                &String::from_utf8_lossy(&response.body),
                path,
            ));
        }
        Ok(())
    }

    fn mlst(&mut self, path: &str) -> Result<FactLine> {
        let line = with_stream!(&mut self.stream, s => s.mlst(Some(path)))
            .map_err(|e| ftp_error(e, path))?;
        parse_fact_line(&line).ok_or_else(|| Error::BadMessage(format!("{}: {}", path, line)))
    }

    fn close_reader(&mut self) -> Result<()> {
        match self.reader.take() {
            Some(reader) => with_stream!(&mut self.stream, s => s.finalize_retr_stream(reader))
                .map_err(|e| ftp_error(e, "RETR")),
            None => Ok(()),
        }
    }

    fn close_writer(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(mut writer) => {
                writer.flush().map_err(|e| io_error(e, "STOR"))?;
                with_stream!(&mut self.stream, s => s.finalize_put_stream(writer))
                    .map_err(|e| ftp_error(e, "STOR"))
            }
            None => Ok(()),
        }
    }

    fn store_empty(&mut self, path: &str) -> Result<()> {
        with_stream!(&mut self.stream, s => s.put_file(path, &mut io::empty()))
            .map_err(|e| ftp_error(e, path))?;
        Ok(())
    }
}

impl RemoteSession for FtpSession {
    fn is_connected(&self) -> bool {
        let socket = self.socket();
        if socket.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let alive = match socket.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        };
        alive && socket.set_nonblocking(false).is_ok()
    }

    fn noop(&mut self) -> Result<()> {
        with_stream!(&mut self.stream, s => s.noop()).map_err(|e| ftp_error(e, "NOOP"))
    }

    fn stat(&mut self, path: &str) -> Result<StatAttributes> {
        trace!("MLST {}", path);
        Ok(self.mlst(path)?.stat)
    }

    fn read_link(&mut self, path: &str) -> Result<String> {
        let fact = self.mlst(path)?;
        match (fact.stat.kind, fact.link_target) {
            (FileKind::Symlink, Some(target)) => Ok(target),
            (FileKind::Symlink, None) => Err(Error::Unsupported(format!(
                "{}: server does not report link targets",
                path
            ))),
            _ => Err(Error::InvalidHandle(format!("{}: not a symbolic link", path))),
        }
    }

    fn open_dir(&mut self, path: &str) -> Result<()> {
        debug!("MLSD {}", path);
        let lines = with_stream!(&mut self.stream, s => s.mlsd(Some(path)))
            .map_err(|e| ftp_error(e, path))?;
        self.listing = Some(lines.into());
        Ok(())
    }

    fn next_dir_entry(&mut self) -> Result<Option<RemoteDirEntry>> {
        let listing = self
            .listing
            .as_mut()
            .ok_or_else(|| Error::InvalidHandle("no directory open".to_string()))?;
        while let Some(line) = listing.pop_front() {
            match parse_fact_line(&line) {
                Some(fact) => {
                    return Ok(Some(RemoteDirEntry {
                        name: fact.name,
                        stat: fact.stat,
                    }))
                }
                None => trace!("skipping listing line {:?}", line),
            }
        }
        self.listing = None;
        Ok(None)
    }

    fn open_read(&mut self, path: &str) -> Result<()> {
        self.close_reader()?;
        debug!("RETR {}", path);
        let reader = with_stream!(&mut self.stream, s => s
            .retr_as_stream(path)
            .map(|data| Box::new(data) as Box<dyn Read + Send>))
        .map_err(|e| ftp_error(e, path))?;
        self.reader = Some(reader);
        Ok(())
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::InvalidHandle("no file open".to_string()))?;
        match reader.read(buf) {
            Ok(0) => {
                self.close_reader()?;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.reader = None;
                error!("transfer failed: {}", e);
                Err(io_error(e, "RETR"))
            }
        }
    }

    fn open_write(&mut self, path: &str) -> Result<()> {
        self.close_writer()?;
        debug!("STOR {}", path);
        let writer = with_stream!(&mut self.stream, s => s
            .put_with_stream(path)
            .map(|data| Box::new(data) as Box<dyn Write + Send>))
        .map_err(|e| ftp_error(e, path))?;
        self.writer = Some(writer);
        Ok(())
    }

    fn write_next(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::InvalidHandle("no file open".to_string()))?;
        if let Err(e) = writer.write_all(data) {
            self.writer = None;
            return Err(io_error(e, "STOR"));
        }
        Ok(())
    }

    fn close_write(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Err(Error::InvalidHandle("no file open".to_string()));
        }
        self.close_writer()
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        debug!("Creating directory: {}", path);
        with_stream!(&mut self.stream, s => s.mkdir(path)).map_err(|e| ftp_error(e, path))?;
        if let Err(e) = self.chmod(path, mode) {
            warn!("could not set mode of {}: {}", path, e);
        }
        Ok(())
    }

    fn mknod(&mut self, path: &str, mode: u32) -> Result<()> {
        match self.mlst(path) {
            Ok(_) => return Err(Error::AlreadyExists(path.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.store_empty(path)?;
        if let Err(e) = self.chmod(path, mode) {
            warn!("could not set mode of {}: {}", path, e);
        }
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        debug!("Deleting file: {}", path);
        with_stream!(&mut self.stream, s => s.rm(path)).map_err(|e| ftp_error(e, path))
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        debug!("Removing directory: {}", path);
        with_stream!(&mut self.stream, s => s.rmdir(path)).map_err(|e| ftp_error(e, path))
    }

    fn symlink(&mut self, target: &str, link: &str) -> Result<()> {
        self.site(&format!("SYMLINK {} {}", target, link), link)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        debug!("Renaming {} to {}", from, to);
        with_stream!(&mut self.stream, s => s.rename(from, to)).map_err(|e| ftp_error(e, from))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        self.site(&format!("CHMOD {:o} {}", mode & 0o7777, path), path)
    }

    fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.site(&format!("CHOWN {} {}", uid, path), path)?;
        self.site(&format!("CHGRP {} {}", gid, path), path)
    }

    fn truncate(&mut self, path: &str) -> Result<()> {
        debug!("Truncating {}", path);
        self.store_empty(path)
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        self.site(&format!("EXEC {}", command), command)
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        self.reader = None;
        self.writer = None;
        if self.is_connected() {
            if let Err(e) = with_stream!(&mut self.stream, s => s.quit()) {
                debug!("QUIT failed: {}", e);
            }
        }
    }
}
