//! Main entry point for ftpsnapfs
//!
//! Mounts an FTP tree through a local snapshot cache, mounts an existing cache
//! offline, or advances the refresh epoch of a cache that is already mounted.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use env_logger::Env;
use fuser::MountOption;
use log::{debug, error, info};
use url::Url;

use ftpsnapfs::config::DEFAULT_FTP_PORT;
use ftpsnapfs::{
    BulkTransfer, CacheEngine, CacheFs, Config, ConnectionPool, FtpConnector, LftpTransfer,
    RefreshEpoch, RemoteSettings,
};

/// What the first positional argument asks for.
#[derive(Debug)]
enum Source {
    Remote(RemoteSettings),
    Offline,
    Refresh,
}

fn cli() -> Command {
    Command::new("ftpsnapfs")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Mount FTP hosts through a local snapshot cache using FUSE")
        .arg(
            Arg::new("source")
                .help(
                    "ftp[s]://[user[:password]@]host[:port][/path], \
                     'offline' to serve the cache alone, or 'refresh' to start a new refresh epoch",
                )
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("mountpoint")
                .help("Local directory to mount the filesystem on")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .help("Username for FTP authentication")
                .value_name("USERNAME"),
        )
        .arg(
            Arg::new("password")
                .short('p')
                .long("password")
                .help("Password for FTP authentication")
                .value_name("PASSWORD")
                .env("FTPSNAPFS_PW")
                .hide_env_values(true),
        )
        .arg(
            Arg::new("port")
                .short('P')
                .long("port")
                .help("FTP port (default: 21)")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("tls")
                .long("tls")
                .help("Use TLS/SSL encryption")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("read_only")
                .short('r')
                .long("read-only")
                .help("Mount filesystem as read-only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cache_dir")
                .short('c')
                .long("cache-dir")
                .help("Cache directory (default: <user cache dir>/ftpsnapfs/<mountpoint>)")
                .value_name("DIR"),
        )
        .arg(
            Arg::new("snapshot")
                .short('s')
                .long("snapshot")
                .help("Mount the named snapshot inside the cache directory, offline")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Enable debug output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("allow_other")
                .long("allow-other")
                .help("Allow other users to access the mount")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("refresh_cache")
                .long("refresh-cache")
                .help("Bring every cached file up to date with the remote, then exit")
                .action(ArgAction::SetTrue)
                .conflicts_with_all(["clean_cache", "delete_cache"]),
        )
        .arg(
            Arg::new("clean_cache")
                .long("clean-cache")
                .help("Delete cached file content but keep the directory tree, then exit")
                .action(ArgAction::SetTrue)
                .conflicts_with("delete_cache"),
        )
        .arg(
            Arg::new("delete_cache")
                .long("delete-cache")
                .help("Delete the whole cache, then exit")
                .action(ArgAction::SetTrue),
        )
}

fn main() -> Result<()> {
    let matches = cli().get_matches();

    let level = if matches.get_flag("debug") { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    if let Err(e) = run(&matches) {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<()> {
    let source_str = matches
        .get_one::<String>("source")
        .ok_or_else(|| anyhow!("missing source"))?;
    let mountpoint_str = matches
        .get_one::<String>("mountpoint")
        .ok_or_else(|| anyhow!("missing mountpoint"))?;

    debug!("Source: {}", source_str);
    debug!("Mountpoint: {}", mountpoint_str);

    let mountpoint = absolute(Path::new(mountpoint_str))?;
    let mut cache_dir = match matches.get_one::<String>("cache_dir") {
        Some(dir) => absolute(Path::new(dir))?,
        None => default_cache_dir(&mountpoint)?,
    };
    info!("Cache directory: {:?}", cache_dir);

    let source = match parse_source(source_str)? {
        Source::Remote(remote) => Source::Remote(apply_overrides(remote, matches)?),
        other => other,
    };

    if let Source::Refresh = source {
        let epoch = RefreshEpoch::new(&cache_dir)
            .start()
            .with_context(|| format!("Failed to start a refresh epoch in {:?}", cache_dir))?;
        info!("Refresh epoch started at {:?}", epoch);
        return Ok(());
    }

    if matches.get_flag("clean_cache") || matches.get_flag("delete_cache") {
        let engine = CacheEngine::<FtpConnector>::offline(Arc::new(Config::offline(&cache_dir)))
            .with_context(|| format!("Cannot open cache {:?}", cache_dir))?;
        let removed = if matches.get_flag("delete_cache") {
            engine.delete_cache()?
        } else {
            engine.clean_cache()?
        };
        info!("Removed {} cache entries", removed);
        return Ok(());
    }

    let snapshot = matches.get_one::<String>("snapshot");
    if let Some(name) = snapshot {
        cache_dir = cache_dir.join(name);
    }

    let (engine, fsname) = match source {
        Source::Remote(remote) if snapshot.is_none() => {
            let fsname = format!("ftpsnapfs@{}", remote.address());
            let mut config = Config::online(&cache_dir, remote.clone());
            config.read_only = matches.get_flag("read_only");

            info!("Connecting to FTP server: {}", remote.address());
            info!("Username: {}", remote.user);
            info!("TLS: {}", remote.tls);
            info!("Path: {}", remote.root_dir);

            let pool = Arc::new(ConnectionPool::new(FtpConnector::new(remote.clone())));
            let bulk: Arc<dyn BulkTransfer> =
                Arc::new(LftpTransfer::new(remote, cache_dir.clone()));
            let engine = CacheEngine::online(Arc::new(config), pool, bulk)
                .context("Failed to connect to FTP server")?;

            if matches.get_flag("refresh_cache") {
                let refreshed = engine.refresh_cache()?;
                info!("Refreshed {} cached directories", refreshed);
                return Ok(());
            }
            (engine, fsname)
        }
        _ => {
            if matches.get_flag("refresh_cache") {
                bail!("--refresh-cache needs a remote source");
            }
            let engine = CacheEngine::<FtpConnector>::offline(Arc::new(Config::offline(&cache_dir)))
                .with_context(|| format!("Cannot open cache {:?}", cache_dir))?;
            (engine, format!("ftpsnapfs@{}", cache_dir.display()))
        }
    };

    if !mountpoint.exists() {
        std::fs::create_dir_all(&mountpoint)
            .with_context(|| format!("Failed to create mountpoint: {:?}", mountpoint))?;
        info!("Created mountpoint: {:?}", mountpoint);
    }

    let mut options = vec![
        MountOption::FSName(fsname),
        MountOption::Subtype("ftpsnapfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if engine.config().read_only {
        options.push(MountOption::RO);
    }
    if matches.get_flag("allow_other") {
        options.push(MountOption::AllowOther);
    }

    info!("Mounting on {:?}", mountpoint);
    debug!("Options: {:?}", options);

    let filesystem = CacheFs::new(Arc::new(engine));
    fuser::mount2(filesystem, &mountpoint, &options)
        .with_context(|| format!("Failed to mount on {:?}", mountpoint))?;
    info!("Filesystem unmounted");
    Ok(())
}

fn parse_source(source: &str) -> Result<Source> {
    match source {
        "offline" => Ok(Source::Offline),
        "refresh" => Ok(Source::Refresh),
        url => parse_ftp_url(url).map(Source::Remote),
    }
}

/// Parse an FTP URL into connection settings
fn parse_ftp_url(url_str: &str) -> Result<RemoteSettings> {
    let url_str = if !url_str.contains("://") {
        format!("ftp://{}", url_str)
    } else {
        url_str.to_string()
    };

    let url = Url::parse(&url_str).context("Failed to parse FTP URL")?;

    if url.scheme() != "ftp" && url.scheme() != "ftps" {
        bail!("URL scheme must be 'ftp://' or 'ftps://'");
    }

    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("FTP URL must contain a host"))?;

    let mut remote = RemoteSettings::new(host, url.username());
    remote.port = url.port().unwrap_or(DEFAULT_FTP_PORT);
    remote.tls = url.scheme() == "ftps";
    remote.password = url.password().unwrap_or_default().to_string();
    let path = url.path().trim_end_matches('/');
    if !path.is_empty() {
        remote.root_dir = path.to_string();
    }
    Ok(remote)
}

/// Command line options win over what the URL says.
fn apply_overrides(mut remote: RemoteSettings, matches: &ArgMatches) -> Result<RemoteSettings> {
    if let Some(user) = matches.get_one::<String>("user") {
        remote.user = user.clone();
    }
    if let Some(password) = matches.get_one::<String>("password") {
        remote.password = password.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        remote.port = *port;
    }
    if matches.get_flag("tls") {
        remote.tls = true;
    }
    if remote.user.is_empty() {
        bail!("Username is required. Use --user flag or include in FTP URL");
    }
    Ok(remote)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()
            .context("Cannot determine the current directory")?
            .join(path))
    }
}

/// One cache per mountpoint, named after the mountpoint's path.
fn default_cache_dir(mountpoint: &Path) -> Result<PathBuf> {
    let base = dirs::cache_dir().ok_or_else(|| anyhow!("No user cache directory; use --cache-dir"))?;
    let name = mountpoint
        .to_string_lossy()
        .trim_matches('/')
        .replace('/', "_");
    Ok(base.join("ftpsnapfs").join(name))
}
