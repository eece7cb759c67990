//! Client configuration: defaults, then a TOML file, then environment.
//!
//! File: `--config <path>`, else `~/.config/p2pshare/config.toml`, else
//! `/etc/p2pshare/config.toml`. Env overrides: `P2PSHARE_TRACKER`,
//! `P2PSHARE_SHARE_DIR`, `P2PSHARE_CONTROL_PORT`, `P2PSHARE_DATA_PORT`.

use serde::{Deserialize, Deserializer};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::peer::{FetchConfig, ServerConfig};
use crate::protocol::{CONTROL_PORT, DATA_PORT, TRACKER_PORT};
use crate::share::DigestKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Tracker address as `host` or `host:port`
    #[serde(default = "default_tracker")]
    pub tracker: String,
    /// Directory whose files are indexed, served and fetched into
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    /// Local address the peer server binds
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Deadline for each blocking network operation; "none" blocks forever
    #[serde(default = "default_io_timeout", deserialize_with = "optional_duration")]
    pub io_timeout: Option<Duration>,
    /// Deadline for a peer to send OPEN; unset waits forever
    #[serde(default, deserialize_with = "optional_duration")]
    pub handshake_timeout: Option<Duration>,
    /// Refuse fetches whose declared size is above this many bytes
    #[serde(default)]
    pub max_declared_size: Option<u64>,
    #[serde(default)]
    pub digest: DigestKind,
}

fn default_tracker() -> String {
    format!("127.0.0.1:{}", TRACKER_PORT)
}
fn default_share_dir() -> PathBuf {
    PathBuf::from("./share")
}
fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_control_port() -> u16 {
    CONTROL_PORT
}
fn default_data_port() -> u16 {
    DATA_PORT
}
fn default_io_timeout() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

fn optional_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_optional_duration(&text).map_err(serde::de::Error::custom)
}

/// Parse "30s", "2m", ... or one of "none"/"off"/"0" for no deadline.
pub fn parse_optional_duration(text: &str) -> std::result::Result<Option<Duration>, String> {
    match text.trim() {
        "none" | "off" | "0" => Ok(None),
        other => humantime::parse_duration(other)
            .map(Some)
            .map_err(|e| format!("invalid duration {:?}: {}", other, e)),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker: default_tracker(),
            share_dir: default_share_dir(),
            bind: default_bind(),
            control_port: default_control_port(),
            data_port: default_data_port(),
            io_timeout: default_io_timeout(),
            handshake_timeout: None,
            max_declared_size: None,
            digest: DigestKind::default(),
        }
    }
}

impl Config {
    /// Load from an explicit file, or the first default location that exists,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match config_paths().into_iter().find(|p| p.exists()) {
                Some(found) => Self::from_file(&found)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::local_file(path, e))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `P2PSHARE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tracker) = lookup("P2PSHARE_TRACKER") {
            self.tracker = tracker;
        }
        if let Some(dir) = lookup("P2PSHARE_SHARE_DIR") {
            self.share_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("P2PSHARE_CONTROL_PORT") {
            self.control_port = parse_port("P2PSHARE_CONTROL_PORT", &port)?;
        }
        if let Some(port) = lookup("P2PSHARE_DATA_PORT") {
            self.data_port = parse_port("P2PSHARE_DATA_PORT", &port)?;
        }
        Ok(())
    }

    /// Split `tracker` into host and port, defaulting the port.
    pub fn tracker_addr(&self) -> Result<(String, u16)> {
        let tracker = self.tracker.trim();
        if tracker.is_empty() {
            return Err(Error::Config("tracker address is empty".to_string()));
        }
        match tracker.rsplit_once(':') {
            // A bare IPv6 literal has colons but no port
            Some((host, _)) if host.contains(':') && !host.starts_with('[') => {
                Ok((tracker.to_string(), TRACKER_PORT))
            }
            Some((host, port)) => {
                let port = parse_port("tracker", port)?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok((host.to_string(), port))
            }
            None => Ok((tracker.to_string(), TRACKER_PORT)),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            share_dir: self.share_dir.clone(),
            bind: self.bind,
            control_port: self.control_port,
            data_port: self.data_port,
            io_timeout: self.io_timeout,
            handshake_timeout: self.handshake_timeout,
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            share_dir: self.share_dir.clone(),
            io_timeout: self.io_timeout,
            max_declared_size: self.max_declared_size,
        }
    }
}

fn parse_port(what: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("{}: invalid port {:?}", what, value)))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/p2pshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2pshare/config.toml"));
    out
}
