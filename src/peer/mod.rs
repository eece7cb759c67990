//! Peer-to-peer transfer protocol: a control channel for commands and a
//! separate data channel carrying the raw bytes of one file.

mod fetch;
mod server;

pub use fetch::{FetchConfig, FetchOutcome, PeerFetch};
pub use server::{PeerServer, ServerConfig};

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::protocol::{CONTROL_PORT, DATA_PORT};
use crate::share;

/// Where a remote peer serves files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub control_port: u16,
    pub data_port: u16,
}

impl PeerAddress {
    /// A peer on the protocol's fixed ports
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_ports(host, CONTROL_PORT, DATA_PORT)
    }

    pub fn with_ports(host: impl Into<String>, control_port: u16, data_port: u16) -> Self {
        Self {
            host: host.into(),
            control_port,
            data_port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.control_port)
    }
}

/// One file transfer: what to ask for, how many bytes the remote announced,
/// and where the bytes end up locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub filename: String,
    pub declared_size: u64,
    pub path: PathBuf,
}

impl TransferDescriptor {
    pub fn new(share_dir: &Path, filename: &str, declared_size: u64) -> Result<Self> {
        let path = share::resolve(share_dir, filename)
            .map_err(|e| Error::local_file(share_dir.join(filename), e))?;
        Ok(Self {
            filename: filename.to_string(),
            declared_size,
            path,
        })
    }
}
