//! Peer-to-peer file sharing client.
//!
//! Files in a local share directory are registered with a central tracker
//! and served to other peers. Files are pulled from peers the tracker names
//! over a two-socket protocol: line commands on a control connection, raw
//! bytes on a data connection.

pub mod config;
pub mod error;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod share;
pub mod tracker;

pub use config::Config;
pub use error::{Error, Result};
pub use peer::{FetchConfig, FetchOutcome, PeerAddress, PeerFetch, PeerServer, ServerConfig};
pub use protocol::{ErrorCode, Message};
pub use share::SharedFile;
pub use tracker::{ListedFile, TrackerSession};
