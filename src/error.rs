use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorCode;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the tracker session, peer server and peer fetch.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote side answered a handshake with the wrong token
    #[error("{context} did not properly reply to handshake: expected {expected}, got {got:?}")]
    Handshake {
        context: &'static str,
        expected: &'static str,
        got: String,
    },

    /// The remote side answered with `ERROR <code>`
    #[error("{}", .0.description())]
    Remote(ErrorCode),

    /// A reply that is neither the expected token nor an `ERROR` line
    #[error("unexpected reply: {0:?}")]
    Unexpected(String),

    #[error("received an empty protocol message")]
    EmptyMessage,

    #[error("invalid protocol argument {0:?}: arguments must be non-empty and contain no spaces")]
    InvalidArgument(String),

    #[error("file {0:?} was not found on the tracker")]
    NotFound(String),

    #[error("invalid size field {0:?}")]
    InvalidSize(String),

    #[error("declared size {declared} exceeds the configured maximum of {max} bytes")]
    DeclaredSizeTooLarge { declared: u64, max: u64 },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection closed by remote")]
    Disconnected,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol line exceeds maximum length")]
    LineTooLong,

    #[error("local file {}: {source}", .path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn local_file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::LocalFile {
            path: path.into(),
            source,
        }
    }

    /// True for failures of the underlying connection rather than the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::Disconnected
                | Error::Timeout(_)
                | Error::LineTooLong
                | Error::Io(_)
        )
    }
}
