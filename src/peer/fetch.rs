use indicatif::ProgressBar;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{PeerAddress, TransferDescriptor};
use crate::error::{Error, Result};
use crate::network::{self, with_timeout, Connection};
use crate::protocol::{CLOSE, GET, GOODBYE, HELLO, OPEN};

/// Settings for fetching files from other peers
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Fetched files are written here
    pub share_dir: PathBuf,
    pub io_timeout: Option<Duration>,
    /// Refuse transfers declaring more bytes than this
    pub max_declared_size: Option<u64>,
}

/// Result of one completed fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub peer: PeerAddress,
    pub path: PathBuf,
    pub declared_size: u64,
    pub received: u64,
}

impl FetchOutcome {
    /// False when the data channel ended before the declared size arrived
    pub fn is_complete(&self) -> bool {
        self.received == self.declared_size
    }
}

/// Pulls files from remote peers into the local share directory
pub struct PeerFetch {
    config: FetchConfig,
    progress: Option<ProgressBar>,
}

impl PeerFetch {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    /// Report received bytes on `bar`
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// Describe a transfer of `filename` into the share directory
    pub fn descriptor(&self, filename: &str, declared_size: u64) -> Result<TransferDescriptor> {
        if let Some(max) = self.config.max_declared_size {
            if declared_size > max {
                return Err(Error::DeclaredSizeTooLarge {
                    declared: declared_size,
                    max,
                });
            }
        }
        TransferDescriptor::new(&self.config.share_dir, filename, declared_size)
    }

    /// Try each offer in order until one fetch succeeds.
    ///
    /// Returns the last failure when every peer fails.
    pub async fn fetch_first(
        &self,
        filename: &str,
        offers: &[(PeerAddress, u64)],
    ) -> Result<FetchOutcome> {
        let mut last_error = Error::NotFound(filename.to_string());
        for (peer, size) in offers {
            let attempt = match self.descriptor(filename, *size) {
                Ok(descriptor) => self.fetch(peer, &descriptor).await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(%peer, file = filename, error = %e, "fetch from peer failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Fetch one file from one peer
    pub async fn fetch(
        &self,
        peer: &PeerAddress,
        descriptor: &TransferDescriptor,
    ) -> Result<FetchOutcome> {
        let timeout = self.config.io_timeout;
        let mut control = network::connect(&peer.host, peer.control_port, timeout).await?;
        control.send(OPEN).await?;
        control.expect(HELLO, "peer").await?;
        debug!(%peer, "peer handshake complete");

        let result = self.transfer(&mut control, peer, descriptor).await;

        // the control channel is only worth closing politely if it still works
        if matches!(result, Ok(_) | Err(Error::Remote(_))) {
            close_session(control).await;
        }
        result
    }

    async fn transfer(
        &self,
        control: &mut Connection,
        peer: &PeerAddress,
        descriptor: &TransferDescriptor,
    ) -> Result<FetchOutcome> {
        let timeout = self.config.io_timeout;
        let mut data = network::connect_stream(&peer.host, peer.data_port, timeout).await?;
        control
            .send_command(GET, &[descriptor.filename.as_str()])
            .await?;

        info!(
            %peer,
            file = descriptor.filename.as_str(),
            size = descriptor.declared_size,
            "initiating file transfer"
        );
        let buffer = self.receive_data(&mut data, descriptor.declared_size).await?;
        drop(data);

        control.receive().await?.expect_ok()?;

        tokio::fs::write(&descriptor.path, &buffer)
            .await
            .map_err(|e| Error::local_file(&descriptor.path, e))?;

        let outcome = FetchOutcome {
            peer: peer.clone(),
            path: descriptor.path.clone(),
            declared_size: descriptor.declared_size,
            received: buffer.len() as u64,
        };
        if outcome.is_complete() {
            info!(
                %peer,
                file = descriptor.filename.as_str(),
                bytes = outcome.received,
                "file transfer complete"
            );
        } else {
            warn!(
                %peer,
                file = descriptor.filename.as_str(),
                declared = outcome.declared_size,
                received = outcome.received,
                "data channel closed early, kept short file"
            );
        }
        Ok(outcome)
    }

    /// Read until `declared_size` bytes arrived or the stream ends
    async fn receive_data(&self, data: &mut TcpStream, declared_size: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(declared_size).map_err(|_| Error::DeclaredSizeTooLarge {
            declared: declared_size,
            max: usize::MAX as u64,
        })?;
        if let Some(bar) = &self.progress {
            bar.set_length(declared_size);
            bar.set_position(0);
        }

        let mut buffer = vec![0u8; len];
        let mut received = 0;
        while received < len {
            let n = with_timeout(self.config.io_timeout, async {
                data.read(&mut buffer[received..]).await.map_err(Error::from)
            })
            .await?;
            if n == 0 {
                break;
            }
            received += n;
            if let Some(bar) = &self.progress {
                bar.set_position(received as u64);
            }
        }
        buffer.truncate(received);

        if let Some(bar) = &self.progress {
            bar.finish();
        }
        Ok(buffer)
    }
}

async fn close_session(mut control: Connection) {
    let peer = control.peer_addr();
    if let Err(e) = control.send(CLOSE).await {
        debug!(%peer, error = %e, "could not send CLOSE");
        return;
    }
    if let Err(e) = control.expect(GOODBYE, "peer").await {
        warn!(%peer, error = %e, "peer did not properly reply to exit handshake");
    }
    let _ = control.close().await;
}
