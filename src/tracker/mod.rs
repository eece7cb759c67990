//! Client side of the tracker protocol.

use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::network::{self, Connection};
use crate::peer::{FetchOutcome, PeerAddress, PeerFetch};
use crate::protocol::{
    ADD, CONNECT, CONTROL_PORT, DATA_PORT, DELETE, GOODBYE, HELLO, LIST, QUIT, REQUEST,
};
use crate::share::SharedFile;

/// One entry of a tracker listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    pub name: String,
    pub size: u64,
}

/// An open, handshaken connection to the tracker
pub struct TrackerSession {
    conn: Connection,
    greeting: String,
    peer_ports: (u16, u16),
}

impl TrackerSession {
    /// Connect, read the greeting and perform the `CONNECT`/`HELLO` handshake.
    ///
    /// The tracker reads one command per `recv()` and compares it verbatim,
    /// so commands go out without a line terminator. Replies are lines.
    pub async fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let mut conn = network::connect(host, port, timeout).await?.unterminated();
        let greeting = conn.receive_line().await?.ok_or(Error::Disconnected)?;
        conn.send(CONNECT).await?;
        conn.expect(HELLO, "tracker").await?;
        info!(tracker = %conn.peer_addr(), "connected to tracker");

        Ok(Self {
            conn,
            greeting,
            peer_ports: (CONTROL_PORT, DATA_PORT),
        })
    }

    /// Ports assumed for every peer the tracker names
    pub fn with_peer_ports(mut self, control_port: u16, data_port: u16) -> Self {
        self.peer_ports = (control_port, data_port);
        self
    }

    /// The informational line the tracker sends on connect
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// Register one file
    pub async fn add(&mut self, file: &SharedFile) -> Result<()> {
        let size = file.size.to_string();
        self.conn
            .send_command(ADD, &[file.name.as_str(), file.hash.as_str(), size.as_str()])
            .await?;
        self.conn.receive().await?.expect_ok()?;
        debug!(file = file.name.as_str(), "indexed");
        Ok(())
    }

    /// Register every file, stopping at the first rejection
    pub async fn index(&mut self, files: &[SharedFile]) -> Result<usize> {
        for file in files {
            self.add(file).await?;
        }
        info!(count = files.len(), "indexed files with tracker");
        Ok(files.len())
    }

    /// Withdraw one file
    pub async fn remove(&mut self, name: &str, hash: &str) -> Result<()> {
        self.conn.send_command(DELETE, &[name, hash]).await?;
        self.conn.receive().await?.expect_ok()?;
        debug!(file = name, "removed from tracker");
        Ok(())
    }

    /// Enumerate every file known to the tracker
    pub async fn list(&mut self) -> Result<Vec<ListedFile>> {
        self.conn.send(LIST).await?;
        let records = self.read_records().await?;
        Ok(records
            .into_iter()
            .map(|(name, size)| ListedFile { name, size })
            .collect())
    }

    /// Resolve a filename to the peers serving it, in tracker order
    pub async fn request(&mut self, name: &str) -> Result<Vec<(PeerAddress, u64)>> {
        self.conn.send_command(REQUEST, &[name]).await?;
        let (control_port, data_port) = self.peer_ports;
        let records = self.read_records().await?;
        debug!(file = name, peers = records.len(), "resolved peers");
        Ok(records
            .into_iter()
            .map(|(host, size)| (PeerAddress::with_ports(host, control_port, data_port), size))
            .collect())
    }

    /// Resolve `name` and fetch it from the first peer that delivers
    pub async fn fetch(&mut self, fetch: &PeerFetch, name: &str) -> Result<FetchOutcome> {
        let offers = self.request(name).await?;
        if offers.is_empty() {
            return Err(Error::NotFound(name.to_string()));
        }
        fetch.fetch_first(name, &offers).await
    }

    /// `QUIT`/`GOODBYE` and close the connection
    pub async fn quit(mut self) -> Result<()> {
        self.conn.send(QUIT).await?;
        self.conn.expect(GOODBYE, "tracker").await?;
        self.conn.close().await?;
        info!("closed connection to tracker");
        Ok(())
    }

    /// Read `<token> <size>` lines up to the terminating `OK` / `ERROR`
    async fn read_records(&mut self) -> Result<Vec<(String, u64)>> {
        let mut records = Vec::new();
        loop {
            let msg = self.conn.receive().await?;
            if msg.is_terminal() {
                msg.expect_ok()?;
                return Ok(records);
            }
            records.push(msg.sized_record()?);
        }
    }
}
