use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::network::{with_timeout, Connection};
use crate::protocol::{ErrorCode, Message, CLOSE, GET, GOODBYE, HELLO, OK, OPEN};
use crate::share;

const WRITE_CHUNK_SIZE: usize = 64 * 1024; // 64 KB writes

/// Parked data connections nobody claimed for this long are dropped
const STALE_DATA_AFTER: Duration = Duration::from_secs(300);

/// Settings for the peer file server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub share_dir: PathBuf,
    pub bind: IpAddr,
    pub control_port: u16,
    pub data_port: u16,
    /// Deadline for each read, write and data-connection claim
    pub io_timeout: Option<Duration>,
    /// Deadline for a peer to open the session; `None` waits forever
    pub handshake_timeout: Option<Duration>,
}

/// Serves files from the share directory to other peers.
///
/// Control connections arrive on the control port and each runs in its own
/// task. Data connections arrive on the data port and wait, keyed by remote
/// IP, until a `GET` from the same IP claims one. The data port cannot tell
/// two sessions from one IP apart, so a second session from an IP is not
/// greeted until the first has said `GOODBYE`.
pub struct PeerServer {
    control: TcpListener,
    data: TcpListener,
    config: Arc<ServerConfig>,
}

impl PeerServer {
    /// Bind both listening sockets
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let control = TcpListener::bind((config.bind, config.control_port)).await?;
        let data = TcpListener::bind((config.bind, config.data_port)).await?;
        Ok(Self {
            control,
            data,
            config: Arc::new(config),
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    pub fn data_addr(&self) -> Result<SocketAddr> {
        Ok(self.data.local_addr()?)
    }

    /// Run the server on a background task
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Accept peers until the control listener fails
    pub async fn run(self) -> Result<()> {
        info!(
            control = %self.control_addr()?,
            data = %self.data_addr()?,
            share = %self.config.share_dir.display(),
            "peer server listening"
        );

        let pending = Arc::new(PendingData::default());
        let slots = Arc::new(SessionSlots::default());
        let data_task = tokio::spawn(accept_data(self.data, pending.clone()));

        let result = loop {
            let (stream, addr) = match self.control.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(Error::from(e)),
            };
            let conn = Connection::new(stream, addr, self.config.io_timeout);
            let config = self.config.clone();
            let pending = pending.clone();
            let slots = slots.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(conn, config, pending, slots).await {
                    warn!(peer = %addr, error = %e, "peer session ended with error");
                }
            });
        };

        data_task.abort();
        if let Err(ref e) = result {
            error!(error = %e, "peer server stopped");
        }
        result
    }
}

async fn accept_data(listener: TcpListener, pending: Arc<PendingData>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "data connection parked");
                pending.park(addr.ip(), stream).await;
            }
            Err(e) => {
                warn!(error = %e, "failed to accept data connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Data connections accepted but not yet claimed by a `GET`
#[derive(Default)]
struct PendingData {
    parked: Mutex<HashMap<IpAddr, VecDeque<(Instant, TcpStream)>>>,
    arrived: Notify,
}

impl PendingData {
    async fn park(&self, ip: IpAddr, stream: TcpStream) {
        let mut parked = self.parked.lock().await;
        for queue in parked.values_mut() {
            queue.retain(|(since, _)| since.elapsed() < STALE_DATA_AFTER);
        }
        parked.retain(|_, queue| !queue.is_empty());
        parked
            .entry(ip.to_canonical())
            .or_default()
            .push_back((Instant::now(), stream));
        drop(parked);
        self.arrived.notify_waiters();
    }

    /// Wait for the oldest data connection from `ip`
    async fn claim(&self, ip: IpAddr) -> TcpStream {
        let ip = ip.to_canonical();
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(stream) = self.take(ip).await {
                return stream;
            }
            notified.await;
        }
    }

    /// Drop every data connection parked for `ip`
    async fn discard(&self, ip: IpAddr) {
        let mut parked = self.parked.lock().await;
        if let Some(queue) = parked.remove(&ip.to_canonical()) {
            debug!(%ip, count = queue.len(), "dropped unclaimed data connections");
        }
    }

    async fn take(&self, ip: IpAddr) -> Option<TcpStream> {
        let mut parked = self.parked.lock().await;
        let queue = parked.get_mut(&ip)?;
        let (_, stream) = queue.pop_front()?;
        if queue.is_empty() {
            parked.remove(&ip);
        }
        Some(stream)
    }
}

/// One open session per remote IP
#[derive(Default)]
struct SessionSlots {
    slots: Mutex<HashMap<IpAddr, Arc<Mutex<()>>>>,
}

impl SessionSlots {
    /// Wait until no other session from `ip` is open
    async fn acquire(&self, ip: IpAddr) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(ip.to_canonical()).or_default().clone()
        };
        match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(%ip, "waiting for the open session from this address to end");
                slot.lock_owned().await
            }
        }
    }
}

enum Opening {
    Open,
    Close,
    Hangup,
}

async fn handle_connection(
    mut conn: Connection,
    config: Arc<ServerConfig>,
    pending: Arc<PendingData>,
    slots: Arc<SessionSlots>,
) -> Result<()> {
    let peer = conn.peer_addr();
    debug!(%peer, "control connection accepted");

    match await_open(&mut conn, &config).await? {
        Opening::Open => {}
        Opening::Close => {
            debug!(%peer, "peer closed before handshake");
            return conn.close().await;
        }
        Opening::Hangup => {
            debug!(%peer, "peer hung up before handshake");
            return Ok(());
        }
    }

    let _slot = slots.acquire(peer.ip()).await;
    conn.send(HELLO).await?;
    info!(%peer, "peer opened session");

    let outcome = command_loop(&mut conn, &config, &pending).await;

    if let Err(e) = conn.send(GOODBYE).await {
        debug!(%peer, error = %e, "could not send GOODBYE");
    }
    let _ = conn.close().await;
    // whatever this session left parked must not reach the next one
    pending.discard(peer.ip()).await;
    info!(%peer, "peer session closed");
    outcome
}

/// Read lines until `OPEN` or `CLOSE`, discarding anything else.
///
/// `HELLO` is sent by the caller once the session holds its slot.
async fn await_open(conn: &mut Connection, config: &ServerConfig) -> Result<Opening> {
    conn.set_timeout(None);
    let opening = with_timeout(config.handshake_timeout, async {
        loop {
            match conn.receive_line().await? {
                None => return Ok(Opening::Hangup),
                Some(line) if line == OPEN => return Ok(Opening::Open),
                Some(line) if line == CLOSE => return Ok(Opening::Close),
                Some(line) => debug!(line = line.as_str(), "discarding line before handshake"),
            }
        }
    })
    .await;
    conn.set_timeout(config.io_timeout);
    opening
}

async fn command_loop(
    conn: &mut Connection,
    config: &ServerConfig,
    pending: &PendingData,
) -> Result<()> {
    let peer = conn.peer_addr();
    loop {
        let Some(line) = conn.receive_line().await? else {
            debug!(%peer, "peer hung up");
            return Ok(());
        };

        let msg = match Message::parse(&line) {
            Ok(msg) => msg,
            Err(_) => {
                conn.send(&ErrorCode::UnknownCommand.to_string()).await?;
                continue;
            }
        };

        match msg.command() {
            GET => {
                let reply = serve_get(msg.arg(0), peer.ip(), config, pending).await;
                conn.send(&reply).await?;
            }
            CLOSE => return Ok(()),
            other => {
                warn!(%peer, command = other, "unknown command");
                conn.send(&ErrorCode::UnknownCommand.to_string()).await?;
            }
        }
    }
}

/// Handle one `GET`, returning the control-channel reply
async fn serve_get(
    filename: Option<&str>,
    peer_ip: IpAddr,
    config: &ServerConfig,
    pending: &PendingData,
) -> String {
    let Some(filename) = filename else {
        return ErrorCode::MissingFilename.to_string();
    };

    match send_file(filename, peer_ip, config, pending).await {
        Ok(bytes) => {
            info!(peer = %peer_ip, file = filename, bytes, "sent file");
            OK.to_string()
        }
        Err(e) => {
            warn!(peer = %peer_ip, file = filename, error = %e, "transfer failed");
            ErrorCode::TransferFailed.to_string()
        }
    }
}

async fn send_file(
    filename: &str,
    peer_ip: IpAddr,
    config: &ServerConfig,
    pending: &PendingData,
) -> Result<u64> {
    let mut data =
        with_timeout(config.io_timeout, async { Ok(pending.claim(peer_ip).await) }).await?;

    let path = share::resolve(&config.share_dir, filename)
        .map_err(|e| Error::local_file(config.share_dir.join(filename), e))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| Error::local_file(&path, e))?;

    for chunk in bytes.chunks(WRITE_CHUNK_SIZE) {
        with_timeout(config.io_timeout, async {
            data.write_all(chunk).await.map_err(Error::from)
        })
        .await?;
    }
    data.shutdown().await?;
    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connect;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpSocket;

    async fn start_server(share: &TempDir) -> (u16, u16) {
        start_server_with(share, None).await
    }

    async fn start_server_with(share: &TempDir, handshake_timeout: Option<Duration>) -> (u16, u16) {
        let server = PeerServer::bind(ServerConfig {
            share_dir: share.path().to_path_buf(),
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: 0,
            data_port: 0,
            io_timeout: Some(Duration::from_secs(5)),
            handshake_timeout,
        })
        .await
        .unwrap();
        let ports = (
            server.control_addr().unwrap().port(),
            server.data_addr().unwrap().port(),
        );
        server.spawn();
        ports
    }

    async fn open_session(control_port: u16) -> Connection {
        let mut conn = connect("127.0.0.1", control_port, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        conn.send(OPEN).await.unwrap();
        conn.expect(HELLO, "peer").await.unwrap();
        conn
    }

    /// Connect to the server from another loopback address
    async fn connect_from(local: Ipv4Addr, port: u16) -> TcpStream {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(SocketAddr::from((local, 0))).unwrap();
        socket
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_notes_scenario() {
        let share = TempDir::new().unwrap();
        std::fs::write(share.path().join("notes.txt"), b"hello world!").unwrap();
        let (control_port, data_port) = start_server(&share).await;

        let mut conn = open_session(control_port).await;
        let mut data = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
        conn.send("GET notes.txt").await.unwrap();

        let mut received = Vec::new();
        data.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world!");

        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("OK"));
        conn.send(CLOSE).await.unwrap();
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("GOODBYE"));
        assert_eq!(conn.receive_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_without_filename() {
        let share = TempDir::new().unwrap();
        std::fs::write(share.path().join("notes.txt"), b"hello world!").unwrap();
        let (control_port, data_port) = start_server(&share).await;

        let mut conn = open_session(control_port).await;
        let mut data = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
        conn.send("GET").await.unwrap();
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("ERROR G0"));
        conn.send("GET").await.unwrap();
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("ERROR G0"));

        // the data connection is still parked for the next GET
        conn.send("GET notes.txt").await.unwrap();
        let mut received = Vec::new();
        data.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world!");
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("OK"));

        conn.send(CLOSE).await.unwrap();
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("GOODBYE"));
    }

    #[tokio::test]
    async fn test_get_missing_file() {
        let share = TempDir::new().unwrap();
        let (control_port, data_port) = start_server(&share).await;

        let mut conn = open_session(control_port).await;
        let mut data = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
        conn.send("GET absent.txt").await.unwrap();

        let mut received = Vec::new();
        data.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("ERROR G1"));
    }

    #[tokio::test]
    async fn test_get_outside_share_dir() {
        let outer = TempDir::new().unwrap();
        let share = TempDir::new_in(outer.path()).unwrap();
        std::fs::write(outer.path().join("secret.txt"), b"secret").unwrap();
        let (control_port, data_port) = start_server(&share).await;

        let mut conn = open_session(control_port).await;
        let mut data = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
        conn.send("GET ../secret.txt").await.unwrap();

        let mut received = Vec::new();
        data.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("ERROR G1"));
    }

    #[tokio::test]
    async fn test_unknown_command_and_empty_line() {
        let share = TempDir::new().unwrap();
        let (control_port, _) = start_server(&share).await;

        let mut conn = open_session(control_port).await;
        conn.send("PUT notes.txt").await.unwrap();
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("ERROR C0"));
        conn.send("").await.unwrap();
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("ERROR C0"));
        conn.send(CLOSE).await.unwrap();
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("GOODBYE"));
    }

    #[tokio::test]
    async fn test_handshake_discards_noise_and_close_aborts() {
        let share = TempDir::new().unwrap();
        let (control_port, _) = start_server(&share).await;

        let mut conn = connect("127.0.0.1", control_port, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        conn.send("GET notes.txt").await.unwrap();
        conn.send("hello?").await.unwrap();
        conn.send(OPEN).await.unwrap();
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("HELLO"));

        let mut early = connect("127.0.0.1", control_port, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        early.send(CLOSE).await.unwrap();
        assert_eq!(early.receive_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let share = TempDir::new().unwrap();
        let (control_port, _) = start_server_with(&share, Some(Duration::from_millis(100))).await;

        let mut conn = connect("127.0.0.1", control_port, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(conn.receive_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sessions_are_served_concurrently() {
        let share = TempDir::new().unwrap();
        std::fs::write(share.path().join("notes.txt"), b"hello world!").unwrap();
        let (control_port, data_port) = start_server(&share).await;

        // an idle session must not block a peer on another address
        let _idle = open_session(control_port).await;

        let other = Ipv4Addr::new(127, 0, 0, 2);
        let stream = connect_from(other, control_port).await;
        let peer = stream.peer_addr().unwrap();
        let mut conn = Connection::new(stream, peer, Some(Duration::from_secs(5)));
        conn.send(OPEN).await.unwrap();
        conn.expect(HELLO, "peer").await.unwrap();

        let mut data = connect_from(other, data_port).await;
        conn.send("GET notes.txt").await.unwrap();
        let mut received = Vec::new();
        data.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world!");
        assert_eq!(conn.receive_line().await.unwrap().as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn test_same_address_sessions_do_not_overlap() {
        let share = TempDir::new().unwrap();
        std::fs::write(share.path().join("a.txt"), b"AAAA-file-a").unwrap();
        std::fs::write(share.path().join("b.txt"), b"BBBB-file-b").unwrap();
        let (control_port, data_port) = start_server(&share).await;

        let mut first = open_session(control_port).await;
        let mut second = connect("127.0.0.1", control_port, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        second.send(OPEN).await.unwrap();

        // not greeted while the first session is open
        let waiting = tokio::time::timeout(Duration::from_millis(200), second.receive_line());
        assert!(waiting.await.is_err());

        let mut data = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
        first.send("GET a.txt").await.unwrap();
        let mut received = Vec::new();
        data.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"AAAA-file-a");
        assert_eq!(first.receive_line().await.unwrap().as_deref(), Some("OK"));
        first.send(CLOSE).await.unwrap();
        assert_eq!(first.receive_line().await.unwrap().as_deref(), Some("GOODBYE"));

        assert_eq!(second.receive_line().await.unwrap().as_deref(), Some("HELLO"));
        let mut data = TcpStream::connect(("127.0.0.1", data_port)).await.unwrap();
        second.send("GET b.txt").await.unwrap();
        let mut received = Vec::new();
        data.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"BBBB-file-b");
        assert_eq!(second.receive_line().await.unwrap().as_deref(), Some("OK"));
    }
}
