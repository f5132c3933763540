//! Local listener that forwards every accepted connection to the remote endpoint
//!
//! Each connection gets its own task and its own dialed stream. Bytes are
//! copied in both directions with a small buffer so the tunnel counters and
//! the shared meter see traffic while it flows, not only when a connection
//! closes.

use crate::dialer::{Dialer, RemoteStream};
use crate::endpoint::Endpoint;
use crate::meter::Meter;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 3 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different local port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to dial {remote}: {reason}")]
    Dial { remote: String, reason: String },

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Per-tunnel traffic counters
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    open_connections: AtomicU64,
    total_connections: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes copied from the remote side to local clients
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Bytes copied from local clients to the remote side
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    fn open(self: &Arc<Self>) -> ConnectionGuard {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard(self.clone())
    }
}

struct ConnectionGuard(Arc<TrafficStats>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.open_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Forwards `local` to `remote` through a dialer
pub struct Forwarder {
    name: String,
    local: Endpoint,
    remote: Endpoint,
    dialer: Arc<dyn Dialer>,
    stats: Arc<TrafficStats>,
    meter: Arc<Meter>,
    bind_attempts: u32,
    bind_retry_delay: Duration,
}

impl Forwarder {
    pub fn new(
        name: impl Into<String>,
        local: Endpoint,
        remote: Endpoint,
        dialer: Arc<dyn Dialer>,
        stats: Arc<TrafficStats>,
        meter: Arc<Meter>,
    ) -> Self {
        Self {
            name: name.into(),
            local,
            remote,
            dialer,
            stats,
            meter,
            bind_attempts: 3,
            bind_retry_delay: Duration::from_secs(1),
        }
    }

    /// Override how often binding is retried while the port is in use
    pub fn with_bind_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.bind_attempts = attempts.max(1);
        self.bind_retry_delay = delay;
        self
    }

    /// Bind the local endpoint, retrying while the port is held (e.g. TIME_WAIT)
    pub async fn bind(&self) -> Result<TcpListener, TunnelError> {
        let address = self.local.address();
        let mut last_error = String::new();

        for attempt in 1..=self.bind_attempts {
            match TcpListener::bind(&address).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "[{}] Bound to {} on attempt {}/{}",
                            self.name, address, attempt, self.bind_attempts
                        );
                    }
                    return Ok(listener);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::AddrInUse
                        && attempt < self.bind_attempts =>
                {
                    warn!(
                        "[{}] Port {} is in use (attempt {}/{}), retrying in {:?}...",
                        self.name, self.local.port, attempt, self.bind_attempts, self.bind_retry_delay
                    );
                    last_error = e.to_string();
                    tokio::time::sleep(self.bind_retry_delay).await;
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }

        Err(TunnelError::Bind {
            address: self.local.host.clone(),
            port: self.local.port,
            reason: last_error,
        })
    }

    /// Accept and forward connections until cancelled
    ///
    /// Returns an error only when the listener itself fails; a connection that
    /// cannot reach the remote is closed and logged.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let bound = listener.local_addr()?;
        info!("[{}] Forwarding {} → {}", self.name, bound, self.remote);

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[{}] Listener on {} closing", self.name, bound);
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            debug!("[{}] Accepted connection from {}", self.name, peer);

            let name = self.name.clone();
            let remote = self.remote.clone();
            let dialer = self.dialer.clone();
            let stats = self.stats.clone();
            let meter = self.meter.clone();
            let cancel = cancel.child_token();

            tokio::spawn(async move {
                let _guard = stats.open();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("[{}] Dropping connection from {} (tunnel stopped)", name, peer);
                    }
                    _ = handle_connection(&name, stream, peer, &remote, dialer, &stats, &meter) => {}
                }
            });
        }
    }
}

async fn handle_connection(
    name: &str,
    local: TcpStream,
    peer: SocketAddr,
    remote: &Endpoint,
    dialer: Arc<dyn Dialer>,
    stats: &TrafficStats,
    meter: &Meter,
) {
    let remote_stream = match dialer.dial(remote).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[{}] Could not reach {} for {}: {}", name, remote, peer, e);
            return;
        }
    };

    let _ = local.set_nodelay(true);
    proxy(local, remote_stream, stats, meter).await;
    debug!("[{}] Connection from {} closed", name, peer);
}

/// Copy both directions until both finish or either fails
async fn proxy(local: TcpStream, remote: Box<dyn RemoteStream>, stats: &TrafficStats, meter: &Meter) {
    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream = copy_metered(&mut local_read, &mut remote_write, &stats.bytes_sent, meter);
    let downstream = copy_metered(
        &mut remote_read,
        &mut local_write,
        &stats.bytes_received,
        meter,
    );
    tokio::pin!(upstream, downstream);

    let mut upstream_done = false;
    let mut downstream_done = false;

    while !(upstream_done && downstream_done) {
        tokio::select! {
            result = &mut upstream, if !upstream_done => {
                upstream_done = true;
                if let Err(e) = result {
                    debug!("Upstream copy ended with error: {}", e);
                    break;
                }
            }
            result = &mut downstream, if !downstream_done => {
                downstream_done = true;
                if let Err(e) = result {
                    debug!("Downstream copy ended with error: {}", e);
                    break;
                }
            }
        }
    }
}

async fn copy_metered<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    meter: &Meter,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }

        writer.write_all(&buffer[..read]).await?;
        writer.flush().await?;

        total += read as u64;
        counter.fetch_add(read as u64, Ordering::Relaxed);
        meter.record(read as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;

    async fn spawn_echo_server() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        Endpoint::new("127.0.0.1", port)
    }

    fn forwarder(remote: Endpoint, stats: Arc<TrafficStats>, meter: Arc<Meter>) -> Forwarder {
        Forwarder::new(
            "test",
            Endpoint::new("127.0.0.1", 0),
            remote,
            Arc::new(DirectDialer::default()),
            stats,
            meter,
        )
    }

    #[tokio::test]
    async fn test_forwards_and_counts_bytes() {
        let remote = spawn_echo_server().await;
        let stats = Arc::new(TrafficStats::new());
        let meter = Arc::new(Meter::new());
        let forwarder = forwarder(remote, stats.clone(), meter.clone());

        let listener = forwarder.bind().await.unwrap();
        let local = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let serve_cancel = cancel.clone();
        let server = tokio::spawn(async move { forwarder.serve(listener, serve_cancel).await });

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"ping over ssh").await.unwrap();

        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over ssh");

        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(stats.bytes_sent(), 13);
        assert_eq!(stats.bytes_received(), 13);
        assert_eq!(stats.total_connections(), 1);
        assert_eq!(stats.open_connections(), 0);

        meter.tick();

        cancel.cancel();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_remote_keeps_listener_alive() {
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let stats = Arc::new(TrafficStats::new());
        let forwarder = forwarder(
            Endpoint::new("127.0.0.1", dead_port),
            stats.clone(),
            Arc::new(Meter::new()),
        );
        let listener = forwarder.bind().await.unwrap();
        let local = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let server = tokio::spawn(async move { forwarder.serve(listener, serve_cancel).await });

        for _ in 0..2 {
            let mut client = TcpStream::connect(local).await.unwrap();
            let mut buf = Vec::new();
            // The forwarder closes the connection once the dial fails.
            let read = client.read_to_end(&mut buf).await.unwrap_or(0);
            assert_eq!(read, 0);
        }

        assert_eq!(stats.total_connections(), 2);
        assert!(!server.is_finished());

        cancel.cancel();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let forwarder = Forwarder::new(
            "conflict",
            Endpoint::new("127.0.0.1", port),
            Endpoint::new("127.0.0.1", 1),
            Arc::new(DirectDialer::default()),
            Arc::new(TrafficStats::new()),
            Arc::new(Meter::new()),
        )
        .with_bind_retry(2, Duration::from_millis(10));

        let err = forwarder.bind().await.unwrap_err();
        match err {
            TunnelError::Bind { port: p, .. } => assert_eq!(p, port),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_drops_open_connections() {
        let remote = spawn_echo_server().await;
        let stats = Arc::new(TrafficStats::new());
        let forwarder = forwarder(remote, stats.clone(), Arc::new(Meter::new()));
        let listener = forwarder.bind().await.unwrap();
        let local = listener.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let server = tokio::spawn(async move { forwarder.serve(listener, serve_cancel).await });

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();
        assert_eq!(stats.open_connections(), 1);

        cancel.cancel();
        server.await.unwrap().unwrap();

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .expect("connection should close after cancel")
            .unwrap_or(0);
        assert_eq!(read, 0);
    }
}
