//! Dialers open the far side of a forwarded connection
//!
//! [`SshDialer`] runs `ssh -W` per connection so the system client handles
//! authentication, agent forwarding and known_hosts. [`DirectDialer`] skips
//! the SSH hop entirely.

use crate::config::{ServiceConfig, Settings};
use crate::endpoint::Endpoint;
use crate::forward::TunnelError;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Byte stream to the remote endpoint
pub trait RemoteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RemoteStream for T {}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream to `remote`
    async fn dial(&self, remote: &Endpoint) -> Result<Box<dyn RemoteStream>, TunnelError>;

    /// Check the path to the remote before the local listener opens
    async fn warm_up(&self) -> Result<(), TunnelError> {
        Ok(())
    }
}

/// Chooses the dialer for each configured service
pub trait DialerFactory: Send + Sync {
    fn dialer(&self, service: &ServiceConfig, settings: &Settings) -> Arc<dyn Dialer>;
}

// ============================================================================
// SSH
// ============================================================================

/// Dials through an SSH server by spawning the ssh client
#[derive(Debug, Clone)]
pub struct SshDialer {
    tunnel: String,
    command: String,
    username: String,
    server: Endpoint,
    identity_file: Option<std::path::PathBuf>,
    host_key_check: bool,
    connect_timeout: Duration,
    keepalive_interval_secs: u64,
    keepalive_count_max: u32,
}

impl SshDialer {
    pub fn new(service: &ServiceConfig, settings: &Settings) -> Self {
        Self {
            tunnel: service.name.clone(),
            command: settings.ssh_command.clone(),
            username: service.username.clone(),
            server: service.server.clone(),
            identity_file: service.identity_file.clone(),
            host_key_check: service.host_key_check,
            connect_timeout: settings.connect_timeout(),
            keepalive_interval_secs: settings.keepalive_interval_secs,
            keepalive_count_max: settings.keepalive_count_max,
        }
    }

    /// Options shared by the forwarding and the warm-up invocations
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.server.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.keepalive_interval_secs),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.keepalive_count_max),
        ];

        if self.host_key_check {
            args.extend(["-o".to_string(), "StrictHostKeyChecking=accept-new".to_string()]);
        } else {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "LogLevel=ERROR".to_string(),
            ]);
        }

        if let Some(identity) = &self.identity_file {
            args.extend([
                "-i".to_string(),
                identity.display().to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
            ]);
        }

        args
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.server.host)
    }

    /// Arguments for a stdio-forwarded connection to `remote`
    pub fn forward_args(&self, remote: &Endpoint) -> Vec<String> {
        let mut args = vec!["-W".to_string(), remote.address()];
        args.extend(self.common_args());
        args.extend([
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            self.destination(),
        ]);
        args
    }

    /// Arguments for the warm-up login
    pub fn login_args(&self) -> Vec<String> {
        let mut args = self.common_args();
        args.push(self.destination());
        args.push("exit".to_string());
        args
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, remote: &Endpoint) -> Result<Box<dyn RemoteStream>, TunnelError> {
        debug!("[{}] Dialing {} via {}", self.tunnel, remote, self.server);

        let mut child = Command::new(&self.command)
            .args(self.forward_args(remote))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Ssh(format!("failed to spawn {}: {}", self.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TunnelError::Ssh("ssh stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TunnelError::Ssh("ssh stdout was not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let tunnel = self.tunnel.clone();
            tokio::spawn(async move {
                log_stderr(&tunnel, stderr).await;
            });
        }

        Ok(Box::new(ChildStream {
            _child: child,
            stdin,
            stdout,
        }))
    }

    async fn warm_up(&self) -> Result<(), TunnelError> {
        let mut command = Command::new(&self.command);
        command
            .args(self.login_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // ssh enforces ConnectTimeout itself; the extra margin covers authentication.
        let limit = self.connect_timeout * 2 + Duration::from_secs(1);
        let output = tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| TunnelError::Timeout(format!("ssh login to {}", self.server)))?
            .map_err(|e| TunnelError::Ssh(format!("failed to spawn {}: {}", self.command, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TunnelError::Ssh(format!(
                "login to {}@{} failed ({}): {}",
                self.username,
                self.server,
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Log each line the ssh child writes to stderr until it closes.
/// Returns the number of lines logged.
async fn log_stderr<R: AsyncRead + Unpin>(tunnel: &str, stderr: R) -> usize {
    let mut lines = BufReader::new(stderr).lines();
    let mut logged = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    warn!("[{}] ssh: {}", tunnel, line);
                    logged += 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("[{}] Stopped reading ssh stderr: {}", tunnel, e);
                break;
            }
        }
    }

    logged
}

/// The ssh child's stdout/stdin as one duplex stream; the child dies with it
struct ChildStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ChildStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// Builds an [`SshDialer`] for every service
#[derive(Debug, Clone, Default)]
pub struct SshDialerFactory;

impl DialerFactory for SshDialerFactory {
    fn dialer(&self, service: &ServiceConfig, settings: &Settings) -> Arc<dyn Dialer> {
        Arc::new(SshDialer::new(service, settings))
    }
}

// ============================================================================
// Direct TCP
// ============================================================================

/// Connects straight to the remote endpoint
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, remote: &Endpoint) -> Result<Box<dyn RemoteStream>, TunnelError> {
        let address = remote.address();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| TunnelError::Timeout(format!("connect to {}", address)))?
            .map_err(|e| TunnelError::Dial {
                remote: address.clone(),
                reason: e.to_string(),
            })?;

        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

/// Builds a [`DirectDialer`] for every service, ignoring the SSH server
#[derive(Debug, Clone, Default)]
pub struct DirectDialerFactory;

impl DialerFactory for DirectDialerFactory {
    fn dialer(&self, _service: &ServiceConfig, settings: &Settings) -> Arc<dyn Dialer> {
        Arc::new(DirectDialer::new(settings.connect_timeout()))
    }
}
