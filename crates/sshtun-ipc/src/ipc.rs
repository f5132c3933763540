//! IPC between the sshtun daemon and its clients
//!
//! The daemon listens on a Unix domain socket. Each request and response is
//! one line of JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sshtun_core::meter::human_readable;
use sshtun_core::{
    DirectoryError, Throughput, ToggleOutcome, Tunnel, TunnelInfo, TunnelOutcome, TunnelStatus,
};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Environment variable overriding the daemon socket location
pub const SOCKET_ENV: &str = "SSHTUN_SOCKET";

/// IPC request from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Check the daemon is alive
    Ping,

    /// List every tunnel with its running flag
    Services,

    /// Switch one tunnel on or off
    Toggle { name: String, status: bool },

    /// Flip one tunnel
    Switch { name: String },

    /// Switch every tunnel of a group on or off
    ToggleGroup { group: String, status: bool },

    /// Flip a whole group
    SwitchGroup { group: String },

    /// Detailed status of every tunnel
    Status,

    /// Stop all tunnels and exit
    Shutdown,
}

/// IPC response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,

    Services {
        tunnels: Vec<Tunnel>,
    },

    Toggled {
        name: String,
        outcome: ToggleOutcome,
    },

    GroupToggled {
        outcomes: Vec<TunnelOutcome>,
    },

    Status {
        tunnels: Vec<TunnelInfo>,
        #[serde(default)]
        throughput: Throughput,
    },

    Ok {
        message: Option<String>,
    },

    Error {
        message: String,
        /// Structured error when it came from the directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<DirectoryError>,
    },
}

impl IpcResponse {
    pub fn error(message: impl Into<String>) -> Self {
        IpcResponse::Error {
            message: message.into(),
            detail: None,
        }
    }
}

impl From<DirectoryError> for IpcResponse {
    fn from(err: DirectoryError) -> Self {
        IpcResponse::Error {
            message: err.to_string(),
            detail: Some(err),
        }
    }
}

/// Path of the daemon socket: `$SSHTUN_SOCKET`, else `~/.sshtun/daemon.sock`
pub fn socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SOCKET_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sshtun")
        .join("daemon.sock")
}

/// IPC client used by the CLI
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

impl IpcClient {
    pub async fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to daemon socket at {:?}", path))?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse> {
        let mut json = serde_json::to_string(req)?;
        json.push('\n');

        let stream = self.stream.get_mut();
        stream
            .write_all(json.as_bytes())
            .await
            .context("Failed to send request")?;
        stream.flush().await.context("Failed to flush request")?;

        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read response")?;

        if bytes_read == 0 {
            anyhow::bail!("Daemon closed the connection");
        }

        serde_json::from_str(&line).context("Failed to parse response")
    }
}

/// IPC server the daemon listens on
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    pub async fn bind_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
        }

        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            if !metadata.file_type().is_socket() {
                anyhow::bail!(
                    "Refusing to replace {:?}: it exists and is not a socket",
                    path
                );
            }

            // A live daemon answers; a stale socket does not
            match UnixStream::connect(path).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another daemon is already running (socket at {:?} is active)",
                        path
                    );
                }
                Err(_) => {
                    std::fs::remove_file(path)
                        .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
                }
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            stream: BufReader::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if is_socket(&self.socket_path) {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

fn is_socket(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|metadata| metadata.file_type().is_socket())
        .unwrap_or(false)
}

/// One client connection on the daemon side
pub struct IpcConnection {
    stream: BufReader<UnixStream>,
}

impl IpcConnection {
    /// Next request, or `None` once the client hung up
    pub async fn recv(&mut self) -> Result<Option<IpcRequest>> {
        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read request")?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(&line).context("Failed to parse request")?;
        Ok(Some(request))
    }

    pub async fn send(&mut self, response: &IpcResponse) -> Result<()> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        let stream = self.stream.get_mut();
        stream
            .write_all(json.as_bytes())
            .await
            .context("Failed to send response")?;
        stream.flush().await.context("Failed to flush response")?;
        Ok(())
    }
}

/// Format duration in human-readable format
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        format!("{}h {}m", hours, minutes)
    }
}

/// Print the directory listing
pub fn print_services(tunnels: &[Tunnel]) {
    if tunnels.is_empty() {
        println!("No tunnels configured.");
        return;
    }

    for tunnel in tunnels {
        let marker = if tunnel.running { "●" } else { "○" };
        println!("{} {}", marker, tunnel.name);
    }
}

/// Print the detailed status table to stdout
pub fn print_status_table(tunnels: &[TunnelInfo], throughput: &Throughput) {
    if tunnels.is_empty() {
        println!("No tunnels configured.");
        return;
    }

    println!(
        "{:<16} {:<10} {:<22} {:<34} {:<20} {:<10} STATUS",
        "TUNNEL", "GROUP", "LOCAL", "REMOTE (VIA)", "TRAFFIC IN/OUT", "CONNS"
    );

    for info in tunnels {
        let status = match &info.status {
            TunnelStatus::Running => {
                let uptime = info
                    .uptime_seconds
                    .map(|s| format!(" ({})", format_duration(s)))
                    .unwrap_or_default();
                format!("{}{}", info.status, uptime)
            }
            TunnelStatus::Failed { error } => format!("{}: {}", info.status, error),
            other => other.to_string(),
        };

        let remote = format!("{} ({})", info.remote, info.server);
        let traffic = format!(
            "{} / {}",
            human_readable(info.bytes_received),
            human_readable(info.bytes_sent)
        );

        println!(
            "{:<16} {:<10} {:<22} {:<34} {:<20} {:<10} {}",
            info.name,
            info.group,
            info.local.to_string(),
            remote,
            traffic,
            connections(info),
            status
        );
    }

    println!();
    println!(
        "Throughput: {}/s (10s avg), {}/s (1m avg)",
        human_readable(throughput.bytes_per_10_seconds),
        human_readable(throughput.bytes_per_minute)
    );
}

/// Open over total accepted connections, e.g. `1/7`
fn connections(info: &TunnelInfo) -> String {
    format!("{}/{}", info.open_connections, info.total_connections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshtun_core::Endpoint;
    use tempfile::TempDir;

    #[test]
    fn test_ipc_request_serialization() {
        let json = serde_json::to_string(&IpcRequest::Services).unwrap();
        assert_eq!(json, r#"{"type":"services"}"#);

        let req = IpcRequest::Toggle {
            name: "tunnel-a".to_string(),
            status: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"toggle","name":"tunnel-a","status":false}"#);

        let req = IpcRequest::SwitchGroup {
            group: "dev".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"switch_group","group":"dev"}"#);

        let json = r#"{"type":"toggle_group","group":"dev","status":true}"#;
        let req: IpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            IpcRequest::ToggleGroup {
                group: "dev".to_string(),
                status: true
            }
        );
    }

    #[test]
    fn test_ipc_response_serialization() {
        let resp = IpcResponse::Services {
            tunnels: vec![Tunnel::new("tunnel-a", true), Tunnel::new("tunnel-b", false)],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"type":"services","tunnels":[{"name":"tunnel-a","running":true},{"name":"tunnel-b","running":false}]}"#
        );

        let resp = IpcResponse::Toggled {
            name: "db".to_string(),
            outcome: ToggleOutcome::AlreadyStopped,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"type":"toggled","name":"db","outcome":"already_stopped"}"#
        );

        let json = serde_json::to_string(&IpcResponse::error("boom")).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"boom"}"#);

        let json = serde_json::to_string(&IpcResponse::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_directory_error_response() {
        let resp = IpcResponse::from(DirectoryError::NotFound("x".to_string()));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""message":"Tunnel 'x' not found""#));
        assert!(json.contains(r#""detail":{"kind":"not_found","detail":"x"}"#));

        let parsed: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_status_response_without_throughput() {
        let json = r#"{"type":"status","tunnels":[]}"#;
        let resp: IpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            resp,
            IpcResponse::Status {
                tunnels: vec![],
                throughput: Throughput::default()
            }
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(60), "1m 0s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3600), "1h 0m");
        assert_eq!(format_duration(7325), "2h 2m");
    }

    #[test]
    fn test_socket_path_default() {
        let path = socket_path();
        assert!(path.to_string_lossy().ends_with("sock"));
    }

    fn db_info() -> TunnelInfo {
        TunnelInfo {
            name: "db".to_string(),
            group: "dev".to_string(),
            status: TunnelStatus::Running,
            local: Endpoint::new("127.0.0.1", 15432),
            remote: Endpoint::new("db.internal", 5432),
            server: Endpoint::new("bastion", 22),
            uptime_seconds: Some(90),
            bytes_received: 2048,
            bytes_sent: 10,
            open_connections: 1,
            total_connections: 7,
        }
    }

    #[test]
    fn test_connections_column() {
        assert_eq!(connections(&db_info()), "1/7");
    }

    #[test]
    fn test_print_status_table_smoke() {
        print_status_table(&[db_info()], &Throughput::default());
        print_status_table(&[], &Throughput::default());
    }

    #[tokio::test]
    async fn test_ipc_client_server_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind_to(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.recv().await.unwrap();

            let response = match request {
                Some(IpcRequest::Ping) => IpcResponse::Pong,
                _ => IpcResponse::error("Unknown request"),
            };
            conn.send(&response).await.unwrap();
        });

        let mut client = IpcClient::connect_to(&socket_path).await.unwrap();
        let response = client.request(&IpcRequest::Ping).await.unwrap();
        assert_eq!(response, IpcResponse::Pong);

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_multiple_requests() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("multi.sock");

        let server = IpcServer::bind_to(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();

            assert_eq!(conn.recv().await.unwrap(), Some(IpcRequest::Ping));
            conn.send(&IpcResponse::Pong).await.unwrap();

            assert_eq!(conn.recv().await.unwrap(), Some(IpcRequest::Services));
            conn.send(&IpcResponse::Services {
                tunnels: vec![Tunnel::new("tunnel-a", false)],
            })
            .await
            .unwrap();

            // Client hangs up
            assert_eq!(conn.recv().await.unwrap(), None);
        });

        let mut client = IpcClient::connect_to(&socket_path).await.unwrap();
        assert_eq!(
            client.request(&IpcRequest::Ping).await.unwrap(),
            IpcResponse::Pong
        );
        assert_eq!(
            client.request(&IpcRequest::Services).await.unwrap(),
            IpcResponse::Services {
                tunnels: vec![Tunnel::new("tunnel-a", false)]
            }
        );
        drop(client);

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_stale_socket_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("stale.sock");

        // A socket file nobody listens on any more
        drop(std::os::unix::net::UnixListener::bind(&socket_path).unwrap());
        assert!(socket_path.exists());

        let server = IpcServer::bind_to(&socket_path).await.unwrap();
        assert!(socket_path.exists());

        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_ipc_keeps_regular_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(&path, "groups: []\n").unwrap();

        let err = IpcServer::bind_to(&path).await.err().unwrap();
        assert!(err.to_string().contains("not a socket"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "groups: []\n");
    }

    #[tokio::test]
    async fn test_ipc_refuses_second_daemon() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("live.sock");

        let _server = IpcServer::bind_to(&socket_path).await.unwrap();
        let err = IpcServer::bind_to(&socket_path).await.err().unwrap();
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn test_connect_without_daemon() {
        let temp_dir = TempDir::new().unwrap();
        let result = IpcClient::connect_to(&temp_dir.path().join("none.sock")).await;
        assert!(result.is_err());
    }
}
