//! Tunnel directory backed by a running daemon

use crate::ipc::{socket_path, IpcClient, IpcRequest, IpcResponse};
use async_trait::async_trait;
use sshtun_core::{
    DirectoryError, Throughput, ToggleOutcome, Tunnel, TunnelController, TunnelDirectory,
    TunnelInfo, TunnelOutcome,
};
use std::path::{Path, PathBuf};

/// Talks to the daemon over its socket, one connection per call
#[derive(Debug, Clone)]
pub struct RemoteDirectory {
    socket: PathBuf,
}

impl RemoteDirectory {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Round trip to the daemon
    pub async fn request(&self, request: &IpcRequest) -> Result<IpcResponse, DirectoryError> {
        let mut client = IpcClient::connect_to(&self.socket)
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("{:#}", e)))?;

        match client.request(request).await {
            Ok(IpcResponse::Error { message, detail }) => {
                Err(detail.unwrap_or(DirectoryError::Remote(message)))
            }
            Ok(response) => Ok(response),
            Err(e) => Err(DirectoryError::Protocol(format!("{:#}", e))),
        }
    }

    /// Whether a daemon answers on the socket
    pub async fn ping(&self) -> Result<(), DirectoryError> {
        match self.request(&IpcRequest::Ping).await? {
            IpcResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the daemon to stop every tunnel and exit
    pub async fn shutdown(&self) -> Result<Option<String>, DirectoryError> {
        match self.request(&IpcRequest::Shutdown).await? {
            IpcResponse::Ok { message } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    async fn toggled(&self, request: IpcRequest) -> Result<ToggleOutcome, DirectoryError> {
        match self.request(&request).await? {
            IpcResponse::Toggled { outcome, .. } => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    async fn group_toggled(
        &self,
        request: IpcRequest,
    ) -> Result<Vec<TunnelOutcome>, DirectoryError> {
        match self.request(&request).await? {
            IpcResponse::GroupToggled { outcomes } => Ok(outcomes),
            other => Err(unexpected(other)),
        }
    }

    /// Tunnel details and throughput from a single status request
    pub async fn status(&self) -> Result<(Vec<TunnelInfo>, Throughput), DirectoryError> {
        match self.request(&IpcRequest::Status).await? {
            IpcResponse::Status {
                tunnels,
                throughput,
            } => Ok((tunnels, throughput)),
            other => Err(unexpected(other)),
        }
    }
}

impl Default for RemoteDirectory {
    fn default() -> Self {
        Self::new(socket_path())
    }
}

fn unexpected(response: IpcResponse) -> DirectoryError {
    DirectoryError::Protocol(format!("unexpected response: {:?}", response))
}

#[async_trait]
impl TunnelDirectory for RemoteDirectory {
    async fn services(&self) -> Result<Vec<Tunnel>, DirectoryError> {
        match self.request(&IpcRequest::Services).await? {
            IpcResponse::Services { tunnels } => Ok(tunnels),
            other => Err(unexpected(other)),
        }
    }

    async fn toggle(&self, name: &str, status: bool) -> Result<ToggleOutcome, DirectoryError> {
        self.toggled(IpcRequest::Toggle {
            name: name.to_string(),
            status,
        })
        .await
    }
}

#[async_trait]
impl TunnelController for RemoteDirectory {
    async fn switch(&self, name: &str) -> Result<ToggleOutcome, DirectoryError> {
        self.toggled(IpcRequest::Switch {
            name: name.to_string(),
        })
        .await
    }

    async fn toggle_group(
        &self,
        group: &str,
        status: bool,
    ) -> Result<Vec<TunnelOutcome>, DirectoryError> {
        self.group_toggled(IpcRequest::ToggleGroup {
            group: group.to_string(),
            status,
        })
        .await
    }

    async fn switch_group(&self, group: &str) -> Result<Vec<TunnelOutcome>, DirectoryError> {
        self.group_toggled(IpcRequest::SwitchGroup {
            group: group.to_string(),
        })
        .await
    }

    async fn statuses(&self) -> Result<Vec<TunnelInfo>, DirectoryError> {
        Ok(self.status().await?.0)
    }

    async fn throughput(&self) -> Result<Throughput, DirectoryError> {
        Ok(self.status().await?.1)
    }
}
