//! Daemon side of the IPC socket
//!
//! Serves a [`TunnelController`] to CLI clients. Every connection runs on its
//! own task and may carry several requests.

use crate::ipc::{IpcConnection, IpcRequest, IpcResponse, IpcServer};
use anyhow::Result;
use sshtun_core::TunnelController;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Daemon {
    controller: Arc<dyn TunnelController>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(controller: Arc<dyn TunnelController>) -> Self {
        Self {
            controller,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when a client requests shutdown; cancel it to stop serving
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down
    pub async fn run(&self, server: IpcServer) -> Result<()> {
        info!("IPC server listening at {:?}", server.path());

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = server.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    let controller = self.controller.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        serve_connection(conn, controller, shutdown).await;
                    });
                }
                Err(e) => {
                    error!("IPC accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("IPC server stopped");
        Ok(())
    }
}

async fn serve_connection(
    mut conn: IpcConnection,
    controller: Arc<dyn TunnelController>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return,
            request = conn.recv() => request,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("IPC client disconnected");
                return;
            }
            Err(e) => {
                warn!("IPC recv error: {}", e);
                let _ = conn.send(&IpcResponse::error(format!("{:#}", e))).await;
                return;
            }
        };

        let is_shutdown = request == IpcRequest::Shutdown;
        let response = handle_request(request, controller.as_ref()).await;

        if let Err(e) = conn.send(&response).await {
            warn!("IPC send error: {}", e);
            return;
        }

        if is_shutdown {
            info!("Shutdown requested over IPC");
            shutdown.cancel();
            return;
        }
    }
}

/// Map one request onto the controller
pub async fn handle_request(request: IpcRequest, controller: &dyn TunnelController) -> IpcResponse {
    debug!("IPC request: {:?}", request);

    match request {
        IpcRequest::Ping => IpcResponse::Pong,
        IpcRequest::Services => match controller.services().await {
            Ok(tunnels) => IpcResponse::Services { tunnels },
            Err(e) => e.into(),
        },
        IpcRequest::Toggle { name, status } => match controller.toggle(&name, status).await {
            Ok(outcome) => IpcResponse::Toggled { name, outcome },
            Err(e) => e.into(),
        },
        IpcRequest::Switch { name } => match controller.switch(&name).await {
            Ok(outcome) => IpcResponse::Toggled { name, outcome },
            Err(e) => e.into(),
        },
        IpcRequest::ToggleGroup { group, status } => {
            match controller.toggle_group(&group, status).await {
                Ok(outcomes) => IpcResponse::GroupToggled { outcomes },
                Err(e) => e.into(),
            }
        }
        IpcRequest::SwitchGroup { group } => match controller.switch_group(&group).await {
            Ok(outcomes) => IpcResponse::GroupToggled { outcomes },
            Err(e) => e.into(),
        },
        IpcRequest::Status => {
            let tunnels = match controller.statuses().await {
                Ok(tunnels) => tunnels,
                Err(e) => return e.into(),
            };
            match controller.throughput().await {
                Ok(throughput) => IpcResponse::Status {
                    tunnels,
                    throughput,
                },
                Err(e) => e.into(),
            }
        }
        IpcRequest::Shutdown => IpcResponse::Ok {
            message: Some("Daemon shutting down".to_string()),
        },
    }
}
