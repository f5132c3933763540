//! The tunnel directory contract
//!
//! Callers (a UI, the CLI, the IPC daemon) depend on these traits rather than
//! on a concrete backend. [`crate::TunnelManager`] implements them in-process;
//! the IPC crate implements them against a running daemon.

use crate::model::{Throughput, ToggleOutcome, Tunnel, TunnelInfo, TunnelOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by directory operations
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DirectoryError {
    #[error("Tunnel '{0}' not found")]
    NotFound(String),

    #[error("Group '{0}' not found")]
    GroupNotFound(String),

    #[error("Switching all tunnels is disabled for group '{0}'")]
    SwitchAllDisabled(String),

    #[error("Tunnel directory unavailable: {0}")]
    Unavailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Remote(String),
}

/// List tunnels and toggle one by name
#[async_trait]
pub trait TunnelDirectory: Send + Sync {
    /// Snapshot of every known tunnel
    async fn services(&self) -> Result<Vec<Tunnel>, DirectoryError>;

    /// Switch `name` on (`status = true`) or off
    async fn toggle(&self, name: &str, status: bool) -> Result<ToggleOutcome, DirectoryError>;
}

/// Group and detail operations layered on the directory
#[async_trait]
pub trait TunnelController: TunnelDirectory {
    /// Flip the current state of `name`
    async fn switch(&self, name: &str) -> Result<ToggleOutcome, DirectoryError>;

    /// Toggle every tunnel in `group`
    async fn toggle_group(
        &self,
        group: &str,
        status: bool,
    ) -> Result<Vec<TunnelOutcome>, DirectoryError>;

    /// Stop the group if any of its tunnels is on, otherwise start all of them
    async fn switch_group(&self, group: &str) -> Result<Vec<TunnelOutcome>, DirectoryError>;

    /// Detailed snapshot of every tunnel
    async fn statuses(&self) -> Result<Vec<TunnelInfo>, DirectoryError>;

    /// Current forwarding throughput
    async fn throughput(&self) -> Result<Throughput, DirectoryError>;
}
