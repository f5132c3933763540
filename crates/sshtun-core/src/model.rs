//! Values handed out by a tunnel directory

use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One managed tunnel as seen by a directory caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub name: String,
    pub running: bool,
}

impl Tunnel {
    pub fn new(name: impl Into<String>, running: bool) -> Self {
        Self {
            name: name.into(),
            running,
        }
    }
}

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelStatus {
    /// Checking the SSH hop and binding the local listener
    Starting,
    /// Listener is up and forwarding
    Running,
    /// Waiting before the next start attempt
    Reconnecting { attempt: u32 },
    /// Switched off
    Stopped,
    /// Gave up after exhausting restart attempts
    Failed { error: String },
}

impl TunnelStatus {
    /// Whether the tunnel is switched on. This is what `Tunnel::running` reports.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Starting | TunnelStatus::Running | TunnelStatus::Reconnecting { .. }
        )
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Starting => write!(f, "◐ Starting"),
            TunnelStatus::Running => write!(f, "● Running"),
            TunnelStatus::Reconnecting { attempt } => {
                write!(f, "⟳ Reconnecting (attempt {})", attempt)
            }
            TunnelStatus::Stopped => write!(f, "○ Stopped"),
            TunnelStatus::Failed { .. } => write!(f, "✗ Failed"),
        }
    }
}

/// Detailed tunnel snapshot for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub name: String,
    pub group: String,
    pub status: TunnelStatus,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub server: Endpoint,
    /// Seconds since the listener came up, while running
    pub uptime_seconds: Option<u64>,
    /// Bytes copied from the remote side to local clients
    pub bytes_received: u64,
    /// Bytes copied from local clients to the remote side
    pub bytes_sent: u64,
    pub open_connections: u64,
    /// Connections accepted since the manager was created
    pub total_connections: u64,
}

/// What a toggle request did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleOutcome {
    Started,
    Stopped,
    AlreadyRunning,
    AlreadyStopped,
}

impl ToggleOutcome {
    /// Whether the tunnel is switched on after the request
    pub fn running(&self) -> bool {
        matches!(self, ToggleOutcome::Started | ToggleOutcome::AlreadyRunning)
    }

    /// Whether the request switched the tunnel
    pub fn changed(&self) -> bool {
        matches!(self, ToggleOutcome::Started | ToggleOutcome::Stopped)
    }
}

impl fmt::Display for ToggleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ToggleOutcome::Started => "started",
            ToggleOutcome::Stopped => "stopped",
            ToggleOutcome::AlreadyRunning => "already running",
            ToggleOutcome::AlreadyStopped => "already stopped",
        };
        f.write_str(text)
    }
}

/// Result of a toggle applied to one tunnel of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOutcome {
    pub name: String,
    pub outcome: ToggleOutcome,
}

/// Traffic averaged over every tunnel, in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throughput {
    pub bytes_per_10_seconds: u64,
    pub bytes_per_minute: u64,
}
