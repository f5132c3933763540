//! Status change notifications

use crate::model::TunnelStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broadcast whenever a tunnel changes state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEvent {
    pub name: String,
    pub status: TunnelStatus,
    pub at: DateTime<Utc>,
}

impl TunnelEvent {
    pub fn new(name: impl Into<String>, status: TunnelStatus) -> Self {
        Self {
            name: name.into(),
            status,
            at: Utc::now(),
        }
    }

    /// One-line notification text
    pub fn message(&self) -> String {
        match &self.status {
            TunnelStatus::Starting => format!("Starting {} ...", self.name),
            TunnelStatus::Running => format!("Started {}", self.name),
            TunnelStatus::Reconnecting { attempt } => {
                format!("Restarting {} (attempt {})", self.name, attempt)
            }
            TunnelStatus::Stopped => format!("Stopped {}", self.name),
            TunnelStatus::Failed { error } => format!("{} failed: {}", self.name, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            TunnelEvent::new("db", TunnelStatus::Starting).message(),
            "Starting db ..."
        );
        assert_eq!(
            TunnelEvent::new("db", TunnelStatus::Running).message(),
            "Started db"
        );
        assert_eq!(
            TunnelEvent::new(
                "db",
                TunnelStatus::Failed {
                    error: "refused".to_string()
                }
            )
            .message(),
            "db failed: refused"
        );
    }
}
