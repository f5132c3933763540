//! sshtun core library
//!
//! Named SSH port-forward tunnels behind a small directory contract: list the
//! tunnels, toggle one by name. [`TunnelManager`] is the in-process backend;
//! other crates serve the same [`TunnelDirectory`] over IPC.

pub mod config;
pub mod dialer;
pub mod directory;
pub mod endpoint;
pub mod events;
pub mod forward;
pub mod manager;
pub mod meter;
pub mod model;

pub use config::{Config, ConfigError, GroupConfig, RestartPolicy, ServiceConfig, Settings};
pub use dialer::{
    Dialer, DialerFactory, DirectDialer, DirectDialerFactory, RemoteStream, SshDialer,
    SshDialerFactory,
};
pub use directory::{DirectoryError, TunnelController, TunnelDirectory};
pub use endpoint::Endpoint;
pub use events::TunnelEvent;
pub use forward::{Forwarder, TrafficStats, TunnelError};
pub use manager::TunnelManager;
pub use meter::Meter;
pub use model::{Throughput, ToggleOutcome, Tunnel, TunnelInfo, TunnelOutcome, TunnelStatus};
