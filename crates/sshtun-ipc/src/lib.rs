//! sshtun daemon IPC
//!
//! The newline-delimited JSON protocol spoken over the daemon socket, the
//! server loop that exposes a tunnel controller on it, and a client-side
//! directory that forwards every call to the daemon.

pub mod daemon;
pub mod ipc;
pub mod remote;

pub use daemon::Daemon;
pub use ipc::{
    format_duration, print_services, print_status_table, socket_path, IpcClient, IpcConnection,
    IpcRequest, IpcResponse, IpcServer, SOCKET_ENV,
};
pub use remote::RemoteDirectory;
