//! Daemon tests: a real manager served over a socket

use sshtun_core::{
    Config, DirectDialerFactory, DirectoryError, Endpoint, GroupConfig, ServiceConfig, Settings,
    ToggleOutcome, Tunnel, TunnelController, TunnelDirectory, TunnelManager, TunnelStatus,
};
use sshtun_ipc::{Daemon, IpcServer, RemoteDirectory};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn service(name: &str, local_host: &str, autostart: bool) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        username: "tester".to_string(),
        local: Endpoint::new(local_host, 0),
        remote: Endpoint::new("127.0.0.1", 9),
        server: Endpoint::new("127.0.0.1", 22),
        identity_file: None,
        host_key_check: false,
        autostart,
    }
}

fn test_config() -> Config {
    Config {
        settings: Settings::default(),
        groups: vec![GroupConfig {
            name: "dev".to_string(),
            services: vec![
                service("tunnel-a", "127.0.0.1", true),
                service("tunnel-b", "127.0.0.2", false),
            ],
            disable_switch_all: false,
        }],
    }
}

/// Start a daemon on a temp socket
async fn setup_daemon() -> (TempDir, Arc<TunnelManager>, RemoteDirectory, JoinHandle<()>) {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("daemon.sock");

    let manager =
        Arc::new(TunnelManager::new(&test_config(), Arc::new(DirectDialerFactory)).unwrap());
    manager.autostart().await;

    let server = IpcServer::bind_to(&socket).await.unwrap();
    let daemon = Daemon::new(manager.clone());
    let handle = tokio::spawn(async move {
        daemon.run(server).await.unwrap();
    });

    (temp_dir, manager, RemoteDirectory::new(socket), handle)
}

#[tokio::test]
async fn test_remote_listing_matches_manager() {
    let (_temp, manager, remote, _handle) = setup_daemon().await;

    remote.ping().await.unwrap();

    let tunnels = remote.services().await.unwrap();
    assert_eq!(
        tunnels,
        vec![Tunnel::new("tunnel-a", true), Tunnel::new("tunnel-b", false)]
    );
    assert_eq!(tunnels, manager.services().await.unwrap());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remote_toggle() {
    let (_temp, manager, remote, _handle) = setup_daemon().await;

    assert_eq!(
        remote.toggle("tunnel-a", false).await.unwrap(),
        ToggleOutcome::Stopped
    );
    assert_eq!(
        remote.toggle("tunnel-b", true).await.unwrap(),
        ToggleOutcome::Started
    );

    let tunnels = remote.services().await.unwrap();
    assert!(!tunnels[0].running);
    assert!(tunnels[1].running);

    assert_eq!(
        remote.toggle("tunnel-z", true).await.unwrap_err(),
        DirectoryError::NotFound("tunnel-z".to_string())
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remote_group_and_status() {
    let (_temp, manager, remote, _handle) = setup_daemon().await;

    let outcomes = remote.switch_group("dev").await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| !o.outcome.running()));

    let outcomes = remote.toggle_group("dev", true).await.unwrap();
    assert!(outcomes.iter().all(|o| o.outcome == ToggleOutcome::Started));

    let infos = remote.statuses().await.unwrap();
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|i| i.group == "dev" && i.status.is_active()));

    assert_eq!(
        remote.toggle_group("ops", true).await.unwrap_err(),
        DirectoryError::GroupNotFound("ops".to_string())
    );

    manager.shutdown().await;
    let infos = manager.statuses().await.unwrap();
    assert!(infos.iter().all(|i| i.status == TunnelStatus::Stopped));
}

#[tokio::test]
async fn test_shutdown_request_stops_daemon() {
    let (temp, _manager, remote, handle) = setup_daemon().await;

    let message = remote.shutdown().await.unwrap();
    assert!(message.is_some());

    timeout(Duration::from_secs(2), handle)
        .await
        .expect("daemon did not stop")
        .unwrap();

    // Socket is removed with the server
    assert!(!temp.path().join("daemon.sock").exists());
    assert!(matches!(
        remote.services().await.unwrap_err(),
        DirectoryError::Unavailable(_)
    ));
}

#[tokio::test]
async fn test_many_clients() {
    let (_temp, manager, remote, _handle) = setup_daemon().await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let remote = remote.clone();
            tokio::spawn(async move { remote.services().await.unwrap().len() })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 2);
    }

    manager.shutdown().await;
}
