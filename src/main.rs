//! sshtun - named SSH port-forward tunnels
//!
//! `sshtun run` starts the daemon; every other command talks to it over the
//! local socket.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sshtun_core::{
    Config, SshDialerFactory, ToggleOutcome, TunnelController, TunnelDirectory, TunnelManager,
    TunnelOutcome,
};
use sshtun_ipc::{print_services, print_status_table, Daemon, IpcServer, RemoteDirectory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sshtun")]
#[command(about = "Manage named SSH port-forward tunnels", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (default: search $SSHTUN_CONFIG, ./sshtun.yaml, ~/.sshtun/config.yaml, /etc/sshtun/config.yaml)
    #[arg(short, long, global = true, env = "SSHTUN_CONFIG")]
    config: Option<PathBuf>,

    /// Daemon socket path
    #[arg(long, global = true, env = "SSHTUN_SOCKET")]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon: start autostart tunnels and serve the socket
    #[command(long_about = r#"
Run the tunnel daemon in the foreground. Tunnels marked `autostart` are
switched on immediately; the rest wait for `sshtun toggle`/`start`.

The daemon stops every tunnel on Ctrl+C, SIGTERM or `sshtun shutdown`.

EXAMPLES:
  sshtun run
  sshtun --config ./tunnels.yaml --log-level debug run
    "#)]
    Run,

    /// List tunnels and whether they are running
    List,

    /// Show detailed tunnel status
    Status,

    /// Switch a tunnel on or off
    Toggle {
        /// Tunnel name
        name: String,

        /// Desired state
        state: Switch,
    },

    /// Switch a tunnel on
    Start { name: String },

    /// Switch a tunnel off
    Stop { name: String },

    /// Flip a tunnel
    Switch { name: String },

    /// Switch a whole group; without a state, stop it if any tunnel is on, else start it
    Group {
        /// Group name
        name: String,

        state: Option<Switch>,
    },

    /// Validate the configuration and print a summary
    Check,

    /// Check the daemon is running
    Ping,

    /// Stop all tunnels and the daemon
    Shutdown,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn status(self) -> bool {
        self == Switch::On
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .init();

    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<(Config, PathBuf)> {
    match explicit {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load configuration from {:?}", path))?;
            Ok((config, path.to_path_buf()))
        }
        None => Config::discover().context("Failed to load configuration"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let socket = cli.socket.clone().unwrap_or_else(sshtun_ipc::socket_path);

    match cli.command {
        Commands::Run => run_daemon(cli.config.as_deref(), &socket).await,
        Commands::Check => check_config(cli.config.as_deref()),
        command => run_client(command, RemoteDirectory::new(socket)).await,
    }
}

async fn run_daemon(config_path: Option<&Path>, socket: &Path) -> Result<()> {
    info!("🚀 sshtun daemon starting...");

    let (config, path) = load_config(config_path)?;
    info!("Loaded configuration from {:?}", path);

    let manager = Arc::new(
        TunnelManager::new(&config, Arc::new(SshDialerFactory))
            .context("Invalid configuration")?,
    );

    let server = IpcServer::bind_to(socket).await?;
    let daemon = Daemon::new(manager.clone());
    let shutdown = daemon.shutdown_token();

    let background = CancellationToken::new();
    let meter_task = manager.meter().spawn(background.child_token());

    let outcomes = manager.autostart().await;
    info!("Autostarted {} tunnel(s)", outcomes.len());

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        shutdown.cancel();
    });

    info!("✅ Daemon ready");
    let result = daemon.run(server).await;

    info!("Stopping tunnels...");
    manager.shutdown().await;

    background.cancel();
    if let Err(e) = meter_task.await {
        warn!("Meter task ended abnormally: {}", e);
    }

    info!("✅ Daemon stopped");
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

fn check_config(config_path: Option<&Path>) -> Result<()> {
    let (config, path) = load_config(config_path)?;

    println!("✅ Configuration {:?} is valid", path);
    println!();

    for group in &config.groups {
        let suffix = if group.disable_switch_all {
            " (switch all disabled)"
        } else {
            ""
        };
        println!("{}{}", group.name, suffix);

        for service in &group.services {
            println!(
                "  {:<16} {} → {} via {}@{}{}",
                service.name,
                service.local,
                service.remote,
                service.username,
                service.server,
                if service.autostart { " [autostart]" } else { "" }
            );
        }
    }

    Ok(())
}

async fn run_client(command: Commands, directory: RemoteDirectory) -> Result<()> {
    match command {
        Commands::List => {
            let tunnels = directory.services().await?;
            print_services(&tunnels);
        }
        Commands::Status => {
            let (tunnels, throughput) = directory.status().await?;
            print_status_table(&tunnels, &throughput);
        }
        Commands::Toggle { name, state } => {
            let outcome = directory.toggle(&name, state.status()).await?;
            print_outcome(&name, outcome);
        }
        Commands::Start { name } => {
            let outcome = directory.toggle(&name, true).await?;
            print_outcome(&name, outcome);
        }
        Commands::Stop { name } => {
            let outcome = directory.toggle(&name, false).await?;
            print_outcome(&name, outcome);
        }
        Commands::Switch { name } => {
            let outcome = directory.switch(&name).await?;
            print_outcome(&name, outcome);
        }
        Commands::Group { name, state } => {
            let outcomes = match state {
                Some(state) => directory.toggle_group(&name, state.status()).await?,
                None => directory.switch_group(&name).await?,
            };
            print_outcomes(&outcomes);
        }
        Commands::Ping => {
            directory
                .ping()
                .await
                .with_context(|| format!("No daemon answering at {:?}", directory.socket()))?;
            println!("✅ Daemon is running");
        }
        Commands::Shutdown => {
            let message = directory.shutdown().await?;
            println!("✅ {}", message.unwrap_or_else(|| "Daemon stopped".to_string()));
        }
        Commands::Run | Commands::Check => {
            anyhow::bail!("run and check do not talk to the daemon")
        }
    }

    Ok(())
}

fn print_outcome(name: &str, outcome: ToggleOutcome) {
    let mark = if outcome.changed() { "✅" } else { "ℹ️ " };
    println!("{} {} {}", mark, name, outcome);
}

fn print_outcomes(outcomes: &[TunnelOutcome]) {
    for outcome in outcomes {
        let mark = if outcome.outcome.changed() { "*" } else { " " };
        println!("{} {:<16} {}", mark, outcome.name, outcome.outcome);
    }
}
