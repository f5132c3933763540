//! Tunnel manager
//!
//! Owns every configured tunnel and runs each switched-on tunnel on its own
//! task. Implements the directory contract in-process.
//!
//! Toggles are serialized by a control lock so two concurrent requests for the
//! same tunnel cannot both spawn a task. Status reads only take the table's
//! read lock.

use crate::config::{Config, ConfigError, RestartPolicy, ServiceConfig, Settings};
use crate::dialer::{Dialer, DialerFactory};
use crate::directory::{DirectoryError, TunnelController, TunnelDirectory};
use crate::events::TunnelEvent;
use crate::forward::{Forwarder, TrafficStats, TunnelError};
use crate::meter::Meter;
use crate::model::{Throughput, ToggleOutcome, Tunnel, TunnelInfo, TunnelOutcome, TunnelStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a stopping tunnel may take to wind down before its task is aborted
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 100;

type TunnelTable = Arc<RwLock<HashMap<String, TunnelHandle>>>;

/// A configured service and its lifetime counters
struct ManagedService {
    group: String,
    config: ServiceConfig,
    stats: Arc<TrafficStats>,
}

/// A group as far as switching is concerned
struct ManagedGroup {
    name: String,
    members: Vec<String>,
    disable_switch_all: bool,
}

/// Runtime state of a switched-on (or failed) tunnel
struct TunnelHandle {
    status: TunnelStatus,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// When the listener came up, for uptime
    running_since: Option<Instant>,
}

/// Everything a tunnel task needs, detached from the manager
struct TunnelContext {
    name: String,
    service: ServiceConfig,
    dialer: Arc<dyn Dialer>,
    stats: Arc<TrafficStats>,
    meter: Arc<Meter>,
    restart: RestartPolicy,
    bind_retry: (u32, Duration),
    tunnels: TunnelTable,
    events: broadcast::Sender<TunnelEvent>,
}

pub struct TunnelManager {
    settings: Settings,
    services: Vec<ManagedService>,
    groups: Vec<ManagedGroup>,
    factory: Arc<dyn DialerFactory>,
    tunnels: TunnelTable,
    control: Mutex<()>,
    events: broadcast::Sender<TunnelEvent>,
    meter: Arc<Meter>,
    bind_retry: (u32, Duration),
}

impl TunnelManager {
    /// Build a manager from a configuration; nothing is started yet
    pub fn new(config: &Config, factory: Arc<dyn DialerFactory>) -> Result<Self, ConfigError> {
        config.validate()?;

        let services = config
            .services()
            .map(|(group, service)| ManagedService {
                group: group.name.clone(),
                config: service.clone(),
                stats: Arc::new(TrafficStats::new()),
            })
            .collect();

        let groups = config
            .groups
            .iter()
            .map(|group| ManagedGroup {
                name: group.name.clone(),
                members: group.services.iter().map(|s| s.name.clone()).collect(),
                disable_switch_all: group.disable_switch_all,
            })
            .collect();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            settings: config.settings.clone(),
            services,
            groups,
            factory,
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            control: Mutex::new(()),
            events,
            meter: Arc::new(Meter::new()),
            bind_retry: (3, Duration::from_secs(1)),
        })
    }

    /// Override how local port conflicts are retried before a start attempt fails
    pub fn with_bind_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.bind_retry = (attempts.max(1), delay);
        self
    }

    /// Receive every status change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Shared throughput meter; callers drive its sampler with [`Meter::spawn`]
    pub fn meter(&self) -> Arc<Meter> {
        self.meter.clone()
    }

    /// Current status of one tunnel
    pub async fn status(&self, name: &str) -> Result<TunnelStatus, DirectoryError> {
        self.service(name)?;
        let tunnels = self.tunnels.read().await;
        Ok(tunnels
            .get(name)
            .map(|h| h.status.clone())
            .unwrap_or(TunnelStatus::Stopped))
    }

    /// Start every service marked `autostart`
    pub async fn autostart(&self) -> Vec<TunnelOutcome> {
        let _control = self.control.lock().await;
        let mut outcomes = Vec::new();

        for service in self.services.iter().filter(|s| s.config.autostart) {
            info!("Autostarting tunnel: {}", service.config.name);
            match self.start_locked(&service.config.name).await {
                Ok(outcome) => outcomes.push(TunnelOutcome {
                    name: service.config.name.clone(),
                    outcome,
                }),
                Err(e) => error!("Failed to autostart '{}': {}", service.config.name, e),
            }
        }

        outcomes
    }

    /// Stop every tunnel
    pub async fn shutdown(&self) {
        let _control = self.control.lock().await;

        let names: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_locked(&name).await {
                warn!("Failed to stop tunnel '{}': {}", name, e);
            }
        }

        info!("✅ All tunnels stopped");
    }

    fn service(&self, name: &str) -> Result<&ManagedService, DirectoryError> {
        self.services
            .iter()
            .find(|s| s.config.name == name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    fn group(&self, name: &str) -> Result<&ManagedGroup, DirectoryError> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| DirectoryError::GroupNotFound(name.to_string()))
    }

    async fn is_active(&self, name: &str) -> bool {
        self.tunnels
            .read()
            .await
            .get(name)
            .map_or(false, |h| h.status.is_active())
    }

    /// Start a tunnel; caller holds the control lock
    async fn start_locked(&self, name: &str) -> Result<ToggleOutcome, DirectoryError> {
        let service = self.service(name)?;

        let mut tunnels = self.tunnels.write().await;
        if let Some(handle) = tunnels.get(name) {
            if handle.status.is_active() {
                debug!("Tunnel '{}' is already running", name);
                return Ok(ToggleOutcome::AlreadyRunning);
            }
        }

        let cancel = CancellationToken::new();
        let context = TunnelContext {
            name: name.to_string(),
            service: service.config.clone(),
            dialer: self.factory.dialer(&service.config, &self.settings),
            stats: service.stats.clone(),
            meter: self.meter.clone(),
            restart: self.settings.restart.clone(),
            bind_retry: self.bind_retry,
            tunnels: self.tunnels.clone(),
            events: self.events.clone(),
        };

        info!("Starting tunnel: {}", name);

        // The task's first status update waits for this write lock, so the
        // Starting event always precedes it.
        let task = tokio::spawn(run_tunnel(context, cancel.clone()));
        tunnels.insert(
            name.to_string(),
            TunnelHandle {
                status: TunnelStatus::Starting,
                cancel,
                task,
                running_since: None,
            },
        );
        publish(&self.events, name, TunnelStatus::Starting);

        Ok(ToggleOutcome::Started)
    }

    /// Stop a tunnel; caller holds the control lock
    async fn stop_locked(&self, name: &str) -> Result<ToggleOutcome, DirectoryError> {
        self.service(name)?;

        let handle = match self.tunnels.write().await.remove(name) {
            Some(handle) => handle,
            None => return Ok(ToggleOutcome::AlreadyStopped),
        };

        if !handle.status.is_active() {
            // A failed tunnel is cleared back to Stopped
            return Ok(ToggleOutcome::AlreadyStopped);
        }

        info!("Stopping tunnel: {}", name);
        handle.cancel.cancel();

        let mut task = handle.task;
        match tokio::time::timeout(STOP_GRACE_PERIOD, &mut task).await {
            Ok(Ok(())) => debug!("[{}] Task finished", name),
            Ok(Err(e)) if e.is_panic() => error!("[{}] Tunnel task panicked: {}", name, e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("[{}] Graceful stop timed out, aborting", name);
                task.abort();
            }
        }

        publish(&self.events, name, TunnelStatus::Stopped);
        Ok(ToggleOutcome::Stopped)
    }

    async fn apply_to_group(
        &self,
        group: &ManagedGroup,
        status: bool,
    ) -> Result<Vec<TunnelOutcome>, DirectoryError> {
        let mut outcomes = Vec::with_capacity(group.members.len());

        for name in &group.members {
            let outcome = if status {
                self.start_locked(name).await?
            } else {
                self.stop_locked(name).await?
            };
            outcomes.push(TunnelOutcome {
                name: name.clone(),
                outcome,
            });
        }

        Ok(outcomes)
    }

    fn switchable_group(&self, name: &str) -> Result<&ManagedGroup, DirectoryError> {
        let group = self.group(name)?;
        if group.disable_switch_all {
            return Err(DirectoryError::SwitchAllDisabled(name.to_string()));
        }
        Ok(group)
    }
}

#[async_trait]
impl TunnelDirectory for TunnelManager {
    async fn services(&self) -> Result<Vec<Tunnel>, DirectoryError> {
        let tunnels = self.tunnels.read().await;
        Ok(self
            .services
            .iter()
            .map(|service| {
                let running = tunnels
                    .get(&service.config.name)
                    .map_or(false, |h| h.status.is_active());
                Tunnel::new(service.config.name.clone(), running)
            })
            .collect())
    }

    async fn toggle(&self, name: &str, status: bool) -> Result<ToggleOutcome, DirectoryError> {
        let _control = self.control.lock().await;
        if status {
            self.start_locked(name).await
        } else {
            self.stop_locked(name).await
        }
    }
}

#[async_trait]
impl TunnelController for TunnelManager {
    async fn switch(&self, name: &str) -> Result<ToggleOutcome, DirectoryError> {
        let _control = self.control.lock().await;
        self.service(name)?;

        if self.is_active(name).await {
            self.stop_locked(name).await
        } else {
            self.start_locked(name).await
        }
    }

    async fn toggle_group(
        &self,
        group: &str,
        status: bool,
    ) -> Result<Vec<TunnelOutcome>, DirectoryError> {
        let group = self.switchable_group(group)?;
        let _control = self.control.lock().await;

        info!(
            "Switching {} all tunnels in group '{}'",
            if status { "on" } else { "off" },
            group.name
        );
        self.apply_to_group(group, status).await
    }

    async fn switch_group(&self, group: &str) -> Result<Vec<TunnelOutcome>, DirectoryError> {
        let group = self.switchable_group(group)?;
        let _control = self.control.lock().await;

        let any_active = {
            let tunnels = self.tunnels.read().await;
            group
                .members
                .iter()
                .any(|name| tunnels.get(name).map_or(false, |h| h.status.is_active()))
        };

        self.apply_to_group(group, !any_active).await
    }

    async fn statuses(&self) -> Result<Vec<TunnelInfo>, DirectoryError> {
        let tunnels = self.tunnels.read().await;

        Ok(self
            .services
            .iter()
            .map(|service| {
                let handle = tunnels.get(&service.config.name);
                let status = handle
                    .map(|h| h.status.clone())
                    .unwrap_or(TunnelStatus::Stopped);
                let uptime_seconds = handle
                    .and_then(|h| h.running_since)
                    .map(|since| since.elapsed().as_secs());

                TunnelInfo {
                    name: service.config.name.clone(),
                    group: service.group.clone(),
                    status,
                    local: service.config.local.clone(),
                    remote: service.config.remote.clone(),
                    server: service.config.server.clone(),
                    uptime_seconds,
                    bytes_received: service.stats.bytes_received(),
                    bytes_sent: service.stats.bytes_sent(),
                    open_connections: service.stats.open_connections(),
                    total_connections: service.stats.total_connections(),
                }
            })
            .collect())
    }

    async fn throughput(&self) -> Result<Throughput, DirectoryError> {
        Ok(Throughput {
            bytes_per_10_seconds: self.meter.bytes_per_10_seconds(),
            bytes_per_minute: self.meter.bytes_per_minute(),
        })
    }
}

fn publish(events: &broadcast::Sender<TunnelEvent>, name: &str, status: TunnelStatus) {
    let event = TunnelEvent::new(name, status);
    info!("{}", event.message());
    // No subscribers is fine
    let _ = events.send(event);
}

/// Run one tunnel, restarting it per the policy, until cancelled or out of attempts
async fn run_tunnel(context: TunnelContext, cancel: CancellationToken) {
    let name = context.name.clone();
    let mut attempt = 0u32;

    loop {
        let (reached_running, result) = run_once(&context, cancel.clone()).await;

        if cancel.is_cancelled() {
            debug!("[{}] Tunnel stopped by request", name);
            return;
        }

        let error = match result {
            Ok(()) => TunnelError::Ssh("listener closed unexpectedly".to_string()),
            Err(e) => e,
        };
        error!("[{}] ❌ Tunnel error: {}", name, error);

        attempt = next_attempt(attempt, reached_running);

        if attempt > context.restart.max_attempts {
            error!("[{}] 🚫 Giving up after {} attempt(s)", name, attempt);
            update_status(
                &context,
                TunnelStatus::Failed {
                    error: error.to_string(),
                },
            )
            .await;
            return;
        }

        update_status(&context, TunnelStatus::Reconnecting { attempt }).await;
        info!(
            "[{}] Waiting {:?} before restart attempt {}/{}",
            name,
            context.restart.delay(),
            attempt,
            context.restart.max_attempts
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[{}] Tunnel stopped while waiting to restart", name);
                return;
            }
            _ = tokio::time::sleep(context.restart.delay()) => {}
        }
    }
}

/// Attempt number for the next restart. A run that came up starts the count over.
fn next_attempt(attempt: u32, reached_running: bool) -> u32 {
    if reached_running {
        1
    } else {
        attempt.saturating_add(1)
    }
}

/// One start attempt: warm up, bind, serve. Reports whether the listener came up.
async fn run_once(
    context: &TunnelContext,
    cancel: CancellationToken,
) -> (bool, Result<(), TunnelError>) {
    let warm_up = tokio::select! {
        _ = cancel.cancelled() => return (false, Ok(())),
        result = context.dialer.warm_up() => result,
    };
    if let Err(e) = warm_up {
        return (false, Err(e));
    }

    let forwarder = Forwarder::new(
        context.name.clone(),
        context.service.local.clone(),
        context.service.remote.clone(),
        context.dialer.clone(),
        context.stats.clone(),
        context.meter.clone(),
    )
    .with_bind_retry(context.bind_retry.0, context.bind_retry.1);

    let listener = tokio::select! {
        _ = cancel.cancelled() => return (false, Ok(())),
        result = forwarder.bind() => match result {
            Ok(listener) => listener,
            Err(e) => return (false, Err(e)),
        },
    };

    update_status(context, TunnelStatus::Running).await;
    info!(
        "[{}] ✅ {} → {} via {}@{}",
        context.name,
        context.service.local,
        context.service.remote,
        context.service.username,
        context.service.server
    );

    (true, forwarder.serve(listener, cancel).await)
}

async fn update_status(context: &TunnelContext, status: TunnelStatus) {
    let mut tunnels = context.tunnels.write().await;

    // The handle is gone once the tunnel was stopped; nothing to report then.
    if let Some(handle) = tunnels.get_mut(&context.name) {
        if matches!(status, TunnelStatus::Running) {
            handle.running_since = Some(Instant::now());
        } else {
            handle.running_since = None;
        }
        handle.status = status.clone();
        publish(&context.events, &context.name, status);
    }
}
