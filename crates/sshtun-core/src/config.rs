//! Tunnel configuration
//!
//! Services are declared in YAML, grouped so a whole group can be switched at
//! once. The file is looked up in `$SSHTUN_CONFIG`, `./sshtun.yaml`,
//! `~/.sshtun/config.yaml` and `/etc/sshtun/config.yaml`, in that order.

use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "SSHTUN_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file found (searched: {})", format_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Root of the YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// Options shared by every tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// ssh client binary
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keepalive interval on the SSH connection
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Unanswered keepalives before the SSH connection is dropped
    #[serde(default = "default_keepalive_count_max")]
    pub keepalive_count_max: u32,

    #[serde(default)]
    pub restart: RestartPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_command: default_ssh_command(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_count_max(),
            restart: RestartPolicy::default(),
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// How a failed tunnel is brought back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Restart attempts after a failure (0 = never restart)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause before each restart attempt
    #[serde(default = "default_restart_delay")]
    pub delay_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_restart_delay(),
        }
    }
}

impl RestartPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

fn default_ssh_command() -> String {
    "ssh".to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_keepalive_interval() -> u64 {
    5
}
fn default_keepalive_count_max() -> u32 {
    12
}
fn default_max_attempts() -> u32 {
    5
}
fn default_restart_delay() -> u64 {
    2
}

/// A named set of services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Hide the group-wide switch
    #[serde(default)]
    pub disable_switch_all: bool,
}

/// One local port forwarded through an SSH server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub username: String,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub server: Endpoint,

    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Verify the server against known_hosts, trusting unknown hosts on first use
    #[serde(default)]
    pub host_key_check: bool,

    /// Start with the daemon
    #[serde(default)]
    pub autostart: bool,
}

impl Config {
    /// Parse YAML text without touching the filesystem
    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        config.expand_paths();
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml(&text, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Candidate config locations, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            if !explicit.is_empty() {
                paths.push(PathBuf::from(explicit));
            }
        }

        paths.push(PathBuf::from("sshtun.yaml"));

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".sshtun").join("config.yaml"));
        }

        paths.push(PathBuf::from("/etc/sshtun/config.yaml"));
        paths
    }

    /// Load the first config file found on the search path
    pub fn discover() -> Result<(Self, PathBuf), ConfigError> {
        Self::discover_in(Self::search_paths())
    }

    /// Load the first of `searched` that exists
    pub fn discover_in(searched: Vec<PathBuf>) -> Result<(Self, PathBuf), ConfigError> {
        for path in &searched {
            if path.exists() {
                return Ok((Self::load(path)?, path.clone()));
            }
        }

        Err(ConfigError::NotFound { searched })
    }

    /// All services in declaration order, paired with their group name
    pub fn services(&self) -> impl Iterator<Item = (&GroupConfig, &ServiceConfig)> {
        self.groups
            .iter()
            .flat_map(|group| group.services.iter().map(move |service| (group, service)))
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(invalid("no groups configured"));
        }

        let mut group_names = HashSet::new();
        for group in &self.groups {
            validate_name("group", &group.name)?;
            if !group_names.insert(group.name.as_str()) {
                return Err(invalid(format!("duplicate group name '{}'", group.name)));
            }
        }

        let mut service_names = HashSet::new();
        let mut locals: Vec<(&str, &Endpoint)> = Vec::new();
        let mut count = 0usize;

        for (group, service) in self.services() {
            count += 1;
            validate_name("service", &service.name)?;

            if !service_names.insert(service.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate service name '{}' (in group '{}')",
                    service.name, group.name
                )));
            }

            if let Some((other, _)) = locals
                .iter()
                .find(|(_, local)| locals_conflict(local, &service.local))
            {
                return Err(invalid(format!(
                    "service '{}' binds {} which is already used by service '{}'",
                    service.name, service.local, other
                )));
            }
            locals.push((service.name.as_str(), &service.local));

            if service.username.trim().is_empty() {
                return Err(invalid(format!("service '{}' has no username", service.name)));
            }

            for (label, endpoint) in [("remote", &service.remote), ("server", &service.server)] {
                if endpoint.host.is_empty() || endpoint.port == 0 {
                    return Err(invalid(format!(
                        "service '{}' has an invalid {} endpoint '{}'",
                        service.name, label, endpoint
                    )));
                }
            }

            if service.local.host.is_empty() {
                return Err(invalid(format!(
                    "service '{}' has an empty local host",
                    service.name
                )));
            }
        }

        if count == 0 {
            return Err(invalid("no services configured"));
        }

        if self.settings.ssh_command.trim().is_empty() {
            return Err(invalid("settings.ssh_command is empty"));
        }

        Ok(())
    }

    fn expand_paths(&mut self) {
        for group in &mut self.groups {
            for service in &mut group.services {
                if let Some(path) = service.identity_file.take() {
                    service.identity_file = Some(expand_tilde(&path));
                }
            }
        }
    }
}

/// Local bind host after resolving aliases; `None` means every interface
fn bind_host(host: &str) -> Option<String> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return Some("127.0.0.1".to_string());
    }
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => None,
        Ok(ip) => Some(ip.to_string()),
        Err(_) if host == "*" => None,
        Err(_) => Some(host.to_ascii_lowercase()),
    }
}

/// Whether two local listeners would fight over the same socket.
/// Port 0 asks the OS for a fresh port and never conflicts.
fn locals_conflict(a: &Endpoint, b: &Endpoint) -> bool {
    if a.port == 0 || a.port != b.port {
        return false;
    }
    match (bind_host(&a.host), bind_host(&b.host)) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Names travel over IPC and into log lines, keep them plain
fn validate_name(kind: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(invalid(format!("{} name cannot be empty", kind)));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(invalid(format!(
            "{} name '{}' must contain only alphanumeric characters, '-', '_' and '.'",
            kind, name
        )));
    }
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
