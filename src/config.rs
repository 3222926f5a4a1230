// src/config.rs

//! Manages server configuration: loading, defaults, and validation.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

/// Hard floor for the replication backlog, matching the smallest size at
/// which partial resynchronization is still worth offering.
pub const REPL_BACKLOG_MIN_SIZE: usize = 16 * 1024;

/// An upstream leader endpoint this instance replicates from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LeaderEndpoint {
    pub host: String,
    pub port: u16,
}

/// Replication settings. An empty `leaders` list means this instance starts
/// as a pure leader; more than one entry is a multi-master topology and
/// requires `active_replica`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub leaders: Vec<LeaderEndpoint>,
    /// When true this instance is writable while replicating and wraps its
    /// outgoing stream in RREPLAY envelopes for loop suppression.
    #[serde(default)]
    pub active_replica: bool,
    #[serde(default = "default_repl_timeout")]
    pub repl_timeout_secs: u64,
    #[serde(default = "default_ping_replica_period")]
    pub ping_replica_period_secs: u64,
    #[serde(default = "default_backlog_size")]
    pub backlog_size: usize,
    /// Seconds without any follower before the backlog is reclaimed.
    #[serde(default = "default_backlog_time_limit")]
    pub backlog_time_limit_secs: u64,
    /// When true, full syncs stream the snapshot straight to the follower
    /// socket (EOF-delimited) instead of going through a disk file.
    #[serde(default)]
    pub diskless_sync: bool,
    /// How long to wait for more followers to pile onto one diskless sync.
    #[serde(default = "default_diskless_sync_delay")]
    pub diskless_sync_delay_secs: u64,
    #[serde(default)]
    pub min_replicas_to_write: usize,
    #[serde(default = "default_min_replicas_max_lag")]
    pub min_replicas_max_lag_secs: u64,
    /// IP to advertise to the leader via `REPLCONF ip-address`.
    #[serde(default)]
    pub announce_ip: Option<String>,
    /// Credentials sent to leaders during the handshake.
    #[serde(default)]
    pub auth_user: Option<String>,
    #[serde(default)]
    pub auth_secret: Option<String>,
    /// Optional license token exchanged via `REPLCONF license`.
    #[serde(default)]
    pub license_key: Option<String>,
}

fn default_repl_timeout() -> u64 {
    60
}
fn default_ping_replica_period() -> u64 {
    10
}
fn default_backlog_size() -> usize {
    1024 * 1024
}
fn default_backlog_time_limit() -> u64 {
    3600
}
fn default_diskless_sync_delay() -> u64 {
    5
}
fn default_min_replicas_max_lag() -> u64 {
    10
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            leaders: Vec::new(),
            active_replica: false,
            repl_timeout_secs: default_repl_timeout(),
            ping_replica_period_secs: default_ping_replica_period(),
            backlog_size: default_backlog_size(),
            backlog_time_limit_secs: default_backlog_time_limit(),
            diskless_sync: false,
            diskless_sync_delay_secs: default_diskless_sync_delay(),
            min_replicas_to_write: 0,
            min_replicas_max_lag_secs: default_min_replicas_max_lag(),
            announce_ip: None,
            auth_user: None,
            auth_secret: None,
            license_key: None,
        }
    }
}

/// Persistence settings: the KZDB snapshot path plus the AOF toggles the
/// replication core needs to coordinate with.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistenceConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default)]
    pub aof_enabled: bool,
    #[serde(default = "default_aof_path")]
    pub aof_path: String,
}

fn default_snapshot_path() -> String {
    "kunzitedb_data/dump.kzdb".to_string()
}
fn default_aof_path() -> String {
    "kunzitedb_data/kunzitedb.aof".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            aof_enabled: false,
            aof_path: default_aof_path(),
        }
    }
}

/// The fully resolved server configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_databases")]
    pub databases: usize,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7676
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_databases() -> usize {
    16
}
fn default_max_clients() -> usize {
    10000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            log_level: default_log_level(),
            databases: default_databases(),
            max_clients: default_max_clients(),
            replication: ReplicationSettings::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration from a TOML file. A missing file
    /// yields the defaults, so a bare `kunzitedb` starts a standalone leader.
    pub fn from_file(path: &str) -> Result<Self> {
        let mut config: Config = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| anyhow!("failed to parse config file '{path}': {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file '{}' not found. Using defaults.", path);
                Config::default()
            }
            Err(e) => return Err(anyhow!("failed to read config file '{path}': {e}")),
        };
        config.resolve();
        config.validate()?;
        Ok(config)
    }

    /// Clamps values that have hard floors rather than rejecting them.
    fn resolve(&mut self) {
        if self.replication.backlog_size < REPL_BACKLOG_MIN_SIZE {
            warn!(
                "replication.backlog_size {} below the minimum; clamping to {} bytes",
                self.replication.backlog_size, REPL_BACKLOG_MIN_SIZE
            );
            self.replication.backlog_size = REPL_BACKLOG_MIN_SIZE;
        }
    }

    /// Validates the resolved configuration for logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.databases == 0 {
            return Err(anyhow!("databases cannot be 0"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }

        let repl = &self.replication;
        if repl.leaders.len() > 1 && !repl.active_replica {
            return Err(anyhow!(
                "multiple leaders require replication.active_replica = true"
            ));
        }
        for leader in &repl.leaders {
            if leader.port == 0 {
                return Err(anyhow!("leader port cannot be 0"));
            }
            if leader.host.trim().is_empty() {
                return Err(anyhow!("leader host cannot be empty"));
            }
        }
        if repl.repl_timeout_secs == 0 {
            return Err(anyhow!("replication.repl_timeout_secs cannot be 0"));
        }
        if repl.ping_replica_period_secs == 0 {
            return Err(anyhow!("replication.ping_replica_period_secs cannot be 0"));
        }
        if repl.min_replicas_to_write > 0 && repl.min_replicas_max_lag_secs == 0 {
            return Err(anyhow!(
                "replication.min_replicas_max_lag_secs must be greater than 0 \
                 when min_replicas_to_write is set"
            ));
        }
        if repl.auth_user.is_some() && repl.auth_secret.is_none() {
            return Err(anyhow!(
                "replication.auth_user is set but auth_secret is missing"
            ));
        }
        Ok(())
    }
}
