// Agent configuration: field-for-field the table in spec §6. Loaded from TOML
// via `serde`, the way the teacher's `DatabaseConfig` is built up in
// `main.rs` — except here the defaults are attached directly to the type
// instead of being patched onto a `Default::default()` after the fact.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One of the three timing presets named in spec §4.6; each is a coherent
/// set of interval/timeout knobs tuned for its network environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProfile {
    Lan,
    Wan,
    Local,
}

/// Timing knobs governing the SWIM protocol loop (spec §4.6, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub indirect_checks: usize,
    pub retransmit_mult: u32,
    pub suspicion_mult: u32,
    pub suspicion_max_timeout_mult: u32,
    pub push_pull_interval: Duration,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub gossip_to_the_dead_time: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::lan()
    }
}

impl TimingConfig {
    pub fn lan() -> Self {
        Self {
            probe_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            retransmit_mult: 4,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            push_pull_interval: Duration::from_secs(30),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead_time: Duration::from_secs(30),
        }
    }

    pub fn wan() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            indirect_checks: 3,
            retransmit_mult: 4,
            suspicion_mult: 6,
            suspicion_max_timeout_mult: 6,
            push_pull_interval: Duration::from_secs(60),
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            gossip_to_the_dead_time: Duration::from_secs(60),
        }
    }

    pub fn local() -> Self {
        Self {
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            indirect_checks: 3,
            retransmit_mult: 3,
            suspicion_mult: 3,
            suspicion_max_timeout_mult: 4,
            push_pull_interval: Duration::from_secs(15),
            gossip_interval: Duration::from_millis(100),
            gossip_nodes: 3,
            gossip_to_the_dead_time: Duration::from_secs(15),
        }
    }

    pub fn from_profile(profile: NetworkProfile) -> Self {
        match profile {
            NetworkProfile::Lan => Self::lan(),
            NetworkProfile::Wan => Self::wan(),
            NetworkProfile::Local => Self::local(),
        }
    }
}

/// Top-level agent configuration, per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: Option<SocketAddr>,
    pub label: String,

    pub timing: TimingConfig,

    pub protocol_version: u8,
    pub tcp_timeout: Duration,
    pub gossip_verify_incoming: bool,
    pub gossip_verify_outgoing: bool,
    pub enable_compression: bool,

    pub secret_keys: Vec<Vec<u8>>,

    pub handoff_queue_depth: usize,
    pub udp_buffer_size: usize,
    pub dead_node_reclaim_time: Option<Duration>,

    pub query_timeout_mult: u32,
    pub broadcast_timeout: Duration,
    pub leave_propagate_delay: Duration,
    pub tombstone_timeout: Duration,
    pub reconnect_timeout: Duration,

    pub user_event_size_limit: usize,
    pub snapshot_path: Option<String>,
    pub rejoin_after_leave: bool,
    pub disable_coordinates: bool,

    pub control_bind_addr: SocketAddr,
    pub control_auth_key: Option<String>,

    pub retry_interval: Duration,
    pub retry_max_attempts: u32,
}

/// Absolute ceiling on user event payloads regardless of configuration.
pub const ABSOLUTE_USER_EVENT_LIMIT: usize = 9 * 1024;

impl Default for Config {
    fn default() -> Self {
        Self {
            name: hostname(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7946),
            advertise_addr: None,
            label: String::new(),
            timing: TimingConfig::default(),
            protocol_version: 2,
            tcp_timeout: Duration::from_secs(10),
            gossip_verify_incoming: true,
            gossip_verify_outgoing: true,
            enable_compression: true,
            secret_keys: Vec::new(),
            handoff_queue_depth: 1024,
            udp_buffer_size: 1400,
            dead_node_reclaim_time: None,
            query_timeout_mult: 16,
            broadcast_timeout: Duration::from_secs(5),
            leave_propagate_delay: Duration::from_secs(1),
            tombstone_timeout: Duration::from_secs(24 * 3600),
            reconnect_timeout: Duration::from_secs(72 * 3600),
            user_event_size_limit: ABSOLUTE_USER_EVENT_LIMIT,
            snapshot_path: None,
            rejoin_after_leave: false,
            disable_coordinates: false,
            control_bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7373),
            control_auth_key: None,
            retry_interval: Duration::from_secs(30),
            retry_max_attempts: 0,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates cross-field invariants not expressible through `serde`
    /// defaults alone. See SPEC_FULL.md open-question decision #2: an
    /// explicitly configured empty-string key is a misconfiguration, not an
    /// "unset" sentinel.
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.control_auth_key {
            if key.is_empty() {
                return Err(Error::Configuration(
                    "control_auth_key must not be empty; omit it to disable auth".into(),
                ));
            }
        }
        if self.user_event_size_limit > ABSOLUTE_USER_EVENT_LIMIT {
            return Err(Error::Configuration(format!(
                "user_event_size_limit {} exceeds absolute limit {}",
                self.user_event_size_limit, ABSOLUTE_USER_EVENT_LIMIT
            )));
        }
        for key in &self.secret_keys {
            if ![16, 24, 32].contains(&key.len()) {
                return Err(Error::Configuration(format!(
                    "keyring key must be 16, 24, or 32 bytes, got {}",
                    key.len()
                )));
            }
        }
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            hostname_from_uname().ok()
        })
        .unwrap_or_else(|| "node".to_string())
}

fn hostname_from_uname() -> std::io::Result<String> {
    std::fs::read_to_string("/etc/hostname").map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn empty_auth_key_rejected() {
        let mut cfg = Config::default();
        cfg.control_auth_key = Some(String::new());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_key_length_rejected() {
        let mut cfg = Config::default();
        cfg.secret_keys.push(vec![0u8; 10]);
        assert!(cfg.validate().is_err());
    }
}
