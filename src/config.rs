// src/config.rs
//! Server configuration
//!
//! All fields have defaults, so a JSON file only needs to name what it
//! changes. Durations are whole seconds on the wire.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocation::AllocationPolicy;
use crate::auth::DEFAULT_NONCE_CAPACITY;
use crate::error::{TurnError, TurnResult};
use crate::relay::{PortRangeRelayGenerator, RelayAddressGenerator, StaticRelayGenerator};

/// Default TURN port
pub const DEFAULT_PORT: u16 = 3478;

/// Default realm
pub const DEFAULT_REALM: &str = "pion.ly";

/// Relay address strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayConfig {
    /// Bind ephemeral ports on `bind_ip`, advertise `public_ip`
    Static { public_ip: IpAddr, bind_ip: IpAddr },
    /// Bind random ports from `min_port..=max_port` on `bind_ip`, advertise `relay_ip`
    PortRange {
        relay_ip: IpAddr,
        bind_ip: IpAddr,
        min_port: u16,
        max_port: u16,
    },
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig::Static {
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl RelayConfig {
    /// Build the generator described by this configuration
    pub fn build(&self, max_attempts: u32) -> Arc<dyn RelayAddressGenerator> {
        match *self {
            RelayConfig::Static { public_ip, bind_ip } => {
                Arc::new(StaticRelayGenerator::new(public_ip, bind_ip, max_attempts))
            }
            RelayConfig::PortRange {
                relay_ip,
                bind_ip,
                min_port,
                max_port,
            } => Arc::new(PortRangeRelayGenerator::new(
                relay_ip,
                bind_ip,
                min_port,
                max_port,
                max_attempts,
            )),
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub realm: String,
    /// SOFTWARE attribute value on responses
    pub software: String,
    pub relay: RelayConfig,
    #[serde(with = "duration_secs")]
    pub default_lifetime: Duration,
    #[serde(with = "duration_secs")]
    pub max_lifetime: Duration,
    #[serde(with = "duration_secs")]
    pub permission_lifetime: Duration,
    #[serde(with = "duration_secs")]
    pub channel_lifetime: Duration,
    #[serde(with = "duration_secs")]
    pub nonce_lifetime: Duration,
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Total allocation quota, 0 = unlimited
    pub max_allocations: usize,
    /// Per-user allocation quota, 0 = unlimited
    pub max_allocations_per_user: usize,
    pub max_bind_attempts: u32,
    /// Bound on outstanding authentication nonces
    pub max_nonces: usize,
    /// Bound on concurrent per-client UDP workers
    pub max_udp_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_PORT,
            enable_udp: true,
            enable_tcp: true,
            realm: DEFAULT_REALM.to_string(),
            software: format!("turn-server/{}", crate::VERSION),
            relay: RelayConfig::default(),
            default_lifetime: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            permission_lifetime: Duration::from_secs(300),
            channel_lifetime: Duration::from_secs(600),
            nonce_lifetime: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(5),
            max_allocations: 0,
            max_allocations_per_user: 0,
            max_bind_attempts: 10,
            max_nonces: DEFAULT_NONCE_CAPACITY,
            max_udp_workers: 4096,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> TurnResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| {
            TurnError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Address the UDP and TCP listeners bind to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// Validate configuration
    pub fn validate(&self) -> TurnResult<()> {
        if self.realm.is_empty() {
            return Err(TurnError::Configuration("realm must be configured".into()));
        }

        if !self.enable_udp && !self.enable_tcp {
            return Err(TurnError::Configuration("no transport enabled".into()));
        }

        let lifetimes = [
            ("default_lifetime", self.default_lifetime),
            ("max_lifetime", self.max_lifetime),
            ("permission_lifetime", self.permission_lifetime),
            ("channel_lifetime", self.channel_lifetime),
            ("nonce_lifetime", self.nonce_lifetime),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, value) in lifetimes {
            if value.is_zero() {
                return Err(TurnError::Configuration(format!("{} cannot be zero", name)));
            }
        }

        if self.max_nonces == 0 || self.max_udp_workers == 0 {
            return Err(TurnError::Configuration(
                "max_nonces and max_udp_workers must be positive".into(),
            ));
        }

        if self.default_lifetime > self.max_lifetime {
            return Err(TurnError::Configuration(format!(
                "default lifetime {:?} exceeds maximum {:?}",
                self.default_lifetime, self.max_lifetime
            )));
        }

        self.relay.build(self.max_bind_attempts).validate()
    }

    /// Lifetimes and quotas for the allocation table
    pub fn allocation_policy(&self) -> AllocationPolicy {
        AllocationPolicy {
            default_lifetime: self.default_lifetime,
            max_lifetime: self.max_lifetime,
            permission_lifetime: self.permission_lifetime,
            channel_lifetime: self.channel_lifetime,
            max_allocations: self.max_allocations,
            max_allocations_per_user: self.max_allocations_per_user,
            max_relay_attempts: self.max_bind_attempts,
        }
    }
}

/// Parse a `user=pass,user=pass` list.
///
/// Both sides must consist of word characters (alphanumeric or `_`);
/// malformed entries are skipped.
pub fn parse_users(list: &str) -> Vec<(String, String)> {
    let is_word = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_');

    list.split(',')
        .filter_map(|entry| entry.trim().split_once('='))
        .filter(|(user, pass)| is_word(user) && is_word(pass))
        .map(|(user, pass)| (user.to_string(), pass.to_string()))
        .collect()
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_port, 3478);
        assert_eq!(config.realm, "pion.ly");
        assert_eq!(config.default_lifetime, Duration::from_secs(600));
        assert!(config.software.starts_with("turn-server/"));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "listen_port": 5349,
            "realm": "example.org",
            "permission_lifetime": 120,
            "relay": { "type": "port_range", "relay_ip": "203.0.113.1",
                       "bind_ip": "0.0.0.0", "min_port": 49152, "max_port": 49200 }
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.listen_port, 5349);
        assert_eq!(config.permission_lifetime, Duration::from_secs(120));
        assert_eq!(config.max_lifetime, Duration::from_secs(3600));
        assert!(matches!(config.relay, RelayConfig::PortRange { min_port: 49152, .. }));
        config.validate().unwrap();

        let round: ServerConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(round.permission_lifetime, config.permission_lifetime);
        assert_eq!(round.relay, config.relay);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.realm.clear();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.default_lifetime = Duration::from_secs(7200);
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.nonce_lifetime = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.max_nonces = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.relay = RelayConfig::PortRange {
            relay_ip: "203.0.113.1".parse().unwrap(),
            bind_ip: "0.0.0.0".parse().unwrap(),
            min_port: 50000,
            max_port: 40000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_users() {
        let users = parse_users("alice=pw1, bob=pw_2,broken,=x,eve=,mallory=p@ss");
        assert_eq!(
            users,
            vec![
                ("alice".to_string(), "pw1".to_string()),
                ("bob".to_string(), "pw_2".to_string()),
            ]
        );
        assert!(parse_users("").is_empty());
    }
}
