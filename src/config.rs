use crate::error::{Result, RpcError};
use crate::models::validate_service_name;

use serde::Deserialize;
use std::{io::Read, net::SocketAddr, path::Path, time::Duration};

/// Represents the top-level configuration loaded from a TOML file.
///
/// Every section is optional; an empty document yields the defaults.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RpcConfig {
    pub events: EventsConfig,
    pub discovery: DiscoveryConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EventsConfig {
    /// Events each subscriber may buffer before emitters wait.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1 }
    }
}

/// Which announcement mechanism backs discovery.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Mdns,
    Memory,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub backend: BackendKind,
    /// TTL stamped on announcements that do not carry their own.
    pub ttl_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            ttl_secs: 120,
        }
    }
}

impl DiscoveryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Instance name for this server's records; the host name when unset.
    pub name: Option<String>,
    /// Answer `rpc.reflection` requests with the registered module names.
    pub reflection: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            name: None,
            reflection: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    /// Try IPv6 addresses before IPv4 when both are allowed.
    pub prefer_ipv6: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            prefer_ipv6: false,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl RpcConfig {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            RpcError::Config(format!("read config from {:?}: {e}", path.as_ref()))
        })?;
        Self::parse(&content)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut buf = String::new();
        let mut rdr = reader;
        rdr.read_to_string(&mut buf)
            .map_err(|e| RpcError::Config(format!("read config: {e}")))?;
        Self::parse(&buf)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RpcError::Config(format!("parse rpc config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.events.capacity == 0 {
            return Err(RpcError::BadParameter(
                "events.capacity must be at least 1".into(),
            ));
        }
        if self.client.connect_timeout_ms == 0 {
            return Err(RpcError::BadParameter(
                "client.connect_timeout_ms must be positive".into(),
            ));
        }
        if let Some(name) = &self.server.name {
            validate_service_name(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RpcConfig::from_reader("".as_bytes()).unwrap();
        assert_eq!(config.events.capacity, 1);
        assert_eq!(config.discovery.backend, BackendKind::Mdns);
        assert_eq!(config.discovery.ttl(), Duration::from_secs(120));
        assert_eq!(config.server.bind.port(), 0);
        assert!(config.server.reflection);
        assert_eq!(config.client.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn reads_every_section() {
        let toml = r#"
            [events]
            capacity = 16

            [discovery]
            backend = "memory"
            ttl_secs = 30

            [server]
            bind = "127.0.0.1:9000"
            name = "kitchen"
            reflection = false

            [client]
            connect_timeout_ms = 250
            prefer_ipv6 = true
        "#;
        let config = RpcConfig::from_reader(toml.as_bytes()).unwrap();
        assert_eq!(config.events.capacity, 16);
        assert_eq!(config.discovery.backend, BackendKind::Memory);
        assert_eq!(config.discovery.ttl_secs, 30);
        assert_eq!(config.server.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server.name.as_deref(), Some("kitchen"));
        assert!(!config.server.reflection);
        assert_eq!(config.client.connect_timeout_ms, 250);
        assert!(config.client.prefer_ipv6);
    }

    #[test]
    fn rejects_invalid_values() {
        let zero = RpcConfig::from_reader("[events]\ncapacity = 0\n".as_bytes());
        assert!(matches!(zero, Err(RpcError::BadParameter(_))));

        let name = RpcConfig::from_reader("[server]\nname = \"my host\"\n".as_bytes());
        assert!(matches!(name, Err(RpcError::InvalidServiceName(_))));

        let garbage = RpcConfig::from_reader("[discovery]\nbackend = \"carrier-pigeon\"\n".as_bytes());
        assert!(matches!(garbage, Err(RpcError::Config(_))));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = RpcConfig::load("/nonexistent/rpc.toml").unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }
}
