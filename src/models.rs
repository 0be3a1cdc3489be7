use crate::error::{Result, RpcError};

use bitflags::bitflags;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;
use std::time::Duration;

static SERVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9\-]*$").expect("service name pattern is a valid regex")
});

/// Checks `name` against the service-name grammar.
pub fn validate_service_name(name: &str) -> Result<()> {
    if SERVICE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(RpcError::InvalidServiceName(name.to_string()))
    }
}

bitflags! {
    /// Flags selecting transport and address family for a client or service.
    ///
    /// Absence of `USE_UDP` implies TCP. Absence of both address-family
    /// flags means either family is acceptable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransportFlags: u32 {
        const USE_UDP = 1 << 1;
        const USE_IPV4 = 1 << 2;
        const USE_IPV6 = 1 << 3;
    }
}

impl Default for TransportFlags {
    fn default() -> Self {
        Self::NONE
    }
}

impl TransportFlags {
    pub const NONE: Self = Self::empty();

    /// Whether an address of this family is acceptable under these flags.
    pub fn allows(&self, ip: &IpAddr) -> bool {
        let family = *self & (Self::USE_IPV4 | Self::USE_IPV6);
        if family.is_empty() {
            return true;
        }
        match ip {
            IpAddr::V4(_) => family.contains(Self::USE_IPV4),
            IpAddr::V6(_) => family.contains(Self::USE_IPV6),
        }
    }
}

/// Returns the rendezvous string for a protocol name: `_<name>._udp` when
/// `USE_UDP` is set, `_<name>._tcp` otherwise.
pub fn rpc_service_type(name: &str, flags: TransportFlags) -> Result<String> {
    ServiceType::new(name, flags).map(|t| t.as_str().to_string())
}

/// A validated rendezvous string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceType {
    protocol: String,
    udp: bool,
    rendezvous: String,
}

impl ServiceType {
    pub fn new(protocol: &str, flags: TransportFlags) -> Result<Self> {
        validate_service_name(protocol)?;
        let udp = flags.contains(TransportFlags::USE_UDP);
        let transport = if udp { "udp" } else { "tcp" };
        Ok(Self {
            protocol: protocol.to_string(),
            udp,
            rendezvous: format!("_{protocol}._{transport}"),
        })
    }

    /// Accepts a bare protocol name (`ipp`, taken as TCP), a rendezvous
    /// string (`_ipp._tcp`) or a fully qualified type (`_ipp._tcp.local.`).
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim_end_matches('.');
        let trimmed = trimmed.strip_suffix(".local").unwrap_or(trimmed);

        let Some(rest) = trimmed.strip_prefix('_') else {
            return Self::new(trimmed, TransportFlags::NONE);
        };
        let Some((protocol, transport)) = rest.rsplit_once("._") else {
            return Err(RpcError::InvalidServiceName(s.to_string()));
        };
        let flags = match transport {
            "tcp" => TransportFlags::NONE,
            "udp" => TransportFlags::USE_UDP,
            other => {
                return Err(RpcError::BadParameter(format!(
                    "unknown transport {other:?} in service type {s:?}"
                )));
            }
        };
        Self::new(protocol, flags)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn is_udp(&self) -> bool {
        self.udp
    }

    /// The rendezvous form, e.g. `_ipp._tcp`.
    pub fn as_str(&self) -> &str {
        &self.rendezvous
    }

    /// The mDNS form, e.g. `_ipp._tcp.local.`.
    pub fn fqdn(&self) -> String {
        format!("{}.local.", self.rendezvous)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendezvous)
    }
}

/// Advertised metadata describing a discoverable endpoint.
///
/// Records are values: they are built once and never mutated. A record
/// with a zero TTL announces that the (name, type) pair is being withdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ServiceRecord {
    name: String,
    service_type: String,
    port: u16,
    text: Vec<String>,
    host: String,
    ip4: BTreeSet<Ipv4Addr>,
    ip6: BTreeSet<Ipv6Addr>,
    ttl: Duration,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_text<I, S>(mut self, text: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.text = text.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Adds addresses, sorting them into the v4 and v6 sets.
    pub fn with_addrs<I: IntoIterator<Item = IpAddr>>(mut self, addrs: I) -> Self {
        for addr in addrs {
            match addr {
                IpAddr::V4(v4) => {
                    self.ip4.insert(v4);
                }
                IpAddr::V6(v6) => {
                    self.ip6.insert(v6);
                }
            }
        }
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// A copy of this record's identity marked as withdrawn.
    pub fn withdrawal(&self) -> Self {
        Self::new(self.name.clone(), self.service_type.clone(), self.port)
            .with_host(self.host.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn text(&self) -> &[String] {
        &self.text
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ip4(&self) -> &BTreeSet<Ipv4Addr> {
        &self.ip4
    }

    pub fn ip6(&self) -> &BTreeSet<Ipv6Addr> {
        &self.ip6
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_withdrawal(&self) -> bool {
        self.ttl.is_zero()
    }

    /// Identity used to match announcements against withdrawals.
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.service_type.clone())
    }

    /// All addresses, v4 first.
    pub fn addrs(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ip4
            .iter()
            .copied()
            .map(IpAddr::V4)
            .chain(self.ip6.iter().copied().map(IpAddr::V6))
    }
}

fn join<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(8);
        if !self.name.is_empty() {
            parts.push(format!("name={:?}", self.name));
        }
        if !self.service_type.is_empty() {
            parts.push(format!("type={}", self.service_type));
        }
        if self.port > 0 {
            parts.push(format!("port={}", self.port));
        }
        if !self.host.is_empty() {
            parts.push(format!("host={}", self.host));
        }
        if !self.ip4.is_empty() {
            parts.push(format!("ip4=[{}]", join(&self.ip4)));
        }
        if !self.ip6.is_empty() {
            parts.push(format!("ip6=[{}]", join(&self.ip6)));
        }
        if !self.ttl.is_zero() {
            parts.push(format!("ttl={:?}", self.ttl));
        }
        if !self.text.is_empty() {
            parts.push(format!("txt=[{}]", join(&self.text)));
        }
        write!(f, "<rpc.ServiceRecord>{{ {} }}", parts.join(" "))
    }
}

/// Kind of event carried on an event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum EventType {
    None = 0,
    ServerStarted = 1,
    ServerStopped = 2,
    ServiceRecordChanged = 3,
}

impl EventType {
    pub fn from_repr(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::ServerStarted),
            2 => Some(Self::ServerStopped),
            3 => Some(Self::ServiceRecordChanged),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "RPC_EVENT_NONE",
            Self::ServerStarted => "RPC_EVENT_SERVER_STARTED",
            Self::ServerStopped => "RPC_EVENT_SERVER_STOPPED",
            Self::ServiceRecordChanged => "RPC_EVENT_SERVICE_RECORD",
        }
    }

    /// Renders a raw numeric event type, including values outside the enum.
    pub fn describe(value: u32) -> &'static str {
        Self::from_repr(value).map_or("[?? Invalid EventType value]", |t| t.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope delivered through an [`EventBus`](crate::events::EventBus).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    kind: EventType,
    record: Option<ServiceRecord>,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Self { kind, record: None }
    }

    pub fn service_record(record: ServiceRecord) -> Self {
        Self {
            kind: EventType::ServiceRecordChanged,
            record: Some(record),
        }
    }

    pub fn kind(&self) -> EventType {
        self.kind
    }

    pub fn record(&self) -> Option<&ServiceRecord> {
        self.record.as_ref()
    }

    pub fn into_record(self) -> Option<ServiceRecord> {
        self.record
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            Some(record) => write!(f, "{} {}", self.kind, record),
            None => write!(f, "{}", self.kind),
        }
    }
}
