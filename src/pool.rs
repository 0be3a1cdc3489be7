//! Connection pool that resolves endpoints from discovery events.
//!
//! The pool subscribes to a [`Discovery`] and folds every observed record
//! into a cache owned by a `ractor` actor. `connect` asks the actor for
//! candidate endpoints and dials them in order.

use crate::client::ClientConnection;
use crate::config::ClientConfig;
use crate::discovery::Discovery;
use crate::driver::Driver;
use crate::error::{Result, RpcError};
use crate::events::{Publisher, SubscriberId};
use crate::models::{ServiceRecord, ServiceType, TransportFlags, validate_service_name};

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, rpc::CallResult};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a known service can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Addr(SocketAddr),
    /// A record without addresses; resolved through the system resolver.
    Host(String, u16),
}

pub enum PoolMessage {
    Observed(ServiceRecord),
    Records {
        reply: RpcReplyPort<Result<Vec<ServiceRecord>>>,
    },
    Resolve {
        service_type: String,
        flags: TransportFlags,
        prefer_ipv6: bool,
        reply: RpcReplyPort<Result<Vec<Endpoint>>>,
    },
}

#[derive(Default)]
struct PoolState {
    records: BTreeMap<(String, String), ServiceRecord>,
}

impl PoolState {
    fn observe(&mut self, record: ServiceRecord) {
        if record.is_withdrawal() {
            if self.records.remove(&record.key()).is_some() {
                debug!(name = record.name(), service_type = record.service_type(), "forgot service");
            }
        } else {
            debug!(name = record.name(), service_type = record.service_type(), "learned service");
            self.records.insert(record.key(), record);
        }
    }

    fn endpoints(&self, service_type: &str, flags: TransportFlags, prefer_ipv6: bool) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        for record in self.records.values().filter(|r| r.service_type() == service_type) {
            let mut addrs: Vec<IpAddr> = record.addrs().filter(|ip| flags.allows(ip)).collect();
            if prefer_ipv6 {
                addrs.sort_by_key(|ip| ip.is_ipv4());
            }
            if addrs.is_empty() && record.ip4().is_empty() && record.ip6().is_empty() {
                if !record.host().is_empty() {
                    endpoints.push(Endpoint::Host(record.host().to_string(), record.port()));
                }
                continue;
            }
            endpoints.extend(addrs.into_iter().map(|ip| Endpoint::Addr(SocketAddr::new(ip, record.port()))));
        }
        endpoints
    }
}

struct PoolActor;

#[async_trait]
impl Actor for PoolActor {
    type Msg = PoolMessage;
    type State = PoolState;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> std::result::Result<Self::State, ActorProcessingErr> {
        Ok(PoolState::default())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> std::result::Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::Observed(record) => state.observe(record),
            PoolMessage::Records { reply } => {
                let _ = reply.send(Ok(state.records.values().cloned().collect()));
            }
            PoolMessage::Resolve {
                service_type,
                flags,
                prefer_ipv6,
                reply,
            } => {
                let _ = reply.send(Ok(state.endpoints(&service_type, flags, prefer_ipv6)));
            }
        }
        Ok(())
    }
}

/// Hands out connections to services of one protocol seen on the network.
pub struct ClientPool {
    protocol: String,
    config: ClientConfig,
    discovery: Arc<Discovery>,
    subscriber: SubscriberId,
    actor: ActorRef<PoolMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClientPool {
    /// Starts tracking services of `protocol` (e.g. `gopi`) observed by
    /// `discovery`. The pool only reads discovery events; something else
    /// must be browsing for them to arrive.
    pub async fn new(discovery: Arc<Discovery>, protocol: &str, config: ClientConfig) -> Result<Self> {
        validate_service_name(protocol)?;
        let mut subscription = discovery
            .subscribe()
            .ok_or_else(|| RpcError::InvalidState("discovery is closed".into()))?;
        let subscriber = subscription.id();

        let (actor, actor_task) = match Actor::spawn(None, PoolActor, ()).await {
            Ok(spawned) => spawned,
            Err(e) => {
                discovery.unsubscribe(subscriber);
                return Err(RpcError::InvalidState(format!("spawn pool actor: {e}")));
            }
        };

        let forwarder = {
            let actor = actor.clone();
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    let Some(record) = event.into_record() else {
                        continue;
                    };
                    if actor.cast(PoolMessage::Observed(record)).is_err() {
                        break;
                    }
                }
                debug!("pool stopped following discovery");
            })
        };

        Ok(Self {
            protocol: protocol.to_string(),
            config,
            discovery,
            subscriber,
            actor,
            tasks: Mutex::new(vec![forwarder, actor_task]),
            closed: AtomicBool::new(false),
        })
    }

    async fn call_actor<TResponse>(
        &self,
        msg_builder: impl FnOnce(RpcReplyPort<Result<TResponse>>) -> PoolMessage,
    ) -> Result<TResponse>
    where
        TResponse: Send + 'static + Debug,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::InvalidState("client pool is closed".into()));
        }
        match self.actor.call(msg_builder, None).await {
            Ok(CallResult::Success(result)) => result,
            Ok(other) => Err(RpcError::InvalidState(format!(
                "pool actor returned non-success call result: {other:?}"
            ))),
            Err(e) => Err(RpcError::InvalidState(format!("pool actor call failed: {e}"))),
        }
    }

    /// Every record the pool currently knows, across all types.
    pub async fn records(&self) -> Result<Vec<ServiceRecord>> {
        self.call_actor(|reply| PoolMessage::Records { reply }).await
    }

    /// Connects to a known service matching `flags`. Fails with
    /// `NoRouteAvailable` when no known service has an acceptable endpoint.
    pub async fn connect(&self, flags: TransportFlags) -> Result<ClientConnection> {
        if flags.contains(TransportFlags::USE_UDP) {
            return Err(RpcError::BadParameter(
                "client connections only support TCP".into(),
            ));
        }
        let service_type = ServiceType::new(&self.protocol, flags)?;
        let endpoints = self
            .call_actor(|reply| PoolMessage::Resolve {
                service_type: service_type.as_str().to_string(),
                flags,
                prefer_ipv6: self.config.prefer_ipv6,
                reply,
            })
            .await?;

        let mut last_error = None;
        for endpoint in endpoints {
            let addrs = match self.addrs_for(&endpoint, flags).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(?endpoint, error = %e, "could not resolve endpoint");
                    last_error = Some(e);
                    continue;
                }
            };
            for addr in addrs {
                let conn = ClientConnection::new(addr, &self.config);
                match conn.connect().await {
                    Ok(services) => {
                        info!(%addr, ?services, service_type = %service_type, "pool connected");
                        return Ok(conn);
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "endpoint unreachable");
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RpcError::NoRouteAvailable(service_type.to_string())))
    }

    async fn addrs_for(&self, endpoint: &Endpoint, flags: TransportFlags) -> Result<Vec<SocketAddr>> {
        match endpoint {
            Endpoint::Addr(addr) => Ok(vec![*addr]),
            Endpoint::Host(host, port) => {
                let host = host.trim_end_matches('.');
                let resolved = tokio::net::lookup_host((host, *port))
                    .await
                    .map_err(RpcError::connection)?;
                Ok(resolved.filter(|a| flags.allows(&a.ip())).collect())
            }
        }
    }
}

#[async_trait]
impl Driver for ClientPool {
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.discovery.unsubscribe(self.subscriber);
        self.actor.stop(None);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
        debug!(protocol = %self.protocol, "client pool closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(name: &str, ty: &str, addrs: &[&str]) -> ServiceRecord {
        ServiceRecord::new(name, ty, 7000)
            .with_addrs(addrs.iter().map(|a| a.parse().unwrap()))
            .with_ttl(Duration::from_secs(60))
    }

    #[test]
    fn withdrawals_evict_cached_records() {
        let mut state = PoolState::default();
        let live = record("a", "_gopi._tcp", &["10.0.0.1"]);
        state.observe(live.clone());
        state.observe(record("b", "_gopi._tcp", &["10.0.0.2"]));
        assert_eq!(state.records.len(), 2);

        state.observe(live.withdrawal());
        assert_eq!(state.records.len(), 1);
        assert!(state.records.contains_key(&("b".to_string(), "_gopi._tcp".to_string())));
    }

    #[test]
    fn endpoints_respect_type_and_family() {
        let mut state = PoolState::default();
        state.observe(record("dual", "_gopi._tcp", &["10.0.0.1", "fd00::1"]));
        state.observe(record("other", "_http._tcp", &["10.0.0.9"]));

        let any = state.endpoints("_gopi._tcp", TransportFlags::NONE, false);
        assert_eq!(
            any,
            vec![
                Endpoint::Addr("10.0.0.1:7000".parse().unwrap()),
                Endpoint::Addr("[fd00::1]:7000".parse().unwrap()),
            ]
        );

        let v6_first = state.endpoints("_gopi._tcp", TransportFlags::NONE, true);
        assert_eq!(v6_first[0], Endpoint::Addr("[fd00::1]:7000".parse().unwrap()));

        let v4 = state.endpoints("_gopi._tcp", TransportFlags::USE_IPV4, false);
        assert_eq!(v4, vec![Endpoint::Addr("10.0.0.1:7000".parse().unwrap())]);

        let v6 = state.endpoints("_gopi._tcp", TransportFlags::USE_IPV6, false);
        assert_eq!(v6, vec![Endpoint::Addr("[fd00::1]:7000".parse().unwrap())]);

        assert!(state.endpoints("_ipp._tcp", TransportFlags::NONE, false).is_empty());
    }

    #[test]
    fn hostname_only_records_fall_back_to_resolution() {
        let mut state = PoolState::default();
        state.observe(
            ServiceRecord::new("pi", "_gopi._tcp", 9000)
                .with_host("pi.local.")
                .with_ttl(Duration::from_secs(60)),
        );
        assert_eq!(
            state.endpoints("_gopi._tcp", TransportFlags::NONE, false),
            vec![Endpoint::Host("pi.local.".into(), 9000)]
        );
    }
}
