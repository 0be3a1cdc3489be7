//! Service advertisement and browsing.
//!
//! [`Discovery`] validates records and forwards them to a pluggable
//! [`DiscoveryBackend`]. Browsing turns every observation of a service type
//! into a `ServiceRecordChanged` event on the discovery's own bus. The
//! discovery keeps no record store; subscribers own any caching.

mod mdns;
mod memory;

pub use mdns::MdnsBackend;
pub use memory::MemoryBackend;

use crate::config::{BackendKind, RpcConfig};
use crate::driver::Driver;
use crate::error::{Result, RpcError};
use crate::events::{EventBus, Publisher};
use crate::models::{Event, ServiceRecord, ServiceType, validate_service_name};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observations of one service type. Withdrawals carry a zero TTL. An
/// `Err` item is an unrecoverable transport failure.
pub type RecordStream = BoxStream<'static, Result<ServiceRecord>>;

/// The announcement and browse mechanism behind a [`Discovery`].
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Publishes `record` under `service_type`, replacing any previous
    /// announcement with the same name and type.
    async fn announce(&self, service_type: &ServiceType, record: &ServiceRecord) -> Result<()>;

    async fn withdraw(&self, name: &str, service_type: &ServiceType) -> Result<()>;

    async fn browse(&self, service_type: &ServiceType) -> Result<RecordStream>;

    async fn shutdown(&self) -> Result<()>;
}

pub struct Discovery {
    backend: Arc<dyn DiscoveryBackend>,
    bus: EventBus,
    default_ttl: Duration,
    closed: CancellationToken,
}

impl Discovery {
    /// Builds a discovery with the backend named in `config`.
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let backend: Arc<dyn DiscoveryBackend> = match config.discovery.backend {
            BackendKind::Mdns => Arc::new(MdnsBackend::new()?),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        Ok(Self::with_backend(backend, config))
    }

    pub fn with_backend(backend: Arc<dyn DiscoveryBackend>, config: &RpcConfig) -> Self {
        Self {
            backend,
            bus: EventBus::new(config.events.capacity),
            default_ttl: config.discovery.ttl(),
            closed: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(RpcError::InvalidState("discovery is closed".into()))
        } else {
            Ok(())
        }
    }

    /// Publishes `record` for peers. A record registered without a TTL is
    /// announced with the configured default.
    pub async fn register(&self, record: &ServiceRecord) -> Result<()> {
        self.ensure_open()?;
        validate_service_name(record.name())?;
        let service_type = ServiceType::parse(record.service_type())?;
        if record.port() == 0 {
            return Err(RpcError::BadParameter(format!(
                "service {:?} has no port",
                record.name()
            )));
        }

        let record = if record.is_withdrawal() {
            record.clone().with_ttl(self.default_ttl)
        } else {
            record.clone()
        };
        self.backend.announce(&service_type, &record).await?;
        info!(name = record.name(), service_type = %service_type, port = record.port(), "registered service");
        Ok(())
    }

    /// Withdraws a previously registered record. Browsers observe it again
    /// with a zero TTL.
    pub async fn withdraw(&self, name: &str, service_type: &str) -> Result<()> {
        self.ensure_open()?;
        validate_service_name(name)?;
        let service_type = ServiceType::parse(service_type)?;
        self.backend.withdraw(name, &service_type).await?;
        info!(name, service_type = %service_type, "withdrew service");
        Ok(())
    }

    /// Emits a `ServiceRecordChanged` event for every record of
    /// `service_type` discovered, changed or withdrawn, until `cancel`
    /// fires or the discovery is closed.
    ///
    /// `service_type` may be a bare protocol name (`ipp`), a rendezvous
    /// string (`_ipp._tcp`) or an mDNS type (`_ipp._tcp.local.`).
    pub async fn browse(&self, cancel: CancellationToken, service_type: &str) -> Result<()> {
        self.ensure_open()?;
        let service_type = ServiceType::parse(service_type)?;
        let mut records = self.backend.browse(&service_type).await?;
        info!(service_type = %service_type, "browsing");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.closed.cancelled() => break,
                next = records.next() => next,
            };
            match next {
                Some(Ok(record)) => {
                    debug!(%record, "observed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.closed.cancelled() => break,
                        _ = self.emit(Event::service_record(record)) => {}
                    }
                }
                Some(Err(e)) => {
                    warn!(service_type = %service_type, error = %e, "browse failed");
                    return Err(e);
                }
                None => {
                    warn!(service_type = %service_type, "browse stream ended");
                    return Err(RpcError::TransportError(format!(
                        "browse for {service_type} ended unexpectedly"
                    )));
                }
            }
        }
        debug!(service_type = %service_type, "browse cancelled");
        Ok(())
    }
}

impl Publisher for Discovery {
    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

#[async_trait]
impl Driver for Discovery {
    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.bus.close();
        self.backend.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;
    use std::sync::Mutex;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn memory_discovery(backend: &MemoryBackend) -> Arc<Discovery> {
        Arc::new(Discovery::with_backend(
            Arc::new(backend.clone()),
            &RpcConfig::default(),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_then_browse_observes_record_and_withdrawal() {
        let backend = MemoryBackend::new();
        let discovery = memory_discovery(&backend);
        let mut sub = discovery.subscribe().unwrap();

        discovery
            .register(&ServiceRecord::new("printer", "_ipp._tcp", 631))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let browse = {
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { discovery.browse(cancel, "ipp").await })
        };

        let event = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind(), EventType::ServiceRecordChanged);
        let seen = event.record().unwrap();
        assert_eq!(seen.name(), "printer");
        assert_eq!(seen.service_type(), "_ipp._tcp");
        assert_eq!(seen.port(), 631);
        assert!(seen.ttl() > Duration::ZERO);

        discovery.withdraw("printer", "_ipp._tcp").await.unwrap();
        let event = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        let gone = event.record().unwrap();
        assert_eq!(gone.key(), seen.key());
        assert_eq!(gone.ttl(), Duration::ZERO);

        cancel.cancel();
        assert_eq!(timeout(WAIT, browse).await.unwrap().unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn browse_filters_other_types() {
        let backend = MemoryBackend::new();
        let discovery = memory_discovery(&backend);
        let mut sub = discovery.subscribe().unwrap();
        discovery
            .register(&ServiceRecord::new("web", "_http._tcp", 80))
            .await
            .unwrap();
        discovery
            .register(&ServiceRecord::new("printer", "_ipp._tcp", 631))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let browse = tokio::spawn({
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            async move { discovery.browse(cancel, "_http._tcp.local.").await }
        });

        let event = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.record().unwrap().name(), "web");
        assert!(timeout(Duration::from_millis(100), sub.recv()).await.is_err());

        cancel.cancel();
        browse.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn register_validates_before_announcing() {
        let discovery = memory_discovery(&MemoryBackend::new());
        let bad_name = discovery
            .register(&ServiceRecord::new("my printer", "_ipp._tcp", 631))
            .await;
        assert_eq!(
            bad_name,
            Err(RpcError::InvalidServiceName("my printer".into()))
        );

        let bad_type = discovery
            .register(&ServiceRecord::new("printer", "_ipp._sctp", 631))
            .await;
        assert!(matches!(bad_type, Err(RpcError::BadParameter(_))));

        let no_port = discovery
            .register(&ServiceRecord::new("printer", "_ipp._tcp", 0))
            .await;
        assert!(matches!(no_port, Err(RpcError::BadParameter(_))));
    }

    #[tokio::test]
    async fn browse_rejects_invalid_type_synchronously() {
        let discovery = memory_discovery(&MemoryBackend::new());
        let result = discovery
            .browse(CancellationToken::new(), "not a type")
            .await;
        assert!(matches!(result, Err(RpcError::InvalidServiceName(_))));
    }

    struct BrokenBackend {
        announced: Mutex<usize>,
    }

    #[async_trait]
    impl DiscoveryBackend for BrokenBackend {
        async fn announce(&self, _: &ServiceType, _: &ServiceRecord) -> Result<()> {
            *self.announced.lock().unwrap() += 1;
            Err(RpcError::TransportError("socket bind refused".into()))
        }

        async fn withdraw(&self, _: &str, _: &ServiceType) -> Result<()> {
            Ok(())
        }

        async fn browse(&self, _: &ServiceType) -> Result<RecordStream> {
            let items = vec![
                Ok(ServiceRecord::new("a", "_x._tcp", 1).with_ttl(Duration::from_secs(1))),
                Err(RpcError::TransportError("interface went away".into())),
            ];
            Ok(futures::stream::iter(items).boxed())
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn transport_failures_surface_once() {
        let backend = Arc::new(BrokenBackend {
            announced: Mutex::new(0),
        });
        let discovery = Discovery::with_backend(backend.clone(), &RpcConfig::default());

        let registered = discovery
            .register(&ServiceRecord::new("a", "_x._tcp", 1))
            .await;
        assert!(matches!(registered, Err(RpcError::TransportError(_))));
        assert_eq!(*backend.announced.lock().unwrap(), 1);

        // No subscribers, so the first record is emitted to nobody.
        let browsed = discovery.browse(CancellationToken::new(), "x").await;
        assert_eq!(
            browsed,
            Err(RpcError::TransportError("interface went away".into()))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_use() {
        let discovery = memory_discovery(&MemoryBackend::new());
        let mut sub = discovery.subscribe().unwrap();
        discovery.close().await.unwrap();
        discovery.close().await.unwrap();

        assert_eq!(sub.recv().await, None);
        assert!(discovery.subscribe().is_none());
        let result = discovery
            .register(&ServiceRecord::new("printer", "_ipp._tcp", 631))
            .await;
        assert!(matches!(result, Err(RpcError::InvalidState(_))));
    }
}
