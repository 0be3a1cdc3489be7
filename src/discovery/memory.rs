use super::{DiscoveryBackend, RecordStream};
use crate::error::{Result, RpcError};
use crate::models::{ServiceRecord, ServiceType};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

const CHANGE_BUFFER: usize = 256;

struct Registry {
    records: BTreeMap<(String, String), ServiceRecord>,
    changes: broadcast::Sender<ServiceRecord>,
}

/// In-process announcement registry. Clones share the same registry, so a
/// record announced through one discovery is visible to every other
/// discovery built on a clone.
#[derive(Clone)]
pub struct MemoryBackend {
    registry: Arc<Mutex<Registry>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            registry: Arc::new(Mutex::new(Registry {
                records: BTreeMap::new(),
                changes,
            })),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records currently announced, in (name, type) order.
    pub fn records(&self) -> Vec<ServiceRecord> {
        self.registry().records.values().cloned().collect()
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    async fn announce(&self, service_type: &ServiceType, record: &ServiceRecord) -> Result<()> {
        let record = ServiceRecord::new(record.name(), service_type.as_str(), record.port())
            .with_text(record.text().iter().cloned())
            .with_host(record.host())
            .with_addrs(record.addrs())
            .with_ttl(record.ttl());

        let mut registry = self.registry();
        registry.records.insert(record.key(), record.clone());
        // No live browser is not an error.
        let _ = registry.changes.send(record);
        Ok(())
    }

    async fn withdraw(&self, name: &str, service_type: &ServiceType) -> Result<()> {
        let mut registry = self.registry();
        let key = (name.to_string(), service_type.as_str().to_string());
        match registry.records.remove(&key) {
            Some(record) => {
                let _ = registry.changes.send(record.withdrawal());
            }
            None => debug!(name, service_type = %service_type, "withdraw of unknown record"),
        }
        Ok(())
    }

    async fn browse(&self, service_type: &ServiceType) -> Result<RecordStream> {
        let wanted = service_type.as_str().to_string();
        // Snapshot and subscribe under one lock so no change falls between.
        let (current, rx) = {
            let registry = self.registry();
            let current: Vec<_> = registry
                .records
                .values()
                .filter(|r| r.service_type() == wanted)
                .cloned()
                .collect();
            (current, registry.changes.subscribe())
        };

        let live = stream::unfold((rx, wanted), |(mut rx, wanted)| async move {
            loop {
                match rx.recv().await {
                    Ok(record) if record.service_type() == wanted => {
                        return Some((Ok(record), (rx, wanted)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        let err = RpcError::TransportError(format!(
                            "browser fell behind by {missed} announcements"
                        ));
                        return Some((Err(err), (rx, wanted)));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(current.into_iter().map(Ok)).chain(live).boxed())
    }

    async fn shutdown(&self) -> Result<()> {
        // The registry outlives any one discovery built on it.
        debug!("memory discovery backend released");
        Ok(())
    }
}
