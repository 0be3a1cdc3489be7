use super::{DiscoveryBackend, RecordStream};
use crate::error::{Result, RpcError};
use crate::models::{ServiceRecord, ServiceType};
use crate::utils::{local_host_identity, mdns_host};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::time::Duration;
use tracing::{debug, trace};

/// Multicast DNS backend built on the `mdns-sd` daemon.
pub struct MdnsBackend {
    daemon: ServiceDaemon,
}

impl MdnsBackend {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(RpcError::transport)?;
        Ok(Self { daemon })
    }
}

/// Stops the daemon-side browse when the record stream is dropped.
struct BrowseGuard {
    daemon: ServiceDaemon,
    fqdn: String,
}

impl Drop for BrowseGuard {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.stop_browse(&self.fqdn) {
            debug!(error = %e, service_type = %self.fqdn, "failed to stop browse");
        }
    }
}

/// Converts a resolved mDNS service into a record.
fn resolved_to_record(info: &ServiceInfo) -> ServiceRecord {
    let ty_domain = info.get_type();
    let fullname = info.get_fullname();
    let name = fullname
        .strip_suffix(ty_domain)
        .map(|n| n.trim_end_matches('.'))
        .unwrap_or(fullname);
    let service_type = ServiceType::parse(ty_domain)
        .map(|t| t.as_str().to_string())
        .unwrap_or_else(|_| ty_domain.to_string());
    let text: Vec<String> = info
        .get_properties()
        .iter()
        .map(|p| match p.val_str() {
            "" => p.key().to_string(),
            val => format!("{}={}", p.key(), val),
        })
        .collect();
    // A live record never carries the zero TTL reserved for withdrawal.
    let ttl = Duration::from_secs(u64::from(info.get_other_ttl().max(1)));

    ServiceRecord::new(name, service_type, info.get_port())
        .with_text(text)
        .with_host(info.get_hostname())
        .with_addrs(info.get_addresses().iter().copied())
        .with_ttl(ttl)
}

fn removed_to_record(ty_domain: &str, fullname: &str) -> ServiceRecord {
    let name = fullname
        .strip_suffix(ty_domain)
        .map(|n| n.trim_end_matches('.'))
        .unwrap_or(fullname);
    let service_type = ServiceType::parse(ty_domain)
        .map(|t| t.as_str().to_string())
        .unwrap_or_else(|_| ty_domain.to_string());
    ServiceRecord::new(name, service_type, 0)
}

#[async_trait]
impl DiscoveryBackend for MdnsBackend {
    async fn announce(&self, service_type: &ServiceType, record: &ServiceRecord) -> Result<()> {
        let host = if record.host().is_empty() {
            mdns_host(&local_host_identity())
        } else {
            mdns_host(record.host())
        };
        let ips = record
            .addrs()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let properties: Vec<(&str, &str)> = record
            .text()
            .iter()
            .map(|t| t.split_once('=').unwrap_or((t.as_str(), "")))
            .collect();

        let info = ServiceInfo::new(
            &service_type.fqdn(),
            record.name(),
            &host,
            ips.as_str(),
            record.port(),
            &properties[..],
        )
        .map_err(RpcError::transport)?;
        // Only auto-detect addresses when the record names none.
        let info = if ips.is_empty() {
            info.enable_addr_auto()
        } else {
            info
        };

        let fullname = info.get_fullname().to_string();
        self.daemon.register(info).map_err(RpcError::transport)?;
        debug!(%fullname, %host, "mDNS register queued");
        Ok(())
    }

    async fn withdraw(&self, name: &str, service_type: &ServiceType) -> Result<()> {
        let fullname = format!("{name}.{}", service_type.fqdn());
        // The returned status channel only reports goodbye-packet delivery.
        self.daemon
            .unregister(&fullname)
            .map_err(RpcError::transport)?;
        debug!(%fullname, "mDNS unregister queued");
        Ok(())
    }

    async fn browse(&self, service_type: &ServiceType) -> Result<RecordStream> {
        let fqdn = service_type.fqdn();
        let receiver = self.daemon.browse(&fqdn).map_err(RpcError::transport)?;
        let guard = BrowseGuard {
            daemon: self.daemon.clone(),
            fqdn,
        };

        let records = stream::unfold((receiver, guard), |(receiver, guard)| async move {
            loop {
                match receiver.recv_async().await {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let record = resolved_to_record(&info);
                        return Some((Ok(record), (receiver, guard)));
                    }
                    Ok(ServiceEvent::ServiceRemoved(ty_domain, fullname)) => {
                        let record = removed_to_record(&ty_domain, &fullname);
                        return Some((Ok(record), (receiver, guard)));
                    }
                    Ok(ServiceEvent::SearchStopped(_)) => return None,
                    Ok(other) => trace!(event = ?other, "mDNS event ignored"),
                    Err(e) => {
                        let err = RpcError::transport(e);
                        return Some((Err(err), (receiver, guard)));
                    }
                }
            }
        });
        Ok(records.boxed())
    }

    async fn shutdown(&self) -> Result<()> {
        self.daemon.shutdown().map_err(RpcError::transport)?;
        debug!("mDNS daemon shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_maps_to_withdrawal_record() {
        let record = removed_to_record("_ipp._tcp.local.", "printer._ipp._tcp.local.");
        assert_eq!(record.name(), "printer");
        assert_eq!(record.service_type(), "_ipp._tcp");
        assert!(record.is_withdrawal());
    }

    #[test]
    fn resolved_service_maps_to_live_record() {
        let info = ServiceInfo::new(
            "_ipp._tcp.local.",
            "printer",
            "office.local.",
            "192.168.1.20",
            631,
            &[("rp", "queue"), ("color", "")][..],
        )
        .unwrap();
        let record = resolved_to_record(&info);
        assert_eq!(record.name(), "printer");
        assert_eq!(record.service_type(), "_ipp._tcp");
        assert_eq!(record.port(), 631);
        assert_eq!(record.host(), "office.local.");
        assert_eq!(record.ip4().len(), 1);
        assert!(record.ttl() > Duration::ZERO);
        assert!(record.text().contains(&"rp=queue".to_string()));
        assert!(record.text().contains(&"color".to_string()));
    }
}
