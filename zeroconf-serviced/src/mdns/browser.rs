use std::collections::HashSet;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{Context, Result};
use shared::protocol::{META_QUERY_TYPE, TXT_PATH};
use shared::types::Record;
use crate::mdns::TransportEvent;
use crate::serializer::RegistryHandle;

type RecvResult = (String, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of its type's receiver and hands it back with
/// the event, so it can be re-armed.
fn make_recv_future(service_type: String, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (service_type, rx, result)
    })
}

/// Browse every advertised type and feed transport events into the registry
/// queue until cancelled. Every event is enqueued before this returns.
pub async fn run_browser(
    daemon: ServiceDaemon,
    registry: RegistryHandle,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting mDNS browser");

    let meta_receiver = daemon
        .browse(META_QUERY_TYPE)
        .context("Failed to start meta-query browse")?;

    let mut browsed_types = HashSet::new();
    // Keys this session has surfaced, so repeat "found" announcements do not
    // overwrite resolved records with placeholders
    let mut known_keys = HashSet::new();
    let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

    loop {
        tokio::select! {
            event = meta_receiver.recv_async() => {
                let service_type = match event {
                    Ok(ServiceEvent::ServiceFound(_, type_name)) => type_name,
                    Ok(ServiceEvent::ServiceResolved(info)) => info.get_type().to_string(),
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!("Error receiving meta-query event: {}", e);
                        break;
                    }
                };

                if browsed_types.insert(service_type.clone()) {
                    registry.submit(TransportEvent::TypeDiscovered(service_type.clone())).await?;

                    match daemon.browse(&service_type) {
                        Ok(receiver) => type_futures.push(make_recv_future(service_type, receiver)),
                        Err(e) => tracing::error!("Failed to browse {}: {}", service_type, e),
                    }
                }
            }

            Some((service_type, rx, result)) = type_futures.next() => {
                let event = match result {
                    Ok(ServiceEvent::ServiceFound(ty, fullname)) => {
                        let key = fullname.to_lowercase();
                        known_keys
                            .insert(key)
                            .then(|| TransportEvent::InstanceAdded(found_record(&ty, &fullname)))
                    }
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let record = convert_service_info(&info);
                        known_keys.insert(record.key.clone());
                        Some(TransportEvent::InstanceUpdated(record))
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        let key = fullname.to_lowercase();
                        known_keys.remove(&key);
                        Some(TransportEvent::InstanceRemoved(key))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!("Receiver for {} disconnected: {}", service_type, e);
                        continue;
                    }
                };

                if let Some(event) = event {
                    registry.submit(event).await?;
                }
                type_futures.push(make_recv_future(service_type, rx));
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    for service_type in browsed_types.iter().map(String::as_str).chain([META_QUERY_TYPE]) {
        if let Err(e) = daemon.stop_browse(service_type) {
            tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
        }
    }

    Ok(())
}

/// Instance name without its type suffix
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .unwrap_or(fullname)
        .trim_end_matches('.')
        .to_string()
}

/// Placeholder for an instance that has been announced but not yet resolved
fn found_record(service_type: &str, fullname: &str) -> Record {
    let mut record = Record::new(service_type, &instance_name(fullname, service_type));
    record.key = fullname.to_lowercase();
    record
}

/// Convert a resolved mdns-sd ServiceInfo into a Record
pub fn convert_service_info(info: &ServiceInfo) -> Record {
    let service_type = info.get_type();
    let mut record = found_record(service_type, info.get_fullname());

    record.subtype = info.get_subtype().clone().unwrap_or_default();
    record.server = info.get_hostname().to_string();
    record.port = info.get_port();
    record.priority = info.get_priority();
    record.weight = info.get_weight();

    // Raw TXT values; a key without a value maps to an empty byte string
    record.properties = info
        .get_properties()
        .iter()
        .map(|prop| {
            let value = prop.val().map(<[u8]>::to_vec).unwrap_or_default();
            (prop.key().to_string(), value)
        })
        .collect();

    let mut addresses: Vec<String> = info
        .get_addresses()
        .iter()
        .map(|addr| match addr {
            std::net::IpAddr::V4(v4) => v4.to_string(),
            std::net::IpAddr::V6(v6) => format!("[{}]", v6),
        })
        .collect();
    addresses.sort();
    record.urls = service_urls(&record, &addresses);

    record
}

/// One URL per address, "<scheme>://<addr>:<port><path>". A "path" TXT value
/// that is already a full URL is used as-is.
fn service_urls(record: &Record, addresses: &[String]) -> Vec<String> {
    let path = record.property_str(TXT_PATH).unwrap_or_default();
    if path.contains("://") {
        return vec![path];
    }
    let path = if path.is_empty() || path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    };
    let scheme = if record.application == "https" { "https" } else { "http" };

    addresses
        .iter()
        .map(|addr| format!("{}://{}:{}{}", scheme, addr, record.port, path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const HTTP: &str = "_http._tcp.local.";

    #[test]
    fn test_found_record_is_unresolved_placeholder() {
        let record = found_record(HTTP, "My Printer._http._tcp.local.");
        assert_eq!(record.key, "my printer._http._tcp.local.");
        assert_eq!(record.name, "My Printer");
        assert_eq!(record.service_type, HTTP);
        assert_eq!(record.application, "http");
        assert!(!record.is_resolved());
    }

    #[test]
    fn test_convert_service_info() {
        let txt = HashMap::from([
            ("path".to_string(), "admin".to_string()),
            ("model".to_string(), "X1".to_string()),
        ]);
        let info = ServiceInfo::new(HTTP, "web", "web.local.", "192.168.1.20", 8080, txt).unwrap();

        let record = convert_service_info(&info);
        assert_eq!(record.key, "web._http._tcp.local.");
        assert_eq!(record.name, "web");
        assert_eq!(record.server, "web.local.");
        assert_eq!(record.port, 8080);
        assert_eq!(record.property_str("model").as_deref(), Some("X1"));
        assert_eq!(record.urls, vec!["http://192.168.1.20:8080/admin".to_string()]);
        assert!(record.is_resolved());
    }

    #[test]
    fn test_service_urls_passthrough_absolute_path() {
        let mut record = Record::new("_https._tcp.local.", "secure");
        record.port = 443;
        assert_eq!(service_urls(&record, &["10.0.0.1".to_string()]), vec!["https://10.0.0.1:443"]);

        record.set_property(TXT_PATH, "https://example.test/ui");
        assert_eq!(service_urls(&record, &["10.0.0.1".to_string()]), vec!["https://example.test/ui"]);
    }
}
