pub mod advertise;
pub mod browser;

use shared::types::Record;

/// Raw discovery events surfaced by the transport, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    TypeDiscovered(String),
    InstanceAdded(Record),
    InstanceUpdated(Record),
    /// Carries the record key
    InstanceRemoved(String),
}

/// Core-to-transport requests. Fire-and-forget.
pub trait Resolver: Send + Sync {
    fn request_resolve(&self, service_type: &str, name: &str);
}

/// mdns-sd resolves every instance found on an active browse by itself, so a
/// resolve request only has to be noted.
pub struct MdnsResolver;

impl Resolver for MdnsResolver {
    fn request_resolve(&self, service_type: &str, name: &str) {
        tracing::trace!("Resolution of {}.{} pending on active browse", name, service_type);
    }
}
