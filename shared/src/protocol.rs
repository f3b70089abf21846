use std::future::Future;
use serde::{Serialize, Deserialize};
use crate::types::Record;

/// DNS-SD meta-query used to enumerate every advertised service type
pub const META_QUERY_TYPE: &str = "_services._dns-sd._udp.local.";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// TXT key holding the URL path of an HTTP-ish service
pub const TXT_PATH: &str = "path";

/// Notifications pushed to a subscriber connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "record", rename_all = "snake_case")]
pub enum Notification {
    /// The registry is ready to serve this connection
    Connected,
    /// A record was added, re-resolved or replayed
    Updated(Record),
    /// A record went away; carries its last known value
    Removed(Record),
}

/// Remote side of service registration, as seen by a registration client.
pub trait RegistrationService {
    /// Advertise `record` on the network.
    fn register_service(&self, record: &Record) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Withdraw a previously advertised `record`.
    fn unregister_service(&self, record: &Record) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_wire_shape() {
        let json = serde_json::to_value(Notification::Connected).unwrap();
        assert_eq!(json, serde_json::json!({ "event": "connected" }));

        let record = Record::new("_http._tcp.local.", "web");
        let json = serde_json::to_value(Notification::Removed(record.clone())).unwrap();
        assert_eq!(json["event"], "removed");
        assert_eq!(json["record"]["name"], "web");

        let back: Notification = serde_json::from_value(json).unwrap();
        assert_eq!(back, Notification::Removed(record));
    }
}
