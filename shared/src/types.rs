use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// One discovered (or locally registered) service instance.
/// Two records describe the same instance iff their `key`s are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// System-wide unique key, e.g. "printer1._ipp._tcp.local."
    pub key: String,

    /// Caller-assigned key, only set on records this process registers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,

    /// User-visible instance name, e.g. "printer1"
    pub name: String,

    /// Discovery type, e.g. "_ipp._tcp.local."
    #[serde(rename = "type")]
    pub service_type: String,

    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub subtype: String,

    /// Target host, empty until the instance has been resolved
    #[serde(default)]
    pub server: String,

    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub priority: u16,
    #[serde(default)]
    pub weight: u16,

    #[serde(default)]
    pub urls: Vec<String>,

    /// TXT properties. Values are raw bytes and only decoded on demand.
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<u8>>,
}

impl Record {
    /// Create a bare record for `name` of `service_type`, keyed by its full name.
    pub fn new(service_type: &str, name: &str) -> Self {
        let mut record = Self {
            name: name.to_string(),
            instance: name.to_string(),
            service_type: service_type.to_string(),
            ..Self::default()
        };
        record.key = record.full_name().to_lowercase();
        record.fill_type_labels();
        record
    }

    /// DNS-SD instance name, "<name>.<type>"
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.name, self.service_type)
    }

    /// Split the type ("_http._tcp.local.") into application, protocol and domain.
    pub fn fill_type_labels(&mut self) {
        let mut labels = self.service_type.split('.').filter(|l| !l.is_empty());
        self.application = labels
            .next()
            .map(|l| l.trim_start_matches('_').to_string())
            .unwrap_or_default();
        self.protocol = labels
            .next()
            .map(|l| l.trim_start_matches('_').to_string())
            .unwrap_or_default();
        self.domain = labels.collect::<Vec<_>>().join(".");
    }

    /// Whether the transport has resolved this instance to a host.
    pub fn is_resolved(&self) -> bool {
        !self.server.is_empty()
    }

    pub fn property_names(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }

    /// Strict UTF-8 view of a property. Malformed values read as absent.
    pub fn property_str(&self, name: &str) -> Option<String> {
        let bytes = self.properties.get(name)?;
        std::str::from_utf8(bytes).ok().map(str::to_string)
    }

    pub fn property_bytes(&self, name: &str) -> Option<&[u8]> {
        self.properties.get(name).map(Vec::as_slice)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.properties.insert(name.into(), value.into());
    }
}

/// A registry record as served by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(flatten)]
    pub record: Record,

    /// When the registry first saw this key
    pub first_seen: DateTime<Utc>,

    /// When the registry last applied an add/update for this key
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_key_and_labels() {
        let record = Record::new("_http._tcp.local.", "Printer1");
        assert_eq!(record.key, "printer1._http._tcp.local.");
        assert_eq!(record.application, "http");
        assert_eq!(record.protocol, "tcp");
        assert_eq!(record.domain, "local");
        assert!(!record.is_resolved());
    }

    #[test]
    fn test_property_decoding() {
        let mut record = Record::new("_http._tcp.local.", "web");
        record.set_property("path", "/admin");
        record.set_property("blob", vec![0xff, 0xfe, 0x00]);

        assert_eq!(record.property_str("path").as_deref(), Some("/admin"));
        assert_eq!(record.property_str("blob"), None, "Malformed UTF-8 should read as absent");
        assert_eq!(record.property_bytes("blob"), Some(&[0xff, 0xfe, 0x00][..]));
        assert_eq!(record.property_str("missing"), None);
        assert_eq!(record.property_names(), vec!["blob", "path"]);
    }

    #[test]
    fn test_type_field_serializes_as_type() {
        let record = Record::new("_ssh._tcp.local.", "box");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "_ssh._tcp.local.");
        assert!(json.get("client_key").is_none());

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
