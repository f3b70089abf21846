use std::collections::BTreeMap;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::Record;

/// Fields that identify what a subscriber would see. Client keys are local
/// bookkeeping and do not take part.
#[derive(Serialize)]
struct DigestView<'a> {
    key: &'a str,
    service_type: &'a str,
    name: &'a str,
    server: &'a str,
    port: u16,
    priority: u16,
    weight: u16,
    subtype: &'a str,
    urls: &'a [String],
    properties: &'a BTreeMap<String, Vec<u8>>,
}

/// SHA-256 over the registry contents, sorted by key so the digest does not
/// depend on arrival order.
pub fn compute_digest<'a>(records: impl IntoIterator<Item = &'a Record>) -> String {
    let mut views: Vec<DigestView<'_>> = records
        .into_iter()
        .map(|r| DigestView {
            key: &r.key,
            service_type: &r.service_type,
            name: &r.name,
            server: &r.server,
            port: r.port,
            priority: r.priority,
            weight: r.weight,
            subtype: &r.subtype,
            urls: &r.urls,
            properties: &r.properties,
        })
        .collect();
    views.sort_by(|a, b| a.key.cmp(b.key));

    let mut hasher = Sha256::new();
    for view in &views {
        // Serializing plain strings, integers and byte maps cannot fail
        if let Ok(bytes) = serde_json::to_vec(view) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(name: &str) -> Record {
        let mut r = Record::new("_http._tcp.local.", name);
        r.server = "test.local.".to_string();
        r.port = 8080;
        r
    }

    #[test]
    fn test_digest_independent_of_order() {
        let a = test_record("a");
        let b = test_record("b");

        assert_eq!(compute_digest([&a, &b]), compute_digest([&b, &a]));
    }

    #[test]
    fn test_digest_changes_on_modification() {
        let a = test_record("a");
        let mut changed = a.clone();
        changed.set_property("path", "/v2");

        assert_ne!(compute_digest([&a]), compute_digest([&changed]));
    }

    #[test]
    fn test_digest_ignores_client_key() {
        let a = test_record("a");
        let mut mine = a.clone();
        mine.client_key = Some("local-1".to_string());

        assert_eq!(compute_digest([&a]), compute_digest([&mine]));
    }

    #[test]
    fn test_empty_registry_has_stable_digest() {
        let empty: [&Record; 0] = [];
        assert_eq!(compute_digest(empty), compute_digest(Vec::<&Record>::new()));
    }
}
