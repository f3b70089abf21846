use std::collections::HashMap;
use std::sync::Arc;
use shared::protocol::{Notification, RegistrationService};
use shared::types::Record;

/// Connection state towards the registration service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Successful result of a register/unregister request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Applied (or already in effect)
    Done,
    /// Queued until the next connection
    Deferred,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unknown client key: {0}")]
    Unknown(String),

    #[error("remote call failed: {0:#}")]
    Remote(anyhow::Error),
}

/// Client-level callbacks. Every method defaults to doing nothing.
pub trait Listener: Send + Sync {
    fn service_updated(&self, _record: &Record) {}
    fn service_removed(&self, _record: &Record) {}
    fn connected_to_service(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
enum PendingOp {
    Register(Record),
    Unregister,
}

enum Link<S> {
    Disconnected,
    Connecting,
    Connected(S),
}

/// Registration client that survives connection loss.
///
/// Requests made while not connected are kept, at most one per client key,
/// and replayed in first-request order by [`ZeroConfClient::on_connected`].
/// A request that cancels a pending one of the opposite kind removes it
/// instead of queueing both.
pub struct ZeroConfClient<S> {
    link: Link<S>,
    registered: HashMap<String, Record>,
    pending: Vec<(String, PendingOp)>,
    listeners: Vec<Arc<dyn Listener>>,
}

impl<S> Default for ZeroConfClient<S> {
    fn default() -> Self {
        Self {
            link: Link::Disconnected,
            registered: HashMap::new(),
            pending: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

impl<S: RegistrationService> ZeroConfClient<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        match self.link {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting => ConnectionState::Connecting,
            Link::Connected(_) => ConnectionState::Connected,
        }
    }

    /// A connection attempt is under way. Requests keep being deferred.
    pub fn connecting(&mut self) {
        if matches!(self.link, Link::Disconnected) {
            tracing::debug!("Connecting to service");
            self.link = Link::Connecting;
        }
    }

    pub fn is_registered(&self, client_key: &str) -> bool {
        self.registered.contains_key(client_key)
    }

    /// Client keys with a deferred request, in replay order
    pub fn pending_keys(&self) -> Vec<&str> {
        self.pending.iter().map(|(key, _)| key.as_str()).collect()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn Listener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Fan a notification from the service out to every listener.
    pub fn deliver(&self, notification: &Notification) {
        for listener in &self.listeners {
            match notification {
                Notification::Updated(record) => listener.service_updated(record),
                Notification::Removed(record) => listener.service_removed(record),
                Notification::Connected => listener.connected_to_service(),
            }
        }
    }

    fn queue(&mut self, client_key: &str, op: PendingOp) {
        match self.pending.iter_mut().find(|(key, _)| key == client_key) {
            Some((_, existing)) => *existing = op,
            None => self.pending.push((client_key.to_string(), op)),
        }
    }

    /// Drop the pending op for `client_key` if `cancels` matches it.
    fn cancel_pending(&mut self, client_key: &str, cancels: impl Fn(&PendingOp) -> bool) -> bool {
        let before = self.pending.len();
        self.pending.retain(|(key, op)| !(key == client_key && cancels(op)));
        self.pending.len() != before
    }

    /// Register `record` under `client_key`.
    ///
    /// Already registered keys succeed immediately. While connected the call
    /// goes straight to the service and its failure is returned, not queued.
    pub async fn register(&mut self, client_key: &str, mut record: Record) -> Result<Outcome, ClientError> {
        tracing::debug!("register name='{}', clientKey='{}', type='{}'", record.name, client_key, record.service_type);
        record.client_key = Some(client_key.to_string());

        if self.registered.contains_key(client_key) {
            if self.cancel_pending(client_key, |op| matches!(op, PendingOp::Unregister)) {
                tracing::debug!("Cancelled pending unregister of {}", client_key);
            }
            return Ok(Outcome::Done);
        }

        if let Link::Connected(service) = &self.link {
            service
                .register_service(&record)
                .await
                .map_err(ClientError::Remote)?;
            self.registered.insert(client_key.to_string(), record);
            return Ok(Outcome::Done);
        }

        tracing::debug!("Service is not connected, registering {} later", client_key);
        self.queue(client_key, PendingOp::Register(record));
        Ok(Outcome::Deferred)
    }

    /// Unregister the record registered under `client_key`.
    pub async fn unregister(&mut self, client_key: &str) -> Result<Outcome, ClientError> {
        tracing::debug!("unregister clientKey='{}'", client_key);

        let Some(record) = self.registered.get(client_key).cloned() else {
            if self.cancel_pending(client_key, |op| matches!(op, PendingOp::Register(_))) {
                tracing::debug!("Cancelled pending register of {}", client_key);
                return Ok(Outcome::Done);
            }
            return Err(ClientError::Unknown(client_key.to_string()));
        };

        if let Link::Connected(service) = &self.link {
            service
                .unregister_service(&record)
                .await
                .map_err(ClientError::Remote)?;
            self.registered.remove(client_key);
            return Ok(Outcome::Done);
        }

        tracing::debug!("Service is not connected, unregistering {} later", client_key);
        self.queue(client_key, PendingOp::Unregister);
        Ok(Outcome::Deferred)
    }

    /// The service is reachable again: replay every deferred request in
    /// order, then tell listeners. Failed replays are logged and dropped.
    pub async fn on_connected(&mut self, service: S) {
        tracing::info!("Connected to service, replaying {} requests", self.pending.len());

        for (client_key, op) in std::mem::take(&mut self.pending) {
            match op {
                PendingOp::Register(record) => match service.register_service(&record).await {
                    Ok(()) => {
                        tracing::debug!("Registered {}", client_key);
                        self.registered.insert(client_key, record);
                    }
                    Err(e) => tracing::error!("Replaying register of {} failed: {:#}", client_key, e),
                },
                PendingOp::Unregister => {
                    let Some(record) = self.registered.get(&client_key).cloned() else {
                        continue;
                    };
                    match service.unregister_service(&record).await {
                        Ok(()) => {
                            tracing::debug!("Unregistered {}", client_key);
                            self.registered.remove(&client_key);
                        }
                        Err(e) => tracing::error!("Replaying unregister of {} failed: {:#}", client_key, e),
                    }
                }
            }
        }

        self.link = Link::Connected(service);
        self.deliver(&Notification::Connected);
    }

    /// Registrations already confirmed stay recorded; nothing is re-queued.
    pub fn on_disconnected(&mut self) {
        tracing::info!("Disconnected from service");
        self.link = Link::Disconnected;
    }

    /// Withdraw every confirmed registration and disconnect. Returns how many
    /// were withdrawn.
    pub async fn shutdown(&mut self) -> usize {
        let mut withdrawn = 0;
        if let Link::Connected(service) = &self.link {
            let records: Vec<(String, Record)> = self.registered.drain().collect();
            for (client_key, record) in records {
                match service.unregister_service(&record).await {
                    Ok(()) => withdrawn += 1,
                    Err(e) => {
                        tracing::error!("Unregistering {} on shutdown failed: {:#}", client_key, e);
                        self.registered.insert(client_key, record);
                    }
                }
            }
        }
        self.pending.clear();
        self.on_disconnected();
        withdrawn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory service recording every call in order
    #[derive(Clone, Default)]
    struct FakeService {
        calls: Arc<Mutex<Vec<String>>>,
        failing: Arc<Mutex<HashSet<String>>>,
    }

    impl FakeService {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn fail_for(&self, name: &str) {
            self.failing.lock().unwrap().insert(name.to_string());
        }

        fn call(&self, verb: &str, record: &Record) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("{} {}", verb, record.name));
            if self.failing.lock().unwrap().contains(&record.name) {
                anyhow::bail!("service rejected {}", record.name);
            }
            Ok(())
        }
    }

    impl RegistrationService for FakeService {
        async fn register_service(&self, record: &Record) -> anyhow::Result<()> {
            self.call("register", record)
        }

        async fn unregister_service(&self, record: &Record) -> anyhow::Result<()> {
            self.call("unregister", record)
        }
    }

    #[derive(Default)]
    struct CountingListener {
        updated: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        connected: Mutex<usize>,
    }

    impl Listener for CountingListener {
        fn service_updated(&self, record: &Record) {
            self.updated.lock().unwrap().push(record.name.clone());
        }

        fn service_removed(&self, record: &Record) {
            self.removed.lock().unwrap().push(record.name.clone());
        }

        fn connected_to_service(&self) {
            *self.connected.lock().unwrap() += 1;
        }
    }

    fn record(name: &str) -> Record {
        Record::new("_http._tcp.local.", name)
    }

    #[tokio::test]
    async fn test_register_while_connected() {
        let service = FakeService::default();
        let mut client = ZeroConfClient::new();
        client.on_connected(service.clone()).await;

        assert_eq!(client.register("a", record("a")).await.unwrap(), Outcome::Done);
        assert!(client.is_registered("a"));

        // Idempotent, no second remote call
        assert_eq!(client.register("a", record("a")).await.unwrap(), Outcome::Done);
        assert_eq!(service.calls(), vec!["register a"]);
    }

    #[tokio::test]
    async fn test_connected_failure_is_reported_not_queued() {
        let service = FakeService::default();
        service.fail_for("a");
        let mut client = ZeroConfClient::new();
        client.on_connected(service.clone()).await;

        let err = client.register("a", record("a")).await.unwrap_err();
        assert!(matches!(err, ClientError::Remote(_)));
        assert!(!client.is_registered("a"));
        assert!(client.pending_keys().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_key() {
        let mut client: ZeroConfClient<FakeService> = ZeroConfClient::new();
        let err = client.unregister("ghost").await.unwrap_err();
        assert!(matches!(err, ClientError::Unknown(key) if key == "ghost"));
    }

    #[tokio::test]
    async fn test_register_then_unregister_while_disconnected_cancel() {
        let service = FakeService::default();
        let mut client = ZeroConfClient::new();

        assert_eq!(client.register("k", record("k")).await.unwrap(), Outcome::Deferred);
        assert_eq!(client.pending_keys(), vec!["k"]);
        assert_eq!(client.unregister("k").await.unwrap(), Outcome::Done);
        assert!(client.pending_keys().is_empty());

        client.on_connected(service.clone()).await;
        assert!(service.calls().is_empty());
        assert!(!client.is_registered("k"));
    }

    #[tokio::test]
    async fn test_reconnect_replays_in_request_order() {
        let service = FakeService::default();
        let mut client = ZeroConfClient::new();

        client.on_connected(service.clone()).await;
        client.register("b", record("b")).await.unwrap();
        client.on_disconnected();
        assert!(client.is_registered("b"), "Confirmed registrations survive disconnect");

        client.register("a", record("a")).await.unwrap();
        client.unregister("b").await.unwrap();
        client.register("c", record("c")).await.unwrap();
        assert_eq!(client.pending_keys(), vec!["a", "b", "c"]);

        client.connecting();
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(client.register("d", record("d")).await.unwrap(), Outcome::Deferred);

        client.on_connected(service.clone()).await;
        assert_eq!(
            service.calls(),
            vec!["register b", "register a", "unregister b", "register c", "register d"]
        );
        assert!(client.is_registered("a"));
        assert!(!client.is_registered("b"));
        assert!(client.is_registered("c"));
        assert!(client.pending_keys().is_empty());
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_replay_failure_continues_and_is_not_retried() {
        let service = FakeService::default();
        service.fail_for("bad");
        let mut client = ZeroConfClient::new();

        client.register("bad", record("bad")).await.unwrap();
        client.register("good", record("good")).await.unwrap();
        client.on_connected(service.clone()).await;

        assert_eq!(service.calls(), vec!["register bad", "register good"]);
        assert!(!client.is_registered("bad"));
        assert!(client.is_registered("good"));
        assert!(client.pending_keys().is_empty());

        client.on_disconnected();
        client.on_connected(service.clone()).await;
        assert_eq!(service.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_register_cancels_pending_unregister_of_confirmed_key() {
        let service = FakeService::default();
        let mut client = ZeroConfClient::new();
        client.on_connected(service.clone()).await;
        client.register("k", record("k")).await.unwrap();
        client.on_disconnected();

        assert_eq!(client.unregister("k").await.unwrap(), Outcome::Deferred);
        assert_eq!(client.register("k", record("k")).await.unwrap(), Outcome::Done);
        assert!(client.pending_keys().is_empty());

        client.on_connected(service.clone()).await;
        assert_eq!(service.calls(), vec!["register k"]);
        assert!(client.is_registered("k"));
    }

    #[tokio::test]
    async fn test_later_register_replaces_pending_record_in_place() {
        let service = FakeService::default();
        let mut client = ZeroConfClient::new();

        client.register("x", record("first")).await.unwrap();
        client.register("y", record("y")).await.unwrap();
        client.register("x", record("second")).await.unwrap();
        assert_eq!(client.pending_keys(), vec!["x", "y"]);

        client.on_connected(service.clone()).await;
        assert_eq!(service.calls(), vec!["register second", "register y"]);
    }

    #[tokio::test]
    async fn test_listeners_receive_notifications() {
        let service = FakeService::default();
        let mut client = ZeroConfClient::new();
        let listener = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn Listener> = listener.clone();
        client.add_listener(as_dyn.clone());

        client.on_connected(service).await;
        client.deliver(&Notification::Updated(record("web")));
        client.deliver(&Notification::Removed(record("web")));

        assert_eq!(*listener.connected.lock().unwrap(), 1);
        assert_eq!(*listener.updated.lock().unwrap(), vec!["web"]);
        assert_eq!(*listener.removed.lock().unwrap(), vec!["web"]);

        client.remove_listener(&as_dyn);
        client.deliver(&Notification::Updated(record("other")));
        assert_eq!(listener.updated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_withdraws_registrations() {
        let service = FakeService::default();
        let mut client = ZeroConfClient::new();
        client.on_connected(service.clone()).await;
        client.register("a", record("a")).await.unwrap();

        assert_eq!(client.shutdown().await, 1);
        assert!(!client.is_registered("a"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(service.calls(), vec!["register a", "unregister a"]);
    }
}
