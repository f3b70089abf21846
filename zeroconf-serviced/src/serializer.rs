use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use anyhow::{anyhow, Result};
use shared::types::ServiceEntry;
use crate::broker::{Broker, Replay, Subscriber, SubscriberId};
use crate::mdns::{Resolver, TransportEvent};
use crate::registry::{hash, Diff, Registry};

const QUEUE_DEPTH: usize = 1024;

/// Commands consumed, strictly in arrival order, by the serializer thread
pub enum Command {
    Event(TransportEvent),
    ClearAll(oneshot::Sender<usize>),
    Attach(Box<dyn Subscriber>, oneshot::Sender<SubscriberId>),
    Detach(SubscriberId),
    SubscribeAll(SubscriberId, oneshot::Sender<Option<Replay>>),
    UnsubscribeAll(SubscriberId, oneshot::Sender<bool>),
    SubscribeType(SubscriberId, String, oneshot::Sender<Option<Replay>>),
    UnsubscribeType(SubscriberId, String, oneshot::Sender<bool>),
    GetAll(oneshot::Sender<Vec<ServiceEntry>>),
    GetByType(String, oneshot::Sender<Vec<ServiceEntry>>),
    GetOne(String, oneshot::Sender<Option<ServiceEntry>>),
    GetTypes(oneshot::Sender<Vec<String>>),
    #[cfg(test)]
    CountSubscribers(oneshot::Sender<usize>),
    Shutdown,
}

/// Sole owner of the registry and the broker.
struct Serializer {
    registry: Registry,
    broker: Broker,
    resolver: Arc<dyn Resolver>,
    digest_tx: watch::Sender<String>,
}

impl Serializer {
    fn apply(&mut self, event: TransportEvent) {
        let diffs = match event {
            TransportEvent::TypeDiscovered(service_type) => {
                self.registry.apply_type_discovered(&service_type).into_iter().collect()
            }
            TransportEvent::InstanceAdded(record) => {
                tracing::debug!("Instance added: {}", record.key);
                self.registry.apply_instance_added(record)
            }
            TransportEvent::InstanceUpdated(record) => {
                tracing::debug!("Instance updated: {}", record.key);
                self.registry.apply_instance_updated(record)
            }
            TransportEvent::InstanceRemoved(key) => {
                match self.registry.lookup(&key) {
                    Some(record) => tracing::debug!("Instance removed: {} ({})", key, record.name),
                    None => tracing::debug!("Ignoring removal of unknown instance {}", key),
                }
                self.registry.apply_instance_removed(&key).into_iter().collect()
            }
        };
        self.dispatch(&diffs);
    }

    fn clear_all(&mut self) -> usize {
        if !self.registry.is_empty() {
            tracing::info!("Removing all {} services", self.registry.len());
        }
        let diffs = self.registry.clear_all();
        self.dispatch(&diffs);
        diffs.len()
    }

    /// A type someone subscribes to is known from then on, even with no
    /// instances yet.
    fn subscribe_type(&mut self, id: SubscriberId, service_type: &str) -> Option<Replay> {
        let diffs: Vec<Diff> = self.registry.apply_type_discovered(service_type).into_iter().collect();
        self.dispatch(&diffs);
        self.broker.subscribe_type(id, service_type, &self.registry)
    }

    fn dispatch(&mut self, diffs: &[Diff]) {
        let mut changed = false;
        for diff in diffs {
            match diff {
                Diff::TypeAdded(service_type) => {
                    tracing::info!("Discovered service type: {}", service_type);
                }
                Diff::Added(record) if !record.is_resolved() => {
                    self.resolver.request_resolve(&record.service_type, &record.name);
                    changed = true;
                }
                _ => changed = true,
            }
            self.broker.dispatch(diff);
        }
        if changed {
            let digest = hash::compute_digest(self.registry.records());
            let _ = self.digest_tx.send(digest);
        }
    }
}

/// Handle to the serializer thread. Cheap to clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    /// Spawn the serializer thread with an empty registry
    pub fn spawn(resolver: Arc<dyn Resolver>, digest_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(QUEUE_DEPTH);

        let mut core = Serializer {
            registry: Registry::new(),
            broker: Broker::new(),
            resolver,
            digest_tx,
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    Command::Event(event) => core.apply(event),
                    Command::ClearAll(reply) => {
                        let _ = reply.send(core.clear_all());
                    }
                    Command::Attach(sink, reply) => {
                        let _ = reply.send(core.broker.attach(sink));
                    }
                    Command::Detach(id) => {
                        core.broker.detach(id);
                    }
                    Command::SubscribeAll(id, reply) => {
                        let _ = reply.send(core.broker.subscribe_all(id, &core.registry));
                    }
                    Command::UnsubscribeAll(id, reply) => {
                        let _ = reply.send(core.broker.unsubscribe_all(id));
                    }
                    Command::SubscribeType(id, service_type, reply) => {
                        let _ = reply.send(core.subscribe_type(id, &service_type));
                    }
                    Command::UnsubscribeType(id, service_type, reply) => {
                        let _ = reply.send(core.broker.unsubscribe_type(id, &service_type));
                    }
                    Command::GetAll(reply) => {
                        let _ = reply.send(core.registry.entries());
                    }
                    Command::GetByType(service_type, reply) => {
                        let _ = reply.send(core.registry.entries_of_type(&service_type));
                    }
                    Command::GetOne(key, reply) => {
                        let _ = reply.send(core.registry.entry(&key));
                    }
                    Command::GetTypes(reply) => {
                        let _ = reply.send(core.registry.types());
                    }
                    #[cfg(test)]
                    Command::CountSubscribers(reply) => {
                        let _ = reply.send(core.broker.len());
                    }
                    Command::Shutdown => {
                        tracing::info!("Serializer thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("serializer thread has stopped"))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        Ok(rx.await?)
    }

    /// Enqueue a transport event and return without waiting for it to apply
    pub async fn submit(&self, event: TransportEvent) -> Result<()> {
        self.send(Command::Event(event)).await
    }

    /// Remove every record. Resolves once all removals have been dispatched.
    pub async fn clear_all(&self) -> Result<usize> {
        self.request(Command::ClearAll).await
    }

    pub async fn attach(&self, sink: Box<dyn Subscriber>) -> Result<SubscriberId> {
        self.request(|reply| Command::Attach(sink, reply)).await
    }

    pub async fn detach(&self, id: SubscriberId) -> Result<()> {
        self.send(Command::Detach(id)).await
    }

    /// Returns the replay if newly subscribed. Live notifications reach the
    /// sink only for events ordered after that snapshot.
    pub async fn subscribe_all(&self, id: SubscriberId) -> Result<Option<Replay>> {
        self.request(|reply| Command::SubscribeAll(id, reply)).await
    }

    pub async fn unsubscribe_all(&self, id: SubscriberId) -> Result<bool> {
        self.request(|reply| Command::UnsubscribeAll(id, reply)).await
    }

    pub async fn subscribe_type(&self, id: SubscriberId, service_type: String) -> Result<Option<Replay>> {
        self.request(|reply| Command::SubscribeType(id, service_type, reply)).await
    }

    pub async fn unsubscribe_type(&self, id: SubscriberId, service_type: String) -> Result<bool> {
        self.request(|reply| Command::UnsubscribeType(id, service_type, reply)).await
    }

    pub async fn get_all(&self) -> Result<Vec<ServiceEntry>> {
        self.request(Command::GetAll).await
    }

    pub async fn get_by_type(&self, service_type: String) -> Result<Vec<ServiceEntry>> {
        self.request(|reply| Command::GetByType(service_type, reply)).await
    }

    pub async fn get_one(&self, key: String) -> Result<Option<ServiceEntry>> {
        self.request(|reply| Command::GetOne(key, reply)).await
    }

    pub async fn get_types(&self) -> Result<Vec<String>> {
        self.request(Command::GetTypes).await
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> Result<usize> {
        self.request(Command::CountSubscribers).await
    }

    /// Stop the serializer thread
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}
