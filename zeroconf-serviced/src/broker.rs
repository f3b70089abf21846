use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;
use shared::protocol::Notification;
use shared::types::Record;
use crate::registry::{Diff, Registry};

/// Opaque identity of one subscriber connection
pub type SubscriberId = u64;

/// Point-in-time records handed back by a new subscription
pub type Replay = Vec<Record>;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber queue is full")]
    Backpressure,

    #[error("subscriber is unreachable")]
    Unreachable,
}

/// Receiving end of broker notifications. Calls must not block.
pub trait Subscriber: Send {
    fn on_updated(&self, record: &Record) -> Result<(), DeliveryError>;
    fn on_removed(&self, record: &Record) -> Result<(), DeliveryError>;
}

/// Non-blocking handoff into a bounded per-connection queue.
impl Subscriber for mpsc::Sender<Notification> {
    fn on_updated(&self, record: &Record) -> Result<(), DeliveryError> {
        hand_off(self, Notification::Updated(record.clone()))
    }

    fn on_removed(&self, record: &Record) -> Result<(), DeliveryError> {
        hand_off(self, Notification::Removed(record.clone()))
    }
}

fn hand_off(tx: &mpsc::Sender<Notification>, notification: Notification) -> Result<(), DeliveryError> {
    tx.try_send(notification).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
        mpsc::error::TrySendError::Closed(_) => DeliveryError::Unreachable,
    })
}

struct Connection {
    sink: Box<dyn Subscriber>,
    all_types: bool,
    types: HashSet<String>,
}

impl Connection {
    fn wants(&self, service_type: &str) -> bool {
        self.all_types || self.types.contains(service_type)
    }
}

/// Tracks who cares about which types and routes registry diffs to them.
#[derive(Default)]
pub struct Broker {
    next_id: SubscriberId,
    connections: BTreeMap<SubscriberId, Connection>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, sink: Box<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                sink,
                all_types: false,
                types: HashSet::new(),
            },
        );
        tracing::debug!(subscriber = id, "Subscriber attached, {} connected", self.len());
        id
    }

    /// Drop every subscription of `id`. Safe to repeat.
    pub fn detach(&mut self, id: SubscriberId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = id, "Subscriber detached");
        }
        removed
    }

    /// Subscribe to every type. A new subscription returns the replay: every
    /// known record, oldest first, as of this point in the event order. The
    /// caller writes it out ahead of anything later dispatched to the sink.
    pub fn subscribe_all(&mut self, id: SubscriberId, registry: &Registry) -> Option<Replay> {
        let Some(conn) = self.connections.get_mut(&id) else {
            tracing::warn!(subscriber = id, "subscribe_all for unknown subscriber");
            return None;
        };
        if conn.all_types {
            return None;
        }
        conn.all_types = true;
        tracing::debug!(subscriber = id, "subscribe_all, replaying {} records", registry.len());
        Some(registry.records().cloned().collect())
    }

    pub fn unsubscribe_all(&mut self, id: SubscriberId) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) if conn.all_types => {
                conn.all_types = false;
                tracing::debug!(subscriber = id, "unsubscribe_all");
                true
            }
            _ => false,
        }
    }

    /// Subscribe to one type. A new subscription returns that type's records
    /// as the replay, same as [`Broker::subscribe_all`].
    pub fn subscribe_type(&mut self, id: SubscriberId, service_type: &str, registry: &Registry) -> Option<Replay> {
        let Some(conn) = self.connections.get_mut(&id) else {
            tracing::warn!(subscriber = id, "subscribe_type for unknown subscriber");
            return None;
        };
        if !conn.types.insert(service_type.to_string()) {
            return None;
        }
        tracing::debug!(subscriber = id, "subscribe_type({})", service_type);
        Some(registry.records_of_type(service_type).cloned().collect())
    }

    pub fn unsubscribe_type(&mut self, id: SubscriberId, service_type: &str) -> bool {
        let removed = self
            .connections
            .get_mut(&id)
            .is_some_and(|conn| conn.types.remove(service_type));
        if removed {
            tracing::debug!(subscriber = id, "unsubscribe_type({})", service_type);
        }
        removed
    }

    /// Route one diff. Returns how many subscribers were targeted.
    pub fn dispatch(&self, diff: &Diff) -> usize {
        let (record, kind) = match diff {
            Diff::TypeAdded(_) => return 0,
            Diff::Added(record) | Diff::Updated { new: record, .. } => (record, Kind::Updated),
            Diff::Removed(record) => (record, Kind::Removed),
        };

        let mut targeted = 0;
        for (id, conn) in &self.connections {
            if conn.wants(&record.service_type) {
                deliver(*id, conn.sink.as_ref(), record, kind);
                targeted += 1;
            }
        }
        targeted
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Updated,
    Removed,
}

/// Failures are logged and skipped; they never affect other subscribers.
fn deliver(id: SubscriberId, sink: &dyn Subscriber, record: &Record, kind: Kind) {
    let result = match kind {
        Kind::Updated => sink.on_updated(record),
        Kind::Removed => sink.on_removed(record),
    };
    if let Err(e) = result {
        tracing::warn!(subscriber = id, key = %record.key, "Delivery failed: {}", e);
    }
}
