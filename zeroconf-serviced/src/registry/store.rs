use std::collections::{BTreeMap, HashMap};
use chrono::{DateTime, Utc};
use shared::types::{Record, ServiceEntry};

/// A single change produced by the registry for the broker to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// A type bucket was created
    TypeAdded(String),
    Added(Record),
    Updated { old: Record, new: Record },
    /// Carries the last known value of the record
    Removed(Record),
}

struct Entry {
    record: Record,
    seq: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Entry {
    fn to_service_entry(&self) -> ServiceEntry {
        ServiceEntry {
            record: self.record.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// Canonical set of currently known records, indexed by key and by type.
///
/// Every record gets a sequence number when its key is first inserted; all
/// iteration is oldest-first by that number. Updates keep the original
/// position.
#[derive(Default)]
pub struct Registry {
    next_seq: u64,
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    /// type -> seq -> key
    buckets: BTreeMap<String, BTreeMap<u64, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bucket for an unseen type.
    pub fn apply_type_discovered(&mut self, service_type: &str) -> Option<Diff> {
        if self.buckets.contains_key(service_type) {
            return None;
        }
        self.buckets.insert(service_type.to_string(), BTreeMap::new());
        Some(Diff::TypeAdded(service_type.to_string()))
    }

    pub fn apply_instance_added(&mut self, record: Record) -> Vec<Diff> {
        self.upsert(record)
    }

    pub fn apply_instance_updated(&mut self, record: Record) -> Vec<Diff> {
        self.upsert(record)
    }

    /// Insert or replace by key. A key that moved to another type is removed
    /// from its old bucket and added to the new one.
    fn upsert(&mut self, record: Record) -> Vec<Diff> {
        let mut diffs = Vec::new();
        diffs.extend(self.apply_type_discovered(&record.service_type));

        let now = Utc::now();
        let migrated = self
            .entries
            .get(&record.key)
            .is_some_and(|e| e.record.service_type != record.service_type);
        if migrated {
            diffs.extend(self.apply_instance_removed(&record.key));
        }

        match self.entries.get_mut(&record.key) {
            Some(entry) => {
                let old = std::mem::replace(&mut entry.record, record.clone());
                entry.last_seen = now;
                diffs.push(Diff::Updated { old, new: record });
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.order.insert(seq, record.key.clone());
                self.buckets
                    .entry(record.service_type.clone())
                    .or_default()
                    .insert(seq, record.key.clone());
                self.entries.insert(
                    record.key.clone(),
                    Entry {
                        record: record.clone(),
                        seq,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                diffs.push(Diff::Added(record));
            }
        }

        diffs
    }

    /// Remove by key. Unknown keys are a no-op.
    pub fn apply_instance_removed(&mut self, key: &str) -> Option<Diff> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        if let Some(bucket) = self.buckets.get_mut(&entry.record.service_type) {
            bucket.remove(&entry.seq);
        }
        Some(Diff::Removed(entry.record))
    }

    /// Drop everything, yielding one removal per record, oldest first.
    pub fn clear_all(&mut self) -> Vec<Diff> {
        let order = std::mem::take(&mut self.order);
        let diffs = order
            .into_values()
            .filter_map(|key| self.entries.remove(&key))
            .map(|entry| Diff::Removed(entry.record))
            .collect();

        self.entries.clear();
        self.buckets.clear();
        diffs
    }

    pub fn lookup(&self, key: &str) -> Option<&Record> {
        self.entries.get(key).map(|e| &e.record)
    }

    /// All records, oldest first
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .map(|e| &e.record)
    }

    /// Records of one type, oldest first
    pub fn records_of_type<'a>(&'a self, service_type: &str) -> impl Iterator<Item = &'a Record> {
        self.buckets
            .get(service_type)
            .into_iter()
            .flat_map(|bucket| bucket.values())
            .filter_map(|key| self.entries.get(key))
            .map(|e| &e.record)
    }

    pub fn types(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<ServiceEntry> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .map(Entry::to_service_entry)
            .collect()
    }

    pub fn entries_of_type(&self, service_type: &str) -> Vec<ServiceEntry> {
        self.buckets
            .get(service_type)
            .into_iter()
            .flat_map(|bucket| bucket.values())
            .filter_map(|key| self.entries.get(key))
            .map(Entry::to_service_entry)
            .collect()
    }

    pub fn entry(&self, key: &str) -> Option<ServiceEntry> {
        self.entries.get(key).map(Entry::to_service_entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
