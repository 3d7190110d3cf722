//! Locally stored records.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A value stored at this node.
pub struct StoredRecord {
    pub key: Id,
    pub value: Bytes,
    pub published_at: Instant,
    pub expires_at: Instant,
    pub last_republished_at: Instant,
    /// This node published the record itself with [crate::Dht::set].
    pub original: bool,
}

impl StoredRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Time left before this record expires.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Default)]
/// Records by key, every key guarded by its own lock.
pub struct Store {
    records: DashMap<Id, StoredRecord>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record received in a `STORE` request.
    ///
    /// Records this node published itself stay marked as original.
    pub fn insert(&self, key: Id, value: Bytes, ttl: Duration) {
        let now = Instant::now();

        self.records
            .entry(key.clone())
            .and_modify(|record| {
                record.value = value.clone();
                record.last_republished_at = now;

                if !record.original {
                    record.published_at = now;
                    record.expires_at = now + ttl;
                }
            })
            .or_insert_with(|| StoredRecord {
                key,
                value,
                published_at: now,
                expires_at: now + ttl,
                last_republished_at: now,
                original: false,
            });
    }

    /// Insert or refresh a record this node publishes itself.
    pub fn publish(&self, key: Id, value: Bytes, expire: Duration) {
        let now = Instant::now();

        self.records.insert(
            key.clone(),
            StoredRecord {
                key,
                value,
                published_at: now,
                expires_at: now + expire,
                last_republished_at: now,
                original: true,
            },
        );
    }

    /// Returns the record for `key` unless it expired.
    pub fn get(&self, key: &Id) -> Option<StoredRecord> {
        self.records
            .get(key)
            .filter(|record| !record.is_expired(Instant::now()))
            .map(|record| record.value().clone())
    }

    /// Snapshot of all records that did not expire yet.
    pub fn records(&self) -> Vec<StoredRecord> {
        let now = Instant::now();

        self.records
            .iter()
            .filter(|record| !record.is_expired(now))
            .map(|record| record.value().clone())
            .collect()
    }

    /// Snapshot of the records this node published itself.
    pub fn originals(&self) -> Vec<StoredRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.original)
            .collect()
    }

    pub fn mark_republished(&self, key: &Id, at: Instant) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.last_republished_at = at;
        }
    }

    /// Delete every record that expired by `now`, returns how many were deleted.
    pub fn remove_expired(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));

        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_and_get() {
        let store = Store::new();
        let key = Id::random(160);

        store.insert(key.clone(), Bytes::from_static(b"a"), Duration::from_secs(60));
        store.insert(key.clone(), Bytes::from_static(b"b"), Duration::from_secs(60));

        let record = store.get(&key).unwrap();

        assert_eq!(record.value, Bytes::from_static(b"b"));
        assert!(!record.original);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expired_records_are_invisible_then_removed() {
        let store = Store::new();
        let key = Id::random(160);

        store.insert(key.clone(), Bytes::from_static(b"a"), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        assert!(store.get(&key).is_none());
        assert!(store.records().is_empty());
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove_expired(Instant::now()), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn original_survives_inbound_store() {
        let store = Store::new();
        let key = Id::random(160);

        store.publish(key.clone(), Bytes::from_static(b"a"), Duration::from_secs(3600));
        let expires_at = store.get(&key).unwrap().expires_at;

        store.insert(key.clone(), Bytes::from_static(b"a"), Duration::from_secs(1));

        let record = store.get(&key).unwrap();
        assert!(record.original);
        assert_eq!(record.expires_at, expires_at);
        assert_eq!(store.originals().len(), 1);
    }

    #[test]
    fn remaining() {
        let store = Store::new();
        let key = Id::random(160);

        store.insert(key.clone(), Bytes::new(), Duration::from_secs(60));

        let record = store.get(&key).unwrap();
        let now = Instant::now();

        assert!(record.remaining(now) <= Duration::from_secs(60));
        assert!(record.remaining(now) > Duration::from_secs(59));
        assert_eq!(record.remaining(record.expires_at + Duration::from_secs(1)), Duration::ZERO);
    }
}
