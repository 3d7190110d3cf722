//! Kademlia routing table

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::common::{Contact, Id};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug)]
/// Kademlia routing table: one [KBucket] per common prefix length with the owner [Id].
///
/// Every bucket sits behind its own lock, so concurrent sightings only
/// contend when they land in the same bucket.
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: Box<[Mutex<KBucket>]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of [RoutingTable::record_sighting].
pub enum Sighting {
    /// The contact is the owner of the table.
    OwnId,
    /// The contact was already known and is now the most recently seen.
    Refreshed,
    /// The contact was added to a bucket with spare capacity.
    Inserted,
    /// The bucket is full, `least_recently_seen` should be probed; if it
    /// fails to respond, evict it in favor of the new contact with
    /// [RoutingTable::evict_and_insert].
    BucketFull { least_recently_seen: Contact },
}

impl RoutingTable {
    /// Create a new [RoutingTable] owned by `id`, with buckets of capacity `k`.
    pub fn new(id: Id, k: usize) -> Self {
        let buckets = (0..id.bits())
            .map(|_| Mutex::new(KBucket::new(k)))
            .collect();

        RoutingTable { id, k, buckets }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Capacity of each bucket.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of buckets, equal to the width of the owner's [Id] in bits.
    pub fn buckets_count(&self) -> usize {
        self.buckets.len()
    }

    /// Index of the bucket `id` belongs to, or `None` for the owner's own id.
    pub fn bucket_index(&self, id: &Id) -> Option<usize> {
        let prefix_len = self.id.common_prefix_len(id);

        if prefix_len == self.buckets.len() {
            None
        } else {
            Some(prefix_len)
        }
    }

    // === Public Methods ===

    /// Record that `contact` was seen, either as a sender or in a response.
    pub fn record_sighting(&self, contact: Contact) -> Sighting {
        let Some(index) = self.bucket_index(contact.id()) else {
            return Sighting::OwnId;
        };

        match self.bucket(index).upsert(contact) {
            Upsert::Refreshed => Sighting::Refreshed,
            Upsert::Inserted => Sighting::Inserted,
            Upsert::Full {
                least_recently_seen,
            } => Sighting::BucketFull {
                least_recently_seen,
            },
        }
    }

    /// Remove a contact from this routing table. Returns `true` if it was present.
    pub fn remove(&self, id: &Id) -> bool {
        match self.bucket_index(id) {
            Some(index) => self.bucket(index).remove(id).is_some(),
            None => false,
        }
    }

    /// Evict `stale` (if still present) and insert `contact` in its place.
    ///
    /// Returns `true` if `contact` ended up in the table.
    pub fn evict_and_insert(&self, stale: &Id, contact: Contact) -> bool {
        let Some(index) = self.bucket_index(contact.id()) else {
            return false;
        };

        let mut bucket = self.bucket(index);
        bucket.remove(stale);

        !matches!(bucket.upsert(contact), Upsert::Full { .. })
    }

    /// Count a failed request to `id`. Once a contact fails
    /// `max_failed_requests` times in a row it is removed.
    ///
    /// Returns `true` if the contact was evicted.
    pub fn record_failure(&self, id: &Id, max_failed_requests: u8) -> bool {
        match self.bucket_index(id) {
            Some(index) => self.bucket(index).record_failure(id, max_failed_requests),
            None => false,
        }
    }

    /// Mark the bucket covering `target` as recently used.
    pub fn touch(&self, target: &Id) {
        if let Some(index) = self.bucket_index(target) {
            self.bucket(index).touch();
        }
    }

    /// Returns up to `n` contacts sorted by ascending distance to `target`.
    ///
    /// Starts at the bucket covering `target` and expands outward, one tier of
    /// equally distant buckets at a time, until `n` contacts are collected or
    /// the table is exhausted.
    pub fn closest_contacts(&self, target: &Id, n: usize) -> Vec<Contact> {
        let mut contacts = Vec::with_capacity(n);

        if n == 0 {
            return contacts;
        }

        let start = self
            .bucket_index(target)
            .unwrap_or(self.buckets.len());

        if start < self.buckets.len() {
            // Closer to the target than any other bucket's contacts.
            contacts.extend(self.bucket(start).closest(target, n));

            if contacts.len() < n {
                // Contacts deeper than the target's bucket all share exactly
                // `start` bits with the target.
                for index in start + 1..self.buckets.len() {
                    contacts.extend(self.bucket(index).contacts());
                }
            }
        }

        for index in (0..start).rev() {
            if contacts.len() >= n {
                break;
            }

            contacts.extend(self.bucket(index).contacts());
        }

        contacts.sort_by(|a, b| target.cmp_distance(a.id(), b.id()));
        contacts.truncate(n);

        contacts
    }

    /// Indices of buckets not modified for at least `older_than`.
    ///
    /// Buckets deeper than the deepest non empty bucket are skipped, nothing
    /// can be found there that a refresh of a shallower bucket would not find.
    pub fn stale_buckets(&self, older_than: Duration) -> Vec<usize> {
        let Some(deepest) = (0..self.buckets.len())
            .rev()
            .find(|index| !self.bucket(*index).is_empty())
        else {
            return vec![];
        };

        (0..=deepest)
            .filter(|index| self.bucket(*index).last_modified().elapsed() >= older_than)
            .collect()
    }

    /// Mark the bucket at `index` as refreshed.
    pub fn touch_bucket(&self, index: usize) {
        if let Some(bucket) = self.buckets.get(index) {
            lock(bucket).touch();
        }
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| lock(bucket).is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| lock(bucket).len()).sum()
    }

    /// Export an owned vector of all contacts in this routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| lock(bucket).contacts())
            .collect()
    }

    /// Returns `true` if a contact with this `id` is in the table.
    pub fn contains(&self, id: &Id) -> bool {
        match self.bucket_index(id) {
            Some(index) => self.bucket(index).contains(id),
            None => false,
        }
    }

    /// Turn this routing table to a list of bootstrapping addresses.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.contacts()
            .iter()
            .map(|contact| contact.address().to_string())
            .collect()
    }

    // === Private Methods ===

    fn bucket(&self, index: usize) -> MutexGuard<'_, KBucket> {
        lock(&self.buckets[index])
    }
}

fn lock(bucket: &Mutex<KBucket>) -> MutexGuard<'_, KBucket> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct Entry {
    contact: Contact,
    failures: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of [KBucket::upsert].
pub enum Upsert {
    Refreshed,
    Inserted,
    Full { least_recently_seen: Contact },
}

#[derive(Debug, Clone)]
/// Contacts sharing a common prefix length with the owner, least recently seen first.
pub struct KBucket {
    entries: Vec<Entry>,
    capacity: usize,
    last_modified: Instant,
}

impl KBucket {
    pub fn new(capacity: usize) -> Self {
        KBucket {
            entries: Vec::with_capacity(capacity),
            capacity,
            last_modified: Instant::now(),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn last_modified(&self) -> Instant {
        self.last_modified
    }

    /// Contacts from least recently seen to most recently seen.
    pub fn contacts(&self) -> Vec<Contact> {
        self.entries
            .iter()
            .map(|entry| entry.contact.clone())
            .collect()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    // === Public Methods ===

    /// Move a known contact to the most recently seen position (updating its
    /// address), append a new contact if there is room, or report the least
    /// recently seen contact as a ping candidate if the bucket is full.
    pub fn upsert(&mut self, contact: Contact) -> Upsert {
        if let Some(index) = self.position(contact.id()) {
            self.entries.remove(index);
            self.entries.push(Entry {
                contact,
                failures: 0,
            });
            self.touch();

            return Upsert::Refreshed;
        }

        if self.is_full() {
            return Upsert::Full {
                least_recently_seen: self.entries[0].contact.clone(),
            };
        }

        self.entries.push(Entry {
            contact,
            failures: 0,
        });
        self.touch();

        Upsert::Inserted
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.position(id)?;
        self.touch();

        Some(self.entries.remove(index).contact)
    }

    /// Up to `n` contacts sorted by ascending distance to `target`.
    pub fn closest(&self, target: &Id, n: usize) -> Vec<Contact> {
        let mut contacts = self.contacts();

        contacts.sort_by(|a, b| target.cmp_distance(a.id(), b.id()));
        contacts.truncate(n);

        contacts
    }

    /// Returns `true` if the contact reached `max_failed_requests` and was removed.
    pub fn record_failure(&mut self, id: &Id, max_failed_requests: u8) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };

        let entry = &mut self.entries[index];
        entry.failures = entry.failures.saturating_add(1);

        if entry.failures >= max_failed_requests {
            self.entries.remove(index);
            self.touch();

            return true;
        }

        false
    }

    pub fn touch(&mut self) {
        self.last_modified = Instant::now();
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.contact.id() == id)
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use super::*;

    fn address(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let mut bucket = KBucket::new(3);

        for port in 0..3 {
            assert_eq!(
                bucket.upsert(Contact::random(160, address(port))),
                Upsert::Inserted
            );
        }

        let first = bucket.contacts()[0].clone();

        let upsert = bucket.upsert(Contact::random(160, address(4)));

        assert_eq!(
            upsert,
            Upsert::Full {
                least_recently_seen: first
            }
        );
        assert_eq!(bucket.len(), 3);
    }

    #[test]
    fn duplicates_update_recency_and_address() {
        let mut bucket = KBucket::new(3);

        let a = Contact::random(160, address(1));
        let b = Contact::random(160, address(2));

        bucket.upsert(a.clone());
        bucket.upsert(b.clone());

        let moved = Contact::new(a.id().clone(), address(3));
        assert_eq!(bucket.upsert(moved.clone()), Upsert::Refreshed);

        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.contacts(), vec![b, moved]);
    }

    #[test]
    fn failures_evict_after_threshold() {
        let mut bucket = KBucket::new(3);
        let contact = Contact::random(160, address(1));

        bucket.upsert(contact.clone());

        assert!(!bucket.record_failure(contact.id(), 2));
        // A response resets the count.
        bucket.upsert(contact.clone());
        assert!(!bucket.record_failure(contact.id(), 2));
        assert!(bucket.record_failure(contact.id(), 2));
        assert!(bucket.is_empty());
    }

    #[test]
    fn ignore_own_id() {
        let table = RoutingTable::new(Id::random(160), 20);

        let own = Contact::new(table.id().clone(), address(1));

        assert_eq!(table.record_sighting(own), Sighting::OwnId);
        assert!(table.is_empty());
    }

    #[test]
    fn contact_in_one_bucket() {
        let table = RoutingTable::new(Id::random(160), 20);

        for prefix_len in [0, 1, 50, 159] {
            let contact = Contact::new(table.id().random_at_prefix(prefix_len), address(1));

            assert_eq!(table.record_sighting(contact.clone()), Sighting::Inserted);
            assert_eq!(table.record_sighting(contact.clone()), Sighting::Refreshed);
            assert_eq!(table.bucket_index(contact.id()), Some(prefix_len));
            assert!(table.contains(contact.id()));
        }

        assert_eq!(table.size(), 4);
    }

    #[test]
    fn full_bucket_then_evict_and_insert() {
        let table = RoutingTable::new(Id::random(160), 2);

        let a = Contact::new(table.id().random_at_prefix(0), address(1));
        let b = Contact::new(table.id().random_at_prefix(0), address(2));
        let c = Contact::new(table.id().random_at_prefix(0), address(3));

        table.record_sighting(a.clone());
        table.record_sighting(b.clone());

        assert_eq!(
            table.record_sighting(c.clone()),
            Sighting::BucketFull {
                least_recently_seen: a.clone()
            }
        );

        assert!(table.evict_and_insert(a.id(), c.clone()));
        assert!(!table.contains(a.id()));
        assert!(table.contains(c.id()));
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn closest_contacts_sorted_and_bounded() {
        let table = RoutingTable::new(Id::random(160), 20);

        for port in 0..200 {
            table.record_sighting(Contact::random(160, address(port)));
        }

        let size = table.size();

        for _ in 0..10 {
            let target = Id::random(160);
            let closest = table.closest_contacts(&target, 20);

            assert_eq!(closest.len(), 20.min(size));

            for pair in closest.windows(2) {
                assert!(pair[0].id().xor(&target) <= pair[1].id().xor(&target));
            }

            // Same result as sorting the whole table.
            let mut all = table.contacts();
            all.sort_by(|a, b| target.cmp_distance(a.id(), b.id()));
            all.truncate(20);

            assert_eq!(closest, all);
        }

        assert_eq!(table.closest_contacts(&Id::random(160), size + 10).len(), size);
        assert!(table.closest_contacts(&Id::random(160), 0).is_empty());
    }

    #[test]
    fn bucket_closest_sorted_and_bounded() {
        let mut bucket = KBucket::new(20);

        for byte in ["f0", "03", "40", "01", "10"] {
            bucket.upsert(Contact::new(Id::from_str(byte).unwrap(), address(1)));
        }

        let target = Id::from_str("00").unwrap();

        let closest: Vec<String> = bucket
            .closest(&target, 3)
            .iter()
            .map(|contact| contact.id().to_string())
            .collect();

        assert_eq!(closest, vec!["01", "03", "10"]);

        assert_eq!(bucket.closest(&target, 10).len(), 5);
        assert!(bucket.closest(&target, 0).is_empty());

        // Order follows the target, not insertion.
        let closest: Vec<String> = bucket
            .closest(&Id::from_str("f1").unwrap(), 2)
            .iter()
            .map(|contact| contact.id().to_string())
            .collect();

        assert_eq!(closest, vec!["f0", "40"]);
    }

    #[test]
    fn closest_contacts_to_own_id() {
        let table = RoutingTable::new(Id::from_str("00").unwrap(), 20);

        for byte in ["01", "02", "80", "ff"] {
            table.record_sighting(Contact::new(Id::from_str(byte).unwrap(), address(1)));
        }

        let closest: Vec<String> = table
            .closest_contacts(table.id(), 3)
            .iter()
            .map(|contact| contact.id().to_string())
            .collect();

        assert_eq!(closest, vec!["01", "02", "80"]);
    }

    #[test]
    fn stale_buckets_up_to_deepest() {
        let table = RoutingTable::new(Id::random(160), 20);

        assert!(table.stale_buckets(Duration::ZERO).is_empty());

        table.record_sighting(Contact::new(table.id().random_at_prefix(5), address(1)));

        assert_eq!(table.stale_buckets(Duration::ZERO), (0..=5).collect::<Vec<_>>());
        assert!(table.stale_buckets(Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn remove() {
        let table = RoutingTable::new(Id::random(160), 20);
        let contact = Contact::random(160, address(1));

        table.record_sighting(contact.clone());

        assert!(table.remove(contact.id()));
        assert!(!table.remove(contact.id()));
        assert!(table.is_empty());
    }
}
