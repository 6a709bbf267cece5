//! Pending-connection table
//!
//! Userspace counterpart of the kernel `START` map. Keys are sharded across
//! independently locked buckets, so two hooks only contend when their keys
//! hash to the same shard, and no operation waits on anything but a single
//! shard for a bounded amount of work.

use connlat_common::ConnectionKey;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Result of [`PendingTable::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry created
    Inserted,
    /// Existing entry overwritten (last write wins)
    Refreshed,
    /// Table at capacity, nothing stored
    Rejected,
}

/// Bounded concurrent map from connection key to start timestamp
pub struct PendingTable {
    entries: DashMap<ConnectionKey, u64>,
    len: AtomicUsize,
    capacity: usize,
}

impl PendingTable {
    /// Create a table holding at most `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Store `timestamp_ns` for `key`, overwriting any previous value
    ///
    /// A new key is only admitted if a slot can be reserved, so the table
    /// never grows past its capacity even with concurrent inserters.
    pub fn insert(&self, key: ConnectionKey, timestamp_ns: u64) -> InsertOutcome {
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.insert(timestamp_ns);
                InsertOutcome::Refreshed
            }
            Entry::Vacant(entry) => {
                let reserved = self
                    .len
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                        (len < self.capacity).then_some(len + 1)
                    })
                    .is_ok();
                if !reserved {
                    return InsertOutcome::Rejected;
                }
                entry.insert(timestamp_ns);
                InsertOutcome::Inserted
            }
        }
    }

    /// Remove and return the timestamp for `key`
    ///
    /// When several callers race on the same key exactly one gets `Some`.
    pub fn take(&self, key: &ConnectionKey) -> Option<u64> {
        let (_, timestamp_ns) = self.entries.remove(key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(timestamp_ns)
    }

    /// Timestamp for `key` without removing it
    pub fn get(&self, key: &ConnectionKey) -> Option<u64> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Drop every entry that started before `cutoff_ns`
    ///
    /// Called from the collector, never from a hook.
    pub fn purge_older_than(&self, cutoff_ns: u64) -> usize {
        let mut purged = 0usize;
        self.entries.retain(|_, started| {
            let keep = *started >= cutoff_ns;
            if !keep {
                purged += 1;
            }
            keep
        });
        self.len.fetch_sub(purged, Ordering::AcqRel);
        purged
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connlat_common::{SockCommon, AF_INET};
    use std::sync::atomic::AtomicU64;

    fn key(port: u16) -> ConnectionKey {
        let sk = SockCommon::v4([10, 0, 0, 1], 80, [10, 0, 0, 2], port);
        ConnectionKey::from_request(AF_INET, &sk).unwrap()
    }

    #[test]
    fn test_insert_and_take() {
        let table = PendingTable::with_capacity(16);

        assert_eq!(table.insert(key(1000), 5), InsertOutcome::Inserted);
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(&key(1000)), Some(5));
        assert_eq!(table.take(&key(1000)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let table = PendingTable::with_capacity(16);

        table.insert(key(1000), 5);
        assert_eq!(table.insert(key(1000), 9), InsertOutcome::Refreshed);
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(&key(1000)), Some(9));
    }

    #[test]
    fn test_capacity_exhaustion() {
        let table = PendingTable::with_capacity(2);

        assert_eq!(table.insert(key(1), 1), InsertOutcome::Inserted);
        assert_eq!(table.insert(key(2), 2), InsertOutcome::Inserted);
        assert_eq!(table.insert(key(3), 3), InsertOutcome::Rejected);
        // Existing keys can still be refreshed when full
        assert_eq!(table.insert(key(1), 4), InsertOutcome::Refreshed);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&key(3)), None);

        table.take(&key(2));
        assert_eq!(table.insert(key(3), 3), InsertOutcome::Inserted);
    }

    #[test]
    fn test_purge_older_than() {
        let table = PendingTable::with_capacity(16);
        table.insert(key(1), 100);
        table.insert(key(2), 200);
        table.insert(key(3), 300);

        assert_eq!(table.purge_older_than(250), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&key(3)), Some(300));
    }

    #[test]
    fn test_concurrent_inserts_respect_capacity() {
        let table = PendingTable::with_capacity(100);

        std::thread::scope(|s| {
            for t in 0..4u16 {
                let table = &table;
                s.spawn(move || {
                    for i in 0..100u16 {
                        table.insert(key(t * 1000 + i), i as u64);
                    }
                });
            }
        });

        assert_eq!(table.len(), 100);
        assert_eq!(table.entries.len(), 100);
    }

    #[test]
    fn test_concurrent_take_first_wins() {
        let table = PendingTable::with_capacity(16);
        table.insert(key(4242), 7);
        let winners = AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    if table.take(&key(4242)).is_some() {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::Relaxed), 1);
        assert!(table.is_empty());
    }
}
