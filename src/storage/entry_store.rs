//! EntryStore - In-memory passkey index.
//!
//! A single mutex guards the map. Every check-then-mutate sequence runs
//! inside one lock scope, so two concurrent takes of the same key can never
//! both succeed. Nothing here touches blob storage; callers get the removed
//! entries back and clean up their blobs outside the lock.

use super::entry::{BlobLocation, Entry, EntryKind, EntrySummary, StoredEntry};
use crate::passkey::Passkey;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Outcome of `take_if_kind`.
#[derive(Debug)]
pub enum Take {
    /// Entry matched and was removed.
    Taken(StoredEntry),
    /// No entry under this key.
    Missing,
    /// Entry exists with another kind; it stays in place.
    KindMismatch,
    /// Entry had expired; it was removed and must not be handed out.
    Expired(Entry),
}

impl Take {
    pub fn into_entry(self) -> Option<Entry> {
        match self {
            Self::Taken(stored) => Some(stored.entry),
            _ => None,
        }
    }
}

/// Returned by `insert_new` when the key is already registered.
/// Hands the rejected entry back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupied(pub Entry);

/// Process-wide store of live entries.
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: Mutex<HashMap<Passkey, StoredEntry>>,
    ttl: Option<Duration>,
}

impl EntryStore {
    /// Store without expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose entries expire `ttl` after insertion.
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn stamp(&self, entry: Entry) -> StoredEntry {
        let created_at = Utc::now();
        let expires_at = self
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| created_at.checked_add_signed(ttl));
        StoredEntry {
            entry,
            created_at,
            expires_at,
        }
    }

    /// Insert, silently replacing whatever was under `key`.
    pub fn put(&self, key: Passkey, entry: Entry) {
        let stored = self.stamp(entry);
        self.entries.lock().insert(key, stored);
    }

    /// Insert only if `key` is free.
    pub fn insert_new(&self, key: Passkey, entry: Entry) -> Result<(), Occupied> {
        let stored = self.stamp(entry);
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(Occupied(stored.entry));
        }
        entries.insert(key, stored);
        Ok(())
    }

    /// Put back an entry taken for a delivery that never completed.
    /// Keeps the original timestamps.
    pub fn restore(&self, key: Passkey, stored: StoredEntry) {
        self.entries.lock().entry(key).or_insert(stored);
    }

    /// Atomically remove and return the entry if it exists with `kind`.
    pub fn take_if_kind(&self, key: &Passkey, kind: EntryKind) -> Take {
        self.take_if_kind_at(key, kind, Utc::now())
    }

    fn take_if_kind_at(&self, key: &Passkey, kind: EntryKind, now: DateTime<Utc>) -> Take {
        let mut entries = self.entries.lock();
        let Some(stored) = entries.get(key) else {
            return Take::Missing;
        };

        if stored.is_expired(now) {
            return match entries.remove(key) {
                Some(stored) => Take::Expired(stored.entry),
                None => Take::Missing,
            };
        }
        if stored.entry.kind() != kind {
            return Take::KindMismatch;
        }

        match entries.remove(key) {
            Some(stored) => Take::Taken(stored),
            None => Take::Missing,
        }
    }

    /// Remove every entry expired at `now`.
    pub fn drain_expired(&self, now: DateTime<Utc>) -> Vec<(Passkey, Entry)> {
        let mut entries = self.entries.lock();
        let expired: Vec<Passkey> = entries
            .iter()
            .filter(|(_, stored)| stored.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|stored| (key, stored.entry)))
            .collect()
    }

    /// Snapshot of live entries, oldest first.
    pub fn list(&self) -> Vec<EntrySummary> {
        let mut rows: Vec<EntrySummary> = self
            .entries
            .lock()
            .iter()
            .map(|(key, stored)| EntrySummary {
                passkey: key.clone(),
                kind: stored.entry.kind(),
                path: stored.entry.location_hint(),
                created_at: stored.created_at,
                expires_at: stored.expires_at,
            })
            .collect();
        rows.sort_by_key(|row| row.created_at);
        rows
    }

    /// Blob names still referenced by some entry.
    pub fn referenced_blobs(&self) -> HashSet<BlobLocation> {
        self.entries
            .lock()
            .values()
            .filter_map(|stored| stored.entry.blob().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::ImageRef;
    use std::sync::{Arc, Barrier};

    fn image_entry(name: &str) -> Entry {
        Entry::Image(ImageRef {
            location: BlobLocation::new(name),
            original_name: "photo.jpg".into(),
            size: 4,
            sha256: String::new(),
        })
    }

    #[test]
    fn test_take_removes_entry() {
        let store = EntryStore::new();
        let key = Passkey::generate();
        store.put(key.clone(), Entry::Text("secret".into()));

        let taken = store.take_if_kind(&key, EntryKind::Text).into_entry();
        assert_eq!(taken, Some(Entry::Text("secret".into())));
        assert!(matches!(store.take_if_kind(&key, EntryKind::Text), Take::Missing));
        assert!(store.is_empty());
    }

    #[test]
    fn test_kind_mismatch_leaves_entry() {
        let store = EntryStore::new();
        let key = Passkey::generate();
        store.put(key.clone(), image_entry("blob-a.jpg"));

        assert!(matches!(
            store.take_if_kind(&key, EntryKind::Text),
            Take::KindMismatch
        ));
        assert_eq!(store.len(), 1);
        assert!(matches!(
            store.take_if_kind(&key, EntryKind::Image),
            Take::Taken(_)
        ));
    }

    #[test]
    fn test_put_overwrites_but_insert_new_refuses() {
        let store = EntryStore::new();
        let key = Passkey::generate();
        store.put(key.clone(), Entry::Text("one".into()));
        store.put(key.clone(), Entry::Text("two".into()));
        assert_eq!(store.len(), 1);

        assert_eq!(
            store.insert_new(key.clone(), Entry::Text("three".into())),
            Err(Occupied(Entry::Text("three".into())))
        );
        let taken = store.take_if_kind(&key, EntryKind::Text).into_entry();
        assert_eq!(taken, Some(Entry::Text("two".into())));
    }

    #[test]
    fn test_expired_entry_is_not_handed_out() {
        let store = EntryStore::with_ttl(Some(Duration::ZERO));
        let key = Passkey::generate();
        store.put(key.clone(), image_entry("blob-old.png"));

        match store.take_if_kind(&key, EntryKind::Image) {
            Take::Expired(entry) => {
                assert_eq!(entry.blob(), Some(&BlobLocation::new("blob-old.png")))
            }
            other => panic!("expected expired, got {:?}", other),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_drain_expired_only_takes_expired() {
        let store = EntryStore::with_ttl(Some(Duration::from_secs(60)));
        let old = Passkey::generate();
        store.put(old.clone(), Entry::Text("old".into()));

        assert!(store.drain_expired(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(61);
        let drained = store.drain_expired(later);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, old);
        assert!(store.is_empty());
    }

    #[test]
    fn test_restore_keeps_timestamps() {
        let store = EntryStore::new();
        let key = Passkey::generate();
        store.put(key.clone(), Entry::Text("x".into()));
        let created = store.list()[0].created_at;

        let Take::Taken(stored) = store.take_if_kind(&key, EntryKind::Text) else {
            panic!("entry should be taken");
        };
        store.restore(key.clone(), stored);

        let rows = store.list();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].created_at, created);
    }

    #[test]
    fn test_list_and_referenced_blobs() {
        let store = EntryStore::new();
        store.put(Passkey::generate(), Entry::Text("t".into()));
        store.put(Passkey::generate(), image_entry("blob-1.png"));

        let rows = store.list();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.path == "text-data"));
        assert!(rows.iter().any(|r| r.path == "blob-1.png"));

        let blobs = store.referenced_blobs();
        assert_eq!(blobs.len(), 1);
        assert!(blobs.contains(&BlobLocation::new("blob-1.png")));
    }

    #[test]
    fn test_concurrent_take_succeeds_once() {
        for _ in 0..50 {
            let store = Arc::new(EntryStore::new());
            let key = Passkey::generate();
            store.put(key.clone(), Entry::Text("once".into()));

            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = Arc::clone(&store);
                    let barrier = Arc::clone(&barrier);
                    let key = key.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        matches!(store.take_if_kind(&key, EntryKind::Text), Take::Taken(_))
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
        }
    }
}
