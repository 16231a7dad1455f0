//! # Ordered Key-Value Store
//!
//! All entities live in an ordered byte-keyed store. Integer components of
//! keys are big-endian so prefix iteration yields numeric order, which is
//! what makes the pending lending-event queue FIFO.
//!
//! Operations never write to the backing store directly: they run against a
//! [`Batch`] overlay whose writes are applied only when the operation
//! succeeds. A failed operation leaves no partial records behind.

use crate::error::{LendingError, LendingResult};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Pending writes of a batch, `None` marks a deletion.
pub type Writes = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Ordered key-value store with prefix iteration.
pub trait Store {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn set(&mut self, key: &[u8], value: Vec<u8>);

    fn delete(&mut self, key: &[u8]);

    /// Entries whose key starts with `prefix`, in ascending key order.
    fn prefix_scan(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Apply the writes of a committed batch.
    fn write(&mut self, writes: Writes) {
        for (key, value) in writes {
            match value {
                Some(value) => self.set(&key, value),
                None => self.delete(&key),
            }
        }
    }
}

/// In-memory store backed by a `BTreeMap`.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.entries.insert(key.to_vec(), value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.entries.remove(key);
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Write overlay on top of a read-only store.
pub struct Batch<'a> {
    base: &'a dyn Store,
    writes: Writes,
}

impl<'a> Batch<'a> {
    pub fn new(base: &'a dyn Store) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    /// Consume the batch, returning its writes for [`Store::write`].
    pub fn into_writes(self) -> Writes {
        self.writes
    }
}

impl Store for Batch<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(value) => value.clone(),
            None => self.base.get(key),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.writes.insert(key.to_vec(), Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self.base.prefix_scan(prefix).into_iter().collect();
        for (key, value) in self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

/// Build a key from a table prefix and components.
pub fn key(prefix: u8, parts: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![prefix];
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

/// Big-endian encoding of an integer key component.
pub fn be(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Typed JSON access on top of any [`Store`].
pub trait StoreExt: Store {
    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> LendingResult<Option<T>> {
        match self.get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&mut self, key: &[u8], value: &T) -> LendingResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes);
        Ok(())
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &[u8]) -> LendingResult<Vec<T>> {
        self.prefix_scan(prefix)
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(LendingError::from))
            .collect()
    }

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Increment and return the sequence stored at `key` (first value is 1).
    fn next_sequence(&mut self, key: &[u8]) -> LendingResult<u64> {
        let current = match self.get(key) {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| LendingError::invariant("corrupted sequence value"))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        let next = current + 1;
        self.set(key, next.to_be_bytes().to_vec());
        Ok(next)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// A record kept in an [`IndexedTable`].
pub trait Indexed {
    /// Primary key bytes, big-endian for integer ids.
    fn primary_key(&self) -> Vec<u8>;

    /// Status used by the secondary index.
    fn status_key(&self) -> String;
}

/// Primary map plus a status → ordered id set index.
///
/// Primary records live under `prefix | 0x00 | id` and index entries under
/// `prefix | 0x01 | status | 0x00 | id`. Both are written by the same `put`,
/// so the index never disagrees with the records inside one batch.
pub struct IndexedTable<T> {
    prefix: u8,
    _marker: PhantomData<T>,
}

const PRIMARY: u8 = 0x00;
const STATUS_INDEX: u8 = 0x01;

impl<T: Indexed + Serialize + DeserializeOwned> IndexedTable<T> {
    pub const fn new(prefix: u8) -> Self {
        Self {
            prefix,
            _marker: PhantomData,
        }
    }

    fn primary(&self, id: &[u8]) -> Vec<u8> {
        key(self.prefix, &[&[PRIMARY], id])
    }

    fn index_prefix(&self, status: &str) -> Vec<u8> {
        key(self.prefix, &[&[STATUS_INDEX], status.as_bytes(), &[0x00]])
    }

    pub fn get(&self, store: &dyn Store, id: &[u8]) -> LendingResult<Option<T>> {
        store.get_json(&self.primary(id))
    }

    pub fn contains(&self, store: &dyn Store, id: &[u8]) -> bool {
        store.has(&self.primary(id))
    }

    /// Insert or update a record, moving its index entry on status change.
    pub fn put(&self, store: &mut dyn Store, record: &T) -> LendingResult<()> {
        let id = record.primary_key();
        if let Some(existing) = self.get(store, &id)? {
            let old_status = existing.status_key();
            if old_status != record.status_key() {
                let mut old_index = self.index_prefix(&old_status);
                old_index.extend_from_slice(&id);
                store.delete(&old_index);
            }
        }

        let mut index = self.index_prefix(&record.status_key());
        index.extend_from_slice(&id);
        store.set(&index, Vec::new());
        store.set_json(&self.primary(&id), record)
    }

    /// Ids with the given status, in ascending id order.
    pub fn ids_by_status(&self, store: &dyn Store, status: &str) -> Vec<Vec<u8>> {
        let prefix = self.index_prefix(status);
        store
            .prefix_scan(&prefix)
            .into_iter()
            .map(|(k, _)| k[prefix.len()..].to_vec())
            .collect()
    }

    pub fn by_status(&self, store: &dyn Store, status: &str) -> LendingResult<Vec<T>> {
        let mut records = Vec::new();
        for id in self.ids_by_status(store, status) {
            let record = self.get(store, &id)?.ok_or_else(|| {
                LendingError::invariant(format!("status index points at missing record {}", hex::encode(&id)))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Oldest record with the given status.
    pub fn first_by_status(&self, store: &dyn Store, status: &str) -> LendingResult<Option<T>> {
        match self.ids_by_status(store, status).into_iter().next() {
            Some(id) => self.get(store, &id),
            None => Ok(None),
        }
    }

    pub fn count_by_status(&self, store: &dyn Store, status: &str) -> usize {
        self.ids_by_status(store, status).len()
    }

    pub fn all(&self, store: &dyn Store) -> LendingResult<Vec<T>> {
        store.scan_json(&key(self.prefix, &[&[PRIMARY]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u64,
        status: String,
    }

    impl Indexed for Item {
        fn primary_key(&self) -> Vec<u8> {
            be(self.id).to_vec()
        }

        fn status_key(&self) -> String {
            self.status.clone()
        }
    }

    const ITEMS: IndexedTable<Item> = IndexedTable::new(0x01);

    fn item(id: u64, status: &str) -> Item {
        Item {
            id,
            status: status.to_string(),
        }
    }

    #[test]
    fn test_prefix_scan_is_ordered() {
        let mut store = MemStore::new();
        for id in [300u64, 2, 70_000, 1] {
            store.set(&key(0x05, &[&be(id)]), id.to_be_bytes().to_vec());
        }
        store.set(&key(0x06, &[&be(0)]), vec![0]);

        let ids: Vec<u64> = store
            .prefix_scan(&[0x05])
            .into_iter()
            .map(|(_, v)| u64::from_be_bytes(v.try_into().unwrap()))
            .collect();
        assert_eq!(ids, vec![1, 2, 300, 70_000]);
    }

    #[test]
    fn test_batch_commits_only_on_write() {
        let mut store = MemStore::new();
        store.set(b"a", vec![1]);
        store.set(b"b", vec![2]);

        let mut batch = Batch::new(&store);
        batch.set(b"c", vec![3]);
        batch.delete(b"a");
        assert_eq!(batch.get(b"a"), None);
        assert_eq!(batch.get(b"c"), Some(vec![3]));
        assert_eq!(batch.prefix_scan(b"").len(), 2);
        let writes = batch.into_writes();

        // Base untouched until the writes are applied
        assert_eq!(store.get(b"a"), Some(vec![1]));
        store.write(writes);
        assert_eq!(store.get(b"a"), None);
        assert_eq!(store.get(b"c"), Some(vec![3]));
    }

    #[test]
    fn test_dropped_batch_leaves_no_trace() {
        let store = MemStore::new();
        {
            let mut batch = Batch::new(&store);
            batch.set_json(b"x", &42u64).unwrap();
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_indexed_table_moves_status() {
        let mut store = MemStore::new();
        ITEMS.put(&mut store, &item(2, "pending")).unwrap();
        ITEMS.put(&mut store, &item(1, "pending")).unwrap();
        ITEMS.put(&mut store, &item(3, "open")).unwrap();

        let pending = ITEMS.by_status(&store, "pending").unwrap();
        assert_eq!(pending.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ITEMS.first_by_status(&store, "pending").unwrap().unwrap().id, 1);

        ITEMS.put(&mut store, &item(1, "open")).unwrap();
        assert_eq!(ITEMS.count_by_status(&store, "pending"), 1);
        assert_eq!(ITEMS.count_by_status(&store, "open"), 2);
        assert_eq!(ITEMS.all(&store).unwrap().len(), 3);
    }

    #[test]
    fn test_sequences() {
        let mut store = MemStore::new();
        assert_eq!(store.next_sequence(b"seq").unwrap(), 1);
        assert_eq!(store.next_sequence(b"seq").unwrap(), 2);
        assert_eq!(store.next_sequence(b"other").unwrap(), 1);
    }
}
