//! In-memory ledger.
//!
//! `MemoryLedger` keeps world state and private collections in ordered maps,
//! so range queries come back in byte-wise key order like a real peer's
//! state database.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tracing::trace;

use crate::{Ledger, LedgerError, Result, StateQueryIterator, StateRecord};

type KeySpace = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct Inner {
    world: KeySpace,
    collections: BTreeMap<String, KeySpace>,
    fail_iteration_at: Option<usize>,
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Snapshot of range query iterator bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IteratorStats {
    /// Iterators handed out by range queries.
    pub opened: usize,
    /// Iterators closed by their caller.
    pub closed: usize,
}

impl IteratorStats {
    /// Iterators that were opened and never closed.
    pub fn open(&self) -> usize {
        self.opened.saturating_sub(self.closed)
    }
}

/// An in-memory ledger.
///
/// Clones share the same underlying state, so a test can keep one clone for
/// inspection while another is registered with a host as a transaction's
/// handle.
///
/// # Example
///
/// ```rust
/// use wasmcc_ledger::{Ledger, MemoryLedger};
///
/// let ledger = MemoryLedger::new();
/// ledger.put_private_data("secrets", "007", b"bond").unwrap();
///
/// // Private collections and world state are separate key spaces.
/// assert_eq!(ledger.get_state("007").unwrap(), None);
/// assert!(ledger.get_private_data_hash("secrets", "007").unwrap().is_some());
/// ```
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
}

impl MemoryLedger {
    /// Create a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger with initial world state.
    pub fn with_world_state<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let ledger = Self::new();
        {
            let mut inner = ledger.lock();
            for (key, value) in entries {
                inner.world.insert(key.into(), value.into());
            }
        }
        ledger
    }

    /// Copy of the current world state.
    pub fn world_state(&self) -> BTreeMap<String, Vec<u8>> {
        self.lock().world.clone()
    }

    /// Copy of a private collection, empty if it was never written.
    pub fn collection(&self, name: &str) -> BTreeMap<String, Vec<u8>> {
        self.lock()
            .collections
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Make the next range query fail after yielding `index` records.
    ///
    /// Only the next query is affected.
    pub fn fail_next_iteration_at(&self, index: usize) {
        self.lock().fail_iteration_at = Some(index);
    }

    /// Counts of iterators opened and closed so far.
    pub fn iterator_stats(&self) -> IteratorStats {
        IteratorStats {
            opened: self.counters.opened.load(Ordering::SeqCst),
            closed: self.counters.closed.load(Ordering::SeqCst),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn range(&self, space: &KeySpace, start_key: &str, end_key: &str) -> Vec<StateRecord> {
        let lower = if start_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(start_key)
        };
        let upper = if end_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end_key)
        };

        // BTreeMap::range panics on an inverted range; a real ledger just
        // returns nothing.
        if let (Bound::Included(start), Bound::Excluded(end)) = (lower, upper) {
            if start >= end {
                return Vec::new();
            }
        }

        space
            .range::<str, _>((lower, upper))
            .map(|(key, value)| StateRecord::new(key.clone(), value.clone()))
            .collect()
    }

    fn open_iterator(&self, records: Vec<StateRecord>, fail_at: Option<usize>) -> MemoryIterator {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        trace!(results = records.len(), "opened range query iterator");
        MemoryIterator {
            records: records.into_iter(),
            yielded: 0,
            fail_at,
            closed: false,
            counters: Arc::clone(&self.counters),
        }
    }
}

impl Ledger for MemoryLedger {
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().world.get(key).cloned())
    }

    fn put_state(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock().world.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_private_data(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .collections
            .get(collection)
            .and_then(|space| space.get(key))
            .cloned())
    }

    fn put_private_data(&self, collection: &str, key: &str, value: &[u8]) -> Result<()> {
        self.lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_private_data_hash(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get_private_data(collection, key)?
            .map(|value| Sha256::digest(&value).to_vec()))
    }

    fn get_state_by_range(
        &self,
        start_key: &str,
        end_key: &str,
    ) -> Result<Box<dyn StateQueryIterator>> {
        let (records, fail_at) = {
            let mut inner = self.lock();
            let records = self.range(&inner.world, start_key, end_key);
            (records, inner.fail_iteration_at.take())
        };
        Ok(Box::new(self.open_iterator(records, fail_at)))
    }

    fn get_private_data_by_range(
        &self,
        collection: &str,
        start_key: &str,
        end_key: &str,
    ) -> Result<Box<dyn StateQueryIterator>> {
        let (records, fail_at) = {
            let mut inner = self.lock();
            let records = match inner.collections.get(collection) {
                Some(space) => self.range(space, start_key, end_key),
                None => Vec::new(),
            };
            (records, inner.fail_iteration_at.take())
        };
        Ok(Box::new(self.open_iterator(records, fail_at)))
    }
}

/// Iterator over a snapshot of range query results.
struct MemoryIterator {
    records: std::vec::IntoIter<StateRecord>,
    yielded: usize,
    fail_at: Option<usize>,
    closed: bool,
    counters: Arc<Counters>,
}

impl StateQueryIterator for MemoryIterator {
    fn next_state(&mut self) -> Option<Result<StateRecord>> {
        if self.closed {
            return Some(Err(LedgerError::IteratorClosed));
        }
        if self.fail_at == Some(self.yielded) {
            self.fail_at = None;
            return Some(Err(LedgerError::backend("injected iteration failure")));
        }
        let record = self.records.next()?;
        self.yielded += 1;
        Some(Ok(record))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(LedgerError::IteratorClosed);
        }
        self.closed = true;
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collection_literals::btree;

    fn drain(mut iter: Box<dyn StateQueryIterator>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Some(record) = iter.next_state() {
            let record = record.unwrap();
            out.push((record.key, String::from_utf8(record.value).unwrap()));
        }
        iter.close().unwrap();
        out
    }

    fn bond_ledger() -> MemoryLedger {
        MemoryLedger::with_world_state([("007", "bond"), ("008", "not bond"), ("010", "q")])
    }

    #[test]
    fn world_state_write_read() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.get_state("007").unwrap(), None);

        ledger.put_state("007", b"bond").unwrap();
        assert_eq!(ledger.get_state("007").unwrap(), Some(b"bond".to_vec()));

        ledger.put_state("007", b"goldfinger").unwrap();
        assert_eq!(ledger.get_state("007").unwrap(), Some(b"goldfinger".to_vec()));
    }

    #[test]
    fn clones_share_state() {
        let ledger = MemoryLedger::new();
        let observer = ledger.clone();
        ledger.put_state("k", b"v").unwrap();
        assert_eq!(
            observer.world_state(),
            btree! { "k".to_string() => b"v".to_vec() }
        );
    }

    #[test]
    fn private_data_is_separate_from_world_state() {
        let ledger = MemoryLedger::new();
        ledger.put_private_data("secrets", "007", b"bond").unwrap();

        assert_eq!(ledger.get_state("007").unwrap(), None);
        assert_eq!(ledger.get_private_data("other", "007").unwrap(), None);
        assert_eq!(
            ledger.get_private_data("secrets", "007").unwrap(),
            Some(b"bond".to_vec())
        );
        assert_eq!(ledger.collection("secrets").len(), 1);
        assert!(ledger.collection("other").is_empty());
    }

    #[test]
    fn private_data_hash_is_sha256() {
        let ledger = MemoryLedger::new();
        ledger.put_private_data("secrets", "007", b"bond").unwrap();

        let hash = ledger.get_private_data_hash("secrets", "007").unwrap().unwrap();
        assert_eq!(hash, Sha256::digest(b"bond").to_vec());
        assert_eq!(hash.len(), 32);

        assert_eq!(ledger.get_private_data_hash("secrets", "008").unwrap(), None);
    }

    #[test]
    fn range_is_half_open() {
        let ledger = bond_ledger();
        let results = drain(ledger.get_state_by_range("007", "010").unwrap());
        assert_eq!(
            results,
            vec![
                ("007".to_string(), "bond".to_string()),
                ("008".to_string(), "not bond".to_string()),
            ]
        );
    }

    #[test]
    fn range_empty_bounds_are_unbounded() {
        let ledger = bond_ledger();

        let low = drain(ledger.get_state_by_range("", "008").unwrap());
        assert_eq!(low, vec![("007".to_string(), "bond".to_string())]);

        let high = drain(ledger.get_state_by_range("008", "").unwrap());
        assert_eq!(high.len(), 2);
        assert_eq!(high[0].0, "008");

        let all = drain(ledger.get_state_by_range("", "").unwrap());
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn inverted_range_is_empty() {
        let ledger = bond_ledger();
        assert!(drain(ledger.get_state_by_range("009", "001").unwrap()).is_empty());
        assert!(drain(ledger.get_state_by_range("007", "007").unwrap()).is_empty());
    }

    #[test]
    fn private_range_query() {
        let ledger = MemoryLedger::new();
        ledger.put_private_data("secrets", "a", b"1").unwrap();
        ledger.put_private_data("secrets", "b", b"2").unwrap();
        ledger.put_state("a", b"world").unwrap();

        let results = drain(ledger.get_private_data_by_range("secrets", "", "").unwrap());
        assert_eq!(
            results,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );

        assert!(drain(ledger.get_private_data_by_range("missing", "", "").unwrap()).is_empty());
    }

    #[test]
    fn iterator_stats_track_close() {
        let ledger = bond_ledger();
        let mut iter = ledger.get_state_by_range("", "").unwrap();
        assert_eq!(ledger.iterator_stats().open(), 1);

        iter.close().unwrap();
        assert_eq!(
            ledger.iterator_stats(),
            IteratorStats {
                opened: 1,
                closed: 1
            }
        );

        // Double close is an error and is not counted.
        assert_eq!(iter.close(), Err(LedgerError::IteratorClosed));
        assert_eq!(ledger.iterator_stats().closed, 1);
    }

    #[test]
    fn injected_iteration_failure() {
        let ledger = bond_ledger();
        ledger.fail_next_iteration_at(1);

        let mut iter = ledger.get_state_by_range("", "").unwrap();
        assert!(iter.next_state().unwrap().is_ok());
        assert!(iter.next_state().unwrap().is_err());
        iter.close().unwrap();

        // The injection only applies to one query.
        assert_eq!(drain(ledger.get_state_by_range("", "").unwrap()).len(), 3);
    }
}
