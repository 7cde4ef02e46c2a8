//! Ledger traits: Ledger, StateQueryIterator.

use crate::Result;

/// A `(key, value)` pair as stored in the ledger.
///
/// Existence is decided only by whether a lookup returns a value; there is no
/// version or tombstone at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub key: String,
    pub value: Vec<u8>,
}

impl StateRecord {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Transaction-scoped access to the ledger.
///
/// One handle is valid for exactly one in-flight transaction. Methods take
/// `&self` because the host shares the handle between the registry and the
/// host call currently being serviced; implementations synchronize
/// internally.
///
/// World state and private collections are separate key spaces. A read from
/// world state never observes a private write and vice versa.
///
/// # Object Safety
///
/// This trait is object-safe: hosts hold handles as `Arc<dyn Ledger>`.
pub trait Ledger: Send + Sync {
    /// Read a world state value.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - No value is stored for the key.
    /// * `Ok(Some(bytes))` - The stored value.
    /// * `Err(LedgerError)` - The ledger could not be reached.
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a world state value, replacing any existing one.
    fn put_state(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read a value from a private collection.
    fn get_private_data(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value to a private collection.
    fn put_private_data(&self, collection: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Read the content hash of a private value.
    ///
    /// Returns `Ok(None)` when no value is stored for the key.
    fn get_private_data_hash(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Query world state for keys in `[start_key, end_key)`.
    ///
    /// An empty `start_key` is unbounded below, an empty `end_key` unbounded
    /// above. Results come back in the ledger's key order. The caller must
    /// close the returned iterator.
    fn get_state_by_range(
        &self,
        start_key: &str,
        end_key: &str,
    ) -> Result<Box<dyn StateQueryIterator>>;

    /// Query a private collection for keys in `[start_key, end_key)`.
    ///
    /// Same bound and ordering rules as [`Ledger::get_state_by_range`].
    fn get_private_data_by_range(
        &self,
        collection: &str,
        start_key: &str,
        end_key: &str,
    ) -> Result<Box<dyn StateQueryIterator>>;
}

/// Cursor over the results of a range query.
///
/// The cursor may hold resources on the ledger side, so it has to be closed
/// exactly once when the caller is done with it, whether or not every result
/// was consumed.
pub trait StateQueryIterator: Send {
    /// Fetch the next record.
    ///
    /// Returns `None` once the query is exhausted.
    fn next_state(&mut self) -> Option<Result<StateRecord>>;

    /// Release the cursor.
    fn close(&mut self) -> Result<()>;
}

impl<T: StateQueryIterator + ?Sized> StateQueryIterator for Box<T> {
    fn next_state(&mut self) -> Option<Result<StateRecord>> {
        self.as_mut().next_state()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}
