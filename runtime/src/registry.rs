//! Context registry: which ledger handle belongs to which transaction.
//!
//! Guests never hold a ledger handle. Each host call carries the
//! transaction's `(channel id, transaction id)` and the router resolves the
//! handle here. The orchestrator registers a handle before the guest runs
//! and removes it once the guest returns.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};
use wasmcc_ledger::Ledger;
use wasmcc_protocol::TransactionContext;

use crate::error::RegistryError;

/// Identifies one in-flight transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey {
    channel_id: String,
    tx_id: String,
}

impl TransactionKey {
    /// Create a key from a channel id and a transaction id.
    pub fn new(channel_id: impl Into<String>, tx_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            tx_id: tx_id.into(),
        }
    }

    /// The execution domain (channel) id.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The transaction id.
    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }
}

impl From<&TransactionContext> for TransactionKey {
    fn from(context: &TransactionContext) -> Self {
        Self::new(context.channel_id.clone(), context.transaction_id.clone())
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.channel_id, self.tx_id)
    }
}

/// Maps live transactions to their ledger handles.
///
/// A single reader/writer lock guards the whole map. Entries are short-lived
/// and lookups are O(1), so lookups from concurrent transactions only ever
/// contend with the brief writes at transaction start and end.
#[derive(Default)]
pub struct ContextRegistry {
    handles: RwLock<HashMap<TransactionKey, Arc<dyn Ledger>>>,
}

impl ContextRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handle for a transaction.
    ///
    /// Fails without overwriting if the key is already registered.
    pub fn put(&self, key: TransactionKey, handle: Arc<dyn Ledger>) -> Result<(), RegistryError> {
        debug!(channel = key.channel_id(), tx_id = key.tx_id(), "putting stub");

        let mut handles = self.write();
        if handles.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        handles.insert(key, handle);
        Ok(())
    }

    /// Look up the handle for a transaction.
    pub fn get(&self, key: &TransactionKey) -> Result<Arc<dyn Ledger>, RegistryError> {
        debug!(channel = key.channel_id(), tx_id = key.tx_id(), "getting stub");

        self.read()
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.clone()))
    }

    /// Remove the handle for a transaction.
    pub fn remove(&self, key: &TransactionKey) -> Result<(), RegistryError> {
        debug!(channel = key.channel_id(), tx_id = key.tx_id(), "removing stub");

        match self.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotFound(key.clone())),
        }
    }

    /// Register a handle and get a guard that removes it again.
    ///
    /// The entry is removed when the guard is dropped or deregistered. The
    /// guard must live as long as anything can still place host calls for
    /// the transaction; otherwise the key could be reused under another
    /// handle while those calls are in flight.
    pub fn register(
        self: &Arc<Self>,
        key: TransactionKey,
        handle: Arc<dyn Ledger>,
    ) -> Result<Registration, RegistryError> {
        self.put(key.clone(), handle)?;
        Ok(Registration {
            registry: Arc::clone(self),
            key: Some(key),
        })
    }

    /// Whether a handle is registered for the key.
    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.read().contains_key(key)
    }

    /// Number of registered transactions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no transactions are registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panic while holding the lock cannot leave the map half-written:
    // every critical section is a single map operation.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<TransactionKey, Arc<dyn Ledger>>> {
        self.handles.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TransactionKey, Arc<dyn Ledger>>> {
        self.handles.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered transaction; deregisters on drop.
pub struct Registration {
    registry: Arc<ContextRegistry>,
    key: Option<TransactionKey>,
}

impl Registration {
    /// The registered key.
    pub fn key(&self) -> Option<&TransactionKey> {
        self.key.as_ref()
    }

    /// Remove the entry now.
    ///
    /// A failure is logged rather than returned: the transaction's own
    /// result matters more to the caller than a bookkeeping error.
    pub fn deregister(mut self) {
        self.remove_entry();
    }

    fn remove_entry(&mut self) {
        if let Some(key) = self.key.take() {
            if let Err(e) = self.registry.remove(&key) {
                warn!(
                    channel = key.channel_id(),
                    tx_id = key.tx_id(),
                    error = %e,
                    "error removing stub"
                );
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.remove_entry();
    }
}
