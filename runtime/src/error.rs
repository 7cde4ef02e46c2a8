//! Error types for the chaincode host runtime.

use std::time::Duration;

use thiserror::Error;
use wasmcc_protocol::ProtocolError;

use crate::registry::TransactionKey;

/// Errors from the context registry.
///
/// Every variant means the transaction lifecycle was violated upstream:
/// two live transactions sharing an id, a lookup for a transaction that was
/// never started, or a double release.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A handle is already registered for this transaction.
    #[error("Stub already exists for transaction context {0}")]
    AlreadyRegistered(TransactionKey),

    /// No handle is registered for this transaction.
    #[error("No stub found for transaction context {0}")]
    NotFound(TransactionKey),
}

/// Errors returned to the guest from a host call.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The binding, namespace or operation is not served by this host.
    #[error("Operation not supported: {binding} {namespace} {operation}")]
    NotSupported {
        binding: String,
        namespace: String,
        operation: String,
    },

    /// The payload could not be decoded as the operation's request.
    #[error(transparent)]
    Decode(#[from] ProtocolError),

    /// The operation was understood but could not be carried out.
    #[error("{operation} failed{}: {reason}", collection_suffix(.collection))]
    Failed {
        operation: &'static str,
        collection: Option<String>,
        reason: String,
    },

    /// Servicing the call panicked; the panic was contained.
    #[error("Operation panicked: {binding} {namespace} {operation}")]
    Panicked {
        binding: String,
        namespace: String,
        operation: String,
    },
}

fn collection_suffix(collection: &Option<String>) -> String {
    match collection {
        Some(name) => format!(" for collection {}", name),
        None => String::new(),
    }
}

/// Errors from a sandboxed guest executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The module bytes could not be compiled.
    #[error("invalid wasm module: {0}")]
    Module(String),

    /// The module could not be instantiated.
    #[error("failed to instantiate wasm module: {0}")]
    Instantiate(String),

    /// The guest trapped; the instance must not be reused.
    #[error("guest trapped: {0}")]
    Trap(String),

    /// The guest ran to completion and reported an error.
    #[error("{0}")]
    Guest(String),

    /// The host panicked while running the guest.
    #[error("guest invocation panicked: {0}")]
    Panicked(String),

    /// The executor was already handed back to its pool.
    #[error("executor already released")]
    Released,

    /// Reading module bytes failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Whether the executor that produced this error must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutorError::Trap(_) | ExecutorError::Panicked(_))
    }
}

/// Errors from the instance pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No instance became free before the timeout.
    #[error("timed out after {0:?} waiting for a free wasm instance")]
    Timeout(Duration),

    /// The pool has been closed.
    #[error("instance pool is closed")]
    Closed,

    /// A pool needs at least one instance.
    #[error("instance pool capacity must be at least 1")]
    ZeroCapacity,

    /// Creating a replacement instance failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Errors surfaced by the transaction orchestrator.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The transaction could not be registered or deregistered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No guest instance was available.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The guest failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The guest's response could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Configuration was missing or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether the caller may retry the same invocation later.
    ///
    /// Only pool exhaustion qualifies; everything else would fail the same
    /// way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Pool(PoolError::Timeout(_)))
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
