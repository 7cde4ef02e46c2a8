//! Seams between the host and the sandbox.
//!
//! The pool and the orchestrator only know these traits; [`crate::wapc`]
//! provides the Wasmtime-backed implementation.

use crate::error::ExecutorError;

/// A sandbox instance that runs named guest operations.
///
/// One executor serves one invocation at a time; concurrency comes from
/// pooling several of them.
pub trait GuestExecutor: Send {
    /// Run a guest operation with a payload and return its response.
    fn invoke(&mut self, operation: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError>;
}

impl<T: GuestExecutor + ?Sized> GuestExecutor for Box<T> {
    fn invoke(&mut self, operation: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError> {
        self.as_mut().invoke(operation, payload)
    }
}

/// Creates executors for a pool.
pub trait ExecutorFactory: Send + Sync {
    /// The executor type this factory produces.
    type Executor: GuestExecutor + 'static;

    /// Create a fresh, initialized executor.
    fn create(&self) -> Result<Self::Executor, ExecutorError>;
}

/// Services calls a guest places back into the host.
///
/// The error string is handed to the guest verbatim.
pub trait HostCallHandler: Send + Sync {
    fn host_call(
        &self,
        binding: &str,
        namespace: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, String>;
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
