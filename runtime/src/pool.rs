//! Bounded pool of guest executors.
//!
//! Instantiating a wasm module is far more expensive than calling into an
//! existing instance, and an instance can only run one call at a time. The
//! pool keeps a fixed number of instances and hands them out one
//! transaction at a time.
//!
//! Capacity is enforced by a semaphore. A checked-out instance travels with
//! its permit inside a [`PooledExecutor`] guard, so every exit path gives the
//! slot back: an explicit [`PooledExecutor::release`], a
//! [`PooledExecutor::discard`] for an instance that faulted, or simply
//! dropping the guard.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{trace, warn};

use crate::error::{ExecutorError, PoolError};
use crate::executor::{ExecutorFactory, GuestExecutor};

struct Shared<F: ExecutorFactory> {
    factory: F,
    idle: Mutex<Vec<F::Executor>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl<F: ExecutorFactory> Shared<F> {
    fn idle(&self) -> MutexGuard<'_, Vec<F::Executor>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed-size pool of executors.
pub struct InstancePool<F: ExecutorFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ExecutorFactory> InstancePool<F> {
    /// Create a pool of `capacity` executors.
    ///
    /// All executors are created up front, so a module that cannot be
    /// instantiated fails here rather than on the first transaction.
    pub fn new(factory: F, capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }

        let idle = (0..capacity)
            .map(|_| factory.create())
            .collect::<Result<Vec<_>, ExecutorError>>()?;

        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
            }),
        })
    }

    /// Check out an executor, waiting at most `timeout` for one to free up.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledExecutor<F>, PoolError> {
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.shared.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                warn!(?timeout, capacity = self.shared.capacity, "no free wasm instance");
                return Err(PoolError::Timeout(timeout));
            }
        };

        let pooled = self.shared.idle().pop();
        let executor = match pooled {
            Some(executor) => executor,
            // A slot whose instance was discarded gets a fresh one. If that
            // fails the permit drops here and the slot stays free.
            None => self.shared.factory.create()?,
        };

        trace!(available = self.available(), "acquired wasm instance");
        Ok(PooledExecutor {
            executor: Some(executor),
            permit: Some(permit),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Close the pool.
    ///
    /// Idle executors are dropped and pending or future `acquire` calls fail
    /// with [`PoolError::Closed`]. Executors still checked out are dropped
    /// when they come back.
    pub fn close(&self) {
        self.shared.permits.close();
        self.shared.idle().clear();
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.permits.is_closed()
    }

    /// The fixed number of slots.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Slots not currently checked out.
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }
}

/// An executor checked out of an [`InstancePool`].
///
/// Returned to the pool when released or dropped.
pub struct PooledExecutor<F: ExecutorFactory> {
    executor: Option<F::Executor>,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared<F>>,
}

impl<F: ExecutorFactory> PooledExecutor<F> {
    /// Return the executor to the pool.
    ///
    /// Fails with [`PoolError::Closed`] if the pool was closed in the
    /// meantime; the executor is dropped in that case.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.return_to_pool()
    }

    /// Drop the executor instead of returning it.
    ///
    /// Use this after a fault that may have left the instance in a bad
    /// state. The slot is freed and refilled on a later acquire.
    pub fn discard(mut self) {
        if self.executor.take().is_some() {
            warn!("discarding wasm instance");
        }
        self.permit.take();
    }

    fn return_to_pool(&mut self) -> Result<(), PoolError> {
        let Some(executor) = self.executor.take() else {
            return Ok(());
        };

        let result = if self.shared.permits.is_closed() {
            Err(PoolError::Closed)
        } else {
            self.shared.idle().push(executor);
            Ok(())
        };

        // The permit goes back only after the executor is in the idle list,
        // so the next acquirer always finds it.
        self.permit.take();
        trace!("released wasm instance");
        result
    }
}

impl<F: ExecutorFactory> GuestExecutor for PooledExecutor<F> {
    fn invoke(&mut self, operation: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError> {
        match self.executor.as_mut() {
            Some(executor) => executor.invoke(operation, payload),
            None => Err(ExecutorError::Released),
        }
    }
}

impl<F: ExecutorFactory> Drop for PooledExecutor<F> {
    fn drop(&mut self) {
        if let Err(e) = self.return_to_pool() {
            trace!(error = %e, "dropped wasm instance on release");
        }
    }
}
