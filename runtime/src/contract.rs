//! Transaction orchestration.
//!
//! [`ContractHost`] runs one chaincode transaction end to end:
//!
//! 1. register the transaction's ledger handle in the [`ContextRegistry`]
//! 2. encode an [`InvokeTransactionRequest`]
//! 3. check an instance out of the [`InstancePool`]
//! 4. run the guest's `InvokeTransaction` operation and decode its
//!    [`InvokeTransactionResponse`]
//! 5. return the instance to the pool, or discard it if the guest faulted
//! 6. deregister the handle
//!
//! Steps 5 and 6 happen on every exit path. A failure in either is logged
//! and never replaces the transaction's own result.
//!
//! A running guest cannot be interrupted. If the caller drops the
//! [`ContractHost::invoke`] future while the guest runs, the guest finishes
//! on its blocking thread and the handle is deregistered only then.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info_span, warn, Instrument, Span};
use wasmcc_ledger::Ledger;
use wasmcc_protocol::{
    decode, encode, InvokeTransactionRequest, InvokeTransactionResponse, TransactionContext,
    INVOKE_TRANSACTION,
};

use crate::config::HostConfig;
use crate::error::{ExecutorError, Result};
use crate::executor::{panic_message, ExecutorFactory, GuestExecutor};
use crate::pool::{InstancePool, PooledExecutor};
use crate::registry::{ContextRegistry, Registration, TransactionKey};
use crate::router::LedgerRouter;
use crate::wapc::WapcModule;

/// One transaction to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Channel the transaction runs on.
    pub channel_id: String,
    /// Transaction id, unique among in-flight transactions of the channel.
    pub tx_id: String,
    /// Contract function to call.
    pub function: String,
    /// Positional arguments, passed to the guest as bytes.
    pub args: Vec<String>,
    /// Transient data; passed to the guest but never written to the ledger.
    pub transient: BTreeMap<String, Vec<u8>>,
}

impl Invocation {
    /// An invocation of `function` with no arguments or transient data.
    pub fn new(
        channel_id: impl Into<String>,
        tx_id: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            tx_id: tx_id.into(),
            function: function.into(),
            ..Self::default()
        }
    }

    /// Replace the arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add one transient entry.
    pub fn with_transient(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.transient.insert(key.into(), value.into());
        self
    }

    /// The registry key for this transaction.
    pub fn key(&self) -> TransactionKey {
        TransactionKey::new(&self.channel_id, &self.tx_id)
    }

    fn to_request(&self) -> InvokeTransactionRequest {
        InvokeTransactionRequest {
            context: Some(TransactionContext::new(&self.channel_id, &self.tx_id)),
            transaction_name: self.function.clone(),
            args: self.args.iter().map(|arg| arg.as_bytes().to_vec()).collect(),
            transient_args: self.transient.clone(),
        }
    }
}

/// Runs transactions against pooled guest instances.
pub struct ContractHost<F: ExecutorFactory> {
    registry: Arc<ContextRegistry>,
    pool: InstancePool<F>,
    acquire_timeout: Duration,
}

/// A contract host backed by a wasm module.
pub type WasmChaincode = ContractHost<WapcModule>;

impl<F: ExecutorFactory + 'static> ContractHost<F> {
    /// Create a host whose guests resolve ledger handles through `registry`.
    ///
    /// `factory` must produce executors whose host calls reach a
    /// [`LedgerRouter`] over the same registry.
    pub fn new(registry: Arc<ContextRegistry>, factory: F, config: &HostConfig) -> Result<Self> {
        config.validate()?;
        let pool = InstancePool::new(factory, config.pool_size)?;
        Ok(Self {
            registry,
            pool,
            acquire_timeout: config.acquire_timeout,
        })
    }

    /// The chaincode `Init` entry point. Contracts need no initialization.
    pub fn init(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Run one transaction with `ledger` as its handle.
    ///
    /// Returns the guest's response payload.
    pub async fn invoke(&self, ledger: Arc<dyn Ledger>, invocation: Invocation) -> Result<Vec<u8>> {
        let span = info_span!(
            "transaction",
            channel = %invocation.channel_id,
            tx_id = %invocation.tx_id,
            function = %invocation.function,
        );
        self.run(ledger, invocation).instrument(span).await
    }

    async fn run(&self, ledger: Arc<dyn Ledger>, invocation: Invocation) -> Result<Vec<u8>> {
        let registration = self
            .registry
            .register(invocation.key(), ledger)
            .map_err(|e| {
                error!(error = %e, "cannot register transaction");
                e
            })?;

        let result = self.execute(registration, &invocation).await;

        match &result {
            Ok(payload) => debug!(payload_len = payload.len(), "transaction complete"),
            Err(e) => debug!(error = %e, "transaction failed"),
        }
        result
    }

    async fn execute(
        &self,
        registration: Registration,
        invocation: &Invocation,
    ) -> Result<Vec<u8>> {
        let request = encode(&invocation.to_request());
        let executor = self.pool.acquire(self.acquire_timeout).await?;

        // The registration travels with the guest: if the caller stops
        // waiting, the blocking task still owns it, so the key stays taken
        // until the guest can no longer place host calls.
        let span = Span::current();
        let response = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let response = run_guest(executor, &request);
            registration.deregister();
            response
        })
        .await
        .map_err(|e| ExecutorError::Panicked(e.to_string()))??;

        let response: InvokeTransactionResponse = decode(&response)?;
        Ok(response.payload)
    }

    /// The registry transactions are registered in.
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// Instances not currently running a transaction.
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Stop accepting transactions. Running ones complete.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Run the guest's entry operation and settle the instance.
///
/// A panic is contained here so the instance can be discarded rather than
/// handed back by the guard's drop.
fn run_guest<F: ExecutorFactory>(
    mut executor: PooledExecutor<F>,
    request: &[u8],
) -> std::result::Result<Vec<u8>, ExecutorError> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        executor.invoke(INVOKE_TRANSACTION, request)
    }))
    .unwrap_or_else(|panic| Err(ExecutorError::Panicked(panic_message(panic.as_ref()))));

    match &result {
        Err(e) if e.is_fatal() => {
            error!(error = %e, "guest faulted");
            executor.discard();
        }
        _ => {
            if let Err(e) = executor.release() {
                warn!(error = %e, "error returning wasm instance to pool");
            }
        }
    }
    result
}

impl WasmChaincode {
    /// Load the configured module and wire registry, router and pool.
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        let bytes = std::fs::read(config.require_module_path()?)?;
        Self::from_module_bytes(&bytes, config)
    }

    /// Like [`WasmChaincode::from_config`] with the module given directly.
    pub fn from_module_bytes(bytes: &[u8], config: &HostConfig) -> Result<Self> {
        let registry = Arc::new(ContextRegistry::new());
        let router = Arc::new(LedgerRouter::new(Arc::clone(&registry)));
        let module = WapcModule::new(bytes, router)?;
        Self::new(registry, module, config)
    }
}
