//! Ledger call router.
//!
//! Guest code reaches the ledger by placing host calls with binding
//! `"wapc"` and namespace `"LedgerService"`. The router decodes each call,
//! resolves the calling transaction's ledger handle through the
//! [`ContextRegistry`], performs the operation and encodes the response.
//!
//! ## Collections
//!
//! Every request may name a private collection. A request either goes
//! entirely through the collection primitives of the [`Ledger`] or entirely
//! through the world state primitives; the choice is made once per request
//! in [`Scope::of`] and every ledger access and error message flows from
//! that one value.
//!
//! ## Fault containment
//!
//! [`LedgerRouter::route`] never unwinds. A panic while servicing a call
//! (from a ledger implementation, or from a payload that trips an internal
//! invariant) is caught and returned as [`RouterError::Panicked`], so a
//! faulty guest fails its own transaction and nothing else.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};
use wasmcc_ledger::{Ledger, LedgerError, StateQueryIterator, StateRecord};
use wasmcc_protocol::{
    decode, encode, get_states_request, CreateStateRequest, ExistsStateRequest,
    ExistsStateResponse, GetHashRequest, GetHashResponse, GetStatesRequest, GetStatesResponse,
    KeyRangeQuery, LedgerOperation, LedgerRequest, ReadStateRequest, ReadStateResponse, State,
    UpdateStateRequest, BINDING, LEDGER_NAMESPACE,
};

use crate::error::RouterError;
use crate::executor::{panic_message, HostCallHandler};
use crate::registry::{ContextRegistry, TransactionKey};

const GET_STATES_BY_RANGE: &str = "GetStates (ByKeyRange)";

/// Where a request's ledger access goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope<'a> {
    World,
    Collection(&'a str),
}

impl<'a> Scope<'a> {
    fn of<R: LedgerRequest>(request: &'a R) -> Self {
        match request.collection_name() {
            Some(name) => Scope::Collection(name),
            None => Scope::World,
        }
    }

    fn get(&self, ledger: &dyn Ledger, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        match self {
            Scope::World => ledger.get_state(key),
            Scope::Collection(name) => ledger.get_private_data(name, key),
        }
    }

    fn put(&self, ledger: &dyn Ledger, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        match self {
            Scope::World => ledger.put_state(key, value),
            Scope::Collection(name) => ledger.put_private_data(name, key, value),
        }
    }

    fn range(
        &self,
        ledger: &dyn Ledger,
        query: &KeyRangeQuery,
    ) -> Result<Box<dyn StateQueryIterator>, LedgerError> {
        match self {
            Scope::World => ledger.get_state_by_range(&query.start_key, &query.end_key),
            Scope::Collection(name) => {
                ledger.get_private_data_by_range(name, &query.start_key, &query.end_key)
            }
        }
    }

    fn fail(&self, operation: &'static str, reason: impl ToString) -> RouterError {
        RouterError::Failed {
            operation,
            collection: match self {
                Scope::World => None,
                Scope::Collection(name) => Some(name.to_string()),
            },
            reason: reason.to_string(),
        }
    }
}

/// Closes a query iterator exactly once, however iteration ends.
struct ClosingIterator {
    inner: Box<dyn StateQueryIterator>,
}

impl ClosingIterator {
    fn next_state(&mut self) -> Option<Result<StateRecord, LedgerError>> {
        self.inner.next_state()
    }
}

impl Drop for ClosingIterator {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            warn!(error = %e, "error closing range query iterator");
        }
    }
}

/// Routes guest host calls to the ledger.
pub struct LedgerRouter {
    registry: Arc<ContextRegistry>,
}

impl LedgerRouter {
    /// Create a router that resolves handles through `registry`.
    pub fn new(registry: Arc<ContextRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this router resolves handles through.
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// Service one host call.
    ///
    /// Only binding `"wapc"` with namespace `"LedgerService"` is served.
    /// Anything else, or an unknown operation, is
    /// [`RouterError::NotSupported`].
    pub fn route(
        &self,
        binding: &str,
        namespace: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RouterError> {
        debug!(
            binding,
            namespace,
            operation,
            payload_len = payload.len(),
            "host call"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(binding, namespace, operation, payload)
        }));

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    binding,
                    namespace,
                    operation,
                    panic = %panic_message(panic.as_ref()),
                    "recovered from panic in host call"
                );
                Err(RouterError::Panicked {
                    binding: binding.to_string(),
                    namespace: namespace.to_string(),
                    operation: operation.to_string(),
                })
            }
        }
    }

    fn dispatch(
        &self,
        binding: &str,
        namespace: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RouterError> {
        let op = match LedgerOperation::from_name(operation) {
            Some(op) if binding == BINDING && namespace == LEDGER_NAMESPACE => op,
            _ => {
                return Err(RouterError::NotSupported {
                    binding: binding.to_string(),
                    namespace: namespace.to_string(),
                    operation: operation.to_string(),
                })
            }
        };

        match op {
            LedgerOperation::CreateState => self.create_state(decode(payload)?),
            LedgerOperation::ReadState => self.read_state(decode(payload)?),
            LedgerOperation::UpdateState => self.update_state(decode(payload)?),
            LedgerOperation::ExistsState => self.exists_state(decode(payload)?),
            LedgerOperation::GetHash => self.get_hash(decode(payload)?),
            LedgerOperation::GetStates => self.get_states(decode(payload)?),
        }
    }

    /// Resolve the ledger handle for the transaction a request belongs to.
    fn handle<R: LedgerRequest>(
        &self,
        operation: &'static str,
        request: &R,
    ) -> Result<Arc<dyn Ledger>, RouterError> {
        let fail = |reason: String| RouterError::Failed {
            operation,
            collection: None,
            reason,
        };
        let context = request
            .context()
            .ok_or_else(|| fail("missing transaction context".to_string()))?;
        self.registry
            .get(&TransactionKey::from(context))
            .map_err(|e| fail(e.to_string()))
    }

    /// Channel and transaction id of a resolved request, for log fields.
    fn ids<R: LedgerRequest>(request: &R) -> (&str, &str) {
        request.context().map_or(("", ""), |context| {
            (context.channel_id.as_str(), context.transaction_id.as_str())
        })
    }

    fn create_state(&self, request: CreateStateRequest) -> Result<Vec<u8>, RouterError> {
        const OP: &str = "CreateState";
        let ledger = self.handle(OP, &request)?;
        let scope = Scope::of(&request);
        let state = request.state.clone().unwrap_or_default();
        let (channel, tx_id) = Self::ids(&request);
        debug!(
            channel,
            tx_id,
            key = %state.key,
            value_len = state.value.len(),
            ?scope,
            "CreateState"
        );

        let existing = scope.get(ledger.as_ref(), &state.key).map_err(|e| scope.fail(OP, e))?;
        if existing.is_some() {
            return Err(scope.fail(OP, format!("State already exists for key {}", state.key)));
        }
        scope
            .put(ledger.as_ref(), &state.key, &state.value)
            .map_err(|e| scope.fail(OP, e))?;

        debug!("CreateState done");
        Ok(Vec::new())
    }

    fn update_state(&self, request: UpdateStateRequest) -> Result<Vec<u8>, RouterError> {
        const OP: &str = "UpdateState";
        let ledger = self.handle(OP, &request)?;
        let scope = Scope::of(&request);
        let state = request.state.clone().unwrap_or_default();
        let (channel, tx_id) = Self::ids(&request);
        debug!(
            channel,
            tx_id,
            key = %state.key,
            value_len = state.value.len(),
            ?scope,
            "UpdateState"
        );

        let existing = scope.get(ledger.as_ref(), &state.key).map_err(|e| scope.fail(OP, e))?;
        if existing.is_none() {
            return Err(scope.fail(OP, format!("No state exists for key {}", state.key)));
        }
        scope
            .put(ledger.as_ref(), &state.key, &state.value)
            .map_err(|e| scope.fail(OP, e))?;

        debug!("UpdateState done");
        Ok(Vec::new())
    }

    fn read_state(&self, request: ReadStateRequest) -> Result<Vec<u8>, RouterError> {
        const OP: &str = "ReadState";
        let ledger = self.handle(OP, &request)?;
        let scope = Scope::of(&request);
        let key = request.state_key.as_str();
        let (channel, tx_id) = Self::ids(&request);
        debug!(channel, tx_id, key, ?scope, "ReadState");

        let value = scope
            .get(ledger.as_ref(), key)
            .map_err(|e| scope.fail(OP, e))?
            .ok_or_else(|| scope.fail(OP, format!("State {} does not exist", key)))?;

        debug!("ReadState done");
        Ok(encode(&ReadStateResponse {
            state: Some(State::new(key, value)),
        }))
    }

    fn exists_state(&self, request: ExistsStateRequest) -> Result<Vec<u8>, RouterError> {
        const OP: &str = "ExistsState";
        let ledger = self.handle(OP, &request)?;
        let scope = Scope::of(&request);
        let key = request.state_key.as_str();
        let (channel, tx_id) = Self::ids(&request);
        debug!(channel, tx_id, key, ?scope, "ExistsState");

        let exists = scope
            .get(ledger.as_ref(), key)
            .map_err(|e| scope.fail(OP, e))?
            .is_some();

        debug!(exists, "ExistsState done");
        Ok(encode(&ExistsStateResponse { exists }))
    }

    fn get_hash(&self, request: GetHashRequest) -> Result<Vec<u8>, RouterError> {
        const OP: &str = "GetHash";
        let ledger = self.handle(OP, &request)?;
        let key = request.state_key.as_str();
        let scope = Scope::of(&request);
        let (channel, tx_id) = Self::ids(&request);
        debug!(channel, tx_id, key, ?scope, "GetHash");

        let collection = match scope {
            Scope::Collection(name) => name,
            Scope::World => return Err(scope.fail(OP, "Operation not supported for world state")),
        };

        let hash = ledger
            .get_private_data_hash(collection, key)
            .map_err(|e| scope.fail(OP, e))?
            .ok_or_else(|| scope.fail(OP, format!("State {} does not exist", key)))?;

        debug!("GetHash done");
        Ok(encode(&GetHashResponse { hash }))
    }

    fn get_states(&self, request: GetStatesRequest) -> Result<Vec<u8>, RouterError> {
        const OP: &str = "GetStates";
        let ledger = self.handle(OP, &request)?;
        let scope = Scope::of(&request);
        let (channel, tx_id) = Self::ids(&request);
        debug!(channel, tx_id, ?scope, "GetStates");

        match &request.query {
            Some(get_states_request::Query::ByKeyRange(query)) => {
                self.get_states_by_key_range(ledger.as_ref(), scope, query)
            }
            None => Err(RouterError::Failed {
                operation: OP,
                collection: None,
                reason: "unsupported query type".to_string(),
            }),
        }
    }

    fn get_states_by_key_range(
        &self,
        ledger: &dyn Ledger,
        scope: Scope<'_>,
        query: &KeyRangeQuery,
    ) -> Result<Vec<u8>, RouterError> {
        debug!(
            start_key = %query.start_key,
            end_key = %query.end_key,
            "GetStates (ByKeyRange)"
        );

        let mut results = ClosingIterator {
            inner: scope
                .range(ledger, query)
                .map_err(|e| scope.fail(GET_STATES_BY_RANGE, e))?,
        };

        let mut states = Vec::new();
        while let Some(next) = results.next_state() {
            let record = next.map_err(|e| scope.fail(GET_STATES_BY_RANGE, e))?;
            states.push(State::new(record.key, record.value));
        }

        debug!(results = states.len(), "GetStates (ByKeyRange) done");
        Ok(encode(&GetStatesResponse { states }))
    }
}

impl HostCallHandler for LedgerRouter {
    fn host_call(
        &self,
        binding: &str,
        namespace: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, String> {
        self.route(binding, namespace, operation, payload)
            .map_err(|e| e.to_string())
    }
}
