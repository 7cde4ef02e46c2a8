//! # wasmcc-protocol
//!
//! Messages exchanged between a chaincode host and its wasm guest.
//!
//! The host calls the guest's `InvokeTransaction` operation with an
//! [`InvokeTransactionRequest`]. While running, the guest calls back into the
//! host with binding `"wapc"`, namespace `"LedgerService"` and one of the
//! [`LedgerOperation`]s, each carrying its own request message.
//!
//! All messages are protobuf encoded. Field numbers follow the contract
//! package of the Fabric ledger protos so existing guests interoperate.
//!
//! ## Collections
//!
//! Requests that touch state carry an optional [`Collection`]. A missing
//! collection and a collection with an empty name both mean world state;
//! use [`LedgerRequest::collection_name`] rather than inspecting the field.

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, ProtocolError};
pub use messages::*;

/// Binding name guests use for host calls.
pub const BINDING: &str = "wapc";

/// Namespace of the ledger service.
pub const LEDGER_NAMESPACE: &str = "LedgerService";

/// Guest operation that runs one transaction.
pub const INVOKE_TRANSACTION: &str = "InvokeTransaction";

/// Ledger operations a guest may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOperation {
    CreateState,
    ReadState,
    UpdateState,
    ExistsState,
    GetHash,
    GetStates,
}

impl LedgerOperation {
    /// All operations, in dispatch order.
    pub const ALL: [LedgerOperation; 6] = [
        LedgerOperation::CreateState,
        LedgerOperation::ReadState,
        LedgerOperation::UpdateState,
        LedgerOperation::ExistsState,
        LedgerOperation::GetHash,
        LedgerOperation::GetStates,
    ];

    /// Look up an operation by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    /// The wire name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOperation::CreateState => "CreateState",
            LedgerOperation::ReadState => "ReadState",
            LedgerOperation::UpdateState => "UpdateState",
            LedgerOperation::ExistsState => "ExistsState",
            LedgerOperation::GetHash => "GetHash",
            LedgerOperation::GetStates => "GetStates",
        }
    }
}

impl std::fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
