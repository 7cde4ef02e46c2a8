//! # wasmcc runtime
//!
//! Host side of chaincode compiled to wasm. A transaction comes in with a
//! ledger handle; the host runs the contract in a sandboxed guest instance,
//! and every ledger read or write the guest makes comes back to the host as
//! a host call that is resolved against that transaction's handle.
//!
//! ## Core Concepts
//!
//! ### Context Registry
//!
//! Guests never hold a ledger handle. The [`ContextRegistry`] maps each
//! in-flight transaction, keyed by `(channel id, transaction id)`, to its
//! handle for exactly as long as the transaction runs. Host calls carry the
//! transaction context, and the router looks the handle up by it. Because
//! the registry rejects duplicate keys, concurrent transactions can never
//! reach each other's state.
//!
//! ### Ledger Call Router
//!
//! The [`LedgerRouter`] services guest host calls in the `"wapc"` binding
//! and `"LedgerService"` namespace: create, read, update and existence
//! checks on state, private data hashes and key range queries, each either
//! on world state or on a named private collection. It never unwinds; a
//! panic while servicing a call becomes an error for that call alone.
//!
//! ### Instance Pool
//!
//! Guest instances are expensive to create and single-threaded to run. The
//! [`InstancePool`] keeps a fixed number of them and hands each to one
//! transaction at a time, with a bounded wait.
//!
//! ### Contract Host
//!
//! [`ContractHost`] ties the pieces together for one transaction: register,
//! acquire, invoke, release, deregister. [`WasmChaincode`] is the host
//! backed by a real wasm module through the waPC calling convention.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wasmcc_ledger::MemoryLedger;
//! use wasmcc_runtime::{HostConfig, Invocation, WasmChaincode};
//!
//! let host = WasmChaincode::from_config(&HostConfig::from_env()?)?;
//! let ledger = Arc::new(MemoryLedger::new());
//!
//! let invocation = Invocation::new("mychannel", "tx1", "CreateAsset").with_args(["007", "bond"]);
//! let payload = host.invoke(ledger, invocation).await?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   invoke(ledger, invocation)
//!        │
//!        ▼
//! ┌───────────────┐ register  ┌──────────────────┐
//! │ ContractHost  │──────────▶│ ContextRegistry  │◀─────────┐
//! └───────┬───────┘           └──────────────────┘          │ get
//!         │ acquire                                 ┌───────┴───────┐
//!         ▼                                         │ LedgerRouter  │
//! ┌───────────────┐ InvokeTransaction ┌─────────┐   └───────▲───────┘
//! │ InstancePool  │──────────────────▶│  guest  │───────────┘
//! └───────────────┘                   └─────────┘ __host_call
//! ```

pub mod config;
pub mod contract;
pub mod error;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod router;
pub mod wapc;

pub use config::HostConfig;
pub use contract::{ContractHost, Invocation, WasmChaincode};
pub use error::{ExecutorError, PoolError, RegistryError, Result, RouterError, RuntimeError};
pub use executor::{ExecutorFactory, GuestExecutor, HostCallHandler};
pub use pool::{InstancePool, PooledExecutor};
pub use registry::{ContextRegistry, Registration, TransactionKey};
pub use router::LedgerRouter;
pub use wapc::{WapcInstance, WapcModule};
