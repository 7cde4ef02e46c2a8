//! # wasmcc-ledger
//!
//! The ledger as seen from a chaincode host: a transaction-scoped handle that
//! can read and write world state, read and write named private collections,
//! and run key range queries.
//!
//! Hosts never talk to a concrete ledger. They receive an
//! `Arc<dyn Ledger>` for each transaction and route guest requests through
//! it. [`MemoryLedger`] is an ordered in-process implementation for tests and
//! local runs.
//!
//! ## Example
//!
//! ```rust
//! use wasmcc_ledger::{Ledger, MemoryLedger};
//!
//! let ledger = MemoryLedger::new();
//! ledger.put_state("007", b"bond").unwrap();
//!
//! assert_eq!(ledger.get_state("007").unwrap(), Some(b"bond".to_vec()));
//! assert_eq!(ledger.get_state("008").unwrap(), None);
//! ```

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{LedgerError, Result};
pub use memory::{IteratorStats, MemoryLedger};
pub use traits::{Ledger, StateQueryIterator, StateRecord};
