//! # DLC Lending: Bitcoin-Collateralized Loans Settled On-Chain
//!
//! Core library for loans whose BTC collateral sits in a taproot vault shared
//! between the borrower and a threshold custodian committee (DCM). Every
//! settlement path is pre-signed at origination as a Contract Execution
//! Transaction (CET), and DLC oracle attestations unlock the right one
//! through Schnorr adaptor signatures.
//!
//! The [`engine::Engine`] drives messages, signing-network callbacks and
//! block ticks atomically over a pluggable key-value [`store::Store`].

pub mod adaptor;
pub mod cet;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod lending;
pub mod oracle;
pub mod schnorr;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod vault;

// Re-export commonly used types
pub use config::Params;
pub use engine::{Engine, TickReport};
pub use error::{LendingError, LendingResult};
pub use lending::{Loan, LoanStatus};
pub use store::{MemStore, Store};
pub use vault::{build_vault, VaultScripts};
