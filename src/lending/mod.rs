//! # Lending Module
//!
//! Loans collateralized by bitcoin locked in taproot vaults and settled
//! through DLC attestations.
//!
//! ## Lifecycle
//!
//! - **Apply**: derive the vault and bind a lending event
//! - **Submit CETs**: verify the borrower's pre-signed settlement transactions
//! - **Tick**: disburse, monitor prices, liquidate, default and settle
//! - **Repay / Redeem / Cancel**: borrower exits before or after disbursement

pub mod bank;
pub mod callbacks;
pub mod keeper;
pub mod loan;
pub mod math;
pub mod pool;
pub mod queries;
pub mod tick;
pub mod types;

#[cfg(test)]
mod tests;

pub use callbacks::LendingCallbacks;
pub use loan::{ApplyRequest, DepositRequest, RedeemRequest, SubmitCetsRequest};
pub use queries::CetInfo;
pub use types::*;
