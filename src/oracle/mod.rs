//! # DLC Oracle Module
//!
//! Oracle keys, one-time nonces, outcome events and attestations.
//!
//! ## Event Lifecycle
//!
//! ```text
//! nonce generated → pending (lending queue) → active (bound) → triggered → attested
//! ```
//!
//! Price and date events skip the queue: they are bound and triggered in the
//! same step.

pub mod callbacks;
pub mod keeper;
pub mod types;

#[cfg(test)]
mod tests;

pub use callbacks::DlcCallbacks;
pub use types::*;
