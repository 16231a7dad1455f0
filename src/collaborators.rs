//! # External Collaborators
//!
//! The settlement core consumes four services it does not implement: the
//! store (see [`crate::store`]), a price oracle, the bridge ledger and the
//! threshold-signing (DKG/TSS) network. This module holds their contracts,
//! the request/response types exchanged with the signing network, and the
//! callback table that routes asynchronous completions to the module that
//! asked for them.

use crate::config::Params;
use crate::error::{LendingError, LendingResult};
use crate::store::Store;
use bitcoin::Transaction;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Price feed keyed by asset pair symbol.
pub trait PriceOracle {
    fn get_price(&self, pair: &str) -> LendingResult<Decimal>;
}

/// A fee rate quote from the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate {
    pub sat_per_vbyte: u64,
    /// Unix time of the last update
    pub updated_at: i64,
}

/// Bitcoin-side bookkeeping provided by the bridge module.
pub trait BridgeLedger {
    /// Check inclusion and confirmations of `raw_tx`, returning the decoded
    /// transaction and, when known, the transaction it spends from.
    fn validate_transaction(
        &self,
        raw_tx: &str,
        block_hash: &str,
        proof: &[String],
        confirmation_depth: u32,
    ) -> LendingResult<(Transaction, Option<Transaction>)>;

    fn get_fee_rate(&self) -> LendingResult<FeeRate>;

    /// Reject fee rates that are zero or older than the validity window.
    fn check_fee_rate(&self, rate: &FeeRate, now: i64, validity_period: u64) -> LendingResult<()> {
        if rate.sat_per_vbyte == 0 {
            return Err(LendingError::validation("fee rate is zero"));
        }
        if now.saturating_sub(rate.updated_at) > validity_period as i64 {
            return Err(LendingError::state("fee rate", "fresh", format!("updated at {}", rate.updated_at)));
        }
        Ok(())
    }
}

/// What a DKG round is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DkgIntent {
    /// Aggregate key of a custodian committee
    Dcm,
    /// Long-term oracle key
    Oracle,
    /// Batch of one-time oracle nonces
    Nonce,
}

impl fmt::Display for DkgIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkgIntent::Dcm => write!(f, "dcm"),
            DkgIntent::Oracle => write!(f, "oracle"),
            DkgIntent::Nonce => write!(f, "nonce"),
        }
    }
}

/// Key generation request sent to the signing network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgRequest {
    pub module: String,
    pub intent: DkgIntent,
    pub participants: Vec<String>,
    pub threshold: usize,
    /// Number of keys to generate (nonce batches)
    pub batch_size: u32,
    pub expiration_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningType {
    /// BIP-340 signature with a fresh nonce
    Schnorr,
    /// BIP-340 signature with a pre-committed nonce (oracle attestations)
    SchnorrWithCommitment,
    /// Adaptor signature under a given point
    SchnorrAdaptor,
}

/// Purpose of a signing request, echoed back on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningIntent {
    DlcAttestation,
    LiquidationCet,
    DefaultLiquidationCet,
    RepaymentCet,
    Redemption,
}

impl fmt::Display for SigningIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SigningIntent::DlcAttestation => "dlc_attestation",
            SigningIntent::LiquidationCet => "liquidation_cet",
            SigningIntent::DefaultLiquidationCet => "default_liquidation_cet",
            SigningIntent::RepaymentCet => "repayment_cet",
            SigningIntent::Redemption => "redemption",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningOptions {
    /// Pre-committed nonce (x-only hex)
    pub nonce: Option<String>,
    /// Adaptor point (compressed hex)
    pub adaptor_point: Option<String>,
}

/// Signing request sent to the threshold-signing network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub module: String,
    /// Loan id, event id or redemption id the request belongs to
    pub scope_id: String,
    pub signing_type: SigningType,
    pub intent: SigningIntent,
    /// Signing key (x-only hex)
    pub pub_key: String,
    /// Messages to sign (hex)
    pub sig_hashes: Vec<String>,
    pub options: SigningOptions,
}

/// Threshold-signing / DKG network. Requests are answered asynchronously
/// through [`CallbackEvent`]s.
pub trait ThresholdSigning {
    /// Start a DKG round and return its id.
    fn initiate_dkg(&mut self, request: DkgRequest) -> LendingResult<u64>;

    /// Start a signing round and return its id.
    fn initiate_signing_request(&mut self, request: SigningRequest) -> LendingResult<u64>;
}

/// Completion notifications delivered by the signing network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackEvent {
    /// One participant submitted its share of a DKG round
    DkgCompletionReceived { dkg_id: u64, participant: String },
    /// A DKG round finished with the generated public keys
    DkgCompleted { dkg_id: u64, pub_keys: Vec<String> },
    /// A DKG round expired before enough participants answered
    DkgTimeout {
        dkg_id: u64,
        absent_participants: Vec<String>,
    },
    /// A signing round finished
    SigningCompleted {
        request_id: u64,
        scope_id: String,
        intent: SigningIntent,
        signatures: Vec<String>,
    },
    /// A signing round expired without a signature
    SigningTimeout {
        request_id: u64,
        scope_id: String,
        intent: SigningIntent,
    },
}

impl CallbackEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CallbackEvent::DkgCompletionReceived { .. } => "dkg_completion_received",
            CallbackEvent::DkgCompleted { .. } => "dkg_completed",
            CallbackEvent::DkgTimeout { .. } => "dkg_timeout",
            CallbackEvent::SigningCompleted { .. } => "signing_completed",
            CallbackEvent::SigningTimeout { .. } => "signing_timeout",
        }
    }
}

/// Everything an operation may touch, borrowed for one atomic batch.
pub struct Context<'a> {
    pub store: &'a mut dyn Store,
    pub params: &'a Params,
    pub prices: &'a dyn PriceOracle,
    pub bridge: &'a dyn BridgeLedger,
    pub signer: &'a mut dyn ThresholdSigning,
    /// Block time of the current tick or message, unix seconds
    pub now: i64,
}

/// Receiver of collaborator callbacks for one module.
pub trait CallbackHandler {
    fn handle(&self, ctx: &mut Context<'_>, event: &CallbackEvent) -> LendingResult<()>;
}

/// Module name → handler table.
#[derive(Default)]
pub struct CallbackRouter {
    handlers: BTreeMap<String, Box<dyn CallbackHandler>>,
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: &str, handler: Box<dyn CallbackHandler>) -> LendingResult<()> {
        if self.handlers.contains_key(module) {
            return Err(LendingError::conflict(format!(
                "callback handler already registered for module {}",
                module
            )));
        }
        self.handlers.insert(module.to_string(), handler);
        Ok(())
    }

    pub fn dispatch(&self, module: &str, ctx: &mut Context<'_>, event: &CallbackEvent) -> LendingResult<()> {
        let handler = self
            .handlers
            .get(module)
            .ok_or_else(|| LendingError::not_found("callback handler", module))?;
        debug!("dispatching {} to module {}", event.kind(), module);
        handler.handle(ctx, event)
    }

    pub fn modules(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, StoreExt};
    use crate::testing::{FixedPriceOracle, MockBridge, RecordingSigner};

    struct Counter;

    impl CallbackHandler for Counter {
        fn handle(&self, ctx: &mut Context<'_>, _event: &CallbackEvent) -> LendingResult<()> {
            ctx.store.next_sequence(b"calls")?;
            Ok(())
        }
    }

    #[test]
    fn test_router_dispatch_by_module() {
        let mut router = CallbackRouter::new();
        router.register("lending", Box::new(Counter)).unwrap();
        assert!(router.register("lending", Box::new(Counter)).is_err());

        let mut store = MemStore::new();
        let params = Params::default();
        let prices = FixedPriceOracle::new();
        let bridge = MockBridge::new(1, 0);
        let mut signer = RecordingSigner::new();
        let mut ctx = Context {
            store: &mut store,
            params: &params,
            prices: &prices,
            bridge: &bridge,
            signer: &mut signer,
            now: 0,
        };

        let event = CallbackEvent::DkgTimeout {
            dkg_id: 1,
            absent_participants: vec![],
        };
        router.dispatch("lending", &mut ctx, &event).unwrap();
        assert!(matches!(
            router.dispatch("unknown", &mut ctx, &event),
            Err(LendingError::NotFound { .. })
        ));
        assert_eq!(store.next_sequence(b"calls").unwrap(), 2);
    }

    #[test]
    fn test_stale_fee_rate_rejected() {
        let bridge = MockBridge::new(5, 1_000);
        let rate = bridge.get_fee_rate().unwrap();
        assert!(bridge.check_fee_rate(&rate, 1_100, 600).is_ok());
        assert!(bridge.check_fee_rate(&rate, 2_000, 600).is_err());
    }
}
