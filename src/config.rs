//! # Configuration
//!
//! Protocol constants grouped by concern, plus the [`Params`] value that the
//! keepers thread through every call. `Params` is immutable: an update
//! replaces the whole value.

use crate::error::{LendingError, LendingResult};
use bitcoin::Network;
use serde::{Deserialize, Serialize};

/// Bitcoin transaction constants
pub mod bitcoin_tx {
    /// Outputs below this value are rejected as dust.
    pub const DUST_THRESHOLD_SATS: u64 = 546;

    /// Maximum standard transaction weight.
    pub const MAX_TRANSACTION_WEIGHT: u64 = 400_000;

    /// Schnorr signature with the default sighash type.
    pub const SCHNORR_SIG_SIZE: usize = 64;

    /// Schnorr signature carrying an explicit sighash byte.
    pub const SCHNORR_SIG_WITH_SIGHASH_SIZE: usize = 65;

    /// Default transaction version for CETs.
    pub const TX_VERSION: i32 = 2;
}

/// Lending constants
pub mod lending {
    /// Seconds in a (non-leap) year, used by interest math.
    pub const SECONDS_PER_YEAR: u64 = 365 * 24 * 3600;

    /// Denominator of per-mille factors (APR, LTV, fees).
    pub const PERMILLE: u64 = 1000;

    /// Initial borrow index of every tranche.
    pub const INITIAL_BORROW_INDEX: &str = "1";
}

/// Oracle constants
pub mod oracle {
    /// Outcome placeholders of a freshly created lending event, in the order
    /// liquidated, default-liquidated, repaid.
    pub const LENDING_EVENT_OUTCOMES: [&str; 3] = ["", "default_liquidated", "repaid"];

    /// Outcome index of a price-based liquidation.
    pub const OUTCOME_LIQUIDATED: usize = 0;

    /// Outcome index of a maturity default.
    pub const OUTCOME_DEFAULT_LIQUIDATED: usize = 1;

    /// Outcome index of a repayment.
    pub const OUTCOME_REPAID: usize = 2;
}

/// Environment variable names
pub mod env {
    /// Path to a JSON params file overriding the defaults
    pub const PARAMS_FILE: &str = "DLC_LENDING_PARAMS";

    /// Bitcoin network override (bitcoin, testnet, signet, regtest)
    pub const NETWORK: &str = "DLC_LENDING_NETWORK";
}

/// Module identifiers used when routing threshold-signing callbacks.
pub mod modules {
    pub const LENDING: &str = "lending";
    pub const DLC: &str = "dlc";
}

/// Protocol parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Network used to encode vault addresses
    pub network: Network,

    /// Number of blocks produced per year, used by borrow-index accrual
    pub blocks_per_year: u64,

    /// Minimum number of confirmations for deposit transactions
    pub confirmation_depth: u32,

    /// Fee rate (sat/vB) validity window in seconds
    pub fee_rate_validity_period: u64,

    /// Seconds added to the loan maturity to obtain the final refund timeout
    pub final_timeout_duration: u64,

    /// Referral fee factor ceiling (per-mille)
    pub max_referral_fee_factor: u64,

    /// Protocol fee collector identity
    pub protocol_fee_collector: String,

    /// Allowed DKG participants for oracles and nonces (consensus identities)
    pub oracle_participants: Vec<String>,

    /// Number of participants selected for a nonce batch
    pub oracle_participant_num: usize,

    /// Signing threshold among the selected oracle participants
    pub oracle_threshold: usize,

    /// Number of nonces requested per nonce-generation batch
    pub nonce_batch_size: u32,

    /// A new batch is requested when fewer pending lending events remain
    pub nonce_queue_threshold: usize,

    /// Timeout (seconds) attached to every DKG request
    pub dkg_timeout_duration: u64,

    /// Significant digits kept when normalizing oracle prices
    pub price_significant_digits: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            network: Network::Signet,
            blocks_per_year: 5_256_000,
            confirmation_depth: 1,
            fee_rate_validity_period: 600,
            final_timeout_duration: 30 * 24 * 3600,
            max_referral_fee_factor: 500,
            protocol_fee_collector: "protocol_fee_collector".to_string(),
            oracle_participants: Vec::new(),
            oracle_participant_num: 3,
            oracle_threshold: 2,
            nonce_batch_size: 10,
            nonce_queue_threshold: 5,
            dkg_timeout_duration: 86_400,
            price_significant_digits: 6,
        }
    }
}

impl Params {
    /// Check internal consistency of the parameters.
    pub fn validate(&self) -> LendingResult<()> {
        if self.blocks_per_year == 0 {
            return Err(LendingError::validation("blocks_per_year must be positive"));
        }
        if self.oracle_participant_num == 0 {
            return Err(LendingError::validation(
                "oracle_participant_num must be positive",
            ));
        }
        if self.oracle_threshold == 0 || self.oracle_threshold > self.oracle_participant_num {
            return Err(LendingError::validation(format!(
                "oracle threshold {} must be in 1..={}",
                self.oracle_threshold, self.oracle_participant_num
            )));
        }
        if self.max_referral_fee_factor > crate::config::lending::PERMILLE {
            return Err(LendingError::validation(
                "max_referral_fee_factor must not exceed 1000",
            ));
        }
        if self.price_significant_digits == 0 || self.price_significant_digits > 18 {
            return Err(LendingError::validation(
                "price_significant_digits must be in 1..=18",
            ));
        }
        Ok(())
    }

    /// Load parameters from a JSON file and validate them.
    pub fn load_from_file(filename: &str) -> LendingResult<Self> {
        let json = std::fs::read_to_string(filename)?;
        let params: Params = serde_json::from_str(&json)?;
        params.validate()?;
        Ok(params)
    }

    /// Load parameters from the environment (`.env` honoured), falling back to
    /// the defaults.
    pub fn from_env() -> LendingResult<Self> {
        dotenv::dotenv().ok();

        let mut params = match std::env::var(env::PARAMS_FILE) {
            Ok(path) => Self::load_from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(network) = std::env::var(env::NETWORK) {
            params.network = network
                .parse::<Network>()
                .map_err(|e| LendingError::validation(format!("invalid network: {}", e)))?;
        }

        params.validate()?;
        Ok(params)
    }
}
