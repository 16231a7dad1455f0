use crate::collaborators::SigningIntent;
use crate::store::{be, Indexed};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Loan lifecycle.
///
/// ```text
/// Requested → Authorized → Open | Rejected | Cancelled
/// Open → Repaid | Defaulted | Liquidated
/// Repaid → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Requested,
    Authorized,
    Open,
    Rejected,
    Cancelled,
    Repaid,
    Defaulted,
    Liquidated,
    Closed,
}

impl LoanStatus {
    /// Statuses that may still be disbursed.
    pub fn is_pending(&self) -> bool {
        matches!(self, LoanStatus::Requested | LoanStatus::Authorized)
    }

    /// Statuses whose collateral may be redeemed by the borrower.
    pub fn is_redeemable(&self) -> bool {
        matches!(self, LoanStatus::Rejected | LoanStatus::Cancelled)
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoanStatus::Requested => "requested",
            LoanStatus::Authorized => "authorized",
            LoanStatus::Open => "open",
            LoanStatus::Rejected => "rejected",
            LoanStatus::Cancelled => "cancelled",
            LoanStatus::Repaid => "repaid",
            LoanStatus::Defaulted => "defaulted",
            LoanStatus::Liquidated => "liquidated",
            LoanStatus::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Authorized,
    Rejected,
}

/// Deposits covered by one CET submission. CETs are verified when they are
/// submitted, so an authorization is born authorized and only ever moves to
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub id: u64,
    pub deposit_txs: Vec<String>,
    pub status: AuthorizationStatus,
}

/// A loan against vault collateral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    /// Vault address, primary key
    pub vault_address: String,
    pub borrower: String,
    /// Borrower spend key (hex, any supported scheme)
    pub borrower_pub_key: String,
    pub borrower_auth_pub_key: String,
    pub dcm_id: u64,
    pub dcm_pub_key: String,
    pub pool_id: String,
    pub borrow_amount: u64,
    pub collateral_amount: u64,
    /// Tranche maturity in seconds
    pub maturity: i64,
    pub request_time: i64,
    pub maturity_time: i64,
    pub final_timeout: u64,
    pub liquidation_price: Decimal,
    pub start_borrow_index: Decimal,
    /// Interest expected over the full term
    pub interest: u64,
    pub origination_fee: u64,
    pub dlc_event_id: u64,
    pub authorizations: Vec<Authorization>,
    pub referrer: Option<Referrer>,
    pub status: LoanStatus,
    pub disburse_at: Option<i64>,
    pub liquidation_id: Option<u64>,
}

impl Loan {
    pub fn latest_authorization(&self) -> Option<&Authorization> {
        self.authorizations.last()
    }
}

impl Indexed for Loan {
    fn primary_key(&self) -> Vec<u8> {
        self.vault_address.as_bytes().to_vec()
    }

    fn status_key(&self) -> String {
        self.status.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Verified,
    Redeeming,
    Redeemed,
}

/// A deposit transaction into a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositLog {
    pub txid: String,
    pub vault_address: String,
    pub authorization_id: u64,
    pub deposit_tx: String,
    pub status: DepositStatus,
}

/// Collateral returned to the borrower before disbursement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub id: u64,
    pub loan_id: String,
    pub tx: String,
    pub borrower_signatures: Vec<String>,
    pub dcm_signatures: Vec<String>,
    pub signing_request_id: Option<u64>,
    pub signed_tx_hex: String,
    pub created_at: i64,
}

/// Escrowed repayment of a loan, created once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repayment {
    pub loan_id: String,
    pub amount: u64,
    pub interest: u64,
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationKind {
    Price,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationStatus {
    Liquidating,
    Settled,
}

impl fmt::Display for LiquidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiquidationStatus::Liquidating => write!(f, "liquidating"),
            LiquidationStatus::Settled => write!(f, "settled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liquidation {
    pub id: u64,
    pub loan_id: String,
    pub kind: LiquidationKind,
    pub collateral_amount: u64,
    pub debt_amount: u64,
    pub liquidation_price: Decimal,
    pub status: LiquidationStatus,
    pub created_at: i64,
}

impl Indexed for Liquidation {
    fn primary_key(&self) -> Vec<u8> {
        be(self.id).to_vec()
    }

    fn status_key(&self) -> String {
        self.status.to_string()
    }
}

/// Referral partner sharing origination and protocol fees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referrer {
    pub referral_code: String,
    pub address: String,
    /// Share of the fees, per-mille
    pub referral_fee_factor: u64,
}

/// Asset metadata of one side of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub denom: String,
    pub symbol: String,
    pub decimals: u32,
    /// Symbol used in price pairs
    pub price_symbol: String,
    /// Whether this asset is the base of the price pair
    pub is_base_price_asset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrancheConfig {
    /// Loan duration in seconds
    pub maturity: i64,
    /// Borrow APR, per-mille
    pub borrow_apr: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub collateral_asset: AssetMetadata,
    pub lending_asset: AssetMetadata,
    pub tranches: Vec<TrancheConfig>,
    /// Maximum loan-to-value at disbursement, per-mille
    pub max_ltv: u64,
    /// Liquidation loan-to-value, per-mille
    pub liquidation_threshold: u64,
    /// Share of interest kept by the protocol, per-mille
    pub reserve_factor: u64,
    /// Fee withheld at disbursement, per-mille
    pub origination_fee_factor: u64,
    /// Maximum total borrowed amount, 0 for no cap
    pub borrow_cap: u64,
}

impl PoolConfig {
    /// Price pair symbol, base asset first.
    pub fn price_pair(&self) -> String {
        if self.collateral_asset.is_base_price_asset {
            format!("{}{}", self.collateral_asset.price_symbol, self.lending_asset.price_symbol)
        } else {
            format!("{}{}", self.lending_asset.price_symbol, self.collateral_asset.price_symbol)
        }
    }

    pub fn tranche(&self, maturity: i64) -> Option<&TrancheConfig> {
        self.tranches.iter().find(|t| t.maturity == maturity)
    }
}

/// Per-maturity borrow accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tranche {
    pub maturity: i64,
    pub borrow_index: Decimal,
    pub total_borrowed: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendingPool {
    pub id: String,
    pub config: PoolConfig,
    pub supply: u64,
    pub available_amount: u64,
    pub borrowed_amount: u64,
    pub reserve_amount: Decimal,
    pub tranches: Vec<Tranche>,
    pub status: PoolStatus,
}

impl LendingPool {
    pub fn tranche_mut(&mut self, maturity: i64) -> Option<&mut Tranche> {
        self.tranches.iter_mut().find(|t| t.maturity == maturity)
    }

    pub fn tranche(&self, maturity: i64) -> Option<&Tranche> {
        self.tranches.iter().find(|t| t.maturity == maturity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningStatus {
    Pending,
    Completed,
    TimedOut,
}

/// A signing request issued on behalf of a loan or redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRecord {
    pub id: u64,
    pub scope_id: String,
    pub intent: SigningIntent,
    pub status: SigningStatus,
    pub created_at: i64,
}
