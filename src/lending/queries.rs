//! Read-only views over lending state.

use super::keeper;
use super::math;
use super::types::*;
use crate::cet::DlcMeta;
use crate::collaborators::{BridgeLedger, FeeRate};
use crate::config::oracle::{OUTCOME_DEFAULT_LIQUIDATED, OUTCOME_LIQUIDATED, OUTCOME_REPAID};
use crate::config::Params;
use crate::error::{LendingError, LendingResult};
use crate::keys::KeyScheme;
use crate::oracle::keeper as oracle_keeper;
use crate::schnorr;
use crate::store::Store;
use crate::vault::{build_vault, VaultScripts};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub fn loan(store: &dyn Store, id: &str) -> LendingResult<Loan> {
    keeper::get_loan(store, id)
}

pub fn loans_by_status(store: &dyn Store, status: LoanStatus) -> LendingResult<Vec<Loan>> {
    keeper::LOANS.by_status(store, &status.to_string())
}

pub fn pool(store: &dyn Store, id: &str) -> LendingResult<LendingPool> {
    keeper::get_pool(store, id)
}

pub fn pools(store: &dyn Store) -> LendingResult<Vec<LendingPool>> {
    keeper::get_pools(store)
}

pub fn dlc_meta(store: &dyn Store, loan_id: &str) -> LendingResult<DlcMeta> {
    keeper::get_dlc_meta(store, loan_id)
}

/// Everything a borrower needs to build and sign the CETs of a loan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CetInfo {
    pub loan_id: String,
    pub event_id: u64,
    pub oracle_pub_key: String,
    pub nonce: String,
    /// Signature points (compressed hex); the liquidated point is empty until
    /// the collateral amount is fixed
    pub liquidated_point: String,
    pub default_liquidated_point: String,
    pub repaid_point: String,
    pub vault: VaultScripts,
    pub dcm_pub_key: String,
    pub fee_rate: FeeRate,
}

fn point_hex(event: &crate::oracle::types::DlcEvent, index: usize) -> LendingResult<String> {
    match event.outcomes.get(index) {
        Some(outcome) if !outcome.is_empty() => Ok(hex::encode(
            oracle_keeper::get_signature_point_from_event(event, index)?.serialize(),
        )),
        _ => Ok(String::new()),
    }
}

/// CET inputs of a loan.
///
/// `collateral_amount`, when given, fixes the liquidated outcome as the
/// borrower is about to submit it, so the point can be signed against before
/// the submission lands.
pub fn cet_info(
    store: &dyn Store,
    bridge: &dyn BridgeLedger,
    loan_id: &str,
    collateral_amount: Option<u64>,
) -> LendingResult<CetInfo> {
    let loan = keeper::get_loan(store, loan_id)?;
    let meta = keeper::get_dlc_meta(store, loan_id)?;
    let mut event = oracle_keeper::get_event(store, loan.dlc_event_id)?;

    if let Some(amount) = collateral_amount {
        if event.has_triggered() {
            return Err(LendingError::state("dlc event", "untriggered", event.status));
        }
        let slot = event
            .outcomes
            .get_mut(OUTCOME_LIQUIDATED)
            .ok_or_else(|| LendingError::invariant(format!("event {} has no liquidated outcome", event.id)))?;
        *slot = oracle_keeper::liquidated_outcome(amount);
    }

    Ok(CetInfo {
        loan_id: loan.vault_address.clone(),
        event_id: event.id,
        oracle_pub_key: event.pub_key.clone(),
        nonce: event.nonce.clone(),
        liquidated_point: point_hex(&event, OUTCOME_LIQUIDATED)?,
        default_liquidated_point: point_hex(&event, OUTCOME_DEFAULT_LIQUIDATED)?,
        repaid_point: point_hex(&event, OUTCOME_REPAID)?,
        vault: meta.vault,
        dcm_pub_key: loan.dcm_pub_key,
        fee_rate: bridge.get_fee_rate()?,
    })
}

/// Liquidation price a loan of `borrow_amount` against `collateral_amount`
/// would get in a pool tranche, including the full-term interest.
pub fn liquidation_price(
    store: &dyn Store,
    params: &Params,
    pool_id: &str,
    collateral_amount: u64,
    borrow_amount: u64,
    maturity: i64,
) -> LendingResult<Decimal> {
    let pool = keeper::get_pool(store, pool_id)?;
    let tranche = pool
        .config
        .tranche(maturity)
        .ok_or_else(|| LendingError::not_found("tranche", format!("{}/{}", pool_id, maturity)))?;
    let interest = math::total_interest(borrow_amount, tranche.borrow_apr, maturity, params.blocks_per_year)?;
    math::liquidation_price(
        collateral_amount,
        &pool.config.collateral_asset,
        borrow_amount,
        interest,
        &pool.config.lending_asset,
        pool.config.liquidation_threshold,
    )
}

/// Re-derive a vault from its keys without touching loan state.
pub fn vault_address(
    params: &Params,
    borrower_pub_key: &str,
    borrower_auth_pub_key: &str,
    dcm_pub_key: &str,
    final_timeout: u64,
) -> LendingResult<VaultScripts> {
    build_vault(
        &KeyScheme::parse(borrower_pub_key)?.x_only(),
        &KeyScheme::parse(borrower_auth_pub_key)?.x_only(),
        &schnorr::parse_xonly(dcm_pub_key)?,
        final_timeout,
        params.network,
    )
}
