//! Borrower-facing loan operations.
//!
//! Every operation runs inside one batch: it either writes the loan, its
//! DLC meta and the event binding together, or nothing.

use super::bank;
use super::keeper::{self, LOANS};
use super::math;
use super::pool;
use super::types::*;
use crate::cet::{
    build_dlc_meta, build_timeout_refund_tx, tx_from_hex, tx_to_hex, vault_utxos_from_deposit, verify_cets,
    Cet, CetSubmission, DlcMeta, VaultUtxo, VerificationContext,
};
use crate::cet::verify::{check_inputs, script_spend_sighashes, verify_signatures};
use crate::collaborators::{Context, SigningIntent, SigningOptions, SigningRequest, SigningType};
use crate::config::bitcoin_tx::DUST_THRESHOLD_SATS;
use crate::config::modules;
use crate::config::oracle::{OUTCOME_DEFAULT_LIQUIDATED, OUTCOME_LIQUIDATED};
use crate::error::{LendingError, LendingResult};
use crate::keys::KeyScheme;
use crate::oracle::keeper as oracle_keeper;
use crate::oracle::types::DcmStatus;
use crate::schnorr;
use crate::vault::build_vault;
use bitcoin::TapSighashType;
use log::info;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Sighash of redemption spends, for both the borrower and the DCM.
pub const REDEMPTION_SIGHASH_TYPE: TapSighashType = TapSighashType::AllPlusAnyoneCanPay;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub borrower: String,
    pub borrower_pub_key: String,
    pub borrower_auth_pub_key: String,
    pub pool_id: String,
    pub borrow_amount: u64,
    /// Tranche maturity in seconds
    pub maturity: i64,
    pub dcm_id: u64,
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitCetsRequest {
    pub borrower: String,
    pub loan_id: String,
    /// Raw deposit transactions (hex)
    pub deposit_txs: Vec<String>,
    pub cets: CetSubmission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub vault_address: String,
    pub deposit_tx: String,
    pub block_hash: String,
    pub proof: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequest {
    pub borrower: String,
    pub loan_id: String,
    /// Unsigned redemption transaction (hex)
    pub tx: String,
    pub signatures: Vec<String>,
}

fn check_borrower(loan: &Loan, sender: &str) -> LendingResult<()> {
    if loan.borrower != sender {
        return Err(LendingError::validation(format!(
            "{} is not the borrower of loan {}",
            sender, loan.vault_address
        )));
    }
    Ok(())
}

/// Ask the DCM for signatures over `sighashes` and record the request.
pub(crate) fn request_dcm_signing(
    ctx: &mut Context<'_>,
    scope_id: &str,
    intent: SigningIntent,
    signing_type: SigningType,
    dcm_pub_key: &str,
    sighashes: &[[u8; 32]],
    adaptor_point: Option<String>,
) -> LendingResult<u64> {
    let request_id = ctx.signer.initiate_signing_request(SigningRequest {
        module: modules::LENDING.to_string(),
        scope_id: scope_id.to_string(),
        signing_type,
        intent,
        pub_key: dcm_pub_key.to_string(),
        sig_hashes: sighashes.iter().map(hex::encode).collect(),
        options: SigningOptions {
            nonce: None,
            adaptor_point,
        },
    })?;
    keeper::record_signing_request(ctx.store, request_id, scope_id, intent, ctx.now)?;
    Ok(request_id)
}

/// Vault outputs of the given deposits.
pub(crate) fn deposit_utxos(meta: &DlcMeta, logs: &[DepositLog]) -> LendingResult<Vec<VaultUtxo>> {
    let script = meta.vault.script_pubkey()?;
    let mut utxos = Vec::new();
    for log in logs {
        utxos.extend(vault_utxos_from_deposit(&tx_from_hex(&log.deposit_tx)?, &script));
    }
    Ok(utxos)
}

/// Open a loan request: derive the vault and bind the next lending event.
pub fn apply(ctx: &mut Context<'_>, msg: &ApplyRequest) -> LendingResult<Loan> {
    if msg.borrower.is_empty() {
        return Err(LendingError::validation("borrower must not be empty"));
    }
    if msg.borrow_amount == 0 {
        return Err(LendingError::validation("borrow amount must be positive"));
    }
    let borrower_key = KeyScheme::parse(&msg.borrower_pub_key)?;
    let auth_key = KeyScheme::parse(&msg.borrower_auth_pub_key)?;

    let pool = keeper::get_pool(ctx.store, &msg.pool_id)?;
    if pool.config.tranche(msg.maturity).is_none() {
        return Err(LendingError::not_found("tranche", format!("{}/{}", msg.pool_id, msg.maturity)));
    }
    pool::check_borrowable(&pool, msg.borrow_amount)?;

    let dcm = oracle_keeper::get_dcm(ctx.store, msg.dcm_id)?;
    if dcm.status != DcmStatus::Enabled {
        return Err(LendingError::state("dcm", "enabled", format!("{:?}", dcm.status)));
    }
    let dcm_key = schnorr::parse_xonly(&dcm.pub_key)?;

    let referrer = match &msg.referral_code {
        Some(code) => Some(keeper::get_referrer(ctx.store, code)?),
        None => None,
    };

    let maturity_time = ctx.now + msg.maturity;
    let final_timeout = maturity_time as u64 + ctx.params.final_timeout_duration;
    let vault = build_vault(
        &borrower_key.x_only(),
        &auth_key.x_only(),
        &dcm_key,
        final_timeout,
        ctx.params.network,
    )?;
    if LOANS.contains(ctx.store, vault.address.as_bytes()) {
        return Err(LendingError::conflict(format!("loan {} already exists", vault.address)));
    }

    let event = oracle_keeper::get_available_lending_event(ctx.store)?.ok_or(LendingError::NoAvailableDlcEvent)?;

    let loan = Loan {
        vault_address: vault.address.clone(),
        borrower: msg.borrower.clone(),
        borrower_pub_key: msg.borrower_pub_key.clone(),
        borrower_auth_pub_key: msg.borrower_auth_pub_key.clone(),
        dcm_id: dcm.id,
        dcm_pub_key: dcm.pub_key.clone(),
        pool_id: msg.pool_id.clone(),
        borrow_amount: msg.borrow_amount,
        collateral_amount: 0,
        maturity: msg.maturity,
        request_time: ctx.now,
        maturity_time,
        final_timeout,
        liquidation_price: Decimal::ZERO,
        start_borrow_index: Decimal::ZERO,
        interest: 0,
        origination_fee: 0,
        dlc_event_id: event.id,
        authorizations: Vec::new(),
        referrer,
        status: LoanStatus::Requested,
        disburse_at: None,
        liquidation_id: None,
    };
    keeper::set_loan(ctx.store, &loan)?;
    keeper::set_dlc_meta(ctx.store, &loan.vault_address, &build_dlc_meta(vault))?;

    info!(
        "loan {} requested by {} ({} key): {} over {}s, dlc event {}",
        loan.vault_address,
        loan.borrower,
        borrower_key.scheme_name(),
        loan.borrow_amount,
        loan.maturity,
        event.id
    );
    Ok(loan)
}

/// Register deposits and the borrower's pre-signed CETs.
pub fn submit_cets(ctx: &mut Context<'_>, msg: &SubmitCetsRequest) -> LendingResult<Authorization> {
    let mut loan = keeper::get_loan(ctx.store, &msg.loan_id)?;
    check_borrower(&loan, &msg.borrower)?;
    if !loan.status.is_pending() {
        return Err(LendingError::state("loan", "requested or authorized", loan.status));
    }
    if msg.deposit_txs.is_empty() {
        return Err(LendingError::validation("at least one deposit transaction is required"));
    }
    if let Some(previous) = loan.latest_authorization() {
        for txid in &previous.deposit_txs {
            let verified = keeper::get_deposit_log(ctx.store, txid)?
                .is_some_and(|log| log.status == DepositStatus::Verified);
            if !verified {
                return Err(LendingError::conflict(format!(
                    "authorization {} of loan {} still has unverified deposits",
                    previous.id, loan.vault_address
                )));
            }
        }
    }

    let mut meta = keeper::get_dlc_meta(ctx.store, &loan.vault_address)?;
    let vault_script = meta.vault.script_pubkey()?;
    let authorization_id = loan.authorizations.len() as u64 + 1;

    let mut utxos = meta.vault_utxos.clone();
    let mut logs = Vec::new();
    let mut seen = HashSet::new();
    for raw in &msg.deposit_txs {
        let tx = tx_from_hex(raw)?;
        let txid = tx.compute_txid().to_string();
        if !seen.insert(txid.clone()) {
            return Err(LendingError::validation(format!("deposit {} submitted twice", txid)));
        }

        let status = match keeper::get_deposit_log(ctx.store, &txid)? {
            // Deposit proven before its CETs arrived
            Some(log) if log.vault_address == loan.vault_address && log.authorization_id == 0 => log.status,
            Some(_) => return Err(LendingError::conflict(format!("deposit {} already registered", txid))),
            None => DepositStatus::Pending,
        };

        let outputs = vault_utxos_from_deposit(&tx, &vault_script);
        if outputs.is_empty() {
            return Err(LendingError::validation(format!(
                "deposit {} does not pay vault {}",
                txid, loan.vault_address
            )));
        }
        utxos.extend(outputs);
        logs.push(DepositLog {
            txid,
            vault_address: loan.vault_address.clone(),
            authorization_id,
            deposit_tx: raw.clone(),
            status,
        });
    }

    let fee_rate = ctx.bridge.get_fee_rate()?;
    ctx.bridge
        .check_fee_rate(&fee_rate, ctx.now, ctx.params.fee_rate_validity_period)?;

    let collateral: u64 = utxos.iter().map(|u| u.amount).sum();
    let event = oracle_keeper::set_event_outcome(
        ctx.store,
        loan.dlc_event_id,
        OUTCOME_LIQUIDATED,
        oracle_keeper::liquidated_outcome(collateral),
    )?;

    let borrower_key = KeyScheme::parse(&loan.borrower_pub_key)?;
    let verification = VerificationContext {
        vault: &meta.vault,
        utxos: &utxos,
        auth_key: KeyScheme::parse(&loan.borrower_auth_pub_key)?.x_only(),
        borrower_key: borrower_key.x_only(),
        liquidated_point: oracle_keeper::get_signature_point_from_event(&event, OUTCOME_LIQUIDATED)?,
        default_liquidated_point: oracle_keeper::get_signature_point_from_event(&event, OUTCOME_DEFAULT_LIQUIDATED)?,
        fee_rate: fee_rate.sat_per_vbyte,
    };
    let verified = verify_cets(&verification, &msg.cets)?;
    let refund = build_timeout_refund_tx(&utxos, &meta.vault, &borrower_key.payout_script(), fee_rate.sat_per_vbyte)?;

    let template = tx_to_hex(&verified.liquidation_tx);
    meta.liquidation_cet = Cet {
        tx: template.clone(),
        borrower_adaptor_signatures: msg.cets.liquidation_adaptor_signatures.clone(),
        ..Cet::default()
    };
    meta.default_liquidation_cet = Cet {
        tx: template,
        borrower_adaptor_signatures: msg.cets.default_liquidation_adaptor_signatures.clone(),
        ..Cet::default()
    };
    meta.repayment_cet = Cet {
        tx: tx_to_hex(&verified.repayment_tx),
        borrower_signatures: msg.cets.repayment_signatures.clone(),
        ..Cet::default()
    };
    meta.timeout_refund_tx = tx_to_hex(&refund);
    meta.vault_utxos = utxos;

    let pool = keeper::get_pool(ctx.store, &loan.pool_id)?;
    let tranche = pool
        .config
        .tranche(loan.maturity)
        .ok_or_else(|| LendingError::not_found("tranche", format!("{}/{}", pool.id, loan.maturity)))?;
    let interest = math::total_interest(
        loan.borrow_amount,
        tranche.borrow_apr,
        loan.maturity,
        ctx.params.blocks_per_year,
    )?;
    loan.liquidation_price = math::liquidation_price(
        collateral,
        &pool.config.collateral_asset,
        loan.borrow_amount,
        interest,
        &pool.config.lending_asset,
        pool.config.liquidation_threshold,
    )?;
    loan.interest = interest;
    loan.collateral_amount = collateral;

    let authorization = Authorization {
        id: authorization_id,
        deposit_txs: logs.iter().map(|l| l.txid.clone()).collect(),
        status: AuthorizationStatus::Authorized,
    };
    for log in &logs {
        keeper::set_deposit_log(ctx.store, log)?;
    }
    loan.authorizations.push(authorization.clone());
    loan.status = LoanStatus::Authorized;
    keeper::set_loan(ctx.store, &loan)?;
    keeper::set_dlc_meta(ctx.store, &loan.vault_address, &meta)?;

    info!(
        "loan {} authorized with {} sats collateral, liquidation price {}",
        loan.vault_address, collateral, loan.liquidation_price
    );
    Ok(authorization)
}

/// Prove a deposit transaction through the bridge ledger.
pub fn submit_deposit_transaction(ctx: &mut Context<'_>, msg: &DepositRequest) -> LendingResult<DepositLog> {
    let loan = keeper::get_loan(ctx.store, &msg.vault_address)?;
    let (tx, _) = ctx.bridge.validate_transaction(
        &msg.deposit_tx,
        &msg.block_hash,
        &msg.proof,
        ctx.params.confirmation_depth,
    )?;
    let txid = tx.compute_txid().to_string();

    let meta = keeper::get_dlc_meta(ctx.store, &loan.vault_address)?;
    if vault_utxos_from_deposit(&tx, &meta.vault.script_pubkey()?).is_empty() {
        return Err(LendingError::validation(format!(
            "deposit {} does not pay vault {}",
            txid, loan.vault_address
        )));
    }

    let log = match keeper::get_deposit_log(ctx.store, &txid)? {
        Some(log) if log.vault_address != loan.vault_address => {
            return Err(LendingError::validation(format!(
                "deposit {} belongs to vault {}",
                txid, log.vault_address
            )));
        }
        Some(log) if log.status != DepositStatus::Pending => {
            return Err(LendingError::conflict(format!("deposit {} already {:?}", txid, log.status)));
        }
        Some(log) => DepositLog {
            status: DepositStatus::Verified,
            ..log
        },
        None => DepositLog {
            txid: txid.clone(),
            vault_address: loan.vault_address.clone(),
            authorization_id: 0,
            deposit_tx: msg.deposit_tx.clone(),
            status: DepositStatus::Verified,
        },
    };
    keeper::set_deposit_log(ctx.store, &log)?;

    info!("deposit {} to vault {} verified", txid, loan.vault_address);
    Ok(log)
}

/// Return the collateral of a loan that was never disbursed.
pub fn redeem(ctx: &mut Context<'_>, msg: &RedeemRequest) -> LendingResult<Redemption> {
    let loan = keeper::get_loan(ctx.store, &msg.loan_id)?;
    check_borrower(&loan, &msg.borrower)?;
    if !loan.status.is_redeemable() {
        return Err(LendingError::state("loan", "rejected or cancelled", loan.status));
    }

    let meta = keeper::get_dlc_meta(ctx.store, &loan.vault_address)?;
    let logs: Vec<DepositLog> = keeper::get_deposit_logs(ctx.store, &loan.vault_address)?
        .into_iter()
        .filter(|l| matches!(l.status, DepositStatus::Pending | DepositStatus::Verified))
        .collect();
    if logs.is_empty() {
        return Err(LendingError::insufficient("redeemable deposits", 1, 0));
    }
    let utxos = deposit_utxos(&meta, &logs)?;

    let tx = tx_from_hex(&msg.tx)?;
    if tx.output.is_empty() {
        return Err(LendingError::validation("redemption transaction has no outputs"));
    }
    if tx.output.iter().any(|o| o.value.to_sat() < DUST_THRESHOLD_SATS) {
        return Err(LendingError::validation("redemption transaction has a dust output"));
    }
    let prevouts = check_inputs(&tx, &utxos, &meta.vault)?;
    let borrower_key = KeyScheme::parse(&loan.borrower_pub_key)?.x_only();
    verify_signatures(
        &tx,
        &prevouts,
        &meta.vault.repayment,
        &borrower_key,
        REDEMPTION_SIGHASH_TYPE,
        &msg.signatures,
    )?;

    let id = keeper::sequence(ctx.store, b"redemption")?;
    for log in logs {
        keeper::set_deposit_log(
            ctx.store,
            &DepositLog {
                status: DepositStatus::Redeeming,
                ..log
            },
        )?;
    }

    let sighashes = script_spend_sighashes(&tx, &prevouts, &meta.vault.repayment, REDEMPTION_SIGHASH_TYPE)?;
    let request_id = request_dcm_signing(
        ctx,
        &id.to_string(),
        SigningIntent::Redemption,
        SigningType::Schnorr,
        &loan.dcm_pub_key,
        &sighashes,
        None,
    )?;

    let redemption = Redemption {
        id,
        loan_id: loan.vault_address.clone(),
        tx: msg.tx.clone(),
        borrower_signatures: msg.signatures.clone(),
        dcm_signatures: Vec::new(),
        signing_request_id: Some(request_id),
        signed_tx_hex: String::new(),
        created_at: ctx.now,
    };
    keeper::set_redemption(ctx.store, &redemption)?;

    info!("redemption {} of loan {} requested", id, loan.vault_address);
    Ok(redemption)
}

/// Escrow principal and accrued interest of an open loan.
///
/// Only the status is checked: a loan past maturity stays repayable until the
/// next block tick defaults it.
pub fn repay(ctx: &mut Context<'_>, borrower: &str, loan_id: &str) -> LendingResult<Repayment> {
    let mut loan = keeper::get_loan(ctx.store, loan_id)?;
    check_borrower(&loan, borrower)?;
    if loan.status != LoanStatus::Open {
        return Err(LendingError::state("loan", LoanStatus::Open, loan.status));
    }
    if keeper::get_repayment(ctx.store, loan_id)?.is_some() {
        return Err(LendingError::conflict(format!("loan {} already repaid", loan_id)));
    }

    let pool = keeper::get_pool(ctx.store, &loan.pool_id)?;
    let tranche = pool
        .tranche(loan.maturity)
        .ok_or_else(|| LendingError::not_found("tranche", format!("{}/{}", pool.id, loan.maturity)))?;
    let interest = math::loan_interest(loan.borrow_amount, loan.start_borrow_index, tranche.borrow_index)?;
    let amount = loan.borrow_amount + interest;

    bank::transfer(
        ctx.store,
        borrower,
        bank::REPAYMENT_ESCROW,
        &pool.config.lending_asset.denom,
        amount,
    )?;

    let repayment = Repayment {
        loan_id: loan_id.to_string(),
        amount,
        interest,
        time: ctx.now,
    };
    keeper::set_repayment(ctx.store, &repayment)?;
    loan.status = LoanStatus::Repaid;
    keeper::set_loan(ctx.store, &loan)?;

    info!("loan {} repaid: {} ({} interest) in escrow", loan_id, amount, interest);
    Ok(repayment)
}

/// Withdraw a loan request before disbursement.
pub fn cancel(ctx: &mut Context<'_>, borrower: &str, loan_id: &str) -> LendingResult<Loan> {
    let mut loan = keeper::get_loan(ctx.store, loan_id)?;
    check_borrower(&loan, borrower)?;
    if !loan.status.is_pending() {
        return Err(LendingError::state("loan", "requested or authorized", loan.status));
    }
    loan.status = LoanStatus::Cancelled;
    keeper::set_loan(ctx.store, &loan)?;
    info!("loan {} cancelled", loan_id);
    Ok(loan)
}

/// Collateral value of `loan` checked against the pool's max LTV at `price`.
pub(crate) fn within_max_ltv(loan: &Loan, pool: &LendingPool, price: Decimal) -> LendingResult<bool> {
    let ltv = math::ltv(
        loan.collateral_amount,
        &pool.config.collateral_asset,
        loan.borrow_amount,
        &pool.config.lending_asset,
        price,
    )?;
    Ok(ltv <= Decimal::from(pool.config.max_ltv))
}
