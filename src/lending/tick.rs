//! Per-block loan processing.
//!
//! The engine runs these stages in order, each loan in its own batch:
//!
//! 1. [`handle_pending`]: reject expired requests, disburse authorized loans
//! 2. [`handle_active`]: default matured loans, liquidate under-collateralized ones
//! 3. [`handle_liquidation`]: settle liquidation CETs as signatures arrive
//! 4. [`handle_repaid`]: settle repayment CETs and release the escrow

use super::bank;
use super::keeper::{self, LIQUIDATIONS};
use super::loan::{request_dcm_signing, within_max_ltv};
use super::math;
use super::pool;
use super::types::*;
use crate::adaptor;
use crate::cet::build::complete_liquidation_cet;
use crate::cet::verify::script_spend_sighashes;
use crate::cet::{settle_liquidation, settle_repayment, tx_from_hex, tx_to_hex, CetKind, DlcMeta};
use crate::collaborators::{Context, SigningIntent, SigningType};
use crate::config::oracle::OUTCOME_REPAID;
use crate::error::{LendingError, LendingResult};
use crate::keys::KeyScheme;
use crate::oracle::keeper as oracle_keeper;
use crate::schnorr;
use crate::store::Store;
use log::{debug, info, warn};

/// Loans the pending stage looks at, requested before authorized.
pub fn pending_loan_ids(store: &dyn Store) -> LendingResult<Vec<String>> {
    let mut ids = keeper::loan_ids_by_status(store, LoanStatus::Requested)?;
    ids.extend(keeper::loan_ids_by_status(store, LoanStatus::Authorized)?);
    Ok(ids)
}

pub fn active_loan_ids(store: &dyn Store) -> LendingResult<Vec<String>> {
    keeper::loan_ids_by_status(store, LoanStatus::Open)
}

/// Liquidations whose CET is not signed yet.
pub fn liquidation_queue(store: &dyn Store) -> LendingResult<Vec<u64>> {
    Ok(LIQUIDATIONS
        .by_status(store, &LiquidationStatus::Liquidating.to_string())?
        .into_iter()
        .map(|l| l.id)
        .collect())
}

pub fn repaid_loan_ids(store: &dyn Store) -> LendingResult<Vec<String>> {
    keeper::loan_ids_by_status(store, LoanStatus::Repaid)
}

fn reject(ctx: &mut Context<'_>, mut loan: Loan, reason: &str) -> LendingResult<()> {
    if let Some(authorization) = loan.authorizations.last_mut() {
        authorization.status = AuthorizationStatus::Rejected;
    }
    loan.status = LoanStatus::Rejected;
    keeper::set_loan(ctx.store, &loan)?;
    info!("loan {} rejected: {}", loan.vault_address, reason);
    Ok(())
}

fn deposits_verified(store: &dyn Store, authorization: &Authorization) -> LendingResult<bool> {
    for txid in &authorization.deposit_txs {
        match keeper::get_deposit_log(store, txid)? {
            Some(log) if log.status == DepositStatus::Verified => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// Reject or disburse a loan that is not open yet.
pub fn handle_pending(ctx: &mut Context<'_>, loan_id: &str) -> LendingResult<()> {
    let loan = keeper::get_loan(ctx.store, loan_id)?;
    if !loan.status.is_pending() {
        return Ok(());
    }
    if ctx.now >= loan.maturity_time {
        return reject(ctx, loan, "matured before disbursement");
    }
    if loan.status != LoanStatus::Authorized {
        return Ok(());
    }

    let authorization = loan
        .latest_authorization()
        .ok_or_else(|| LendingError::invariant(format!("authorized loan {} has no authorization", loan_id)))?;
    if !deposits_verified(ctx.store, authorization)? {
        debug!("loan {} waiting for deposit confirmations", loan_id);
        return Ok(());
    }

    let pool = keeper::get_pool(ctx.store, &loan.pool_id)?;
    let price = ctx.prices.get_price(&pool.config.price_pair())?;
    if !within_max_ltv(&loan, &pool, price)? {
        return reject(ctx, loan, &format!("collateral below max ltv at price {}", price));
    }
    if let Err(e) = pool::check_borrowable(&pool, loan.borrow_amount) {
        return reject(ctx, loan, &e.to_string());
    }

    disburse(ctx, loan, pool)
}

fn disburse(ctx: &mut Context<'_>, mut loan: Loan, mut pool: LendingPool) -> LendingResult<()> {
    let apr = pool
        .config
        .tranche(loan.maturity)
        .map(|t| t.borrow_apr)
        .ok_or_else(|| LendingError::not_found("tranche", format!("{}/{}", pool.id, loan.maturity)))?;
    let start_index = pool::book_borrow(&mut pool, loan.maturity, loan.borrow_amount)?;
    let interest = math::total_interest(loan.borrow_amount, apr, loan.maturity, ctx.params.blocks_per_year)?;
    let origination_fee = math::fee(loan.borrow_amount, pool.config.origination_fee_factor);

    let pool_account = bank::pool_account(&pool.id);
    let denom = pool.config.lending_asset.denom.clone();
    bank::transfer(
        ctx.store,
        &pool_account,
        &loan.borrower,
        &denom,
        loan.borrow_amount - origination_fee,
    )?;
    pool::distribute_fee(
        ctx.store,
        ctx.params,
        &pool_account,
        &denom,
        origination_fee,
        loan.referrer.as_ref(),
    )?;
    keeper::set_pool(ctx.store, &pool)?;

    loan.start_borrow_index = start_index;
    loan.interest = interest;
    loan.origination_fee = origination_fee;
    loan.disburse_at = Some(ctx.now);
    loan.status = LoanStatus::Open;
    keeper::set_loan(ctx.store, &loan)?;

    info!(
        "loan {} open: disbursed {} (fee {}) at borrow index {}",
        loan.vault_address,
        loan.borrow_amount - origination_fee,
        origination_fee,
        start_index
    );
    Ok(())
}

/// Default a matured loan or liquidate one whose price crossed the
/// liquidation price.
pub fn handle_active(ctx: &mut Context<'_>, loan_id: &str) -> LendingResult<()> {
    let loan = keeper::get_loan(ctx.store, loan_id)?;
    if loan.status != LoanStatus::Open {
        return Ok(());
    }
    let pool = keeper::get_pool(ctx.store, &loan.pool_id)?;

    let kind = if ctx.now >= loan.maturity_time {
        CetKind::DefaultLiquidation
    } else {
        let price = ctx.prices.get_price(&pool.config.price_pair())?;
        let collateral_is_base = pool.config.collateral_asset.is_base_price_asset;
        if !math::is_liquidatable(price, loan.liquidation_price, collateral_is_base) {
            return Ok(());
        }
        debug!(
            "loan {} price {} crossed liquidation price {}",
            loan_id, price, loan.liquidation_price
        );
        CetKind::Liquidation
    };

    start_liquidation(ctx, loan, &pool, kind)
}

fn start_liquidation(ctx: &mut Context<'_>, mut loan: Loan, pool: &LendingPool, kind: CetKind) -> LendingResult<()> {
    let mut meta = keeper::get_dlc_meta(ctx.store, &loan.vault_address)?;
    let fee_rate = ctx.bridge.get_fee_rate()?;
    ctx.bridge
        .check_fee_rate(&fee_rate, ctx.now, ctx.params.fee_rate_validity_period)?;

    let payout = KeyScheme::Taproot(schnorr::parse_xonly(&loan.dcm_pub_key)?).payout_script();
    let template = tx_from_hex(&meta.cet(kind).tx)?;
    let tx = complete_liquidation_cet(template, &meta.vault_utxos, &meta.vault, &payout, fee_rate.sat_per_vbyte)?;
    meta.cet_mut(kind).tx = tx_to_hex(&tx);

    let current_index = pool
        .tranche(loan.maturity)
        .map(|t| t.borrow_index)
        .ok_or_else(|| LendingError::not_found("tranche", format!("{}/{}", pool.id, loan.maturity)))?;
    let interest = math::loan_interest(loan.borrow_amount, loan.start_borrow_index, current_index)?;

    let liquidation = Liquidation {
        id: keeper::sequence(ctx.store, b"liquidation")?,
        loan_id: loan.vault_address.clone(),
        kind: match kind {
            CetKind::DefaultLiquidation => LiquidationKind::Default,
            _ => LiquidationKind::Price,
        },
        collateral_amount: loan.collateral_amount,
        debt_amount: loan.borrow_amount + interest,
        liquidation_price: loan.liquidation_price,
        status: LiquidationStatus::Liquidating,
        created_at: ctx.now,
    };
    LIQUIDATIONS.put(ctx.store, &liquidation)?;

    loan.status = match kind {
        CetKind::DefaultLiquidation => LoanStatus::Defaulted,
        _ => LoanStatus::Liquidated,
    };
    loan.liquidation_id = Some(liquidation.id);
    keeper::set_loan(ctx.store, &loan)?;

    oracle_keeper::trigger_dlc_event(ctx, loan.dlc_event_id, kind.outcome_index())?;
    request_liquidation_signatures(ctx, &loan, &mut meta, kind)?;
    keeper::set_dlc_meta(ctx.store, &loan.vault_address, &meta)?;

    warn!(
        "loan {} {}: liquidation {} of {} sats against debt {}",
        loan.vault_address, loan.status, liquidation.id, liquidation.collateral_amount, liquidation.debt_amount
    );
    Ok(())
}

fn liquidation_intent(kind: CetKind) -> SigningIntent {
    match kind {
        CetKind::Liquidation => SigningIntent::LiquidationCet,
        CetKind::DefaultLiquidation => SigningIntent::DefaultLiquidationCet,
        CetKind::Repayment => SigningIntent::RepaymentCet,
    }
}

fn request_liquidation_signatures(
    ctx: &mut Context<'_>,
    loan: &Loan,
    meta: &mut DlcMeta,
    kind: CetKind,
) -> LendingResult<()> {
    let tx = tx_from_hex(&meta.cet(kind).tx)?;
    let sighashes = script_spend_sighashes(&tx, &meta.prevouts(&tx)?, &meta.vault.liquidation, kind.dcm_sighash_type())?;
    let request_id = request_dcm_signing(
        ctx,
        &loan.vault_address,
        liquidation_intent(kind),
        SigningType::Schnorr,
        &loan.dcm_pub_key,
        &sighashes,
        None,
    )?;
    meta.cet_mut(kind).signing_request_id = Some(request_id);
    Ok(())
}

/// Progress one queued liquidation towards a signed CET.
pub fn handle_liquidation(ctx: &mut Context<'_>, liquidation_id: u64) -> LendingResult<()> {
    let mut liquidation = keeper::get_liquidation(ctx.store, liquidation_id)?;
    if liquidation.status != LiquidationStatus::Liquidating {
        return Ok(());
    }
    let loan = keeper::get_loan(ctx.store, &liquidation.loan_id)?;
    let kind = match loan.status {
        LoanStatus::Liquidated => CetKind::Liquidation,
        LoanStatus::Defaulted => CetKind::DefaultLiquidation,
        status => {
            return Err(LendingError::invariant(format!(
                "liquidation {} queued for loan {} in status {}",
                liquidation_id, loan.vault_address, status
            )))
        }
    };

    let mut meta = keeper::get_dlc_meta(ctx.store, &loan.vault_address)?;
    let cet = meta.cet(kind);
    if cet.dcm_signatures.is_empty() && cet.signing_request_id.is_none() {
        request_liquidation_signatures(ctx, &loan, &mut meta, kind)?;
    }

    let attestation = match oracle_keeper::get_attestation(ctx.store, loan.dlc_event_id)? {
        Some(attestation) => attestation,
        None => return keeper::set_dlc_meta(ctx.store, &loan.vault_address, &meta),
    };
    let event = oracle_keeper::get_event(ctx.store, loan.dlc_event_id)?;
    if event.outcome_index != Some(kind.outcome_index()) {
        return Err(LendingError::state(
            "dlc event outcome",
            kind.outcome_index(),
            format!("{:?}", event.outcome_index),
        ));
    }

    let secret = oracle_keeper::attestation_secret(&attestation)?;
    let auth_key = KeyScheme::parse(&loan.borrower_auth_pub_key)?.x_only();
    let signed = settle_liquidation(&mut meta, kind, &secret, &auth_key)?;
    keeper::set_dlc_meta(ctx.store, &loan.vault_address, &meta)?;

    if signed {
        liquidation.status = LiquidationStatus::Settled;
        LIQUIDATIONS.put(ctx.store, &liquidation)?;
        info!("{} CET of loan {} signed", kind, loan.vault_address);
    }
    Ok(())
}

/// Settle the repayment CET of a repaid loan and release its escrow.
pub fn handle_repaid(ctx: &mut Context<'_>, loan_id: &str) -> LendingResult<()> {
    let mut loan = keeper::get_loan(ctx.store, loan_id)?;
    if loan.status != LoanStatus::Repaid {
        return Ok(());
    }

    oracle_keeper::trigger_dlc_event(ctx, loan.dlc_event_id, OUTCOME_REPAID)?;
    let event = oracle_keeper::get_event(ctx.store, loan.dlc_event_id)?;
    if event.outcome_index != Some(OUTCOME_REPAID) {
        return Err(LendingError::state(
            "dlc event outcome",
            OUTCOME_REPAID,
            format!("{:?}", event.outcome_index),
        ));
    }

    let mut meta = keeper::get_dlc_meta(ctx.store, &loan.vault_address)?;
    if meta.repayment_cet.dcm_adaptor_signatures.is_empty() {
        if meta.repayment_cet.signing_request_id.is_none() {
            let tx = tx_from_hex(&meta.repayment_cet.tx)?;
            let sighashes = script_spend_sighashes(
                &tx,
                &meta.prevouts(&tx)?,
                &meta.vault.repayment,
                CetKind::Repayment.dcm_sighash_type(),
            )?;
            let point = oracle_keeper::get_signature_point_from_event(&event, OUTCOME_REPAID)?;
            let request_id = request_dcm_signing(
                ctx,
                &loan.vault_address,
                SigningIntent::RepaymentCet,
                SigningType::SchnorrAdaptor,
                &loan.dcm_pub_key,
                &sighashes,
                Some(hex::encode(point.serialize())),
            )?;
            meta.repayment_cet.signing_request_id = Some(request_id);
            keeper::set_dlc_meta(ctx.store, &loan.vault_address, &meta)?;
        }
        return Ok(());
    }

    let attestation = match oracle_keeper::get_attestation(ctx.store, loan.dlc_event_id)? {
        Some(attestation) => attestation,
        None => return Ok(()),
    };
    let secret = oracle_keeper::attestation_secret(&attestation)?;
    if adaptor::secret_to_pubkey(&secret) != oracle_keeper::get_signature_point_from_event(&event, OUTCOME_REPAID)? {
        return Err(LendingError::signature(format!(
            "attestation of event {} does not unlock the repaid outcome",
            event.id
        )));
    }

    let dcm_key = schnorr::parse_xonly(&loan.dcm_pub_key)?;
    if !settle_repayment(&mut meta, &secret, &dcm_key)? {
        return Ok(());
    }
    keeper::set_dlc_meta(ctx.store, &loan.vault_address, &meta)?;

    release_escrow(ctx, &loan)?;
    loan.status = LoanStatus::Closed;
    keeper::set_loan(ctx.store, &loan)?;

    info!("loan {} closed", loan_id);
    Ok(())
}

/// Move a settled repayment from escrow to the pool and fee recipients.
///
/// Escrowed funds were already taken from the borrower, so any failure here
/// is an invariant violation.
fn release_escrow(ctx: &mut Context<'_>, loan: &Loan) -> LendingResult<()> {
    let escrow_error =
        |e: LendingError| LendingError::invariant(format!("releasing escrow of loan {}: {}", loan.vault_address, e));

    let repayment = keeper::get_repayment(ctx.store, &loan.vault_address)?
        .ok_or_else(|| LendingError::invariant(format!("repaid loan {} has no repayment", loan.vault_address)))?;
    let mut pool = keeper::get_pool(ctx.store, &loan.pool_id)?;
    let denom = pool.config.lending_asset.denom.clone();

    let protocol_fee = math::fee(repayment.interest, pool.config.reserve_factor);
    let returned = repayment.amount - protocol_fee;

    bank::transfer(
        ctx.store,
        bank::REPAYMENT_ESCROW,
        &bank::pool_account(&pool.id),
        &denom,
        returned,
    )
    .map_err(escrow_error)?;
    pool::distribute_fee(
        ctx.store,
        ctx.params,
        bank::REPAYMENT_ESCROW,
        &denom,
        protocol_fee,
        loan.referrer.as_ref(),
    )
    .map_err(escrow_error)?;
    pool::book_repayment(&mut pool, loan.maturity, loan.borrow_amount, repayment.amount, returned)
        .map_err(escrow_error)?;
    keeper::set_pool(ctx.store, &pool)?;

    debug!(
        "released {} to pool {} and {} in fees for loan {}",
        returned, pool.id, protocol_fee, loan.vault_address
    );
    Ok(())
}
