//! Signing-network callbacks of the lending module.

use super::keeper;
use super::loan::{deposit_utxos, request_dcm_signing, REDEMPTION_SIGHASH_TYPE};
use super::types::*;
use crate::cet::sign::attach_sighash_type;
use crate::cet::verify::{check_inputs, script_spend_sighashes, verify_adaptor_signatures, verify_signatures};
use crate::cet::{assemble_script_spend, tx_from_hex, tx_to_hex, CetKind};
use crate::collaborators::{CallbackEvent, CallbackHandler, Context, SigningIntent, SigningType};
use crate::config::oracle::OUTCOME_REPAID;
use crate::error::{LendingError, LendingResult};
use crate::oracle::keeper as oracle_keeper;
use crate::schnorr;
use log::{info, warn};

/// Routes completed and expired DCM signing requests back to the loan or
/// redemption that issued them.
pub struct LendingCallbacks;

impl CallbackHandler for LendingCallbacks {
    fn handle(&self, ctx: &mut Context<'_>, event: &CallbackEvent) -> LendingResult<()> {
        match event {
            CallbackEvent::SigningCompleted {
                request_id,
                scope_id,
                intent,
                signatures,
            } => {
                check_record(ctx, *request_id, scope_id, *intent, SigningStatus::Completed)?;
                match intent {
                    SigningIntent::LiquidationCet => {
                        on_liquidation_signed(ctx, scope_id, CetKind::Liquidation, *request_id, signatures)
                    }
                    SigningIntent::DefaultLiquidationCet => {
                        on_liquidation_signed(ctx, scope_id, CetKind::DefaultLiquidation, *request_id, signatures)
                    }
                    SigningIntent::RepaymentCet => on_repayment_signed(ctx, scope_id, *request_id, signatures),
                    SigningIntent::Redemption => on_redemption_signed(ctx, scope_id, *request_id, signatures),
                    SigningIntent::DlcAttestation => Err(unexpected(event)),
                }
            }
            CallbackEvent::SigningTimeout {
                request_id,
                scope_id,
                intent,
            } => {
                check_record(ctx, *request_id, scope_id, *intent, SigningStatus::TimedOut)?;
                on_signing_timeout(ctx, scope_id, *intent, *request_id)
            }
            _ => Err(unexpected(event)),
        }
    }
}

fn unexpected(event: &CallbackEvent) -> LendingError {
    LendingError::validation(format!("lending module does not handle {}", event.kind()))
}

fn check_record(
    ctx: &mut Context<'_>,
    request_id: u64,
    scope_id: &str,
    intent: SigningIntent,
    status: SigningStatus,
) -> LendingResult<()> {
    let record = keeper::finish_signing_request(ctx.store, request_id, status)?;
    if record.scope_id != scope_id || record.intent != intent {
        return Err(LendingError::validation(format!(
            "signing request {} was issued for {} {}, not {} {}",
            request_id, record.intent, record.scope_id, intent, scope_id
        )));
    }
    Ok(())
}

fn check_current(expected: Option<u64>, request_id: u64, what: &str) -> LendingResult<()> {
    if expected != Some(request_id) {
        return Err(LendingError::conflict(format!(
            "request {} is not the pending request of {}",
            request_id, what
        )));
    }
    Ok(())
}

fn on_liquidation_signed(
    ctx: &mut Context<'_>,
    loan_id: &str,
    kind: CetKind,
    request_id: u64,
    signatures: &[String],
) -> LendingResult<()> {
    let loan = keeper::get_loan(ctx.store, loan_id)?;
    let mut meta = keeper::get_dlc_meta(ctx.store, loan_id)?;
    let tx = tx_from_hex(&meta.cet(kind).tx)?;
    let prevouts = meta.prevouts(&tx)?;
    let leaf = meta.vault.liquidation.clone();

    let cet = meta.cet_mut(kind);
    check_current(cet.signing_request_id, request_id, &format!("{} CET of {}", kind, loan_id))?;
    if !cet.dcm_signatures.is_empty() {
        return Err(LendingError::conflict(format!("{} CET of {} already signed by the dcm", kind, loan_id)));
    }

    let sigs = attach_sighash_type(signatures, kind.dcm_sighash_type())?;
    let dcm_key = schnorr::parse_xonly(&loan.dcm_pub_key)?;
    verify_signatures(&tx, &prevouts, &leaf, &dcm_key, kind.dcm_sighash_type(), &sigs)?;
    cet.dcm_signatures = sigs;
    keeper::set_dlc_meta(ctx.store, loan_id, &meta)?;

    info!("dcm signed {} CET of loan {}", kind, loan_id);
    Ok(())
}

fn on_repayment_signed(
    ctx: &mut Context<'_>,
    loan_id: &str,
    request_id: u64,
    signatures: &[String],
) -> LendingResult<()> {
    let loan = keeper::get_loan(ctx.store, loan_id)?;
    let event = oracle_keeper::get_event(ctx.store, loan.dlc_event_id)?;
    let point = oracle_keeper::get_signature_point_from_event(&event, OUTCOME_REPAID)?;

    let mut meta = keeper::get_dlc_meta(ctx.store, loan_id)?;
    let tx = tx_from_hex(&meta.repayment_cet.tx)?;
    let prevouts = meta.prevouts(&tx)?;
    let leaf = meta.vault.repayment.clone();
    let cet = meta.cet_mut(CetKind::Repayment);
    check_current(cet.signing_request_id, request_id, &format!("repayment CET of {}", loan_id))?;
    if !cet.dcm_adaptor_signatures.is_empty() {
        return Err(LendingError::conflict(format!("repayment CET of {} already signed by the dcm", loan_id)));
    }

    let dcm_key = schnorr::parse_xonly(&loan.dcm_pub_key)?;
    verify_adaptor_signatures(
        &tx,
        &prevouts,
        &leaf,
        &dcm_key,
        &point,
        CetKind::Repayment.dcm_sighash_type(),
        signatures,
    )?;
    cet.dcm_adaptor_signatures = signatures.to_vec();
    keeper::set_dlc_meta(ctx.store, loan_id, &meta)?;

    info!("dcm adaptor-signed repayment CET of loan {}", loan_id);
    Ok(())
}

fn parse_redemption_id(scope_id: &str) -> LendingResult<u64> {
    scope_id
        .parse()
        .map_err(|_| LendingError::validation(format!("invalid redemption id {}", scope_id)))
}

fn on_redemption_signed(
    ctx: &mut Context<'_>,
    scope_id: &str,
    request_id: u64,
    signatures: &[String],
) -> LendingResult<()> {
    let mut redemption = keeper::get_redemption(ctx.store, parse_redemption_id(scope_id)?)?;
    check_current(redemption.signing_request_id, request_id, &format!("redemption {}", redemption.id))?;
    if !redemption.dcm_signatures.is_empty() {
        return Err(LendingError::conflict(format!("redemption {} already signed", redemption.id)));
    }

    let loan = keeper::get_loan(ctx.store, &redemption.loan_id)?;
    let meta = keeper::get_dlc_meta(ctx.store, &loan.vault_address)?;
    let logs: Vec<DepositLog> = keeper::get_deposit_logs(ctx.store, &loan.vault_address)?
        .into_iter()
        .filter(|l| l.status == DepositStatus::Redeeming)
        .collect();
    let utxos = deposit_utxos(&meta, &logs)?;

    let tx = tx_from_hex(&redemption.tx)?;
    let prevouts = check_inputs(&tx, &utxos, &meta.vault)?;
    let sigs = attach_sighash_type(signatures, REDEMPTION_SIGHASH_TYPE)?;
    let dcm_key = schnorr::parse_xonly(&loan.dcm_pub_key)?;
    verify_signatures(&tx, &prevouts, &meta.vault.repayment, &dcm_key, REDEMPTION_SIGHASH_TYPE, &sigs)?;

    let signed = assemble_script_spend(&tx, &meta.vault.repayment, &sigs, &redemption.borrower_signatures)?;
    redemption.dcm_signatures = sigs;
    redemption.signed_tx_hex = tx_to_hex(&signed);
    keeper::set_redemption(ctx.store, &redemption)?;

    for log in logs {
        keeper::set_deposit_log(
            ctx.store,
            &DepositLog {
                status: DepositStatus::Redeemed,
                ..log
            },
        )?;
    }

    info!("redemption {} of loan {} signed", redemption.id, loan.vault_address);
    Ok(())
}

fn on_signing_timeout(
    ctx: &mut Context<'_>,
    scope_id: &str,
    intent: SigningIntent,
    request_id: u64,
) -> LendingResult<()> {
    let kind = match intent {
        SigningIntent::LiquidationCet => CetKind::Liquidation,
        SigningIntent::DefaultLiquidationCet => CetKind::DefaultLiquidation,
        SigningIntent::RepaymentCet => CetKind::Repayment,
        SigningIntent::Redemption => return retry_redemption(ctx, scope_id, request_id),
        SigningIntent::DlcAttestation => {
            return Err(LendingError::validation("attestation timeouts belong to the dlc module"))
        }
    };

    // Cleared requests are re-issued by the next tick
    let mut meta = keeper::get_dlc_meta(ctx.store, scope_id)?;
    let cet = meta.cet_mut(kind);
    check_current(cet.signing_request_id, request_id, &format!("{} CET of {}", kind, scope_id))?;
    cet.signing_request_id = None;
    keeper::set_dlc_meta(ctx.store, scope_id, &meta)?;

    warn!("dcm signing of {} CET for loan {} timed out", kind, scope_id);
    Ok(())
}

fn retry_redemption(ctx: &mut Context<'_>, scope_id: &str, request_id: u64) -> LendingResult<()> {
    let mut redemption = keeper::get_redemption(ctx.store, parse_redemption_id(scope_id)?)?;
    check_current(redemption.signing_request_id, request_id, &format!("redemption {}", redemption.id))?;

    let loan = keeper::get_loan(ctx.store, &redemption.loan_id)?;
    let meta = keeper::get_dlc_meta(ctx.store, &loan.vault_address)?;
    let logs: Vec<DepositLog> = keeper::get_deposit_logs(ctx.store, &loan.vault_address)?
        .into_iter()
        .filter(|l| l.status == DepositStatus::Redeeming)
        .collect();
    let utxos = deposit_utxos(&meta, &logs)?;
    let tx = tx_from_hex(&redemption.tx)?;
    let prevouts = check_inputs(&tx, &utxos, &meta.vault)?;
    let sighashes = script_spend_sighashes(&tx, &prevouts, &meta.vault.repayment, REDEMPTION_SIGHASH_TYPE)?;

    let retry = request_dcm_signing(
        ctx,
        scope_id,
        SigningIntent::Redemption,
        SigningType::Schnorr,
        &loan.dcm_pub_key,
        &sighashes,
        None,
    )?;
    redemption.signing_request_id = Some(retry);
    keeper::set_redemption(ctx.store, &redemption)?;

    warn!("dcm signing of redemption {} timed out, re-requested as {}", redemption.id, retry);
    Ok(())
}
