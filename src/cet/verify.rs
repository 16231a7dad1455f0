//! Verification of borrower-submitted CETs.
//!
//! Every check re-derives the tapscript sighash of the leaf the CET spends,
//! never the key-path sighash. Any mismatch is a hard rejection.

use super::build::{estimate_vsize, witness_size};
use super::{digest, tx_from_hex, CetKind, VaultUtxo};
use crate::adaptor::{self, AdaptorSignature};
use crate::config::bitcoin_tx::{DUST_THRESHOLD_SATS, MAX_TRANSACTION_WEIGHT, TX_VERSION};
use crate::error::{LendingError, LendingResult};
use crate::schnorr;
use crate::vault::{LeafKind, LeafScript, VaultScripts};
use bitcoin::{
    absolute::LockTime,
    secp256k1::{PublicKey, XOnlyPublicKey},
    sighash::{Prevouts, SighashCache},
    taproot, TapSighashType, Transaction, TxOut,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// CETs and signatures submitted by the borrower.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CetSubmission {
    pub liquidation_cet: String,
    pub liquidation_adaptor_signatures: Vec<String>,
    pub default_liquidation_adaptor_signatures: Vec<String>,
    pub repayment_cet: String,
    pub repayment_signatures: Vec<String>,
}

/// What the submitted CETs are checked against.
pub struct VerificationContext<'a> {
    pub vault: &'a VaultScripts,
    pub utxos: &'a [VaultUtxo],
    pub auth_key: XOnlyPublicKey,
    pub borrower_key: XOnlyPublicKey,
    pub liquidated_point: PublicKey,
    pub default_liquidated_point: PublicKey,
    /// Current fee rate, sat/vB
    pub fee_rate: u64,
}

#[derive(Debug, Clone)]
pub struct VerifiedCets {
    pub liquidation_tx: Transaction,
    pub repayment_tx: Transaction,
}

/// Verify a complete CET submission.
pub fn verify_cets(ctx: &VerificationContext<'_>, submission: &CetSubmission) -> LendingResult<VerifiedCets> {
    let liquidation_tx = tx_from_hex(&submission.liquidation_cet)?;
    verify_liquidation_cet(
        ctx,
        &liquidation_tx,
        &submission.liquidation_adaptor_signatures,
        &ctx.liquidated_point,
    )?;
    verify_liquidation_cet(
        ctx,
        &liquidation_tx,
        &submission.default_liquidation_adaptor_signatures,
        &ctx.default_liquidated_point,
    )?;

    let repayment_tx = tx_from_hex(&submission.repayment_cet)?;
    verify_repayment_cet(ctx, &repayment_tx, &submission.repayment_signatures)?;

    debug!(
        "verified CETs for vault {} over {} inputs",
        ctx.vault.address,
        ctx.utxos.len()
    );
    Ok(VerifiedCets {
        liquidation_tx,
        repayment_tx,
    })
}

fn verify_liquidation_cet(
    ctx: &VerificationContext<'_>,
    tx: &Transaction,
    adaptor_sigs: &[String],
    point: &PublicKey,
) -> LendingResult<()> {
    if !tx.output.is_empty() {
        return Err(LendingError::invalid_cet(format!(
            "liquidation CET must have no outputs, got {}",
            tx.output.len()
        )));
    }
    check_version_and_lock_time(tx)?;
    let prevouts = check_inputs(tx, ctx.utxos, ctx.vault)?;

    verify_adaptor_signatures(
        tx,
        &prevouts,
        &ctx.vault.liquidation,
        &ctx.auth_key,
        point,
        CetKind::Liquidation.borrower_sighash_type(),
        adaptor_sigs,
    )
}

fn verify_repayment_cet(ctx: &VerificationContext<'_>, tx: &Transaction, sigs: &[String]) -> LendingResult<()> {
    if tx.output.is_empty() {
        return Err(LendingError::invalid_cet("repayment CET has no outputs"));
    }
    if let Some(out) = tx.output.iter().find(|o| o.value.to_sat() < DUST_THRESHOLD_SATS) {
        return Err(LendingError::invalid_cet(format!(
            "repayment CET output of {} sats is dust",
            out.value.to_sat()
        )));
    }
    check_version_and_lock_time(tx)?;
    let prevouts = check_inputs(tx, ctx.utxos, ctx.vault)?;

    let witness = witness_size(LeafKind::Repayment, &ctx.vault.repayment);
    let vsize = estimate_vsize(tx, witness);
    if vsize * 4 > MAX_TRANSACTION_WEIGHT {
        return Err(LendingError::invalid_cet(format!("repayment CET vsize {} too large", vsize)));
    }

    let input_total: u64 = prevouts.iter().map(|p| p.value.to_sat()).sum();
    let output_total: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
    let fee = input_total
        .checked_sub(output_total)
        .ok_or_else(|| LendingError::invalid_cet("repayment CET spends more than its inputs"))?;
    let required = vsize
        .checked_mul(ctx.fee_rate)
        .ok_or_else(|| LendingError::validation(format!("fee rate {} overflows the required fee", ctx.fee_rate)))?;
    if fee < required {
        return Err(LendingError::invalid_cet(format!(
            "repayment CET fee {} below required {}",
            fee, required
        )));
    }

    verify_signatures(
        tx,
        &prevouts,
        &ctx.vault.repayment,
        &ctx.borrower_key,
        CetKind::Repayment.borrower_sighash_type(),
        sigs,
    )
}

fn check_version_and_lock_time(tx: &Transaction) -> LendingResult<()> {
    if tx.version.0 != TX_VERSION {
        return Err(LendingError::invalid_cet(format!("unexpected version {}", tx.version.0)));
    }
    if tx.lock_time != LockTime::ZERO {
        return Err(LendingError::invalid_cet("CETs must not be time locked"));
    }
    Ok(())
}

/// Check that the inputs spend exactly the vault UTXOs and return their
/// prevouts in input order.
pub fn check_inputs(tx: &Transaction, utxos: &[VaultUtxo], vault: &VaultScripts) -> LendingResult<Vec<TxOut>> {
    if tx.input.len() != utxos.len() {
        return Err(LendingError::invalid_cet(format!(
            "expected {} inputs, got {}",
            utxos.len(),
            tx.input.len()
        )));
    }

    let vault_script = vault.script_pubkey()?;
    let mut seen = HashSet::new();
    let mut prevouts = Vec::with_capacity(tx.input.len());

    for (index, input) in tx.input.iter().enumerate() {
        let mut matched = None;
        for utxo in utxos {
            if utxo.outpoint()? == input.previous_output {
                matched = Some(utxo);
                break;
            }
        }
        let utxo = matched.ok_or_else(|| {
            LendingError::invalid_cet(format!(
                "input {} spends {} which is not a vault utxo",
                index, input.previous_output
            ))
        })?;

        if !seen.insert(input.previous_output) {
            return Err(LendingError::invalid_cet(format!(
                "input {} spends {} twice",
                index, input.previous_output
            )));
        }

        let prevout = utxo.txout()?;
        if prevout.script_pubkey != vault_script {
            return Err(LendingError::invalid_cet(format!(
                "utxo {} is not locked in vault {}",
                input.previous_output, vault.address
            )));
        }
        prevouts.push(prevout);
    }

    Ok(prevouts)
}

/// Script-path sighash of every input spending `leaf`.
pub fn script_spend_sighashes(
    tx: &Transaction,
    prevouts: &[TxOut],
    leaf: &LeafScript,
    sighash_type: TapSighashType,
) -> LendingResult<Vec<[u8; 32]>> {
    let leaf_hash = leaf.leaf_hash()?;
    let mut cache = SighashCache::new(tx);
    (0..tx.input.len())
        .map(|index| {
            cache
                .taproot_script_spend_signature_hash(index, &Prevouts::All(prevouts), leaf_hash, sighash_type)
                .map(digest)
                .map_err(|e| LendingError::invalid_cet(format!("sighash of input {}: {}", index, e)))
        })
        .collect()
}

/// Verify one adaptor signature per input.
pub fn verify_adaptor_signatures(
    tx: &Transaction,
    prevouts: &[TxOut],
    leaf: &LeafScript,
    key: &XOnlyPublicKey,
    point: &PublicKey,
    sighash_type: TapSighashType,
    sigs: &[String],
) -> LendingResult<()> {
    if sigs.len() != tx.input.len() {
        return Err(LendingError::invalid_cet(format!(
            "expected {} adaptor signatures, got {}",
            tx.input.len(),
            sigs.len()
        )));
    }

    let sighashes = script_spend_sighashes(tx, prevouts, leaf, sighash_type)?;
    for (index, (sig, sighash)) in sigs.iter().zip(sighashes.iter()).enumerate() {
        let adaptor_sig = AdaptorSignature::from_hex(sig)?;
        if !adaptor::verify(&adaptor_sig, sighash, key, point) {
            return Err(LendingError::signature(format!(
                "adaptor signature of input {} does not verify",
                index
            )));
        }
    }
    Ok(())
}

/// Verify one plain Schnorr signature per input, carrying `sighash_type`.
pub fn verify_signatures(
    tx: &Transaction,
    prevouts: &[TxOut],
    leaf: &LeafScript,
    key: &XOnlyPublicKey,
    sighash_type: TapSighashType,
    sigs: &[String],
) -> LendingResult<()> {
    if sigs.len() != tx.input.len() {
        return Err(LendingError::invalid_cet(format!(
            "expected {} signatures, got {}",
            tx.input.len(),
            sigs.len()
        )));
    }

    let sighashes = script_spend_sighashes(tx, prevouts, leaf, sighash_type)?;
    for (index, (sig, sighash)) in sigs.iter().zip(sighashes.iter()).enumerate() {
        let signature = parse_taproot_signature(sig)?;
        if signature.sighash_type != sighash_type {
            return Err(LendingError::invalid_cet(format!(
                "signature of input {} uses sighash {}, expected {}",
                index, signature.sighash_type, sighash_type
            )));
        }
        if !schnorr::verify(&signature.signature, sighash, key) {
            return Err(LendingError::signature(format!(
                "signature of input {} does not verify",
                index
            )));
        }
    }
    Ok(())
}

/// Parse a 64- or 65-byte taproot signature.
pub fn parse_taproot_signature(sig_hex: &str) -> LendingResult<taproot::Signature> {
    let bytes = hex::decode(sig_hex)?;
    taproot::Signature::from_slice(&bytes)
        .map_err(|e| LendingError::validation(format!("invalid taproot signature: {}", e)))
}
