//! CET construction and fee estimation.

use super::{Cet, DlcMeta, VaultUtxo};
use crate::config::bitcoin_tx::{
    DUST_THRESHOLD_SATS, MAX_TRANSACTION_WEIGHT, SCHNORR_SIG_SIZE, SCHNORR_SIG_WITH_SIGHASH_SIZE,
    TX_VERSION,
};
use crate::error::{LendingError, LendingResult};
use crate::vault::{LeafKind, LeafScript, VaultScripts};
use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Witness,
};

/// Witness count byte plus one length byte for each of the four items.
const WITNESS_FRAMING: usize = 1 + 4;

/// Fresh DLC meta for a vault, no CETs yet.
pub fn build_dlc_meta(vault: VaultScripts) -> DlcMeta {
    DlcMeta {
        vault,
        liquidation_cet: Cet::default(),
        default_liquidation_cet: Cet::default(),
        repayment_cet: Cet::default(),
        timeout_refund_tx: String::new(),
        vault_utxos: Vec::new(),
    }
}

/// Estimated witness bytes of one input spending `leaf`.
///
/// Liquidation spends carry a 64-byte DCM signature and a 65-byte borrower
/// signature, repayment and refund spends two 65-byte signatures.
pub fn witness_size(kind: LeafKind, leaf: &LeafScript) -> usize {
    let signatures = match kind {
        LeafKind::Liquidation => SCHNORR_SIG_SIZE + SCHNORR_SIG_WITH_SIGHASH_SIZE,
        LeafKind::Repayment | LeafKind::TimeoutRefund => 2 * SCHNORR_SIG_WITH_SIGHASH_SIZE,
    };
    signatures + leaf.witness_overhead() + WITNESS_FRAMING
}

/// Virtual size of `tx` once every input carries `witness_per_input` bytes.
pub fn estimate_vsize(tx: &Transaction, witness_per_input: usize) -> u64 {
    estimate_weight(tx, witness_per_input).div_ceil(4)
}

fn estimate_weight(tx: &Transaction, witness_per_input: usize) -> u64 {
    // Marker and flag bytes count once, in witness units
    let witness = 2 + tx.input.len() * witness_per_input;
    (tx.base_size() * 4 + witness) as u64
}

fn unsigned_spend(utxos: &[VaultUtxo], lock_time: LockTime, sequence: Sequence) -> LendingResult<Transaction> {
    if utxos.is_empty() {
        return Err(LendingError::insufficient("vault utxos", 1, 0));
    }

    let input = utxos
        .iter()
        .map(|utxo| {
            Ok(TxIn {
                previous_output: utxo.outpoint()?,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            })
        })
        .collect::<LendingResult<Vec<_>>>()?;

    Ok(Transaction {
        version: Version(TX_VERSION),
        lock_time,
        input,
        output: Vec::new(),
    })
}

/// Add a single output paying `payout` everything minus the fee.
fn pay_all(
    mut tx: Transaction,
    utxos: &[VaultUtxo],
    payout: &ScriptBuf,
    fee_rate: u64,
    witness_per_input: usize,
) -> LendingResult<Transaction> {
    let total: u64 = utxos.iter().map(|u| u.amount).sum();

    tx.output.push(TxOut {
        value: Amount::ZERO,
        script_pubkey: payout.clone(),
    });

    let weight = estimate_weight(&tx, witness_per_input);
    if weight > MAX_TRANSACTION_WEIGHT {
        return Err(LendingError::invalid_cet(format!(
            "transaction weight {} exceeds {}",
            weight, MAX_TRANSACTION_WEIGHT
        )));
    }

    let fee = estimate_vsize(&tx, witness_per_input)
        .checked_mul(fee_rate)
        .ok_or_else(|| LendingError::validation(format!("fee rate {} overflows the transaction fee", fee_rate)))?;
    let value = total.saturating_sub(fee);
    if value < DUST_THRESHOLD_SATS {
        return Err(LendingError::insufficient(
            "output value",
            DUST_THRESHOLD_SATS,
            value,
        ));
    }

    tx.output[0].value = Amount::from_sat(value);
    Ok(tx)
}

/// The liquidation CET as the borrower signs it: all vault inputs, no outputs.
pub fn liquidation_cet_template(utxos: &[VaultUtxo]) -> LendingResult<Transaction> {
    unsigned_spend(utxos, LockTime::ZERO, Sequence::MAX)
}

/// Complete a liquidation CET template with the DCM payout.
pub fn complete_liquidation_cet(
    template: Transaction,
    utxos: &[VaultUtxo],
    vault: &VaultScripts,
    payout: &ScriptBuf,
    fee_rate: u64,
) -> LendingResult<Transaction> {
    if !template.output.is_empty() {
        return Err(LendingError::invalid_cet("liquidation CET template already has outputs"));
    }
    let witness = witness_size(LeafKind::Liquidation, &vault.liquidation);
    pay_all(template, utxos, payout, fee_rate, witness)
}

/// Liquidation CET paying the DCM.
pub fn build_liquidation_cet(
    utxos: &[VaultUtxo],
    vault: &VaultScripts,
    dcm_payout: &ScriptBuf,
    fee_rate: u64,
) -> LendingResult<Transaction> {
    complete_liquidation_cet(liquidation_cet_template(utxos)?, utxos, vault, dcm_payout, fee_rate)
}

/// Default-liquidation CET. Same transaction as the liquidation CET, it
/// differs only in the outcome its adaptor signatures are encrypted to.
pub fn build_default_liquidation_cet(
    utxos: &[VaultUtxo],
    vault: &VaultScripts,
    dcm_payout: &ScriptBuf,
    fee_rate: u64,
) -> LendingResult<Transaction> {
    build_liquidation_cet(utxos, vault, dcm_payout, fee_rate)
}

/// Repayment CET returning the collateral to the borrower.
pub fn build_repayment_cet(
    utxos: &[VaultUtxo],
    vault: &VaultScripts,
    borrower_payout: &ScriptBuf,
    fee_rate: u64,
) -> LendingResult<Transaction> {
    let tx = unsigned_spend(utxos, LockTime::ZERO, Sequence::MAX)?;
    let witness = witness_size(LeafKind::Repayment, &vault.repayment);
    pay_all(tx, utxos, borrower_payout, fee_rate, witness)
}

/// Refund transaction spendable by the borrower alone after the final timeout.
pub fn build_timeout_refund_tx(
    utxos: &[VaultUtxo],
    vault: &VaultScripts,
    borrower_payout: &ScriptBuf,
    fee_rate: u64,
) -> LendingResult<Transaction> {
    let lock_time = LockTime::from_time(vault.final_timeout as u32)
        .map_err(|e| LendingError::validation(format!("invalid final timeout: {}", e)))?;
    let tx = unsigned_spend(utxos, lock_time, Sequence::ENABLE_LOCKTIME_NO_RBF)?;
    let witness = witness_size(LeafKind::TimeoutRefund, &vault.timeout_refund);
    pay_all(tx, utxos, borrower_payout, fee_rate, witness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schnorr::SECP;
    use crate::vault::build_vault;
    use bitcoin::secp256k1::{Keypair, SecretKey, XOnlyPublicKey};
    use bitcoin::Network;

    fn key(byte: u8) -> XOnlyPublicKey {
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(&SECP, &sk).x_only_public_key().0
    }

    fn vault() -> VaultScripts {
        build_vault(&key(1), &key(2), &key(3), 1_800_000_000, Network::Regtest).unwrap()
    }

    fn utxo(vault: &VaultScripts, index: u8, amount: u64) -> VaultUtxo {
        VaultUtxo {
            txid: hex::encode([index; 32]),
            vout: index as u32,
            amount,
            script_pubkey: vault.script_pubkey.clone(),
        }
    }

    #[test]
    fn test_liquidation_template_has_no_outputs() {
        let vault = vault();
        let utxos = vec![utxo(&vault, 1, 100_000), utxo(&vault, 2, 100_000)];
        let template = liquidation_cet_template(&utxos).unwrap();
        assert_eq!(template.input.len(), 2);
        assert!(template.output.is_empty());

        let payout = ScriptBuf::new_p2tr(&SECP, key(3), None);
        let cet = complete_liquidation_cet(template.clone(), &utxos, &vault, &payout, 2).unwrap();
        assert_eq!(cet.input, template.input);
        assert_eq!(cet.output.len(), 1);
        assert!(cet.output[0].value.to_sat() < 200_000);
    }

    #[test]
    fn test_default_liquidation_matches_liquidation() {
        let vault = vault();
        let utxos = vec![utxo(&vault, 1, 120_000)];
        let dcm_payout = ScriptBuf::new_p2tr(&SECP, key(3), None);

        let liquidation = build_liquidation_cet(&utxos, &vault, &dcm_payout, 3).unwrap();
        let default = build_default_liquidation_cet(&utxos, &vault, &dcm_payout, 3).unwrap();
        assert_eq!(liquidation, default);
        assert_eq!(liquidation.output[0].script_pubkey, dcm_payout);

        // Liquidation witnesses are smaller, so less goes to fees
        let repayment = build_repayment_cet(&utxos, &vault, &dcm_payout, 3).unwrap();
        assert!(liquidation.output[0].value > repayment.output[0].value);
    }

    #[test]
    fn test_fee_scales_with_rate() {
        let vault = vault();
        let utxos = vec![utxo(&vault, 1, 50_000)];
        let payout = ScriptBuf::new_p2tr(&SECP, key(1), None);

        let low = build_repayment_cet(&utxos, &vault, &payout, 1).unwrap();
        let high = build_repayment_cet(&utxos, &vault, &payout, 10).unwrap();
        let vsize = estimate_vsize(&low, witness_size(LeafKind::Repayment, &vault.repayment));

        assert_eq!(50_000 - low.output[0].value.to_sat(), vsize);
        assert_eq!(50_000 - high.output[0].value.to_sat(), vsize * 10);
    }

    #[test]
    fn test_overflowing_fee_rate_rejected() {
        let vault = vault();
        let utxos = vec![utxo(&vault, 1, 50_000)];
        let payout = ScriptBuf::new_p2tr(&SECP, key(1), None);
        assert!(matches!(
            build_repayment_cet(&utxos, &vault, &payout, u64::MAX),
            Err(LendingError::Validation { .. })
        ));
        assert!(matches!(
            build_liquidation_cet(&utxos, &vault, &payout, u64::MAX),
            Err(LendingError::Validation { .. })
        ));
    }

    #[test]
    fn test_dust_output_rejected() {
        let vault = vault();
        let utxos = vec![utxo(&vault, 1, 1_000)];
        let payout = ScriptBuf::new_p2tr(&SECP, key(1), None);
        assert!(build_repayment_cet(&utxos, &vault, &payout, 5).is_err());
    }

    #[test]
    fn test_timeout_refund_is_time_locked() {
        let vault = vault();
        let utxos = vec![utxo(&vault, 1, 80_000)];
        let payout = ScriptBuf::new_p2tr(&SECP, key(1), None);
        let refund = build_timeout_refund_tx(&utxos, &vault, &payout, 1).unwrap();

        assert_eq!(refund.lock_time, LockTime::from_time(1_800_000_000).unwrap());
        assert!(refund.input[0].sequence.enables_absolute_lock_time());
    }

    #[test]
    fn test_no_utxos_rejected() {
        assert!(liquidation_cet_template(&[]).is_err());
    }

    #[test]
    fn test_liquidation_witness_is_smaller() {
        let vault = vault();
        assert!(
            witness_size(LeafKind::Liquidation, &vault.liquidation)
                < witness_size(LeafKind::Repayment, &vault.repayment)
        );
    }
}
