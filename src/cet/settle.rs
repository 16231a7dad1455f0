//! Settlement: decrypting adaptor signatures with an oracle attestation and
//! assembling the two-signature script-path witness.

use super::verify::{parse_taproot_signature, verify_signatures};
use super::{tx_from_hex, tx_to_hex, CetKind, DlcMeta};
use crate::adaptor::{self, AdaptorSignature};
use crate::error::{LendingError, LendingResult};
use crate::vault::LeafScript;
use bitcoin::{
    secp256k1::{SecretKey, XOnlyPublicKey},
    taproot, TapSighashType, Transaction, Witness,
};
use log::debug;

/// Decrypt adaptor signatures into taproot signatures carrying `sighash_type`.
pub fn adapt_signatures(
    adaptor_sigs: &[String],
    secret: &SecretKey,
    sighash_type: TapSighashType,
) -> LendingResult<Vec<String>> {
    adaptor_sigs
        .iter()
        .map(|sig| {
            let adaptor_sig = AdaptorSignature::from_hex(sig)?;
            let signature = adaptor::adapt(&adaptor_sig, secret)?;
            Ok(hex::encode(
                taproot::Signature {
                    signature,
                    sighash_type,
                }
                .to_vec(),
            ))
        })
        .collect()
}

/// Fill in the witness `[dcm_sig, borrower_sig, script, control_block]` of
/// every input.
pub fn assemble_script_spend(
    tx: &Transaction,
    leaf: &LeafScript,
    dcm_sigs: &[String],
    borrower_sigs: &[String],
) -> LendingResult<Transaction> {
    if dcm_sigs.len() != tx.input.len() || borrower_sigs.len() != tx.input.len() {
        return Err(LendingError::validation(format!(
            "expected {} signatures per party, got {} dcm and {} borrower",
            tx.input.len(),
            dcm_sigs.len(),
            borrower_sigs.len()
        )));
    }

    let script = leaf.script_buf()?;
    let control_block = leaf.control_block_bytes()?;
    let mut signed = tx.clone();

    for ((input, dcm_sig), borrower_sig) in signed.input.iter_mut().zip(dcm_sigs).zip(borrower_sigs) {
        let mut witness = Witness::new();
        witness.push(parse_taproot_signature(dcm_sig)?.to_vec());
        witness.push(parse_taproot_signature(borrower_sig)?.to_vec());
        witness.push(script.as_bytes());
        witness.push(&control_block);
        input.witness = witness;
    }

    Ok(signed)
}

/// Progress the settlement of a liquidation or default-liquidation CET.
///
/// Adapts the borrower's adaptor signatures with the attestation secret and,
/// once the DCM signatures are present, stores the signed transaction.
/// Returns whether the CET is fully signed.
pub fn settle_liquidation(
    meta: &mut DlcMeta,
    kind: CetKind,
    secret: &SecretKey,
    auth_key: &XOnlyPublicKey,
) -> LendingResult<bool> {
    if kind == CetKind::Repayment {
        return Err(LendingError::validation("repayment CETs settle through settle_repayment"));
    }

    let tx = tx_from_hex(&meta.cet(kind).tx)?;
    let prevouts = meta.prevouts(&tx)?;
    let leaf = meta.vault.liquidation.clone();
    let cet = meta.cet_mut(kind);
    if cet.is_signed() {
        return Ok(true);
    }
    if tx.output.is_empty() {
        return Err(LendingError::state("liquidation CET", "completed with payout", "template"));
    }

    if cet.adapted_signatures.is_empty() {
        let sighash_type = kind.borrower_sighash_type();
        let adapted = adapt_signatures(&cet.borrower_adaptor_signatures, secret, sighash_type)?;
        verify_signatures(&tx, &prevouts, &leaf, auth_key, sighash_type, &adapted)
            .map_err(|e| LendingError::signature(format!("adapted {} signatures: {}", kind, e)))?;
        cet.adapted_signatures = adapted;
        debug!("adapted {} borrower signatures", kind);
    }

    if cet.dcm_signatures.is_empty() {
        return Ok(false);
    }

    let signed = assemble_script_spend(&tx, &leaf, &cet.dcm_signatures, &cet.adapted_signatures)?;
    cet.signed_tx_hex = tx_to_hex(&signed);
    Ok(true)
}

/// Progress the settlement of the repayment CET.
///
/// The DCM side is the adaptor here: its signatures are decrypted with the
/// repaid-outcome attestation secret and paired with the borrower's plain
/// signatures. Returns whether the CET is fully signed.
pub fn settle_repayment(meta: &mut DlcMeta, secret: &SecretKey, dcm_key: &XOnlyPublicKey) -> LendingResult<bool> {
    let tx = tx_from_hex(&meta.repayment_cet.tx)?;
    let prevouts = meta.prevouts(&tx)?;
    let leaf = meta.vault.repayment.clone();
    let cet = meta.cet_mut(CetKind::Repayment);
    if cet.is_signed() {
        return Ok(true);
    }
    if cet.dcm_adaptor_signatures.is_empty() {
        return Ok(false);
    }

    let sighash_type = CetKind::Repayment.dcm_sighash_type();
    let adapted = adapt_signatures(&cet.dcm_adaptor_signatures, secret, sighash_type)?;
    verify_signatures(&tx, &prevouts, &leaf, dcm_key, sighash_type, &adapted)
        .map_err(|e| LendingError::signature(format!("adapted repayment signatures: {}", e)))?;

    let signed = assemble_script_spend(&tx, &leaf, &adapted, &cet.borrower_signatures)?;
    cet.adapted_signatures = adapted;
    cet.signed_tx_hex = tx_to_hex(&signed);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cet::build::{build_dlc_meta, build_repayment_cet, complete_liquidation_cet, liquidation_cet_template};
    use crate::cet::sign::{sign_adaptor_inputs, sign_inputs};
    use crate::cet::verify::script_spend_sighashes;
    use crate::cet::VaultUtxo;
    use crate::schnorr::{self, SECP};
    use crate::vault::build_vault;
    use bitcoin::secp256k1::Keypair;
    use bitcoin::{Network, ScriptBuf};

    fn secret(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn xonly(sk: &SecretKey) -> XOnlyPublicKey {
        Keypair::from_secret_key(&SECP, sk).x_only_public_key().0
    }

    fn meta(borrower: &SecretKey, auth: &SecretKey, dcm: &SecretKey) -> DlcMeta {
        let vault = build_vault(&xonly(borrower), &xonly(auth), &xonly(dcm), 1_800_000_000, Network::Regtest).unwrap();
        let mut meta = build_dlc_meta(vault);
        meta.vault_utxos = vec![VaultUtxo {
            txid: hex::encode([0x11; 32]),
            vout: 0,
            amount: 200_000,
            script_pubkey: meta.vault.script_pubkey.clone(),
        }];
        meta
    }

    #[test]
    fn test_liquidation_settlement_waits_for_dcm() {
        let (borrower, auth, dcm, oracle_secret) = (secret(1), secret(2), secret(3), secret(4));
        let mut meta = meta(&borrower, &auth, &dcm);
        let template = liquidation_cet_template(&meta.vault_utxos).unwrap();
        let prevouts = meta.prevouts(&template).unwrap();

        let adaptor_sigs = sign_adaptor_inputs(
            &template,
            &prevouts,
            &meta.vault.liquidation,
            &auth,
            &adaptor::secret_to_pubkey(&oracle_secret),
            TapSighashType::NonePlusAnyoneCanPay,
        )
        .unwrap();

        let payout = ScriptBuf::new_p2tr(&SECP, xonly(&dcm), None);
        let tx = complete_liquidation_cet(template, &meta.vault_utxos, &meta.vault, &payout, 2).unwrap();
        meta.liquidation_cet.tx = tx_to_hex(&tx);
        meta.liquidation_cet.borrower_adaptor_signatures = adaptor_sigs;

        // No DCM signatures yet
        assert!(!settle_liquidation(&mut meta, CetKind::Liquidation, &oracle_secret, &xonly(&auth)).unwrap());
        assert_eq!(meta.liquidation_cet.adapted_signatures.len(), 1);

        meta.liquidation_cet.dcm_signatures =
            sign_inputs(&tx, &prevouts, &meta.vault.liquidation, &dcm, TapSighashType::Default).unwrap();
        assert!(settle_liquidation(&mut meta, CetKind::Liquidation, &oracle_secret, &xonly(&auth)).unwrap());

        let signed = tx_from_hex(&meta.liquidation_cet.signed_tx_hex).unwrap();
        let witness = &signed.input[0].witness;
        assert_eq!(witness.len(), 4);
        assert_eq!(witness.nth(0).unwrap().len(), 64);
        assert_eq!(witness.nth(1).unwrap().len(), 65);

        // The adapted borrower signature covers the completed transaction
        let sighash = script_spend_sighashes(
            &signed,
            &prevouts,
            &meta.vault.liquidation,
            TapSighashType::NonePlusAnyoneCanPay,
        )
        .unwrap()[0];
        let sig = parse_taproot_signature(&hex::encode(witness.nth(1).unwrap())).unwrap();
        assert!(schnorr::verify(&sig.signature, &sighash, &xonly(&auth)));
    }

    #[test]
    fn test_wrong_attestation_secret_rejected() {
        let (borrower, auth, dcm) = (secret(1), secret(2), secret(3));
        let mut meta = meta(&borrower, &auth, &dcm);
        let template = liquidation_cet_template(&meta.vault_utxos).unwrap();
        let prevouts = meta.prevouts(&template).unwrap();
        meta.liquidation_cet.borrower_adaptor_signatures = sign_adaptor_inputs(
            &template,
            &prevouts,
            &meta.vault.liquidation,
            &auth,
            &adaptor::secret_to_pubkey(&secret(4)),
            TapSighashType::NonePlusAnyoneCanPay,
        )
        .unwrap();
        let payout = ScriptBuf::new_p2tr(&SECP, xonly(&dcm), None);
        let tx = complete_liquidation_cet(template, &meta.vault_utxos, &meta.vault, &payout, 2).unwrap();
        meta.liquidation_cet.tx = tx_to_hex(&tx);

        let result = settle_liquidation(&mut meta, CetKind::Liquidation, &secret(5), &xonly(&auth));
        assert!(matches!(result, Err(LendingError::SignatureVerification { .. })));
        assert!(meta.liquidation_cet.adapted_signatures.is_empty());
    }

    #[test]
    fn test_repayment_settlement() {
        let (borrower, auth, dcm, oracle_secret) = (secret(1), secret(2), secret(3), secret(6));
        let mut meta = meta(&borrower, &auth, &dcm);
        let payout = ScriptBuf::new_p2tr(&SECP, xonly(&borrower), None);
        let tx = build_repayment_cet(&meta.vault_utxos, &meta.vault, &payout, 2).unwrap();
        let prevouts = meta.prevouts(&tx).unwrap();
        meta.repayment_cet.tx = tx_to_hex(&tx);
        meta.repayment_cet.borrower_signatures = sign_inputs(
            &tx,
            &prevouts,
            &meta.vault.repayment,
            &borrower,
            TapSighashType::AllPlusAnyoneCanPay,
        )
        .unwrap();

        assert!(!settle_repayment(&mut meta, &oracle_secret, &xonly(&dcm)).unwrap());

        meta.repayment_cet.dcm_adaptor_signatures = sign_adaptor_inputs(
            &tx,
            &prevouts,
            &meta.vault.repayment,
            &dcm,
            &adaptor::secret_to_pubkey(&oracle_secret),
            TapSighashType::AllPlusAnyoneCanPay,
        )
        .unwrap();
        assert!(settle_repayment(&mut meta, &oracle_secret, &xonly(&dcm)).unwrap());

        let signed = tx_from_hex(&meta.repayment_cet.signed_tx_hex).unwrap();
        assert_eq!(signed.input[0].witness.len(), 4);
        assert_eq!(signed.input[0].witness.nth(0).unwrap().len(), 65);
        assert_eq!(signed.input[0].witness.nth(2).unwrap(), meta.vault.repayment.script_buf().unwrap().as_bytes());
    }
}
