//! Client-side signing of vault spends.
//!
//! Borrowers use these to produce the signatures a CET submission or a
//! redemption carries. Keys never reach the settlement core.

use super::verify::script_spend_sighashes;
use crate::adaptor;
use crate::error::LendingResult;
use crate::schnorr::{self, SECP};
use crate::vault::LeafScript;
use bitcoin::{
    secp256k1::{Keypair, Message, PublicKey, SecretKey},
    taproot, TapSighashType, Transaction, TxOut,
};

/// Adaptor-sign every input of `tx` spending `leaf` under `point`.
pub fn sign_adaptor_inputs(
    tx: &Transaction,
    prevouts: &[TxOut],
    leaf: &LeafScript,
    secret: &SecretKey,
    point: &PublicKey,
    sighash_type: TapSighashType,
) -> LendingResult<Vec<String>> {
    script_spend_sighashes(tx, prevouts, leaf, sighash_type)?
        .iter()
        .map(|sighash| Ok(adaptor::sign(secret, sighash, point)?.to_hex()))
        .collect()
}

/// Sign every input of `tx` spending `leaf`.
///
/// Signatures carry an explicit sighash byte unless `sighash_type` is
/// `Default`, the encoding the witness expects.
pub fn sign_inputs(
    tx: &Transaction,
    prevouts: &[TxOut],
    leaf: &LeafScript,
    secret: &SecretKey,
    sighash_type: TapSighashType,
) -> LendingResult<Vec<String>> {
    let keypair = Keypair::from_secret_key(&SECP, secret);
    Ok(script_spend_sighashes(tx, prevouts, leaf, sighash_type)?
        .iter()
        .map(|sighash| {
            let signature = SECP.sign_schnorr_no_aux_rand(&Message::from_digest(*sighash), &keypair);
            let sig = taproot::Signature {
                signature,
                sighash_type,
            };
            hex::encode(sig.to_vec())
        })
        .collect())
}

/// Encode raw 64-byte signatures from the signing network as taproot
/// signatures carrying `sighash_type`.
pub fn attach_sighash_type(sigs: &[String], sighash_type: TapSighashType) -> LendingResult<Vec<String>> {
    sigs.iter()
        .map(|sig| {
            let signature = schnorr::parse_signature(sig)?;
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
