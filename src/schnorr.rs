//! # BIP-340 Schnorr Helpers
//!
//! Shared secp256k1 context, BIP-340 tagged hashes and challenges, and
//! signing with a pre-committed nonce. The adaptor-signature module and the
//! oracle signature-point derivation both build on the challenge computed
//! here, so an adapted signature verifies with a stock BIP-340 verifier.

use crate::error::{LendingError, LendingResult};
use bitcoin::{
    hashes::{sha256, Hash, HashEngine},
    secp256k1::{
        constants::CURVE_ORDER, schnorr, All, Keypair, Message, Parity, PublicKey, Scalar,
        Secp256k1, SecretKey, XOnlyPublicKey,
    },
};
use lazy_static::lazy_static;

lazy_static! {
    /// Process-wide secp256k1 context (signing + verification).
    pub static ref SECP: Secp256k1<All> = Secp256k1::new();
}

/// BIP-340 challenge tag
pub const CHALLENGE_TAG: &str = "BIP0340/challenge";

/// Compute `SHA256(SHA256(tag) || SHA256(tag) || chunks...)`.
pub fn tagged_hash(tag: &str, chunks: &[&[u8]]) -> [u8; 32] {
    let tag_hash = sha256::Hash::hash(tag.as_bytes());
    let mut engine = sha256::Hash::engine();
    engine.input(tag_hash.as_byte_array());
    engine.input(tag_hash.as_byte_array());
    for chunk in chunks {
        engine.input(chunk);
    }
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// Reduce a 256-bit big-endian integer modulo the curve order.
///
/// Any 256-bit value is below `2n`, so a single conditional subtraction is
/// enough.
pub fn reduce_mod_order(bytes: [u8; 32]) -> [u8; 32] {
    if bytes < CURVE_ORDER {
        return bytes;
    }
    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut diff = bytes[i] as i16 - CURVE_ORDER[i] as i16 - borrow;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out[i] = diff as u8;
    }
    out
}

/// Convert 32 bytes to a scalar, reducing modulo the curve order.
pub fn scalar_from_bytes(bytes: [u8; 32]) -> LendingResult<Scalar> {
    Scalar::from_be_bytes(reduce_mod_order(bytes))
        .map_err(|_| LendingError::validation("scalar out of range"))
}

/// BIP-340 challenge `e = int(hash_challenge(r_x || p_x || m)) mod n`.
pub fn challenge(r_x: &[u8; 32], pubkey: &XOnlyPublicKey, message: &[u8; 32]) -> LendingResult<Scalar> {
    let hash = tagged_hash(CHALLENGE_TAG, &[&r_x[..], &pubkey.serialize()[..], &message[..]]);
    scalar_from_bytes(hash)
}

/// Secret key adjusted so that its public key has an even Y coordinate.
pub fn even_secret(secret: &SecretKey) -> (SecretKey, XOnlyPublicKey) {
    let keypair = Keypair::from_secret_key(&SECP, secret);
    let (xonly, parity) = keypair.x_only_public_key();
    match parity {
        Parity::Even => (*secret, xonly),
        Parity::Odd => (secret.negate(), xonly),
    }
}

/// Sign `message` with `secret` using the pre-committed `nonce`.
///
/// This is the signing step of a DLC oracle: the nonce's public point was
/// published in advance, so anyone can compute the signature point
/// `R + e·P` before the signature exists.
pub fn sign_with_nonce(
    secret: &SecretKey,
    nonce: &SecretKey,
    message: &[u8; 32],
) -> LendingResult<schnorr::Signature> {
    let (d, pubkey) = even_secret(secret);
    let (k, r_x) = even_secret(nonce);
    let r_bytes = r_x.serialize();

    let e = challenge(&r_bytes, &pubkey, message)?;
    let ed = d.mul_tweak(&e)?;
    let s = k.add_tweak(&Scalar::from(ed))?;

    let mut sig = [0u8; 64];
    sig[..32].copy_from_slice(&r_bytes);
    sig[32..].copy_from_slice(&s.secret_bytes());
    Ok(schnorr::Signature::from_slice(&sig)?)
}

/// Verify a BIP-340 signature over a 32-byte digest.
pub fn verify(signature: &schnorr::Signature, message: &[u8; 32], pubkey: &XOnlyPublicKey) -> bool {
    let msg = Message::from_digest(*message);
    SECP.verify_schnorr(signature, &msg, pubkey).is_ok()
}

/// Lift an x-only key to the full point with even Y.
pub fn lift_x(xonly: &XOnlyPublicKey) -> PublicKey {
    xonly.public_key(Parity::Even)
}

/// Parse a 32-byte x-only public key from hex.
pub fn parse_xonly(pubkey_hex: &str) -> LendingResult<XOnlyPublicKey> {
    let bytes = hex::decode(pubkey_hex)?;
    if bytes.len() != 32 {
        return Err(LendingError::validation(format!(
            "public key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    XOnlyPublicKey::from_slice(&bytes)
        .map_err(|e| LendingError::validation(format!("invalid public key: {}", e)))
}

/// Parse a 32-byte secret key from hex.
pub fn parse_secret(secret_hex: &str) -> LendingResult<SecretKey> {
    let bytes = hex::decode(secret_hex)?;
    if bytes.len() != 32 {
        return Err(LendingError::validation(format!(
            "secret key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    SecretKey::from_slice(&bytes)
        .map_err(|e| LendingError::validation(format!("invalid secret key: {}", e)))
}

/// Parse a 64-byte Schnorr signature from hex.
pub fn parse_signature(signature_hex: &str) -> LendingResult<schnorr::Signature> {
    let bytes = hex::decode(signature_hex)?;
    if bytes.len() != 64 {
        return Err(LendingError::validation(format!(
            "signature must be 64 bytes, got {}",
            bytes.len()
        )));
    }
    schnorr::Signature::from_slice(&bytes)
        .map_err(|e| LendingError::validation(format!("invalid signature: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_reduce_mod_order() {
        let small = [1u8; 32];
        assert_eq!(reduce_mod_order(small), small);

        let mut above = CURVE_ORDER;
        above[31] += 5;
        let reduced = reduce_mod_order(above);
        let mut expected = [0u8; 32];
        expected[31] = 5;
        assert_eq!(reduced, expected);

        assert_eq!(reduce_mod_order(CURVE_ORDER), [0u8; 32]);
    }

    #[test]
    fn test_sign_with_nonce_verifies() {
        let message = sha256::Hash::hash(b"outcome").to_byte_array();
        for (d, k) in [(0x11u8, 0x22u8), (0x33, 0x44), (0x55, 0x66), (0x77, 0x7f)] {
            let sk = secret(d);
            let nonce = secret(k);
            let sig = sign_with_nonce(&sk, &nonce, &message).unwrap();

            let (pubkey, _) = Keypair::from_secret_key(&SECP, &sk).x_only_public_key();
            assert!(verify(&sig, &message, &pubkey));

            let (nonce_x, _) = Keypair::from_secret_key(&SECP, &nonce).x_only_public_key();
            assert_eq!(sig.serialize()[..32], nonce_x.serialize());
        }
    }

    #[test]
    fn test_tagged_hash_matches_bip340_challenge_domain() {
        let a = tagged_hash(CHALLENGE_TAG, &[b"abc".as_slice()]);
        let b = tagged_hash(CHALLENGE_TAG, &[b"ab".as_slice(), b"c".as_slice()]);
        assert_eq!(a, b);
        assert_ne!(a, tagged_hash("BIP0340/nonce", &[b"abc".as_slice()]));
    }

    #[test]
    fn test_parse_helpers_reject_bad_lengths() {
        assert!(parse_xonly("abcd").is_err());
        assert!(parse_secret("00").is_err());
        assert!(parse_signature(&"aa".repeat(65)).is_err());
        assert!(parse_xonly("zz").is_err());
    }
}
