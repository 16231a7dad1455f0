//! # Schnorr Adaptor Signatures
//!
//! An adaptor signature is a BIP-340 signature "encrypted" under a public
//! point `T`. It can be checked against `T` without knowing its discrete log,
//! becomes a valid signature once combined with the secret `t` (`T = t·G`),
//! and whoever sees both the adaptor and the adapted signature learns `t`.
//!
//! ## Encoding
//!
//! ```text
//! r_parity (1 byte, 0x02 even / 0x03 odd) || r_x (32 bytes) || s' (32 bytes)
//! ```
//!
//! `R' = R + T` is the adapted nonce point. BIP-340 requires the effective
//! nonce of the final signature to have an even Y coordinate, so when `R'` is
//! odd the signer negates `k` and the secret has to be *subtracted* when
//! adapting. Getting that sign wrong yields signatures that never verify.

use crate::error::{LendingError, LendingResult};
use crate::schnorr::{self, SECP};
use bitcoin::secp256k1::{schnorr::Signature, Parity, PublicKey, Scalar, SecretKey, XOnlyPublicKey};
use std::fmt;

/// Serialized adaptor signature size
pub const ADAPTOR_SIGNATURE_SIZE: usize = 65;

/// Domain separator for deterministic adaptor nonces
const NONCE_TAG: &str = "DLCLending/adaptor/nonce";

/// A 65-byte Schnorr adaptor signature.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AdaptorSignature {
    /// Adapted nonce point `R + T` (parity preserved)
    r: PublicKey,
    /// Pre-signature scalar `s'`
    s: [u8; 32],
}

impl AdaptorSignature {
    /// Parse from exactly 65 bytes.
    pub fn from_slice(bytes: &[u8]) -> LendingResult<Self> {
        if bytes.len() != ADAPTOR_SIGNATURE_SIZE {
            return Err(LendingError::validation(format!(
                "adaptor signature must be {} bytes, got {}",
                ADAPTOR_SIGNATURE_SIZE,
                bytes.len()
            )));
        }

        let r = PublicKey::from_slice(&bytes[..33])
            .map_err(|e| LendingError::validation(format!("invalid adaptor nonce point: {}", e)))?;

        let mut s = [0u8; 32];
        s.copy_from_slice(&bytes[33..]);
        SecretKey::from_slice(&s)
            .map_err(|_| LendingError::validation("adaptor signature scalar out of range"))?;

        Ok(Self { r, s })
    }

    /// Parse from hex.
    pub fn from_hex(sig_hex: &str) -> LendingResult<Self> {
        Self::from_slice(&hex::decode(sig_hex)?)
    }

    /// Serialize to 65 bytes.
    pub fn serialize(&self) -> [u8; ADAPTOR_SIGNATURE_SIZE] {
        let mut out = [0u8; ADAPTOR_SIGNATURE_SIZE];
        out[..33].copy_from_slice(&self.r.serialize());
        out[33..].copy_from_slice(&self.s);
        out
    }

    /// Hex encoding of [`AdaptorSignature::serialize`].
    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    fn r_x(&self) -> [u8; 32] {
        self.r.x_only_public_key().0.serialize()
    }

    fn is_odd(&self) -> bool {
        self.r.x_only_public_key().1 == Parity::Odd
    }

    fn s_key(&self) -> LendingResult<SecretKey> {
        SecretKey::from_slice(&self.s)
            .map_err(|_| LendingError::validation("adaptor signature scalar out of range"))
    }
}

impl fmt::Display for AdaptorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Create an adaptor signature over `message` encrypted under `encryption_point`.
pub fn sign(
    secret_key: &SecretKey,
    message: &[u8; 32],
    encryption_point: &PublicKey,
) -> LendingResult<AdaptorSignature> {
    let (d, pubkey) = schnorr::even_secret(secret_key);

    let nonce_bytes = schnorr::tagged_hash(
        NONCE_TAG,
        &[
            &d.secret_bytes()[..],
            &pubkey.serialize()[..],
            &encryption_point.serialize()[..],
            &message[..],
        ],
    );
    let mut k = SecretKey::from_slice(&schnorr::reduce_mod_order(nonce_bytes))
        .map_err(|_| LendingError::operation("adaptor_sign", "derived nonce is zero"))?;

    let r = PublicKey::from_secret_key(&SECP, &k);
    let adapted = r.combine(encryption_point)?;
    let (adapted_x, parity) = adapted.x_only_public_key();
    if parity == Parity::Odd {
        k = k.negate();
    }

    let e = schnorr::challenge(&adapted_x.serialize(), &pubkey, message)?;
    let s = k.add_tweak(&Scalar::from(d.mul_tweak(&e)?))?;

    Ok(AdaptorSignature {
        r: adapted,
        s: s.secret_bytes(),
    })
}

/// Check an adaptor signature against `public_key` and `encryption_point`.
///
/// Fails closed: any malformed component yields `false`.
pub fn verify(
    adaptor_sig: &AdaptorSignature,
    message: &[u8; 32],
    public_key: &XOnlyPublicKey,
    encryption_point: &PublicKey,
) -> bool {
    verify_inner(adaptor_sig, message, public_key, encryption_point).unwrap_or(false)
}

fn verify_inner(
    adaptor_sig: &AdaptorSignature,
    message: &[u8; 32],
    public_key: &XOnlyPublicKey,
    encryption_point: &PublicKey,
) -> LendingResult<bool> {
    let r_x = adaptor_sig.r_x();
    let e = schnorr::challenge(&r_x, public_key, message)?;

    let lhs = PublicKey::from_secret_key(&SECP, &adaptor_sig.s_key()?);

    // s'·G == R_even + e·P ∓ T
    let r_even = schnorr::lift_x(&XOnlyPublicKey::from_slice(&r_x)?);
    let ep = schnorr::lift_x(public_key).mul_tweak(&SECP, &e)?;
    let t = if adaptor_sig.is_odd() {
        *encryption_point
    } else {
        negate_point(encryption_point)
    };
    let rhs = PublicKey::combine_keys(&[&r_even, &ep, &t])?;

    Ok(lhs == rhs)
}

/// Decrypt an adaptor signature with the discrete log of its encryption point.
pub fn adapt(adaptor_sig: &AdaptorSignature, secret: &SecretKey) -> LendingResult<Signature> {
    let tweak = if adaptor_sig.is_odd() {
        secret.negate()
    } else {
        *secret
    };
    let s = adaptor_sig.s_key()?.add_tweak(&Scalar::from(tweak))?;

    let mut sig = [0u8; 64];
    sig[..32].copy_from_slice(&adaptor_sig.r_x());
    sig[32..].copy_from_slice(&s.secret_bytes());
    Ok(Signature::from_slice(&sig)?)
}

/// Recover the secret from an adaptor signature and its adapted form.
pub fn extract(adaptor_sig: &AdaptorSignature, adapted_sig: &Signature) -> LendingResult<SecretKey> {
    let adapted = adapted_sig.serialize();
    if adapted[..32] != adaptor_sig.r_x() {
        return Err(LendingError::signature(
            "adapted signature nonce does not match adaptor signature",
        ));
    }

    let s = SecretKey::from_slice(&adapted[32..])?;
    let s_prime = adaptor_sig.s_key()?;

    let secret = if adaptor_sig.is_odd() {
        s_prime.add_tweak(&Scalar::from(s.negate()))?
    } else {
        s.add_tweak(&Scalar::from(s_prime.negate()))?
    };
    Ok(secret)
}

/// Public point `t·G` of a secret.
pub fn secret_to_pubkey(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(&SECP, secret)
}

/// Negation of a curve point.
pub fn negate_point(point: &PublicKey) -> PublicKey {
    point.negate(&SECP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::{sha256, Hash};
    use bitcoin::secp256k1::Keypair;

    fn secret(seed: u32) -> SecretKey {
        let digest = sha256::Hash::hash(&seed.to_be_bytes()).to_byte_array();
        SecretKey::from_slice(&digest).unwrap()
    }

    fn xonly(sk: &SecretKey) -> XOnlyPublicKey {
        Keypair::from_secret_key(&SECP, sk).x_only_public_key().0
    }

    #[test]
    fn test_adaptor_roundtrip_both_parities() {
        let mut seen_even = false;
        let mut seen_odd = false;

        for i in 0..24u32 {
            let sk = secret(i);
            let t = secret(1000 + i);
            let point = secret_to_pubkey(&t);
            let message = sha256::Hash::hash(format!("cet-{}", i).as_bytes()).to_byte_array();

            let adaptor_sig = sign(&sk, &message, &point).unwrap();
            if adaptor_sig.is_odd() {
                seen_odd = true;
            } else {
                seen_even = true;
            }

            assert!(verify(&adaptor_sig, &message, &xonly(&sk), &point));

            let sig = adapt(&adaptor_sig, &t).unwrap();
            assert!(schnorr::verify(&sig, &message, &xonly(&sk)));

            let recovered = extract(&adaptor_sig, &sig).unwrap();
            assert_eq!(recovered, t);
        }

        assert!(seen_even && seen_odd, "both nonce parities must be exercised");
    }

    #[test]
    fn test_verify_fails_closed() {
        let sk = secret(1);
        let t = secret(2);
        let point = secret_to_pubkey(&t);
        let message = [7u8; 32];
        let adaptor_sig = sign(&sk, &message, &point).unwrap();

        // Wrong message
        assert!(!verify(&adaptor_sig, &[8u8; 32], &xonly(&sk), &point));
        // Wrong public key
        assert!(!verify(&adaptor_sig, &message, &xonly(&secret(3)), &point));
        // Wrong encryption point
        assert!(!verify(
            &adaptor_sig,
            &message,
            &xonly(&sk),
            &secret_to_pubkey(&secret(4))
        ));
    }

    #[test]
    fn test_adapt_with_wrong_secret_is_invalid() {
        let sk = secret(5);
        let t = secret(6);
        let message = [9u8; 32];
        let adaptor_sig = sign(&sk, &message, &secret_to_pubkey(&t)).unwrap();

        let sig = adapt(&adaptor_sig, &secret(7)).unwrap();
        assert!(!schnorr::verify(&sig, &message, &xonly(&sk)));
    }

    #[test]
    fn test_serialization() {
        let adaptor_sig = sign(&secret(8), &[1u8; 32], &secret_to_pubkey(&secret(9))).unwrap();
        let bytes = adaptor_sig.serialize();
        assert_eq!(bytes.len(), ADAPTOR_SIGNATURE_SIZE);
        assert!(bytes[0] == 0x02 || bytes[0] == 0x03);

        let parsed = AdaptorSignature::from_hex(&adaptor_sig.to_hex()).unwrap();
        assert_eq!(parsed, adaptor_sig);
    }

    #[test]
    fn test_malformed_length_rejected() {
        assert!(AdaptorSignature::from_slice(&[2u8; 64]).is_err());
        assert!(AdaptorSignature::from_slice(&[2u8; 66]).is_err());
        // Not a curve point
        let mut bytes = [0u8; 65];
        bytes[0] = 0x05;
        assert!(AdaptorSignature::from_slice(&bytes).is_err());
    }

    #[test]
    fn test_negate_point() {
        let point = secret_to_pubkey(&secret(10));
        let negated = negate_point(&point);
        assert_ne!(point, negated);
        assert_eq!(point.x_only_public_key().0, negated.x_only_public_key().0);
        assert_eq!(negate_point(&negated), point);
    }
}
