//! Supported borrower key schemes.
//!
//! A borrower key arrives as hex and its length decides the scheme. Every
//! scheme can be used inside the vault tapscripts (through its x-only
//! projection) and determines where repayments and refunds are paid.

use crate::error::{LendingError, LendingResult};
use crate::schnorr::SECP;
use bitcoin::{
    key::{CompressedPublicKey, PublicKey},
    secp256k1::XOnlyPublicKey,
    ScriptBuf,
};
use std::fmt;

/// A public key in one of the supported schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheme {
    /// Uncompressed legacy key, paid to P2PKH
    Ecdsa(PublicKey),
    /// Compressed key, paid to P2WPKH
    Segwit(CompressedPublicKey),
    /// BIP-340 x-only key, paid to a BIP-86 P2TR output
    Taproot(XOnlyPublicKey),
}

impl KeyScheme {
    /// Parse a hex key: 32 bytes is taproot, 33 bytes segwit, 65 bytes legacy.
    pub fn parse(key_hex: &str) -> LendingResult<Self> {
        let bytes = hex::decode(key_hex)?;
        match bytes.len() {
            32 => XOnlyPublicKey::from_slice(&bytes)
                .map(KeyScheme::Taproot)
                .map_err(|e| LendingError::validation(format!("invalid taproot key: {}", e))),
            33 => CompressedPublicKey::from_slice(&bytes)
                .map(KeyScheme::Segwit)
                .map_err(|e| LendingError::validation(format!("invalid segwit key: {}", e))),
            65 => PublicKey::from_slice(&bytes)
                .map(KeyScheme::Ecdsa)
                .map_err(|e| LendingError::validation(format!("invalid legacy key: {}", e))),
            n => Err(LendingError::validation(format!(
                "unsupported public key length {}",
                n
            ))),
        }
    }

    /// X-only projection used inside tapscripts.
    pub fn x_only(&self) -> XOnlyPublicKey {
        match self {
            KeyScheme::Ecdsa(pk) => pk.inner.x_only_public_key().0,
            KeyScheme::Segwit(pk) => pk.0.x_only_public_key().0,
            KeyScheme::Taproot(xonly) => *xonly,
        }
    }

    /// Output script that pays this key.
    pub fn payout_script(&self) -> ScriptBuf {
        match self {
            KeyScheme::Ecdsa(pk) => ScriptBuf::new_p2pkh(&pk.pubkey_hash()),
            KeyScheme::Segwit(pk) => ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()),
            KeyScheme::Taproot(xonly) => ScriptBuf::new_p2tr(&SECP, *xonly, None),
        }
    }

    /// Short scheme name for logs and queries.
    pub fn scheme_name(&self) -> &'static str {
        match self {
            KeyScheme::Ecdsa(_) => "ecdsa",
            KeyScheme::Segwit(_) => "segwit",
            KeyScheme::Taproot(_) => "taproot",
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScheme::Ecdsa(pk) => write!(f, "{}", pk),
            KeyScheme::Segwit(pk) => write!(f, "{}", pk),
            KeyScheme::Taproot(xonly) => write!(f, "{}", xonly),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{PublicKey as SecpPublicKey, SecretKey};

    fn full_key() -> SecpPublicKey {
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        SecpPublicKey::from_secret_key(&SECP, &sk)
    }

    #[test]
    fn test_scheme_detection() {
        let pk = full_key();

        let taproot = KeyScheme::parse(&hex::encode(pk.x_only_public_key().0.serialize())).unwrap();
        assert_eq!(taproot.scheme_name(), "taproot");
        assert!(taproot.payout_script().is_p2tr());

        let segwit = KeyScheme::parse(&hex::encode(pk.serialize())).unwrap();
        assert_eq!(segwit.scheme_name(), "segwit");
        assert!(segwit.payout_script().is_p2wpkh());

        let legacy = KeyScheme::parse(&hex::encode(pk.serialize_uncompressed())).unwrap();
        assert_eq!(legacy.scheme_name(), "ecdsa");
        assert!(legacy.payout_script().is_p2pkh());

        // All schemes project to the same tapscript key
        assert_eq!(taproot.x_only(), segwit.x_only());
        assert_eq!(segwit.x_only(), legacy.x_only());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        assert!(KeyScheme::parse("00").is_err());
        assert!(KeyScheme::parse(&"ff".repeat(33)).is_err());
        assert!(KeyScheme::parse("not hex").is_err());
    }
}
