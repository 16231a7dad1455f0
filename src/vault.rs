//! # Taproot Vault Script Builder
//!
//! Every loan locks its collateral in a P2TR output shared by the borrower
//! and the DCM (custodian committee). The output commits to an aggregate
//! internal key and a three-leaf script tree:
//!
//! ```text
//!            root
//!           /    \
//!   liquidation   *
//!                / \
//!        repayment   timeout refund
//! ```
//!
//! - **Liquidation**: `<auth> OP_CHECKSIGVERIFY <dcm> OP_CHECKSIG`
//! - **Repayment**: `<borrower> OP_CHECKSIGVERIFY <dcm> OP_CHECKSIG`
//! - **Timeout refund**: `<timeout> OP_CHECKLOCKTIMEVERIFY OP_DROP <borrower> OP_CHECKSIG`
//!
//! The internal key is the BIP-327 (MuSig2) KeyAgg of the borrower and DCM
//! keys. The address is recomputed independently by queries, so the builder
//! is a pure function of its inputs: same keys and timeout, same bytes.

use crate::error::{LendingError, LendingResult};
use crate::schnorr::{self, SECP};
use bitcoin::{
    absolute::LOCK_TIME_THRESHOLD,
    opcodes::all::*,
    script::Builder,
    secp256k1::{PublicKey, XOnlyPublicKey},
    taproot::{ControlBlock, LeafVersion, TapLeafHash, TaprootBuilder, TaprootSpendInfo},
    Address, Network, ScriptBuf,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// BIP-327 tag for the hash of the sorted key list
const KEYAGG_LIST_TAG: &str = "KeyAgg list";

/// BIP-327 tag for per-key aggregation coefficients
const KEYAGG_COEFFICIENT_TAG: &str = "KeyAgg coefficient";

/// The three spending conditions of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafKind {
    Liquidation,
    Repayment,
    TimeoutRefund,
}

impl fmt::Display for LeafKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafKind::Liquidation => write!(f, "liquidation"),
            LeafKind::Repayment => write!(f, "repayment"),
            LeafKind::TimeoutRefund => write!(f, "timeout_refund"),
        }
    }
}

/// A tapscript leaf paired with its control block, both hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafScript {
    pub script: String,
    pub control_block: String,
}

impl LeafScript {
    fn new(script: &ScriptBuf, control_block: &ControlBlock) -> Self {
        Self {
            script: hex::encode(script.as_bytes()),
            control_block: hex::encode(control_block.serialize()),
        }
    }

    pub fn script_buf(&self) -> LendingResult<ScriptBuf> {
        Ok(ScriptBuf::from_bytes(hex::decode(&self.script)?))
    }

    pub fn control_block_bytes(&self) -> LendingResult<Vec<u8>> {
        Ok(hex::decode(&self.control_block)?)
    }

    pub fn control_block(&self) -> LendingResult<ControlBlock> {
        ControlBlock::decode(&self.control_block_bytes()?)
            .map_err(|e| LendingError::validation(format!("invalid control block: {}", e)))
    }

    /// BIP-341 leaf hash, committed to by script-path sighashes.
    pub fn leaf_hash(&self) -> LendingResult<TapLeafHash> {
        Ok(TapLeafHash::from_script(
            &self.script_buf()?,
            LeafVersion::TapScript,
        ))
    }

    /// Byte length of script plus control block in the witness.
    pub fn witness_overhead(&self) -> usize {
        (self.script.len() + self.control_block.len()) / 2
    }
}

/// Scripts, control blocks and address of one loan vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultScripts {
    /// Aggregate internal key (x-only hex)
    pub internal_key: String,
    pub liquidation: LeafScript,
    pub repayment: LeafScript,
    pub timeout_refund: LeafScript,
    /// Output script of the vault (hex)
    pub script_pubkey: String,
    pub address: String,
    pub final_timeout: u64,
}

impl VaultScripts {
    pub fn leaf(&self, kind: LeafKind) -> &LeafScript {
        match kind {
            LeafKind::Liquidation => &self.liquidation,
            LeafKind::Repayment => &self.repayment,
            LeafKind::TimeoutRefund => &self.timeout_refund,
        }
    }

    pub fn script_pubkey(&self) -> LendingResult<ScriptBuf> {
        Ok(ScriptBuf::from_bytes(hex::decode(&self.script_pubkey)?))
    }
}

/// BIP-327 KeyAgg over x-only keys, returning the x-only aggregate.
///
/// Keys are lifted to even-Y compressed form and sorted first (KeySort), so
/// the result does not depend on argument order. The second distinct key in
/// sorted order gets coefficient 1.
pub fn aggregate_keys(keys: &[XOnlyPublicKey]) -> LendingResult<XOnlyPublicKey> {
    if keys.is_empty() {
        return Err(LendingError::validation("cannot aggregate an empty key set"));
    }

    let mut points: Vec<PublicKey> = keys.iter().map(schnorr::lift_x).collect();
    points.sort_by_key(|p| p.serialize());
    let encoded: Vec<[u8; 33]> = points.iter().map(|p| p.serialize()).collect();

    let chunks: Vec<&[u8]> = encoded.iter().map(|pk| &pk[..]).collect();
    let list_hash = schnorr::tagged_hash(KEYAGG_LIST_TAG, &chunks);
    let second = encoded.iter().find(|pk| **pk != encoded[0]).copied();

    let mut terms = Vec::with_capacity(points.len());
    for (point, pk) in points.iter().zip(encoded.iter()) {
        if Some(*pk) == second {
            terms.push(*point);
            continue;
        }
        let coefficient = schnorr::scalar_from_bytes(schnorr::tagged_hash(
            KEYAGG_COEFFICIENT_TAG,
            &[&list_hash[..], &pk[..]],
        ))?;
        terms.push(point.mul_tweak(&SECP, &coefficient)?);
    }

    let refs: Vec<&PublicKey> = terms.iter().collect();
    let aggregate = PublicKey::combine_keys(&refs)?;
    Ok(aggregate.x_only_public_key().0)
}

/// `<auth> OP_CHECKSIGVERIFY <dcm> OP_CHECKSIG`
pub fn liquidation_script(auth: &XOnlyPublicKey, dcm: &XOnlyPublicKey) -> ScriptBuf {
    two_of_two_script(auth, dcm)
}

/// `<borrower> OP_CHECKSIGVERIFY <dcm> OP_CHECKSIG`
pub fn repayment_script(borrower: &XOnlyPublicKey, dcm: &XOnlyPublicKey) -> ScriptBuf {
    two_of_two_script(borrower, dcm)
}

/// `<timeout> OP_CHECKLOCKTIMEVERIFY OP_DROP <borrower> OP_CHECKSIG`
pub fn timeout_refund_script(borrower: &XOnlyPublicKey, final_timeout: u32) -> ScriptBuf {
    Builder::new()
        .push_int(final_timeout as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_x_only_key(borrower)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

fn two_of_two_script(first: &XOnlyPublicKey, dcm: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(first)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_x_only_key(dcm)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

fn control_block_for(spend_info: &TaprootSpendInfo, script: &ScriptBuf, kind: LeafKind) -> LendingResult<ControlBlock> {
    spend_info
        .control_block(&(script.clone(), LeafVersion::TapScript))
        .ok_or_else(|| LendingError::operation("build_vault", format!("missing control block for {} leaf", kind)))
}

/// Build the vault for a loan.
///
/// # Arguments
/// * `borrower` - Borrower spend key (repayment and refund leaves)
/// * `auth` - Borrower auth key (liquidation leaf)
/// * `dcm` - DCM aggregate key
/// * `final_timeout` - Absolute refund timeout, unix seconds
/// * `network` - Network the address is encoded for
pub fn build_vault(
    borrower: &XOnlyPublicKey,
    auth: &XOnlyPublicKey,
    dcm: &XOnlyPublicKey,
    final_timeout: u64,
    network: Network,
) -> LendingResult<VaultScripts> {
    if final_timeout < LOCK_TIME_THRESHOLD as u64 || final_timeout > u32::MAX as u64 {
        return Err(LendingError::validation(format!(
            "final timeout {} is not a unix timestamp lock time",
            final_timeout
        )));
    }

    let internal_key = aggregate_keys(&[*borrower, *dcm])?;

    let liquidation = liquidation_script(auth, dcm);
    let repayment = repayment_script(borrower, dcm);
    let refund = timeout_refund_script(borrower, final_timeout as u32);

    let spend_info = TaprootBuilder::new()
        .add_leaf(1, liquidation.clone())
        .and_then(|b| b.add_leaf(2, repayment.clone()))
        .and_then(|b| b.add_leaf(2, refund.clone()))
        .map_err(|e| LendingError::operation("build_vault", e.to_string()))?
        .finalize(&SECP, internal_key)
        .map_err(|_| LendingError::operation("build_vault", "script tree is incomplete"))?;

    let address = Address::p2tr_tweaked(spend_info.output_key(), network);

    Ok(VaultScripts {
        internal_key: hex::encode(internal_key.serialize()),
        liquidation: LeafScript::new(
            &liquidation,
            &control_block_for(&spend_info, &liquidation, LeafKind::Liquidation)?,
        ),
        repayment: LeafScript::new(
            &repayment,
            &control_block_for(&spend_info, &repayment, LeafKind::Repayment)?,
        ),
        timeout_refund: LeafScript::new(
            &refund,
            &control_block_for(&spend_info, &refund, LeafKind::TimeoutRefund)?,
        ),
        script_pubkey: hex::encode(address.script_pubkey().as_bytes()),
        address: address.to_string(),
        final_timeout,
    })
}

/// Re-derive only the vault address.
pub fn derive_vault_address(
    borrower: &XOnlyPublicKey,
    auth: &XOnlyPublicKey,
    dcm: &XOnlyPublicKey,
    final_timeout: u64,
    network: Network,
) -> LendingResult<String> {
    Ok(build_vault(borrower, auth, dcm, final_timeout, network)?.address)
}
