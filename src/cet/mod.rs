//! # Contract Execution Transactions
//!
//! Each loan carries three candidate settlement transactions spending all of
//! its vault UTXOs:
//!
//! | CET | Leaf | Borrower signs | DCM signs |
//! |-----|------|----------------|-----------|
//! | liquidation | liquidation | adaptor, `NONE\|ANYONECANPAY`, liquidated point | plain, default sighash |
//! | default liquidation | liquidation | adaptor, `NONE\|ANYONECANPAY`, default point | plain, default sighash |
//! | repayment | repayment | plain, `ALL\|ANYONECANPAY` | adaptor, `ALL\|ANYONECANPAY`, repaid point |
//!
//! The liquidation CETs are submitted without outputs: the borrower only
//! commits to its inputs and the DCM adds the payout output at settlement.
//! A timeout refund transaction paying the borrower after the final timeout
//! is computed alongside.
//!
//! - [`build`]: transaction construction and fee estimation
//! - [`verify`]: checks on borrower-submitted CETs and signatures
//! - [`sign`]: client-side signing helpers
//! - [`settle`]: adapting signatures and assembling witnesses

pub mod build;
pub mod settle;
pub mod sign;
pub mod verify;

use crate::config::oracle::{OUTCOME_DEFAULT_LIQUIDATED, OUTCOME_LIQUIDATED, OUTCOME_REPAID};
use crate::error::{LendingError, LendingResult};
use crate::vault::{LeafKind, VaultScripts};
use bitcoin::{hashes::Hash, Amount, OutPoint, ScriptBuf, TapSighashType, TxOut, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use build::{
    build_default_liquidation_cet, build_dlc_meta, build_liquidation_cet, build_repayment_cet,
    build_timeout_refund_tx, complete_liquidation_cet, estimate_vsize, liquidation_cet_template,
    witness_size,
};
pub use settle::{assemble_script_spend, settle_liquidation, settle_repayment};
pub use verify::{verify_cets, CetSubmission, VerificationContext, VerifiedCets};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CetKind {
    Liquidation,
    DefaultLiquidation,
    Repayment,
}

impl CetKind {
    /// Vault leaf spent by this CET.
    pub fn leaf(&self) -> LeafKind {
        match self {
            CetKind::Liquidation | CetKind::DefaultLiquidation => LeafKind::Liquidation,
            CetKind::Repayment => LeafKind::Repayment,
        }
    }

    /// Lending event outcome that unlocks this CET.
    pub fn outcome_index(&self) -> usize {
        match self {
            CetKind::Liquidation => OUTCOME_LIQUIDATED,
            CetKind::DefaultLiquidation => OUTCOME_DEFAULT_LIQUIDATED,
            CetKind::Repayment => OUTCOME_REPAID,
        }
    }

    pub fn borrower_sighash_type(&self) -> TapSighashType {
        match self {
            CetKind::Liquidation | CetKind::DefaultLiquidation => TapSighashType::NonePlusAnyoneCanPay,
            CetKind::Repayment => TapSighashType::AllPlusAnyoneCanPay,
        }
    }

    pub fn dcm_sighash_type(&self) -> TapSighashType {
        match self {
            CetKind::Liquidation | CetKind::DefaultLiquidation => TapSighashType::Default,
            CetKind::Repayment => TapSighashType::AllPlusAnyoneCanPay,
        }
    }
}

impl fmt::Display for CetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CetKind::Liquidation => write!(f, "liquidation"),
            CetKind::DefaultLiquidation => write!(f, "default_liquidation"),
            CetKind::Repayment => write!(f, "repayment"),
        }
    }
}

/// A deposit output locked in a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultUtxo {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
    /// Output script (hex)
    pub script_pubkey: String,
}

impl VaultUtxo {
    pub fn outpoint(&self) -> LendingResult<OutPoint> {
        let txid = Txid::from_str(&self.txid)
            .map_err(|e| LendingError::validation(format!("invalid txid {}: {}", self.txid, e)))?;
        Ok(OutPoint::new(txid, self.vout))
    }

    pub fn txout(&self) -> LendingResult<TxOut> {
        Ok(TxOut {
            value: Amount::from_sat(self.amount),
            script_pubkey: ScriptBuf::from_bytes(hex::decode(&self.script_pubkey)?),
        })
    }
}

/// Collect the outputs of `tx` paying `vault_script`.
pub fn vault_utxos_from_deposit(tx: &bitcoin::Transaction, vault_script: &ScriptBuf) -> Vec<VaultUtxo> {
    let txid = tx.compute_txid();
    tx.output
        .iter()
        .enumerate()
        .filter(|(_, out)| out.script_pubkey == *vault_script)
        .map(|(vout, out)| VaultUtxo {
            txid: txid.to_string(),
            vout: vout as u32,
            amount: out.value.to_sat(),
            script_pubkey: hex::encode(out.script_pubkey.as_bytes()),
        })
        .collect()
}

/// A candidate settlement transaction and the signatures collected for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cet {
    /// Consensus-encoded transaction (hex)
    pub tx: String,
    pub borrower_adaptor_signatures: Vec<String>,
    pub borrower_signatures: Vec<String>,
    pub dcm_adaptor_signatures: Vec<String>,
    pub dcm_signatures: Vec<String>,
    pub adapted_signatures: Vec<String>,
    /// DCM signing request for this CET, once issued
    pub signing_request_id: Option<u64>,
    pub signed_tx_hex: String,
}

impl Cet {
    pub fn is_signed(&self) -> bool {
        !self.signed_tx_hex.is_empty()
    }
}

/// Vault scripts plus every CET of one loan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlcMeta {
    pub vault: VaultScripts,
    pub liquidation_cet: Cet,
    pub default_liquidation_cet: Cet,
    pub repayment_cet: Cet,
    /// Unsigned timeout refund transaction (hex)
    pub timeout_refund_tx: String,
    pub vault_utxos: Vec<VaultUtxo>,
}

impl DlcMeta {
    pub fn cet(&self, kind: CetKind) -> &Cet {
        match kind {
            CetKind::Liquidation => &self.liquidation_cet,
            CetKind::DefaultLiquidation => &self.default_liquidation_cet,
            CetKind::Repayment => &self.repayment_cet,
        }
    }

    pub fn cet_mut(&mut self, kind: CetKind) -> &mut Cet {
        match kind {
            CetKind::Liquidation => &mut self.liquidation_cet,
            CetKind::DefaultLiquidation => &mut self.default_liquidation_cet,
            CetKind::Repayment => &mut self.repayment_cet,
        }
    }

    pub fn total_collateral(&self) -> u64 {
        self.vault_utxos.iter().map(|u| u.amount).sum()
    }

    /// Prevouts of `tx` in input order, looked up among the vault UTXOs.
    pub fn prevouts(&self, tx: &bitcoin::Transaction) -> LendingResult<Vec<TxOut>> {
        tx.input
            .iter()
            .map(|input| {
                let mut found = None;
                for utxo in &self.vault_utxos {
                    if utxo.outpoint()? == input.previous_output {
                        found = Some(utxo);
                        break;
                    }
                }
                found
                    .ok_or_else(|| {
                        LendingError::invalid_cet(format!("{} is not a vault utxo", input.previous_output))
                    })?
                    .txout()
            })
            .collect()
    }
}

/// Hex-encode a transaction.
pub fn tx_to_hex(tx: &bitcoin::Transaction) -> String {
    bitcoin::consensus::encode::serialize_hex(tx)
}

/// Decode a hex transaction.
pub fn tx_from_hex(tx_hex: &str) -> LendingResult<bitcoin::Transaction> {
    let bytes = hex::decode(tx_hex)?;
    Ok(bitcoin::consensus::deserialize(&bytes)?)
}

/// Sighash bytes as a signable digest.
pub(crate) fn digest(sighash: bitcoin::TapSighash) -> [u8; 32] {
    sighash.to_byte_array()
}
