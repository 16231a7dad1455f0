//! # In-Memory Collaborators
//!
//! Deterministic doubles of the price oracle, the bridge ledger and the
//! threshold-signing network, plus a borrower wallet. Unit tests and the
//! `demo` command run complete loan lifecycles against them.
//!
//! [`RecordingSigner`] keeps every secret it generates, so it can answer its
//! own requests: plain Schnorr signatures for DCM requests, nonce-committed
//! signatures for attestations and adaptor signatures for repayment CETs.

use crate::adaptor;
use crate::cet::build::{build_repayment_cet, liquidation_cet_template};
use crate::cet::sign::{sign_adaptor_inputs, sign_inputs};
use crate::cet::{tx_from_hex, tx_to_hex, CetKind, CetSubmission, VaultUtxo};
use crate::collaborators::{
    BridgeLedger, CallbackEvent, DkgIntent, DkgRequest, FeeRate, PriceOracle, SigningRequest, SigningType,
    ThresholdSigning,
};
use crate::config::bitcoin_tx::TX_VERSION;
use crate::config::Params;
use crate::engine::Engine;
use crate::error::{LendingError, LendingResult};
use crate::keys::KeyScheme;
use crate::lending::{AssetMetadata, CetInfo, PoolConfig, TrancheConfig};
use crate::oracle::keeper as oracle_keeper;
use crate::schnorr::{self, SECP};
use crate::store::MemStore;
use crate::vault::VaultScripts;
use bitcoin::{
    absolute::LockTime,
    hashes::{sha256, Hash},
    secp256k1::{Keypair, Message, PublicKey, SecretKey, XOnlyPublicKey},
    transaction::Version,
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Price feed answering from a fixed table.
#[derive(Debug, Default, Clone)]
pub struct FixedPriceOracle {
    prices: BTreeMap<String, Decimal>,
}

impl FixedPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, pair: &str, price: Decimal) -> Self {
        self.set_price(pair, price);
        self
    }

    pub fn set_price(&mut self, pair: &str, price: Decimal) {
        self.prices.insert(pair.to_string(), price);
    }
}

impl PriceOracle for FixedPriceOracle {
    fn get_price(&self, pair: &str) -> LendingResult<Decimal> {
        self.prices
            .get(pair)
            .copied()
            .ok_or_else(|| LendingError::not_found("price", pair))
    }
}

/// Bridge ledger that accepts any well-formed transaction as confirmed.
#[derive(Debug, Clone)]
pub struct MockBridge {
    fee_rate: FeeRate,
}

impl MockBridge {
    pub fn new(sat_per_vbyte: u64, updated_at: i64) -> Self {
        Self {
            fee_rate: FeeRate {
                sat_per_vbyte,
                updated_at,
            },
        }
    }

    pub fn set_fee_rate(&mut self, sat_per_vbyte: u64, updated_at: i64) {
        self.fee_rate = FeeRate {
            sat_per_vbyte,
            updated_at,
        };
    }
}

impl BridgeLedger for MockBridge {
    fn validate_transaction(
        &self,
        raw_tx: &str,
        _block_hash: &str,
        _proof: &[String],
        _confirmation_depth: u32,
    ) -> LendingResult<(Transaction, Option<Transaction>)> {
        Ok((tx_from_hex(raw_tx)?, None))
    }

    fn get_fee_rate(&self) -> LendingResult<FeeRate> {
        Ok(self.fee_rate)
    }
}

fn xonly_hex(secret: &SecretKey) -> String {
    hex::encode(Keypair::from_secret_key(&SECP, secret).x_only_public_key().0.serialize())
}

/// Signing network that records requests and signs with its own keys.
///
/// Requests stay pending until completed or timed out explicitly, which
/// yields the callback the real network would deliver, tagged with the
/// module it is addressed to.
#[derive(Debug, Default)]
pub struct RecordingSigner {
    generated: u64,
    next_dkg_id: u64,
    next_signing_id: u64,
    /// X-only public key (hex) → secret
    keys: BTreeMap<String, SecretKey>,
    pub dkg_requests: BTreeMap<u64, DkgRequest>,
    pub signing_requests: BTreeMap<u64, SigningRequest>,
    pending_dkgs: Vec<u64>,
    pending_signings: Vec<u64>,
}

impl RecordingSigner {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_key(&mut self) -> LendingResult<String> {
        self.generated += 1;
        let mut preimage = b"recording signer".to_vec();
        preimage.extend_from_slice(&self.generated.to_be_bytes());
        let seed = sha256::Hash::hash(&preimage);
        let secret = SecretKey::from_slice(seed.as_byte_array())?;
        let pub_key = xonly_hex(&secret);
        self.keys.insert(pub_key.clone(), secret);
        Ok(pub_key)
    }

    fn secret(&self, pub_key: &str) -> LendingResult<&SecretKey> {
        self.keys
            .get(pub_key)
            .ok_or_else(|| LendingError::not_found("signer key", pub_key))
    }

    pub fn pending_dkgs(&self) -> &[u64] {
        &self.pending_dkgs
    }

    pub fn pending_signings(&self) -> &[u64] {
        &self.pending_signings
    }

    fn take_pending(pending: &mut Vec<u64>, id: u64) -> LendingResult<()> {
        let position = pending
            .iter()
            .position(|p| *p == id)
            .ok_or_else(|| LendingError::state("request", "pending", id))?;
        pending.remove(position);
        Ok(())
    }

    /// Finish a DKG round: every participant reports, then the keys are
    /// published.
    pub fn complete_dkg(&mut self, dkg_id: u64) -> LendingResult<Vec<(String, CallbackEvent)>> {
        Self::take_pending(&mut self.pending_dkgs, dkg_id)?;
        let request = self
            .dkg_requests
            .get(&dkg_id)
            .cloned()
            .ok_or_else(|| LendingError::not_found("dkg request", dkg_id))?;

        let count = match request.intent {
            DkgIntent::Nonce => request.batch_size as usize,
            DkgIntent::Dcm | DkgIntent::Oracle => 1,
        };
        let pub_keys = (0..count).map(|_| self.fresh_key()).collect::<LendingResult<Vec<_>>>()?;

        let mut events: Vec<(String, CallbackEvent)> = request
            .participants
            .iter()
            .map(|participant| {
                (
                    request.module.clone(),
                    CallbackEvent::DkgCompletionReceived {
                        dkg_id,
                        participant: participant.clone(),
                    },
                )
            })
            .collect();
        events.push((request.module, CallbackEvent::DkgCompleted { dkg_id, pub_keys }));
        Ok(events)
    }

    pub fn timeout_dkg(&mut self, dkg_id: u64, absent: &[&str]) -> LendingResult<(String, CallbackEvent)> {
        Self::take_pending(&mut self.pending_dkgs, dkg_id)?;
        let request = self
            .dkg_requests
            .get(&dkg_id)
            .ok_or_else(|| LendingError::not_found("dkg request", dkg_id))?;
        Ok((
            request.module.clone(),
            CallbackEvent::DkgTimeout {
                dkg_id,
                absent_participants: absent.iter().map(|p| p.to_string()).collect(),
            },
        ))
    }

    fn sign(&self, request: &SigningRequest, sig_hash: &str) -> LendingResult<String> {
        let message: [u8; 32] = hex::decode(sig_hash)?
            .try_into()
            .map_err(|_| LendingError::validation(format!("sighash {} is not 32 bytes", sig_hash)))?;
        let secret = self.secret(&request.pub_key)?;

        match request.signing_type {
            SigningType::Schnorr => {
                let keypair = Keypair::from_secret_key(&SECP, secret);
                let signature = SECP.sign_schnorr_no_aux_rand(&Message::from_digest(message), &keypair);
                Ok(hex::encode(signature.serialize()))
            }
            SigningType::SchnorrWithCommitment => {
                let nonce_key = request
                    .options
                    .nonce
                    .as_deref()
                    .ok_or_else(|| LendingError::validation("commitment signing needs a nonce"))?;
                let signature = schnorr::sign_with_nonce(secret, self.secret(nonce_key)?, &message)?;
                Ok(hex::encode(signature.serialize()))
            }
            SigningType::SchnorrAdaptor => {
                let point = request
                    .options
                    .adaptor_point
                    .as_deref()
                    .ok_or_else(|| LendingError::validation("adaptor signing needs a point"))?;
                let point = PublicKey::from_str(point)?;
                Ok(adaptor::sign(secret, &message, &point)?.to_hex())
            }
        }
    }

    pub fn complete_signing(&mut self, request_id: u64) -> LendingResult<(String, CallbackEvent)> {
        Self::take_pending(&mut self.pending_signings, request_id)?;
        let request = self
            .signing_requests
            .get(&request_id)
            .ok_or_else(|| LendingError::not_found("signing request", request_id))?;
        let signatures = request
            .sig_hashes
            .iter()
            .map(|h| self.sign(request, h))
            .collect::<LendingResult<Vec<_>>>()?;
        Ok((
            request.module.clone(),
            CallbackEvent::SigningCompleted {
                request_id,
                scope_id: request.scope_id.clone(),
                intent: request.intent,
                signatures,
            },
        ))
    }

    pub fn timeout_signing(&mut self, request_id: u64) -> LendingResult<(String, CallbackEvent)> {
        Self::take_pending(&mut self.pending_signings, request_id)?;
        let request = self
            .signing_requests
            .get(&request_id)
            .ok_or_else(|| LendingError::not_found("signing request", request_id))?;
        Ok((
            request.module.clone(),
            CallbackEvent::SigningTimeout {
                request_id,
                scope_id: request.scope_id.clone(),
                intent: request.intent,
            },
        ))
    }

    /// Complete every pending DKG round and signing request, oldest first.
    pub fn complete_all(&mut self) -> LendingResult<Vec<(String, CallbackEvent)>> {
        let mut events = Vec::new();
        for dkg_id in self.pending_dkgs.clone() {
            events.extend(self.complete_dkg(dkg_id)?);
        }
        for request_id in self.pending_signings.clone() {
            events.push(self.complete_signing(request_id)?);
        }
        Ok(events)
    }
}

impl ThresholdSigning for RecordingSigner {
    fn initiate_dkg(&mut self, request: DkgRequest) -> LendingResult<u64> {
        self.next_dkg_id += 1;
        let id = self.next_dkg_id;
        self.dkg_requests.insert(id, request);
        self.pending_dkgs.push(id);
        Ok(id)
    }

    fn initiate_signing_request(&mut self, request: SigningRequest) -> LendingResult<u64> {
        self.secret(&request.pub_key)?;
        self.next_signing_id += 1;
        let id = self.next_signing_id;
        self.signing_requests.insert(id, request);
        self.pending_signings.push(id);
        Ok(id)
    }
}

/// Borrower keys and the client-side steps of a loan.
#[derive(Debug, Clone)]
pub struct TestBorrower {
    pub address: String,
    spend: SecretKey,
    auth: SecretKey,
}

impl TestBorrower {
    /// Keys derived from `seed`, distinct for spend and auth.
    pub fn new(address: &str, seed: u8) -> LendingResult<Self> {
        Ok(Self {
            address: address.to_string(),
            spend: SecretKey::from_slice(&[seed; 32])?,
            auth: SecretKey::from_slice(&[seed.wrapping_add(0x40); 32])?,
        })
    }

    pub fn pub_key(&self) -> String {
        xonly_hex(&self.spend)
    }

    pub fn auth_pub_key(&self) -> String {
        xonly_hex(&self.auth)
    }

    pub fn payout_script(&self) -> ScriptBuf {
        let xonly: XOnlyPublicKey = Keypair::from_secret_key(&SECP, &self.spend).x_only_public_key().0;
        KeyScheme::Taproot(xonly).payout_script()
    }

    /// A confirmed-looking transaction paying `amount` into the vault. `salt`
    /// keeps txids of several deposits apart.
    pub fn deposit_tx(&self, vault: &VaultScripts, amount: u64, salt: u8) -> LendingResult<Transaction> {
        Ok(Transaction {
            version: Version(TX_VERSION),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([salt; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(amount),
                script_pubkey: vault.script_pubkey()?,
            }],
        })
    }

    /// Pre-sign the three CETs over `utxos` for the points in `info`.
    pub fn sign_cets(&self, info: &CetInfo, utxos: &[VaultUtxo]) -> LendingResult<CetSubmission> {
        let liquidated = PublicKey::from_str(&info.liquidated_point)?;
        let default_liquidated = PublicKey::from_str(&info.default_liquidated_point)?;
        let template = liquidation_cet_template(utxos)?;
        let prevouts = utxos.iter().map(VaultUtxo::txout).collect::<LendingResult<Vec<_>>>()?;

        let sighash_type = CetKind::Liquidation.borrower_sighash_type();
        let liquidation_adaptor_signatures = sign_adaptor_inputs(
            &template,
            &prevouts,
            &info.vault.liquidation,
            &self.auth,
            &liquidated,
            sighash_type,
        )?;
        let default_liquidation_adaptor_signatures = sign_adaptor_inputs(
            &template,
            &prevouts,
            &info.vault.liquidation,
            &self.auth,
            &default_liquidated,
            sighash_type,
        )?;

        let repayment = build_repayment_cet(utxos, &info.vault, &self.payout_script(), info.fee_rate.sat_per_vbyte)?;
        let repayment_signatures = sign_inputs(
            &repayment,
            &prevouts,
            &info.vault.repayment,
            &self.spend,
            CetKind::Repayment.borrower_sighash_type(),
        )?;

        Ok(CetSubmission {
            liquidation_cet: tx_to_hex(&template),
            liquidation_adaptor_signatures,
            default_liquidation_adaptor_signatures,
            repayment_cet: tx_to_hex(&repayment),
            repayment_signatures,
        })
    }

    /// A signed redemption of `utxos` back to the borrower.
    pub fn sign_redemption(
        &self,
        vault: &VaultScripts,
        utxos: &[VaultUtxo],
        fee_rate: u64,
    ) -> LendingResult<(String, Vec<String>)> {
        let tx = build_repayment_cet(utxos, vault, &self.payout_script(), fee_rate)?;
        let prevouts = utxos.iter().map(VaultUtxo::txout).collect::<LendingResult<Vec<_>>>()?;
        let signatures = sign_inputs(
            &tx,
            &prevouts,
            &vault.repayment,
            &self.spend,
            crate::lending::loan::REDEMPTION_SIGHASH_TYPE,
        )?;
        Ok((tx_to_hex(&tx), signatures))
    }
}

/// Engine wired to the in-memory doubles.
pub type TestEngine = Engine<MemStore, FixedPriceOracle, MockBridge, RecordingSigner>;

impl TestEngine {
    /// Answer every pending DKG round and signing request and deliver the
    /// callbacks. Returns how many callbacks were delivered.
    pub fn run_signer(&mut self, now: i64) -> LendingResult<usize> {
        let events = self.signer.complete_all()?;
        self.deliver_all(&events, now)?;
        Ok(events.len())
    }
}

/// Parameters with three oracle participants and small nonce batches.
pub fn test_params() -> Params {
    Params {
        oracle_participants: vec!["val1".to_string(), "val2".to_string(), "val3".to_string()],
        oracle_participant_num: 3,
        oracle_threshold: 2,
        nonce_batch_size: 4,
        nonce_queue_threshold: 2,
        ..Params::default()
    }
}

/// BTC collateral against an 8-decimal stable asset, one 30-day tranche.
pub fn btc_usdt_pool() -> PoolConfig {
    PoolConfig {
        collateral_asset: AssetMetadata {
            denom: "sat".to_string(),
            symbol: "BTC".to_string(),
            decimals: 8,
            price_symbol: "BTC".to_string(),
            is_base_price_asset: true,
        },
        lending_asset: AssetMetadata {
            denom: "usat".to_string(),
            symbol: "USDT".to_string(),
            decimals: 8,
            price_symbol: "USDT".to_string(),
            is_base_price_asset: false,
        },
        tranches: vec![TrancheConfig {
            maturity: 30 * 86_400,
            borrow_apr: 100,
        }],
        max_ltv: 700,
        liquidation_threshold: 800,
        reserve_factor: 100,
        origination_fee_factor: 10,
        borrow_cap: 0,
    }
}

/// An engine with an oracle, a DCM and a first nonce batch in place.
/// Returns the engine and the DCM id.
pub fn bootstrap(params: Params, now: i64) -> LendingResult<(TestEngine, u64)> {
    let mut engine = Engine::new(
        MemStore::new(),
        params,
        FixedPriceOracle::new(),
        MockBridge::new(2, now),
        RecordingSigner::new(),
    )?;

    engine.create_oracle(now)?;
    engine.run_signer(now)?;

    let committee = vec!["dcm1".to_string(), "dcm2".to_string(), "dcm3".to_string()];
    engine.create_dcm(now, committee, 2)?;
    engine.run_signer(now)?;
    let dcm_id = oracle_keeper::get_dcms(&engine.store)?
        .last()
        .map(|d| d.id)
        .ok_or_else(|| LendingError::not_found("dcm", "bootstrap"))?;

    engine.tick(now)?;
    engine.run_signer(now)?;
    Ok((engine, dcm_id))
}
