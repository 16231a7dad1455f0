use super::types::*;
use crate::collaborators::{
    Context, DkgIntent, DkgRequest, SigningIntent, SigningOptions, SigningRequest, SigningType,
};
use crate::config::{modules, oracle as oracle_config, Params};
use crate::error::{LendingError, LendingResult};
use crate::schnorr::{self, SECP};
use crate::store::{be, key, IndexedTable, Store, StoreExt};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, SecretKey, XOnlyPublicKey};
use log::{debug, info, warn};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rust_decimal::Decimal;

const ORACLE_PREFIX: u8 = 0x10;
const NONCE_PREFIX: u8 = 0x11;
const NONCE_VALUE_PREFIX: u8 = 0x12;
const EVENT_PREFIX: u8 = 0x13;
const ATTESTATION_PREFIX: u8 = 0x14;
const DCM_PREFIX: u8 = 0x15;
const DKG_PREFIX: u8 = 0x16;
const LIVENESS_PREFIX: u8 = 0x17;
const SEQUENCE_PREFIX: u8 = 0x18;

/// DLC events with the status index backing the lending-event queue.
pub const EVENTS: IndexedTable<DlcEvent> = IndexedTable::new(EVENT_PREFIX);

fn sequence(store: &mut dyn Store, name: &[u8]) -> LendingResult<u64> {
    store.next_sequence(&key(SEQUENCE_PREFIX, &[name]))
}

// ---------------------------------------------------------------------------
// Oracles, DCMs and DKG rounds
// ---------------------------------------------------------------------------

pub fn get_oracle(store: &dyn Store, id: u64) -> LendingResult<DlcOracle> {
    store
        .get_json(&key(ORACLE_PREFIX, &[&be(id)]))?
        .ok_or_else(|| LendingError::not_found("oracle", id))
}

pub fn get_oracles(store: &dyn Store) -> LendingResult<Vec<DlcOracle>> {
    store.scan_json(&[ORACLE_PREFIX])
}

/// Most recently created enabled oracle.
pub fn current_oracle(store: &dyn Store) -> LendingResult<DlcOracle> {
    get_oracles(store)?
        .into_iter()
        .filter(|o| o.status == OracleStatus::Enabled)
        .last()
        .ok_or_else(|| LendingError::not_found("oracle", "enabled"))
}

pub fn set_oracle_status(store: &mut dyn Store, id: u64, status: OracleStatus) -> LendingResult<()> {
    let mut oracle = get_oracle(store, id)?;
    oracle.status = status;
    store.set_json(&key(ORACLE_PREFIX, &[&be(id)]), &oracle)
}

pub fn get_dcm(store: &dyn Store, id: u64) -> LendingResult<Dcm> {
    store
        .get_json(&key(DCM_PREFIX, &[&be(id)]))?
        .ok_or_else(|| LendingError::not_found("dcm", id))
}

pub fn get_dcms(store: &dyn Store) -> LendingResult<Vec<Dcm>> {
    store.scan_json(&[DCM_PREFIX])
}

pub fn get_dkg(store: &dyn Store, id: u64) -> LendingResult<DkgRecord> {
    store
        .get_json(&key(DKG_PREFIX, &[&be(id)]))?
        .ok_or_else(|| LendingError::not_found("dkg request", id))
}

fn save_dkg(store: &mut dyn Store, record: &DkgRecord) -> LendingResult<()> {
    store.set_json(&key(DKG_PREFIX, &[&be(record.id)]), record)
}

fn request_dkg(
    ctx: &mut Context<'_>,
    intent: DkgIntent,
    participants: Vec<String>,
    threshold: usize,
    batch_size: u32,
) -> LendingResult<u64> {
    let expires_at = ctx.now + ctx.params.dkg_timeout_duration as i64;
    let dkg_id = ctx.signer.initiate_dkg(DkgRequest {
        module: modules::DLC.to_string(),
        intent,
        participants: participants.clone(),
        threshold,
        batch_size,
        expiration_time: expires_at,
    })?;

    save_dkg(
        ctx.store,
        &DkgRecord {
            id: dkg_id,
            intent,
            participants,
            threshold,
            batch_size,
            received: Vec::new(),
            status: DkgStatus::Pending,
            expires_at,
            created_at: ctx.now,
        },
    )?;

    info!("requested {} dkg {}", intent, dkg_id);
    Ok(dkg_id)
}

/// Request a DKG round producing a new oracle key.
pub fn create_oracle(ctx: &mut Context<'_>) -> LendingResult<u64> {
    let participants = select_participants(ctx.store, ctx.params, ctx.now)?;
    let threshold = ctx.params.oracle_threshold;
    request_dkg(ctx, DkgIntent::Oracle, participants, threshold, 1)
}

/// Request a DKG round producing a new DCM key.
pub fn create_dcm(ctx: &mut Context<'_>, participants: Vec<String>, threshold: usize) -> LendingResult<u64> {
    if participants.is_empty() || threshold == 0 || threshold > participants.len() {
        return Err(LendingError::validation(format!(
            "invalid dcm threshold {} of {}",
            threshold,
            participants.len()
        )));
    }
    request_dkg(ctx, DkgIntent::Dcm, participants, threshold, 1)
}

fn has_pending_nonce_dkg(store: &dyn Store) -> LendingResult<bool> {
    let records: Vec<DkgRecord> = store.scan_json(&[DKG_PREFIX])?;
    Ok(records
        .iter()
        .any(|r| r.intent == DkgIntent::Nonce && r.status == DkgStatus::Pending))
}

/// Request a batch of nonces for the current oracle.
pub fn request_nonces(ctx: &mut Context<'_>) -> LendingResult<u64> {
    let oracle = current_oracle(ctx.store)?;
    let participants = select_participants(ctx.store, ctx.params, ctx.now)?;
    let threshold = ctx.params.oracle_threshold;
    let batch_size = ctx.params.nonce_batch_size;
    debug!("requesting {} nonces for oracle {}", batch_size, oracle.id);
    request_dkg(ctx, DkgIntent::Nonce, participants, threshold, batch_size)
}

/// Top up the lending-event queue when it falls under the configured
/// threshold and no nonce batch is already in flight.
pub fn ensure_nonce_supply(ctx: &mut Context<'_>) -> LendingResult<Option<u64>> {
    let pending = EVENTS.count_by_status(ctx.store, &DlcEventStatus::Pending.to_string());
    if pending >= ctx.params.nonce_queue_threshold || has_pending_nonce_dkg(ctx.store)? {
        return Ok(None);
    }
    if current_oracle(ctx.store).is_err() {
        debug!("no enabled oracle, skipping nonce generation");
        return Ok(None);
    }
    request_nonces(ctx).map(Some)
}

pub fn on_dkg_completion_received(store: &mut dyn Store, dkg_id: u64, participant: &str) -> LendingResult<()> {
    let mut record = get_dkg(store, dkg_id)?;
    if record.status != DkgStatus::Pending {
        return Err(LendingError::state("dkg request", "pending", format!("{:?}", record.status)));
    }
    if !record.participants.iter().any(|p| p == participant) {
        return Err(LendingError::validation(format!(
            "{} is not a participant of dkg {}",
            participant, dkg_id
        )));
    }
    if record.received.iter().any(|p| p == participant) {
        return Err(LendingError::conflict(format!(
            "duplicate completion from {} for dkg {}",
            participant, dkg_id
        )));
    }
    record.received.push(participant.to_string());
    save_dkg(store, &record)
}

pub fn on_dkg_completed(store: &mut dyn Store, dkg_id: u64, pub_keys: &[String], now: i64) -> LendingResult<()> {
    let mut record = get_dkg(store, dkg_id)?;
    if record.status != DkgStatus::Pending {
        return Err(LendingError::conflict(format!("dkg {} already finalized", dkg_id)));
    }

    match record.intent {
        DkgIntent::Oracle => {
            let pub_key = single_key(pub_keys, dkg_id)?;
            let id = sequence(store, b"oracle")?;
            let oracle = DlcOracle {
                id,
                dkg_id,
                pub_key,
                participants: record.participants.clone(),
                threshold: record.threshold,
                nonce_index: 0,
                status: OracleStatus::Enabled,
                created_at: now,
            };
            store.set_json(&key(ORACLE_PREFIX, &[&be(id)]), &oracle)?;
            info!("oracle {} registered with key {}", id, oracle.pub_key);
        }
        DkgIntent::Dcm => {
            let pub_key = single_key(pub_keys, dkg_id)?;
            let id = sequence(store, b"dcm")?;
            let dcm = Dcm {
                id,
                dkg_id,
                pub_key,
                participants: record.participants.clone(),
                status: DcmStatus::Enabled,
            };
            store.set_json(&key(DCM_PREFIX, &[&be(id)]), &dcm)?;
            info!("dcm {} registered with key {}", id, dcm.pub_key);
        }
        DkgIntent::Nonce => {
            if pub_keys.len() != record.batch_size as usize {
                return Err(LendingError::validation(format!(
                    "expected {} nonces, got {}",
                    record.batch_size,
                    pub_keys.len()
                )));
            }
            register_nonces(store, pub_keys, now)?;
            update_liveness(store, &record)?;
        }
    }

    record.status = DkgStatus::Completed;
    save_dkg(store, &record)
}

/// Mark a DKG round timed out. Not an error: the next tick simply asks again.
pub fn on_dkg_timeout(store: &mut dyn Store, dkg_id: u64, absent: &[String]) -> LendingResult<()> {
    let mut record = get_dkg(store, dkg_id)?;
    if record.status != DkgStatus::Pending {
        return Err(LendingError::conflict(format!("dkg {} already finalized", dkg_id)));
    }

    if record.intent == DkgIntent::Nonce {
        for participant in absent {
            set_liveness(store, participant, false, dkg_id)?;
        }
    }

    record.status = DkgStatus::TimedOut;
    save_dkg(store, &record)?;
    warn!("{} dkg {} timed out, {} participants absent", record.intent, dkg_id, absent.len());
    Ok(())
}

fn single_key(pub_keys: &[String], dkg_id: u64) -> LendingResult<String> {
    match pub_keys {
        [pub_key] => {
            schnorr::parse_xonly(pub_key)?;
            Ok(pub_key.clone())
        }
        _ => Err(LendingError::validation(format!(
            "dkg {} must produce exactly one key, got {}",
            dkg_id,
            pub_keys.len()
        ))),
    }
}

fn register_nonces(store: &mut dyn Store, nonces: &[String], now: i64) -> LendingResult<()> {
    let mut oracle = current_oracle(store)?;

    for nonce in nonces {
        let nonce_key = schnorr::parse_xonly(nonce)?;
        let value_key = key(NONCE_VALUE_PREFIX, &[&nonce_key.serialize()]);
        if store.has(&value_key) {
            return Err(LendingError::conflict(format!("nonce {} already used", nonce)));
        }

        oracle.nonce_index += 1;
        let dlc_nonce = DlcNonce {
            index: oracle.nonce_index,
            nonce: nonce.clone(),
            oracle_pub_key: oracle.pub_key.clone(),
            created_at: now,
        };
        store.set_json(&key(NONCE_PREFIX, &[&be(oracle.id), &be(dlc_nonce.index)]), &dlc_nonce)?;

        let event_id = sequence(store, b"event")?;
        store.set(&value_key, be(event_id).to_vec());

        let event = DlcEvent {
            id: event_id,
            kind: DlcEventKind::Lending,
            nonce: nonce.clone(),
            pub_key: oracle.pub_key.clone(),
            outcomes: oracle_config::LENDING_EVENT_OUTCOMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            status: DlcEventStatus::Pending,
            outcome_index: None,
            publish_at: now,
            triggered_at: None,
            signing_request_id: None,
        };
        EVENTS.put(store, &event)?;
    }

    store.set_json(&key(ORACLE_PREFIX, &[&be(oracle.id)]), &oracle)?;
    info!("registered {} nonces for oracle {}", nonces.len(), oracle.id);
    Ok(())
}

pub fn get_nonce(store: &dyn Store, oracle_id: u64, index: u64) -> LendingResult<DlcNonce> {
    store
        .get_json(&key(NONCE_PREFIX, &[&be(oracle_id), &be(index)]))?
        .ok_or_else(|| LendingError::not_found("nonce", format!("{}/{}", oracle_id, index)))
}

// ---------------------------------------------------------------------------
// Participant liveness and selection
// ---------------------------------------------------------------------------

pub fn get_liveness(store: &dyn Store, participant: &str) -> LendingResult<Option<ParticipantLiveness>> {
    store.get_json(&key(LIVENESS_PREFIX, &[participant.as_bytes()]))
}

fn set_liveness(store: &mut dyn Store, participant: &str, alive: bool, dkg_id: u64) -> LendingResult<()> {
    store.set_json(
        &key(LIVENESS_PREFIX, &[participant.as_bytes()]),
        &ParticipantLiveness {
            participant: participant.to_string(),
            alive,
            last_dkg_id: dkg_id,
        },
    )
}

fn update_liveness(store: &mut dyn Store, record: &DkgRecord) -> LendingResult<()> {
    for participant in &record.participants {
        let alive = record.received.iter().any(|p| p == participant);
        if !alive {
            debug!("participant {} silent in dkg {}", participant, record.id);
        }
        set_liveness(store, participant, alive, record.id)?;
    }
    Ok(())
}

fn is_alive(store: &dyn Store, participant: &str) -> LendingResult<bool> {
    Ok(get_liveness(store, participant)?.map_or(true, |l| l.alive))
}

/// Pick the participants of the next oracle DKG round.
///
/// Alive participants are preferred. When fewer than
/// `oracle_participant_num` are alive, the draw falls back to the whole
/// allowed set. Both draws shuffle with a PRNG seeded by the block time, so
/// replaying a block selects the same identities. This is not a source of
/// secrecy, only of identity selection.
///
/// At most `min(oracle_participant_num, allowed)` participants are selected
/// and fewer than `oracle_threshold` is an error.
pub fn select_participants(store: &dyn Store, params: &Params, seed_time: i64) -> LendingResult<Vec<String>> {
    let wanted = params.oracle_participant_num;
    let mut rng = StdRng::seed_from_u64(seed_time as u64);

    let mut alive = Vec::new();
    for participant in &params.oracle_participants {
        if is_alive(store, participant)? {
            alive.push(participant.clone());
        }
    }

    let mut selected = if alive.len() >= wanted {
        alive
    } else {
        debug!(
            "only {} of {} oracle participants alive, drawing from the allowed set",
            alive.len(),
            params.oracle_participants.len()
        );
        params.oracle_participants.clone()
    };
    selected.shuffle(&mut rng);
    selected.truncate(wanted);

    if selected.len() < params.oracle_threshold {
        return Err(LendingError::insufficient(
            "oracle participants",
            params.oracle_threshold,
            selected.len(),
        ));
    }
    Ok(selected)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub fn get_event(store: &dyn Store, id: u64) -> LendingResult<DlcEvent> {
    EVENTS
        .get(store, &be(id))?
        .ok_or_else(|| LendingError::not_found("dlc event", id))
}

pub fn get_events_by_status(store: &dyn Store, status: DlcEventStatus) -> LendingResult<Vec<DlcEvent>> {
    EVENTS.by_status(store, &status.to_string())
}

/// Pop the oldest pending lending event, binding it.
pub fn get_available_lending_event(store: &mut dyn Store) -> LendingResult<Option<DlcEvent>> {
    let mut event = match EVENTS.first_by_status(store, &DlcEventStatus::Pending.to_string())? {
        Some(event) => event,
        None => return Ok(None),
    };
    event.status = DlcEventStatus::Active;
    EVENTS.put(store, &event)?;
    debug!("lending event {} reserved", event.id);
    Ok(Some(event))
}

/// Outcome string of a price liquidation for the given collateral amount.
pub fn liquidated_outcome(collateral_amount: u64) -> String {
    format!("liquidated_{}", collateral_amount)
}

/// Fix an outcome of an event that has not been triggered yet.
pub fn set_event_outcome(store: &mut dyn Store, event_id: u64, index: usize, outcome: String) -> LendingResult<DlcEvent> {
    let mut event = get_event(store, event_id)?;
    if event.has_triggered() {
        return Err(LendingError::state("dlc event", "untriggered", event.status));
    }
    let slot = event
        .outcomes
        .get_mut(index)
        .ok_or_else(|| LendingError::validation(format!("outcome index {} out of range", index)))?;
    *slot = outcome;
    EVENTS.put(store, &event)?;
    Ok(event)
}

/// Irreversibly fix the realized outcome and ask the oracle to sign it.
///
/// Triggering an already-triggered event is a no-op, since the liquidation,
/// default and repayment paths may race on the same event.
pub fn trigger_dlc_event(ctx: &mut Context<'_>, event_id: u64, outcome_index: usize) -> LendingResult<()> {
    let mut event = get_event(ctx.store, event_id)?;
    if event.has_triggered() {
        debug!("dlc event {} already triggered", event_id);
        return Ok(());
    }

    let outcome = event
        .outcomes
        .get(outcome_index)
        .ok_or_else(|| LendingError::validation(format!("outcome index {} out of range", outcome_index)))?;
    if outcome.is_empty() {
        return Err(LendingError::state("dlc event outcome", "populated", "empty"));
    }

    event.status = DlcEventStatus::Triggered;
    event.outcome_index = Some(outcome_index);
    event.triggered_at = Some(ctx.now);
    event.signing_request_id = Some(request_attestation(ctx, &event)?);
    EVENTS.put(ctx.store, &event)?;

    info!("dlc event {} triggered with outcome {}", event_id, outcome_index);
    Ok(())
}

fn request_attestation(ctx: &mut Context<'_>, event: &DlcEvent) -> LendingResult<u64> {
    let outcome = event
        .outcome_index
        .and_then(|index| event.outcomes.get(index))
        .ok_or_else(|| LendingError::invariant(format!("event {} has no realized outcome", event.id)))?;

    ctx.signer.initiate_signing_request(SigningRequest {
        module: modules::DLC.to_string(),
        scope_id: event.id.to_string(),
        signing_type: SigningType::SchnorrWithCommitment,
        intent: SigningIntent::DlcAttestation,
        pub_key: event.pub_key.clone(),
        sig_hashes: vec![hex::encode(outcome_hash(outcome))],
        options: SigningOptions {
            nonce: Some(event.nonce.clone()),
            adaptor_point: None,
        },
    })
}

/// Ask the oracle again after its attestation request timed out.
pub fn retry_attestation(ctx: &mut Context<'_>, event_id: u64, timed_out_request: u64) -> LendingResult<u64> {
    let mut event = get_event(ctx.store, event_id)?;
    if event.status != DlcEventStatus::Triggered {
        return Err(LendingError::state("dlc event", DlcEventStatus::Triggered, event.status));
    }
    if event.signing_request_id != Some(timed_out_request) {
        return Err(LendingError::conflict(format!(
            "request {} is not the pending attestation request of event {}",
            timed_out_request, event_id
        )));
    }

    let request_id = request_attestation(ctx, &event)?;
    event.signing_request_id = Some(request_id);
    EVENTS.put(ctx.store, &event)?;
    warn!("attestation of dlc event {} timed out, re-requested as {}", event_id, request_id);
    Ok(request_id)
}

pub fn get_attestation(store: &dyn Store, event_id: u64) -> LendingResult<Option<DlcAttestation>> {
    store.get_json(&key(ATTESTATION_PREFIX, &[&be(event_id)]))
}

pub fn get_attestations(store: &dyn Store) -> LendingResult<Vec<DlcAttestation>> {
    store.scan_json(&[ATTESTATION_PREFIX])
}

/// Store the oracle's signature for a triggered event.
pub fn handle_attestation(store: &mut dyn Store, event_id: u64, signature_hex: &str, now: i64) -> LendingResult<DlcAttestation> {
    let mut event = get_event(store, event_id)?;
    if get_attestation(store, event_id)?.is_some() {
        return Err(LendingError::AttestationExists { event_id });
    }
    let outcome_index = match (event.status, event.outcome_index) {
        (DlcEventStatus::Triggered, Some(index)) => index,
        _ => return Err(LendingError::EventNotTriggered { event_id }),
    };
    let outcome = event
        .outcomes
        .get(outcome_index)
        .cloned()
        .ok_or_else(|| LendingError::invariant(format!("event {} outcome index out of range", event_id)))?;

    let signature = schnorr::parse_signature(signature_hex)?;
    let nonce = schnorr::parse_xonly(&event.nonce)?;
    let pub_key = schnorr::parse_xonly(&event.pub_key)?;
    if signature.serialize()[..32] != nonce.serialize() {
        return Err(LendingError::signature(format!(
            "attestation for event {} does not use the committed nonce",
            event_id
        )));
    }
    if !schnorr::verify(&signature, &outcome_hash(&outcome), &pub_key) {
        return Err(LendingError::signature(format!(
            "invalid attestation signature for event {}",
            event_id
        )));
    }

    let attestation = DlcAttestation {
        id: sequence(store, b"attestation")?,
        event_id,
        outcome,
        signature: signature_hex.to_string(),
        time: now,
    };
    store.set_json(&key(ATTESTATION_PREFIX, &[&be(event_id)]), &attestation)?;

    event.status = DlcEventStatus::Attested;
    EVENTS.put(store, &event)?;

    info!("dlc event {} attested", event_id);
    Ok(attestation)
}

/// Message the oracle signs for an outcome.
pub fn outcome_hash(outcome: &str) -> [u8; 32] {
    sha256::Hash::hash(outcome.as_bytes()).to_byte_array()
}

/// Signature point `R + e·P` of an outcome.
pub fn signature_point(pub_key: &XOnlyPublicKey, nonce: &XOnlyPublicKey, outcome: &str) -> LendingResult<PublicKey> {
    let e = schnorr::challenge(&nonce.serialize(), pub_key, &outcome_hash(outcome))?;
    let ep = schnorr::lift_x(pub_key).mul_tweak(&SECP, &e)?;
    Ok(schnorr::lift_x(nonce).combine(&ep)?)
}

pub fn get_signature_point_from_event(event: &DlcEvent, outcome_index: usize) -> LendingResult<PublicKey> {
    let outcome = event
        .outcomes
        .get(outcome_index)
        .ok_or_else(|| LendingError::validation(format!("outcome index {} out of range", outcome_index)))?;
    if outcome.is_empty() {
        return Err(LendingError::state("dlc event outcome", "populated", "empty"));
    }
    signature_point(
        &schnorr::parse_xonly(&event.pub_key)?,
        &schnorr::parse_xonly(&event.nonce)?,
        outcome,
    )
}

/// Discrete log of the signature point: the `s` half of the attestation.
pub fn attestation_secret(attestation: &DlcAttestation) -> LendingResult<SecretKey> {
    let signature = schnorr::parse_signature(&attestation.signature)?;
    Ok(SecretKey::from_slice(&signature.serialize()[32..])?)
}

// ---------------------------------------------------------------------------
// Price and date events
// ---------------------------------------------------------------------------

/// Round `price` to `significant_digits` significant decimal digits.
///
/// The rounding granularity is `10^(floor(log10(price)) + 1 - digits)`, so
/// prices of every magnitude keep the same relative precision. Trailing
/// zeros are dropped to give each price a single canonical outcome string.
pub fn normalize_price(price: Decimal, significant_digits: u32) -> LendingResult<Decimal> {
    if price.is_sign_negative() {
        return Err(LendingError::validation(format!("negative price {}", price)));
    }
    if significant_digits == 0 {
        return Err(LendingError::validation("significant digits must be positive"));
    }
    if price.is_zero() {
        return Ok(Decimal::ZERO);
    }
    price
        .round_sf(significant_digits)
        .map(|p| p.normalize())
        .ok_or_else(|| LendingError::validation(format!("cannot normalize price {}", price)))
}

fn take_event_for(ctx: &mut Context<'_>, kind: DlcEventKind, outcome: String) -> LendingResult<DlcEvent> {
    let mut event = get_available_lending_event(ctx.store)?.ok_or(LendingError::NoAvailableDlcEvent)?;
    event.kind = kind;
    event.outcomes = vec![outcome];
    EVENTS.put(ctx.store, &event)?;
    trigger_dlc_event(ctx, event.id, 0)?;
    get_event(ctx.store, event.id)
}

/// Publish the normalized price of `pair` as a triggered event.
pub fn new_price_event(ctx: &mut Context<'_>, pair: &str) -> LendingResult<DlcEvent> {
    let price = ctx.prices.get_price(pair)?;
    let normalized = normalize_price(price, ctx.params.price_significant_digits)?;
    take_event_for(ctx, DlcEventKind::Price, format!("{}:{}", pair, normalized))
}

/// Publish the current UTC date as a triggered event.
pub fn new_date_event(ctx: &mut Context<'_>) -> LendingResult<DlcEvent> {
    let date = chrono::DateTime::from_timestamp(ctx.now, 0)
        .ok_or_else(|| LendingError::validation(format!("invalid block time {}", ctx.now)))?
        .format("%Y-%m-%d")
        .to_string();
    take_event_for(ctx, DlcEventKind::Date, date)
}
