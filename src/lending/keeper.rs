//! Storage layout of the lending module.

use super::types::*;
use crate::cet::DlcMeta;
use crate::collaborators::SigningIntent;
use crate::error::{LendingError, LendingResult};
use crate::store::{be, key, IndexedTable, Store, StoreExt};

const POOL_PREFIX: u8 = 0x20;
const LOAN_PREFIX: u8 = 0x21;
const META_PREFIX: u8 = 0x22;
const DEPOSIT_PREFIX: u8 = 0x23;
const REDEMPTION_PREFIX: u8 = 0x24;
const REPAYMENT_PREFIX: u8 = 0x25;
const LIQUIDATION_PREFIX: u8 = 0x26;
const REFERRER_PREFIX: u8 = 0x27;
const SEQUENCE_PREFIX: u8 = 0x28;
const SIGNING_PREFIX: u8 = 0x29;

/// Loans indexed by status.
pub const LOANS: IndexedTable<Loan> = IndexedTable::new(LOAN_PREFIX);

/// Liquidations indexed by status; `liquidating` is the liquidation queue.
pub const LIQUIDATIONS: IndexedTable<Liquidation> = IndexedTable::new(LIQUIDATION_PREFIX);

pub(crate) fn sequence(store: &mut dyn Store, name: &[u8]) -> LendingResult<u64> {
    store.next_sequence(&key(SEQUENCE_PREFIX, &[name]))
}

pub fn get_pool(store: &dyn Store, id: &str) -> LendingResult<LendingPool> {
    store
        .get_json(&key(POOL_PREFIX, &[id.as_bytes()]))?
        .ok_or_else(|| LendingError::not_found("pool", id))
}

pub fn has_pool(store: &dyn Store, id: &str) -> bool {
    store.has(&key(POOL_PREFIX, &[id.as_bytes()]))
}

pub fn set_pool(store: &mut dyn Store, pool: &LendingPool) -> LendingResult<()> {
    store.set_json(&key(POOL_PREFIX, &[pool.id.as_bytes()]), pool)
}

pub fn get_pools(store: &dyn Store) -> LendingResult<Vec<LendingPool>> {
    store.scan_json(&[POOL_PREFIX])
}

pub fn get_loan(store: &dyn Store, id: &str) -> LendingResult<Loan> {
    LOANS
        .get(store, id.as_bytes())?
        .ok_or_else(|| LendingError::not_found("loan", id))
}

pub fn set_loan(store: &mut dyn Store, loan: &Loan) -> LendingResult<()> {
    LOANS.put(store, loan)
}

/// Ids of loans in `status`, oldest vault address first.
pub fn loan_ids_by_status(store: &dyn Store, status: LoanStatus) -> LendingResult<Vec<String>> {
    LOANS
        .ids_by_status(store, &status.to_string())
        .into_iter()
        .map(|id| {
            String::from_utf8(id).map_err(|_| LendingError::invariant("loan index holds a non-utf8 id"))
        })
        .collect()
}

pub fn get_dlc_meta(store: &dyn Store, loan_id: &str) -> LendingResult<DlcMeta> {
    store
        .get_json(&key(META_PREFIX, &[loan_id.as_bytes()]))?
        .ok_or_else(|| LendingError::not_found("dlc meta", loan_id))
}

pub fn set_dlc_meta(store: &mut dyn Store, loan_id: &str, meta: &DlcMeta) -> LendingResult<()> {
    store.set_json(&key(META_PREFIX, &[loan_id.as_bytes()]), meta)
}

pub fn get_deposit_log(store: &dyn Store, txid: &str) -> LendingResult<Option<DepositLog>> {
    store.get_json(&key(DEPOSIT_PREFIX, &[txid.as_bytes()]))
}

pub fn set_deposit_log(store: &mut dyn Store, log: &DepositLog) -> LendingResult<()> {
    store.set_json(&key(DEPOSIT_PREFIX, &[log.txid.as_bytes()]), log)
}

/// Deposit logs of a vault, in txid order.
pub fn get_deposit_logs(store: &dyn Store, vault_address: &str) -> LendingResult<Vec<DepositLog>> {
    let logs: Vec<DepositLog> = store.scan_json(&[DEPOSIT_PREFIX])?;
    Ok(logs.into_iter().filter(|l| l.vault_address == vault_address).collect())
}

pub fn get_redemption(store: &dyn Store, id: u64) -> LendingResult<Redemption> {
    store
        .get_json(&key(REDEMPTION_PREFIX, &[&be(id)]))?
        .ok_or_else(|| LendingError::not_found("redemption", id))
}

pub fn set_redemption(store: &mut dyn Store, redemption: &Redemption) -> LendingResult<()> {
    store.set_json(&key(REDEMPTION_PREFIX, &[&be(redemption.id)]), redemption)
}

pub fn get_repayment(store: &dyn Store, loan_id: &str) -> LendingResult<Option<Repayment>> {
    store.get_json(&key(REPAYMENT_PREFIX, &[loan_id.as_bytes()]))
}

pub fn set_repayment(store: &mut dyn Store, repayment: &Repayment) -> LendingResult<()> {
    store.set_json(&key(REPAYMENT_PREFIX, &[repayment.loan_id.as_bytes()]), repayment)
}

pub fn get_liquidation(store: &dyn Store, id: u64) -> LendingResult<Liquidation> {
    LIQUIDATIONS
        .get(store, &be(id))?
        .ok_or_else(|| LendingError::not_found("liquidation", id))
}

pub fn get_referrer(store: &dyn Store, code: &str) -> LendingResult<Referrer> {
    store
        .get_json(&key(REFERRER_PREFIX, &[code.as_bytes()]))?
        .ok_or_else(|| LendingError::not_found("referrer", code))
}

pub fn has_referrer(store: &dyn Store, code: &str) -> bool {
    store.has(&key(REFERRER_PREFIX, &[code.as_bytes()]))
}

pub fn set_referrer(store: &mut dyn Store, referrer: &Referrer) -> LendingResult<()> {
    store.set_json(&key(REFERRER_PREFIX, &[referrer.referral_code.as_bytes()]), referrer)
}

pub fn get_signing_record(store: &dyn Store, id: u64) -> LendingResult<Option<SigningRecord>> {
    store.get_json(&key(SIGNING_PREFIX, &[&be(id)]))
}

pub fn record_signing_request(
    store: &mut dyn Store,
    id: u64,
    scope_id: &str,
    intent: SigningIntent,
    now: i64,
) -> LendingResult<()> {
    store.set_json(
        &key(SIGNING_PREFIX, &[&be(id)]),
        &SigningRecord {
            id,
            scope_id: scope_id.to_string(),
            intent,
            status: SigningStatus::Pending,
            created_at: now,
        },
    )
}

/// Close a pending signing record. Unknown or already closed requests are
/// conflicts so a duplicated callback is never applied twice.
pub fn finish_signing_request(store: &mut dyn Store, id: u64, status: SigningStatus) -> LendingResult<SigningRecord> {
    let mut record =
        get_signing_record(store, id)?.ok_or_else(|| LendingError::not_found("signing request", id))?;
    if record.status != SigningStatus::Pending {
        return Err(LendingError::conflict(format!("signing request {} already finished", id)));
    }
    record.status = status;
    store.set_json(&key(SIGNING_PREFIX, &[&be(id)]), &record)?;
    Ok(record)
}
