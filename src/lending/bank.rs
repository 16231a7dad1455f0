//! Balance ledger for lent assets.
//!
//! Stands in for the host chain's bank module: balances are keyed by account
//! and denomination and only move through [`transfer`].

use crate::error::{LendingError, LendingResult};
use crate::store::{key, Store, StoreExt};

const BALANCE_PREFIX: u8 = 0x2a;

/// Account holding supplied liquidity of a pool.
pub fn pool_account(pool_id: &str) -> String {
    format!("pool/{}", pool_id)
}

/// Account holding repayments until their CET settles.
pub const REPAYMENT_ESCROW: &str = "lending/repayment_escrow";

fn balance_key(account: &str, denom: &str) -> Vec<u8> {
    key(BALANCE_PREFIX, &[account.as_bytes(), &[0x00], denom.as_bytes()])
}

pub fn balance(store: &dyn Store, account: &str, denom: &str) -> LendingResult<u64> {
    Ok(store.get_json(&balance_key(account, denom))?.unwrap_or(0))
}

fn set_balance(store: &mut dyn Store, account: &str, denom: &str, amount: u64) -> LendingResult<()> {
    let key = balance_key(account, denom);
    if amount == 0 {
        store.delete(&key);
        Ok(())
    } else {
        store.set_json(&key, &amount)
    }
}

/// Credit newly issued funds, used by genesis and test setup.
pub fn mint(store: &mut dyn Store, account: &str, denom: &str, amount: u64) -> LendingResult<()> {
    let current = balance(store, account, denom)?;
    let updated = current
        .checked_add(amount)
        .ok_or_else(|| LendingError::validation("balance overflow"))?;
    set_balance(store, account, denom, updated)
}

pub fn transfer(store: &mut dyn Store, from: &str, to: &str, denom: &str, amount: u64) -> LendingResult<()> {
    if amount == 0 || from == to {
        return Ok(());
    }
    let available = balance(store, from, denom)?;
    if available < amount {
        return Err(LendingError::insufficient("balance", amount, available));
    }
    set_balance(store, from, denom, available - amount)?;
    mint(store, to, denom, amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn test_transfer() {
        let mut store = MemStore::new();
        mint(&mut store, "alice", "usd", 100).unwrap();
        transfer(&mut store, "alice", "bob", "usd", 60).unwrap();
        assert_eq!(balance(&store, "alice", "usd").unwrap(), 40);
        assert_eq!(balance(&store, "bob", "usd").unwrap(), 60);
        assert_eq!(balance(&store, "bob", "btc").unwrap(), 0);

        let err = transfer(&mut store, "alice", "bob", "usd", 41).unwrap_err();
        assert!(matches!(err, LendingError::Insufficient { .. }));
    }

    #[test]
    fn test_empty_balance_is_removed() {
        let mut store = MemStore::new();
        mint(&mut store, "alice", "usd", 5).unwrap();
        transfer(&mut store, "alice", "bob", "usd", 5).unwrap();
        assert!(store.prefix_scan(&balance_key("alice", "usd")).is_empty());
    }
}
