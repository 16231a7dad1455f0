//! Lending pools, tranche accrual and referrers.

use super::bank;
use super::keeper;
use super::math;
use super::types::*;
use crate::config::{lending::PERMILLE, Params};
use crate::error::{LendingError, LendingResult};
use crate::store::Store;
use log::{debug, info};
use rust_decimal::Decimal;
use std::collections::HashSet;

fn validate_config(config: &PoolConfig) -> LendingResult<()> {
    if config.collateral_asset.denom.is_empty() || config.lending_asset.denom.is_empty() {
        return Err(LendingError::validation("asset denominations must not be empty"));
    }
    if config.collateral_asset.is_base_price_asset == config.lending_asset.is_base_price_asset {
        return Err(LendingError::validation("exactly one asset must be the base price asset"));
    }
    if config.tranches.is_empty() {
        return Err(LendingError::validation("pool needs at least one tranche"));
    }
    let mut maturities = HashSet::new();
    for tranche in &config.tranches {
        if tranche.maturity <= 0 {
            return Err(LendingError::validation(format!("invalid tranche maturity {}", tranche.maturity)));
        }
        if !maturities.insert(tranche.maturity) {
            return Err(LendingError::validation(format!("duplicate tranche maturity {}", tranche.maturity)));
        }
    }
    if config.max_ltv == 0 || config.max_ltv >= config.liquidation_threshold {
        return Err(LendingError::validation(format!(
            "max ltv {} must be positive and below the liquidation threshold {}",
            config.max_ltv, config.liquidation_threshold
        )));
    }
    if config.liquidation_threshold > PERMILLE
        || config.reserve_factor > PERMILLE
        || config.origination_fee_factor > PERMILLE
    {
        return Err(LendingError::validation("per-mille factors must not exceed 1000"));
    }
    Ok(())
}

pub fn create_pool(store: &mut dyn Store, id: &str, config: PoolConfig) -> LendingResult<LendingPool> {
    if id.is_empty() {
        return Err(LendingError::validation("pool id must not be empty"));
    }
    if keeper::has_pool(store, id) {
        return Err(LendingError::conflict(format!("pool {} already exists", id)));
    }
    validate_config(&config)?;

    let tranches = config
        .tranches
        .iter()
        .map(|t| Tranche {
            maturity: t.maturity,
            borrow_index: Decimal::ONE,
            total_borrowed: Decimal::ZERO,
        })
        .collect();
    let pool = LendingPool {
        id: id.to_string(),
        config,
        supply: 0,
        available_amount: 0,
        borrowed_amount: 0,
        reserve_amount: Decimal::ZERO,
        tranches,
        status: PoolStatus::Active,
    };
    keeper::set_pool(store, &pool)?;

    info!("created pool {} for {}", id, pool.config.price_pair());
    Ok(pool)
}

/// Add liquidity from `supplier`.
pub fn supply(store: &mut dyn Store, pool_id: &str, supplier: &str, amount: u64) -> LendingResult<LendingPool> {
    let mut pool = keeper::get_pool(store, pool_id)?;
    if pool.status != PoolStatus::Active {
        return Err(LendingError::state("pool", "active", format!("{:?}", pool.status)));
    }
    if amount == 0 {
        return Err(LendingError::validation("supply amount must be positive"));
    }

    bank::transfer(
        store,
        supplier,
        &bank::pool_account(pool_id),
        &pool.config.lending_asset.denom,
        amount,
    )?;
    pool.supply += amount;
    pool.available_amount += amount;
    keeper::set_pool(store, &pool)?;

    debug!("{} supplied {} to pool {}", supplier, amount, pool_id);
    Ok(pool)
}

/// Accrue one block of interest on every tranche of every active pool.
pub fn accrue_pools(store: &mut dyn Store, params: &Params) -> LendingResult<()> {
    for mut pool in keeper::get_pools(store)? {
        if pool.status != PoolStatus::Active {
            continue;
        }
        let pool_id = pool.id.clone();
        let reserve_factor = pool.config.reserve_factor;
        let mut reserve = Decimal::ZERO;
        for config in pool.config.tranches.clone() {
            let tranche = pool
                .tranche_mut(config.maturity)
                .ok_or_else(|| LendingError::invariant(format!("pool {} lost tranche {}", pool_id, config.maturity)))?;
            reserve += math::accrue_block(tranche, config.borrow_apr, params.blocks_per_year, reserve_factor);
        }
        pool.reserve_amount += reserve;
        keeper::set_pool(store, &pool)?;
    }
    Ok(())
}

/// Check that `amount` can be borrowed from the pool right now.
pub fn check_borrowable(pool: &LendingPool, amount: u64) -> LendingResult<()> {
    if pool.status != PoolStatus::Active {
        return Err(LendingError::state("pool", "active", format!("{:?}", pool.status)));
    }
    if pool.available_amount < amount {
        return Err(LendingError::insufficient("liquidity", amount, pool.available_amount));
    }
    let cap = pool.config.borrow_cap;
    if cap > 0 && pool.borrowed_amount + amount > cap {
        return Err(LendingError::insufficient(
            "borrow cap",
            pool.borrowed_amount + amount,
            cap,
        ));
    }
    Ok(())
}

/// Book a disbursement against the pool's tranche, returning the borrow index
/// snapshot.
pub fn book_borrow(pool: &mut LendingPool, maturity: i64, amount: u64) -> LendingResult<Decimal> {
    check_borrowable(pool, amount)?;
    let pool_id = pool.id.clone();
    let tranche = pool
        .tranche_mut(maturity)
        .ok_or_else(|| LendingError::not_found("tranche", format!("{}/{}", pool_id, maturity)))?;
    tranche.total_borrowed += Decimal::from(amount);
    let index = tranche.borrow_index;

    pool.available_amount -= amount;
    pool.borrowed_amount += amount;
    Ok(index)
}

/// Book a settled repayment: `principal` leaves the borrowed side, and
/// `returned` (principal plus the suppliers' share of interest) becomes
/// available again.
pub fn book_repayment(
    pool: &mut LendingPool,
    maturity: i64,
    principal: u64,
    debt: u64,
    returned: u64,
) -> LendingResult<()> {
    let pool_id = pool.id.clone();
    let tranche = pool
        .tranche_mut(maturity)
        .ok_or_else(|| LendingError::not_found("tranche", format!("{}/{}", pool_id, maturity)))?;
    tranche.total_borrowed = (tranche.total_borrowed - Decimal::from(debt)).max(Decimal::ZERO);

    pool.borrowed_amount = pool.borrowed_amount.checked_sub(principal).ok_or_else(|| {
        LendingError::invariant(format!("pool {} repaid more than it lent", pool_id))
    })?;
    pool.available_amount += returned;
    Ok(())
}

pub fn register_referrer(store: &mut dyn Store, params: &Params, referrer: Referrer) -> LendingResult<()> {
    if referrer.referral_code.is_empty() || referrer.address.is_empty() {
        return Err(LendingError::validation("referral code and address must not be empty"));
    }
    if referrer.referral_fee_factor > params.max_referral_fee_factor {
        return Err(LendingError::validation(format!(
            "referral fee factor {} exceeds {}",
            referrer.referral_fee_factor, params.max_referral_fee_factor
        )));
    }
    if keeper::has_referrer(store, &referrer.referral_code) {
        return Err(LendingError::conflict(format!(
            "referral code {} already registered",
            referrer.referral_code
        )));
    }
    keeper::set_referrer(store, &referrer)?;
    info!("registered referrer {}", referrer.referral_code);
    Ok(())
}

/// Split `fee` between the referrer, if any, and the protocol fee collector.
/// Returns the referrer's share.
pub fn distribute_fee(
    store: &mut dyn Store,
    params: &Params,
    from: &str,
    denom: &str,
    fee: u64,
    referrer: Option<&Referrer>,
) -> LendingResult<u64> {
    let referral = referrer.map_or(0, |r| math::fee(fee, r.referral_fee_factor));
    if let Some(referrer) = referrer {
        bank::transfer(store, from, &referrer.address, denom, referral)?;
    }
    bank::transfer(store, from, &params.protocol_fee_collector, denom, fee - referral)?;
    Ok(referral)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn config() -> PoolConfig {
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

    #[test]
    fn test_create_pool_validation() {
        let mut store = MemStore::new();
        create_pool(&mut store, "btc-usdt", config()).unwrap();
        assert!(matches!(
            create_pool(&mut store, "btc-usdt", config()),
            Err(LendingError::Conflict { .. })
        ));

        let mut bad = config();
        bad.max_ltv = 900;
        assert!(create_pool(&mut store, "bad", bad).is_err());

        let mut bad = config();
        bad.lending_asset.is_base_price_asset = true;
        assert!(create_pool(&mut store, "bad", bad).is_err());
    }

    #[test]
    fn test_supply_and_accrue() {
        let mut store = MemStore::new();
        create_pool(&mut store, "p", config()).unwrap();
        bank::mint(&mut store, "lp", "usat", 1_000_000).unwrap();
        supply(&mut store, "p", "lp", 400_000).unwrap();

        let mut pool = keeper::get_pool(&store, "p").unwrap();
        assert_eq!(pool.available_amount, 400_000);
        book_borrow(&mut pool, 30 * 86_400, 100_000).unwrap();
        keeper::set_pool(&mut store, &pool).unwrap();

        let params = Params {
            blocks_per_year: 1_000,
            ..Params::default()
        };
        accrue_pools(&mut store, &params).unwrap();
        let pool = keeper::get_pool(&store, "p").unwrap();
        let tranche = pool.tranche(30 * 86_400).unwrap();
        assert!(tranche.borrow_index > Decimal::ONE);
        assert!(pool.reserve_amount > Decimal::ZERO);
    }

    #[test]
    fn test_borrow_cap() {
        let mut store = MemStore::new();
        let mut capped = config();
        capped.borrow_cap = 50_000;
        create_pool(&mut store, "p", capped).unwrap();
        bank::mint(&mut store, "lp", "usat", 1_000_000).unwrap();
        supply(&mut store, "p", "lp", 1_000_000).unwrap();

        let pool = keeper::get_pool(&store, "p").unwrap();
        assert!(check_borrowable(&pool, 50_000).is_ok());
        assert!(matches!(
            check_borrowable(&pool, 50_001),
            Err(LendingError::Insufficient { .. })
        ));
    }

    #[test]
    fn test_referrer_fee_split() {
        let mut store = MemStore::new();
        let params = Params::default();
        let referrer = Referrer {
            referral_code: "friend".to_string(),
            address: "referrer".to_string(),
            referral_fee_factor: 200,
        };
        register_referrer(&mut store, &params, referrer.clone()).unwrap();
        assert!(register_referrer(&mut store, &params, referrer.clone()).is_err());

        bank::mint(&mut store, "pool", "usat", 1_000).unwrap();
        let share = distribute_fee(&mut store, &params, "pool", "usat", 1_000, Some(&referrer)).unwrap();
        assert_eq!(share, 200);
        assert_eq!(bank::balance(&store, "referrer", "usat").unwrap(), 200);
        assert_eq!(bank::balance(&store, &params.protocol_fee_collector, "usat").unwrap(), 800);
    }
}
