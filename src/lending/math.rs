//! Interest and liquidation-price math.
//!
//! All values are fixed-point decimals. Amounts are integers in the smallest
//! unit of their asset; prices are whole units of the quote asset per whole
//! unit of the base asset.

use super::types::{AssetMetadata, Tranche};
use crate::config::lending::{PERMILLE, SECONDS_PER_YEAR};
use crate::error::{LendingError, LendingResult};
use rust_decimal::prelude::*;
use rust_decimal::MathematicalOps;

/// Decimal places kept on accumulated indexes.
const INDEX_SCALE: u32 = 18;

fn permille(value: u64) -> Decimal {
    Decimal::from(value) / Decimal::from(PERMILLE)
}

fn to_u64(value: Decimal, what: &str) -> LendingResult<u64> {
    value
        .trunc()
        .to_u64()
        .ok_or_else(|| LendingError::validation(format!("{} {} out of range", what, value)))
}

/// Interest rate per block: `APR / 1000 / blocks_per_year`.
pub fn rate_per_block(borrow_apr: u64, blocks_per_year: u64) -> Decimal {
    permille(borrow_apr) / Decimal::from(blocks_per_year)
}

/// Accrue one block of interest on a tranche, returning the reserve delta.
///
/// `index *= 1 + rate`, `total_borrowed *= 1 + rate`, and the reserve grows
/// by `total_borrowed * rate * reserve_factor / 1000`.
pub fn accrue_block(tranche: &mut Tranche, borrow_apr: u64, blocks_per_year: u64, reserve_factor: u64) -> Decimal {
    let rate = rate_per_block(borrow_apr, blocks_per_year);
    if rate.is_zero() {
        return Decimal::ZERO;
    }

    let reserve = (tranche.total_borrowed * rate * permille(reserve_factor)).round_dp(INDEX_SCALE);
    let growth = Decimal::ONE + rate;
    tranche.borrow_index = (tranche.borrow_index * growth).round_dp(INDEX_SCALE);
    tranche.total_borrowed = (tranche.total_borrowed * growth).round_dp(INDEX_SCALE);
    reserve
}

/// Interest of a loan at `current_index`: `borrow * current / start - borrow`.
pub fn loan_interest(borrow_amount: u64, start_index: Decimal, current_index: Decimal) -> LendingResult<u64> {
    if start_index.is_zero() {
        return Err(LendingError::invariant("start borrow index is zero"));
    }
    let borrow = Decimal::from(borrow_amount);
    to_u64(borrow * current_index / start_index - borrow, "interest")
}

/// Number of blocks in a term of `maturity` seconds.
pub fn total_blocks(maturity: i64, blocks_per_year: u64) -> LendingResult<u64> {
    if maturity <= 0 {
        return Err(LendingError::validation(format!("invalid maturity {}", maturity)));
    }
    Ok(((maturity as u128 * blocks_per_year as u128) / SECONDS_PER_YEAR as u128) as u64)
}

/// Interest over the full term: `borrow * (1 + rate)^blocks - borrow`.
pub fn total_interest(borrow_amount: u64, borrow_apr: u64, maturity: i64, blocks_per_year: u64) -> LendingResult<u64> {
    let blocks = total_blocks(maturity, blocks_per_year)?;
    let growth = (Decimal::ONE + rate_per_block(borrow_apr, blocks_per_year))
        .checked_powu(blocks)
        .ok_or_else(|| LendingError::validation("interest growth overflows"))?;
    let borrow = Decimal::from(borrow_amount);
    to_u64(borrow * growth - borrow, "interest")
}

fn scale(decimals: u32) -> LendingResult<Decimal> {
    Decimal::from(10u64)
        .checked_powu(decimals as u64)
        .ok_or_else(|| LendingError::validation(format!("unsupported decimals {}", decimals)))
}

/// Price at which a loan becomes liquidatable.
///
/// With the collateral as base asset:
/// `(borrow + interest) / lltv / collateral`, in whole units. With the
/// lending asset as base the pair is inverted:
/// `collateral * lltv / (borrow + interest)`.
pub fn liquidation_price(
    collateral_amount: u64,
    collateral: &AssetMetadata,
    borrow_amount: u64,
    interest: u64,
    lending: &AssetMetadata,
    liquidation_threshold: u64,
) -> LendingResult<Decimal> {
    if collateral_amount == 0 || liquidation_threshold == 0 {
        return Err(LendingError::validation("collateral and liquidation threshold must be positive"));
    }
    let debt = Decimal::from(borrow_amount + interest) / scale(lending.decimals)?;
    if debt.is_zero() {
        return Err(LendingError::validation("borrow amount must be positive"));
    }
    let collateral_units = Decimal::from(collateral_amount) / scale(collateral.decimals)?;
    let lltv = permille(liquidation_threshold);

    if collateral.is_base_price_asset {
        Ok(debt / lltv / collateral_units)
    } else {
        Ok(collateral_units * lltv / debt)
    }
}

/// Whether `price` has crossed `liquidation_price` in the adverse direction.
pub fn is_liquidatable(price: Decimal, liquidation_price: Decimal, collateral_is_base: bool) -> bool {
    if collateral_is_base {
        price <= liquidation_price
    } else {
        price >= liquidation_price
    }
}

/// Loan-to-value of a position, per-mille.
pub fn ltv(
    collateral_amount: u64,
    collateral: &AssetMetadata,
    borrow_amount: u64,
    lending: &AssetMetadata,
    price: Decimal,
) -> LendingResult<Decimal> {
    if price <= Decimal::ZERO {
        return Err(LendingError::validation(format!("invalid price {}", price)));
    }
    let collateral_units = Decimal::from(collateral_amount) / scale(collateral.decimals)?;
    let collateral_value = if collateral.is_base_price_asset {
        collateral_units * price
    } else {
        collateral_units / price
    };
    if collateral_value.is_zero() {
        return Err(LendingError::insufficient("collateral", borrow_amount, 0));
    }
    let debt = Decimal::from(borrow_amount) / scale(lending.decimals)?;
    Ok(debt / collateral_value * Decimal::from(PERMILLE))
}

/// `amount * factor / 1000`, truncated.
pub fn fee(amount: u64, factor: u64) -> u64 {
    ((amount as u128 * factor as u128) / PERMILLE as u128) as u64
}
