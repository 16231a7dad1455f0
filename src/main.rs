//! # DLC Lending CLI
//!
//! Command-line front end for the settlement engine: derive vault addresses,
//! quote liquidation prices and run a full loan lifecycle against in-memory
//! collaborators.
//!
//! ## Loan Flow
//!
//! ```text
//! ┌─────────────┐  Apply   ┌─────────────┐  Submit CETs  ┌─────────────┐
//! │  Requested  │ ───────> │ Authorized  │ ────────────> │    Open     │
//! └─────────────┘          └─────────────┘   + deposit   └─────────────┘
//!                                                               │
//!                                   ┌───────────────────────────┼───────────────────┐
//!                                   ▼                           ▼                   ▼
//!                           ┌─────────────┐             ┌─────────────┐     ┌─────────────┐
//!                           │ Liquidated  │             │  Defaulted  │     │   Repaid    │
//!                           │ (price CET) │             │(default CET)│     │(repay CET)  │
//!                           └─────────────┘             └─────────────┘     └─────────────┘
//! ```
//!
//! Parameters are read from `DLC_LENDING_PARAMS` (a JSON file) and
//! `DLC_LENDING_NETWORK`, with `.env` honoured.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use dlc_lending::cet::{tx_to_hex, vault_utxos_from_deposit};
use dlc_lending::lending::{pool, queries, ApplyRequest, DepositRequest, SubmitCetsRequest};
use dlc_lending::oracle::keeper as oracle_keeper;
use dlc_lending::testing::{bootstrap, btc_usdt_pool, test_params, TestBorrower, TestEngine};
use dlc_lending::{LoanStatus, MemStore, Params};
use log::info;
use rust_decimal::Decimal;
use std::fs;
use std::str::FromStr;

const DEMO_START: i64 = 1_700_000_000;
const DEMO_POOL: &str = "btc-usdt";
const DEMO_PAIR: &str = "BTCUSDT";

/// How the demo loan ends
#[derive(Clone, Copy, Debug)]
pub enum Scenario {
    /// Borrower repays and the repayment CET returns the collateral
    Repay,
    /// Price falls through the liquidation price
    Liquidate,
    /// Loan runs past maturity unpaid
    Default,
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "repay" => Ok(Scenario::Repay),
            "liquidate" => Ok(Scenario::Liquidate),
            "default" => Ok(Scenario::Default),
            _ => Err(format!("Invalid scenario: {}", s)),
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scenario::Repay => write!(f, "repay"),
            Scenario::Liquidate => write!(f, "liquidate"),
            Scenario::Default => write!(f, "default"),
        }
    }
}

#[derive(Parser)]
#[command(name = "dlc-lending")]
#[command(about = "Bitcoin-collateralized lending settled through DLC adaptor signatures")]
struct Cli {
    /// Log at info level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the taproot vault of a loan
    VaultAddress {
        /// Borrower spend key (x-only or compressed hex)
        #[arg(long)]
        borrower: String,
        /// Borrower auth key for the liquidation leaf
        #[arg(long)]
        auth: String,
        /// DCM aggregate key (x-only hex)
        #[arg(long)]
        dcm: String,
        /// Absolute refund timeout (unix seconds)
        #[arg(long)]
        final_timeout: u64,
    },
    /// Quote the liquidation price of a loan in the demo BTC/USDT pool
    LiquidationPrice {
        /// Collateral in sats
        #[arg(short, long)]
        collateral: u64,
        /// Borrowed amount in the lending asset's base unit
        #[arg(short, long)]
        borrow: u64,
        /// Tranche maturity in days
        #[arg(short, long, default_value_t = 30)]
        maturity_days: i64,
    },
    /// Run a complete loan lifecycle against in-memory collaborators
    Demo {
        /// repay, liquidate or default
        #[arg(short, long, default_value = "repay")]
        scenario: Scenario,
        /// Collateral in sats
        #[arg(short, long, default_value_t = 200_000)]
        collateral: u64,
        /// Borrowed amount
        #[arg(short, long, default_value_t = 100_000)]
        borrow: u64,
        /// Write the final loan and its settlement transactions as JSON
        #[arg(short, long)]
        output: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    match cli.command {
        Commands::VaultAddress {
            borrower,
            auth,
            dcm,
            final_timeout,
        } => vault_address(&borrower, &auth, &dcm, final_timeout)?,
        Commands::LiquidationPrice {
            collateral,
            borrow,
            maturity_days,
        } => liquidation_price(collateral, borrow, maturity_days)?,
        Commands::Demo {
            scenario,
            collateral,
            borrow,
            output,
        } => demo(scenario, collateral, borrow, output.as_deref())?,
    }

    Ok(())
}

fn vault_address(borrower: &str, auth: &str, dcm: &str, final_timeout: u64) -> Result<()> {
    let params = Params::from_env()?;
    let vault = queries::vault_address(&params, borrower, auth, dcm, final_timeout)?;

    println!("Vault address:  {}", vault.address);
    println!("Internal key:   {}", vault.internal_key);
    println!("Liquidation:    {}", vault.liquidation.script);
    println!("Repayment:      {}", vault.repayment.script);
    println!("Timeout refund: {}", vault.timeout_refund.script);
    Ok(())
}

fn liquidation_price(collateral: u64, borrow: u64, maturity_days: i64) -> Result<()> {
    let params = Params::from_env()?;
    let mut store = MemStore::new();
    pool::create_pool(&mut store, DEMO_POOL, btc_usdt_pool())?;

    let maturity = maturity_days * 86_400;
    let price = queries::liquidation_price(&store, &params, DEMO_POOL, collateral, borrow, maturity)?;
    println!("Liquidation price: {} USDT per BTC", price.round_dp(2));
    Ok(())
}

fn demo(scenario: Scenario, collateral: u64, borrow: u64, output: Option<&str>) -> Result<()> {
    let now = DEMO_START;
    let (mut engine, dcm_id) = bootstrap(test_params(), now)?;
    info!("bootstrapped oracle and dcm {}", dcm_id);

    engine.prices.set_price(DEMO_PAIR, Decimal::ONE);
    engine.create_pool(now, DEMO_POOL, btc_usdt_pool())?;
    engine.mint("lp", "usat", borrow * 10)?;
    engine.supply(now, DEMO_POOL, "lp", borrow * 10)?;

    let borrower = TestBorrower::new("alice", 7)?;
    let maturity = 30 * 86_400;
    let loan = engine.apply(
        now,
        &ApplyRequest {
            borrower: borrower.address.clone(),
            borrower_pub_key: borrower.pub_key(),
            borrower_auth_pub_key: borrower.auth_pub_key(),
            pool_id: DEMO_POOL.to_string(),
            borrow_amount: borrow,
            maturity,
            dcm_id,
            referral_code: None,
        },
    )?;
    let loan_id = loan.vault_address.clone();
    println!("🏦 Loan requested, vault {}", loan_id);

    let info = engine.cet_info(&loan_id, Some(collateral))?;
    let deposit = borrower.deposit_tx(&info.vault, collateral, 1)?;
    let utxos = vault_utxos_from_deposit(&deposit, &info.vault.script_pubkey()?);
    let cets = borrower.sign_cets(&info, &utxos)?;

    engine.submit_cets(
        now,
        &SubmitCetsRequest {
            borrower: borrower.address.clone(),
            loan_id: loan_id.clone(),
            deposit_txs: vec![tx_to_hex(&deposit)],
            cets,
        },
    )?;
    engine.submit_deposit(
        now,
        &DepositRequest {
            vault_address: loan_id.clone(),
            deposit_tx: tx_to_hex(&deposit),
            block_hash: "00".repeat(32),
            proof: vec![],
        },
    )?;
    step(&mut engine, now + 1)?;

    let loan = engine.loan(&loan_id)?;
    if loan.status != LoanStatus::Open {
        return Err(anyhow!("loan {} did not open: {}", loan_id, loan.status));
    }
    println!(
        "✅ Loan open: {} sats collateral, liquidation price {}",
        loan.collateral_amount,
        loan.liquidation_price.round_dp(4)
    );

    let settle_at = match scenario {
        Scenario::Repay => {
            engine.mint(&borrower.address, "usat", loan.interest + loan.origination_fee)?;
            let repayment = engine.repay(now + 2, &borrower.address, &loan_id)?;
            println!("💸 Repaid {} into escrow", repayment.amount);
            now + 2
        }
        Scenario::Liquidate => {
            let crash = loan.liquidation_price / Decimal::TWO;
            engine.prices.set_price(DEMO_PAIR, crash);
            println!("📉 Price drops to {}", crash.round_dp(4));
            now + 2
        }
        Scenario::Default => {
            let after_maturity = loan.maturity_time + 1;
            engine.bridge.set_fee_rate(2, after_maturity);
            println!("⏰ Maturity passes unpaid");
            after_maturity
        }
    };

    // Trigger, collect attestation and DCM signatures, settle
    step(&mut engine, settle_at)?;
    engine.run_signer(settle_at)?;
    step(&mut engine, settle_at + 1)?;

    let loan = engine.loan(&loan_id)?;
    let event = oracle_keeper::get_event(&engine.store, loan.dlc_event_id)?;
    let meta = queries::dlc_meta(&engine.store, &loan_id)?;
    println!("🔚 Loan {} ended as {}", loan_id, loan.status);
    println!("   Oracle event {} status {:?}", event.id, event.status);

    if let Some(path) = output {
        let export = serde_json::json!({
            "scenario": scenario.to_string(),
            "exported_at": chrono::Utc::now().to_rfc3339(),
            "loan": loan,
            "dlc_meta": meta,
            "attestation": oracle_keeper::get_attestation(&engine.store, event.id)?,
        });
        fs::write(path, serde_json::to_string_pretty(&export)?)?;
        println!("📁 Settlement saved to {}", path);
    }
    Ok(())
}

fn step(engine: &mut TestEngine, now: i64) -> Result<()> {
    let report = engine.tick(now)?;
    for failure in &report.failures {
        println!("⚠️  {}", failure);
    }
    Ok(())
}
