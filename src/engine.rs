//! # Settlement Engine
//!
//! Owns the store and the collaborators, and runs every message, callback
//! and block tick as one atomic batch: writes land in the store only when
//! the operation returns `Ok`.
//!
//! ## Tick Stages
//!
//! 1. Accrue one block of interest on every pool
//! 2. Pending loans: reject expired requests, disburse authorized ones
//! 3. Open loans: default matured loans, liquidate under-collateralized ones
//! 4. Liquidations: settle liquidation CETs
//! 5. Repaid loans: settle repayment CETs, release escrow
//! 6. Top up the lending-event queue
//!
//! Each loan is processed in its own batch. A failing loan is logged and
//! skipped; an invariant violation aborts the tick.

use crate::collaborators::{
    BridgeLedger, CallbackEvent, CallbackRouter, Context, PriceOracle, ThresholdSigning,
};
use crate::config::{modules, Params};
use crate::error::LendingResult;
use crate::lending::{
    self, bank, loan, pool, queries, tick, ApplyRequest, Authorization, CetInfo, DepositLog, DepositRequest,
    LendingCallbacks, LendingPool, Loan, PoolConfig, RedeemRequest, Redemption, Referrer, Repayment,
    SubmitCetsRequest,
};
use crate::oracle::{keeper as oracle_keeper, DlcCallbacks, DlcEvent};
use crate::store::{Batch, Store};
use log::{debug, error, warn};

/// Outcome of one block tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// `stage/id: error` of every item that failed and was skipped
    pub failures: Vec<String>,
    /// Nonce DKG requested to refill the lending-event queue
    pub nonce_dkg: Option<u64>,
}

pub struct Engine<S, P, B, T> {
    pub store: S,
    pub params: Params,
    pub prices: P,
    pub bridge: B,
    pub signer: T,
    router: CallbackRouter,
}

impl<S, P, B, T> Engine<S, P, B, T>
where
    S: Store,
    P: PriceOracle,
    B: BridgeLedger,
    T: ThresholdSigning,
{
    pub fn new(store: S, params: Params, prices: P, bridge: B, signer: T) -> LendingResult<Self> {
        params.validate()?;
        let mut router = CallbackRouter::new();
        router.register(modules::LENDING, Box::new(LendingCallbacks))?;
        router.register(modules::DLC, Box::new(DlcCallbacks))?;
        Ok(Self {
            store,
            params,
            prices,
            bridge,
            signer,
            router,
        })
    }

    /// Run `op` in a fresh batch, committing its writes only on success.
    pub fn execute<R>(
        &mut self,
        now: i64,
        op: impl FnOnce(&mut Context<'_>) -> LendingResult<R>,
    ) -> LendingResult<R> {
        let mut batch = Batch::new(&self.store);
        let result = op(&mut Context {
            store: &mut batch,
            params: &self.params,
            prices: &self.prices,
            bridge: &self.bridge,
            signer: &mut self.signer,
            now,
        });
        let writes = batch.into_writes();
        if result.is_ok() {
            self.store.write(writes);
        }
        result
    }

    /// Deliver a collaborator callback to the module it is addressed to.
    pub fn deliver(&mut self, module: &str, event: &CallbackEvent, now: i64) -> LendingResult<()> {
        let router = std::mem::take(&mut self.router);
        let result = self.execute(now, |ctx| router.dispatch(module, ctx, event));
        self.router = router;
        result
    }

    /// Deliver callbacks in order, stopping at the first failure.
    pub fn deliver_all(&mut self, events: &[(String, CallbackEvent)], now: i64) -> LendingResult<()> {
        for (module, event) in events {
            self.deliver(module, event, now)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn create_oracle(&mut self, now: i64) -> LendingResult<u64> {
        self.execute(now, oracle_keeper::create_oracle)
    }

    pub fn create_dcm(&mut self, now: i64, participants: Vec<String>, threshold: usize) -> LendingResult<u64> {
        self.execute(now, |ctx| oracle_keeper::create_dcm(ctx, participants, threshold))
    }

    pub fn new_price_event(&mut self, now: i64, pair: &str) -> LendingResult<DlcEvent> {
        self.execute(now, |ctx| oracle_keeper::new_price_event(ctx, pair))
    }

    pub fn new_date_event(&mut self, now: i64) -> LendingResult<DlcEvent> {
        self.execute(now, oracle_keeper::new_date_event)
    }

    pub fn create_pool(&mut self, now: i64, id: &str, config: PoolConfig) -> LendingResult<LendingPool> {
        self.execute(now, |ctx| pool::create_pool(ctx.store, id, config))
    }

    pub fn supply(&mut self, now: i64, pool_id: &str, supplier: &str, amount: u64) -> LendingResult<LendingPool> {
        self.execute(now, |ctx| pool::supply(ctx.store, pool_id, supplier, amount))
    }

    pub fn register_referrer(&mut self, now: i64, referrer: Referrer) -> LendingResult<()> {
        self.execute(now, |ctx| pool::register_referrer(ctx.store, ctx.params, referrer))
    }

    /// Credit funds outside of any loan flow (genesis, faucets, tests).
    pub fn mint(&mut self, account: &str, denom: &str, amount: u64) -> LendingResult<()> {
        self.execute(0, |ctx| bank::mint(ctx.store, account, denom, amount))
    }

    pub fn apply(&mut self, now: i64, msg: &ApplyRequest) -> LendingResult<Loan> {
        self.execute(now, |ctx| loan::apply(ctx, msg))
    }

    pub fn submit_cets(&mut self, now: i64, msg: &SubmitCetsRequest) -> LendingResult<Authorization> {
        self.execute(now, |ctx| loan::submit_cets(ctx, msg))
    }

    pub fn submit_deposit(&mut self, now: i64, msg: &DepositRequest) -> LendingResult<DepositLog> {
        self.execute(now, |ctx| loan::submit_deposit_transaction(ctx, msg))
    }

    pub fn redeem(&mut self, now: i64, msg: &RedeemRequest) -> LendingResult<Redemption> {
        self.execute(now, |ctx| loan::redeem(ctx, msg))
    }

    pub fn repay(&mut self, now: i64, borrower: &str, loan_id: &str) -> LendingResult<Repayment> {
        self.execute(now, |ctx| loan::repay(ctx, borrower, loan_id))
    }

    pub fn cancel(&mut self, now: i64, borrower: &str, loan_id: &str) -> LendingResult<Loan> {
        self.execute(now, |ctx| loan::cancel(ctx, borrower, loan_id))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn loan(&self, id: &str) -> LendingResult<Loan> {
        queries::loan(&self.store, id)
    }

    pub fn pool(&self, id: &str) -> LendingResult<LendingPool> {
        queries::pool(&self.store, id)
    }

    pub fn cet_info(&self, loan_id: &str, collateral_amount: Option<u64>) -> LendingResult<CetInfo> {
        queries::cet_info(&self.store, &self.bridge, loan_id, collateral_amount)
    }

    pub fn balance(&self, account: &str, denom: &str) -> LendingResult<u64> {
        bank::balance(&self.store, account, denom)
    }

    // -----------------------------------------------------------------------
    // Block processing
    // -----------------------------------------------------------------------

    /// Process one block at time `now`.
    pub fn tick(&mut self, now: i64) -> LendingResult<TickReport> {
        let mut report = TickReport::default();

        let accrued = self.execute(now, |ctx| pool::accrue_pools(ctx.store, ctx.params));
        isolate(&mut report, "accrue", "pools", accrued)?;

        for id in tick::pending_loan_ids(&self.store)? {
            let result = self.execute(now, |ctx| tick::handle_pending(ctx, &id));
            isolate(&mut report, "pending", &id, result)?;
        }
        for id in tick::active_loan_ids(&self.store)? {
            let result = self.execute(now, |ctx| tick::handle_active(ctx, &id));
            isolate(&mut report, "active", &id, result)?;
        }
        for id in tick::liquidation_queue(&self.store)? {
            let result = self.execute(now, |ctx| tick::handle_liquidation(ctx, id));
            isolate(&mut report, "liquidation", &id.to_string(), result)?;
        }
        for id in tick::repaid_loan_ids(&self.store)? {
            let result = self.execute(now, |ctx| tick::handle_repaid(ctx, &id));
            isolate(&mut report, "repaid", &id, result)?;
        }

        match self.execute(now, oracle_keeper::ensure_nonce_supply) {
            Ok(dkg) => report.nonce_dkg = dkg,
            Err(e) => isolate(&mut report, "nonces", "queue", Err(e))?,
        }

        debug!("tick {} done with {} failures", now, report.failures.len());
        Ok(report)
    }

    pub fn loans_by_status(&self, status: lending::LoanStatus) -> LendingResult<Vec<Loan>> {
        queries::loans_by_status(&self.store, status)
    }
}

/// Record a failed tick item, propagating only invariant violations.
fn isolate(report: &mut TickReport, stage: &str, id: &str, result: LendingResult<()>) -> LendingResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!("{} {}: {}", stage, id, e);
            Err(e)
        }
        Err(e) => {
            warn!("{} {} skipped: {}", stage, id, e);
            report.failures.push(format!("{}/{}: {}", stage, id, e));
            Ok(())
        }
    }
}
